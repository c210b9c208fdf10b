use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crossbridge_core::CallbackEvent;

use crate::error::HostError;
use crate::host::BridgeHost;
use crate::protocol::{self, Outbound, Reply};

/// Serve the management surface as JSON lines until `input` reaches EOF.
///
/// Requests are handled strictly in arrival order. Callback events raised
/// while a request runs are written before that request's response. A line
/// that is not valid UTF-8 gets a malformed-request reply like any other bad
/// line. Every bridge is disposed when serving stops, whether at EOF or on a
/// transport error.
pub async fn serve<R, W>(
    host: &BridgeHost,
    mut events: mpsc::UnboundedReceiver<CallbackEvent>,
    input: R,
    output: &mut W,
) -> Result<(), HostError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(input);
    let mut buf = Vec::new();
    let mut handled = 0u64;

    let outcome = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(HostError::from(e)),
        }

        let answered = match std::str::from_utf8(trim_line_end(&buf)) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => answer(host, line).await,
            Err(e) => {
                let e = HostError::MalformedRequest(format!("request line is not UTF-8: {e}"));
                tracing::warn!(error = %e, "Rejected request line");
                (Value::Null, Reply::malformed(&e))
            }
        };

        if let Err(e) = respond(host, &mut events, output, answered).await {
            break Err(e);
        }
        handled += 1;
    };

    match &outcome {
        Ok(()) => tracing::info!(handled, "Input closed"),
        Err(e) => tracing::error!(handled, error = %e, "Transport failed"),
    }
    host.shutdown().await;
    outcome
}

async fn answer(host: &BridgeHost, line: &str) -> (Value, Reply) {
    let (id, request) = protocol::parse_line(line);
    let reply = match request {
        Ok(request) => host.handle(request).await,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected request line");
            Reply::malformed(&e)
        }
    };
    (id, reply)
}

async fn respond<W>(
    host: &BridgeHost,
    events: &mut mpsc::UnboundedReceiver<CallbackEvent>,
    output: &mut W,
    (id, reply): (Value, Reply),
) -> Result<(), HostError>
where
    W: AsyncWrite + Unpin,
{
    while let Ok(event) = events.try_recv() {
        if let Some(event) = host.route_event(event) {
            write_line(output, &Outbound::from(event)).await?;
        }
    }
    write_line(output, &Outbound::Response { id, reply }).await
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

async fn write_line<W>(output: &mut W, message: &Outbound) -> Result<(), HostError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(message)
        .map_err(|e| HostError::Transport(std::io::Error::other(e)))?;
    line.push(b'\n');
    output.write_all(&line).await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crossbridge_core::{Bridge, BridgePhase};
    use serde_json::json;

    async fn run(input: &str) -> Vec<Value> {
        run_bytes(input.as_bytes()).await.0
    }

    async fn run_bytes(input: &[u8]) -> (Vec<Value>, BridgeHost) {
        let (host, events) = BridgeHost::new(&HostConfig::default());
        let mut output = Vec::new();
        serve(&host, events, input, &mut output).await.unwrap();
        let lines = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        (lines, host)
    }

    #[tokio::test]
    async fn answers_each_line_in_order() {
        let lines = run(concat!(
            "{\"id\":1,\"op\":\"bridges.list\"}\n",
            "\n",
            "{\"id\":2,\"op\":\"sandbox.execute\",\"code\":\"1\"}\n",
        ))
        .await;

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], json!("response"));
        assert_eq!(lines[0]["id"], json!(1));
        assert_eq!(lines[0]["ok"], json!(true));
        assert_eq!(lines[1]["id"], json!(2));
        assert_eq!(lines[1]["kind"], json!("NotInitialized"));
    }

    #[tokio::test]
    async fn malformed_lines_get_a_reply() {
        let lines = run("{oops\n{\"id\":9,\"op\":\"nope\"}\n").await;
        assert_eq!(lines[0]["id"], Value::Null);
        assert_eq!(lines[0]["kind"], json!("MalformedInvocation"));
        assert_eq!(lines[1]["id"], json!(9));
        assert_eq!(lines[1]["ok"], json!(false));
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_rejected_and_serving_continues() {
        let mut input = b"{\"id\":1,\"op\":\"bridges.list\"}\n".to_vec();
        input.extend_from_slice(b"{\"id\":2,\"op\":\"\xFF\"}\n");
        input.extend_from_slice(b"{\"id\":3,\"op\":\"process.getStats\"}\r\n");

        let (lines, host) = run_bytes(&input).await;

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["id"], json!(1));
        assert_eq!(lines[1]["id"], Value::Null);
        assert_eq!(lines[1]["ok"], json!(false));
        assert_eq!(lines[1]["kind"], json!("MalformedInvocation"));
        assert_eq!(lines[2]["id"], json!(3));
        assert_eq!(lines[2]["ok"], json!(true));
        assert_eq!(host.process().phase(), BridgePhase::Disposed);
        assert_eq!(host.sandbox().phase(), BridgePhase::Disposed);
    }
}

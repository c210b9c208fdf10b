//! Management-surface messages and their JSON-lines framing.
//!
//! Inbound, one object per line:
//!
//! ```text
//! {"id": 1, "op": "process.execute", "target": "HelloWorld", "member": "sayHello", "args": ["World"]}
//! ```
//!
//! Outbound, one object per line, either a response to a request id or a
//! callback event:
//!
//! ```text
//! {"type": "response", "id": 1, "ok": true, "result": "Hello from Java: World [v1.0.0]"}
//! {"type": "callback", "token": "cb-1", "message": "Callback result: Alice"}
//! ```

use std::path::PathBuf;

use crossbridge_core::{BridgeError, CallbackEvent, CallbackToken, ErrorKind, Invocation, invocation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HostError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op")]
pub enum Request {
    #[serde(rename = "process.initialize")]
    ProcessInitialize { path: PathBuf },
    #[serde(rename = "process.execute")]
    ProcessExecute {
        target: String,
        member: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// The output is delivered as a callback event tagged with `token`.
    #[serde(rename = "process.executeWithCallback")]
    ProcessExecuteWithCallback {
        target: String,
        member: String,
        #[serde(default)]
        args: Vec<Value>,
        token: CallbackToken,
    },
    #[serde(rename = "process.getStats")]
    ProcessGetStats,
    #[serde(rename = "process.dispose")]
    ProcessDispose,

    #[serde(rename = "sandbox.initialize")]
    SandboxInitialize { path: PathBuf },
    #[serde(rename = "sandbox.execute")]
    SandboxExecute { code: String },
    #[serde(rename = "sandbox.injectCapabilities")]
    SandboxInjectCapabilities,
    #[serde(rename = "sandbox.executeWithCapabilities")]
    SandboxExecuteWithCapabilities { code: String },
    #[serde(rename = "sandbox.getStats")]
    SandboxGetStats,
    #[serde(rename = "sandbox.dispose")]
    SandboxDispose,

    #[serde(rename = "bridges.list")]
    BridgesList,
}

impl Request {
    /// Operation name as it appears on the wire.
    pub fn op(&self) -> &'static str {
        match self {
            Request::ProcessInitialize { .. } => "process.initialize",
            Request::ProcessExecute { .. } => "process.execute",
            Request::ProcessExecuteWithCallback { .. } => "process.executeWithCallback",
            Request::ProcessGetStats => "process.getStats",
            Request::ProcessDispose => "process.dispose",
            Request::SandboxInitialize { .. } => "sandbox.initialize",
            Request::SandboxExecute { .. } => "sandbox.execute",
            Request::SandboxInjectCapabilities => "sandbox.injectCapabilities",
            Request::SandboxExecuteWithCapabilities { .. } => "sandbox.executeWithCapabilities",
            Request::SandboxGetStats => "sandbox.getStats",
            Request::SandboxDispose => "sandbox.dispose",
            Request::BridgesList => "bridges.list",
        }
    }
}

/// Build an [`Invocation`] from wire fields, converting JSON arguments.
pub fn invocation_from_wire(
    target: String,
    member: String,
    args: &[Value],
) -> Result<Invocation, BridgeError> {
    let arguments = args
        .iter()
        .map(invocation::argument_from_json)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Invocation {
        target,
        member,
        arguments,
    })
}

/// Outcome of one operation. Never an `Err`: failures are data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl Reply {
    pub fn done() -> Self {
        Self {
            ok: true,
            result: None,
            error: None,
            kind: None,
            diagnostic: None,
        }
    }

    pub fn value(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::done()
        }
    }

    pub fn failure(error: &BridgeError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.to_string()),
            kind: Some(error.kind()),
            diagnostic: error.diagnostic().map(str::to_string),
        }
    }

    /// Rejection of a line that is not a valid request.
    pub fn malformed(error: &HostError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.to_string()),
            kind: Some(ErrorKind::MalformedInvocation),
            diagnostic: None,
        }
    }

    pub fn from_result(result: Result<Value, BridgeError>) -> Self {
        match result {
            Ok(value) => Self::value(value),
            Err(e) => Self::failure(&e),
        }
    }

    pub fn from_unit(result: Result<(), BridgeError>) -> Self {
        match result {
            Ok(()) => Self::done(),
            Err(e) => Self::failure(&e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Response {
        id: Value,
        #[serde(flatten)]
        reply: Reply,
    },
    Callback {
        token: CallbackToken,
        message: String,
    },
}

impl From<CallbackEvent> for Outbound {
    fn from(event: CallbackEvent) -> Self {
        Outbound::Callback {
            token: event.token,
            message: event.message,
        }
    }
}

/// Split a request line into its correlation id and the parsed request.
///
/// The id is recovered even when the operation itself is invalid, so the
/// rejection can still be correlated. A missing id is `null`.
pub fn parse_line(line: &str) -> (Value, Result<Request, HostError>) {
    let mut value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return (Value::Null, Err(HostError::MalformedRequest(e.to_string()))),
    };
    let id = value
        .as_object_mut()
        .and_then(|object| object.remove("id"))
        .unwrap_or(Value::Null);
    let request =
        serde_json::from_value(value).map_err(|e| HostError::MalformedRequest(e.to_string()));
    (id, request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_process_execute() {
        let (id, request) = parse_line(
            r#"{"id":7,"op":"process.execute","target":"HelloWorld","member":"sayHello","args":["World",3,true]}"#,
        );
        assert_eq!(id, json!(7));
        let request = request.unwrap();
        assert_eq!(request.op(), "process.execute");

        let Request::ProcessExecute {
            target,
            member,
            args,
        } = request
        else {
            panic!("wrong variant");
        };
        let invocation = invocation_from_wire(target, member, &args).unwrap();
        assert_eq!(invocation.arguments, vec!["World", "3", "true"]);
    }

    #[test]
    fn unit_variants_need_only_op() {
        let (id, request) = parse_line(r#"{"op":"bridges.list"}"#);
        assert_eq!(id, Value::Null);
        assert_eq!(request.unwrap(), Request::BridgesList);
    }

    #[test]
    fn unknown_op_keeps_id() {
        let (id, request) = parse_line(r#"{"id":"abc","op":"process.explode"}"#);
        assert_eq!(id, json!("abc"));
        assert!(matches!(request, Err(HostError::MalformedRequest(_))));
    }

    #[test]
    fn garbage_is_malformed() {
        let (id, request) = parse_line("not json");
        assert_eq!(id, Value::Null);
        assert!(request.is_err());
    }

    #[test]
    fn nested_arguments_are_rejected() {
        let err = invocation_from_wire("A".into(), "b".into(), &[json!({"x": 1})]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedInvocation);
    }

    #[test]
    fn response_lines_flatten_the_reply() {
        let line = serde_json::to_value(Outbound::Response {
            id: json!(1),
            reply: Reply::value(json!(5)),
        })
        .unwrap();
        assert_eq!(line, json!({"type": "response", "id": 1, "ok": true, "result": 5}));

        let err = BridgeError::InvocationFailed {
            exit_code: Some(1),
            stderr: "Method not found: nope".into(),
        };
        let line = serde_json::to_value(Outbound::Response {
            id: json!(2),
            reply: Reply::failure(&err),
        })
        .unwrap();
        assert_eq!(line["ok"], json!(false));
        assert_eq!(line["kind"], json!("InvocationFailed"));
        assert_eq!(line["diagnostic"], json!("Method not found: nope"));
    }

    #[test]
    fn callback_lines_carry_token_and_message() {
        let event = CallbackEvent {
            token: CallbackToken::from("cb-1"),
            message: "hi".into(),
        };
        let line = serde_json::to_value(Outbound::from(event)).unwrap();
        assert_eq!(line, json!({"type": "callback", "token": "cb-1", "message": "hi"}));
    }
}

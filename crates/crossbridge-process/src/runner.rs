//! Spawning the external runner: search-path composition, command layout,
//! output capture and the liveness probe.

use std::ffi::OsString;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use crossbridge_core::{BridgeError, Invocation};
use tokio::process::Command;

use crate::config::ProcessConfig;

/// Join the artifact and its sibling runner directory into one search path
/// using the platform separator (`:` on unix, `;` on windows).
pub fn compose_search_path(artifact: &Path, runner_dir: &str) -> Result<OsString, BridgeError> {
    let runner = artifact
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(runner_dir);

    std::env::join_paths([artifact.as_os_str(), runner.as_os_str()]).map_err(|e| {
        BridgeError::RuntimeUnavailable(format!(
            "cannot place {} on the runner search path: {e}",
            artifact.display()
        ))
    })
}

/// Build the per-call command. Target, member and each argument are separate
/// process arguments; nothing goes through a shell.
pub fn invocation_command(
    config: &ProcessConfig,
    search_path: &OsString,
    invocation: &Invocation,
) -> Command {
    let mut command = Command::new(&config.interpreter);
    command
        .args(&config.interpreter_args)
        .arg(&config.search_path_flag)
        .arg(search_path)
        .arg(&config.runner_entry)
        .arg(&invocation.target)
        .arg(&invocation.member)
        .args(&invocation.arguments);
    command
}

/// Run a command to completion, capturing stdout and stderr in full.
///
/// On timeout the child is killed (it is dropped with `kill_on_drop`).
pub async fn capture(mut command: Command, limit: Option<Duration>) -> Result<Output, BridgeError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| BridgeError::InvocationFailed {
        exit_code: None,
        stderr: format!("failed to spawn runner: {e}"),
    })?;

    let waited = match limit {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| BridgeError::Timeout {
                after_ms: millis(limit),
            })?,
        None => child.wait_with_output().await,
    };

    waited.map_err(|e| BridgeError::InvocationFailed {
        exit_code: None,
        stderr: format!("failed to collect runner output: {e}"),
    })
}

/// Map a finished process to the call outcome: exit 0 yields trimmed stdout,
/// anything else the exit code plus captured stderr.
pub fn interpret(output: Output) -> Result<String, BridgeError> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(BridgeError::InvocationFailed {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Check that the interpreter starts and exits cleanly with the probe flags.
pub async fn probe(config: &ProcessConfig, limit: Option<Duration>) -> Result<(), BridgeError> {
    let mut command = Command::new(&config.interpreter);
    command
        .args(&config.interpreter_args)
        .args(&config.probe_args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let status = match limit {
        Some(limit) => tokio::time::timeout(limit, command.status())
            .await
            .map_err(|_| {
                BridgeError::RuntimeUnavailable(format!(
                    "{} did not answer the probe within {}ms",
                    config.interpreter,
                    millis(limit)
                ))
            })?,
        None => command.status().await,
    };

    let status = status.map_err(|e| {
        BridgeError::RuntimeUnavailable(format!(
            "{} is not installed or cannot start: {e}",
            config.interpreter
        ))
    })?;

    if status.success() {
        Ok(())
    } else {
        Err(BridgeError::RuntimeUnavailable(format!(
            "{} probe failed with {status}",
            config.interpreter
        )))
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn runner_dir_is_a_sibling_of_the_artifact() {
        let artifact = PathBuf::from("/opt/libs/hello-java.jar");
        let search_path = compose_search_path(&artifact, "java-src").unwrap();
        let parts: Vec<PathBuf> = std::env::split_paths(&search_path).collect();
        assert_eq!(
            parts,
            vec![
                PathBuf::from("/opt/libs/hello-java.jar"),
                PathBuf::from("/opt/libs/java-src"),
            ]
        );
    }

    #[test]
    fn command_keeps_arguments_discrete() {
        let config = ProcessConfig::default();
        let search_path = OsString::from("a.jar:java-src");
        let invocation = Invocation::new("com.example.HelloWorld", "sayHello").arg("World Wide");

        let command = invocation_command(&config, &search_path, &invocation);
        let std_command = command.as_std();
        let args: Vec<_> = std_command.get_args().collect();

        assert_eq!(std_command.get_program(), "java");
        assert_eq!(
            args,
            vec![
                "-cp",
                "a.jar:java-src",
                "JavaRunner",
                "com.example.HelloWorld",
                "sayHello",
                "World Wide",
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_keeps_stderr() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo boom >&2; exit 3"]);
        let output = capture(command, Some(Duration::from_secs(10))).await.unwrap();

        match interpret(output) {
            Err(BridgeError::InvocationFailed { exit_code, stderr }) => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected InvocationFailed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_runner_times_out() {
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 5"]);
        let err = capture(command, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { after_ms: 100 }));
    }

    #[tokio::test]
    async fn missing_interpreter_is_unavailable() {
        let config = ProcessConfig {
            interpreter: "crossbridge-no-such-interpreter".into(),
            ..ProcessConfig::default()
        };
        let err = probe(&config, None).await.unwrap_err();
        assert!(matches!(err, BridgeError::RuntimeUnavailable(_)));
    }
}

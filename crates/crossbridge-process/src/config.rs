use std::time::Duration;

use serde::Deserialize;

/// How the process bridge launches its external interpreter.
///
/// Every call is laid out as
/// `<interpreter> <interpreter_args…> <search_path_flag> <search_path> <runner_entry> <target> <member> <args…>`
/// and the liveness probe as `<interpreter> <interpreter_args…> <probe_args…>`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessConfig {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Arguments placed before everything else (e.g. a launcher script).
    #[serde(default)]
    pub interpreter_args: Vec<String>,
    #[serde(default = "default_probe_args")]
    pub probe_args: Vec<String>,
    #[serde(default = "default_search_path_flag")]
    pub search_path_flag: String,
    #[serde(default = "default_runner_entry")]
    pub runner_entry: String,
    /// Runner directory, resolved as a sibling of the artifact.
    #[serde(default = "default_runner_dir")]
    pub runner_dir: String,
    /// Per-call bound; `0` (or `None`) disables it.
    #[serde(default = "default_timeout_ms")]
    pub execute_timeout_ms: Option<u64>,
}

fn default_interpreter() -> String {
    "java".into()
}
fn default_probe_args() -> Vec<String> {
    vec!["-version".into()]
}
fn default_search_path_flag() -> String {
    "-cp".into()
}
fn default_runner_entry() -> String {
    "JavaRunner".into()
}
fn default_runner_dir() -> String {
    "java-src".into()
}
fn default_timeout_ms() -> Option<u64> {
    Some(30_000)
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            interpreter_args: Vec::new(),
            probe_args: default_probe_args(),
            search_path_flag: default_search_path_flag(),
            runner_entry: default_runner_entry(),
            runner_dir: default_runner_dir(),
            execute_timeout_ms: default_timeout_ms(),
        }
    }
}

impl ProcessConfig {
    pub fn execute_timeout(&self) -> Option<Duration> {
        self.execute_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_the_jvm_runner() {
        let config = ProcessConfig::default();
        assert_eq!(config.interpreter, "java");
        assert_eq!(config.probe_args, vec!["-version"]);
        assert_eq!(config.search_path_flag, "-cp");
        assert_eq!(config.runner_entry, "JavaRunner");
        assert_eq!(config.runner_dir, "java-src");
        assert_eq!(config.execute_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: ProcessConfig = toml::from_str(
            r#"
interpreter = "/usr/lib/jvm/bin/java"
execute_timeout_ms = 500
"#,
        )
        .unwrap();
        assert_eq!(config.interpreter, "/usr/lib/jvm/bin/java");
        assert_eq!(config.execute_timeout_ms, Some(500));
        assert_eq!(config.runner_entry, "JavaRunner");
    }

    #[test]
    fn zero_timeout_disables_the_bound() {
        let config: ProcessConfig = toml::from_str("execute_timeout_ms = 0").unwrap();
        assert_eq!(config.execute_timeout(), None);
    }
}

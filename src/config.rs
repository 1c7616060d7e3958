//! Runner configuration and resource limits.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default wall-clock deadline for one execution.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Default name of the working file inside each per-call directory.
pub const DEFAULT_SCRIPT_NAME: &str = "generated_test_script.py";

/// Default interpreter used to run the working file.
pub const DEFAULT_INTERPRETER: &str = "python3";

/// Resource bounds applied to one execution.
///
/// `timeout` is always enforced. The rlimit fields are optional and left
/// unset by default, so the child sees the same limits as the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Address-space limit in KB.
    pub mem_kb: Option<u64>,
    /// Maximum size of a file the child may write, in KB.
    pub fsize_kb: Option<u64>,
    /// Maximum number of open files.
    pub nofile: Option<u64>,
    /// Maximum number of processes for the child's user.
    pub nproc: Option<u64>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            mem_kb: None,
            fsize_kb: None,
            nofile: None,
            nproc: None,
        }
    }
}

impl Limits {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }

    /// Human readable form of the timeout, used in the timeout diagnostic.
    pub fn describe_timeout(&self) -> String {
        let t = self.timeout;
        if t.subsec_nanos() == 0 {
            match t.as_secs() {
                1 => "1 second".to_string(),
                n => format!("{} seconds", n),
            }
        } else {
            format!("{} ms", t.as_millis())
        }
    }
}

/// Configuration for a [`Runner`](crate::runner::Runner).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Program that executes the working file.
    pub interpreter: String,

    /// Arguments placed before the working file path.
    pub interpreter_args: Vec<String>,

    /// Directory under which per-call working directories are created.
    /// `None` means the system temp dir.
    pub work_root: Option<PathBuf>,

    /// File name of the staged script inside the per-call directory.
    pub script_name: String,

    pub limits: Limits,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            interpreter: DEFAULT_INTERPRETER.to_string(),
            interpreter_args: Vec::new(),
            work_root: None,
            script_name: DEFAULT_SCRIPT_NAME.to_string(),
            limits: Limits::default(),
        }
    }
}

impl RunnerConfig {
    /// Absolute directory under which per-call working directories go.
    pub fn work_root(&self) -> PathBuf {
        match &self.work_root {
            Some(root) if root.is_relative() => std::env::current_dir()
                .map(|cwd| cwd.join(root))
                .unwrap_or_else(|_| root.clone()),
            Some(root) => root.clone(),
            None => std::env::temp_dir(),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_source_service() {
        let config = RunnerConfig::default();
        assert_eq!(config.interpreter, "python3");
        assert_eq!(config.script_name, "generated_test_script.py");
        assert_eq!(config.limits.timeout, Duration::from_secs(60));
        assert!(config.limits.mem_kb.is_none());
    }

    #[test]
    fn test_describe_timeout() {
        assert_eq!(Limits::default().describe_timeout(), "60 seconds");
        assert_eq!(
            Limits::with_timeout(Duration::from_secs(1)).describe_timeout(),
            "1 second"
        );
        assert_eq!(
            Limits::with_timeout(Duration::from_millis(1500)).describe_timeout(),
            "1500 ms"
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RunnerConfig =
            serde_json::from_str(r#"{"interpreter": "sh", "limits": {"timeout": 250, "nofile": 64}}"#)
                .unwrap();
        assert_eq!(config.interpreter, "sh");
        assert_eq!(config.script_name, DEFAULT_SCRIPT_NAME);
        assert_eq!(config.limits.timeout, Duration::from_millis(250));
        assert_eq!(config.limits.nofile, Some(64));
    }
}

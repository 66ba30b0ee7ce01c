//! Runtime configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::watcher::DEFAULT_DEBOUNCE;

/// Deployment stage; selects log format and default behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Stage {
    #[default]
    Dev,
    Test,
    Prod,
}

impl Stage {
    /// `TEST` and `PROD` name their stages; anything else is local development.
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some("TEST") => Stage::Test,
            Some("PROD") => Stage::Prod,
            _ => Stage::Dev,
        }
    }

    pub fn is_dev(&self) -> bool {
        matches!(self, Stage::Dev)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Dev => "DEV",
            Stage::Test => "TEST",
            Stage::Prod => "PROD",
        })
    }
}

/// What happens when the worker exits unexpectedly while serving.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashPolicy {
    /// Shut the runtime down.
    #[default]
    Exit,
    /// Go DOWN and keep answering 503 until the next restart.
    KeepAlive,
}

impl FromStr for CrashPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "exit" => Ok(CrashPolicy::Exit),
            "keep_alive" => Ok(CrashPolicy::KeepAlive),
            other => Err(format!(
                "unknown crash policy '{other}'; expected: exit, keep-alive"
            )),
        }
    }
}

impl fmt::Display for CrashPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CrashPolicy::Exit => "exit",
            CrashPolicy::KeepAlive => "keep-alive",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker executable.
    pub command: String,
    pub args: Vec<String>,
    /// Overlaid on the host environment for every worker start.
    pub env: BTreeMap<String, String>,
    pub crash_policy: CrashPolicy,
    pub watch_dirs: Vec<PathBuf>,
    #[serde(with = "millis")]
    pub debounce: Duration,
    pub socket_dir: PathBuf,
    #[serde(with = "millis")]
    pub dial_timeout: Duration,
    #[serde(with = "millis")]
    pub manifest_timeout: Duration,
    #[serde(with = "millis")]
    pub stop_timeout: Duration,
    #[serde(with = "millis")]
    pub drain_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            crash_policy: CrashPolicy::Exit,
            watch_dirs: Vec::new(),
            debounce: DEFAULT_DEBOUNCE,
            socket_dir: std::env::temp_dir(),
            dial_timeout: Duration::from_secs(10),
            manifest_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl RuntimeConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::default()
        }
    }
}

/// Durations as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

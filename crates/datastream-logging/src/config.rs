//! Logging presets for the stream server, the demo client and the tests

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Engine crates that log per entry and per session at debug level
const ENGINE_TARGETS: [&str; 3] = ["datastream_storage", "datastream_server", "datastream_client"];

/// Where log events go and how verbose they are
///
/// Every field has a default, so a TOML table only needs the keys it
/// changes. `RUST_LOG`, when set, replaces `default_level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `info,datastream_server=trace`
    pub default_level: String,

    pub console: ConsoleConfig,

    /// JSONL log files; `None` logs to the console only
    pub file: Option<FileConfig>,

    /// Shape of JSONL records, on the console and in files
    pub jsonl: JsonlConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            console: ConsoleConfig::default(),
            file: None,
            jsonl: JsonlConfig::default(),
        }
    }
}

impl LogConfig {
    /// Commits and lifecycle at info, every append, session step and
    /// received entry of the engine crates at debug
    pub fn development() -> Self {
        let mut directives = vec!["info".to_string()];
        directives.extend(ENGINE_TARGETS.iter().map(|target| format!("{target}=debug")));
        Self {
            default_level: directives.join(","),
            jsonl: JsonlConfig {
                include_location: true,
                ..JsonlConfig::default()
            },
            ..Default::default()
        }
    }

    /// Stream server left running: console for the operator, plus JSONL
    /// files under `log_dir` rotated daily and kept for two weeks
    pub fn server(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(FileConfig {
                directory: log_dir.into(),
                max_files: Some(14),
                ..FileConfig::default()
            }),
            ..Default::default()
        }
    }

    /// Test suites: warnings and errors only, uncolored so the output reads
    /// cleanly in captured test logs
    pub fn testing() -> Self {
        Self {
            default_level: "warn".to_string(),
            console: ConsoleConfig {
                enabled: true,
                pretty: false,
                ansi: false,
            },
            ..Default::default()
        }
    }
}

/// Console layer on stdout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    /// Human-readable lines; `false` prints JSONL records
    pub pretty: bool,
    pub ansi: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pretty: true,
            ansi: true,
        }
    }
}

/// Rolling JSONL files, named `<prefix>.<date>.log`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Created on startup if missing
    pub directory: PathBuf,
    pub prefix: String,
    pub rotation: RotationStrategy,
    /// Oldest files beyond this count are deleted; `None` keeps all
    pub max_files: Option<usize>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            prefix: "datastream".to_string(),
            rotation: RotationStrategy::Daily,
            max_files: Some(7),
        }
    }
}

/// When a new log file is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// One `<prefix>.log` file for the life of the process
    Never,
}

/// Fields carried by each JSONL record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlConfig {
    /// Put fields such as `entry_number` at the top level of the record
    pub flatten_events: bool,
    /// Carry the enclosing spans, e.g. the session a delivery belongs to
    pub include_spans: bool,
    /// Source file and line of the event
    pub include_location: bool,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            flatten_events: true,
            include_spans: true,
            include_location: false,
        }
    }
}

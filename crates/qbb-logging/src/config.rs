//! Logging configuration
//!
//! Loaded from the `[logging]` table of a simulation file. Every table and
//! field is optional:
//!
//! ```toml
//! level = "info"
//!
//! [console]
//! format = "compact"
//!
//! [file]
//! directory = "runs"
//! prefix = "incast"
//!
//! [targets]
//! qbb_device = "debug"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Target that logs every device trace event at TRACE level
pub const DEVICE_TRACE_TARGET: &str = "qbb_simulation::network";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level of every target without an override; `RUST_LOG` wins over both
    pub level: String,
    pub console: ConsoleConfig,
    /// JSONL output to disk, off unless configured
    pub file: Option<FileConfig>,
    pub jsonl: JsonlConfig,
    /// Level overrides keyed by target, e.g. `qbb_device = "trace"`
    pub targets: BTreeMap<String, String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: ConsoleConfig::default(),
            file: None,
            jsonl: JsonlConfig::default(),
            targets: BTreeMap::new(),
        }
    }
}

impl LogConfig {
    /// Debug output from the device model on a colored console
    pub fn development() -> Self {
        Self {
            level: "info".to_string(),
            console: ConsoleConfig {
                format: ConsoleFormat::Pretty,
                color: true,
            },
            ..Default::default()
        }
        .with_target("qbb_device", "debug")
        .with_target("qbb_simulation", "debug")
    }

    /// One JSONL file per run in `log_dir`, nothing on the console
    pub fn production(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            console: ConsoleConfig {
                format: ConsoleFormat::Off,
                color: false,
            },
            file: Some(FileConfig::new(log_dir)),
            ..Default::default()
        }
    }

    /// Every device trace event of a run, as JSONL in `log_dir`
    ///
    /// Runs of a few milliseconds already produce millions of lines; the
    /// console stays at warnings.
    pub fn device_traces(log_dir: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            level: "warn".to_string(),
            console: ConsoleConfig {
                format: ConsoleFormat::Compact,
                color: false,
            },
            file: Some(FileConfig::new(log_dir).with_prefix(prefix)),
            ..Default::default()
        }
        .with_target(DEVICE_TRACE_TARGET, "trace")
    }

    /// Warnings only, compact and uncolored so captured test output stays readable
    pub fn testing() -> Self {
        Self {
            level: "warn".to_string(),
            console: ConsoleConfig {
                format: ConsoleFormat::Compact,
                color: false,
            },
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_target(mut self, target: impl Into<String>, level: impl Into<String>) -> Self {
        self.targets.insert(target.into(), level.into());
        self
    }

    /// `EnvFilter` directives: the base level, then one per target override
    pub fn directives(&self) -> Vec<String> {
        let overrides = self
            .targets
            .iter()
            .map(|(target, level)| format!("{target}={level}"));
        std::iter::once(self.level.clone()).chain(overrides).collect()
    }
}

/// How events are rendered on stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleFormat {
    Off,
    /// Multi-line, with the node span of every event
    #[default]
    Pretty,
    Compact,
    /// Same JSON lines as the file output
    Jsonl,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub format: ConsoleFormat,
    /// ANSI colors
    pub color: bool,
}

/// JSONL file output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub directory: PathBuf,
    /// File name stem; scenario runs use the scenario name
    pub prefix: String,
    pub rotation: Rotation,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self::new("logs")
    }
}

impl FileConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            prefix: "qbb".to_string(),
            rotation: Rotation::PerRun,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// File written under [`Rotation::PerRun`]
    pub fn run_file_path(&self) -> PathBuf {
        self.directory.join(format!("{}.jsonl", self.prefix))
    }
}

/// When a new log file is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rotation {
    /// One file per run, truncated when the run starts
    #[default]
    PerRun,
    /// Wall-clock rotation, for long sweeps of many runs
    Hourly,
    Daily,
}

/// Shape of each JSON line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonlConfig {
    /// Event fields at the top level instead of under `fields`
    pub flatten_fields: bool,
    /// Every entered span, not only the innermost node span
    pub span_list: bool,
    pub source_location: bool,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            flatten_fields: true,
            span_list: false,
            source_location: false,
        }
    }
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::analyzer::MagnitudeScale;
use crate::host_bridge::MetadataSettings;
use crate::monitor::MonitorSettings;
use crate::shared_state::{ThemeColor, WindowIntent};

/// Overrides the config file location
pub const CONFIG_ENV: &str = "RADIOSCOPE_CONFIG";

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// User settings, read once at startup.
///
/// Every field has a default, so a partial (or missing) file is fine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub stream: StreamConfig,
    pub metadata: MetadataConfig,
    pub window: WindowConfig,
    pub analyzer: AnalyzerConfig,
    pub host: HostMode,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub url: String,
    /// Liveness probe period (seconds)
    pub probe_interval_secs: u64,
    /// Flat delay between failed reconnects (seconds)
    pub retry_delay_secs: u64,
    /// Render ticks per second (1-240)
    pub frame_rate: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/stream".into(),
            probe_interval_secs: 10,
            retry_delay_secs: 5,
            frame_rate: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// Icecast `status-json.xsl` endpoint
    pub status_url: String,
    pub poll_interval_secs: u64,
    /// Optional server-sent event feed, preferred over polling
    pub sse_url: Option<String>,
    /// Delay before reopening a dropped event feed (seconds)
    pub sse_retry_secs: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            status_url: "http://localhost:8000/status-json.xsl".into(),
            poll_interval_secs: 10,
            sse_url: None,
            sse_retry_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub always_on_top: bool,
    pub click_through: bool,
    pub theme_color: ThemeColor,
}

impl Default for WindowConfig {
    fn default() -> Self {
        let intent = WindowIntent::default();
        Self {
            always_on_top: intent.pinned,
            click_through: intent.click_through,
            theme_color: intent.theme_color,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MagnitudeMode {
    /// 0-255 linear bars
    Byte,
    /// [0, 1] bars between -100 dB and -30 dB
    #[default]
    Decibel,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub mode: MagnitudeMode,
}

/// How to reach the host window manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostMode {
    /// stdio when stdin is piped, detached otherwise
    #[default]
    Auto,
    Stdio,
    Detached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// trace, debug, info, warn or error (`RUST_LOG` wins when set)
    pub level: String,
    pub console_output: bool,
    pub file_output: bool,
    /// Where daily log files go; platform data dir when unset
    pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            console_output: true,
            file_output: false,
            directory: None,
        }
    }
}

impl LogConfig {
    pub fn parse_level(&self) -> tracing::Level {
        self.level.parse().unwrap_or(tracing::Level::INFO)
    }

    pub fn log_directory(&self) -> PathBuf {
        match &self.directory {
            Some(dir) => dir.clone(),
            None => project_dirs()
                .map(|dirs| dirs.data_local_dir().join("logs"))
                .unwrap_or_else(|| std::env::temp_dir().join("radioscope")),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "radioscope", "radioscope")
}

impl OverlayConfig {
    /// `$RADIOSCOPE_CONFIG`, else `config.json` in the platform config dir
    pub fn config_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load from the default location. A missing file means defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::from_path(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    // === Component settings ===

    pub fn initial_intent(&self) -> WindowIntent {
        WindowIntent {
            pinned: self.window.always_on_top,
            click_through: self.window.click_through,
            theme_color: self.window.theme_color,
        }
    }

    pub fn magnitude_scale(&self) -> MagnitudeScale {
        match self.analyzer.mode {
            MagnitudeMode::Byte => MagnitudeScale::Byte,
            MagnitudeMode::Decibel => MagnitudeScale::decibel(),
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        let frame_rate = self.stream.frame_rate.clamp(1, 240);
        MonitorSettings {
            stream_url: self.stream.url.clone(),
            probe_interval: Duration::from_secs(self.stream.probe_interval_secs.max(1)),
            retry_delay: Duration::from_secs(self.stream.retry_delay_secs.max(1)),
            frame_interval: Duration::from_secs_f64(1.0 / frame_rate as f64),
            scale: self.magnitude_scale(),
        }
    }

    pub fn metadata_settings(&self) -> MetadataSettings {
        MetadataSettings {
            status_url: self.metadata.status_url.clone(),
            poll_interval: Duration::from_secs(self.metadata.poll_interval_secs.max(1)),
            feed_url: self.metadata.sse_url.clone(),
            feed_retry: Duration::from_secs(self.metadata.sse_retry_secs.max(1)),
        }
    }
}

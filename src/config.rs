use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::LogConfig;
use crate::models::AthleteProfile;

/// Engine configuration, stored as TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Thresholds used for target resolution and zones
    pub athlete: AthleteProfile,

    /// Connection health and reconnect policy
    pub connection: ConnectionConfig,

    /// Recording cadence and aggregation constants
    pub recording: RecordingConfig,

    /// Logging output
    pub logging: LogConfig,
}

/// Sensor connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How often endpoints are checked for silence
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,

    /// Silence after which a connected endpoint is considered lost
    #[serde(with = "duration_ms")]
    pub stale_after: Duration,

    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Delay before the second attempt; doubles afterwards
    #[serde(with = "duration_ms")]
    pub reconnect_base_delay: Duration,

    /// Cap on the backoff delay
    #[serde(with = "duration_ms")]
    pub reconnect_max_delay: Duration,

    /// Wait for a control point response
    #[serde(with = "duration_ms")]
    pub control_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(8),
            control_timeout: Duration::from_secs(3),
        }
    }
}

/// Recording session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Clock driving elapsed time and the plan executor
    #[serde(with = "duration_ms")]
    pub tick_interval: Duration,

    /// Window for rolling averages
    #[serde(with = "duration_ms")]
    pub rolling_window: Duration,

    /// Speed (m/s) above which time counts as moving
    pub moving_speed_threshold: f64,

    /// Sample gaps longer than this are not attributed to any zone
    #[serde(with = "duration_ms")]
    pub max_sample_gap: Duration,

    /// Gross mechanical efficiency for calorie estimates
    pub mechanical_efficiency: f64,

    /// Wheel circumference for CSC speed
    pub wheel_circumference_m: f64,

    /// How often a recording session is handed to the sink
    #[serde(with = "duration_ms")]
    pub persist_interval: Duration,

    /// Where session files are written
    pub data_dir: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            rolling_window: Duration::from_secs(60),
            moving_speed_threshold: 0.5,
            max_sample_gap: Duration::from_secs(10),
            mechanical_efficiency: 0.24,
            wheel_circumference_m: 2.105,
            persist_interval: Duration::from_secs(30),
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Configuration management implementation
impl EngineConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: EngineConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let toml_content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".trainlink")
            .join("config.toml")
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default() -> Self {
        let config_path = Self::default_config_path();

        match Self::load_from_file(&config_path) {
            Ok(config) => config,
            Err(err) => {
                tracing::debug!("Using default configuration ({}): {:#}", config_path.display(), err);
                Self::default()
            }
        }
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.recording.tick_interval.is_zero() {
            anyhow::bail!("recording.tick_interval must be positive");
        }
        if self.connection.health_check_interval.is_zero() {
            anyhow::bail!("connection.health_check_interval must be positive");
        }
        if !(self.recording.mechanical_efficiency > 0.0 && self.recording.mechanical_efficiency <= 1.0) {
            anyhow::bail!(
                "recording.mechanical_efficiency must be in (0, 1], got {}",
                self.recording.mechanical_efficiency
            );
        }
        if self.recording.wheel_circumference_m <= 0.0 {
            anyhow::bail!("recording.wheel_circumference_m must be positive");
        }
        Ok(())
    }
}

/// Durations as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

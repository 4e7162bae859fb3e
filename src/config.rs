//! Application configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;
use tracing::warn;

use crate::errors::DcpMonError;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub retention: RetentionConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub reference: ReferenceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the report protocol listener.
    pub bind: String,
    /// Bind address for the decoded-message ingest listener.
    pub ingest_bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Hard cap on resident queue entries.
    pub capacity: usize,
    /// How long a record rests in the queue so that duplicate signals
    /// can coalesce before the single persistence write.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_settle_time")]
    pub settle_time: Duration,
}

fn default_settle_time() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    /// Transmission records older than this many days are scrubbed.
    pub days: i32,
}

/// Red/yellow alarm thresholds applied during report generation.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Seconds of margin from the window edge; less than red is an alarm.
    pub red_msg_time: i32,
    pub yellow_msg_time: i32,
    /// Signal strength in dB; alarm below.
    pub red_signal_strength: i32,
    pub yellow_signal_strength: i32,
    /// Absolute frequency offset; alarm above.
    pub red_freq_offset: i32,
    pub yellow_freq_offset: i32,
    /// Battery volts; alarm below.
    pub red_battery: f64,
    pub yellow_battery: f64,
    /// Any of these codes on a record makes the code field red/yellow.
    pub red_failure_codes: String,
    pub yellow_failure_codes: String,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            red_msg_time: 0,
            yellow_msg_time: 2,
            red_signal_strength: 30,
            yellow_signal_strength: 32,
            red_freq_offset: 6,
            yellow_freq_offset: 5,
            red_battery: 9.0,
            yellow_battery: 11.0,
            red_failure_codes: "M".to_string(),
            yellow_failure_codes: "?UT".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    /// Groups whose name starts with this prefix are exclusion groups:
    /// decoded sensor data from their members is discarded.
    pub exclude_group_prefix: String,
    /// Failure codes the operator does not want recorded.
    pub omit_failure_codes: String,
    /// Time-range filter bounds for decoded sensor samples.
    pub max_future_minutes: i64,
    pub max_age_hours: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            exclude_group_prefix: "EXCLUDE".to_string(),
            omit_failure_codes: String::new(),
            max_future_minutes: 10,
            max_age_hours: 48,
        }
    }
}

/// Paths to independently refreshed reference data.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ReferenceConfig {
    /// Platform description table file.
    pub pdt_path: Option<PathBuf>,
    /// Channel map file.
    pub channel_map_path: Option<PathBuf>,
    /// Receiver identification list served verbatim by the `rl` command.
    pub receiver_list_path: Option<PathBuf>,
    /// Network-list files, one group per file.
    pub group_files: Vec<PathBuf>,
    /// Store-backed group names.
    pub store_groups: Vec<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(
                Environment::with_prefix("DCPMON")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("reference.group_files")
                    .with_list_parse_key("reference.store_groups"),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), DcpMonError> {
        self.database.validate()?;
        if self.queue.capacity == 0 {
            return Err(DcpMonError::ConfigurationError {
                message: "Queue capacity must be greater than zero".to_string(),
            });
        }
        if self.queue.settle_time.is_zero() {
            return Err(DcpMonError::ConfigurationError {
                message: "Queue settle time must be greater than zero".to_string(),
            });
        }
        if self.retention.days <= 0 {
            return Err(DcpMonError::ConfigurationError {
                message: "Retention days must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

impl DatabaseConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), DcpMonError> {
        if self.path.to_str().unwrap_or("").is_empty() {
            return Err(DcpMonError::ConfigurationError {
                message: "Database path cannot be empty".to_string(),
            });
        }
        self.ensure_directory_exists(self.path.parent().ok_or_else(|| {
            DcpMonError::ConfigurationError {
                message: "Could not get parent directory".to_string(),
            }
        })?)?;
        Ok(())
    }

    fn ensure_directory_exists(&self, dir: &Path) -> Result<(), DcpMonError> {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            warn!("Database directory does not exist, attempting to create it");
            std::fs::create_dir_all(dir).map_err(|e| DcpMonError::ConfigurationError {
                message: format!("Could not create database directory: {}", e),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_load_config() {
        env::set_var("DCPMON__SERVER__BIND", "127.0.0.1:17010");
        env::set_var("DCPMON__SERVER__INGEST_BIND", "127.0.0.1:17011");
        env::set_var("DCPMON__DATABASE__PATH", "/tmp/dcpmon-test.db");
        env::set_var("DCPMON__QUEUE__CAPACITY", "500");
        env::set_var("DCPMON__QUEUE__SETTLE_TIME", "5");
        env::set_var("DCPMON__RETENTION__DAYS", "30");

        let config = AppConfig::load().unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:17010");
        assert_eq!(config.database.path, PathBuf::from("/tmp/dcpmon-test.db"));
        assert_eq!(config.queue.capacity, 500);
        assert_eq!(config.queue.settle_time, Duration::from_secs(5));
        assert_eq!(config.retention.days, 30);
        // Defaults kick in for sections not present in the environment.
        assert_eq!(config.thresholds.red_battery, 9.0);
        assert_eq!(config.pipeline.max_future_minutes, 10);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = AppConfig {
            server: ServerConfig {
                bind: "127.0.0.1:17010".to_string(),
                ingest_bind: "127.0.0.1:17011".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from("/tmp/dcpmon-test.db"),
            },
            queue: QueueConfig {
                capacity: 0,
                settle_time: Duration::from_secs(5),
            },
            retention: RetentionConfig { days: 30 },
            thresholds: ThresholdConfig::default(),
            pipeline: PipelineConfig::default(),
            reference: ReferenceConfig::default(),
        };

        assert!(config.validate().is_err());
    }
}

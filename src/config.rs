// SPDX-License-Identifier: Apache-2.0

//! Configuration document loaded at startup.
//!
//! The document has two sections: `tailf` describes what to tail and how to
//! batch it, `kafka` describes where the records go. Unknown fields are
//! rejected so a typo'd knob fails loudly instead of silently defaulting.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// One tailed file pattern and its destination topic.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileSpecConfig {
    /// Destination topic for this pattern's records
    pub topic: String,
    /// Full path prefix, e.g. `/var/log/app-`
    pub prefix: String,
    /// Optional filename suffix, e.g. `.log`
    #[serde(default)]
    pub suffix: Option<String>,
    /// strftime-style time pattern, e.g. `%Y-%m-%d`
    pub time_pattern: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TailConfig {
    pub files: Vec<FileSpecConfig>,

    /// Durable path-to-offset mapping, rewritten on every flush
    pub position_file: PathBuf,

    /// Seconds between position-file flushes
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,

    /// Maximum complete lines per batch
    #[serde(default = "default_max_batch_lines")]
    pub max_batch_lines: usize,

    /// Maximum consecutive drain iterations per wake; also drives the
    /// publisher queue capacity
    #[serde(default = "default_max_batches")]
    pub max_batches: usize,

    /// Whether pre-existing files discovered at startup are read from the
    /// beginning (true) or from their current size (false). Files appearing
    /// after startup always start at offset 0. The config key keeps its
    /// historical spelling.
    #[serde(rename = "from_begining")]
    pub from_beginning: bool,

    /// Enables the reaper for fully-shipped rotated files
    #[serde(default)]
    pub delete_old_tailed_files: bool,

    /// Shell command executed after each successful reap
    #[serde(default)]
    pub post_delete_command: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerType {
    /// Await each record's delivery report before sending the next
    Sync,
    /// Enqueue the whole batch, then await all delivery reports
    Async,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,

    pub producer_type: ProducerType,

    /// When false, batches are dequeued and discarded but offsets still
    /// advance (dry-run)
    #[serde(default = "default_true")]
    pub produce: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub tailf: TailConfig,
    pub kafka: KafkaConfig,
}

fn default_flush_interval() -> u64 {
    1
}

fn default_max_batch_lines() -> usize {
    1024
}

fn default_max_batches() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load and validate a config document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse and validate a config document from a string.
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.tailf.files.is_empty() {
            return Err(ConfigError::Invalid(
                "tailf.files must list at least one file pattern".into(),
            ));
        }

        for (i, file) in self.tailf.files.iter().enumerate() {
            if file.topic.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "tailf.files[{i}].topic must not be empty"
                )));
            }
            if file.prefix.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "tailf.files[{i}].prefix must not be empty"
                )));
            }
            if file.time_pattern.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "tailf.files[{i}].time_pattern must not be empty"
                )));
            }
            if file.topic.contains(char::is_whitespace) {
                return Err(ConfigError::Invalid(format!(
                    "tailf.files[{i}].topic must not contain whitespace"
                )));
            }
        }

        if self.tailf.position_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "tailf.position_file must not be empty".into(),
            ));
        }
        if self.tailf.flush_interval == 0 {
            return Err(ConfigError::Invalid(
                "tailf.flush_interval must be at least 1 second".into(),
            ));
        }
        if self.tailf.max_batch_lines == 0 {
            return Err(ConfigError::Invalid(
                "tailf.max_batch_lines must be at least 1".into(),
            ));
        }
        if self.tailf.max_batches == 0 {
            return Err(ConfigError::Invalid(
                "tailf.max_batches must be at least 1".into(),
            ));
        }

        if self.kafka.brokers.is_empty() {
            return Err(ConfigError::Invalid(
                "kafka.brokers must list at least one broker".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
tailf:
  files:
    - topic: app-logs
      prefix: /var/log/app-
      suffix: .log
      time_pattern: "%Y-%m-%d"
  position_file: /var/lib/tailpost/positions
  from_begining: false
kafka:
  brokers: ["localhost:9092"]
  producer_type: sync
"#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = Config::from_str(MINIMAL).unwrap();

        assert_eq!(config.tailf.files.len(), 1);
        assert_eq!(config.tailf.files[0].topic, "app-logs");
        assert_eq!(config.tailf.files[0].suffix.as_deref(), Some(".log"));
        assert_eq!(config.tailf.flush_interval, 1);
        assert_eq!(config.tailf.max_batch_lines, 1024);
        assert_eq!(config.tailf.max_batches, 10);
        assert!(!config.tailf.from_beginning);
        assert!(!config.tailf.delete_old_tailed_files);
        assert!(config.tailf.post_delete_command.is_none());
        assert_eq!(config.kafka.producer_type, ProducerType::Sync);
        assert!(config.kafka.produce);
    }

    #[test]
    fn full_config_parses() {
        let yaml = r#"
tailf:
  files:
    - topic: app-logs
      prefix: /var/log/app-
      time_pattern: "%Y-%m-%d"
    - topic: web-logs
      prefix: /var/log/nginx/access-
      suffix: .log
      time_pattern: "%Y%m%d%H"
  position_file: /tmp/positions
  flush_interval: 5
  max_batch_lines: 256
  max_batches: 4
  from_begining: true
  delete_old_tailed_files: true
  post_delete_command: "logger reaped"
kafka:
  brokers: ["k1:9092", "k2:9092"]
  producer_type: async
  produce: false
"#;
        let config = Config::from_str(yaml).unwrap();

        assert_eq!(config.tailf.files.len(), 2);
        assert!(config.tailf.files[1].suffix.is_some());
        assert_eq!(config.tailf.max_batches, 4);
        assert!(config.tailf.delete_old_tailed_files);
        assert_eq!(
            config.tailf.post_delete_command.as_deref(),
            Some("logger reaped")
        );
        assert_eq!(config.kafka.producer_type, ProducerType::Async);
        assert!(!config.kafka.produce);
    }

    #[test]
    fn empty_files_rejected() {
        let yaml = r#"
tailf:
  files: []
  position_file: /tmp/positions
  from_begining: false
kafka:
  brokers: ["localhost:9092"]
  producer_type: sync
"#;
        let err = Config::from_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("tailf.files"));
    }

    #[test]
    fn empty_brokers_rejected() {
        let yaml = r#"
tailf:
  files:
    - topic: t
      prefix: /tmp/app-
      time_pattern: "%Y-%m-%d"
  position_file: /tmp/positions
  from_begining: false
kafka:
  brokers: []
  producer_type: sync
"#;
        let err = Config::from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("kafka.brokers"));
    }

    #[test]
    fn unknown_field_rejected() {
        let yaml = r#"
tailf:
  files:
    - topic: t
      prefix: /tmp/app-
      time_pattern: "%Y-%m-%d"
  position_file: /tmp/positions
  from_begining: false
  flush_intervall: 3
kafka:
  brokers: ["localhost:9092"]
  producer_type: sync
"#;
        assert!(matches!(
            Config::from_str(yaml).unwrap_err(),
            ConfigError::Yaml(_)
        ));
    }

    #[test]
    fn missing_from_beginning_rejected() {
        let yaml = r#"
tailf:
  files:
    - topic: t
      prefix: /tmp/app-
      time_pattern: "%Y-%m-%d"
  position_file: /tmp/positions
kafka:
  brokers: ["localhost:9092"]
  producer_type: sync
"#;
        assert!(matches!(
            Config::from_str(yaml).unwrap_err(),
            ConfigError::Yaml(_)
        ));
    }

    #[test]
    fn zero_flush_interval_rejected() {
        let yaml = r#"
tailf:
  files:
    - topic: t
      prefix: /tmp/app-
      time_pattern: "%Y-%m-%d"
  position_file: /tmp/positions
  flush_interval: 0
  from_begining: false
kafka:
  brokers: ["localhost:9092"]
  producer_type: sync
"#;
        let err = Config::from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("flush_interval"));
    }
}

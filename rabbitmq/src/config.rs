//! Declarative configuration: connections, exchanges, dead letters and
//! consumers, loaded from YAML with `${NAME}` / `${NAME:=default}`
//! environment substitution performed on the raw bytes before parsing.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::error::ConfigError;

/// Broker-side declaration options shared by exchanges, queues and
/// bindings. `args` carries arbitrary broker arguments (e.g.
/// `x-message-ttl`, `x-dead-letter-exchange`) as raw JSON values; the
/// topology module converts them into AMQP field-table values.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Options {
    pub durable: bool,
    pub internal: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub no_local: bool,
    pub auto_ack: bool,
    pub args: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Topic,
    Direct,
    Fanout,
    Headers,
}

impl From<ExchangeType> for lapin::ExchangeKind {
    fn from(kind: ExchangeType) -> Self {
        match kind {
            ExchangeType::Topic => lapin::ExchangeKind::Topic,
            ExchangeType::Direct => lapin::ExchangeKind::Direct,
            ExchangeType::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeType::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    #[serde(rename = "type")]
    pub kind: ExchangeType,
    #[serde(default)]
    pub options: Options,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Binding {
    pub exchange: String,
    pub routing_keys: Vec<String>,
    #[serde(default)]
    pub options: Options,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default)]
    pub options: Options,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetter {
    pub queue: QueueConfig,
}

fn default_timeout_ms() -> u64 {
    2_000
}

fn default_sleep_ms() -> u64 {
    500
}

fn default_retries() -> u32 {
    5
}

/// One named broker connection. `timeout`/`sleep` govern
/// [`crate::connection::open_connection`]'s dial-and-retry loop.
#[derive(Debug, Clone, Deserialize)]
pub struct Connection {
    pub dsn: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_sleep_ms")]
    pub sleep_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Connection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sleep(&self) -> Duration {
        Duration::from_millis(self.sleep_ms)
    }
}

fn default_workers() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    pub connection: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// If omitted, normalized to `workers + 2` by [`Config::normalize`].
    #[serde(default)]
    pub prefetch_count: u16,
    #[serde(default)]
    pub dead_letter: Option<String>,
    pub queue: QueueConfig,
    #[serde(default)]
    pub options: Options,
}

impl ConsumerConfig {
    /// Applies the `workers` and `prefetch_count` defaulting rules from the
    /// data model: workers defaults to 1, prefetch defaults to `workers+2`
    /// and is bumped up whenever it would otherwise be ≤ workers (a
    /// consumer whose prefetch can't exceed its own concurrency can never
    /// detect a saturated worker pool via broker back-pressure).
    fn normalize(&mut self) {
        if self.workers == 0 {
            self.workers = 1;
        }
        if self.prefetch_count == 0 || self.prefetch_count as usize <= self.workers {
            self.prefetch_count = (self.workers + 2).min(u16::MAX as usize) as u16;
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub connections: HashMap<String, Connection>,
    #[serde(default)]
    pub exchanges: HashMap<String, ExchangeConfig>,
    #[serde(default)]
    pub dead_letters: HashMap<String, DeadLetter>,
    #[serde(default)]
    pub consumers: HashMap<String, ConsumerConfig>,
}

impl Config {
    fn normalize(mut self) -> Self {
        for consumer in self.consumers.values_mut() {
            consumer.normalize();
        }
        self
    }

    /// Loads a YAML config file. Only `.yml`/`.yaml` extensions are
    /// accepted; anything else is a configuration error, not a silent
    /// fallback.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        if ext != "yml" && ext != "yaml" {
            return Err(ConfigError::UnsupportedExtension(
                path.display().to_string(),
            ));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parses YAML after substituting `${NAME}` (error if unset) and
    /// `${NAME:=default}` (fall back to `default`) against the process
    /// environment.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env(raw)?;
        let config: Config = serde_yaml::from_str(&substituted)?;
        Ok(config.normalize())
    }
}

fn substitute_env(raw: &str) -> Result<String, ConfigError> {
    // ${NAME} or ${NAME:=default}; NAME is [A-Za-z_][A-Za-z0-9_]*.
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:=([^}]*))?\}").unwrap();
    let mut err = None;
    let replaced = pattern.replace_all(raw, |caps: &regex::Captures| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(val) => val,
            Err(_) => match caps.get(3) {
                Some(default) => default.as_str().to_string(),
                None => {
                    err.get_or_insert_with(|| ConfigError::MissingEnvVar(name.to_string()));
                    String::new()
                }
            },
        }
    });
    let replaced = replaced.into_owned();
    match err {
        Some(e) => Err(e),
        None => Ok(replaced),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_required_var() {
        std::env::set_var("RABBITMQ_TEST_DSN", "amqp://localhost");
        let out = substitute_env("dsn: ${RABBITMQ_TEST_DSN}").unwrap();
        assert_eq!(out, "dsn: amqp://localhost");
    }

    #[test]
    fn missing_required_var_errors() {
        std::env::remove_var("RABBITMQ_TEST_MISSING");
        let err = substitute_env("dsn: ${RABBITMQ_TEST_MISSING}").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(name) if name == "RABBITMQ_TEST_MISSING"));
    }

    #[test]
    fn falls_back_to_default() {
        std::env::remove_var("RABBITMQ_TEST_DEFAULTED");
        let out = substitute_env("timeout: ${RABBITMQ_TEST_DEFAULTED:=2000}").unwrap();
        assert_eq!(out, "timeout: 2000");
    }

    #[test]
    fn rejects_non_yaml_extension() {
        let err = Config::from_file("config.json").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedExtension(_)));
    }

    #[test]
    fn defaults_workers_and_prefetch() {
        let mut consumer = ConsumerConfig {
            connection: "default".into(),
            workers: 0,
            prefetch_count: 0,
            dead_letter: None,
            queue: QueueConfig {
                name: "q".into(),
                bindings: vec![],
                options: Options::default(),
            },
            options: Options::default(),
        };
        consumer.normalize();
        assert_eq!(consumer.workers, 1);
        assert_eq!(consumer.prefetch_count, 3);
    }

    #[test]
    fn parses_a_full_config_document() {
        std::env::set_var("RABBITMQ_TEST_DSN_FULL", "amqp://broker:5672");
        let raw = r#"
connections:
  default:
    dsn: ${RABBITMQ_TEST_DSN_FULL}
    retries: 3
exchanges:
  event_bus:
    type: topic
    options:
      durable: true
dead_letters:
  messaging_consumer:
    queue:
      name: messaging_consumer.dlq
consumers:
  messaging_consumer:
    connection: default
    workers: 3
    dead_letter: messaging_consumer
    queue:
      name: messaging_consumer
      bindings:
        - exchange: event_bus
          routing_keys:
            - service.whatsapp.send
"#;
        let config = Config::from_yaml_str(raw).unwrap();
        assert_eq!(config.connections["default"].dsn, "amqp://broker:5672");
        assert_eq!(config.connections["default"].retries, 3);
        assert_eq!(config.consumers["messaging_consumer"].workers, 3);
        // prefetch_count was 0 in the document, normalized to workers + 2.
        assert_eq!(config.consumers["messaging_consumer"].prefetch_count, 5);
        assert_eq!(
            config.consumers["messaging_consumer"].queue.bindings[0].routing_keys[0],
            "service.whatsapp.send"
        );
    }

    #[test]
    fn prefetch_bumped_when_not_greater_than_workers() {
        let mut consumer = ConsumerConfig {
            connection: "default".into(),
            workers: 5,
            prefetch_count: 5,
            dead_letter: None,
            queue: QueueConfig {
                name: "q".into(),
                bindings: vec![],
                options: Options::default(),
            },
            options: Options::default(),
        };
        consumer.normalize();
        assert_eq!(consumer.prefetch_count, 7);
    }
}

//! Declarations. Runs once, synchronously, before any consumer starts:
//! exchanges, then dead-letter queues + bindings, then consumer queues +
//! bindings.

use std::collections::HashSet;
use std::sync::Arc;

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::Channel;
use tokio::sync::Mutex;

use crate::config::{Config, ExchangeConfig, Options, QueueConfig};
use crate::error::TopologyError;

fn json_to_amqp_value(value: &serde_json::Value) -> Option<AMQPValue> {
    match value {
        serde_json::Value::String(s) => Some(AMQPValue::LongString(s.as_str().into())),
        serde_json::Value::Bool(b) => Some(AMQPValue::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(AMQPValue::LongLongInt(i))
            } else {
                n.as_f64().map(AMQPValue::Double)
            }
        }
        _ => None,
    }
}

fn field_table(options: &Options) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in &options.args {
        if let Some(v) = json_to_amqp_value(value) {
            table.insert(key.as_str().into(), v);
        }
    }
    table
}

async fn declare_exchange_config(
    channel: &Channel,
    name: &str,
    cfg: &ExchangeConfig,
) -> Result<(), TopologyError> {
    channel
        .exchange_declare(
            name,
            cfg.kind.into(),
            ExchangeDeclareOptions {
                durable: cfg.options.durable,
                internal: cfg.options.internal,
                auto_delete: cfg.options.auto_delete,
                nowait: cfg.options.no_wait,
                passive: false,
            },
            field_table(&cfg.options),
        )
        .await
        .map_err(|e| TopologyError {
            entity: format!("exchange {name}"),
            cause: e.to_string(),
        })
}

async fn declare_queue_config(
    channel: &Channel,
    cfg: &QueueConfig,
) -> Result<(), TopologyError> {
    channel
        .queue_declare(
            &cfg.name,
            QueueDeclareOptions {
                durable: cfg.options.durable,
                exclusive: cfg.options.exclusive,
                auto_delete: cfg.options.auto_delete,
                nowait: cfg.options.no_wait,
                passive: false,
            },
            field_table(&cfg.options),
        )
        .await
        .map_err(|e| TopologyError {
            entity: format!("queue {}", cfg.name),
            cause: e.to_string(),
        })?;

    for binding in &cfg.bindings {
        for routing_key in &binding.routing_keys {
            channel
                .queue_bind(
                    &cfg.name,
                    &binding.exchange,
                    routing_key,
                    QueueBindOptions {
                        nowait: binding.options.no_wait,
                        ..Default::default()
                    },
                    field_table(&binding.options),
                )
                .await
                .map_err(|e| TopologyError {
                    entity: format!(
                        "binding {} <- {} ({})",
                        cfg.name, binding.exchange, routing_key
                    ),
                    cause: e.to_string(),
                })?;
        }
    }
    Ok(())
}

/// Declares exchanges, then dead-letter queues, then consumer queues and
/// their bindings, in that order. Fails hard on the first error — the
/// caller (the supervisor) must not start any consumer after a failure
/// here.
pub async fn declare_all(channel: &Channel, config: &Config) -> Result<(), TopologyError> {
    for (name, exchange) in &config.exchanges {
        declare_exchange_config(channel, name, exchange).await?;
    }
    for dead_letter in config.dead_letters.values() {
        declare_queue_config(channel, &dead_letter.queue).await?;
    }
    for consumer in config.consumers.values() {
        declare_queue_config(channel, &consumer.queue).await?;
    }
    Ok(())
}

/// Lazy, memoized exchange declaration used by the producer: declares an
/// exchange from `config.exchanges` at most once per process, and is a
/// silent no-op for names the config doesn't know about — the subsequent
/// publish will simply fail at the broker.
pub struct ExchangeDeclarer {
    declared: Mutex<HashSet<String>>,
}

impl ExchangeDeclarer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            declared: Mutex::new(HashSet::new()),
        })
    }

    pub async fn declare_once(
        &self,
        channel: &Channel,
        config: &Config,
        name: &str,
    ) -> Result<(), TopologyError> {
        if name.is_empty() {
            return Ok(());
        }
        let mut declared = self.declared.lock().await;
        if declared.contains(name) {
            return Ok(());
        }
        let Some(exchange) = config.exchanges.get(name) else {
            // Unconfigured exchange: skip, the broker will reject the publish.
            return Ok(());
        };
        declare_exchange_config(channel, name, exchange).await?;
        declared.insert(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn json_to_amqp_value_converts_scalars() {
        assert!(matches!(
            json_to_amqp_value(&serde_json::json!("lazy")),
            Some(AMQPValue::LongString(_))
        ));
        assert!(matches!(
            json_to_amqp_value(&serde_json::json!(true)),
            Some(AMQPValue::Boolean(true))
        ));
        assert!(matches!(
            json_to_amqp_value(&serde_json::json!(42)),
            Some(AMQPValue::LongLongInt(42))
        ));
        assert!(json_to_amqp_value(&serde_json::json!([1, 2])).is_none());
    }

    #[test]
    fn field_table_carries_only_convertible_args() {
        let mut args = HashMap::new();
        args.insert("x-message-ttl".to_string(), serde_json::json!(1000));
        args.insert("x-ignored".to_string(), serde_json::json!([1, 2]));
        let options = Options {
            args,
            ..Options::default()
        };
        let table = field_table(&options);
        assert!(table.inner().contains_key("x-message-ttl"));
        assert!(!table.inner().contains_key("x-ignored"));
    }
}

//! Message surface: a thin `Message` wrapper over a broker delivery
//! exposing ack/nack/reject, and a `Publishing` value type the producer
//! sends.

use std::collections::HashMap;
use std::time::Duration;

use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};
use lapin::types::{AMQPValue, FieldTable};
use serde::de::DeserializeOwned;

/// A received message, owned by the consumer until acked/nacked/rejected,
/// then handed to the user's handler.
pub struct Message {
    delivery: Delivery,
}

impl Message {
    pub(crate) fn new(delivery: Delivery) -> Self {
        Self { delivery }
    }

    pub fn body(&self) -> &[u8] {
        &self.delivery.data
    }

    pub fn routing_key(&self) -> &str {
        self.delivery.routing_key.as_str()
    }

    pub fn exchange(&self) -> &str {
        self.delivery.exchange.as_str()
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    pub fn headers(&self) -> Option<&FieldTable> {
        self.delivery.properties.headers().as_ref()
    }

    /// Unmarshals the body into `T` via JSON, mirroring
    /// [`crate::serializer::JsonMarshaller`] on the producer side.
    pub fn unmarshal_to<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.delivery.data)
    }

    pub async fn ack(&self, multiple: bool) -> Result<(), lapin::Error> {
        self.delivery
            .acker
            .ack(BasicAckOptions { multiple })
            .await
    }

    pub async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), lapin::Error> {
        self.delivery
            .acker
            .nack(BasicNackOptions { multiple, requeue })
            .await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), lapin::Error> {
        self.delivery
            .acker
            .reject(BasicRejectOptions { requeue })
            .await
    }
}

/// A message to publish. Built with the `with_*` methods, which mirror the
/// source's `PublishingOption` functions but as plain builder methods —
/// idiomatic for a value type with no surrounding registry of option
/// constructors to preserve.
#[derive(Debug, Clone)]
pub struct Publishing {
    pub exchange: String,
    pub key: String,
    pub delay: Duration,
    pub data: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub priority: Option<u8>,
    pub expiration_ms: Option<u64>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
}

impl Publishing {
    pub fn new(exchange: impl Into<String>, key: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            exchange: exchange.into(),
            key: key.into(),
            delay: Duration::ZERO,
            data,
            headers: HashMap::new(),
            priority: None,
            expiration_ms: None,
            reply_to: None,
            correlation_id: None,
            message_id: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority.min(9));
        self
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration_ms = Some(expiration.as_millis() as u64);
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn basic_properties(&self, content_type: &str) -> lapin::BasicProperties {
        let mut props = lapin::BasicProperties::default().with_content_type(content_type.into());
        if !self.headers.is_empty() {
            let mut table = FieldTable::default();
            for (k, v) in &self.headers {
                table.insert(k.as_str().into(), AMQPValue::LongString(v.as_str().into()));
            }
            props = props.with_headers(table);
        }
        if let Some(priority) = self.priority {
            props = props.with_priority(priority);
        }
        if let Some(expiration_ms) = self.expiration_ms {
            props = props.with_expiration(expiration_ms.to_string().into());
        }
        if let Some(reply_to) = &self.reply_to {
            props = props.with_reply_to(reply_to.as_str().into());
        }
        if let Some(correlation_id) = &self.correlation_id {
            props = props.with_correlation_id(correlation_id.as_str().into());
        }
        if let Some(message_id) = &self.message_id {
            props = props.with_message_id(message_id.as_str().into());
        }
        props
    }
}

/// A publish that failed, surfaced asynchronously via
/// [`crate::producer::Producer::emit_err`].
#[derive(Debug)]
pub struct PublishingError {
    pub publishing: Publishing,
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_priority_clamps_to_nine() {
        let publishing = Publishing::new("ex", "key", vec![]).with_priority(200);
        assert_eq!(publishing.priority, Some(9));
    }

    #[test]
    fn basic_properties_carries_headers_and_expiration() {
        let mut headers = HashMap::new();
        headers.insert("x-origin".to_string(), "demo".to_string());
        let publishing = Publishing::new("ex", "key", b"body".to_vec())
            .with_headers(headers)
            .with_expiration(Duration::from_millis(1500))
            .with_correlation_id("corr-1");

        let props = publishing.basic_properties("application/json");
        assert_eq!(props.content_type().as_ref().unwrap().as_str(), "application/json");
        assert_eq!(props.expiration().as_ref().unwrap().as_str(), "1500");
        assert_eq!(props.correlation_id().as_ref().unwrap().as_str(), "corr-1");
        let table = props.headers().as_ref().unwrap();
        assert!(table.inner().contains_key("x-origin"));
    }

    #[test]
    fn with_delay_is_zero_by_default() {
        let publishing = Publishing::new("ex", "key", vec![]);
        assert_eq!(publishing.delay, Duration::ZERO);
    }
}

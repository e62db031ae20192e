//! Declarative topology, supervised concurrent consumers, a reconnecting
//! producer, and a broker-native binary-cascade delay-delivery engine for
//! AMQP 0-9-1 brokers.

pub mod config;
pub mod connection;
pub mod consumer;
pub mod delay;
pub mod error;
pub mod message;
pub mod producer;
pub mod serializer;
pub mod supervisor;
pub mod topology;

pub use config::Config;
pub use connection::open_connection;
pub use consumer::{Consumer, FnHandler, MessageHandler};
pub use delay::{calculate_routing_key, DelayEngine, LEVELS, MAX_DELAY_SECS};
pub use error::{
    ConfigError, ConnectionOpenError, ConsumerError, ProducerError, SupervisorError, TopologyError,
};
pub use message::{Message, Publishing, PublishingError};
pub use producer::Producer;
pub use serializer::JsonMarshaller;
pub use supervisor::{start_supervisor, StopFn};
pub use topology::{declare_all, ExchangeDeclarer};

//! Error taxonomy. Each subsystem gets its own `thiserror` enum rather than
//! one crate-wide type, matching the `SubscriberError` / `PublisherError`
//! split the library already used before this crate grew a topology engine,
//! a supervisor, and a delay-delivery cascade around it.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unsupported config file extension: {0} (expected .yml or .yaml)")]
    UnsupportedExtension(String),
    #[error("environment variable {0} is required but not set")]
    MissingEnvVar(String),
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Error, Debug)]
#[error("error opening the connection \"{name}\": {cause}")]
pub struct ConnectionOpenError {
    pub name: String,
    pub cause: String,
}

#[derive(Error, Debug)]
#[error("failed to declare {entity}: {cause}")]
pub struct TopologyError {
    pub entity: String,
    pub cause: String,
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to register consumer: {0}")]
    ConsumerRegistrationFailed(String),
    #[error("channel closed: {0}")]
    ChannelClosed(String),
    #[error("internal delivery channel closed unexpectedly")]
    InternalChannelClosed,
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to open connection: {0}")]
    Connection(#[from] ConnectionOpenError),
    #[error("failed to declare topology: {0}")]
    Topology(#[from] TopologyError),
    #[error("no connection named {0} configured for consumer {1}")]
    UnknownConnection(String, String),
}

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to open connection: {0}")]
    Connection(#[from] ConnectionOpenError),
    #[error("failed to publish message: {0}")]
    Publish(#[from] lapin::Error),
    #[error("failed to declare topology before publishing: {0}")]
    Topology(#[from] TopologyError),
    #[error("publish retries exhausted after {0} attempts")]
    RetriesExhausted(u32),
}

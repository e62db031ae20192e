use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rabbitmq::config::Config;
use rabbitmq::{start_supervisor, Message, MessageHandler};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
struct ExampleMessage {
    id: i32,
    message: String,
    timestamp: DateTime<Utc>,
}

struct ExampleHandler;

#[async_trait]
impl MessageHandler for ExampleHandler {
    async fn handle(&self, message: Message) {
        match message.unmarshal_to::<ExampleMessage>() {
            Ok(example) => {
                println!(
                    "received example message: id={}, message={}, time={}",
                    example.id,
                    example.message,
                    example.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ")
                );
                if let Err(e) = message.ack(false).await {
                    log::error!("failed to ack message: {e}");
                }
            }
            Err(e) => {
                log::error!("failed to unmarshal message: {e}");
                if let Err(e) = message.reject(false).await {
                    log::error!("failed to reject message: {e}");
                }
            }
        }
    }

    async fn close(&self) {
        println!("example consumer shutting down");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::from_file("demos/consumer/config.yaml")?;

    let mut handlers: HashMap<String, Arc<dyn MessageHandler>> = HashMap::new();
    handlers.insert("example_consumer".to_string(), Arc::new(ExampleHandler));

    let stop = start_supervisor("rabbitmq-consumer-demo", config, handlers, Duration::from_secs(5)).await?;

    println!("Consumer started successfully! Press Ctrl+C to stop...");
    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");

    stop.stop().await;
    Ok(())
}

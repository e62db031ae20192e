//! Supervisor: opens every configured connection, declares topology once
//! per connection, starts one [`Consumer`] per configured consumer, and
//! watches them on a tick, restarting any that died.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lapin::Connection;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connection::open_connection;
use crate::consumer::{Consumer, MessageHandler};
use crate::error::SupervisorError;
use crate::topology::declare_all;

/// A function returned by [`start_supervisor`] that stops every consumer
/// and tears down its connections when called. Idempotent.
pub struct StopFn {
    inner: Arc<SupervisorInner>,
}

impl StopFn {
    pub async fn stop(&self) {
        self.inner.stop().await;
    }
}

struct SupervisorInner {
    stopping: AtomicBool,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    specs: Mutex<Vec<Spec>>,
    connections: HashMap<String, Connection>,
}

impl SupervisorInner {
    async fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.watchdog.lock().await.take() {
            handle.abort();
        }
        for spec in self.specs.lock().await.iter() {
            spec.consumer.kill().await;
        }
        for conn in self.connections.values() {
            let _ = conn.close(200, "supervisor shutdown").await;
        }
    }
}

struct Spec {
    consumer: Arc<Consumer>,
    connection_name: String,
    queue: String,
    number: u64,
    workers: usize,
    prefetch_count: u16,
    auto_ack: bool,
    no_local: bool,
    exclusive: bool,
    handler: Arc<dyn MessageHandler>,
}

/// Opens every connection named in `config.connections`, declares the full
/// topology on each, starts one consumer per entry in `config.consumers`
/// (looked up in `handlers` by the same key) and returns a handle whose
/// `stop()` tears everything down. `restart_interval` governs how often the
/// watchdog checks consumer liveness.
pub async fn start_supervisor(
    client_name: &str,
    config: Config,
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    restart_interval: Duration,
) -> Result<StopFn, SupervisorError> {
    let mut connections = HashMap::new();
    for (name, conn_cfg) in &config.connections {
        let conn = open_connection(name, conn_cfg, client_name).await?;
        connections.insert(name.clone(), conn);
    }

    // Declare topology once per connection on a scratch channel, then close
    // it — consumers and restarts each open their own channel.
    for (name, conn) in &connections {
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| SupervisorError::Connection(crate::error::ConnectionOpenError {
                name: name.clone(),
                cause: e.to_string(),
            }))?;
        declare_all(&channel, &config).await?;
        let _ = channel.close(200, "topology declared").await;
    }

    let mut specs = Vec::new();
    let mut number = 0u64;
    for (consumer_name, consumer_cfg) in &config.consumers {
        let Some(conn) = connections.get(&consumer_cfg.connection) else {
            return Err(SupervisorError::UnknownConnection(
                consumer_cfg.connection.clone(),
                consumer_name.clone(),
            ));
        };
        let Some(handler) = handlers.get(consumer_name).cloned() else {
            log::warn!("no handler registered for consumer \"{consumer_name}\", skipping");
            continue;
        };
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| SupervisorError::Connection(crate::error::ConnectionOpenError {
                name: consumer_cfg.connection.clone(),
                cause: e.to_string(),
            }))?;
        number += 1;
        let consumer = Arc::new(Consumer::new(
            consumer_name.clone(),
            channel,
            consumer_cfg.queue.name.clone(),
            number,
            consumer_cfg.workers,
            consumer_cfg.prefetch_count,
            consumer_cfg.options.auto_ack,
            consumer_cfg.options.no_local,
            consumer_cfg.options.exclusive,
            handler.clone(),
        ));
        specs.push(Spec {
            consumer,
            connection_name: consumer_cfg.connection.clone(),
            queue: consumer_cfg.queue.name.clone(),
            number,
            workers: consumer_cfg.workers,
            prefetch_count: consumer_cfg.prefetch_count,
            auto_ack: consumer_cfg.options.auto_ack,
            no_local: consumer_cfg.options.no_local,
            exclusive: consumer_cfg.options.exclusive,
            handler,
        });
    }

    for spec in &specs {
        spec.consumer.run().await.map_err(|e| {
            SupervisorError::Connection(crate::error::ConnectionOpenError {
                name: spec.connection_name.clone(),
                cause: e.to_string(),
            })
        })?;
    }

    let inner = Arc::new(SupervisorInner {
        stopping: AtomicBool::new(false),
        watchdog: Mutex::new(None),
        specs: Mutex::new(specs),
        connections,
    });

    let watchdog_inner = inner.clone();
    let watchdog = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(restart_interval);
        loop {
            ticker.tick().await;
            if watchdog_inner.stopping.load(Ordering::Acquire) {
                break;
            }
            let mut specs = watchdog_inner.specs.lock().await;
            for spec in specs.iter_mut() {
                if spec.consumer.alive() {
                    continue;
                }
                let reason = spec
                    .consumer
                    .exit_reason()
                    .await
                    .unwrap_or_else(|| "unknown".to_string());
                log::warn!(
                    "rabbitmq consumer {} on connection {} died ({reason}), restarting",
                    spec.consumer.name(),
                    spec.connection_name
                );
                let Some(conn) = watchdog_inner.connections.get(&spec.connection_name) else {
                    log::error!(
                        "rabbitmq cannot restart consumer {}: connection {} no longer tracked",
                        spec.consumer.name(),
                        spec.connection_name
                    );
                    continue;
                };
                let channel = match conn.create_channel().await {
                    Ok(channel) => channel,
                    Err(e) => {
                        log::error!(
                            "rabbitmq failed to open a channel to restart consumer {}: {e}",
                            spec.consumer.name()
                        );
                        continue;
                    }
                };
                spec.number += 1;
                let replacement = Arc::new(Consumer::new(
                    spec.consumer.name().to_string(),
                    channel,
                    spec.queue.clone(),
                    spec.number,
                    spec.workers,
                    spec.prefetch_count,
                    spec.auto_ack,
                    spec.no_local,
                    spec.exclusive,
                    spec.handler.clone(),
                ));
                if let Err(e) = replacement.run().await {
                    log::error!(
                        "rabbitmq failed to restart consumer {}: {e}",
                        spec.consumer.name()
                    );
                    continue;
                }
                spec.consumer = replacement;
            }
        }
    });
    *inner.watchdog.lock().await = Some(watchdog);

    Ok(StopFn { inner })
}

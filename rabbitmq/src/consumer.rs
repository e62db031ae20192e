//! Consumer: one task per consumer, draining deliveries into a fixed-size
//! worker pool whose saturation is the back-pressure mechanism that keeps
//! in-flight handler invocations at or below `workers`.
//!
//! The task exits on a dying signal (graceful shutdown, no error recorded),
//! on the broker closing the channel, or on a delivery-stream error; the
//! latter two set `exit_reason()` so a caller can tell why a dead consumer
//! died.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::error::ConsumerError;
use crate::message::Message;

/// User-supplied message handler. `handle` must ack/nack/reject the
/// delivery — the runtime never auto-acks unless `auto_ack` was set on the
/// consumer's options (in which case no handler call happens at all,
/// since the broker never holds the delivery outstanding). `close` is
/// called exactly once, on graceful shutdown only.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message);
    async fn close(&self) {}
}

/// Function-adapter so a closure can be used as a handler without a
/// user-defined type.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn handle(&self, message: Message) {
        (self.0)(message).await
    }
}

pub struct Consumer {
    name: String,
    channel: Channel,
    queue: String,
    consumer_tag: String,
    auto_ack: bool,
    no_local: bool,
    exclusive: bool,
    workers: usize,
    prefetch_count: u16,
    handler: Arc<dyn MessageHandler>,
    alive: Arc<AtomicBool>,
    dying: Arc<Notify>,
    dead: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
    exit_reason: Arc<Mutex<Option<ConsumerError>>>,
}

impl Consumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        channel: Channel,
        queue: impl Into<String>,
        number: u64,
        workers: usize,
        prefetch_count: u16,
        auto_ack: bool,
        no_local: bool,
        exclusive: bool,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let name = name.into();
        let consumer_tag = format!("rabbitmq-{name}-{number}");
        Self {
            name,
            channel,
            queue: queue.into(),
            consumer_tag,
            auto_ack,
            no_local,
            exclusive,
            workers: workers.max(1),
            prefetch_count,
            handler,
            alive: Arc::new(AtomicBool::new(false)),
            dying: Arc::new(Notify::new()),
            dead: Arc::new(Notify::new()),
            task: Mutex::new(None),
            exit_reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// The reason the consume loop last exited, if it has exited and the
    /// exit wasn't a graceful `kill()`. `None` while the consumer is alive,
    /// and stays `None` across a graceful shutdown.
    pub async fn exit_reason(&self) -> Option<String> {
        self.exit_reason.lock().await.as_ref().map(|e| e.to_string())
    }

    /// Starts the consume loop in the background. Non-blocking.
    pub async fn run(&self) -> Result<(), ConsumerError> {
        self.channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| ConsumerError::ConsumerRegistrationFailed(e.to_string()))?;

        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_ack: self.auto_ack,
                    exclusive: self.exclusive,
                    no_local: self.no_local,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::ConsumerRegistrationFailed(e.to_string()))?;

        self.alive.store(true, Ordering::Release);

        let permits = Arc::new(Semaphore::new(self.workers));
        let workers = self.workers as u32;
        let handler = self.handler.clone();
        let alive = self.alive.clone();
        let dying = self.dying.clone();
        let dead = self.dead.clone();
        let channel = self.channel.clone();
        let name = self.name.clone();
        let exit_reason = self.exit_reason.clone();

        let join = tokio::spawn(async move {
            let mut stream = consumer.into_stream();
            loop {
                tokio::select! {
                    biased;
                    _ = dying.notified() => {
                        log::info!("rabbitmq consumer {name} dying, draining worker pool");
                        // Acquiring every permit blocks until all in-flight jobs return theirs.
                        let _ = permits.acquire_many(workers).await;
                        handler.close().await;
                        break;
                    }
                    delivery = stream.next() => {
                        match delivery {
                            None => {
                                log::warn!("rabbitmq consumer {name} channel closed by broker");
                                *exit_reason.lock().await = Some(ConsumerError::ChannelClosed(
                                    "consumer stream ended".to_string(),
                                ));
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("rabbitmq consumer {name} delivery error: {e}");
                                *exit_reason.lock().await = Some(ConsumerError::InternalChannelClosed);
                                break;
                            }
                            Some(Ok(delivery)) => {
                                let permit = match permits.clone().acquire_owned().await {
                                    Ok(p) => p,
                                    Err(_) => break,
                                };
                                let handler = handler.clone();
                                tokio::spawn(async move {
                                    let message = Message::new(delivery);
                                    handler.handle(message).await;
                                    drop(permit);
                                });
                            }
                        }
                    }
                }
            }
            alive.store(false, Ordering::Release);
            if let Err(e) = channel.close(200, "consumer shutdown").await {
                log::warn!("rabbitmq consumer {name} failed to close channel cleanly: {e}");
            }
            dead.notify_waiters();
        });

        *self.task.lock().await = Some(join);
        Ok(())
    }

    /// Signals the consumer to stop and blocks until it has drained its
    /// worker pool and closed its channel.
    pub async fn kill(&self) {
        self.dying.notify_waiters();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

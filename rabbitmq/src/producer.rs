//! Producer: an asynchronous emit pipeline with reconnect, lazy exchange
//! declaration and bounded error fan-out. Holds a single `RwLock`-guarded
//! channel: reconnect is the writer, publish is the reader, so in-flight
//! publishes and a reconnect attempt never race on the same channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lapin::{Channel, Connection, ConnectionProperties};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::Connection as ConnectionConfig;
use crate::connection::open_connection;
use crate::delay::DelayEngine;
use crate::error::ProducerError;
use crate::message::{Publishing, PublishingError};
use crate::serializer::JsonMarshaller;
use crate::topology::ExchangeDeclarer;

const EMIT_CAPACITY: usize = 250;
const EMIT_ERR_CAPACITY: usize = 250;
const PUBLISH_RETRY_ATTEMPTS: u32 = 10;
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(10);
const RECONNECT_SLEEP: Duration = Duration::from_secs(1);

struct Live {
    connection: Connection,
    channel: Channel,
}

/// Asynchronous producer: `emit`/`emit_err` drive the fire-and-forget path,
/// `send` is the synchronous variant. Holds exactly one AMQP channel,
/// guarded by an `RwLock` so publishes (readers) can run concurrently while
/// a reconnect (writer) is between connections.
pub struct Producer {
    live: Arc<RwLock<Live>>,
    declarer: Arc<ExchangeDeclarer>,
    delay: Arc<DelayEngine>,
    config: Arc<crate::config::Config>,
    marshaller: JsonMarshaller,
    emit_tx: mpsc::Sender<Publishing>,
    emit_err_rx: Mutex<mpsc::Receiver<PublishingError>>,
    emit_err_tx: mpsc::Sender<PublishingError>,
    closing: Arc<Notify>,
    closed: AtomicBool,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Producer {
    pub async fn new(
        name: &str,
        cfg: &ConnectionConfig,
        client_name: &str,
        config: crate::config::Config,
    ) -> Result<Self, ProducerError> {
        let connection = open_connection(name, cfg, client_name).await?;
        let channel = connection.create_channel().await.map_err(ProducerError::Publish)?;

        let live = Arc::new(RwLock::new(Live { connection, channel }));
        let config = Arc::new(config);
        let declarer = ExchangeDeclarer::new();
        let delay = Arc::new(DelayEngine::new());

        let (emit_tx, emit_rx) = mpsc::channel(EMIT_CAPACITY);
        let (emit_err_tx, emit_err_rx) = mpsc::channel(EMIT_ERR_CAPACITY);
        let closing = Arc::new(Notify::new());

        let loop_handle = spawn_loop(
            name.to_string(),
            cfg.clone(),
            client_name.to_string(),
            live.clone(),
            declarer.clone(),
            delay.clone(),
            config.clone(),
            emit_rx,
            emit_err_tx.clone(),
            closing.clone(),
        );

        Ok(Self {
            live,
            declarer,
            delay,
            config,
            marshaller: JsonMarshaller,
            emit_tx,
            emit_err_rx: Mutex::new(emit_err_rx),
            emit_err_tx,
            closing,
            closed: AtomicBool::new(false),
            loop_handle: Mutex::new(Some(loop_handle)),
        })
    }

    /// Enqueues `publishing` for asynchronous delivery. Panics if called
    /// after [`Producer::close`] — posting to a closed producer is a
    /// programming error, matching the source contract.
    pub async fn emit(&self, publishing: Publishing) {
        if self.closed.load(Ordering::Acquire) {
            panic!("rabbitmq: emit called after producer close");
        }
        self.emit_tx
            .send(publishing)
            .await
            .expect("producer loop task is alive while the producer itself is");
    }

    /// Drains one pending publish error, if any is currently buffered.
    /// Overflow drops the newest error rather than blocking the producer
    /// loop — see the error-handling notes on [`crate::error::ProducerError`].
    pub async fn try_recv_err(&self) -> Option<PublishingError> {
        self.emit_err_rx.lock().await.try_recv().ok()
    }

    /// Builds a [`Publishing`] by marshalling `value` with the producer's
    /// configured marshaller, setting the resulting content type.
    pub fn marshal<T: Serialize>(
        &self,
        exchange: impl Into<String>,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Publishing, ProducerError> {
        let data = self.marshaller.marshal(value)?;
        Ok(Publishing::new(exchange, key, data))
    }

    /// Synchronous publish: declares topology as needed and publishes with
    /// a bounded retry. `publishing.data` is expected to already be
    /// wire-format bytes — build it with [`Producer::marshal`] or
    /// hand-construct it for a non-JSON payload.
    pub async fn send(&self, publishing: Publishing) -> Result<(), ProducerError> {
        send_once(
            &self.live,
            &self.declarer,
            &self.delay,
            &self.config,
            &self.marshaller,
            publishing,
        )
        .await
    }

    /// Closes the emit channel, waits for the loop to drain, then closes
    /// the channel and connection. `emit_err` is closed without being
    /// drained — late readers observe a closed channel, not pending errors.
    pub async fn close(&self) -> Result<(), ProducerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.closing.notify_waiters();
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        let live = self.live.read().await;
        live.channel
            .close(200, "producer shutdown")
            .await
            .map_err(ProducerError::Publish)?;
        live.connection
            .close(200, "producer shutdown")
            .await
            .map_err(ProducerError::Publish)?;
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_loop(
    name: String,
    cfg: ConnectionConfig,
    client_name: String,
    live: Arc<RwLock<Live>>,
    declarer: Arc<ExchangeDeclarer>,
    delay: Arc<DelayEngine>,
    config: Arc<crate::config::Config>,
    mut emit_rx: mpsc::Receiver<Publishing>,
    emit_err_tx: mpsc::Sender<PublishingError>,
    closing: Arc<Notify>,
) -> JoinHandle<()> {
    let marshaller = JsonMarshaller;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = closing.notified() => {
                    break;
                }
                publishing = emit_rx.recv() => {
                    let Some(publishing) = publishing else { break };
                    let result = send_once(&live, &declarer, &delay, &config, &marshaller, publishing.clone()).await;
                    if let Err(e) = result {
                        log::error!("rabbitmq producer {name} failed to publish: {e}");
                        let _ = emit_err_tx.try_send(PublishingError {
                            publishing,
                            error: e.to_string(),
                        });
                        if matches!(
                            e,
                            ProducerError::Publish(_)
                                | ProducerError::Topology(_)
                                | ProducerError::RetriesExhausted(_)
                        ) {
                            reconnect(&name, &cfg, &client_name, &live).await;
                        }
                    }
                }
            }
        }
    })
}

async fn reconnect(name: &str, cfg: &ConnectionConfig, client_name: &str, live: &Arc<RwLock<Live>>) {
    log::warn!("rabbitmq producer {name} reconnecting");
    let identifier = format!("{client_name}/{}", env!("CARGO_PKG_VERSION"));
    loop {
        let props = ConnectionProperties::default().with_connection_name(identifier.clone().into());
        match Connection::connect(&cfg.dsn, props).await {
            Ok(connection) => match connection.create_channel().await {
                Ok(channel) => {
                    let mut guard = live.write().await;
                    *guard = Live { connection, channel };
                    log::info!("rabbitmq producer {name} reconnected");
                    return;
                }
                Err(e) => log::error!("rabbitmq producer {name} failed to open channel: {e}"),
            },
            Err(e) => log::error!("rabbitmq producer {name} failed to reconnect: {e}"),
        }
        sleep(RECONNECT_SLEEP).await;
    }
}

async fn send_once(
    live: &Arc<RwLock<Live>>,
    declarer: &Arc<ExchangeDeclarer>,
    delay: &Arc<DelayEngine>,
    config: &crate::config::Config,
    marshaller: &JsonMarshaller,
    mut publishing: Publishing,
) -> Result<(), ProducerError> {
    if publishing.delay > Duration::ZERO {
        let guard = live.read().await;
        delay.ensure_declared(&guard.channel).await?;
        delay
            .declare_target_binding(&guard.channel, &publishing.key)
            .await?;
        drop(guard);
        let (routing_key, exchange) = crate::delay::calculate_routing_key(publishing.delay, &publishing.key);
        publishing.key = routing_key;
        publishing.exchange = exchange;
    } else if !publishing.exchange.is_empty() {
        let guard = live.read().await;
        declarer
            .declare_once(&guard.channel, config, &publishing.exchange)
            .await?;
    }

    let props = publishing.basic_properties(marshaller.name());

    let mut last_err = None;
    for attempt in 0..PUBLISH_RETRY_ATTEMPTS {
        if attempt > 0 {
            sleep(PUBLISH_RETRY_DELAY).await;
        }
        let guard = live.read().await;
        let result = guard
            .channel
            .basic_publish(
                &publishing.exchange,
                &publishing.key,
                lapin::options::BasicPublishOptions::default(),
                &publishing.data,
                props.clone(),
            )
            .await;
        drop(guard);
        match result {
            Ok(confirm) => match confirm.await {
                Ok(_) => return Ok(()),
                Err(e) => last_err = Some(ProducerError::Publish(e)),
            },
            Err(e) => last_err = Some(ProducerError::Publish(e)),
        }
    }
    log::error!(
        "rabbitmq publish to {}/{} exhausted {PUBLISH_RETRY_ATTEMPTS} attempts, last error: {}",
        publishing.exchange,
        publishing.key,
        last_err.expect("at least one publish attempt runs")
    );
    Err(ProducerError::RetriesExhausted(PUBLISH_RETRY_ATTEMPTS))
}

//! Redis pub/sub bus
//!
//! Publishing sends the JSON event to `board:{slug}:channel`. Each process
//! runs one listener task that pattern-subscribes to every board channel and
//! hands incoming events to its [`LocalBus`], which fans them out to the
//! sessions of that process. The writer's own process receives its events
//! the same way, so every session sees each event exactly once.
//!
//! If the pub/sub connection drops, the listener reconnects with capped
//! exponential backoff. Events published during the outage are lost; the
//! store is unaffected and viewers recover by re-reading history.

use std::time::Duration;

use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BoardEvent, Bus, BusError, LocalBus, Registration};
use crate::store::BoardId;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Cross-process bus backed by Redis pub/sub
///
/// Dropping the bus stops its listener task.
pub struct RedisBus {
    conn: MultiplexedConnection,
    local: LocalBus,
    shutdown: CancellationToken,
    subscribed: watch::Receiver<bool>,
    listener: Option<JoinHandle<()>>,
}

impl RedisBus {
    /// Connect and start the listener task
    pub async fn connect(url: &str, channel_capacity: usize) -> Result<Self, BusError> {
        let publish_err = |e: RedisError| BusError::Publish(e.to_string());

        let client = Client::open(url).map_err(publish_err)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(publish_err)?;

        let local = LocalBus::with_capacity(channel_capacity);
        let shutdown = CancellationToken::new();
        let (subscribed_tx, subscribed) = watch::channel(false);
        let listener = tokio::spawn(run_listener(
            client,
            local.clone(),
            subscribed_tx,
            shutdown.clone(),
        ));

        tracing::info!(url = url, "Redis bus started");

        Ok(Self {
            conn,
            local,
            shutdown,
            subscribed,
            listener: Some(listener),
        })
    }

    /// Connect to `REDIS_URL`, or the local default
    pub async fn from_env(channel_capacity: usize) -> Result<Self, BusError> {
        let url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| crate::store::redis::DEFAULT_REDIS_URL.to_string());
        Self::connect(&url, channel_capacity).await
    }

    /// The process-local fan-out fed by the listener
    pub fn local(&self) -> &LocalBus {
        &self.local
    }

    /// Whether the listener currently holds its pattern subscription
    pub fn is_subscribed(&self) -> bool {
        *self.subscribed.borrow()
    }

    /// Wait until the listener holds its pattern subscription
    ///
    /// Events published before then are not delivered to this process.
    pub async fn wait_subscribed(&self) {
        let mut subscribed = self.subscribed.clone();
        // Err means the listener is gone; there is nothing left to wait for.
        let _ = subscribed.wait_for(|ready| *ready).await;
    }

    /// Stop the listener task and wait for it to finish
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(listener) = self.listener.take() {
            if let Err(e) = listener.await {
                tracing::warn!(error = %e, "Redis bus listener ended abnormally");
            }
        }
    }
}

impl Drop for RedisBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Bus for RedisBus {
    async fn publish(&self, event: BoardEvent) -> Result<(), BusError> {
        let payload = serde_json::to_string(&event)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(event.board.channel(), payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    fn register(&self, board: &BoardId) -> Registration {
        self.local.register(board)
    }

    fn subscriber_count(&self, board: &BoardId) -> usize {
        self.local.subscriber_count(board)
    }

    fn accepts_store_announcements(&self) -> bool {
        true
    }
}

async fn run_listener(
    client: Client,
    local: LocalBus,
    subscribed: watch::Sender<bool>,
    shutdown: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = listen(&client, &local, &subscribed, &mut backoff) => match result {
                Ok(()) => tracing::warn!("Redis bus subscription ended"),
                Err(e) => tracing::warn!(error = %e, "Redis bus subscription failed"),
            },
        }
        subscribed.send_replace(false);

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    tracing::debug!("Redis bus listener stopped");
}

async fn listen(
    client: &Client,
    local: &LocalBus,
    subscribed: &watch::Sender<bool>,
    backoff: &mut Duration,
) -> Result<(), RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.psubscribe(BoardId::channel_pattern()).await?;
    *backoff = INITIAL_BACKOFF;
    subscribed.send_replace(true);
    tracing::info!(pattern = %BoardId::channel_pattern(), "Subscribed to board channels");

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping non-text bus message");
                continue;
            }
        };

        let event: BoardEvent = match serde_json::from_str(&payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed bus message");
                continue;
            }
        };

        if BoardId::from_channel(msg.get_channel_name()).as_ref() != Some(&event.board) {
            tracing::warn!(
                channel = msg.get_channel_name(),
                board = %event.board,
                "Dropping bus message published on a foreign channel"
            );
            continue;
        }

        local.deliver(event);
    }

    Ok(())
}

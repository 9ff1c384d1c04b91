//! Push subscriptions with automatic resubscribe.
//!
//! A subscription owns a dedicated connection. One pump task is the sole
//! reader of that connection; key changes are written through the shared
//! writer. The desired key set is kept locally so that after a reconnect the
//! pump can resubscribe with exactly the current set, without replaying the
//! individual add and remove requests.

use crate::connection::{Connection, ConnectionConfig, TcpFrameReader, TcpFrameWriter};
use crate::dataset::decode_response;
use crate::error::{ClientError, ErrorKind};
use openplant_protocol::props::key;
use openplant_protocol::{IndexKeys, Indexes, Record, Request};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Connecting,
    Running,
    /// `close` was requested; the pump is stopping.
    Draining,
    Closed,
}

/// Delivered to the subscriber, in server order.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Data { rows: Vec<Record>, snapshot: bool },
    Error { kind: ErrorKind, message: String },
    /// The pump reconnected and resubscribed.
    Recovered,
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Ask the server for current values before updates.
    pub snapshot: bool,
    pub reconnect_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            snapshot: true,
            reconnect_interval: Duration::from_secs(20),
            channel_capacity: 256,
        }
    }
}

impl SubscribeOptions {
    pub fn with_snapshot(mut self, snapshot: bool) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }
}

struct Shared {
    table: String,
    key: String,
    options: SubscribeOptions,
    config: ConnectionConfig,
    keys: parking_lot::Mutex<IndexKeys>,
    /// Held across a key change and its send, and across a resubscribe from
    /// reading the key set until the writer is installed.
    changes: tokio::sync::Mutex<()>,
    /// `None` while reconnecting.
    writer: parking_lot::Mutex<Option<TcpFrameWriter>>,
    reqid: AtomicI64,
    state: watch::Sender<SubscriptionState>,
}

impl Shared {
    fn set_state(&self, state: SubscriptionState) {
        self.state.send_replace(state);
    }

    fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Full subscribe request carrying the current key set.
    fn subscribe_request(&self) -> Request {
        let keys = self.keys.lock().clone();
        Request::select(&self.table)
            .with_async(true)
            .with_snapshot(self.options.snapshot)
            .with_indexes(Indexes::new(self.key.clone(), keys))
    }

    /// Adds (`Subscribe=1`) or removes (`Subscribe=0`) keys on the live session.
    fn incremental_request(&self, delta: IndexKeys, add: bool) -> Request {
        Request::select(&self.table)
            .with_async(true)
            .with_subscribe(add)
            .with_indexes(Indexes::new(self.key.clone(), delta))
    }

    async fn send(&self, writer: &TcpFrameWriter, mut request: Request) -> Result<(), ClientError> {
        request.set_reqid(self.reqid.fetch_add(1, Ordering::Relaxed));
        let timeout = self.config.request_timeout;
        tokio::time::timeout(timeout, async { writer.lock().await.write_request(&request).await })
            .await
            .map_err(|_| ClientError::Timeout)?
    }
}

/// A running subscription.
pub struct Subscription {
    shared: Arc<Shared>,
    events: mpsc::Receiver<SubscriptionEvent>,
    shutdown: watch::Sender<bool>,
    pump: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Sends the subscribe request on `conn` and starts the pump.
    pub async fn start(
        conn: Connection,
        table: &str,
        key_column: &str,
        keys: IndexKeys,
        options: SubscribeOptions,
    ) -> Result<Self, ClientError> {
        let config = conn.config().clone();
        let (state, _) = watch::channel(SubscriptionState::Idle);
        let shared = Arc::new(Shared {
            table: table.to_string(),
            key: key_column.to_string(),
            options,
            config,
            keys: parking_lot::Mutex::new(keys),
            changes: tokio::sync::Mutex::new(()),
            writer: parking_lot::Mutex::new(None),
            reqid: AtomicI64::new(1),
            state,
        });

        shared.set_state(SubscriptionState::Connecting);
        let (reader, writer) = conn.into_parts()?;
        shared.send(&writer, shared.subscribe_request()).await?;
        *shared.writer.lock() = Some(writer);
        shared.set_state(SubscriptionState::Running);
        tracing::info!(table, key = key_column, "subscription started");

        let (tx, events) = mpsc::channel(shared.options.channel_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pump = tokio::spawn(run(shared.clone(), reader, tx, shutdown_rx));
        Ok(Self {
            shared,
            events,
            shutdown,
            pump: Some(pump),
        })
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.state()
    }

    /// A receiver that tracks state changes.
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.shared.state.subscribe()
    }

    pub fn table(&self) -> &str {
        &self.shared.table
    }

    pub fn key_column(&self) -> &str {
        &self.shared.key
    }

    /// The desired key set.
    pub fn keys(&self) -> IndexKeys {
        self.shared.keys.lock().clone()
    }

    /// Waits for the next event; `None` once the pump has stopped.
    pub async fn next_event(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<SubscriptionEvent> {
        self.events.try_recv().ok()
    }

    pub async fn add_keys(&self, keys: impl Into<IndexKeys>) -> Result<(), ClientError> {
        self.change_keys(keys.into(), true).await
    }

    pub async fn remove_keys(&self, keys: impl Into<IndexKeys>) -> Result<(), ClientError> {
        self.change_keys(keys.into(), false).await
    }

    async fn change_keys(&self, delta: IndexKeys, add: bool) -> Result<(), ClientError> {
        if matches!(
            self.state(),
            SubscriptionState::Draining | SubscriptionState::Closed
        ) {
            return Err(ClientError::SubscriptionClosed);
        }
        let _changing = self.shared.changes.lock().await;
        {
            let mut keys = self.shared.keys.lock();
            if add {
                keys.union_with(&delta)?;
            } else {
                keys.subtract(&delta)?;
            }
        }
        let writer = self.shared.writer.lock().clone();
        let Some(writer) = writer else {
            tracing::debug!("reconnecting; key change applies on resubscribe");
            return Ok(());
        };
        let request = self.shared.incremental_request(delta, add);
        if let Err(e) = self.shared.send(&writer, request).await {
            tracing::warn!(error = %e, "key change not sent; applies on resubscribe");
        }
        Ok(())
    }

    /// Stops the pump and closes the connection.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.shared.set_state(SubscriptionState::Draining);
        self.events.close();
        let _ = self.shutdown.send(true);
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
        tracing::info!(table = %self.shared.table, "subscription closed");
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run(
    shared: Arc<Shared>,
    mut reader: TcpFrameReader,
    events: mpsc::Sender<SubscriptionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut expect_snapshot = shared.options.snapshot;
    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => break,
            message = reader.read_message() => message,
        };
        let failure = match message.and_then(|m| Ok(decode_response(m.freeze())?)) {
            Ok((head, result)) if head.errno() == 0 => {
                if result.is_empty() {
                    continue;
                }
                let snapshot = expect_snapshot || head.props.get_int(key::SNAPSHOT) == Some(1);
                expect_snapshot = false;
                let event = SubscriptionEvent::Data {
                    rows: result.rows,
                    snapshot,
                };
                if events.send(event).await.is_err() {
                    break;
                }
                continue;
            }
            Ok((head, _)) => ClientError::Server {
                errno: head.errno(),
                message: head.error().to_string(),
            },
            Err(e) => e,
        };

        tracing::warn!(table = %shared.table, error = %failure, "subscription interrupted");
        let event = SubscriptionEvent::Error {
            kind: failure.kind(),
            message: failure.to_string(),
        };
        if events.send(event).await.is_err() {
            break;
        }

        drop_writer(&shared).await;
        shared.set_state(SubscriptionState::Connecting);
        match reconnect(&shared, &mut shutdown).await {
            Some(fresh) => {
                reader = fresh;
                expect_snapshot = shared.options.snapshot;
                shared.set_state(SubscriptionState::Running);
                tracing::info!(table = %shared.table, "subscription recovered");
                if events.send(SubscriptionEvent::Recovered).await.is_err() {
                    break;
                }
            }
            None => break,
        }
    }

    drop_writer(&shared).await;
    shared.set_state(SubscriptionState::Closed);
}

async fn drop_writer(shared: &Shared) {
    let writer = shared.writer.lock().take();
    if let Some(writer) = writer {
        let _ = writer.lock().await.shutdown().await;
    }
}

/// Redials until resubscribed; `None` if shut down first.
async fn reconnect(shared: &Shared, shutdown: &mut watch::Receiver<bool>) -> Option<TcpFrameReader> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return None,
            _ = tokio::time::sleep(shared.options.reconnect_interval) => {}
        }
        tokio::select! {
            _ = shutdown.changed() => return None,
            res = resubscribe(shared) => match res {
                Ok(reader) => return Some(reader),
                Err(e) => tracing::warn!(error = %e, "resubscribe failed"),
            },
        }
    }
}

async fn resubscribe(shared: &Shared) -> Result<TcpFrameReader, ClientError> {
    let conn = Connection::connect(shared.config.clone()).await?;
    let (reader, writer) = conn.into_parts()?;
    let _changing = shared.changes.lock().await;
    shared.send(&writer, shared.subscribe_request()).await?;
    *shared.writer.lock() = Some(writer);
    Ok(reader)
}

/// connector.rs – Push-first transport with a timed fallback to polling.
///
/// State machine:
///
/// ```text
///   Idle ─▶ AttemptingPush ─▶ Streaming ─┐
///     │            │                     │ error / end of stream
///     │            └─ timeout / error ───┤
///     └──── no push endpoint ────────────┴─▶ Polling (terminal)
/// ```
///
/// Both transports feed one callback through the same normalizer, and one
/// `ConnectionHandle` tears everything down.
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::models::{LiveUpdate, TransportState};
use crate::normalizer::{normalize_poll_row, normalize_stream_message};

/// Raw message bodies from a push endpoint.
pub type RawMessageStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait PushSource: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Open the stream. Dropping the returned stream closes the connection.
    async fn open(&self) -> Result<RawMessageStream>;
}

#[async_trait]
pub trait PollSource: Send + Sync {
    /// Latest batch of raw snapshot rows.
    async fn fetch_latest(&self) -> Result<Vec<Value>>;
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectorConfig {
    /// Covers both the connection attempt and the first usable message.
    pub push_grace: Duration,
    pub poll_interval: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            push_grace: Duration::from_secs(3),
            poll_interval: Duration::from_secs(2),
        }
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

pub struct Connector {
    push: Option<Arc<dyn PushSource>>,
    poll: Arc<dyn PollSource>,
    config: ConnectorConfig,
}

impl Connector {
    pub fn new(
        push: Option<Arc<dyn PushSource>>,
        poll: Arc<dyn PollSource>,
        config: ConnectorConfig,
    ) -> Self {
        Self { push, poll, config }
    }

    /// Start delivering updates to `on_update` from a background task.
    /// Must be called inside a tokio runtime.
    pub fn connect<F>(self, on_update: F) -> ConnectionHandle
    where
        F: FnMut(LiveUpdate) + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(TransportState::Idle);
        let shared = Arc::new(Shared {
            callback: Mutex::new(Some(Box::new(on_update))),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
            state_tx,
        });

        let task = tokio::spawn(run(self.push, self.poll, self.config, Arc::clone(&shared)));
        *shared.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        ConnectionHandle { shared, state_rx }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

type Callback = Box<dyn FnMut(LiveUpdate) + Send>;

struct Shared {
    callback: Mutex<Option<Callback>>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    state_tx: watch::Sender<TransportState>,
}

impl Shared {
    fn set_state(&self, state: TransportState) {
        if !self.closed.load(Ordering::SeqCst) {
            self.state_tx.send_replace(state);
        }
    }

    /// Returns `false` once the connection has been torn down.
    fn emit(&self, update: LiveUpdate) -> bool {
        let mut slot = self.callback.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(cb) => {
                cb(update);
                true
            }
            None => false,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Owner of a running connection. Dropping it disconnects.
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<TransportState>,
}

impl ConnectionHandle {
    #[allow(dead_code)]
    pub fn state(&self) -> TransportState {
        *self.state_rx.borrow()
    }

    /// Receiver that wakes on every transport state change.
    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.state_rx.clone()
    }

    #[allow(dead_code)]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Tear down the connection. Safe to call any number of times; only the
    /// first call releases anything. Once it returns no callback will run.
    /// Must not be called from inside the update callback.
    pub fn disconnect(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Waits for an in-flight callback, then blocks every later one.
        self.shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = self
            .shared
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        info!("Live connector disconnected");
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ---------------------------------------------------------------------------
// Transport loop
// ---------------------------------------------------------------------------

enum PushOutcome {
    Fallback(String),
    Closed,
}

async fn run(
    push: Option<Arc<dyn PushSource>>,
    poll: Arc<dyn PollSource>,
    config: ConnectorConfig,
    shared: Arc<Shared>,
) {
    match push {
        Some(push) => {
            shared.set_state(TransportState::AttemptingPush);
            info!("Connecting to push stream: {}", push.endpoint());
            match attempt_push(push.as_ref(), config.push_grace, &shared).await {
                PushOutcome::Closed => return,
                PushOutcome::Fallback(reason) => {
                    warn!("Push stream unavailable ({reason}) – falling back to polling");
                }
            }
        }
        None => info!("No push stream configured – polling"),
    }

    if shared.is_closed() {
        return;
    }
    shared.set_state(TransportState::Polling);
    poll_forever(poll.as_ref(), config.poll_interval, &shared).await;
}

/// Drive the push path. The stream is dropped before this returns, so a
/// fallback never overlaps with a live stream.
async fn attempt_push(push: &dyn PushSource, grace: Duration, shared: &Shared) -> PushOutcome {
    let deadline = Instant::now() + grace;

    let mut stream = match timeout_at(deadline, push.open()).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return PushOutcome::Fallback(format!("connect failed: {e:#}")),
        Err(_) => return PushOutcome::Fallback("connect timed out".into()),
    };

    // Grace window: wait for the first message that normalizes.
    loop {
        match timeout_at(deadline, stream.next()).await {
            Err(_) => return PushOutcome::Fallback("no update within grace window".into()),
            Ok(None) => return PushOutcome::Fallback("stream closed before first update".into()),
            Ok(Some(Err(e))) => return PushOutcome::Fallback(format!("stream error: {e:#}")),
            Ok(Some(Ok(text))) => {
                let Some(update) = normalize_stream_message(&text, Utc::now()) else {
                    continue;
                };
                shared.set_state(TransportState::Streaming);
                info!("Push stream live");
                if !shared.emit(update) {
                    return PushOutcome::Closed;
                }
                break;
            }
        }
    }

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(text) => {
                if let Some(update) = normalize_stream_message(&text, Utc::now()) {
                    if !shared.emit(update) {
                        return PushOutcome::Closed;
                    }
                }
            }
            Err(e) => return PushOutcome::Fallback(format!("stream error while streaming: {e:#}")),
        }
    }
    PushOutcome::Fallback("stream ended".into())
}

/// Fetch immediately, then on every tick. A failed cycle is logged and the
/// schedule continues.
async fn poll_forever(poll: &dyn PollSource, period: Duration, shared: &Shared) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycle: u64 = 0;

    loop {
        ticker.tick().await;
        if shared.is_closed() {
            return;
        }
        cycle += 1;
        match poll.fetch_latest().await {
            Ok(rows) => {
                let received_at = Utc::now();
                let mut applied = 0usize;
                for row in &rows {
                    if let Some(update) = normalize_poll_row(row, received_at) {
                        if !shared.emit(update) {
                            return;
                        }
                        applied += 1;
                    }
                }
                debug!("Poll cycle {cycle}: {applied}/{} row(s) forwarded", rows.len());
            }
            Err(e) => warn!("Poll cycle {cycle} failed: {e:#}"),
        }
    }
}

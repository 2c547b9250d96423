/// Connector transport tests. Time is paused, so grace windows and poll
/// intervals advance instantly and deterministically.
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

#[path = "../src/models.rs"]
mod models;

#[path = "../src/normalizer.rs"]
mod normalizer;

#[path = "../src/connector.rs"]
mod connector;

use connector::{
    ConnectionHandle, Connector, ConnectorConfig, PollSource, PushSource, RawMessageStream,
};
use models::{LiveUpdate, TransportState};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

enum PushBehavior {
    /// Connects, then replays these items and goes quiet.
    Replay(Vec<Result<String>>),
    /// Connects, replays these items, then the stream ends.
    ReplayThenEnd(Vec<Result<String>>),
    RefuseConnect,
}

struct FakePush {
    behavior: Mutex<Option<PushBehavior>>,
    opens: AtomicUsize,
}

impl FakePush {
    fn new(behavior: PushBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(Some(behavior)),
            opens: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PushSource for FakePush {
    fn endpoint(&self) -> &str {
        "fake://push"
    }

    async fn open(&self) -> Result<RawMessageStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap().take();
        match behavior {
            Some(PushBehavior::Replay(items)) => {
                Ok(Box::pin(stream::iter(items).chain(stream::pending())))
            }
            Some(PushBehavior::ReplayThenEnd(items)) => Ok(Box::pin(stream::iter(items))),
            Some(PushBehavior::RefuseConnect) | None => bail!("connection refused"),
        }
    }
}

struct FakePoll {
    calls: AtomicUsize,
    fail_first: bool,
}

impl FakePoll {
    fn new(fail_first: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PollSource for FakePoll {
    async fn fetch_latest(&self) -> Result<Vec<Value>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_first && n == 1 {
            bail!("HTTP 502");
        }
        Ok(vec![
            json!({ "login_hint": "P", "snapshot": { "equity": 1000.0 + n as f64 } }),
            json!({ "snapshot": { "equity": 1.0 } }),
        ])
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn snapshot_msg(account: &str, equity: f64) -> String {
    json!({
        "type": "positions_snapshot",
        "account": account,
        "positions": [],
        "snapshot": { "equity": equity },
    })
    .to_string()
}

fn config() -> ConnectorConfig {
    ConnectorConfig {
        push_grace: Duration::from_secs(3),
        poll_interval: Duration::from_secs(2),
    }
}

fn start(
    push: Option<Arc<dyn PushSource>>,
    poll: Arc<dyn PollSource>,
) -> (ConnectionHandle, Arc<Mutex<Vec<LiveUpdate>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle =
        Connector::new(push, poll, config()).connect(move |u| sink.lock().unwrap().push(u));
    (handle, seen)
}

fn keys(seen: &Mutex<Vec<LiveUpdate>>) -> Vec<String> {
    seen.lock().unwrap().iter().map(|u| u.account_key.clone()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn falls_back_to_polling_when_push_stays_silent() {
    let push = FakePush::new(PushBehavior::Replay(vec![]));
    let poll = FakePoll::new(false);
    let (handle, seen) = start(Some(push.clone()), poll.clone());

    sleep(Duration::from_millis(2900)).await;
    assert_eq!(handle.state(), TransportState::AttemptingPush);
    assert_eq!(poll.calls(), 0);

    sleep(Duration::from_millis(600)).await;
    assert_eq!(handle.state(), TransportState::Polling);
    assert!(poll.calls() >= 1);
    assert_eq!(keys(&seen), vec!["P"]);
    assert_eq!(push.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn polls_immediately_without_push_endpoint() {
    let poll = FakePoll::new(false);
    let (handle, seen) = start(None, poll.clone());

    sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.state(), TransportState::Polling);
    assert_eq!(poll.calls(), 1);

    sleep(Duration::from_millis(4490)).await;
    assert_eq!(poll.calls(), 3);
    // Rows without a key never reach the callback.
    assert_eq!(keys(&seen), vec!["P", "P", "P"]);
}

#[tokio::test(start_paused = true)]
async fn first_update_within_grace_keeps_streaming() {
    let push = FakePush::new(PushBehavior::Replay(vec![
        Ok(snapshot_msg("A", 1100.0)),
        Ok(snapshot_msg("B", 900.0)),
    ]));
    let poll = FakePoll::new(false);
    let (handle, seen) = start(Some(push), poll.clone());

    sleep(Duration::from_secs(30)).await;
    assert_eq!(handle.state(), TransportState::Streaming);
    assert_eq!(poll.calls(), 0);
    let updates = seen.lock().unwrap().clone();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].account_key, "A");
    assert_eq!(updates[0].equity, Some(1100.0));
    assert_eq!(updates[0].positions_count, Some(0));
}

#[tokio::test(start_paused = true)]
async fn non_snapshot_messages_do_not_satisfy_grace() {
    let push = FakePush::new(PushBehavior::Replay(vec![
        Ok(r#"{"type":"heartbeat"}"#.to_string()),
        Ok("not json".to_string()),
    ]));
    let poll = FakePoll::new(false);
    let (handle, seen) = start(Some(push), poll.clone());

    sleep(Duration::from_millis(3100)).await;
    assert_eq!(handle.state(), TransportState::Polling);
    assert_eq!(keys(&seen), vec!["P"]);
}

#[tokio::test(start_paused = true)]
async fn connect_failure_falls_back_at_once() {
    let poll = FakePoll::new(false);
    let (handle, _seen) = start(Some(FakePush::new(PushBehavior::RefuseConnect)), poll.clone());

    sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.state(), TransportState::Polling);
    assert_eq!(poll.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn stream_error_after_going_live_switches_to_polling() {
    let push = FakePush::new(PushBehavior::Replay(vec![
        Ok(snapshot_msg("A", 1100.0)),
        Err(anyhow!("connection reset")),
    ]));
    let poll = FakePoll::new(false);
    let (handle, seen) = start(Some(push.clone()), poll.clone());

    sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.state(), TransportState::Polling);
    assert_eq!(keys(&seen), vec!["A", "P"]);
    // No reconnect attempts once polling.
    sleep(Duration::from_secs(20)).await;
    assert_eq!(push.opens.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), TransportState::Polling);
}

#[tokio::test(start_paused = true)]
async fn stream_end_while_streaming_switches_to_polling() {
    let push = FakePush::new(PushBehavior::ReplayThenEnd(vec![Ok(snapshot_msg("A", 1100.0))]));
    let poll = FakePoll::new(false);
    let (handle, seen) = start(Some(push.clone()), poll.clone());

    sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.state(), TransportState::Polling);
    assert_eq!(poll.calls(), 1);
    assert_eq!(keys(&seen), vec!["A", "P"]);

    sleep(Duration::from_secs(20)).await;
    assert_eq!(push.opens.load(Ordering::SeqCst), 1);
    assert_eq!(handle.state(), TransportState::Polling);
}

#[tokio::test(start_paused = true)]
async fn failed_poll_cycle_is_swallowed() {
    let poll = FakePoll::new(true);
    let (handle, seen) = start(None, poll.clone());

    sleep(Duration::from_millis(10)).await;
    assert_eq!(poll.calls(), 1);
    assert!(seen.lock().unwrap().is_empty());

    sleep(Duration::from_secs(2)).await;
    assert_eq!(poll.calls(), 2);
    assert_eq!(keys(&seen), vec!["P"]);
    assert_eq!(handle.state(), TransportState::Polling);
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_idempotent_and_final() {
    let poll = FakePoll::new(false);
    let (handle, seen) = start(None, poll.clone());

    sleep(Duration::from_millis(10)).await;
    assert_eq!(keys(&seen).len(), 1);

    handle.disconnect();
    handle.disconnect();
    assert!(handle.is_closed());

    let calls = poll.calls();
    sleep(Duration::from_secs(60)).await;
    assert_eq!(poll.calls(), calls);
    assert_eq!(keys(&seen).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_grace_stops_everything() {
    let poll = FakePoll::new(false);
    let (handle, seen) = start(Some(FakePush::new(PushBehavior::Replay(vec![]))), poll.clone());

    sleep(Duration::from_secs(1)).await;
    drop(handle);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(poll.calls(), 0);
    assert!(seen.lock().unwrap().is_empty());
}

/// normalizer.rs – Turns raw transport payloads into canonical records.
///
/// Push-stream messages, polled `/snapshots/latest` rows and single-account
/// snapshots all land here and leave as `LiveUpdate`s, so the reconciler
/// never sees a transport-specific shape. Nothing in this module fails:
/// malformed input is dropped (`None`) and numbers that do not parse to a
/// finite value become unknown.
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::models::{AccountSeed, LiveUpdate};

// ---------------------------------------------------------------------------
// Push-stream wire format
// ---------------------------------------------------------------------------

/// Closed set of push events. Anything that is not a positions snapshot is
/// `Other` and carries no information for the registry.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "positions_snapshot")]
    PositionsSnapshot(PositionsSnapshotEvent),
    #[serde(other)]
    Other,
}

/// Fields are kept as raw JSON so one bad value cannot reject the event.
/// The source `ts` is not read: updates are stamped on receipt.
#[derive(Debug, Deserialize)]
pub struct PositionsSnapshotEvent {
    #[serde(default)]
    pub account: Value,
    #[serde(default)]
    pub positions: Option<Value>,
    #[serde(default)]
    pub snapshot: Option<Value>,
}

pub fn parse_stream_event(text: &str) -> Option<StreamEvent> {
    match serde_json::from_str::<StreamEvent>(text) {
        Ok(evt) => Some(evt),
        Err(e) => {
            debug!("Dropping malformed push message: {e}");
            None
        }
    }
}

/// Normalize one push-stream message body.
pub fn normalize_stream_message(text: &str, received_at: DateTime<Utc>) -> Option<LiveUpdate> {
    match parse_stream_event(text)? {
        StreamEvent::PositionsSnapshot(evt) => normalize_positions_snapshot(&evt, received_at),
        StreamEvent::Other => None,
    }
}

pub fn normalize_positions_snapshot(
    evt: &PositionsSnapshotEvent,
    received_at: DateTime<Utc>,
) -> Option<LiveUpdate> {
    let Some(key) = account_key(&evt.account) else {
        debug!("Dropping positions_snapshot without an account key");
        return None;
    };
    let mut update = LiveUpdate::new(key, received_at);
    if let Some(snapshot) = evt.snapshot.as_ref().filter(|s| s.is_object()) {
        fill_snapshot_fields(&mut update, snapshot);
    }
    update.positions_count = evt
        .positions
        .as_ref()
        .and_then(|p| p.as_array())
        .map(|arr| u32::try_from(arr.len()).unwrap_or(u32::MAX));
    Some(update)
}

// ---------------------------------------------------------------------------
// Polled rows / single-account snapshots
// ---------------------------------------------------------------------------

/// Normalize one row of `GET /snapshots/latest`.
///
/// The live values normally sit under `snapshot`; a row without that object
/// is read flat, which is how the single-account endpoint answers.
pub fn normalize_poll_row(row: &Value, received_at: DateTime<Utc>) -> Option<LiveUpdate> {
    if !row.is_object() {
        debug!("Dropping non-object poll row");
        return None;
    }
    let key = row
        .get("login_hint")
        .and_then(account_key)
        .or_else(|| row.get("login").and_then(account_key))?;

    let mut update = LiveUpdate::new(key, received_at);
    match row.get("snapshot") {
        Some(snapshot) if snapshot.is_object() => fill_snapshot_fields(&mut update, snapshot),
        Some(_) => {}
        None => fill_snapshot_fields(&mut update, row),
    }
    update.positions_count = row.get("positions_count").and_then(coerce_count);
    Some(update)
}

/// Normalize the body of `GET /accounts/{login_hint}/snapshot`. The key from
/// the request path is authoritative.
pub fn normalize_account_snapshot(
    login_hint: &str,
    body: &Value,
    received_at: DateTime<Utc>,
) -> Option<LiveUpdate> {
    let key = login_hint.trim();
    if key.is_empty() || !body.is_object() {
        return None;
    }
    let mut update = LiveUpdate::new(key, received_at);
    fill_snapshot_fields(&mut update, body);
    update.positions_count = body.get("positions_count").and_then(coerce_count);
    Some(update)
}

// ---------------------------------------------------------------------------
// Account list rows
// ---------------------------------------------------------------------------

/// Normalize one row of `GET /accounts`. `login_hint` falls back to `login`.
pub fn normalize_account_row(row: &Value) -> Option<AccountSeed> {
    if !row.is_object() {
        return None;
    }
    let key = row
        .get("login_hint")
        .and_then(account_key)
        .or_else(|| row.get("login").and_then(account_key))?;

    Some(AccountSeed {
        login_hint: key,
        label: text_field(row, "label"),
        server: text_field(row, "server"),
        currency: text_field(row, "currency"),
        account_size: row
            .get("account_size")
            .and_then(coerce_number)
            .filter(|size| *size > 0.0),
    })
}

// ---------------------------------------------------------------------------
// Coercion helpers
// ---------------------------------------------------------------------------

/// JSON number or numeric string to a finite `f64`. Everything else,
/// including `null`, booleans and blank strings, is unknown.
pub fn coerce_number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            s.parse::<f64>().ok()?
        }
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn coerce_count(v: &Value) -> Option<u32> {
    let n = coerce_number(v)?;
    if n < 0.0 || n > u32::MAX as f64 {
        return None;
    }
    Some(n.trunc() as u32)
}

/// Account keys arrive as strings or as bare numeric logins.
fn account_key(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => match n.as_f64() {
            // `12345.0` names the same account as `12345`.
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => {
                Some(format!("{f:.0}"))
            }
            _ => Some(n.to_string()),
        },
        _ => None,
    }
}

fn text_field(row: &Value, key: &str) -> Option<String> {
    row.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn fill_snapshot_fields(update: &mut LiveUpdate, snapshot: &Value) {
    update.balance = snapshot.get("balance").and_then(coerce_number);
    update.equity = snapshot.get("equity").and_then(coerce_number);
    update.margin = snapshot.get("margin").and_then(coerce_number);
    update.margin_free = snapshot.get("margin_free").and_then(coerce_number);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn coerce_accepts_numbers_and_numeric_strings() {
        assert_eq!(coerce_number(&json!(12.5)), Some(12.5));
        assert_eq!(coerce_number(&json!(" 1100 ")), Some(1100.0));
        assert_eq!(coerce_number(&json!("1e3")), Some(1000.0));
    }

    #[test]
    fn coerce_rejects_non_finite_and_non_numeric() {
        for v in [
            json!(null),
            json!(true),
            json!(""),
            json!("abc"),
            json!("NaN"),
            json!("inf"),
            json!([1]),
            json!({"v": 1}),
        ] {
            assert_eq!(coerce_number(&v), None, "expected unknown for {v}");
        }
    }

    #[test]
    fn stream_message_becomes_update() {
        let text = r#"{"type":"positions_snapshot","account":12345,
            "positions":[{},{}],
            "snapshot":{"balance":1000,"equity":"1010.5","margin":null,"margin_free":"oops"},
            "ts":1700000000}"#;
        let u = normalize_stream_message(text, t0()).expect("update");
        assert_eq!(u.account_key, "12345");
        assert_eq!(u.balance, Some(1000.0));
        assert_eq!(u.equity, Some(1010.5));
        assert_eq!(u.margin, None);
        assert_eq!(u.margin_free, None);
        assert_eq!(u.positions_count, Some(2));
        assert_eq!(u.timestamp, t0());
    }

    #[test]
    fn stream_message_without_snapshot_has_no_live_fields() {
        let text = r#"{"type":"positions_snapshot","account":"A","ts":1}"#;
        let u = normalize_stream_message(text, t0()).expect("update");
        assert!(!u.carries_data());
    }

    #[test]
    fn other_event_types_are_ignored() {
        assert!(normalize_stream_message(r#"{"type":"noop"}"#, t0()).is_none());
        assert!(normalize_stream_message(r#"{"type":"heartbeat","account":"A"}"#, t0()).is_none());
    }

    #[test]
    fn malformed_messages_are_dropped() {
        assert!(normalize_stream_message("not json", t0()).is_none());
        assert!(normalize_stream_message(r#"{"account":"A"}"#, t0()).is_none());
        assert!(normalize_stream_message(r#"[1,2,3]"#, t0()).is_none());
        assert!(normalize_stream_message(
            r#"{"type":"positions_snapshot","snapshot":{"equity":1}}"#,
            t0()
        )
        .is_none());
        assert!(normalize_stream_message(
            r#"{"type":"positions_snapshot","account":"  ","snapshot":{"equity":1}}"#,
            t0()
        )
        .is_none());
    }

    #[test]
    fn poll_row_reads_nested_snapshot() {
        let row = json!({
            "login_hint": "777",
            "snapshot": {"balance": 5000.0, "equity": 5100.0, "margin": 10, "margin_free": 5090},
            "net_return_pct": 2.0,
            "updated_at": "2024-01-01T00:00:00Z"
        });
        let u = normalize_poll_row(&row, t0()).expect("update");
        assert_eq!(u.account_key, "777");
        assert_eq!(u.equity, Some(5100.0));
        assert_eq!(u.margin_free, Some(5090.0));
        assert_eq!(u.timestamp, t0());
    }

    #[test]
    fn poll_row_without_key_is_dropped() {
        assert!(normalize_poll_row(&json!({"snapshot": {"equity": 1}}), t0()).is_none());
        assert!(normalize_poll_row(&json!("777"), t0()).is_none());
    }

    #[test]
    fn account_snapshot_is_read_flat() {
        let body = json!({"label": "Main", "login": 1, "balance": 10, "equity": 11});
        let u = normalize_account_snapshot("A", &body, t0()).expect("update");
        assert_eq!(u.account_key, "A");
        assert_eq!(u.balance, Some(10.0));
        assert_eq!(u.equity, Some(11.0));
    }

    #[test]
    fn account_row_derives_key_from_login() {
        let row = json!({
            "label": "E2T #1",
            "login": 5551,
            "server": "Demo",
            "account_size": 100000,
        });
        let seed = normalize_account_row(&row).expect("seed");
        assert_eq!(seed.login_hint, "5551");
        assert_eq!(seed.label.as_deref(), Some("E2T #1"));
        assert_eq!(seed.account_size, Some(100000.0));
        assert_eq!(seed.currency, None);
    }

    #[test]
    fn whole_float_keys_match_integer_keys() {
        let row = json!({"login": 12345.0});
        assert_eq!(normalize_account_row(&row).unwrap().login_hint, "12345");

        let text = r#"{"type":"positions_snapshot","account":12345.0,"snapshot":{"equity":1}}"#;
        let u = normalize_stream_message(text, t0()).expect("update");
        assert_eq!(u.account_key, "12345");

        let row = json!({"login_hint": 12.5, "snapshot": {"equity": 1}});
        assert_eq!(normalize_poll_row(&row, t0()).unwrap().account_key, "12.5");
    }

    #[test]
    fn account_row_drops_non_positive_size() {
        let row = json!({"login_hint": "9", "account_size": 0});
        assert_eq!(normalize_account_row(&row).unwrap().account_size, None);
    }
}

/// metrics.rs – Pure derived metrics over a reconciled account.
use chrono::{DateTime, Duration, Utc};

use crate::models::Account;

/// Freshness window used when none is configured.
pub const DEFAULT_FRESH_WINDOW_SECONDS: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Live,
    Pending,
}

impl Freshness {
    pub fn as_str(self) -> &'static str {
        match self {
            Freshness::Live => "Live",
            Freshness::Pending => "Pending",
        }
    }
}

/// `(equity / account_size - 1) * 100`, or `None` when equity is unknown or
/// the account has no positive nominal size.
pub fn net_return_pct(account: &Account) -> Option<f64> {
    let equity = account.equity?;
    let size = account.account_size.filter(|s| *s > 0.0)?;
    Some((equity / size - 1.0) * 100.0)
}

/// Strictly inside the window: an update exactly `window` old is stale.
pub fn is_fresh(account: &Account, now: DateTime<Utc>, window: Duration) -> bool {
    match account.updated_at {
        Some(at) => now - at < window,
        None => false,
    }
}

pub fn freshness(account: &Account, now: DateTime<Utc>, window: Duration) -> Freshness {
    if is_fresh(account, now, window) {
        Freshness::Live
    } else {
        Freshness::Pending
    }
}

/// Equity change across the rolling window (last minus first sample).
pub fn equity_trend(account: &Account) -> Option<f64> {
    let first = account.equity_history.front()?;
    let last = account.equity_history.back()?;
    Some(last.equity - first.equity)
}

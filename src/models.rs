/// models.rs – Core data types shared across the sync engine and dashboard.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Total orderings offered by the view composer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortKey {
    #[default]
    Alpha,
    EquityAsc,
    EquityDesc,
    NetAsc,
    NetDesc,
}

impl SortKey {
    pub const ALL: [SortKey; 5] = [
        SortKey::Alpha,
        SortKey::EquityAsc,
        SortKey::EquityDesc,
        SortKey::NetAsc,
        SortKey::NetDesc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SortKey::Alpha => "alpha",
            SortKey::EquityAsc => "equity_asc",
            SortKey::EquityDesc => "equity_desc",
            SortKey::NetAsc => "net_asc",
            SortKey::NetDesc => "net_desc",
        }
    }

    /// Human label used by the dashboard header.
    pub fn label(self) -> &'static str {
        match self {
            SortKey::Alpha => "A → Z",
            SortKey::EquityAsc => "Lowest Equity",
            SortKey::EquityDesc => "Largest Equity",
            SortKey::NetAsc => "Lowest Net %",
            SortKey::NetDesc => "Largest Net %",
        }
    }

    pub fn next(self) -> SortKey {
        let idx = Self::ALL.iter().position(|k| *k == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }
}

impl std::fmt::Display for SortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SortKey {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "alpha" => Ok(SortKey::Alpha),
            "equity_asc" => Ok(SortKey::EquityAsc),
            "equity_desc" => Ok(SortKey::EquityDesc),
            "net_asc" => Ok(SortKey::NetAsc),
            "net_desc" => Ok(SortKey::NetDesc),
            _ => Err(anyhow::anyhow!("Unknown sort key: {s}")),
        }
    }
}

/// Group selection for the view. `All` matches every account.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GroupFilter {
    #[default]
    All,
    Named(String),
}

impl GroupFilter {
    pub const ALL_NAME: &'static str = "All";

    /// "All" (any case) and blank names map to `GroupFilter::All`.
    pub fn from_name(name: &str) -> Self {
        let name = name.trim();
        if name.is_empty() || name.eq_ignore_ascii_case(Self::ALL_NAME) {
            GroupFilter::All
        } else {
            GroupFilter::Named(name.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            GroupFilter::All => Self::ALL_NAME,
            GroupFilter::Named(name) => name,
        }
    }

    /// Group name to pass as `?group=` on the account-list request.
    pub fn query_name(&self) -> Option<&str> {
        match self {
            GroupFilter::All => None,
            GroupFilter::Named(name) => Some(name),
        }
    }
}

impl std::fmt::Display for GroupFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of the live transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportState {
    #[default]
    Idle,
    AttemptingPush,
    Streaming,
    Polling,
}

impl TransportState {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportState::Idle => "IDLE",
            TransportState::AttemptingPush => "CONNECTING",
            TransportState::Streaming => "STREAMING",
            TransportState::Polling => "POLLING",
        }
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// One point of the rolling equity window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquitySample {
    pub at: DateTime<Utc>,
    pub equity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Registry key.
    pub login_hint: String,
    pub label: Option<String>,
    pub server: Option<String>,
    pub currency: Option<String>,
    /// Nominal opening size; only ever positive when present.
    pub account_size: Option<f64>,

    // Live fields: `None` means unknown, never zero.
    pub balance: Option<f64>,
    pub equity: Option<f64>,
    pub margin: Option<f64>,
    pub margin_free: Option<f64>,

    pub positions_count: u32,
    pub updated_at: Option<DateTime<Utc>>,
    /// Oldest first.
    pub equity_history: VecDeque<EquitySample>,
}

impl Account {
    pub fn new(login_hint: impl Into<String>) -> Self {
        Self {
            login_hint: login_hint.into(),
            label: None,
            server: None,
            currency: None,
            account_size: None,
            balance: None,
            equity: None,
            margin: None,
            margin_free: None,
            positions_count: 0,
            updated_at: None,
            equity_history: VecDeque::new(),
        }
    }

    /// Label if non-blank, otherwise the login hint.
    pub fn display_label(&self) -> &str {
        match self.label.as_deref() {
            Some(l) if !l.trim().is_empty() => l,
            _ => &self.login_hint,
        }
    }
}

/// Static identity fields for one account, as read from the account list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSeed {
    pub login_hint: String,
    pub label: Option<String>,
    pub server: Option<String>,
    pub currency: Option<String>,
    pub account_size: Option<f64>,
}

impl AccountSeed {
    #[allow(dead_code)]
    pub fn new(login_hint: impl Into<String>) -> Self {
        Self {
            login_hint: login_hint.into(),
            label: None,
            server: None,
            currency: None,
            account_size: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Live update
// ---------------------------------------------------------------------------

/// Canonical, transport-agnostic update for one account. Every `None`
/// means "no new information" for that field.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveUpdate {
    pub account_key: String,
    pub balance: Option<f64>,
    pub equity: Option<f64>,
    pub margin: Option<f64>,
    pub margin_free: Option<f64>,
    pub positions_count: Option<u32>,
    /// Assigned on receipt; the source clock is not trusted for ordering.
    pub timestamp: DateTime<Utc>,
}

impl LiveUpdate {
    pub fn new(account_key: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            account_key: account_key.into(),
            balance: None,
            equity: None,
            margin: None,
            margin_free: None,
            positions_count: None,
            timestamp,
        }
    }

    #[allow(dead_code)]
    pub fn with_equity(mut self, equity: f64) -> Self {
        self.equity = Some(equity);
        self
    }

    #[allow(dead_code)]
    pub fn with_balance(mut self, balance: f64) -> Self {
        self.balance = Some(balance);
        self
    }

    /// True when the update carries at least one live field or a position count.
    pub fn carries_data(&self) -> bool {
        self.balance.is_some()
            || self.equity.is_some()
            || self.margin.is_some()
            || self.margin_free.is_some()
            || self.positions_count.is_some()
    }
}

// ---------------------------------------------------------------------------
// Group tabs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name: String,
    #[serde(default)]
    pub count: u32,
    #[serde(default)]
    pub sort_index: i64,
}

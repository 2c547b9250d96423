/// registry.rs – In-memory account registry and the state reconciler.
///
/// The registry is owned by one view session. Accounts are created by the
/// seed list or by the first live update that names them, refreshed in place
/// afterwards, and never removed.
use std::collections::HashMap;

use crate::models::{Account, AccountSeed, EquitySample, LiveUpdate};

pub const DEFAULT_HISTORY_LEN: usize = 60;

#[derive(Debug, Clone)]
pub struct AccountRegistry {
    /// Insertion order is the tie-break order for every view.
    accounts: Vec<Account>,
    index: HashMap<String, usize>,
    history_len: usize,
}

impl Default for AccountRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

impl AccountRegistry {
    pub fn new(history_len: usize) -> Self {
        Self {
            accounts: Vec::new(),
            index: HashMap::new(),
            history_len: history_len.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    #[allow(dead_code)]
    pub fn get(&self, login_hint: &str) -> Option<&Account> {
        self.index.get(login_hint).map(|&i| &self.accounts[i])
    }

    /// Accounts in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.accounts.iter()
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    /// Merge the account list into the registry. New keys are appended;
    /// existing accounts get their static fields refreshed where the row
    /// provides them and keep every live field. Returns the number of
    /// accounts created.
    pub fn seed<I>(&mut self, rows: I) -> usize
    where
        I: IntoIterator<Item = AccountSeed>,
    {
        let mut created = 0;
        for row in rows {
            let (account, is_new) = self.entry(&row.login_hint);
            if is_new {
                created += 1;
            }
            if row.label.is_some() {
                account.label = row.label;
            }
            if row.server.is_some() {
                account.server = row.server;
            }
            if row.currency.is_some() {
                account.currency = row.currency;
            }
            if row.account_size.is_some() {
                account.account_size = row.account_size;
            }
        }
        created
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Apply one update in receipt order. Only fields present on the update
    /// are written; `updated_at` moves whenever anything was applied, even if
    /// the values are unchanged. Returns `true` when the account was created
    /// by this update.
    pub fn apply(&mut self, update: &LiveUpdate) -> bool {
        let history_len = self.history_len;
        let (account, is_new) = self.entry(&update.account_key);

        if let Some(v) = update.balance {
            account.balance = Some(v);
        }
        if let Some(v) = update.equity {
            account.equity = Some(v);
            push_equity_sample(account, update, v, history_len);
        }
        if let Some(v) = update.margin {
            account.margin = Some(v);
        }
        if let Some(v) = update.margin_free {
            account.margin_free = Some(v);
        }
        if let Some(n) = update.positions_count {
            account.positions_count = n;
        }
        if update.carries_data() {
            account.updated_at = Some(update.timestamp);
        }
        is_new
    }

    fn entry(&mut self, login_hint: &str) -> (&mut Account, bool) {
        match self.index.get(login_hint) {
            Some(&i) => (&mut self.accounts[i], false),
            None => {
                let i = self.accounts.len();
                self.accounts.push(Account::new(login_hint));
                self.index.insert(login_hint.to_string(), i);
                (&mut self.accounts[i], true)
            }
        }
    }
}

/// A second sample with the same timestamp replaces the last one, so
/// re-applying an update leaves the window unchanged.
fn push_equity_sample(account: &mut Account, update: &LiveUpdate, equity: f64, cap: usize) {
    let sample = EquitySample {
        at: update.timestamp,
        equity,
    };
    match account.equity_history.back_mut() {
        Some(last) if last.at == sample.at => *last = sample,
        _ => account.equity_history.push_back(sample),
    }
    while account.equity_history.len() > cap {
        account.equity_history.pop_front();
    }
}

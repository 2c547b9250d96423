/// app.rs – View-session state owned by the main event loop.
///
/// Only the main loop mutates this; the dashboard renders it by reference.
/// HTTP results arrive as `FetchResult`s from spawned tasks, so the loop
/// never waits on the network.
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;

use crate::groups::GroupStore;
use crate::models::{
    Account, AccountSeed, GroupFilter, GroupInfo, LiveUpdate, SortKey, TransportState,
};
use crate::normalizer::normalize_account_snapshot;
use crate::registry::AccountRegistry;
use crate::view;

const MAX_LOG_LINES: usize = 200;

/// Outcome of one background request, posted back to the main loop.
#[derive(Debug)]
pub enum FetchResult {
    Groups(Result<Vec<GroupInfo>>),
    /// Account list requested for `filter`.
    Accounts {
        filter: GroupFilter,
        result: Result<Vec<AccountSeed>>,
    },
    Snapshot {
        login_hint: String,
        received_at: DateTime<Utc>,
        result: Result<Value>,
    },
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub registry: AccountRegistry,
    /// Server-provided group tabs, `All` excluded.
    pub groups: Vec<GroupInfo>,
    /// 0 is `All`; `n` is `groups[n - 1]`.
    pub active_tab: usize,
    pub sort_key: SortKey,
    /// Row index into the composed view.
    pub selected: usize,
    pub transport: TransportState,
    pub fresh_window: chrono::Duration,
    /// Last account-list failure for the active tab.
    seed_error: Option<String>,
    /// Last group-list failure; only a successful group load clears it.
    groups_error: Option<String>,
    pub updates_applied: u64,
    pub logs: VecDeque<String>,
}

impl AppState {
    pub fn new(
        session_id: String,
        registry: AccountRegistry,
        fresh_window: chrono::Duration,
    ) -> Self {
        Self {
            session_id,
            started_at: Utc::now(),
            registry,
            groups: Vec::new(),
            active_tab: 0,
            sort_key: SortKey::default(),
            selected: 0,
            transport: TransportState::Idle,
            fresh_window,
            seed_error: None,
            groups_error: None,
            updates_applied: 0,
            logs: VecDeque::new(),
        }
    }

    pub fn add_log(&mut self, msg: impl Into<String>) {
        let entry = format!("[{}] {}", Utc::now().format("%H:%M:%S"), msg.into());
        self.logs.push_front(entry);
        while self.logs.len() > MAX_LOG_LINES {
            self.logs.pop_back();
        }
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Error shown in place of the accounts table. A group-list failure
    /// wins over an account-list failure.
    pub fn view_error(&self) -> Option<&str> {
        self.groups_error
            .as_deref()
            .or(self.seed_error.as_deref())
    }

    pub fn groups_failed(&self) -> bool {
        self.groups_error.is_some()
    }

    pub fn handle_fetch(&mut self, fetched: FetchResult) {
        match fetched {
            FetchResult::Groups(Ok(groups)) => {
                self.groups_error = None;
                self.set_groups(groups);
            }
            FetchResult::Groups(Err(e)) => {
                self.add_log(format!("ERROR loading groups: {e}"));
                self.groups_error = Some(format!("loading groups: {e:#}"));
            }
            FetchResult::Accounts { filter, result } => {
                // A later tab switch supersedes this response.
                if filter != self.active_filter() {
                    return;
                }
                match result {
                    Ok(rows) => self.seed(rows),
                    Err(e) => {
                        self.add_log(format!("ERROR loading accounts: {e}"));
                        self.seed_error = Some(format!("loading accounts: {e:#}"));
                    }
                }
            }
            FetchResult::Snapshot {
                login_hint,
                received_at,
                result,
            } => match result {
                Ok(body) => match normalize_account_snapshot(&login_hint, &body, received_at) {
                    Some(update) => {
                        self.apply_update(&update);
                        self.add_log(format!("Refreshed #{login_hint}"));
                    }
                    None => {
                        self.add_log(format!("Snapshot for #{login_hint} had no usable fields"))
                    }
                },
                Err(e) => self.add_log(format!("Refresh failed for #{login_hint}: {e}")),
            },
        }
    }

    pub fn seed(&mut self, rows: Vec<AccountSeed>) {
        let total = rows.len();
        let created = self.registry.seed(rows);
        self.seed_error = None;
        self.add_log(format!(
            "Seeded {total} account(s) for {} ({created} new)",
            self.active_filter()
        ));
    }

    pub fn apply_update(&mut self, update: &LiveUpdate) {
        if self.registry.apply(update) {
            self.add_log(format!("New account from live feed: {}", update.account_key));
        }
        self.updates_applied += 1;
    }

    pub fn set_transport(&mut self, state: TransportState) {
        if self.transport != state {
            self.transport = state;
            self.add_log(format!("Transport → {state}"));
        }
    }

    // ------------------------------------------------------------------
    // Tabs
    // ------------------------------------------------------------------

    /// Replace the group tabs, keeping the active tab by name when possible.
    pub fn set_groups(&mut self, groups: Vec<GroupInfo>) {
        let current = self.active_filter();
        self.groups = groups
            .into_iter()
            .filter(|g| GroupFilter::from_name(&g.name) != GroupFilter::All)
            .collect();
        if !self.select_tab(current.as_str()) {
            self.active_tab = 0;
        }
    }

    pub fn tab_names(&self) -> Vec<String> {
        std::iter::once(GroupFilter::ALL_NAME.to_string())
            .chain(self.groups.iter().map(|g| g.name.clone()))
            .collect()
    }

    pub fn active_filter(&self) -> GroupFilter {
        match self.active_tab {
            0 => GroupFilter::All,
            n => self
                .groups
                .get(n - 1)
                .map(|g| GroupFilter::from_name(&g.name))
                .unwrap_or_default(),
        }
    }

    /// Returns `false` when no tab has that name.
    pub fn select_tab(&mut self, name: &str) -> bool {
        let wanted = GroupFilter::from_name(name);
        let found = self
            .tab_names()
            .iter()
            .position(|t| GroupFilter::from_name(t) == wanted);
        match found {
            Some(idx) => {
                self.active_tab = idx;
                self.selected = 0;
                true
            }
            None => false,
        }
    }

    pub fn next_tab(&mut self) {
        let n = self.groups.len() + 1;
        self.active_tab = (self.active_tab + 1) % n;
        self.selected = 0;
    }

    pub fn prev_tab(&mut self) {
        let n = self.groups.len() + 1;
        self.active_tab = (self.active_tab + n - 1) % n;
        self.selected = 0;
    }

    /// Next assignment when cycling an account through the known groups:
    /// unassigned → first group → … → last group → unassigned.
    pub fn next_group_for(&self, current: Option<&str>) -> GroupFilter {
        let names: Vec<&str> = self.groups.iter().map(|g| g.name.as_str()).collect();
        let next = match current.and_then(|c| names.iter().position(|n| *n == c)) {
            Some(i) => names.get(i + 1),
            None => names.first(),
        };
        next.map(|n| GroupFilter::from_name(n)).unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // View
    // ------------------------------------------------------------------

    pub fn cycle_sort(&mut self) {
        self.sort_key = self.sort_key.next();
    }

    pub fn visible<'a>(&'a self, groups: &dyn GroupStore) -> Vec<&'a Account> {
        view::compose(&self.registry, &self.active_filter(), self.sort_key, groups)
    }

    pub fn selected_account<'a>(&'a self, groups: &dyn GroupStore) -> Option<&'a Account> {
        let rows = self.visible(groups);
        let idx = self.selected.min(rows.len().saturating_sub(1));
        rows.get(idx).copied()
    }

    pub fn select_next(&mut self, visible_len: usize) {
        if visible_len > 0 {
            self.selected = (self.selected + 1).min(visible_len - 1);
        }
    }

    pub fn select_prev(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::MemoryGroupStore;
    use anyhow::anyhow;
    use chrono::TimeZone;
    use serde_json::json;

    fn group(name: &str, sort_index: i64) -> GroupInfo {
        GroupInfo {
            name: name.into(),
            count: 0,
            sort_index,
        }
    }

    fn state() -> AppState {
        let mut s = AppState::new(
            "s".into(),
            AccountRegistry::default(),
            chrono::Duration::seconds(90),
        );
        s.set_groups(vec![group("All", 0), group("E2T", 1), group("Nish", 2)]);
        s
    }

    #[test]
    fn all_tab_is_always_first_and_not_duplicated() {
        let s = state();
        assert_eq!(s.tab_names(), vec!["All", "E2T", "Nish"]);
        assert_eq!(s.active_filter(), GroupFilter::All);
    }

    #[test]
    fn tabs_wrap_both_ways() {
        let mut s = state();
        s.prev_tab();
        assert_eq!(s.active_filter(), GroupFilter::Named("Nish".into()));
        s.next_tab();
        assert_eq!(s.active_filter(), GroupFilter::All);
    }

    #[test]
    fn active_tab_survives_group_reload() {
        let mut s = state();
        assert!(s.select_tab("Nish"));
        s.set_groups(vec![group("Nish", 0), group("E2T", 5)]);
        assert_eq!(s.active_filter(), GroupFilter::Named("Nish".into()));
        assert!(!s.select_tab("Missing"));
    }

    #[test]
    fn group_assignment_cycles_back_to_all() {
        let s = state();
        assert_eq!(s.next_group_for(None), GroupFilter::Named("E2T".into()));
        assert_eq!(s.next_group_for(Some("E2T")), GroupFilter::Named("Nish".into()));
        assert_eq!(s.next_group_for(Some("Nish")), GroupFilter::All);
        assert_eq!(s.next_group_for(Some("Gone")), GroupFilter::Named("E2T".into()));
    }

    #[test]
    fn selection_is_clamped_to_view() {
        let mut s = state();
        s.seed(vec![AccountSeed::new("a"), AccountSeed::new("b")]);
        let store = MemoryGroupStore::new();
        s.select_next(2);
        s.select_next(2);
        assert_eq!(s.selected, 1);
        assert_eq!(s.selected_account(&store).unwrap().login_hint, "b");
        s.select_prev();
        s.select_prev();
        assert_eq!(s.selected, 0);
    }

    #[test]
    fn group_load_failure_is_a_view_error_until_groups_load() {
        let mut s = AppState::new(
            "s".into(),
            AccountRegistry::default(),
            chrono::Duration::seconds(90),
        );
        s.handle_fetch(FetchResult::Groups(Err(anyhow!("GET /groups failed (502)"))));
        assert!(s.groups_failed());
        assert!(s.view_error().unwrap().contains("502"));
        assert_eq!(s.tab_names(), vec!["All"]);

        // A successful seed does not hide the group failure.
        s.handle_fetch(FetchResult::Accounts {
            filter: GroupFilter::All,
            result: Ok(vec![AccountSeed::new("a")]),
        });
        assert_eq!(s.registry.len(), 1);
        assert!(s.view_error().is_some());

        s.handle_fetch(FetchResult::Groups(Ok(vec![group("E2T", 1)])));
        assert_eq!(s.view_error(), None);
        assert_eq!(s.tab_names(), vec!["All", "E2T"]);
    }

    #[test]
    fn account_load_failure_clears_on_next_seed() {
        let mut s = state();
        s.handle_fetch(FetchResult::Accounts {
            filter: GroupFilter::All,
            result: Err(anyhow!("timed out")),
        });
        assert!(s.view_error().unwrap().contains("timed out"));
        s.handle_fetch(FetchResult::Accounts {
            filter: GroupFilter::All,
            result: Ok(vec![]),
        });
        assert_eq!(s.view_error(), None);
    }

    #[test]
    fn stale_account_list_is_ignored() {
        let mut s = state();
        s.next_tab();
        s.handle_fetch(FetchResult::Accounts {
            filter: GroupFilter::All,
            result: Ok(vec![AccountSeed::new("a")]),
        });
        assert!(s.registry.is_empty());
        s.handle_fetch(FetchResult::Accounts {
            filter: GroupFilter::Named("E2T".into()),
            result: Err(anyhow!("boom")),
        });
        assert!(s.view_error().is_some());
    }

    #[test]
    fn snapshot_refresh_goes_through_reconciler() {
        let mut s = state();
        s.seed(vec![AccountSeed::new("a")]);
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        s.handle_fetch(FetchResult::Snapshot {
            login_hint: "a".into(),
            received_at: at,
            result: Ok(json!({ "equity": "1250.5", "balance": null })),
        });
        let a = s.registry.get("a").unwrap();
        assert_eq!(a.equity, Some(1250.5));
        assert_eq!(a.balance, None);
        assert_eq!(a.updated_at, Some(at));
        assert_eq!(s.updates_applied, 1);

        s.handle_fetch(FetchResult::Snapshot {
            login_hint: "a".into(),
            received_at: at,
            result: Err(anyhow!("404")),
        });
        assert_eq!(s.updates_applied, 1);
    }
}

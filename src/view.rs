/// view.rs – Filtered, totally ordered projections of the registry.
///
/// `compose` is side-effect free: the same registry, filter and sort key
/// always give the same order. Sorting is stable, so ties keep registry
/// insertion order.
use std::cmp::Ordering;

use crate::groups::GroupStore;
use crate::metrics::net_return_pct;
use crate::models::{Account, GroupFilter, SortKey};
use crate::registry::AccountRegistry;

pub fn compose<'a>(
    registry: &'a AccountRegistry,
    filter: &GroupFilter,
    sort: SortKey,
    groups: &dyn GroupStore,
) -> Vec<&'a Account> {
    let mut rows: Vec<&Account> = registry
        .iter()
        .filter(|a| in_group(a, filter, groups))
        .collect();

    match sort {
        SortKey::Alpha => rows.sort_by_cached_key(|a| alpha_key(a)),
        SortKey::EquityAsc => rows.sort_by(|a, b| cmp_unknown_last(a.equity, b.equity, false)),
        SortKey::EquityDesc => rows.sort_by(|a, b| cmp_unknown_last(a.equity, b.equity, true)),
        SortKey::NetAsc => {
            rows.sort_by(|a, b| cmp_unknown_last(net_return_pct(a), net_return_pct(b), false))
        }
        SortKey::NetDesc => {
            rows.sort_by(|a, b| cmp_unknown_last(net_return_pct(a), net_return_pct(b), true))
        }
    }
    rows
}

pub fn in_group(account: &Account, filter: &GroupFilter, groups: &dyn GroupStore) -> bool {
    match filter {
        GroupFilter::All => true,
        GroupFilter::Named(name) => groups
            .group_of(&account.login_hint)
            .is_some_and(|g| &g == name),
    }
}

fn alpha_key(account: &Account) -> String {
    account.display_label().to_lowercase()
}

/// Unknown values sort after every known value in both directions.
fn cmp_unknown_last(a: Option<f64>, b: Option<f64>, descending: bool) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => {
            let ord = x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        }
    }
}

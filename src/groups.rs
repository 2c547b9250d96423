/// groups.rs – Account → group assignments used by the view filter.
///
/// The store is injected into the view composer instead of being read from a
/// global. `MemoryGroupStore` backs tests; `SqliteGroupStore` persists the
/// map across runs and serves reads from an in-memory copy.
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::models::GroupFilter;

pub trait GroupStore: Send + Sync {
    /// Group assigned to `login_hint`, if any. Unassigned accounts only
    /// appear under the `All` view.
    fn group_of(&self, login_hint: &str) -> Option<String>;

    /// Assign a group. `GroupFilter::All` removes the assignment.
    fn assign(&self, login_hint: &str, group: &GroupFilter) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct MemoryGroupStore {
    map: RwLock<HashMap<String, String>>,
}

#[allow(dead_code)]
impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_assignments<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            map: RwLock::new(map),
        }
    }
}

impl GroupStore for MemoryGroupStore {
    fn group_of(&self, login_hint: &str) -> Option<String> {
        self.map.read().ok()?.get(login_hint).cloned()
    }

    fn assign(&self, login_hint: &str, group: &GroupFilter) -> Result<()> {
        let mut map = self
            .map
            .write()
            .map_err(|_| anyhow::anyhow!("group map lock poisoned"))?;
        apply_assignment(&mut map, login_hint, group);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS account_groups (
    login_hint   TEXT PRIMARY KEY,
    group_name   TEXT NOT NULL,
    assigned_at  TEXT NOT NULL
);
";

pub struct SqliteGroupStore {
    conn: Mutex<Connection>,
    cache: RwLock<HashMap<String, String>>,
}

impl SqliteGroupStore {
    /// Open (or create) the store at *path*, apply the schema and load every
    /// assignment into memory.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("opening group store")?;
        conn.execute_batch(SCHEMA)
            .context("applying group store schema")?;
        let cache = load_assignments(&conn)?;
        debug!("Loaded {} group assignment(s) from {path}", cache.len());
        Ok(Self {
            conn: Mutex::new(conn),
            cache: RwLock::new(cache),
        })
    }

    #[allow(dead_code)]
    pub fn assignments(&self) -> HashMap<String, String> {
        self.cache
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

impl GroupStore for SqliteGroupStore {
    fn group_of(&self, login_hint: &str) -> Option<String> {
        self.cache.read().ok()?.get(login_hint).cloned()
    }

    fn assign(&self, login_hint: &str, group: &GroupFilter) -> Result<()> {
        {
            let conn = self
                .conn
                .lock()
                .map_err(|_| anyhow::anyhow!("group store mutex poisoned"))?;
            match group {
                GroupFilter::All => {
                    conn.execute(
                        "DELETE FROM account_groups WHERE login_hint = ?1",
                        params![login_hint],
                    )
                    .context("clearing group assignment")?;
                }
                GroupFilter::Named(name) => {
                    conn.execute(
                        "INSERT INTO account_groups (login_hint, group_name, assigned_at)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(login_hint) DO UPDATE SET
                            group_name  = excluded.group_name,
                            assigned_at = excluded.assigned_at",
                        params![login_hint, name, Utc::now().to_rfc3339()],
                    )
                    .context("saving group assignment")?;
                }
            }
        }
        match self.cache.write() {
            Ok(mut map) => apply_assignment(&mut map, login_hint, group),
            Err(_) => warn!(
                "group cache lock poisoned; assignment for {login_hint} saved but not cached"
            ),
        }
        Ok(())
    }
}

fn load_assignments(conn: &Connection) -> Result<HashMap<String, String>> {
    let mut stmt = conn
        .prepare("SELECT login_hint, group_name FROM account_groups")
        .context("preparing group query")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .context("querying group assignments")?;
    let mut map = HashMap::new();
    for row in rows {
        let (login_hint, group) = row.context("reading group assignment")?;
        map.insert(login_hint, group);
    }
    Ok(map)
}

fn apply_assignment(map: &mut HashMap<String, String>, login_hint: &str, group: &GroupFilter) {
    match group {
        GroupFilter::All => {
            map.remove(login_hint);
        }
        GroupFilter::Named(name) => {
            map.insert(login_hint.to_string(), name.clone());
        }
    }
}

/// main.rs – Entry point for the account monitor.
///
/// Orchestrates startup, the live connector (push stream with polling
/// fallback), group tabs and the ratatui dashboard.
mod api;
mod app;
mod config;
mod connector;
mod dashboard;
mod groups;
mod metrics;
mod models;
mod normalizer;
mod registry;
mod stream;
mod view;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use crossterm::event::EventStream;
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use api::ApiClient;
use app::{AppState, FetchResult};
use config::Settings;
use connector::{Connector, ConnectorConfig, PollSource, PushSource};
use dashboard::Action;
use groups::{GroupStore, SqliteGroupStore};
use metrics::net_return_pct;
use models::{GroupFilter, LiveUpdate};
use registry::AccountRegistry;

const UPDATE_CHANNEL_CAPACITY: usize = 1024;
const FETCH_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "account-monitor",
    about = "Live trading-account monitor – push stream with polling fallback",
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// Disable the interactive dashboard and print logs to stdout instead.
    #[arg(long, default_value_t = false)]
    no_dashboard: bool,

    /// Group tab to open on startup.
    #[arg(long)]
    group: Option<String>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(&cli.config)?;
    // Held for the whole run so buffered file logs are flushed on exit.
    let _log_guard = init_logging(&settings, !cli.no_dashboard)?;

    info!(
        "API: {}  push stream: {}",
        settings.api.base_url,
        settings.live.stream_url().unwrap_or("none")
    );

    let client = Arc::new(ApiClient::new(
        &settings.api.base_url,
        settings.api.request_timeout_seconds,
    )?);

    let group_store = SqliteGroupStore::open(&settings.groups.db_path)?;
    info!("Group store opened: {}", settings.groups.db_path);

    let mut state = AppState::new(
        Uuid::new_v4().to_string(),
        AccountRegistry::new(settings.live.history_len),
        settings.live.fresh_window(),
    );

    // Startup loads run before the loop; later ones go through `fetch_tx`.
    let groups = client.fetch_groups().await;
    if let Err(e) = &groups {
        warn!("Failed to load groups: {e:#}");
    }
    state.handle_fetch(FetchResult::Groups(groups));
    if let Some(name) = cli.group.as_deref() {
        if !state.select_tab(name) {
            warn!("Unknown group '{name}' – showing All");
        }
    }
    let accounts = fetch_accounts(client.clone(), state.active_filter()).await;
    if let FetchResult::Accounts { result: Err(e), .. } = &accounts {
        error!("Failed to load accounts: {e:#}");
    }
    state.handle_fetch(accounts);

    // Live connector
    let push: Option<Arc<dyn PushSource>> = match settings.live.stream_url() {
        Some(url) => match stream::push_source_for(url, settings.live.push_grace_seconds) {
            Ok(source) => Some(source),
            Err(e) => {
                warn!("Ignoring push stream: {e:#}");
                None
            }
        },
        None => None,
    };
    let poll: Arc<dyn PollSource> = client.clone();
    let connector = Connector::new(
        push,
        poll,
        ConnectorConfig {
            push_grace: settings.live.push_grace(),
            poll_interval: settings.live.poll_interval(),
        },
    );

    let (tx, mut rx) = mpsc::channel::<LiveUpdate>(UPDATE_CHANNEL_CAPACITY);
    let handle = connector.connect(move |update| match tx.try_send(update) {
        Ok(()) => {}
        Err(TrySendError::Full(u)) => {
            debug!("Update channel full – dropping update for {}", u.account_key)
        }
        Err(TrySendError::Closed(_)) => {}
    });
    let mut transport_rx = handle.watch_state();
    let (fetch_tx, mut fetch_rx) = mpsc::channel::<FetchResult>(FETCH_CHANNEL_CAPACITY);

    // Dashboard setup (unless --no-dashboard)
    let mut terminal = if !cli.no_dashboard {
        Some(dashboard::setup_terminal()?)
    } else {
        None
    };
    let mut events = terminal.as_ref().map(|_| EventStream::new());

    let refresh_ms = ((settings.dashboard.refresh_rate * 1000.0) as u64).max(1);
    let mut dash_ticker = tokio::time::interval(std::time::Duration::from_millis(refresh_ms));
    let mut last_reported = 0u64;

    info!("Monitor started (session {}).  Press 'q' to quit.", state.session_id);

    // -----------------------------------------------------------------------
    // Main event loop
    // -----------------------------------------------------------------------
    loop {
        if let Some(ref mut term) = terminal {
            let now = Utc::now();
            term.draw(|f| dashboard::render(f, &state, &group_store, now))?;
        }

        tokio::select! {
            // ── Dashboard keyboard events ──────────────────────────────────
            Some(Ok(event)) = next_event(&mut events) => {
                let Some(action) = dashboard::handle_event(&event) else {
                    continue;
                };
                if action == Action::Quit {
                    break;
                }
                handle_action(action, &mut state, &client, &group_store, &fetch_tx);
            }

            // ── Refresh tick ───────────────────────────────────────────────
            _ = dash_ticker.tick() => {
                if terminal.is_none() && state.updates_applied != last_reported {
                    last_reported = state.updates_applied;
                    log_summary(&state, &group_store);
                }
            }

            // ── Live update ────────────────────────────────────────────────
            Some(update) = rx.recv() => {
                state.apply_update(&update);
            }

            // ── Background fetch finished ──────────────────────────────────
            Some(fetched) = fetch_rx.recv() => {
                if let FetchResult::Accounts { filter, result: Err(e) } = &fetched {
                    error!("Failed to load accounts for {filter}: {e:#}");
                }
                state.handle_fetch(fetched);
            }

            // ── Transport state change ─────────────────────────────────────
            Ok(()) = transport_rx.changed() => {
                let transport = *transport_rx.borrow_and_update();
                info!("Transport: {transport}");
                state.set_transport(transport);
            }

            _ = tokio::signal::ctrl_c(), if terminal.is_none() => {
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Graceful shutdown
    // -----------------------------------------------------------------------
    handle.disconnect();
    if let Some(ref mut term) = terminal {
        dashboard::teardown_terminal(term)?;
    }

    info!(
        "Session {} ended – {} account(s), {} update(s) applied",
        state.session_id,
        state.registry.len(),
        state.updates_applied,
    );

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Logs go to stdout in headless mode and to `app.log_file` while the
/// dashboard owns the terminal. The file writer is non-blocking; the
/// returned guard flushes it when dropped.
fn init_logging(settings: &Settings, dashboard: bool) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.app.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if dashboard {
        let (writer, guard) = log_file_writer(&settings.app.log_file)?;
        builder.with_ansi(false).with_writer(writer).init();
        Ok(Some(guard))
    } else {
        builder.init();
        Ok(None)
    }
}

/// Append-mode file writer that flushes on a background thread.
fn log_file_writer(path: &str) -> Result<(NonBlocking, WorkerGuard)> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {path}"))?;
    Ok(tracing_appender::non_blocking(file))
}

async fn next_event(
    events: &mut Option<EventStream>,
) -> Option<std::io::Result<crossterm::event::Event>> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Background fetches
// ---------------------------------------------------------------------------

/// Run `fetch` off the main loop and post its result back on `tx`.
fn spawn_fetch<F>(tx: &mpsc::Sender<FetchResult>, fetch: F)
where
    F: Future<Output = FetchResult> + Send + 'static,
{
    let tx = tx.clone();
    tokio::spawn(async move {
        if tx.send(fetch.await).await.is_err() {
            debug!("Main loop gone – dropping fetch result");
        }
    });
}

async fn fetch_accounts(client: Arc<ApiClient>, filter: GroupFilter) -> FetchResult {
    let result = client.fetch_accounts(filter.query_name()).await;
    FetchResult::Accounts { filter, result }
}

async fn fetch_groups(client: Arc<ApiClient>) -> FetchResult {
    FetchResult::Groups(client.fetch_groups().await)
}

async fn fetch_snapshot(client: Arc<ApiClient>, login_hint: String) -> FetchResult {
    let result = client.fetch_account_snapshot(&login_hint).await;
    FetchResult::Snapshot {
        login_hint,
        received_at: Utc::now(),
        result,
    }
}

fn handle_action(
    action: Action,
    state: &mut AppState,
    client: &Arc<ApiClient>,
    groups: &dyn GroupStore,
    fetch_tx: &mpsc::Sender<FetchResult>,
) {
    match action {
        Action::Quit => {}
        Action::CycleSort => {
            state.cycle_sort();
            state.add_log(format!("Sort: {}", state.sort_key.label()));
        }
        Action::NextTab | Action::PrevTab => {
            if action == Action::NextTab {
                state.next_tab();
            } else {
                state.prev_tab();
            }
            if state.groups_failed() {
                spawn_fetch(fetch_tx, fetch_groups(client.clone()));
            }
            spawn_fetch(fetch_tx, fetch_accounts(client.clone(), state.active_filter()));
        }
        Action::SelectNext => {
            let len = state.visible(groups).len();
            state.select_next(len);
        }
        Action::SelectPrev => state.select_prev(),
        Action::AssignGroup => {
            let Some(login) = state
                .selected_account(groups)
                .map(|a| a.login_hint.clone())
            else {
                return;
            };
            let target = state.next_group_for(groups.group_of(&login).as_deref());
            match groups.assign(&login, &target) {
                Ok(()) => state.add_log(format!("#{login} → {target}")),
                Err(e) => {
                    error!("Group assignment failed for {login}: {e:#}");
                    state.add_log(format!("ERROR assigning group: {e}"));
                }
            }
        }
        Action::RefreshSelected => {
            let Some(login) = state
                .selected_account(groups)
                .map(|a| a.login_hint.clone())
            else {
                return;
            };
            state.add_log(format!("Refreshing #{login}…"));
            spawn_fetch(fetch_tx, fetch_snapshot(client.clone(), login));
        }
    }
}

/// Headless replacement for the dashboard table.
fn log_summary(state: &AppState, groups: &dyn GroupStore) {
    let visible = state.visible(groups);
    let now = Utc::now();
    let live = visible
        .iter()
        .filter(|a| metrics::is_fresh(a, now, state.fresh_window))
        .count();
    info!(
        "[{}] {} account(s), {live} live, sort {} – {} update(s)",
        state.active_filter(),
        visible.len(),
        state.sort_key,
        state.updates_applied,
    );
    for a in visible.iter().take(10) {
        info!(
            "  {:<24} equity {:>12}  net {:>9}",
            a.display_label(),
            dashboard::fmt_num(a.equity),
            dashboard::fmt_pct(net_return_pct(a)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_logs_are_flushed_when_guard_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.log");
        let path = path.to_str().unwrap();
        std::fs::write(path, "earlier run\n").unwrap();

        let (writer, guard) = log_file_writer(path).unwrap();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(writer)
            .finish();
        tracing::subscriber::with_default(subscriber, || info!("Transport: polling"));
        drop(guard);

        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with("earlier run\n"));
        assert!(text.contains("Transport: polling"));
    }

    #[test]
    fn log_file_in_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("monitor.log");
        let err = log_file_writer(path.to_str().unwrap())
            .err()
            .expect("opening should fail");
        assert!(format!("{err:#}").contains("opening log file"));
    }
}

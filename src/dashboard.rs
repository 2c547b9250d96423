/// dashboard.rs – ratatui live terminal dashboard.
///
/// Layout:
///  ┌─ Header ──────────────────────────────────────────────────────────┐
///  │ Account Monitor │ Up │ Accounts │ Sort │ transport state          │
///  ├─ Tabs ────────────────────────────────────────────────────────────┤
///  │ All │ E2T │ Nish                                                  │
///  ├─ Accounts ────────────────────────┬─ Detail ──────────────────────┤
///  │ table of the composed view        │ selected account + sparkline  │
///  │                                   ├─ Logs ────────────────────────┤
///  │                                   │ timestamped log lines         │
///  └───────────────────────────────────┴───────────────────────────────┘
use chrono::{DateTime, Utc};
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{
        Block, Borders, Cell, List, ListItem, Paragraph, Row, Sparkline, Table, TableState, Tabs,
    },
    Frame, Terminal,
};
use std::io::{self, Stdout};

use crate::app::AppState;
use crate::groups::GroupStore;
use crate::metrics::{equity_trend, freshness, net_return_pct, Freshness};
use crate::models::{Account, TransportState};

pub type CrossTerm = Terminal<CrosstermBackend<Stdout>>;

const PLACEHOLDER: &str = "—";

// ---------------------------------------------------------------------------
// Setup / teardown
// ---------------------------------------------------------------------------

pub fn setup_terminal() -> anyhow::Result<CrossTerm> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

pub fn teardown_terminal(terminal: &mut CrossTerm) -> anyhow::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Key event handling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Quit,
    CycleSort,
    NextTab,
    PrevTab,
    SelectNext,
    SelectPrev,
    AssignGroup,
    RefreshSelected,
}

pub fn handle_event(event: &Event) -> Option<Action> {
    let Event::Key(k) = event else {
        return None;
    };
    if k.kind == KeyEventKind::Release {
        return None;
    }
    match k.code {
        KeyCode::Char('q') | KeyCode::Char('Q') => Some(Action::Quit),
        KeyCode::Char('c') if k.modifiers.contains(KeyModifiers::CONTROL) => Some(Action::Quit),
        KeyCode::Char('s') => Some(Action::CycleSort),
        KeyCode::Tab => Some(Action::NextTab),
        KeyCode::BackTab => Some(Action::PrevTab),
        KeyCode::Down | KeyCode::Char('j') => Some(Action::SelectNext),
        KeyCode::Up | KeyCode::Char('k') => Some(Action::SelectPrev),
        KeyCode::Char('g') => Some(Action::AssignGroup),
        KeyCode::Char('r') => Some(Action::RefreshSelected),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

pub fn fmt_num(v: Option<f64>) -> String {
    v.map(|n| format!("{n:.2}"))
        .unwrap_or_else(|| PLACEHOLDER.into())
}

pub fn fmt_text(v: Option<&str>) -> String {
    v.unwrap_or(PLACEHOLDER).to_string()
}

pub fn fmt_pct(v: Option<f64>) -> String {
    v.map(|n| format!("{n:+.2}%"))
        .unwrap_or_else(|| PLACEHOLDER.into())
}

fn signed_color(v: Option<f64>) -> Color {
    match v {
        Some(n) if n >= 0.0 => Color::Green,
        Some(_) => Color::Red,
        None => Color::Gray,
    }
}

// ---------------------------------------------------------------------------
// Render
// ---------------------------------------------------------------------------

pub fn render(frame: &mut Frame, state: &AppState, groups: &dyn GroupStore, now: DateTime<Utc>) {
    let area = frame.size();
    let visible = state.visible(groups);

    let outer = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(0),
        ])
        .split(area);

    render_header(frame, outer[0], state, visible.len());
    render_tabs(frame, outer[1], state);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(65), Constraint::Percentage(35)])
        .split(outer[2]);

    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(12), Constraint::Min(0)])
        .split(body[1]);

    match state.view_error() {
        Some(err) => render_error(frame, body[0], err),
        None => render_accounts(frame, body[0], state, &visible, now),
    }
    let selected = visible
        .get(state.selected.min(visible.len().saturating_sub(1)))
        .copied();
    render_detail(frame, right[0], selected, groups, now);
    render_logs(frame, right[1], state);
}

// ---------------------------------------------------------------------------
// Header / tabs
// ---------------------------------------------------------------------------

fn render_header(frame: &mut Frame, area: Rect, state: &AppState, shown: usize) {
    let transport = match state.transport {
        TransportState::Streaming => Span::styled("STREAM●", Style::default().fg(Color::Green)),
        TransportState::Polling => Span::styled("POLL●", Style::default().fg(Color::Yellow)),
        TransportState::AttemptingPush => {
            Span::styled("CONNECTING…", Style::default().fg(Color::Cyan))
        }
        TransportState::Idle => Span::styled("IDLE○", Style::default().fg(Color::Red)),
    };

    let secs = (Utc::now() - state.started_at).num_seconds();
    let uptime = format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60);

    let line = Line::from(vec![
        Span::styled(
            "  Account Monitor  │ ",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!("Up: {uptime}  │ ")),
        Span::raw(format!(
            "Accounts: {shown}/{}  │ ",
            state.registry.len()
        )),
        Span::raw(format!("Sort: {}  │ ", state.sort_key.label())),
        Span::raw(format!("Updates: {}  │ ", state.updates_applied)),
        transport,
        Span::styled(
            "  [s]ort [tab] group [g]roup-assign [r]efresh [q]uit",
            Style::default().fg(Color::DarkGray),
        ),
    ]);

    let header = Paragraph::new(line).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Account Monitor "),
    );
    frame.render_widget(header, area);
}

fn render_tabs(frame: &mut Frame, area: Rect, state: &AppState) {
    let titles: Vec<Line> = std::iter::once(Line::from(crate::models::GroupFilter::ALL_NAME))
        .chain(
            state
                .groups
                .iter()
                .map(|g| Line::from(format!("{} ({})", g.name, g.count))),
        )
        .collect();
    let tabs = Tabs::new(titles)
        .select(state.active_tab)
        .block(Block::default().borders(Borders::ALL).title(" Groups "))
        .highlight_style(
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        );
    frame.render_widget(tabs, area);
}

// ---------------------------------------------------------------------------
// Accounts table
// ---------------------------------------------------------------------------

fn render_accounts(
    frame: &mut Frame,
    area: Rect,
    state: &AppState,
    visible: &[&Account],
    now: DateTime<Utc>,
) {
    let header_cells = [
        "Account", "Login", "Status", "Ccy", "Balance", "Equity", "Margin", "Free", "Net %", "Pos",
    ]
    .iter()
    .map(|h| Cell::from(*h).style(Style::default().add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells)
        .style(Style::default().bg(Color::DarkGray))
        .height(1);

    let rows: Vec<Row> = visible
        .iter()
        .map(|a| {
            let net = net_return_pct(a);
            let status = freshness(a, now, state.fresh_window);
            let status_color = match status {
                Freshness::Live => Color::Green,
                Freshness::Pending => Color::Gray,
            };
            Row::new(vec![
                Cell::from(a.display_label().to_string()),
                Cell::from(format!(
                    "#{} {}",
                    a.login_hint,
                    fmt_text(a.server.as_deref())
                )),
                Cell::from(status.as_str()).style(Style::default().fg(status_color)),
                Cell::from(fmt_text(a.currency.as_deref())),
                Cell::from(fmt_num(a.balance)),
                Cell::from(fmt_num(a.equity)).style(Style::default().add_modifier(Modifier::BOLD)),
                Cell::from(fmt_num(a.margin)),
                Cell::from(fmt_num(a.margin_free)),
                Cell::from(fmt_pct(net))
                    .style(Style::default().fg(signed_color(net)).add_modifier(Modifier::BOLD)),
                Cell::from(a.positions_count.to_string()),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Min(14),
            Constraint::Length(18),
            Constraint::Length(8),
            Constraint::Length(4),
            Constraint::Length(11),
            Constraint::Length(11),
            Constraint::Length(10),
            Constraint::Length(11),
            Constraint::Length(9),
            Constraint::Length(4),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Accounts – {} ({}) ", state.active_filter(), visible.len())),
    )
    .highlight_style(Style::default().add_modifier(Modifier::REVERSED));

    let mut table_state = TableState::default();
    if !visible.is_empty() {
        table_state.select(Some(state.selected.min(visible.len() - 1)));
    }
    frame.render_stateful_widget(table, area, &mut table_state);
}

fn render_error(frame: &mut Frame, area: Rect, err: &str) {
    let p = Paragraph::new(Line::from(Span::styled(
        format!("Error: {err}"),
        Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
    )))
    .block(Block::default().borders(Borders::ALL).title(" Accounts "));
    frame.render_widget(p, area);
}

// ---------------------------------------------------------------------------
// Detail panel
// ---------------------------------------------------------------------------

fn render_detail(
    frame: &mut Frame,
    area: Rect,
    account: Option<&Account>,
    groups: &dyn GroupStore,
    now: DateTime<Utc>,
) {
    let block = Block::default().borders(Borders::ALL).title(" Detail ");
    let Some(a) = account else {
        let p = Paragraph::new("No accounts in this view yet.").block(block);
        frame.render_widget(p, area);
        return;
    };

    let inner = block.inner(area);
    frame.render_widget(block, area);
    let parts = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(5), Constraint::Min(0)])
        .split(inner);

    let updated = a
        .updated_at
        .map(|t| format!("{} ({}s ago)", t.format("%H:%M:%S"), (now - t).num_seconds()))
        .unwrap_or_else(|| PLACEHOLDER.into());
    let trend = equity_trend(a);
    let lines = vec![
        Line::from(Span::styled(
            a.display_label().to_string(),
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from(format!(
            "Size: {}  Group: {}",
            fmt_num(a.account_size),
            groups.group_of(&a.login_hint).unwrap_or_else(|| "—".into())
        )),
        Line::from(format!("Updated: {updated}")),
        Line::from(vec![
            Span::raw("Trend: "),
            Span::styled(
                trend
                    .map(|d| format!("{d:+.2}"))
                    .unwrap_or_else(|| PLACEHOLDER.into()),
                Style::default().fg(signed_color(trend)),
            ),
            Span::raw(format!(" over {} sample(s)", a.equity_history.len())),
        ]),
    ];
    frame.render_widget(Paragraph::new(lines), parts[0]);

    // Sparkline needs u64; shift by the window minimum so small moves show.
    let min = a
        .equity_history
        .iter()
        .map(|s| s.equity)
        .fold(f64::INFINITY, f64::min);
    let data: Vec<u64> = a
        .equity_history
        .iter()
        .map(|s| ((s.equity - min) * 100.0).round().max(0.0) as u64)
        .collect();
    let spark = Sparkline::default()
        .data(&data)
        .style(Style::default().fg(signed_color(trend)));
    frame.render_widget(spark, parts[1]);
}

// ---------------------------------------------------------------------------
// Logs panel
// ---------------------------------------------------------------------------

fn render_logs(frame: &mut Frame, area: Rect, state: &AppState) {
    let items: Vec<ListItem> = state
        .logs
        .iter()
        .take(area.height as usize)
        .map(|line| {
            let color = if line.contains("ERROR") || line.contains("failed") {
                Color::Red
            } else if line.contains("POLLING") {
                Color::Yellow
            } else if line.contains("STREAMING") || line.contains("New account") {
                Color::Green
            } else {
                Color::Gray
            };
            ListItem::new(Line::from(Span::styled(
                line.clone(),
                Style::default().fg(color),
            )))
        })
        .collect();

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(" Logs "))
        .style(Style::default().fg(Color::White));

    frame.render_widget(list, area);
}

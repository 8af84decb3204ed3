mod tui_app;

use std::io;
use std::time::Duration;

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use tui_app::{
    format_price, format_spread, format_timestamp, format_volume, truncate, AppState,
    ConnectionStatus, DuplicateRow, QuoteResponse,
};

const REFRESH_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> io::Result<()> {
    let base_url = std::env::var("API_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(io::Error::other)?;

    let mut app = AppState::new(base_url);

    // Initial fetch before rendering
    app.refresh(&client).await;

    // Terminal setup
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut table_state = TableState::default();
    table_state.select(None);

    let result = run_loop(&mut terminal, &mut app, &client, &mut table_state).await;

    // Restore terminal regardless of result
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    result
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

async fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut AppState,
    client: &reqwest::Client,
    table_state: &mut TableState,
) -> io::Result<()> {
    let refresh_interval = Duration::from_secs(REFRESH_SECS);
    let mut last_tick = std::time::Instant::now();

    loop {
        terminal.draw(|f| render(f, app, table_state))?;

        let timeout = refresh_interval
            .checked_sub(last_tick.elapsed())
            .unwrap_or(Duration::ZERO);

        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') => return Ok(()),
                        KeyCode::Char('r') | KeyCode::Char('R') => {
                            app.refresh(client).await;
                            last_tick = std::time::Instant::now();
                        }
                        KeyCode::Down | KeyCode::Char('j') => {
                            let max = app.rows.len().saturating_sub(1);
                            let next = table_state.selected().map_or(0, |i| (i + 1).min(max));
                            table_state.select(Some(next));
                        }
                        KeyCode::Up | KeyCode::Char('k') => {
                            let prev = table_state
                                .selected()
                                .map_or(0, |i| i.saturating_sub(1));
                            table_state.select(Some(prev));
                        }
                        _ => {}
                    }
                }
            }
        }

        if last_tick.elapsed() >= refresh_interval {
            app.refresh(client).await;
            last_tick = std::time::Instant::now();
        }
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, app: &AppState, table_state: &mut TableState) {
    let area = f.area();

    // Outer vertical split: header | links | detail | footer
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(0),    // links
            Constraint::Length(6), // selected link detail
            Constraint::Length(1), // footer
        ])
        .split(area);

    render_header(f, app, chunks[0]);
    render_links_table(f, app, table_state, chunks[1]);
    let selected = table_state.selected().and_then(|i| app.rows.get(i));
    render_detail(f, selected, chunks[2]);
    render_footer(f, chunks[3]);
}

fn render_header(f: &mut Frame, app: &AppState, area: Rect) {
    let (status_text, status_color) = match &app.status {
        ConnectionStatus::Connected => ("● connected".to_string(), Color::Green),
        ConnectionStatus::Connecting => ("◌ connecting".to_string(), Color::Yellow),
        ConnectionStatus::Error(e) => (format!("✗ {}", truncate(e, 40)), Color::Red),
    };

    let listings = app
        .health
        .listings
        .iter()
        .map(|(venue, n)| format!("{venue} {n}"))
        .collect::<Vec<_>>()
        .join(" · ");

    let last_dedup = format_timestamp(app.health.last_dedup_at.as_deref());

    let title_spans = vec![
        Span::styled(
            " Market Aggregator  ",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::styled(status_text, Style::default().fg(status_color)),
        Span::raw("  │  "),
        Span::styled(
            format!("{} links ({} incomplete)", app.rows.len(), app.incomplete_count()),
            Style::default().fg(Color::White),
        ),
        Span::raw("  │  "),
        Span::styled(listings, Style::default().fg(Color::White)),
        Span::raw("  │  "),
        Span::styled(
            format!("last dedup {last_dedup} (+{})", app.health.last_dedup_new_links),
            Style::default().fg(Color::White),
        ),
    ];

    let paragraph = Paragraph::new(Line::from(title_spans))
        .block(Block::default().borders(Borders::ALL).border_style(
            Style::default().fg(Color::DarkGray),
        ));

    f.render_widget(paragraph, area);
}

fn quote_cells(q: Option<&QuoteResponse>) -> [Cell<'static>; 3] {
    match q {
        Some(q) => [
            Cell::from(truncate(&q.title, 32)),
            Cell::from(format_price(q.yes_price)),
            Cell::from(format_price(q.no_price)),
        ],
        None => [
            Cell::from("(missing)").style(Style::default().fg(Color::DarkGray)),
            Cell::from("—"),
            Cell::from("—"),
        ],
    }
}

fn render_links_table(f: &mut Frame, app: &AppState, state: &mut TableState, area: Rect) {
    let header_cells = ["#", "Market A", "Yes", "No", "Market B", "Yes", "No", "Spread", "Score"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells).height(1);

    let rows: Vec<Row> = app
        .rows
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let spread = r.yes_spread();
            let spread_color = match spread.map(f64::abs) {
                Some(s) if s >= 0.05 => Color::Green,
                Some(s) if s >= 0.02 => Color::Yellow,
                Some(_) => Color::White,
                None => Color::DarkGray,
            };
            let score_color = if r.score >= 0.8 {
                Color::Green
            } else if r.score >= 0.65 {
                Color::Yellow
            } else {
                Color::White
            };

            let [a_title, a_yes, a_no] = quote_cells(r.a_quote.as_ref());
            let [b_title, b_yes, b_no] = quote_cells(r.b_quote.as_ref());
            let row = Row::new(vec![
                Cell::from(format!("{}", i + 1)).style(Style::default().fg(Color::DarkGray)),
                a_title,
                a_yes,
                a_no,
                b_title,
                b_yes,
                b_no,
                Cell::from(format_spread(spread)).style(Style::default().fg(spread_color)),
                Cell::from(format!("{:.2}", r.score)).style(Style::default().fg(score_color)),
            ]);
            if r.complete {
                row
            } else {
                row.style(Style::default().fg(Color::DarkGray))
            }
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(4),
            Constraint::Min(12),
            Constraint::Length(5),
            Constraint::Length(5),
            Constraint::Min(12),
            Constraint::Length(5),
            Constraint::Length(5),
            Constraint::Length(7),
            Constraint::Length(5),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray))
            .title(Span::styled(
                " CROSS-VENUE DUPLICATES ",
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            )),
    )
    .row_highlight_style(
        Style::default()
            .bg(Color::DarkGray)
            .add_modifier(Modifier::BOLD),
    );

    f.render_stateful_widget(table, area, state);
}

fn side_line(label: String, q: Option<&QuoteResponse>) -> Line<'static> {
    let detail = match q {
        Some(q) => format!(
            "vol {}  vol24h {}  closes {}  updated {}",
            format_volume(&q.volume),
            format_volume(&q.volume_24h),
            format_timestamp(q.close_time.as_deref()),
            format_timestamp(Some(q.last_updated.as_str())),
        ),
        None => "listing no longer cached".to_string(),
    };
    Line::from(vec![
        Span::styled(format!(" {label:<28}"), Style::default().fg(Color::Cyan)),
        Span::raw(detail),
    ])
}

fn render_detail(f: &mut Frame, selected: Option<&DuplicateRow>, area: Rect) {
    let lines = match selected {
        Some(r) => vec![
            side_line(format!("{}:{}", r.a.venue, truncate(&r.a.external_id, 18)), r.a_quote.as_ref()),
            side_line(format!("{}:{}", r.b.venue, truncate(&r.b.external_id, 18)), r.b_quote.as_ref()),
        ],
        None => vec![Line::from(Span::styled(
            " select a link to compare volumes and close times",
            Style::default().fg(Color::DarkGray),
        ))],
    };
    let paragraph = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray))
            .title(Span::styled(
                " DETAIL ",
                Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            )),
    );
    f.render_widget(paragraph, area);
}

fn render_footer(f: &mut Frame, area: Rect) {
    let line = Line::from(vec![
        Span::styled(" [q] ", Style::default().fg(Color::Yellow)),
        Span::raw("quit  "),
        Span::styled("[r] ", Style::default().fg(Color::Yellow)),
        Span::raw("refresh  "),
        Span::styled("[↑↓ / j k] ", Style::default().fg(Color::Yellow)),
        Span::raw("select link  "),
        Span::styled(
            format!("auto-refresh: {REFRESH_SECS}s"),
            Style::default().fg(Color::DarkGray),
        ),
    ]);
    let paragraph = Paragraph::new(line).style(Style::default().fg(Color::White));
    f.render_widget(paragraph, area);
}

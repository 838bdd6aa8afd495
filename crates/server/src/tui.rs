use std::collections::VecDeque;

use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Gauge, List, ListItem, Paragraph, Row, Table, Tabs};

use worldsync::{ServerEvent, SessionId};

use crate::server::{Dashboard, SessionInfo};

const MAX_LOG_LINES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tab {
    Overview,
    Sessions,
    Log,
}

impl Tab {
    const ALL: [Tab; 3] = [Tab::Overview, Tab::Sessions, Tab::Log];

    fn title(self) -> &'static str {
        match self {
            Tab::Overview => "Overview",
            Tab::Sessions => "Sessions",
            Tab::Log => "Log",
        }
    }

    fn index(self) -> usize {
        Self::ALL.iter().position(|t| *t == self).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy)]
enum Level {
    Info,
    Warn,
    Error,
}

#[derive(Debug)]
pub struct TuiState {
    tab: Tab,
    log: VecDeque<(Level, String)>,
    scroll: usize,
    selected: usize,
    pending_kick: Option<SessionId>,
}

impl TuiState {
    pub fn new() -> Self {
        Self {
            tab: Tab::Overview,
            log: VecDeque::new(),
            scroll: 0,
            selected: 0,
            pending_kick: None,
        }
    }

    pub fn active_tab(&self) -> Tab {
        self.tab
    }

    pub fn next_tab(&mut self) {
        self.tab = Tab::ALL[(self.tab.index() + 1) % Tab::ALL.len()];
    }

    pub fn prev_tab(&mut self) {
        self.tab = Tab::ALL[(self.tab.index() + Tab::ALL.len() - 1) % Tab::ALL.len()];
    }

    pub fn log_info(&mut self, message: impl Into<String>) {
        self.push(Level::Info, message.into());
    }

    pub fn log_warn(&mut self, message: impl Into<String>) {
        self.push(Level::Warn, message.into());
    }

    pub fn log_error(&mut self, message: impl Into<String>) {
        self.push(Level::Error, message.into());
    }

    fn push(&mut self, level: Level, message: String) {
        if self.log.len() == MAX_LOG_LINES {
            self.log.pop_front();
        }
        self.log.push_back((level, message));
    }

    pub fn record(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::SessionConnecting { addr } => {
                self.log_info(format!("Connection request from {}", addr));
            }
            ServerEvent::SessionConnected {
                session,
                addr,
                player,
            } => {
                self.log_info(format!("{} connected from {} (player {})", session, addr, player));
            }
            ServerEvent::SessionDisconnected {
                session,
                reason,
                reclaimed,
            } => {
                self.log_info(format!(
                    "{} {}, {} entities reclaimed",
                    session,
                    reason.as_str(),
                    reclaimed
                ));
            }
            ServerEvent::ConnectionDenied { addr, reason } => {
                self.log_warn(format!("Connection denied to {}: {}", addr, reason));
            }
            ServerEvent::Error { message } => self.log_error(message.clone()),
        }
    }

    pub fn scroll_up(&mut self) {
        self.scroll = (self.scroll + 10).min(self.log.len());
    }

    pub fn scroll_down(&mut self) {
        self.scroll = self.scroll.saturating_sub(10);
    }

    pub fn scroll_to_bottom(&mut self) {
        self.scroll = 0;
    }

    pub fn select_prev(&mut self, count: usize) {
        if count > 0 {
            self.selected = (self.selected + count - 1) % count;
        }
    }

    pub fn select_next(&mut self, count: usize) {
        if count > 0 {
            self.selected = (self.selected + 1) % count;
        }
    }

    pub fn request_kick(&mut self, sessions: &[SessionInfo]) {
        if let Some(session) = sessions.get(self.selected) {
            self.pending_kick = Some(session.id);
            self.log_info(format!("Kicking {}", session.id));
        }
    }

    pub fn take_pending_kick(&mut self) -> Option<SessionId> {
        self.pending_kick.take()
    }
}

pub fn render(frame: &mut Frame, state: &TuiState, dashboard: &Dashboard) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, chunks[0], dashboard);
    render_tabs(frame, chunks[1], state);
    match state.tab {
        Tab::Overview => render_overview(frame, chunks[2], dashboard),
        Tab::Sessions => render_sessions(frame, chunks[2], state, &dashboard.sessions),
        Tab::Log => render_log(frame, chunks[2], state),
    }
    render_help(frame, chunks[3], state.tab);
}

fn render_header(frame: &mut Frame, area: Rect, dashboard: &Dashboard) {
    let title = format!(
        " worldsync {} - Uptime: {} ",
        dashboard.local_addr,
        format_duration(dashboard.uptime_secs)
    );

    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let stats = &dashboard.stats;
    let text = format!(
        "Tick: {}  |  Sessions: {}  |  Entities: {}",
        stats.tick, stats.session_count, stats.entity_count
    );

    let paragraph = Paragraph::new(text)
        .block(block)
        .style(Style::default().fg(Color::White));

    frame.render_widget(paragraph, area);
}

fn render_tabs(frame: &mut Frame, area: Rect, state: &TuiState) {
    let tabs = Tabs::new(Tab::ALL.iter().map(|t| t.title()))
        .select(state.tab.index())
        .block(Block::default().borders(Borders::ALL))
        .highlight_style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        );
    frame.render_widget(tabs, area);
}

fn render_overview(frame: &mut Frame, area: Rect, dashboard: &Dashboard) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)])
        .split(area);

    let stats = &dashboard.stats;
    let ratio = if stats.max_sessions == 0 {
        1.0
    } else {
        stats.session_count as f64 / stats.max_sessions as f64
    };
    let gauge = Gauge::default()
        .block(
            Block::default()
                .title(" Sessions ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Green)),
        )
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(ratio.min(1.0))
        .label(format!("{}/{} sessions", stats.session_count, stats.max_sessions));
    frame.render_widget(gauge, chunks[0]);

    let net = &stats.network;
    let lines = vec![
        Line::from(vec![
            Span::styled("Packets: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!(
                    "{} sent / {} recv / {} dropped",
                    net.packets_sent, net.packets_received, net.packets_dropped
                ),
                Style::default().fg(Color::White),
            ),
        ]),
        Line::from(vec![
            Span::styled("Bytes: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!(
                    "{} sent / {} recv",
                    format_bytes(net.bytes_sent),
                    format_bytes(net.bytes_received)
                ),
                Style::default().fg(Color::White),
            ),
        ]),
    ];

    let paragraph = Paragraph::new(lines).block(
        Block::default()
            .title(" Network ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow)),
    );
    frame.render_widget(paragraph, chunks[1]);
}

fn render_sessions(frame: &mut Frame, area: Rect, state: &TuiState, sessions: &[SessionInfo]) {
    let rows = sessions.iter().enumerate().map(|(i, s)| {
        let style = if i == state.selected {
            Style::default().fg(Color::Black).bg(Color::Cyan)
        } else {
            Style::default().fg(Color::White)
        };
        Row::new(vec![
            s.id.to_string(),
            s.addr.to_string(),
            s.player.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            s.packets_received.to_string(),
            format!("{}ms", s.idle_ms),
            s.in_flight.to_string(),
        ])
        .style(style)
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(12),
            Constraint::Length(22),
            Constraint::Min(20),
            Constraint::Length(10),
            Constraint::Length(10),
            Constraint::Length(10),
        ],
    )
    .header(
        Row::new(vec!["Session", "Address", "Player", "Recv", "Idle", "Unacked"])
            .style(Style::default().fg(Color::Yellow)),
    )
    .block(Block::default().title(" Sessions ").borders(Borders::ALL));

    frame.render_widget(table, area);
}

fn render_log(frame: &mut Frame, area: Rect, state: &TuiState) {
    let visible = area.height.saturating_sub(2) as usize;
    let end = state.log.len().saturating_sub(state.scroll);
    let start = end.saturating_sub(visible);

    let items: Vec<ListItem> = state
        .log
        .range(start..end)
        .map(|(level, message)| {
            let color = match level {
                Level::Info => Color::White,
                Level::Warn => Color::Yellow,
                Level::Error => Color::Red,
            };
            ListItem::new(Line::from(Span::styled(
                message.as_str(),
                Style::default().fg(color),
            )))
        })
        .collect();

    let list = List::new(items).block(Block::default().title(" Log ").borders(Borders::ALL));
    frame.render_widget(list, area);
}

fn render_help(frame: &mut Frame, area: Rect, tab: Tab) {
    let block = Block::default()
        .title(" Controls ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let hint = match tab {
        Tab::Sessions => "Up/Down select  |  k kick  |  Tab switch  |  q quit",
        Tab::Log => "PgUp/PgDn scroll  |  End latest  |  Tab switch  |  q quit",
        Tab::Overview => "Tab switch  |  q quit",
    };
    let text = Paragraph::new(hint).block(block).style(
        Style::default()
            .fg(Color::DarkGray)
            .add_modifier(Modifier::ITALIC),
    );

    frame.render_widget(text, area);
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, mins, secs)
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

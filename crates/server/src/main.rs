mod config;
mod server;
mod simulation;
mod tui;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use tokio::sync::{mpsc, watch};

use config::ServerConfig;
use server::{Command, Dashboard, WorldServer};
use tui::TuiState;
use worldsync::ServerEvent;

#[derive(Parser)]
#[command(name = "worldsync-server")]
#[command(about = "Authoritative world replication server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = worldsync::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = worldsync::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_sessions: usize,

    #[arg(long, default_value_t = 30_000, help = "Idle time before a session is dropped")]
    session_timeout_ms: u64,

    #[arg(long, default_value_t = 4, help = "Server-driven entities placed at startup")]
    turntables: usize,

    #[arg(long)]
    headless: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let bind: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    let config = ServerConfig {
        bind,
        tick_rate: args.tick_rate,
        max_sessions: args.max_sessions,
        session_timeout_ms: args.session_timeout_ms,
        turntables: args.turntables,
        ..Default::default()
    };

    if args.headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let server = WorldServer::bind(config).await?;
    let (command_tx, command_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (dashboard_tx, dashboard_rx) = watch::channel(server.dashboard());
    let local_addr = server.local_addr();

    let tick_loop = tokio::spawn(server.run(command_rx, event_tx, dashboard_tx));

    if args.headless {
        log::info!("Server started on {}", local_addr);
        tokio::select! {
            _ = tokio::signal::ctrl_c() => log::info!("Received Ctrl+C"),
            _ = log_events(event_rx) => {}
        }
        let _ = command_tx.send(Command::Shutdown).await;
    } else {
        let tui_commands = command_tx.clone();
        tokio::task::spawn_blocking(move || run_with_tui(dashboard_rx, event_rx, tui_commands))
            .await??;
        let _ = command_tx.send(Command::Shutdown).await;
    }

    tick_loop.await??;
    Ok(())
}

async fn log_events(mut events: mpsc::UnboundedReceiver<ServerEvent>) {
    while let Some(event) = events.recv().await {
        log::debug!("{:?}", event);
    }
}

fn run_with_tui(
    dashboard: watch::Receiver<Dashboard>,
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    commands: mpsc::Sender<Command>,
) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut tui_state = TuiState::new();
    tui_state.log_info(format!("Server started on {}", dashboard.borrow().local_addr));

    loop {
        while let Ok(event) = events.try_recv() {
            tui_state.record(&event);
        }

        if let Some(session) = tui_state.take_pending_kick() {
            let _ = commands.blocking_send(Command::Kick(session));
        }

        let snapshot = dashboard.borrow().clone();

        if event::poll(Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    let sessions = &snapshot.sessions;
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => break,
                        KeyCode::Tab => tui_state.next_tab(),
                        KeyCode::BackTab => tui_state.prev_tab(),
                        KeyCode::PageUp => tui_state.scroll_up(),
                        KeyCode::PageDown => tui_state.scroll_down(),
                        KeyCode::End => tui_state.scroll_to_bottom(),
                        KeyCode::Up if tui_state.active_tab() == tui::Tab::Sessions => {
                            tui_state.select_prev(sessions.len());
                        }
                        KeyCode::Down if tui_state.active_tab() == tui::Tab::Sessions => {
                            tui_state.select_next(sessions.len());
                        }
                        KeyCode::Char('k') | KeyCode::Char('K')
                            if tui_state.active_tab() == tui::Tab::Sessions =>
                        {
                            tui_state.request_kick(sessions);
                        }
                        _ => {}
                    }
                }
            }
        }

        terminal.draw(|frame| {
            tui::render(frame, &tui_state, &snapshot);
        })?;
    }

    tui_state.log_info("Shutting down...");

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    Ok(())
}

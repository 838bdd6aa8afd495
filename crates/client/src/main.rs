mod bot;
mod config;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;

use bot::Bot;
use config::BotConfig;
use worldsync::{FixedTimestep, MAX_PACKET_SIZE, Outbox};

#[derive(Parser)]
#[command(name = "worldsync-bot")]
#[command(about = "Headless client that exercises a worldsync server")]
struct Args {
    #[arg(short, long, help = "Server address to connect to (e.g., 127.0.0.1:27015)")]
    server: Option<SocketAddr>,

    #[arg(short, long, default_value_t = worldsync::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(long, default_value_t = 2, help = "Entities to create and own")]
    crates: usize,

    #[arg(long, help = "Do not claim a server-driven entity")]
    no_claim: bool,

    #[arg(long, default_value_t = 30, help = "Seconds to run before leaving")]
    run_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let defaults = BotConfig::default();
    let config = BotConfig {
        server: args.server.unwrap_or(defaults.server),
        tick_rate: args.tick_rate,
        crates: args.crates,
        claim_server_entity: !args.no_claim,
        run_secs: args.run_secs,
        ..defaults
    };

    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))).await?;
    socket.connect(config.server).await?;
    log::info!("bound to {}", socket.local_addr()?);

    run(socket, config).await
}

async fn run(socket: UdpSocket, config: BotConfig) -> Result<()> {
    let connect_timeout_ms = config.connect_timeout_ms;
    let mut timestep = FixedTimestep::new(config.tick_rate);
    let mut bot = Bot::new(config);
    let mut outbox = Outbox::new();
    let mut buf = vec![0u8; MAX_PACKET_SIZE * 2];

    let started = Instant::now();
    let now_ms = || started.elapsed().as_millis() as u64;
    bot.connect(now_ms());

    let mut interval = tokio::time::interval(Duration::from_millis(timestep.tick_ms()));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last = Instant::now();
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                log::info!("Received Ctrl+C, leaving");
                interrupted = true;
                bot.wind_down();
            }
        }

        let now = Instant::now();
        timestep.accumulate(now.duration_since(last).as_millis() as u64);
        last = now;

        while let Ok(len) = socket.try_recv(&mut buf) {
            bot.handle_packet(&buf[..len], now_ms());
        }

        if let Some(reason) = bot.client().denied_reason() {
            bail!("connection denied: {}", reason);
        }
        if !bot.client().is_connected() && !bot.is_finished() {
            if bot.client().session_id().is_some() {
                log::warn!("server closed the session");
                break;
            }
            if now_ms() > connect_timeout_ms {
                bail!("no answer from {} after {}ms", socket.peer_addr()?, connect_timeout_ms);
            }
        }

        while timestep.consume_tick() {
            if let Err(e) = bot.tick(now_ms(), &mut outbox) {
                log::error!("send failed: {}", e);
            }
        }

        for (_, datagram) in outbox.drain() {
            if let Err(e) = socket.send(&datagram).await {
                log::warn!("send failed: {}", e);
            }
        }

        if bot.is_finished() {
            break;
        }
    }

    Ok(())
}

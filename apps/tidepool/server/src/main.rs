use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use tidepool::config::{
    DEFAULT_COOKIE, DEFAULT_MAX_PACKAGE_SIZE, DEFAULT_PING_INTERVAL, DEFAULT_PING_TIMEOUT,
    DEFAULT_POLL_TIMEOUT, DEFAULT_UPGRADE_TIMEOUT,
};
use tidepool::io::Server;
use tidepool::listener::{Listener, DEFAULT_PATH};
use tidepool::telemetry::Telemetry;
use tidepool::{Engine, EngineConfig, OriginPolicy, TransportKind};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

#[derive(Debug, Clone)]
struct ServerConfig {
    listen_addr: SocketAddr,
    path: String,
    shutdown_grace: Duration,
    engine: EngineConfig,
}

#[derive(Debug, Parser)]
#[command(
    name = "tidepool-server",
    author,
    version,
    about = "Realtime event server over long-polling and WebSocket"
)]
struct Cli {
    /// Address to bind the listener to.
    #[arg(long, env = "TIDEPOOL_LISTEN_ADDR", default_value = "0.0.0.0:2020")]
    listen_addr: String,

    /// URL prefix the engine answers under.
    #[arg(long, env = "TIDEPOOL_PATH", default_value = DEFAULT_PATH)]
    path: String,

    #[arg(long, env = "TIDEPOOL_PING_INTERVAL_MS", default_value_t = DEFAULT_PING_INTERVAL.as_millis() as u64)]
    ping_interval_ms: u64,

    #[arg(long, env = "TIDEPOOL_PING_TIMEOUT_MS", default_value_t = DEFAULT_PING_TIMEOUT.as_millis() as u64)]
    ping_timeout_ms: u64,

    #[arg(long, env = "TIDEPOOL_UPGRADE_TIMEOUT_MS", default_value_t = DEFAULT_UPGRADE_TIMEOUT.as_millis() as u64)]
    upgrade_timeout_ms: u64,

    /// How long an idle polling GET is held open.
    #[arg(long, env = "TIDEPOOL_POLL_TIMEOUT_MS", default_value_t = DEFAULT_POLL_TIMEOUT.as_millis() as u64)]
    poll_timeout_ms: u64,

    /// Largest accepted request, head and body together, in bytes.
    #[arg(long, env = "TIDEPOOL_MAX_PACKAGE_SIZE", default_value_t = DEFAULT_MAX_PACKAGE_SIZE)]
    max_package_size: usize,

    /// Comma-separated list of enabled transports.
    #[arg(long, env = "TIDEPOOL_TRANSPORTS", default_value = "polling,websocket")]
    transports: String,

    #[arg(long, env = "TIDEPOOL_ALLOW_UPGRADES", default_value_t = true, action = clap::ArgAction::Set)]
    allow_upgrades: bool,

    /// Space-separated origin allow-list; `*:*` admits everything.
    #[arg(long, env = "TIDEPOOL_ORIGINS", default_value = "*:*")]
    origins: String,

    /// Cookie name carrying the sid; empty disables it.
    #[arg(long, env = "TIDEPOOL_COOKIE", default_value = DEFAULT_COOKIE)]
    cookie: String,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TIDEPOOL_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;

        let mut transports = Vec::new();
        for name in cli.transports.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            let kind = TransportKind::from_name(name)
                .with_context(|| format!("unknown transport: {name}"))?;
            if !transports.contains(&kind) {
                transports.push(kind);
            }
        }
        if transports.is_empty() {
            bail!("at least one transport must be enabled");
        }

        let path = if cli.path.ends_with('/') {
            cli.path
        } else {
            format!("{}/", cli.path)
        };
        let origins: OriginPolicy = cli.origins.parse()?;

        Ok(ServerConfig {
            listen_addr,
            path,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            engine: EngineConfig {
                ping_interval: Duration::from_millis(cli.ping_interval_ms),
                ping_timeout: Duration::from_millis(cli.ping_timeout_ms),
                upgrade_timeout: Duration::from_millis(cli.upgrade_timeout_ms),
                poll_timeout: Duration::from_millis(cli.poll_timeout_ms),
                max_package_size: cli.max_package_size,
                transports,
                allow_upgrades: cli.allow_upgrades,
                origins,
                cookie: (!cli.cookie.is_empty()).then_some(cli.cookie),
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        path = %config.path,
        transports = ?config.engine.transports,
        "starting tidepool server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let (engine, connections) = Engine::new(config.engine.clone());
    let io = Server::new();
    install_demo_handlers(&io);
    let binder = io.bind(connections);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening");

    let host = Arc::new(Listener::new(engine.clone(), config.path.clone(), Some(metrics)));
    host.serve(listener, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        sessions = engine.session_count(),
        "shutdown signal received; closing sessions"
    );
    engine.close_all();
    tokio::time::sleep(config.shutdown_grace).await;
    binder.abort();
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

/// Echoes `message` back to the sender and rebroadcasts `broadcast` to the
/// whole default namespace.
fn install_demo_handlers(io: &Server) {
    io.of("/").on_connection(|socket| {
        info!(socket_id = %socket.id(), "socket connected");

        socket.on("message", |socket, event| {
            let reply: Vec<Value> = event.args.clone();
            socket.emit("message", reply);
            if let Some(ack) = event.ack {
                ack.send(vec![json!("ok")]);
            }
        });

        socket.on("broadcast", |socket, event| {
            if let Some(namespace) = socket.namespace() {
                namespace.emit("broadcast", event.args);
            }
        });

        socket.on_disconnect(|socket, reason| {
            info!(socket_id = %socket.id(), reason, "socket disconnected");
        });
    });
}

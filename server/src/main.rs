use clap::Parser;
use log::{error, info};
use server::auth::AccountClient;
use server::config::{ServerConfig, ServerInfo};
use server::counters::CounterStore;
use server::network::Server;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, env = "CHESS_HALL_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "CHESS_HALL_PORT", default_value = "2424")]
    port: u16,

    /// Base URL of the account service
    #[arg(long, env = "CHESS_HALL_ACCOUNT_URL", default_value = "http://127.0.0.1:810")]
    account_url: String,

    /// Seconds to wait for the account service
    #[arg(long, env = "CHESS_HALL_AUTH_TIMEOUT_SECS", default_value = "10")]
    auth_timeout_secs: u64,

    /// Counter snapshot file
    #[arg(long, env = "CHESS_HALL_SNAPSHOT_PATH", default_value = "counters.json")]
    snapshot_path: PathBuf,

    /// Seconds between periodic counter flushes
    #[arg(long, env = "CHESS_HALL_FLUSH_INTERVAL_SECS", default_value = "120")]
    flush_interval_secs: u64,

    /// Seconds between keepalive pings
    #[arg(long, env = "CHESS_HALL_KEEPALIVE_SECS", default_value = "20")]
    keepalive_secs: u64,

    /// Unanswered pings before a connection is dropped
    #[arg(long, env = "CHESS_HALL_KEEPALIVE_MAX_MISSED", default_value = "3")]
    keepalive_max_missed: u32,

    /// Maximum concurrent connections
    #[arg(short = 'm', long, env = "CHESS_HALL_MAX_CONNECTIONS", default_value = "256")]
    max_connections: usize,

    /// Release pieces held idle this long (0 disables)
    #[arg(long, env = "CHESS_HALL_PIECE_HOLD_TIMEOUT_SECS", default_value = "0")]
    piece_hold_timeout_secs: u64,

    /// PEM file handed to clients on connect
    #[arg(long, env = "CHESS_HALL_PUBLIC_KEY_FILE")]
    public_key_file: Option<PathBuf>,

    /// Version reported in server_config
    #[arg(long, env = "CHESS_HALL_SERVER_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    server_version: String,

    #[arg(long, env = "CHESS_HALL_SERVER_KEY", default_value = "cc1")]
    server_key: String,

    /// Public URL reported in server_config
    #[arg(long, env = "CHESS_HALL_SERVER_URL", default_value = "ws://127.0.0.1:2424")]
    server_url: String,

    #[arg(long, env = "CHESS_HALL_SERVER_NAME", default_value = "Chinese Chess Hall")]
    server_name: String,

    /// Logins beyond this many are refused
    #[arg(long, env = "CHESS_HALL_MAX_ONLINE", default_value = "100")]
    max_online: u64,

    /// Whether clients may play without an account
    #[arg(long, env = "CHESS_HALL_ANONYMOUS_LOGIN", default_value_t = true, action = clap::ArgAction::Set)]
    anonymous_login: bool,
}

impl Args {
    fn into_config(self, public_key: String) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            account_url: self.account_url,
            auth_timeout: Duration::from_secs(self.auth_timeout_secs),
            snapshot_path: self.snapshot_path,
            flush_interval: Duration::from_secs(self.flush_interval_secs.max(1)),
            keepalive_interval: Duration::from_secs(self.keepalive_secs.max(1)),
            keepalive_max_missed: self.keepalive_max_missed,
            max_connections: self.max_connections,
            piece_hold_timeout: (self.piece_hold_timeout_secs > 0)
                .then(|| Duration::from_secs(self.piece_hold_timeout_secs)),
            info: ServerInfo {
                version: self.server_version,
                anonymous_login: self.anonymous_login,
                key: self.server_key,
                url: self.server_url,
                name: self.server_name,
                max_online: self.max_online,
                public_key,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let public_key = match &args.public_key_file {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => String::new(),
    };
    let config = args.into_config(public_key);

    info!("Starting chess hall on {}", config.bind_addr);
    info!("Account service: {}", config.account_url);
    if let Some(timeout) = config.piece_hold_timeout {
        info!("Idle pieces released after {:?}", timeout);
    }

    let mut counters = CounterStore::load(&config.snapshot_path).await?;
    counters.reset_online();

    let verifier = AccountClient::new(&config.account_url, config.auth_timeout)?;
    let server = Server::bind(config, counters, Arc::new(verifier)).await?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down gracefully...");
    };

    server.run_until(shutdown).await?;
    Ok(())
}

//! Command-line probe that talks to a running hall server.
//!
//! Connects, prints the public key banner, queries the server config, the
//! counters and the board, and optionally performs a token login and claims a seat.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use serde_json::json;
use shared::{kind, Envelope};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server WebSocket URL
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:2424")]
    server: String,

    /// Account user id for token login
    #[arg(long)]
    user_id: Option<String>,

    /// Account token for token login
    #[arg(long)]
    token: Option<String>,

    /// Seat to claim after logging in: red or black
    #[arg(long)]
    camp: Option<String>,

    /// Seconds to wait for each reply
    #[arg(long, default_value = "5")]
    wait_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let wait = Duration::from_secs(args.wait_secs);

    info!("Connecting to {}", args.server);
    let (ws, _) = connect_async(args.server.as_str()).await?;
    let (mut sink, mut stream) = ws.split();

    let mut requests = vec![
        Envelope::new(kind::PING, json!("")),
        Envelope::new(kind::GET_SERVER_CONFIG, json!("")),
        Envelope::new(kind::GET_STORAGE_JSON, json!("")),
        Envelope::new(kind::GET_CAMP_DATA, json!("")),
        Envelope::new(kind::GET_SYNC_CHESS_PIECES, json!("")),
    ];

    if let (Some(user_id), Some(token)) = (&args.user_id, &args.token) {
        requests.push(Envelope::new(
            kind::GET_TOKEN_LOGIN,
            json!({ "user_id": user_id, "user_token": token }),
        ));
        match args.camp.as_deref() {
            Some("red") => requests.push(Envelope::new(kind::GET_SELECT_CAMP_RED, json!(""))),
            Some("black") => requests.push(Envelope::new(kind::GET_SELECT_CAMP_BLACK, json!(""))),
            Some(other) => warn!("Ignoring unknown camp '{}'", other),
            None => {}
        }
    }

    for request in &requests {
        sink.send(Message::Text(request.encode()?)).await?;
    }

    loop {
        match timeout(wait, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match Envelope::decode(&text) {
                Ok(envelope) if envelope.kind == kind::PUBLICKEY => {
                    let key = envelope.data.as_str().unwrap_or_default();
                    println!("publickey: {} bytes", key.len());
                }
                Ok(envelope) => {
                    println!("{} {} {}", envelope.kind, envelope.class, envelope.data);
                }
                Err(e) => warn!("Unreadable frame: {}", e),
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                info!("Server closed the connection");
                break;
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => return Err(e.into()),
            Err(_) => {
                info!("No reply within {:?}, done", wait);
                break;
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    Ok(())
}

//! # Chess Hall Server Library
//!
//! This library provides the authoritative server for a shared Chinese chess
//! hall. Players connect over WebSocket, log in with a token issued by an
//! external account service, take the red or black seat and handle the 32
//! pieces of a single board. The server owns the board, the seats and the
//! hall counters; clients only ever see state the server has accepted.
//!
//! ## Core Responsibilities
//!
//! ### Piece Locking
//! A piece can be held by one session at a time. The first pick-up to reach
//! the server wins and every later attempt is silently ignored until the
//! holder puts the piece down, resets the board or disconnects.
//!
//! ### Seat Arbitration
//! The red and black seats each hold at most one live session. Claiming one
//! seat while holding the other switches sides; claiming an occupied seat
//! fails without disturbing the claimant.
//!
//! ### Relay
//! Broadcast messages are re-stamped with the sender's verified identity and
//! fanned out to everyone else. Spoofed identities in client frames are
//! discarded.
//!
//! ### Counters
//! Visits, hearts and the online count survive restarts through a JSON
//! snapshot written on change and on a fixed interval.
//!
//! ## Architecture Design
//!
//! ### Single Writer
//! Every connection task forwards decoded envelopes over one channel to the
//! dispatch loop, which is the only code that touches hall state. Handlers
//! never suspend, so each one observes and leaves a consistent state without
//! any locking.
//!
//! ### Effects as Data
//! The [`dispatcher::Dispatcher`] returns the sends, broadcasts, logins and
//! flushes it wants as [`dispatcher::Outbound`] values. The network layer
//! carries them out, which keeps the rules testable without sockets.
//!
//! ### Bounded Fanout
//! Each connection has a bounded outbound queue. A slow reader loses frames
//! instead of holding up the loop or other players.
//!
//! ## Module Organization
//!
//! - `auth`: token exchange with the account service
//! - `client_manager`: per-connection sessions and capacity
//! - `config`: runtime settings
//! - `counters`: visit, heart and online counters with persistence
//! - `dispatcher`: request handling and disconnect cleanup
//! - `error`: server and snapshot error types
//! - `fanout`: delivery to connection writer tasks
//! - `network`: listener, connection tasks and the dispatch loop
//! - `pieces`: piece registry and locks
//! - `seats`: red and black seat arbitration
//! - `telemetry`: last head pose per player
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::auth::AccountClient;
//! use server::config::ServerConfig;
//! use server::counters::CounterStore;
//! use server::network::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::default();
//!     let verifier = AccountClient::new(&config.account_url, config.auth_timeout)?;
//!
//!     let mut counters = CounterStore::load(&config.snapshot_path).await?;
//!     counters.reset_online();
//!
//!     let server = Server::bind(config, counters, Arc::new(verifier)).await?;
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client_manager;
pub mod config;
pub mod counters;
pub mod dispatcher;
pub mod error;
pub mod fanout;
pub mod network;
pub mod pieces;
pub mod seats;
pub mod telemetry;

//! Server network layer handling WebSocket connections and the dispatch loop

use crate::auth::{AuthError, TokenVerifier, UserProfile};
use crate::client_manager::ClientId;
use crate::config::ServerConfig;
use crate::counters::{save_snapshot, spawn_snapshot_writer, CounterStore};
use crate::dispatcher::{Dispatcher, Outbound};
use crate::error::ServerError;
use crate::fanout::Fanout;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{CounterData, Envelope};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::Message;

/// Frames buffered per connection before fanout starts dropping.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Messages sent from connection tasks to the dispatch loop
#[derive(Debug)]
pub enum ServerMessage {
    Connected {
        client_id: ClientId,
        addr: SocketAddr,
        sender: mpsc::Sender<Message>,
    },
    Received {
        client_id: ClientId,
        envelope: Envelope,
    },
    Disconnected {
        client_id: ClientId,
    },
    AuthCompleted {
        client_id: ClientId,
        result: Result<UserProfile, AuthError>,
    },
}

#[derive(Debug, Clone, Copy)]
struct Keepalive {
    interval: Duration,
    max_missed: u32,
}

/// Hall server owning the listener and all shared state
pub struct Server {
    listener: Arc<TcpListener>,
    config: ServerConfig,
    dispatcher: Dispatcher,
    fanout: Fanout,
    verifier: Arc<dyn TokenVerifier>,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    snapshot_tx: watch::Sender<CounterData>,
    snapshot_rx: watch::Receiver<CounterData>,
}

impl Server {
    pub async fn bind(
        config: ServerConfig,
        counters: CounterStore,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        info!("Server listening on {}", listener.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(counters.snapshot());

        Ok(Server {
            listener: Arc::new(listener),
            dispatcher: Dispatcher::new(&config, counters),
            config,
            fanout: Fanout::new(),
            verifier,
            server_tx,
            server_rx,
            snapshot_tx,
            snapshot_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Spawns task that accepts connections and hands each to its own task
    fn spawn_acceptor(&self) -> JoinHandle<()> {
        let listener = Arc::clone(&self.listener);
        let server_tx = self.server_tx.clone();
        let keepalive = Keepalive {
            interval: self.config.keepalive_interval,
            max_missed: self.config.keepalive_max_missed,
        };

        tokio::spawn(async move {
            let mut next_id: ClientId = 1;

            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let client_id = next_id;
                        next_id = next_id.wrapping_add(1).max(1);
                        let server_tx = server_tx.clone();

                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, addr, client_id, server_tx, keepalive)
                                    .await
                            {
                                debug!("Connection {} from {} ended: {}", client_id, addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        })
    }

    /// Runs the exchange with the account service off the dispatch loop
    fn spawn_authentication(&self, client_id: ClientId, user_id: String, user_token: String) {
        let verifier = Arc::clone(&self.verifier);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let result = verifier.token_login(&user_id, &user_token).await;
            if server_tx
                .send(ServerMessage::AuthCompleted { client_id, result })
                .is_err()
            {
                debug!("Dispatch loop gone before login for client {} finished", client_id);
            }
        });
    }

    fn publish_snapshot(&self, data: CounterData) {
        self.snapshot_tx.send_replace(data);
    }

    fn apply(&mut self, effects: Vec<Outbound>) {
        for effect in effects {
            match effect {
                Outbound::Send { to, envelope } => {
                    self.fanout.send_to(to, &envelope);
                }
                Outbound::Broadcast { envelope, exclude } => {
                    self.fanout.broadcast(&envelope, exclude);
                }
                Outbound::Authenticate {
                    client_id,
                    user_id,
                    user_token,
                } => self.spawn_authentication(client_id, user_id, user_token),
                Outbound::Persist(data) => self.publish_snapshot(data),
            }
        }
    }

    fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Connected {
                client_id,
                addr,
                sender,
            } => match self.dispatcher.connect(client_id, addr) {
                Some(effects) => {
                    self.fanout.add_peer(client_id, sender);
                    self.apply(effects);
                }
                None => {
                    let _ = sender.try_send(Message::Close(None));
                }
            },
            ServerMessage::Received {
                client_id,
                envelope,
            } => {
                let effects = self
                    .dispatcher
                    .handle_envelope(client_id, envelope, Instant::now().into_std());
                self.apply(effects);
            }
            ServerMessage::Disconnected { client_id } => {
                self.fanout.remove_peer(client_id);
                let effects = self.dispatcher.disconnect(client_id);
                self.apply(effects);
            }
            ServerMessage::AuthCompleted { client_id, result } => {
                let effects = self.dispatcher.complete_login(client_id, result);
                self.apply(effects);
            }
        }
    }

    /// Main server loop; returns once `shutdown` resolves
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let acceptor = self.spawn_acceptor();
        let writer = spawn_snapshot_writer(
            self.config.snapshot_path.clone(),
            self.snapshot_rx.clone(),
        );

        let flush_every = self.config.flush_interval;
        let mut flush = interval_at(Instant::now() + flush_every, flush_every);
        let mut sweep = interval_at(
            Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        );
        tokio::pin!(shutdown);

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(message) => self.handle_message(message),
                        None => break,
                    }
                },

                _ = flush.tick() => {
                    self.publish_snapshot(self.dispatcher.counters().snapshot());
                },

                _ = sweep.tick() => {
                    let effects = self.dispatcher.sweep(Instant::now().into_std());
                    self.apply(effects);
                },

                _ = &mut shutdown => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        acceptor.abort();
        writer.abort();
        let _ = acceptor.await;
        let _ = writer.await;
        let counters = self.dispatcher.counters().snapshot();
        save_snapshot(&self.config.snapshot_path, &counters).await?;
        info!(
            "Final counters saved: {} visits, {} hearts",
            counters.visit_count, counters.heart_count
        );
        Ok(())
    }

    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }
}

/// Drives one WebSocket connection until either side closes it
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    client_id: ClientId,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    keepalive: Keepalive,
) -> Result<(), ServerError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sink, mut ws_stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);

    if server_tx
        .send(ServerMessage::Connected {
            client_id,
            addr,
            sender: out_tx.clone(),
        })
        .is_err()
    {
        return Ok(());
    }

    let mut writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = ws_sink.send(message).await {
                debug!("Write to client {} failed: {}", client_id, e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let period = keepalive.interval;
    let mut ping = interval_at(Instant::now() + period, period);
    let mut missed = 0u32;

    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        missed = 0;
                        match Envelope::decode(&text) {
                            Ok(envelope) => {
                                if server_tx.send(ServerMessage::Received { client_id, envelope }).is_err() {
                                    break;
                                }
                            }
                            Err(e) => debug!("Client {} sent unreadable frame: {}", client_id, e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => missed = 0,
                    Some(Err(e)) => {
                        debug!("Read from client {} failed: {}", client_id, e);
                        break;
                    }
                }
            },

            _ = ping.tick() => {
                if missed >= keepalive.max_missed {
                    warn!("Client {} missed {} keepalives, closing", client_id, missed);
                    break;
                }
                missed += 1;
                let _ = out_tx.try_send(Message::Ping(Vec::new()));
            },

            _ = &mut writer => break,
        }
    }

    let _ = server_tx.send(ServerMessage::Disconnected { client_id });
    Ok(())
}

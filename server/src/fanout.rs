//! Best-effort delivery of envelopes to connection writer tasks.
//!
//! Each live connection owns a bounded queue drained by its writer task.
//! Delivery uses `try_send`, so a slow or dead peer loses frames instead of
//! stalling the dispatcher or other recipients.

use crate::client_manager::ClientId;
use log::{debug, error};
use shared::Envelope;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;

#[derive(Default)]
pub struct Fanout {
    peers: HashMap<ClientId, mpsc::Sender<Message>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_peer(&mut self, client_id: ClientId, sender: mpsc::Sender<Message>) {
        self.peers.insert(client_id, sender);
    }

    /// Dropping the sender lets the writer task drain and close the socket.
    pub fn remove_peer(&mut self, client_id: ClientId) -> bool {
        self.peers.remove(&client_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn encode(envelope: &Envelope) -> Option<String> {
        match envelope.encode() {
            Ok(text) => Some(text),
            Err(e) => {
                error!("Failed to encode '{}' envelope: {}", envelope.kind, e);
                None
            }
        }
    }

    fn deliver(client_id: ClientId, sender: &mpsc::Sender<Message>, text: String) -> bool {
        match sender.try_send(Message::Text(text)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Outbound queue full for client {}, dropping frame", client_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Client {} writer already closed", client_id);
                false
            }
        }
    }

    /// Sends to one client. Returns whether the frame was queued.
    pub fn send_to(&self, client_id: ClientId, envelope: &Envelope) -> bool {
        let Some(sender) = self.peers.get(&client_id) else {
            return false;
        };
        match Self::encode(envelope) {
            Some(text) => Self::deliver(client_id, sender, text),
            None => false,
        }
    }

    /// Sends to every peer except `exclude`. Returns how many frames were queued.
    pub fn broadcast(&self, envelope: &Envelope, exclude: Option<ClientId>) -> usize {
        let Some(text) = Self::encode(envelope) else {
            return 0;
        };

        self.peers
            .iter()
            .filter(|(client_id, _)| Some(**client_id) != exclude)
            .filter(|(client_id, sender)| Self::deliver(**client_id, sender, text.clone()))
            .count()
    }
}

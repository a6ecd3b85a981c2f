//! Session management for connected players
//!
//! This module handles the server-side bookkeeping of live connections:
//! - Session lifecycle (accept, authenticate, disconnect)
//! - Per-session flags: instruction count, visit credit, login, heart
//! - Capacity enforcement on concurrent connections
//! - Identity lookups used by seat and telemetry cleanup
//!
//! Every session is fully constructed when the connection is accepted, so a
//! disconnect at any point (even before the first message) finds a complete
//! record to clean up.

use crate::auth::UserProfile;
use log::info;
use shared::Camp;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// Server-assigned connection handle.
pub type ClientId = u32;

/// Non-keepalive messages a session must send before it counts as a visit.
pub const VISIT_THRESHOLD: u32 = 3;

/// State attached to one live connection
///
/// Each session tracks:
/// - Connection metadata (ID, address, connect time)
/// - The verified identity, once the account service has vouched for it
/// - Which seat it sits in, if any
/// - Counter bookkeeping so visits and hearts are credited only once
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique connection identifier assigned by the server
    pub id: ClientId,
    /// Peer address, for logging
    pub addr: SocketAddr,
    /// When the connection was accepted
    pub connected_at: Instant,
    /// Verified identity; `None` until a token login succeeds
    pub identity: Option<UserProfile>,
    /// Seat currently held
    pub chosen_camp: Option<Camp>,
    /// Messages received, excluding keepalive
    pub instruction_count: u32,
    /// Sticky once the visit threshold is crossed
    pub counted_as_visit: bool,
    /// Whether this session contributes to the online count
    pub logged_in: bool,
    /// Sticky once a heart has been credited
    pub heart_sent: bool,
}

impl Session {
    /// Creates an unauthenticated session with all flags cleared
    pub fn new(id: ClientId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            connected_at: Instant::now(),
            identity: None,
            chosen_camp: None,
            instruction_count: 0,
            counted_as_visit: false,
            logged_in: false,
            heart_sent: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    /// `name&email` of the verified identity
    pub fn conveyor(&self) -> Option<String> {
        self.identity.as_ref().map(UserProfile::conveyor)
    }

    /// Counts one instruction
    ///
    /// Returns true exactly once: on the instruction that crosses
    /// [`VISIT_THRESHOLD`].
    pub fn record_instruction(&mut self) -> bool {
        self.instruction_count = self.instruction_count.saturating_add(1);
        if !self.counted_as_visit && self.instruction_count >= VISIT_THRESHOLD {
            self.counted_as_visit = true;
            return true;
        }
        false
    }
}

/// Owns every live session, keyed by connection id
///
/// The SessionManager is only ever touched from the dispatcher, which gives
/// it a single writer without any locking.
pub struct SessionManager {
    /// Live sessions indexed by connection ID
    sessions: HashMap<ClientId, Session>,
    /// Maximum number of concurrent connections allowed
    max_sessions: usize,
}

impl SessionManager {
    /// Creates an empty session table with the given capacity
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
        }
    }

    /// Registers a freshly accepted connection
    ///
    /// Returns false if the server is at capacity or the id is already in use.
    pub fn add_session(&mut self, id: ClientId, addr: SocketAddr) -> bool {
        if self.sessions.len() >= self.max_sessions || self.sessions.contains_key(&id) {
            return false;
        }

        info!("Session {} connected from {}", id, addr);
        self.sessions.insert(id, Session::new(id, addr));
        true
    }

    /// Removes a session, returning it for cleanup
    ///
    /// Returns None if it was already gone, which makes repeated disconnects
    /// harmless.
    pub fn remove_session(&mut self, id: ClientId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        info!(
            "Session {} disconnected after {:?}",
            id,
            session.connected_at.elapsed()
        );
        Some(session)
    }

    pub fn get(&self, id: ClientId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Whether any live session other than `except` carries `conveyor`
    pub fn conveyor_in_use(&self, conveyor: &str, except: ClientId) -> bool {
        self.sessions.values().any(|session| {
            session.id != except && session.conveyor().as_deref() == Some(conveyor)
        })
    }

    /// Returns the number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if nobody is connected
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

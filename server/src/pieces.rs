//! The 32 board pieces and their exclusive locks.
//!
//! A piece is either free or held by exactly one session. Only the holder may
//! move or put it down. Conflicting requests are rejected with a
//! [`PieceRejection`] which callers log and otherwise ignore: the first request
//! to arrive wins.

use crate::client_manager::ClientId;
use shared::{Coord3D, PIECE_NAMES};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PieceRejection {
    #[error("unknown piece '{0}'")]
    UnknownPiece(String),
    #[error("piece '{0}' is already held")]
    AlreadyHeld(String),
    #[error("piece '{0}' is not held by the requester")]
    NotHolder(String),
    #[error("empty trajectory for piece '{0}'")]
    EmptyTrajectory(String),
}

#[derive(Debug, Clone)]
pub struct PieceState {
    name: &'static str,
    position: Coord3D,
    holder: Option<ClientId>,
    /// Last pick-up or move while held; cleared whenever the lock is released.
    last_activity: Option<Instant>,
}

impl PieceState {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            position: Coord3D::default(),
            holder: None,
            last_activity: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn position(&self) -> Coord3D {
        self.position
    }

    pub fn holder(&self) -> Option<ClientId> {
        self.holder
    }

    pub fn is_locked(&self) -> bool {
        self.holder.is_some()
    }

    fn release(&mut self) {
        self.holder = None;
        self.last_activity = None;
    }
}

/// A piece that was released on behalf of its holder.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleasedPiece {
    pub name: &'static str,
    pub holder: ClientId,
    pub position: Coord3D,
}

#[derive(Debug, Clone)]
pub struct PieceRegistry {
    pieces: Vec<PieceState>,
}

impl Default for PieceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PieceRegistry {
    pub fn new() -> Self {
        Self {
            pieces: PIECE_NAMES.iter().map(|name| PieceState::new(name)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&PieceState> {
        self.pieces.iter().find(|p| p.name == name)
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut PieceState, PieceRejection> {
        self.pieces
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| PieceRejection::UnknownPiece(name.to_string()))
    }

    fn held_by_mut(
        &mut self,
        name: &str,
        holder: ClientId,
    ) -> Result<&mut PieceState, PieceRejection> {
        let piece = self.get_mut(name)?;
        if piece.holder != Some(holder) {
            return Err(PieceRejection::NotHolder(name.to_string()));
        }
        Ok(piece)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PieceState> {
        self.pieces.iter()
    }

    /// Locks a free piece for `holder` at `position`.
    pub fn pick_up(
        &mut self,
        name: &str,
        holder: ClientId,
        position: Coord3D,
        now: Instant,
    ) -> Result<(), PieceRejection> {
        let piece = self.get_mut(name)?;
        if piece.is_locked() {
            return Err(PieceRejection::AlreadyHeld(name.to_string()));
        }
        piece.holder = Some(holder);
        piece.position = position;
        piece.last_activity = Some(now);
        Ok(())
    }

    /// Moves a held piece to the last point of `trajectory`.
    pub fn move_along(
        &mut self,
        name: &str,
        holder: ClientId,
        trajectory: &[Coord3D],
        now: Instant,
    ) -> Result<Coord3D, PieceRejection> {
        let piece = self.held_by_mut(name, holder)?;
        let last = trajectory
            .last()
            .copied()
            .ok_or_else(|| PieceRejection::EmptyTrajectory(name.to_string()))?;
        piece.position = last;
        piece.last_activity = Some(now);
        Ok(last)
    }

    pub fn put_down(
        &mut self,
        name: &str,
        holder: ClientId,
        position: Coord3D,
    ) -> Result<(), PieceRejection> {
        let piece = self.held_by_mut(name, holder)?;
        piece.position = position;
        piece.release();
        Ok(())
    }

    /// Returns every piece to the origin and unlocks it, whoever holds it.
    pub fn reset_all(&mut self) {
        for piece in &mut self.pieces {
            piece.position = Coord3D::default();
            piece.release();
        }
    }

    /// Unlocks every piece held by `holder`, leaving them where they are.
    pub fn release_all_held_by(&mut self, holder: ClientId) -> Vec<ReleasedPiece> {
        let mut released = Vec::new();
        for piece in self.pieces.iter_mut().filter(|p| p.holder == Some(holder)) {
            piece.release();
            released.push(ReleasedPiece {
                name: piece.name,
                holder,
                position: piece.position,
            });
        }
        released
    }

    /// Unlocks pieces whose holder has not touched them for longer than `timeout`.
    pub fn release_stale(&mut self, now: Instant, timeout: Duration) -> Vec<ReleasedPiece> {
        let mut released = Vec::new();
        for piece in &mut self.pieces {
            let (Some(holder), Some(last)) = (piece.holder, piece.last_activity) else {
                continue;
            };
            if now.saturating_duration_since(last) > timeout {
                piece.release();
                released.push(ReleasedPiece {
                    name: piece.name,
                    holder,
                    position: piece.position,
                });
            }
        }
        released
    }

    pub fn held_count(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_locked()).count()
    }
}

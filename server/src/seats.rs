//! The two exclusive player seats.

use crate::client_manager::ClientId;
use shared::Camp;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SeatRejection {
    /// `vacated` is the seat the claimant gave up before the target was checked.
    #[error("{} seat is occupied by session {occupant}", .camp.as_str())]
    Occupied {
        camp: Camp,
        occupant: ClientId,
        vacated: Option<Camp>,
    },
}

/// Outcome of a successful claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeatClaim {
    /// Seat the claimant left to take the new one.
    pub vacated: Option<Camp>,
    /// Stale occupant that was evicted because it is no longer connected.
    pub evicted: Option<ClientId>,
}

#[derive(Debug, Clone, Default)]
pub struct SeatArbitrator {
    red: Option<ClientId>,
    black: Option<ClientId>,
}

impl SeatArbitrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_mut(&mut self, camp: Camp) -> &mut Option<ClientId> {
        match camp {
            Camp::Red => &mut self.red,
            Camp::Black => &mut self.black,
        }
    }

    pub fn occupant(&self, camp: Camp) -> Option<ClientId> {
        match camp {
            Camp::Red => self.red,
            Camp::Black => self.black,
        }
    }

    pub fn seat_of(&self, client_id: ClientId) -> Option<Camp> {
        if self.red == Some(client_id) {
            Some(Camp::Red)
        } else if self.black == Some(client_id) {
            Some(Camp::Black)
        } else {
            None
        }
    }

    /// Assigns `camp` to `client_id`.
    ///
    /// Claiming a different seat gives up the one already held before the
    /// target is checked, so a failed switch leaves the claimant unseated.
    /// An occupant for which `is_live` returns false is treated as a missed
    /// cleanup and evicted.
    pub fn claim(
        &mut self,
        client_id: ClientId,
        camp: Camp,
        is_live: impl Fn(ClientId) -> bool,
    ) -> Result<SeatClaim, SeatRejection> {
        if self.occupant(camp) == Some(client_id) {
            return Ok(SeatClaim {
                vacated: None,
                evicted: None,
            });
        }

        let vacated = if self.occupant(camp.other()) == Some(client_id) {
            *self.slot_mut(camp.other()) = None;
            Some(camp.other())
        } else {
            None
        };

        let evicted = match self.occupant(camp) {
            Some(occupant) if is_live(occupant) => {
                return Err(SeatRejection::Occupied {
                    camp,
                    occupant,
                    vacated,
                });
            }
            stale => stale,
        };
        *self.slot_mut(camp) = Some(client_id);

        Ok(SeatClaim { vacated, evicted })
    }

    /// Frees whatever seat `client_id` holds.
    pub fn vacate(&mut self, client_id: ClientId) -> Option<Camp> {
        let camp = self.seat_of(client_id)?;
        *self.slot_mut(camp) = None;
        Some(camp)
    }
}

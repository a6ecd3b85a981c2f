//! Last-known head pose per player identity.
//!
//! Entries are keyed by conveyor rather than by connection, so a player keeps
//! their pose across seat changes.

use shared::{Coord3D, HeadPose, SeatHeadPose};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEntry {
    pub position: Coord3D,
    pub pitch: f64,
    pub yaw: f64,
    /// Camp the pose was reported under, as sent by the client.
    pub camp: String,
}

impl From<&HeadPose> for TelemetryEntry {
    fn from(pose: &HeadPose) -> Self {
        Self {
            position: pose.position,
            pitch: pose.pitch,
            yaw: pose.yaw,
            camp: pose.camp.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryStore {
    entries: HashMap<String, TelemetryEntry>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, conveyor: &str, entry: TelemetryEntry) {
        self.entries.insert(conveyor.to_string(), entry);
    }

    pub fn get(&self, conveyor: &str) -> Option<&TelemetryEntry> {
        self.entries.get(conveyor)
    }

    pub fn remove(&mut self, conveyor: &str) -> Option<TelemetryEntry> {
        self.entries.remove(conveyor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire form for a seat; an unknown conveyor yields a zeroed pose.
    pub fn seat_pose(&self, conveyor: Option<&str>) -> SeatHeadPose {
        let Some(conveyor) = conveyor else {
            return SeatHeadPose::default();
        };
        match self.entries.get(conveyor) {
            Some(entry) => SeatHeadPose {
                conveyor: conveyor.to_string(),
                position: entry.position,
                pitch: entry.pitch,
                yaw: entry.yaw,
            },
            None => SeatHeadPose {
                conveyor: conveyor.to_string(),
                ..SeatHeadPose::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn entry(x: f64, camp: &str) -> TelemetryEntry {
        TelemetryEntry {
            position: Coord3D::new(x, 1.7, 0.0),
            pitch: 0.1,
            yaw: 0.2,
            camp: camp.to_string(),
        }
    }

    #[test]
    fn test_report_overwrites_previous_pose() {
        let mut store = TelemetryStore::new();
        store.report("a&a@x", entry(1.0, "red"));
        store.report("a&a@x", entry(2.0, "black"));

        assert_eq!(store.len(), 1);
        let stored = store.get("a&a@x").unwrap();
        assert_approx_eq!(stored.position.x, 2.0);
        assert_eq!(stored.camp, "black");
    }

    #[test]
    fn test_remove() {
        let mut store = TelemetryStore::new();
        store.report("a&a@x", entry(1.0, ""));
        assert!(store.remove("a&a@x").is_some());
        assert!(store.remove("a&a@x").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_seat_pose_placeholders() {
        let mut store = TelemetryStore::new();
        assert_eq!(store.seat_pose(None), SeatHeadPose::default());

        let unknown = store.seat_pose(Some("b&b@x"));
        assert_eq!(unknown.conveyor, "b&b@x");
        assert_eq!(unknown.position, Coord3D::default());

        store.report("b&b@x", entry(3.0, "black"));
        let known = store.seat_pose(Some("b&b@x"));
        assert_approx_eq!(known.position.x, 3.0);
        assert_approx_eq!(known.yaw, 0.2);
    }
}

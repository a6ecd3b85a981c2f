//! Hall-wide counters and their on-disk snapshot
//!
//! Three counters live in memory:
//! - `visits`: sessions that crossed the instruction threshold
//! - `hearts`: authenticated sessions that sent a heart
//! - `online`: logged-in sessions currently connected
//!
//! The snapshot is a flat JSON record. Values are read as signed integers and
//! clamped to zero so that a hand-edited or corrupted file can never produce a
//! negative counter.

use crate::error::SnapshotError;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::CounterData;
use std::io::ErrorKind;
use std::path::Path;
use tokio::sync::watch;

/// On-disk representation. Signed so that negative values can be clamped.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RawSnapshot {
    #[serde(default)]
    pub visit_count: i64,
    #[serde(default)]
    pub heart_count: i64,
    #[serde(default)]
    pub online_count: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterStore {
    visits: u64,
    hearts: u64,
    online: u64,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_raw(raw: RawSnapshot) -> Self {
        Self {
            visits: raw.visit_count.max(0) as u64,
            hearts: raw.heart_count.max(0) as u64,
            online: raw.online_count.max(0) as u64,
        }
    }

    /// Loads counters from `path`. A missing file yields zeroed counters.
    pub async fn load(path: &Path) -> Result<Self, SnapshotError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                let raw: RawSnapshot = serde_json::from_str(&text)?;
                let store = Self::from_raw(raw);
                info!(
                    "Loaded counters from {}: visits={} hearts={} online={}",
                    path.display(),
                    store.visits,
                    store.hearts,
                    store.online
                );
                Ok(store)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No counter snapshot at {}, starting from zero", path.display());
                Ok(Self::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn visits(&self) -> u64 {
        self.visits
    }

    pub fn hearts(&self) -> u64 {
        self.hearts
    }

    pub fn online(&self) -> u64 {
        self.online
    }

    pub fn record_visit(&mut self) {
        self.visits += 1;
    }

    pub fn record_heart(&mut self) {
        self.hearts += 1;
    }

    pub fn login(&mut self) {
        self.online += 1;
    }

    /// Never goes below zero, even on unbalanced logouts.
    pub fn logout(&mut self) {
        self.online = self.online.saturating_sub(1);
    }

    /// No session survives a restart, so the persisted online count is stale.
    pub fn reset_online(&mut self) {
        self.online = 0;
    }

    pub fn snapshot(&self) -> CounterData {
        CounterData {
            visit_count: self.visits,
            heart_count: self.hearts,
            online_count: self.online,
        }
    }
}

/// Writes a snapshot next to `path` and renames it into place.
pub async fn save_snapshot(path: &Path, data: &CounterData) -> Result<(), SnapshotError> {
    let text = serde_json::to_string_pretty(data)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, text).await?;
    tokio::fs::rename(&tmp, path).await?;
    debug!("Flushed counters to {}", path.display());
    Ok(())
}

/// Spawns the task that persists every snapshot published on `rx`.
///
/// Only the latest value matters, so bursts of flush requests collapse into a
/// single write.
pub fn spawn_snapshot_writer(
    path: std::path::PathBuf,
    mut rx: watch::Receiver<CounterData>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let data = *rx.borrow_and_update();
            if let Err(e) = save_snapshot(&path, &data).await {
                log::error!("Failed to flush counters to {}: {}", path.display(), e);
            }
        }
    })
}

//! Schedulable apps
//!
//! An app is one entry of the server-assigned schedule: a UUID, the
//! metadata from the latest schedule sync and the sprite bytes it
//! displays. Everything mutable sits behind the app's own lock so that
//! reading one app's sprite never waits on a catalog-wide sync.

use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_time::Duration;
use uuid::Uuid;

use crate::sync::{RawMutex, lock_within};
use crate::transfer::Transfer;

/// Length of a sprite content hash (SHA-256)
pub const HASH_LEN: usize = 32;

pub type ContentHash = [u8; HASH_LEN];

/// One entry of a schedule sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleItem {
    pub uuid: Uuid,
    /// Display duration in seconds (0 = no limit)
    pub duration_secs: u32,
    pub pinned: bool,
    pub skipped: bool,
}

/// Mutable per-app state
#[derive(Debug)]
pub struct AppState {
    pub sprite: Vec<u8>,
    pub hash: ContentHash,
    /// Latest server or local validation outcome
    pub displayable: bool,
    pub duration_secs: u32,
    pub pinned: bool,
    pub skipped: bool,
    pub transfer: Option<Transfer>,
}

impl AppState {
    /// Playable: has sprite data, is displayable and is not skipped
    pub fn is_qualified(&self) -> bool {
        !self.sprite.is_empty() && self.displayable && !self.skipped
    }

    pub(crate) fn apply(&mut self, item: &ScheduleItem) {
        self.duration_secs = item.duration_secs;
        self.pinned = item.pinned;
        self.skipped = item.skipped;
    }
}

/// Copy of an app's metadata taken under its lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppSnapshot {
    pub uuid: Uuid,
    pub duration_secs: u32,
    pub pinned: bool,
    pub skipped: bool,
    pub displayable: bool,
    pub has_sprite: bool,
    pub hash: ContentHash,
}

impl AppSnapshot {
    pub fn is_qualified(&self) -> bool {
        self.has_sprite && self.displayable && !self.skipped
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs as u64)
    }
}

/// A catalog entry. The UUID is immutable; the rest lives in [`AppState`].
#[derive(Debug)]
pub struct App {
    uuid: Uuid,
    state: Mutex<RawMutex, AppState>,
}

impl App {
    pub fn new(item: &ScheduleItem) -> Self {
        Self {
            uuid: item.uuid,
            state: Mutex::new(AppState {
                sprite: Vec::new(),
                hash: [0; HASH_LEN],
                displayable: true,
                duration_secs: item.duration_secs,
                pinned: item.pinned,
                skipped: item.skipped,
                transfer: None,
            }),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Lock the app state with a bounded wait
    pub async fn lock(&self, timeout: Duration) -> Option<MutexGuard<'_, RawMutex, AppState>> {
        lock_within(&self.state, timeout).await
    }

    pub async fn snapshot(&self, timeout: Duration) -> Option<AppSnapshot> {
        let state = self.lock(timeout).await?;
        Some(AppSnapshot {
            uuid: self.uuid,
            duration_secs: state.duration_secs,
            pinned: state.pinned,
            skipped: state.skipped,
            displayable: state.displayable,
            has_sprite: !state.sprite.is_empty(),
            hash: state.hash,
        })
    }
}

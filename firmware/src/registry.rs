//! App registry
//!
//! The single source of truth for the schedulable catalog. The catalog
//! lock is coarse and only held for whole-catalog operations (sync,
//! lookup, count); sprite bytes and transfer state are guarded per app.
//! Every acquisition is bounded: a timeout reads as "temporarily empty",
//! never as a fatal error.

use std::sync::Arc;

use embassy_sync::mutex::Mutex;
use embassy_time::Duration;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::{App, AppSnapshot, ContentHash, HASH_LEN, ScheduleItem};
use crate::error::{RegistryError, TransferError};
use crate::sync::{RawMutex, lock_within};
use crate::transfer::{Transfer, content_hash};

/// Maximum number of apps in the catalog
pub const MAX_APPS: usize = 32;

/// Catalog handles, in schedule order
pub type Catalog = heapless::Vec<Arc<App>, MAX_APPS>;

/// Outcome of a schedule sync
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    /// Apps that were dropped from the catalog
    pub removed: heapless::Vec<Uuid, MAX_APPS>,
    /// Items that could not be added because the catalog was full
    pub rejected: usize,
}

/// Append an app to a catalog, failing once it holds [`MAX_APPS`]
fn admit(catalog: &mut Catalog, app: Arc<App>) -> Result<(), RegistryError> {
    catalog.push(app).map_err(|_| RegistryError::CatalogFull)
}

pub struct Registry {
    apps: Mutex<RawMutex, Catalog>,
    lock_timeout: Duration,
}

impl Registry {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            apps: Mutex::new(Catalog::new()),
            lock_timeout,
        }
    }

    /// Replace the catalog with a full schedule snapshot
    ///
    /// Known apps are updated in place (keeping their sprite data), new
    /// ones are created and apps missing from `items` are released. The
    /// catalog lock is held for the whole sync, so readers only ever see
    /// the old or the new catalog.
    pub async fn sync_schedule(&self, items: &[ScheduleItem]) -> Result<SyncReport, RegistryError> {
        let mut apps = lock_within(&self.apps, self.lock_timeout)
            .await
            .ok_or(RegistryError::LockTimeout)?;

        let mut report = SyncReport::default();
        let mut next = Catalog::new();

        for item in items {
            if next.iter().any(|app| app.uuid() == item.uuid) {
                debug!("Duplicate schedule entry {} ignored", item.uuid);
                continue;
            }

            let existing = apps.iter().find(|app| app.uuid() == item.uuid).cloned();
            let is_new = existing.is_none();
            let app = match existing {
                Some(app) => {
                    match app.lock(self.lock_timeout).await {
                        Some(mut state) => state.apply(item),
                        None => warn!("App {} busy, keeping previous metadata", item.uuid),
                    }
                    app
                }
                None => Arc::new(App::new(item)),
            };

            if let Err(e) = admit(&mut next, app) {
                warn!("{}, dropping {}", e, item.uuid);
                report.rejected += 1;
            } else if is_new {
                report.added += 1;
            } else {
                report.updated += 1;
            }
        }

        for old in apps.iter() {
            if !next.iter().any(|app| app.uuid() == old.uuid()) {
                let _ = report.removed.push(old.uuid());
            }
        }

        *apps = next;
        info!(
            "Schedule applied: {} apps ({} new, {} removed, {} rejected)",
            apps.len(),
            report.added,
            report.removed.len(),
            report.rejected
        );
        Ok(report)
    }

    pub async fn find(&self, uuid: Uuid) -> Option<Arc<App>> {
        let Some(apps) = lock_within(&self.apps, self.lock_timeout).await else {
            warn!("Registry lock timeout in find");
            return None;
        };
        apps.iter().find(|app| app.uuid() == uuid).cloned()
    }

    /// Number of apps, zero if the catalog is unavailable
    pub async fn count(&self) -> usize {
        match lock_within(&self.apps, self.lock_timeout).await {
            Some(apps) => apps.len(),
            None => {
                warn!("Registry lock timeout in count");
                0
            }
        }
    }

    pub async fn get_by_index(&self, index: usize) -> Option<Arc<App>> {
        let Some(apps) = lock_within(&self.apps, self.lock_timeout).await else {
            warn!("Registry lock timeout in get_by_index");
            return None;
        };
        apps.get(index).cloned()
    }

    /// Clone the catalog handles, empty if the catalog is unavailable
    pub async fn apps(&self) -> Catalog {
        match lock_within(&self.apps, self.lock_timeout).await {
            Some(apps) => apps.clone(),
            None => {
                warn!("Registry lock timeout in apps");
                Catalog::new()
            }
        }
    }

    /// Snapshot every app that can be locked in time, in catalog order
    pub async fn snapshots(&self) -> heapless::Vec<AppSnapshot, MAX_APPS> {
        let mut out = heapless::Vec::new();
        for app in self.apps().await.iter() {
            match app.snapshot(self.lock_timeout).await {
                Some(snap) => {
                    let _ = out.push(snap);
                }
                None => warn!("App {} lock timeout, skipped for this pass", app.uuid()),
            }
        }
        out
    }

    /// Replace the app's sprite and mark it displayable
    pub async fn set_sprite_data(&self, app: &App, bytes: Vec<u8>) -> Result<(), RegistryError> {
        let mut state = app.lock(self.lock_timeout).await.ok_or(RegistryError::LockTimeout)?;
        state.hash = content_hash(&bytes);
        state.sprite = bytes;
        state.displayable = true;
        debug!("App {} sprite set ({} bytes)", app.uuid(), state.sprite.len());
        Ok(())
    }

    /// Release the app's sprite and mark it not displayable
    pub async fn clear_sprite_data(&self, app: &App) -> Result<(), RegistryError> {
        let mut state = app.lock(self.lock_timeout).await.ok_or(RegistryError::LockTimeout)?;
        state.sprite = Vec::new();
        state.hash = [0; HASH_LEN];
        state.displayable = false;
        Ok(())
    }

    /// Evaluate qualification now; false if the app is busy
    pub async fn is_qualified(&self, app: &App) -> bool {
        match app.lock(self.lock_timeout).await {
            Some(state) => state.is_qualified(),
            None => {
                warn!("App {} lock timeout in is_qualified", app.uuid());
                false
            }
        }
    }

    pub async fn set_pinned(&self, uuid: Uuid, pinned: bool) -> Result<(), RegistryError> {
        let app = self.find(uuid).await.ok_or(RegistryError::NotFound)?;
        let mut state = app.lock(self.lock_timeout).await.ok_or(RegistryError::LockTimeout)?;
        state.pinned = pinned;
        Ok(())
    }

    pub async fn set_skipped(&self, uuid: Uuid, skipped: bool) -> Result<(), RegistryError> {
        let app = self.find(uuid).await.ok_or(RegistryError::NotFound)?;
        let mut state = app.lock(self.lock_timeout).await.ok_or(RegistryError::LockTimeout)?;
        state.skipped = skipped;
        Ok(())
    }

    /// Begin a chunked transfer, discarding any incomplete one
    pub async fn transfer_start(
        &self,
        uuid: Uuid,
        total_size: usize,
        chunk_count: u32,
        chunk_size: usize,
        expected_hash: ContentHash,
    ) -> Result<(), TransferError> {
        let app = self.find(uuid).await.ok_or(TransferError::UnknownApp)?;
        let transfer = Transfer::new(total_size, chunk_count, chunk_size, expected_hash)?;
        let mut state = app.lock(self.lock_timeout).await.ok_or(TransferError::LockTimeout)?;
        if state.transfer.replace(transfer).is_some() {
            info!("App {} restarted an incomplete transfer", uuid);
        }
        debug!(
            "App {} transfer: {} bytes in {} chunks of {}",
            uuid, total_size, chunk_count, chunk_size
        );
        Ok(())
    }

    /// Add a chunk. Returns whether all chunks have arrived.
    pub async fn transfer_add_chunk(&self, uuid: Uuid, index: u32, data: &[u8]) -> Result<bool, TransferError> {
        let app = self.find(uuid).await.ok_or(TransferError::UnknownApp)?;
        let mut state = app.lock(self.lock_timeout).await.ok_or(TransferError::LockTimeout)?;
        let transfer = state.transfer.as_mut().ok_or(TransferError::NoTransfer)?;
        let result = transfer.add_chunk(index, data);
        if let Err(TransferError::ChunkOverflow { .. } | TransferError::ChunkIndexOutOfRange { .. }) = result {
            error!("App {} chunk {} rejected, transfer discarded", uuid, index);
            state.transfer = None;
        }
        result
    }

    pub async fn transfer_is_complete(&self, uuid: Uuid) -> bool {
        let Some(app) = self.find(uuid).await else {
            return false;
        };
        match app.lock(self.lock_timeout).await {
            Some(state) => state.transfer.as_ref().is_some_and(Transfer::is_complete),
            None => false,
        }
    }

    /// Verify the assembled bytes and hand them over
    ///
    /// The transfer is consumed unless it is still incomplete. On a hash
    /// mismatch the bytes are discarded; the caller treats that as a
    /// failed render, not something to retry with the same data.
    pub async fn transfer_finalize(&self, uuid: Uuid) -> Result<Vec<u8>, TransferError> {
        let app = self.find(uuid).await.ok_or(TransferError::UnknownApp)?;
        let mut state = app.lock(self.lock_timeout).await.ok_or(TransferError::LockTimeout)?;
        match state.transfer.as_ref() {
            None => return Err(TransferError::NoTransfer),
            Some(transfer) if !transfer.is_complete() => return Err(TransferError::Incomplete),
            Some(_) => {}
        }
        let transfer = state.transfer.take().ok_or(TransferError::NoTransfer)?;
        drop(state);

        transfer.finalize().inspect_err(|e| {
            if *e == TransferError::HashMismatch {
                error!("App {} transfer failed integrity check, discarded", uuid);
            }
        })
    }

    pub async fn transfer_cancel(&self, uuid: Uuid) -> Result<(), TransferError> {
        let app = self.find(uuid).await.ok_or(TransferError::UnknownApp)?;
        let mut state = app.lock(self.lock_timeout).await.ok_or(TransferError::LockTimeout)?;
        state.transfer.take().map(|_| ()).ok_or(TransferError::NoTransfer)
    }
}

//! Render request tracker
//!
//! De-duplicates outbound render requests per app, times out stuck ones
//! and validates returned bytes before they reach the registry.
//!
//! ```text
//! NeedsRender    --request-->                   RenderPending
//! RenderPending  --valid bytes-->               RenderComplete
//! RenderPending  --timeout, retries < max-->    RenderPending (retries + 1)
//! RenderPending  --timeout, retries >= max-->   NeedsRender (retries reset)
//! RenderComplete --cooldown elapsed, request--> RenderPending
//! *              --server error / no bytes-->   RenderFailed
//! *              --invalid bytes, attempts < max-->  ValidationFailed -> RenderPending
//! *              --invalid bytes, attempts >= max--> RenderFailed
//! ```

use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Instant};
use heapless::Vec;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::app::HASH_LEN;
use crate::config::Tunables;
use crate::protocol::{Outbound, Outbox};
use crate::registry::Registry;
use crate::scheduler::{SchedulerEvent, SchedulerInbox};
use crate::sprite::validate;
use crate::sync::{RawMutex, lock_within, send_within};

/// Maximum number of tracked apps
pub const MAX_TRACKED: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    NeedsRender,
    RenderPending,
    RenderComplete,
    RenderFailed,
    ValidationFailed,
}

/// Result of [`Tracker::request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A render request was queued for the transport
    Sent,
    /// Already pending or cooling down, nothing sent
    Suppressed,
    /// Pending timed out too many times; back to NeedsRender
    GaveUp,
    /// Table lock or outbound queue unavailable
    Unavailable,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    uuid: Uuid,
    state: RenderState,
    retries: u8,
    validation_attempts: u8,
    requested_at: Option<Instant>,
    succeeded_at: Option<Instant>,
}

impl Entry {
    fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            state: RenderState::NeedsRender,
            retries: 0,
            validation_attempts: 0,
            requested_at: None,
            succeeded_at: None,
        }
    }

    fn mark_pending(&mut self, now: Instant) {
        self.state = RenderState::RenderPending;
        self.requested_at = Some(now);
    }
}

/// Per-app render bookkeeping, one lock for the whole table
pub struct TrackingTable {
    entries: Mutex<RawMutex, Vec<Entry, MAX_TRACKED>>,
}

impl TrackingTable {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl Default for TrackingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the entry for `uuid`, creating it if needed
///
/// A full table evicts its oldest settled entry, or a pending one whose
/// timeout has passed. Requests still in flight are never evicted, so
/// with all of them in flight there is no room and `None` is returned.
fn entry_mut(
    entries: &mut Vec<Entry, MAX_TRACKED>,
    uuid: Uuid,
    now: Instant,
    pending_timeout: Duration,
) -> Option<&mut Entry> {
    if let Some(index) = entries.iter().position(|e| e.uuid == uuid) {
        return Some(&mut entries[index]);
    }
    if entries.is_full() {
        let in_flight = |e: &Entry| {
            e.state == RenderState::RenderPending
                && e.requested_at
                    .is_some_and(|at| now.saturating_duration_since(at) < pending_timeout)
        };
        let victim = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !in_flight(e))
            .min_by_key(|(_, e)| (e.state == RenderState::RenderPending, e.requested_at))
            .map(|(i, _)| i)?;
        debug!("Tracking table full, evicting {}", entries[victim].uuid);
        entries.swap_remove(victim);
    }
    entries.push(Entry::new(uuid)).ok()?;
    entries.last_mut()
}

/// Outcome of a response, for the scheduler and for propagation
enum Verdict {
    Complete(std::vec::Vec<u8>),
    Retry,
    Failed { server_ok: bool },
}

/// Render tracker bound to the collaborators it feeds
pub struct Tracker<'d> {
    table: &'d TrackingTable,
    registry: &'d Registry,
    outbox: &'d Outbox,
    scheduler: &'d SchedulerInbox,
    tunables: &'d Tunables,
}

impl<'d> Tracker<'d> {
    pub fn new(
        table: &'d TrackingTable,
        registry: &'d Registry,
        outbox: &'d Outbox,
        scheduler: &'d SchedulerInbox,
        tunables: &'d Tunables,
    ) -> Self {
        Self {
            table,
            registry,
            outbox,
            scheduler,
            tunables,
        }
    }

    /// Ask the server for `uuid`'s sprite unless a request is already in
    /// flight or a fresh render was just received
    pub async fn request(&self, uuid: Uuid, now: Instant) -> RequestOutcome {
        let Some(mut entries) = lock_within(&self.table.entries, self.tunables.lock_timeout()).await else {
            warn!("Tracking table lock timeout, request for {} skipped", uuid);
            return RequestOutcome::Unavailable;
        };
        let Some(entry) = entry_mut(&mut entries, uuid, now, self.tunables.pending_timeout()) else {
            warn!("Tracking table full of in-flight requests, request for {} deferred", uuid);
            return RequestOutcome::Unavailable;
        };

        match entry.state {
            RenderState::RenderPending => {
                let waited = entry
                    .requested_at
                    .map_or(self.tunables.pending_timeout(), |at| now.saturating_duration_since(at));
                if waited < self.tunables.pending_timeout() {
                    return RequestOutcome::Suppressed;
                }
                if entry.retries >= self.tunables.max_request_retries {
                    warn!("Render of {} timed out {} times, giving up for now", uuid, entry.retries);
                    entry.state = RenderState::NeedsRender;
                    entry.retries = 0;
                    entry.requested_at = None;
                    return RequestOutcome::GaveUp;
                }
                entry.retries += 1;
                info!("Render of {} timed out, retry {}", uuid, entry.retries);
            }
            RenderState::RenderComplete => {
                let cooling = entry
                    .succeeded_at
                    .is_some_and(|at| now.saturating_duration_since(at) < self.tunables.success_cooldown());
                if cooling {
                    return RequestOutcome::Suppressed;
                }
            }
            RenderState::NeedsRender | RenderState::RenderFailed | RenderState::ValidationFailed => {}
        }

        entry.mark_pending(now);
        drop(entries);
        self.send_request(uuid).await
    }

    async fn send_request(&self, uuid: Uuid) -> RequestOutcome {
        let hash = match self.registry.find(uuid).await {
            Some(app) => app
                .snapshot(self.tunables.lock_timeout())
                .await
                .map_or([0; HASH_LEN], |s| s.hash),
            None => [0; HASH_LEN],
        };
        self.send(Outbound::RenderRequest {
            uuid,
            hash,
            chunk_size: self.tunables.chunk_size_hint,
        })
        .await
    }

    async fn send(&self, message: Outbound) -> RequestOutcome {
        if send_within(self.outbox, message, self.tunables.command_timeout()).await {
            RequestOutcome::Sent
        } else {
            warn!("Outbound queue full, render request dropped");
            RequestOutcome::Unavailable
        }
    }

    /// Handle a render result for `uuid`
    ///
    /// `bytes` is the verified transfer (if any); `server_error` is set
    /// when the server reported a failure. Returns the new state.
    pub async fn response_received(
        &self,
        uuid: Uuid,
        bytes: Option<std::vec::Vec<u8>>,
        server_error: bool,
        now: Instant,
    ) -> RenderState {
        let verdict = if server_error {
            warn!("Server failed to render {}", uuid);
            Verdict::Failed { server_ok: false }
        } else {
            match bytes {
                None => Verdict::Failed { server_ok: true },
                Some(bytes) if bytes.is_empty() => Verdict::Failed { server_ok: true },
                Some(bytes) => match validate(&bytes, self.tunables.max_sprite_dimension) {
                    Ok((width, height)) => {
                        debug!("Render of {} validated ({}x{})", uuid, width, height);
                        Verdict::Complete(bytes)
                    }
                    Err(e) => {
                        warn!("Render of {} failed validation: {}", uuid, e);
                        Verdict::Retry
                    }
                },
            }
        };

        let Some(mut entries) = lock_within(&self.table.entries, self.tunables.lock_timeout()).await else {
            warn!("Tracking table lock timeout, response for {} dropped", uuid);
            return RenderState::NeedsRender;
        };
        // Untracked with no room: apply the result without bookkeeping
        let mut spare = Entry::new(uuid);
        let entry = match entry_mut(&mut entries, uuid, now, self.tunables.pending_timeout()) {
            Some(entry) => entry,
            None => {
                debug!("Tracking table full, response for {} not tracked", uuid);
                &mut spare
            }
        };

        let verdict = match verdict {
            Verdict::Retry => {
                entry.validation_attempts += 1;
                if entry.validation_attempts < self.tunables.max_validation_attempts {
                    entry.state = RenderState::ValidationFailed;
                    Verdict::Retry
                } else {
                    warn!("Render of {} invalid {} times", uuid, entry.validation_attempts);
                    Verdict::Failed { server_ok: false }
                }
            }
            other => other,
        };

        match verdict {
            Verdict::Complete(bytes) => {
                entry.state = RenderState::RenderComplete;
                entry.succeeded_at = Some(now);
                entry.retries = 0;
                entry.validation_attempts = 0;
                drop(entries);
                self.store(uuid, bytes).await;
                RenderState::RenderComplete
            }
            Verdict::Retry => {
                // Local failure: re-request at once, regardless of the pending timeout
                entry.mark_pending(now);
                drop(entries);
                self.send_request(uuid).await;
                RenderState::RenderPending
            }
            Verdict::Failed { server_ok } => {
                entry.state = RenderState::RenderFailed;
                entry.retries = 0;
                entry.validation_attempts = 0;
                drop(entries);
                self.fail(uuid, server_ok).await;
                RenderState::RenderFailed
            }
        }
    }

    async fn store(&self, uuid: Uuid, bytes: std::vec::Vec<u8>) {
        let Some(app) = self.registry.find(uuid).await else {
            info!("Render of {} arrived after it left the schedule", uuid);
            return;
        };
        let stored = match self.registry.set_sprite_data(&app, bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not store sprite for {}: {}", uuid, e);
                false
            }
        };
        self.notify(uuid, stored, stored).await;
    }

    async fn fail(&self, uuid: Uuid, server_ok: bool) {
        if let Some(app) = self.registry.find(uuid).await
            && let Err(e) = self.registry.clear_sprite_data(&app).await
        {
            warn!("Could not clear sprite for {}: {}", uuid, e);
        }
        self.notify(uuid, server_ok, false).await;
    }

    async fn notify(&self, uuid: Uuid, success: bool, displayable: bool) {
        let event = SchedulerEvent::RenderResponse {
            uuid,
            success,
            displayable,
        };
        if !send_within(self.scheduler, event, self.tunables.command_timeout()).await {
            warn!("Scheduler inbox full, render response for {} dropped", uuid);
        }
    }

    /// Current state of `uuid`; untracked apps need a render
    pub async fn state(&self, uuid: Uuid) -> RenderState {
        match lock_within(&self.table.entries, self.tunables.lock_timeout()).await {
            Some(entries) => entries
                .iter()
                .find(|e| e.uuid == uuid)
                .map_or(RenderState::NeedsRender, |e| e.state),
            None => RenderState::NeedsRender,
        }
    }

    pub async fn retries(&self, uuid: Uuid) -> u8 {
        match lock_within(&self.table.entries, self.tunables.lock_timeout()).await {
            Some(entries) => entries.iter().find(|e| e.uuid == uuid).map_or(0, |e| e.retries),
            None => 0,
        }
    }

    /// Drop bookkeeping for an app that left the schedule
    pub async fn forget(&self, uuid: Uuid) {
        if let Some(mut entries) = lock_within(&self.table.entries, self.tunables.lock_timeout()).await
            && let Some(index) = entries.iter().position(|e| e.uuid == uuid)
        {
            entries.swap_remove(index);
        }
    }

    /// Announce what is on screen
    pub async fn currently_displaying(&self, uuid: Uuid) {
        if self.send(Outbound::CurrentlyDisplaying { uuid }).await != RequestOutcome::Sent {
            warn!("Currently-displaying notice for {} dropped", uuid);
        }
    }
}

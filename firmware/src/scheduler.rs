//! Scheduler state machine
//!
//! Decides what the playback engine shows: a pinned app on its own, or
//! a rotation through every qualified app in catalog order. All
//! transitions run from [`Scheduler::handle`] and [`Scheduler::poll_timers`],
//! both driven by the single [`Scheduler::run`] loop.
//!
//! ```text
//!                 pinned + qualified          pinned, no data
//!   IDLE ---------------------> SINGLE_PLAYING <------> SINGLE_BLANK
//!     |
//!     | qualified app                     no qualified app
//!     +-----------> ROTATING_PLAYING <----------> ROTATING_WAITING
//! ```
//!
//! Timers:
//! - prepare: `duration - lookahead` after playback starts, prefetches
//!   upcoming renders (or refreshes the pinned app)
//! - retry: every `retry_interval` while waiting for render data
//! - schedule: backoff re-request while connected without a schedule

use std::sync::Arc;

use embassy_futures::select::{Either, select};
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Timer};
use heapless::Vec;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::app::{App, AppSnapshot};
use crate::assets::BuiltinAsset;
use crate::config::Tunables;
use crate::player::{PlaybackEvent, PlayerCommand, PlayerInbox, Source, SourceId};
use crate::protocol::{Outbound, Outbox};
use crate::registry::{MAX_APPS, Registry};
use crate::sync::{RawMutex, send_within};
use crate::tracker::{Tracker, TrackingTable};

/// Depth of the scheduler event queue
pub const SCHEDULER_INBOX_DEPTH: usize = 16;

pub type SchedulerInbox = Channel<RawMutex, SchedulerEvent, SCHEDULER_INBOX_DEPTH>;

type Snapshots = Vec<AppSnapshot, MAX_APPS>;

/// Everything the scheduler reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    Connected,
    Disconnected,
    ScheduleReceived,
    /// A render finished; `displayable` is false when the server had
    /// nothing to show or the render failed
    RenderResponse {
        uuid: Uuid,
        success: bool,
        displayable: bool,
    },
    /// Pin or skip flags changed
    PinStateChanged,
    Playback(PlaybackEvent),
    ButtonNext,
    ButtonPrevious,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    RotatingPlaying,
    RotatingWaiting,
    SinglePlaying,
    SingleBlank,
}

impl SchedulerState {
    fn is_rotating(self) -> bool {
        matches!(self, SchedulerState::RotatingPlaying | SchedulerState::RotatingWaiting)
    }
}

fn position(snaps: &Snapshots, uuid: Uuid) -> Option<usize> {
    snaps.iter().position(|s| s.uuid == uuid)
}

/// Indices after `from`, wrapping, ending with `from` itself
fn forward(from: usize, len: usize) -> impl Iterator<Item = usize> {
    let from = from.min(len.saturating_sub(1));
    (1..=len).map(move |step| (from + step) % len)
}

/// Indices before `from`, wrapping, ending with `from` itself
fn backward(from: usize, len: usize) -> impl Iterator<Item = usize> {
    let from = from.min(len.saturating_sub(1));
    (1..=len).map(move |step| (from + len - step) % len)
}

pub struct Scheduler<'d> {
    registry: &'d Registry,
    tracker: Tracker<'d>,
    outbox: &'d Outbox,
    inbox: &'d SchedulerInbox,
    player: &'d PlayerInbox,
    tunables: &'d Tunables,
    state: SchedulerState,
    current_idx: usize,
    current: Option<Uuid>,
    pinned: Option<Arc<App>>,
    playback_start: Option<Instant>,
    prepare_at: Option<Instant>,
    retry_at: Option<Instant>,
    schedule_retry_at: Option<Instant>,
    schedule_backoff: Duration,
    connected: bool,
}

impl<'d> Scheduler<'d> {
    pub fn new(
        registry: &'d Registry,
        table: &'d TrackingTable,
        outbox: &'d Outbox,
        inbox: &'d SchedulerInbox,
        player: &'d PlayerInbox,
        tunables: &'d Tunables,
    ) -> Self {
        Self {
            registry,
            tracker: Tracker::new(table, registry, outbox, inbox, tunables),
            outbox,
            inbox,
            player,
            tunables,
            state: SchedulerState::Idle,
            current_idx: 0,
            current: None,
            pinned: None,
            playback_start: None,
            prepare_at: None,
            retry_at: None,
            schedule_retry_at: None,
            schedule_backoff: tunables.schedule_retry_min(),
            connected: false,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn current_index(&self) -> usize {
        self.current_idx
    }

    /// App currently played or waited on
    pub fn current(&self) -> Option<Uuid> {
        self.current
    }

    pub fn pinned(&self) -> Option<Uuid> {
        self.pinned.as_ref().map(|app| app.uuid())
    }

    pub fn playback_start(&self) -> Option<Instant> {
        self.playback_start
    }

    pub fn prepare_at(&self) -> Option<Instant> {
        self.prepare_at
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn schedule_retry_at(&self) -> Option<Instant> {
        self.schedule_retry_at
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Earliest armed timer
    pub fn next_deadline(&self) -> Option<Instant> {
        [self.prepare_at, self.retry_at, self.schedule_retry_at]
            .into_iter()
            .flatten()
            .min()
    }

    /// Show the connecting artwork until a connection comes up
    pub async fn boot(&mut self) {
        self.command(PlayerCommand::Play {
            source: Source::Builtin(BuiltinAsset::Connecting),
            duration: Duration::MIN,
            immediate: true,
        })
        .await;
    }

    pub async fn handle(&mut self, event: SchedulerEvent, now: Instant) {
        debug!("Scheduler {:?} <- {:?}", self.state, event);
        match event {
            SchedulerEvent::Connected => self.on_connected(now).await,
            SchedulerEvent::Disconnected => self.on_disconnected().await,
            SchedulerEvent::ScheduleReceived => {
                self.schedule_retry_at = None;
                self.schedule_backoff = self.tunables.schedule_retry_min();
                self.request_missing(now).await;
                self.select_mode(now).await;
            }
            SchedulerEvent::PinStateChanged => self.select_mode(now).await,
            SchedulerEvent::RenderResponse {
                uuid,
                success,
                displayable,
            } => self.on_render_response(uuid, success, displayable, now).await,
            SchedulerEvent::Playback(event) => self.on_playback(event, now).await,
            SchedulerEvent::ButtonNext => {
                if self.state.is_rotating() {
                    self.advance(now).await;
                }
            }
            SchedulerEvent::ButtonPrevious => {
                if self.state.is_rotating() {
                    self.previous(now).await;
                }
            }
        }
    }

    /// Fire every timer that is due
    pub async fn poll_timers(&mut self, now: Instant) {
        if self.prepare_at.is_some_and(|at| at <= now) {
            self.prepare_at = None;
            self.on_prepare(now).await;
        }
        if self.retry_at.is_some_and(|at| at <= now) {
            self.retry_at = None;
            self.on_retry(now).await;
        }
        if self.schedule_retry_at.is_some_and(|at| at <= now) {
            self.schedule_backoff = (self.schedule_backoff + self.schedule_backoff).min(self.tunables.schedule_retry_max());
            info!("No schedule yet, asking again (next in {} s)", self.schedule_backoff.as_secs());
            self.send(Outbound::ScheduleRequest).await;
            self.schedule_retry_at = Some(now + self.schedule_backoff);
        }
    }

    /// Mode selection: pinned app first, else the first qualified app
    async fn select_mode(&mut self, now: Instant) {
        let snaps = self.registry.snapshots().await;

        if let Some(idx) = snaps.iter().position(|s| s.pinned && !s.skipped) {
            let snap = snaps[idx];
            let Some(app) = self.registry.find(snap.uuid).await else {
                return;
            };
            self.current_idx = idx;
            let same = self.pinned() == Some(snap.uuid);
            self.pinned = Some(app);
            if snap.is_qualified() {
                if !(same && self.state == SchedulerState::SinglePlaying) {
                    self.play_single(now).await;
                }
            } else {
                self.blank_single(now).await;
            }
            return;
        }
        self.pinned = None;

        // Keep the current rotation item rather than restarting from the top
        if self.state == SchedulerState::RotatingPlaying
            && let Some(uuid) = self.current
            && let Some(idx) = position(&snaps, uuid)
            && snaps[idx].is_qualified()
        {
            self.current_idx = idx;
            return;
        }

        if let Some(idx) = snaps.iter().position(|s| s.is_qualified()) {
            self.play_rotating(&snaps, idx, now).await;
        } else if let Some(idx) = snaps.iter().position(|s| !s.skipped) {
            self.wait_rotating(&snaps, idx, now).await;
        } else {
            self.go_idle().await;
        }
    }

    /// Natural rotation advance: next qualified app after the current one,
    /// the current one again if it is the only one, else wait
    async fn advance(&mut self, now: Instant) {
        let snaps = self.registry.snapshots().await;
        if snaps.is_empty() {
            self.go_idle().await;
            return;
        }
        let from = self
            .current
            .and_then(|uuid| position(&snaps, uuid))
            .unwrap_or(self.current_idx);

        if let Some(idx) = forward(from, snaps.len()).find(|&i| snaps[i].is_qualified()) {
            self.play_rotating(&snaps, idx, now).await;
        } else if let Some(idx) = forward(from, snaps.len()).find(|&i| !snaps[i].skipped) {
            self.wait_rotating(&snaps, idx, now).await;
        } else {
            self.go_idle().await;
        }
    }

    async fn previous(&mut self, now: Instant) {
        let snaps = self.registry.snapshots().await;
        if snaps.is_empty() {
            return;
        }
        let from = self
            .current
            .and_then(|uuid| position(&snaps, uuid))
            .unwrap_or(self.current_idx);
        if let Some(idx) = backward(from, snaps.len()).find(|&i| snaps[i].is_qualified()) {
            self.play_rotating(&snaps, idx, now).await;
        }
    }

    async fn play_rotating(&mut self, snaps: &Snapshots, idx: usize, now: Instant) {
        let snap = snaps[idx];
        let Some(app) = self.registry.find(snap.uuid).await else {
            return;
        };
        info!("Rotating to {} (index {})", snap.uuid, idx);
        self.state = SchedulerState::RotatingPlaying;
        self.current_idx = idx;
        self.current = Some(snap.uuid);
        self.retry_at = None;
        self.playback_start = Some(now);
        self.command(PlayerCommand::Play {
            source: Source::App(app),
            duration: snap.duration(),
            immediate: true,
        })
        .await;
    }

    async fn wait_rotating(&mut self, snaps: &Snapshots, idx: usize, now: Instant) {
        let uuid = snaps[idx].uuid;
        info!("Waiting for render of {} (index {})", uuid, idx);
        self.state = SchedulerState::RotatingWaiting;
        self.current_idx = idx;
        self.current = Some(uuid);
        self.prepare_at = None;
        self.retry_at = Some(now + self.tunables.retry_interval());
        self.tracker.request(uuid, now).await;
    }

    async fn play_single(&mut self, now: Instant) {
        let Some(app) = self.pinned.clone() else {
            return;
        };
        let Some(snap) = app.snapshot(self.tunables.lock_timeout()).await else {
            return;
        };
        info!("Playing pinned {}", snap.uuid);
        self.state = SchedulerState::SinglePlaying;
        self.current = Some(snap.uuid);
        self.retry_at = None;
        self.playback_start = Some(now);
        self.command(PlayerCommand::Play {
            source: Source::App(app),
            duration: snap.duration(),
            immediate: true,
        })
        .await;
    }

    async fn blank_single(&mut self, now: Instant) {
        let Some(uuid) = self.pinned() else {
            return;
        };
        if self.state != SchedulerState::SingleBlank {
            info!("Pinned {} has no data, blanking", uuid);
            self.command(PlayerCommand::Stop).await;
        }
        self.state = SchedulerState::SingleBlank;
        self.current = Some(uuid);
        self.prepare_at = None;
        self.playback_start = None;
        self.retry_at = Some(now + self.tunables.retry_interval());
        self.tracker.request(uuid, now).await;
    }

    async fn go_idle(&mut self) {
        if matches!(self.state, SchedulerState::RotatingPlaying | SchedulerState::SinglePlaying) {
            self.command(PlayerCommand::Stop).await;
        }
        if self.state != SchedulerState::Idle {
            info!("Nothing to display, idle");
        }
        self.state = SchedulerState::Idle;
        self.current = None;
        self.pinned = None;
        self.playback_start = None;
        self.prepare_at = None;
        self.retry_at = None;
    }

    async fn on_connected(&mut self, now: Instant) {
        info!("Connected, requesting schedule");
        self.connected = true;
        self.send(Outbound::ScheduleRequest).await;
        self.command(PlayerCommand::SetDisplayMode(true)).await;
        self.schedule_backoff = self.tunables.schedule_retry_min();
        self.schedule_retry_at = Some(now + self.schedule_backoff);
    }

    async fn on_disconnected(&mut self) {
        info!("Disconnected");
        self.connected = false;
        self.state = SchedulerState::Idle;
        self.current = None;
        self.pinned = None;
        self.playback_start = None;
        self.prepare_at = None;
        self.retry_at = None;
        self.schedule_retry_at = None;
        self.command(PlayerCommand::SetDisplayMode(false)).await;
        self.boot().await;
    }

    async fn on_render_response(&mut self, uuid: Uuid, success: bool, displayable: bool, now: Instant) {
        if !success {
            warn!("Render of {} failed", uuid);
        }
        match self.state {
            SchedulerState::SingleBlank if self.pinned() == Some(uuid) => {
                let qualified = match &self.pinned {
                    Some(app) => self.registry.is_qualified(app).await,
                    None => false,
                };
                if success && displayable && qualified {
                    self.play_single(now).await;
                }
            }
            SchedulerState::SinglePlaying if self.pinned() == Some(uuid) => {
                if !success || !displayable {
                    self.blank_single(now).await;
                }
            }
            SchedulerState::RotatingWaiting if success && displayable => {
                let snaps = self.registry.snapshots().await;
                if let Some(idx) = position(&snaps, uuid)
                    && snaps[idx].is_qualified()
                {
                    self.play_rotating(&snaps, idx, now).await;
                }
            }
            SchedulerState::Idle if self.connected && success && displayable => {
                self.select_mode(now).await;
            }
            _ => {}
        }
    }

    async fn on_playback(&mut self, event: PlaybackEvent, now: Instant) {
        match event {
            PlaybackEvent::Playing(SourceId::App(uuid)) => self.on_playing(uuid, now).await,
            PlaybackEvent::Playing(SourceId::Builtin(_)) => {}
            PlaybackEvent::Stopped(SourceId::App(uuid)) => self.on_finished(uuid, now).await,
            PlaybackEvent::Error(SourceId::App(uuid)) => {
                warn!("Playback of {} failed", uuid);
                self.on_finished(uuid, now).await;
            }
            PlaybackEvent::Stopped(SourceId::Builtin(_)) => {}
            PlaybackEvent::Error(SourceId::Builtin(asset)) => {
                warn!("Playback of built-in {} failed", asset.name());
            }
            PlaybackEvent::NeedNext => self.on_need_next(now).await,
            PlaybackEvent::PrepareNext(SourceId::App(uuid)) => self.on_prepare_next(uuid).await,
            PlaybackEvent::PrepareNext(SourceId::Builtin(_)) => {}
        }
    }

    async fn on_playing(&mut self, uuid: Uuid, now: Instant) {
        self.tracker.currently_displaying(uuid).await;

        let snaps = self.registry.snapshots().await;
        let Some(idx) = position(&snaps, uuid) else {
            return;
        };
        match self.state {
            SchedulerState::RotatingPlaying | SchedulerState::RotatingWaiting => {
                self.state = SchedulerState::RotatingPlaying;
                self.current_idx = idx;
                self.current = Some(uuid);
                self.retry_at = None;
            }
            SchedulerState::SinglePlaying | SchedulerState::SingleBlank if self.pinned() == Some(uuid) => {
                self.state = SchedulerState::SinglePlaying;
                self.retry_at = None;
            }
            _ => return,
        }

        self.playback_start = Some(now);
        let duration = snaps[idx].duration();
        let lookahead = self.tunables.prepare_lookahead();
        self.prepare_at = if duration > lookahead {
            Some(now + (duration - lookahead))
        } else {
            None
        };
    }

    /// The current item stopped or failed
    async fn on_finished(&mut self, uuid: Uuid, now: Instant) {
        if self.current != Some(uuid) {
            debug!("Ignoring stale end of {}", uuid);
            return;
        }
        self.prepare_at = None;
        match self.state {
            SchedulerState::RotatingPlaying => self.advance(now).await,
            SchedulerState::SinglePlaying => self.replay_single(now).await,
            _ => {}
        }
    }

    async fn replay_single(&mut self, now: Instant) {
        let qualified = match &self.pinned {
            Some(app) => self.registry.is_qualified(app).await,
            None => false,
        };
        if qualified {
            self.play_single(now).await;
        } else {
            self.blank_single(now).await;
        }
    }

    /// The engine is idle in display mode
    async fn on_need_next(&mut self, now: Instant) {
        match self.state {
            SchedulerState::RotatingWaiting => {
                let Some(uuid) = self.current else {
                    return;
                };
                let snaps = self.registry.snapshots().await;
                if let Some(idx) = position(&snaps, uuid)
                    && snaps[idx].is_qualified()
                {
                    self.play_rotating(&snaps, idx, now).await;
                }
            }
            SchedulerState::SingleBlank => {
                if let Some(app) = &self.pinned
                    && self.registry.is_qualified(app).await
                {
                    self.play_single(now).await;
                }
            }
            // The engine went idle under us, e.g. a staged item failed.
            // Restart the current app while it still qualifies.
            SchedulerState::RotatingPlaying => {
                if self.play_in_flight(now) {
                    debug!("Ignoring need-next, play just issued");
                    return;
                }
                let snaps = self.registry.snapshots().await;
                match self.current.and_then(|uuid| position(&snaps, uuid)) {
                    Some(idx) if snaps[idx].is_qualified() => self.play_rotating(&snaps, idx, now).await,
                    _ => self.advance(now).await,
                }
            }
            SchedulerState::SinglePlaying => {
                if self.play_in_flight(now) {
                    debug!("Ignoring need-next, play just issued");
                    return;
                }
                self.replay_single(now).await;
            }
            SchedulerState::Idle => {}
        }
    }

    /// A play command or playing report is younger than one need-next
    /// interval, so a need-next signal predates it
    fn play_in_flight(&self, now: Instant) -> bool {
        self.playback_start
            .is_some_and(|at| now.saturating_duration_since(at) < self.tunables.need_next_interval())
    }

    /// Stage what follows the current item for a gapless switch
    async fn on_prepare_next(&mut self, uuid: Uuid) {
        if self.current != Some(uuid) {
            return;
        }
        match self.state {
            SchedulerState::RotatingPlaying => {
                let snaps = self.registry.snapshots().await;
                let Some(from) = position(&snaps, uuid) else {
                    return;
                };
                let Some(idx) = forward(from, snaps.len()).find(|&i| snaps[i].is_qualified()) else {
                    return;
                };
                if let Some(app) = self.registry.find(snaps[idx].uuid).await {
                    debug!("Staging {} after {}", snaps[idx].uuid, uuid);
                    self.command(PlayerCommand::SetNext {
                        source: Source::App(app),
                        duration: snaps[idx].duration(),
                    })
                    .await;
                }
            }
            SchedulerState::SinglePlaying => {
                let Some(app) = self.pinned.clone() else {
                    return;
                };
                if !self.registry.is_qualified(&app).await {
                    return;
                }
                if let Some(snap) = app.snapshot(self.tunables.lock_timeout()).await {
                    self.command(PlayerCommand::SetNext {
                        source: Source::App(app),
                        duration: snap.duration(),
                    })
                    .await;
                }
            }
            _ => {}
        }
    }

    async fn on_prepare(&mut self, now: Instant) {
        match self.state {
            SchedulerState::RotatingPlaying => {
                let snaps = self.registry.snapshots().await;
                let from = self
                    .current
                    .and_then(|uuid| position(&snaps, uuid))
                    .unwrap_or(self.current_idx);
                let upcoming: Vec<Uuid, MAX_APPS> = forward(from, snaps.len())
                    .filter(|&i| i != from && !snaps[i].skipped)
                    .take(self.tunables.prefetch_count as usize)
                    .map(|i| snaps[i].uuid)
                    .collect();
                for uuid in upcoming {
                    debug!("Prefetching {}", uuid);
                    self.tracker.request(uuid, now).await;
                }
            }
            SchedulerState::SinglePlaying => {
                if let Some(uuid) = self.pinned() {
                    debug!("Refreshing pinned {}", uuid);
                    self.tracker.request(uuid, now).await;
                }
            }
            _ => {}
        }
    }

    async fn on_retry(&mut self, now: Instant) {
        match self.state {
            SchedulerState::RotatingWaiting => {
                self.request_missing(now).await;
                let snaps = self.registry.snapshots().await;
                let from = self
                    .current
                    .and_then(|uuid| position(&snaps, uuid))
                    .unwrap_or(self.current_idx);
                // `forward` ends on the candidate itself, check it first
                let candidate = snaps.get(from).filter(|s| s.is_qualified()).map(|_| from);
                let found = candidate.or_else(|| forward(from, snaps.len()).find(|&i| snaps[i].is_qualified()));
                match found {
                    Some(idx) => self.play_rotating(&snaps, idx, now).await,
                    None => self.retry_at = Some(now + self.tunables.retry_interval()),
                }
            }
            SchedulerState::SingleBlank => {
                let qualified = match &self.pinned {
                    Some(app) => self.registry.is_qualified(app).await,
                    None => false,
                };
                if qualified {
                    self.play_single(now).await;
                } else {
                    self.blank_single(now).await;
                }
            }
            _ => {}
        }
    }

    /// Request renders for every non-skipped app without sprite data
    async fn request_missing(&mut self, now: Instant) {
        let snaps = self.registry.snapshots().await;
        for snap in snaps.iter().filter(|s| !s.skipped && !s.has_sprite) {
            self.tracker.request(snap.uuid, now).await;
        }
    }

    async fn command(&self, command: PlayerCommand) {
        if !send_within(self.player, command, self.tunables.command_timeout()).await {
            warn!("Playback queue full, command dropped");
        }
    }

    async fn send(&self, message: Outbound) {
        if !send_within(self.outbox, message, self.tunables.command_timeout()).await {
            warn!("Outbound queue full, message dropped");
        }
    }

    /// Dispatch events and timers forever
    pub async fn run(&mut self) -> ! {
        self.boot().await;
        loop {
            self.poll_timers(Instant::now()).await;
            let deadline = self
                .next_deadline()
                .unwrap_or_else(|| Instant::now() + self.tunables.idle_tick());
            match select(self.inbox.receive(), Timer::at(deadline)).await {
                Either::First(event) => self.handle(event, Instant::now()).await,
                Either::Second(()) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ScheduleItem;
    use crate::sprite::fixtures::still;
    use embassy_futures::block_on;

    struct Fixture {
        registry: Registry,
        table: TrackingTable,
        outbox: Outbox,
        inbox: SchedulerInbox,
        player: PlayerInbox,
        tunables: Tunables,
    }

    impl Fixture {
        fn new() -> Self {
            let tunables = Tunables::default();
            Self {
                registry: Registry::new(tunables.lock_timeout()),
                table: TrackingTable::new(),
                outbox: Outbox::new(),
                inbox: SchedulerInbox::new(),
                player: PlayerInbox::new(),
                tunables,
            }
        }

        fn scheduler(&self) -> Scheduler<'_> {
            Scheduler::new(
                &self.registry,
                &self.table,
                &self.outbox,
                &self.inbox,
                &self.player,
                &self.tunables,
            )
        }

        /// Load a schedule; `ready` apps get a valid sprite
        fn load(&self, items: &[(u128, u32, bool, bool)], ready: &[u128]) {
            let items: std::vec::Vec<_> = items
                .iter()
                .map(|&(n, duration_secs, pinned, skipped)| ScheduleItem {
                    uuid: Uuid::from_u128(n),
                    duration_secs,
                    pinned,
                    skipped,
                })
                .collect();
            block_on(async {
                self.registry.sync_schedule(&items).await.unwrap();
                for n in ready {
                    self.make_ready(*n).await;
                }
            });
        }

        async fn make_ready(&self, n: u128) {
            let app = self.registry.find(Uuid::from_u128(n)).await.unwrap();
            self.registry
                .set_sprite_data(&app, still(2, 2, [255, 0, 0, 255]))
                .await
                .unwrap();
        }

        async fn make_unready(&self, n: u128) {
            let app = self.registry.find(Uuid::from_u128(n)).await.unwrap();
            self.registry.clear_sprite_data(&app).await.unwrap();
        }

        fn commands(&self) -> std::vec::Vec<PlayerCommand> {
            let mut out = std::vec::Vec::new();
            while let Ok(c) = self.player.try_receive() {
                out.push(c);
            }
            out
        }

        /// Sources of Play commands, in order
        fn played(&self) -> std::vec::Vec<SourceId> {
            self.commands()
                .into_iter()
                .filter_map(|c| match c {
                    PlayerCommand::Play { source, .. } => Some(source.id()),
                    _ => None,
                })
                .collect()
        }

        fn outbound(&self) -> std::vec::Vec<Outbound> {
            let mut out = std::vec::Vec::new();
            while let Ok(m) = self.outbox.try_receive() {
                out.push(m);
            }
            out
        }

        fn render_requests(&self) -> std::vec::Vec<Uuid> {
            self.outbound()
                .into_iter()
                .filter_map(|m| match m {
                    Outbound::RenderRequest { uuid, .. } => Some(uuid),
                    _ => None,
                })
                .collect()
        }
    }

    fn ms(n: u64) -> Instant {
        Instant::from_millis(n)
    }

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn app_source(n: u128) -> SourceId {
        SourceId::App(id(n))
    }

    #[test]
    fn test_pinned_app_wins_over_rotation() {
        let f = Fixture::new();
        f.load(&[(1, 10, false, false), (2, 10, true, false), (3, 10, false, false)], &[1, 2, 3]);
        let mut s = f.scheduler();
        block_on(s.handle(SchedulerEvent::ScheduleReceived, ms(0)));
        assert_eq!(s.state(), SchedulerState::SinglePlaying);
        assert_eq!(s.pinned(), Some(id(2)));
        assert_eq!(f.played(), vec![app_source(2)]);

        // Natural end replays the pinned app, never rotates
        block_on(s.handle(SchedulerEvent::Playback(PlaybackEvent::Stopped(app_source(2))), ms(10_000)));
        assert_eq!(s.state(), SchedulerState::SinglePlaying);
        assert_eq!(f.played(), vec![app_source(2)]);

        block_on(s.handle(SchedulerEvent::ButtonNext, ms(10_001)));
        assert!(f.played().is_empty());
    }

    #[test]
    fn test_skipped_pin_is_ignored() {
        let f = Fixture::new();
        f.load(&[(1, 10, true, true), (2, 10, false, false)], &[1, 2]);
        let mut s = f.scheduler();
        block_on(s.handle(SchedulerEvent::ScheduleReceived, ms(0)));
        assert_eq!(s.state(), SchedulerState::RotatingPlaying);
        assert_eq!(s.pinned(), None);
        assert_eq!(f.played(), vec![app_source(2)]);
    }

    #[test]
    fn test_rotation_advances_in_order_and_skips_unqualified() {
        let f = Fixture::new();
        f.load(&[(1, 10, false, false), (2, 10, false, false), (3, 10, false, false)], &[1, 2, 3]);
        let mut s = f.scheduler();
        block_on(async {
            s.handle(SchedulerEvent::ScheduleReceived, ms(0)).await;
            assert_eq!(s.current_index(), 0);

            s.handle(SchedulerEvent::Playback(PlaybackEvent::Stopped(app_source(1))), ms(10_000)).await;
            assert_eq!(s.current_index(), 1);

            s.handle(SchedulerEvent::ButtonPrevious, ms(11_000)).await;
            assert_eq!(s.current_index(), 0);

            f.make_unready(2).await;
            s.handle(SchedulerEvent::ButtonNext, ms(12_000)).await;
            assert_eq!(s.current_index(), 2);

            // Wraps back to the start
            s.handle(SchedulerEvent::ButtonNext, ms(13_000)).await;
            assert_eq!(s.current_index(), 0);
        });
        assert_eq!(
            f.played(),
            vec![app_source(1), app_source(2), app_source(1), app_source(3), app_source(1)]
        );
    }

    #[test]
    fn test_only_qualified_app_replays() {
        let f = Fixture::new();
        f.load(&[(1, 10, false, false), (2, 10, false, false)], &[1]);
        let mut s = f.scheduler();
        block_on(async {
            s.handle(SchedulerEvent::ScheduleReceived, ms(0)).await;
            f.played();
            s.handle(SchedulerEvent::Playback(PlaybackEvent::Error(app_source(1))), ms(5_000)).await;
        });
        assert_eq!(s.state(), SchedulerState::RotatingPlaying);
        assert_eq!(f.played(), vec![app_source(1)]);
    }

    #[test]
    fn test_advance_falls_back_to_waiting() {
        let f = Fixture::new();
        f.load(&[(1, 10, false, false), (2, 10, false, false)], &[1]);
        let mut s = f.scheduler();
        block_on(async {
            s.handle(SchedulerEvent::ScheduleReceived, ms(0)).await;
            f.make_unready(1).await;
            s.handle(SchedulerEvent::Playback(PlaybackEvent::Stopped(app_source(1))), ms(10_000)).await;
        });
        assert_eq!(s.state(), SchedulerState::RotatingWaiting);
        assert_eq!(s.current(), Some(id(2)));
        assert_eq!(s.retry_at(), Some(ms(20_000)));
    }

    #[test]
    fn test_stale_stop_is_ignored() {
        let f = Fixture::new();
        f.load(&[(1, 10, false, false), (2, 10, false, false)], &[1, 2]);
        let mut s = f.scheduler();
        block_on(async {
            s.handle(SchedulerEvent::ScheduleReceived, ms(0)).await;
            s.handle(SchedulerEvent::ButtonNext, ms(100)).await;
            f.played();
            s.handle(SchedulerEvent::Playback(PlaybackEvent::Stopped(app_source(1))), ms(200)).await;
        });
        assert_eq!(s.current(), Some(id(2)));
        assert!(f.played().is_empty());
    }

    #[test]
    fn test_waiting_then_first_render_plays() {
        let f = Fixture::new();
        f.load(&[(1, 10, false, false), (2, 10, false, false)], &[]);
        let mut s = f.scheduler();
        block_on(s.handle(SchedulerEvent::ScheduleReceived, ms(0)));
        assert_eq!(s.state(), SchedulerState::RotatingWaiting);
        assert_eq!(s.current_index(), 0);
        assert_eq!(s.retry_at(), Some(ms(10_000)));
        assert_eq!(f.render_requests(), vec![id(1), id(2)]);

        block_on(async {
            f.make_ready(1).await;
            s.handle(
                SchedulerEvent::RenderResponse {
                    uuid: id(1),
                    success: true,
                    displayable: true,
                },
                ms(1_000),
            )
            .await;
        });
        assert_eq!(s.state(), SchedulerState::RotatingPlaying);
        assert_eq!(s.current_index(), 0);
        assert_eq!(s.retry_at(), None);
        assert_eq!(f.played(), vec![app_source(1)]);
    }

    #[test]
    fn test_retry_timer_rerequests_and_rearms() {
        let f = Fixture::new();
        f.load(&[(1, 10, false, false)], &[]);
        let mut s = f.scheduler();
        block_on(async {
            s.handle(SchedulerEvent::ScheduleReceived, ms(0)).await;
            f.outbound();
            s.poll_timers(ms(9_999)).await;
            assert!(f.outbound().is_empty());
            s.poll_timers(ms(10_000)).await;
        });
        assert_eq!(f.render_requests(), vec![id(1)]);
        assert_eq!(s.state(), SchedulerState::RotatingWaiting);
        assert_eq!(s.retry_at(), Some(ms(20_000)));
    }

    #[test]
    fn test_need_next_starts_waiting_candidate() {
        let f = Fixture::new();
        f.load(&[(1, 10, false, false)], &[]);
        let mut s = f.scheduler();
        block_on(async {
            s.handle(SchedulerEvent::ScheduleReceived, ms(0)).await;
            s.handle(SchedulerEvent::Playback(PlaybackEvent::NeedNext), ms(500)).await;
            assert_eq!(s.state(), SchedulerState::RotatingWaiting);
            f.make_ready(1).await;
            s.handle(SchedulerEvent::Playback(PlaybackEvent::NeedNext), ms(1_500)).await;
        });
        assert_eq!(s.state(), SchedulerState::RotatingPlaying);
        assert_eq!(f.played(), vec![app_source(1)]);
    }

    #[test]
    fn test_queued_need_next_keeps_current_app() {
        let f = Fixture::new();
        f.load(&[(1, 10, false, false), (2, 10, false, false), (3, 10, false, false)], &[1, 2, 3]);
        let mut s = f.scheduler();
        block_on(async {
            s.handle(SchedulerEvent::ScheduleReceived, ms(0)).await;
            assert_eq!(s.current(), Some(id(1)));
            s.handle(SchedulerEvent::Playback(PlaybackEvent::NeedNext), ms(5)).await;
        });
        assert_eq!(s.current(), Some(id(1)));
        assert_eq!(s.current_index(), 0);
        assert_eq!(s.state(), SchedulerState::RotatingPlaying);
        assert_eq!(f.played(), vec![app_source(1)]);
    }

    #[test]
    fn test_need_next_while_playing_restarts_current() {
        let f = Fixture::new();
        f.load(&[(1, 10, false, false), (2, 10, false, false)], &[1, 2]);
        let mut s = f.scheduler();
        block_on(async {
            s.handle(SchedulerEvent::ScheduleReceived, ms(0)).await;
            s.handle(SchedulerEvent::Playback(PlaybackEvent::Playing(app_source(1))), ms(10)).await;
            // Engine dropped the item without a stop report
            s.handle(SchedulerEvent::Playback(PlaybackEvent::NeedNext), ms(3_000)).await;
            assert_eq!(s.current(), Some(id(1)));

            // No longer qualified: move on
            f.make_unready(1).await;
            s.handle(SchedulerEvent::Playback(PlaybackEvent::NeedNext), ms(5_000)).await;
        });
        assert_eq!(s.current(), Some(id(2)));
        assert_eq!(f.played(), vec![app_source(1), app_source(1), app_source(2)]);
    }

    #[test]
    fn test_pinned_without_data_blanks_until_success() {
        let f = Fixture::new();
        f.load(&[(1, 10, true, false), (2, 10, false, false)], &[2]);
        let mut s = f.scheduler();
        block_on(s.handle(SchedulerEvent::ScheduleReceived, ms(0)));
        assert_eq!(s.state(), SchedulerState::SingleBlank);
        assert!(matches!(f.commands().as_slice(), [PlayerCommand::Stop]));
        assert_eq!(s.retry_at(), Some(ms(10_000)));

        let failed = SchedulerEvent::RenderResponse {
            uuid: id(1),
            success: false,
            displayable: false,
        };
        block_on(s.handle(failed, ms(1_000)));
        assert_eq!(s.state(), SchedulerState::SingleBlank);
        assert!(f.commands().is_empty());

        block_on(async {
            f.make_ready(1).await;
            s.handle(
                SchedulerEvent::RenderResponse {
                    uuid: id(1),
                    success: true,
                    displayable: true,
                },
                ms(2_000),
            )
            .await;
        });
        assert_eq!(s.state(), SchedulerState::SinglePlaying);
        assert_eq!(f.played(), vec![app_source(1)]);
    }

    #[test]
    fn test_pinned_not_displayable_goes_blank() {
        let f = Fixture::new();
        f.load(&[(1, 10, true, false)], &[1]);
        let mut s = f.scheduler();
        block_on(async {
            s.handle(SchedulerEvent::ScheduleReceived, ms(0)).await;
            f.commands();
            s.handle(
                SchedulerEvent::RenderResponse {
                    uuid: id(1),
                    success: true,
                    displayable: false,
                },
                ms(1_000),
            )
            .await;
        });
        assert_eq!(s.state(), SchedulerState::SingleBlank);
        assert!(matches!(f.commands().as_slice(), [PlayerCommand::Stop]));
    }

    #[test]
    fn test_unpin_switches_to_rotation() {
        let f = Fixture::new();
        f.load(&[(1, 10, false, false), (2, 10, true, false)], &[1, 2]);
        let mut s = f.scheduler();
        block_on(async {
            s.handle(SchedulerEvent::ScheduleReceived, ms(0)).await;
            f.registry.set_pinned(id(2), false).await.unwrap();
            s.handle(SchedulerEvent::PinStateChanged, ms(100)).await;
        });
        assert_eq!(s.state(), SchedulerState::RotatingPlaying);
        assert_eq!(s.pinned(), None);
        assert_eq!(f.played(), vec![app_source(2), app_source(1)]);
    }

    #[test]
    fn test_resync_keeps_current_rotation_item() {
        let f = Fixture::new();
        f.load(&[(1, 10, false, false), (2, 10, false, false)], &[1, 2]);
        let mut s = f.scheduler();
        block_on(async {
            s.handle(SchedulerEvent::ScheduleReceived, ms(0)).await;
            s.handle(SchedulerEvent::ButtonNext, ms(100)).await;
            f.played();
        });
        f.load(&[(3, 10, false, false), (2, 10, false, false)], &[]);
        block_on(s.handle(SchedulerEvent::ScheduleReceived, ms(200)));
        assert_eq!(s.current(), Some(id(2)));
        assert_eq!(s.current_index(), 1);
        assert!(f.played().is_empty());
    }

    #[test]
    fn test_empty_or_skipped_catalog_is_idle() {
        let f = Fixture::new();
        f.load(&[(1, 10, false, true)], &[1]);
        let mut s = f.scheduler();
        block_on(s.handle(SchedulerEvent::ScheduleReceived, ms(0)));
        assert_eq!(s.state(), SchedulerState::Idle);
        f.load(&[], &[]);
        block_on(s.handle(SchedulerEvent::ScheduleReceived, ms(10)));
        assert_eq!(s.state(), SchedulerState::Idle);
        assert!(f.commands().is_empty());
    }

    #[test]
    fn test_playing_event_arms_prepare_and_reports() {
        let f = Fixture::new();
        f.load(
            &[(1, 10, false, false), (2, 2, false, false), (3, 10, false, true), (4, 10, false, false)],
            &[1, 2],
        );
        let mut s = f.scheduler();
        block_on(async {
            s.handle(SchedulerEvent::ScheduleReceived, ms(0)).await;
            f.outbound();
            s.handle(SchedulerEvent::Playback(PlaybackEvent::Playing(app_source(1))), ms(100)).await;
        });
        assert_eq!(s.prepare_at(), Some(ms(8_100)));
        assert_eq!(s.playback_start(), Some(ms(100)));
        assert_eq!(f.outbound(), vec![Outbound::CurrentlyDisplaying { uuid: id(1) }]);

        block_on(s.poll_timers(ms(8_100)));
        assert_eq!(s.prepare_at(), None);
        // Next two non-skipped apps after the current one
        assert_eq!(f.render_requests(), vec![id(2), id(4)]);

        // Two-second items are too short for a prepare window
        block_on(s.handle(SchedulerEvent::Playback(PlaybackEvent::Playing(app_source(2))), ms(10_000)));
        assert_eq!(s.current_index(), 1);
        assert_eq!(s.prepare_at(), None);
    }

    #[test]
    fn test_builtin_playing_is_not_reported() {
        let f = Fixture::new();
        let mut s = f.scheduler();
        block_on(s.handle(
            SchedulerEvent::Playback(PlaybackEvent::Playing(SourceId::Builtin(BuiltinAsset::Connecting))),
            ms(0),
        ));
        assert!(f.outbound().is_empty());
    }

    #[test]
    fn test_pinned_prepare_refreshes_same_app() {
        let f = Fixture::new();
        f.load(&[(1, 10, true, false), (2, 10, false, false)], &[1]);
        let mut s = f.scheduler();
        block_on(async {
            s.handle(SchedulerEvent::ScheduleReceived, ms(0)).await;
            s.handle(SchedulerEvent::Playback(PlaybackEvent::Playing(app_source(1))), ms(0)).await;
            f.outbound();
            s.poll_timers(ms(8_000)).await;
        });
        assert_eq!(f.render_requests(), vec![id(1)]);
    }

    #[test]
    fn test_prepare_next_stages_following_app() {
        let f = Fixture::new();
        f.load(&[(1, 10, false, false), (2, 10, false, false)], &[1, 2]);
        let mut s = f.scheduler();
        block_on(async {
            s.handle(SchedulerEvent::ScheduleReceived, ms(0)).await;
            f.commands();
            s.handle(SchedulerEvent::Playback(PlaybackEvent::PrepareNext(app_source(1))), ms(8_000)).await;
        });
        let commands = f.commands();
        assert!(matches!(
            commands.as_slice(),
            [PlayerCommand::SetNext { source, .. }] if source.id() == app_source(2)
        ));

        // Staged item starts without a stop; the scheduler follows along
        block_on(s.handle(SchedulerEvent::Playback(PlaybackEvent::Playing(app_source(2))), ms(10_000)));
        assert_eq!(s.current_index(), 1);
        assert_eq!(s.state(), SchedulerState::RotatingPlaying);
    }

    #[test]
    fn test_connect_requests_schedule_with_backoff() {
        let f = Fixture::new();
        let mut s = f.scheduler();
        block_on(s.handle(SchedulerEvent::Connected, ms(0)));
        assert!(s.is_connected());
        assert_eq!(f.outbound(), vec![Outbound::ScheduleRequest]);
        assert!(matches!(f.commands().as_slice(), [PlayerCommand::SetDisplayMode(true)]));
        assert_eq!(s.schedule_retry_at(), Some(ms(10_000)));

        block_on(s.poll_timers(ms(10_000)));
        assert_eq!(s.schedule_retry_at(), Some(ms(30_000)));
        block_on(s.poll_timers(ms(30_000)));
        assert_eq!(s.schedule_retry_at(), Some(ms(60_000)));
        block_on(s.poll_timers(ms(60_000)));
        assert_eq!(s.schedule_retry_at(), Some(ms(90_000)));
        assert_eq!(f.outbound().len(), 3);

        block_on(s.handle(SchedulerEvent::ScheduleReceived, ms(61_000)));
        assert_eq!(s.schedule_retry_at(), None);
    }

    #[test]
    fn test_disconnect_shows_connecting() {
        let f = Fixture::new();
        f.load(&[(1, 10, true, false)], &[1]);
        let mut s = f.scheduler();
        block_on(async {
            s.handle(SchedulerEvent::Connected, ms(0)).await;
            s.handle(SchedulerEvent::ScheduleReceived, ms(100)).await;
            s.handle(SchedulerEvent::Playback(PlaybackEvent::Playing(app_source(1))), ms(100)).await;
            f.commands();
            s.handle(SchedulerEvent::Disconnected, ms(200)).await;
        });
        assert_eq!(s.state(), SchedulerState::Idle);
        assert_eq!(s.pinned(), None);
        assert_eq!(s.next_deadline(), None);
        let commands = f.commands();
        assert!(matches!(
            commands.as_slice(),
            [
                PlayerCommand::SetDisplayMode(false),
                PlayerCommand::Play { source: Source::Builtin(BuiltinAsset::Connecting), immediate: true, .. },
            ]
        ));
    }

    #[test]
    fn test_cursor_helpers() {
        assert_eq!(forward(0, 3).collect::<std::vec::Vec<_>>(), vec![1, 2, 0]);
        assert_eq!(backward(0, 3).collect::<std::vec::Vec<_>>(), vec![2, 1, 0]);
        assert_eq!(forward(7, 3).collect::<std::vec::Vec<_>>(), vec![0, 1, 2]);
    }
}

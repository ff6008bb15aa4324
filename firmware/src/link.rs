//! Inbound message routing and connection supervision
//!
//! [`Link`] is called by the transport task for every parsed message. It
//! feeds the registry, the render tracker and the device config, and
//! turns state changes into scheduler events. The transport reports the
//! health of its outer loop through the [`ConnectionSupervisor`].

use embassy_time::Instant;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::ContentHash;
use crate::config::{ConfigStorage, ConfigStore, DeviceConfig, Tunables};
use crate::error::TransferError;
use crate::player::{PlayerCommand, PlayerInbox};
use crate::protocol::{Inbound, Outbox};
use crate::registry::Registry;
use crate::scheduler::{SchedulerEvent, SchedulerInbox};
use crate::sync::send_within;
use crate::tracker::{Tracker, TrackingTable};

/// What the transport should do after a connection failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Reconnect as usual
    None,
    /// Tear down and bring connectivity back up (Wi-Fi, sockets)
    ResetConnectivity,
    /// Restart the device
    Restart,
}

/// Counts consecutive connection failures
#[derive(Debug)]
pub struct ConnectionSupervisor {
    failures: u8,
    reset_after: u8,
    restart_after: u8,
}

impl ConnectionSupervisor {
    pub fn new(tunables: &Tunables) -> Self {
        Self {
            failures: 0,
            reset_after: tunables.reset_connectivity_after,
            restart_after: tunables.restart_after,
        }
    }

    pub fn failures(&self) -> u8 {
        self.failures
    }

    pub fn record_success(&mut self) {
        if self.failures > 0 {
            info!("Connection restored after {} failures", self.failures);
        }
        self.failures = 0;
    }

    pub fn record_failure(&mut self) -> Escalation {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.restart_after {
            error!("{} consecutive connection failures, restarting", self.failures);
            Escalation::Restart
        } else if self.failures == self.reset_after {
            warn!("{} consecutive connection failures, resetting connectivity", self.failures);
            Escalation::ResetConnectivity
        } else {
            Escalation::None
        }
    }
}

/// Router from transport messages to the core
pub struct Link<'d, S> {
    registry: &'d Registry,
    tracker: Tracker<'d>,
    scheduler: &'d SchedulerInbox,
    player: &'d PlayerInbox,
    tunables: &'d Tunables,
    config: ConfigStore<S>,
    supervisor: ConnectionSupervisor,
}

impl<'d, S: ConfigStorage> Link<'d, S> {
    pub fn new(
        registry: &'d Registry,
        table: &'d TrackingTable,
        outbox: &'d Outbox,
        scheduler: &'d SchedulerInbox,
        player: &'d PlayerInbox,
        tunables: &'d Tunables,
        config: ConfigStore<S>,
    ) -> Self {
        Self {
            registry,
            tracker: Tracker::new(table, registry, outbox, scheduler, tunables),
            scheduler,
            player,
            tunables,
            config,
            supervisor: ConnectionSupervisor::new(tunables),
        }
    }

    pub fn config(&self) -> DeviceConfig {
        self.config.get()
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    /// Push the stored display settings to the playback engine
    pub async fn apply_config(&self) {
        let config = self.config.get();
        self.command(PlayerCommand::SetBrightness(config.brightness)).await;
        self.command(PlayerCommand::SetScreenEnabled(config.screen_enabled)).await;
    }

    /// Route one inbound message
    ///
    /// Returns the escalation the transport should apply; anything other
    /// than a disconnect yields [`Escalation::None`].
    pub async fn handle(&mut self, message: Inbound, now: Instant) -> Escalation {
        match message {
            Inbound::Schedule(items) => match self.registry.sync_schedule(&items).await {
                Ok(report) => {
                    for uuid in report.removed {
                        self.tracker.forget(uuid).await;
                    }
                    self.notify(SchedulerEvent::ScheduleReceived).await;
                }
                Err(e) => warn!("Schedule dropped: {}", e),
            },
            Inbound::RenderHeader {
                uuid,
                total_size,
                chunk_count,
                chunk_size,
                hash,
            } => {
                self.start_transfer(uuid, total_size as usize, chunk_count, chunk_size as usize, hash, now)
                    .await
            }
            Inbound::Chunk { uuid, index, data } => self.add_chunk(uuid, index, &data, now).await,
            Inbound::RenderError { uuid } => {
                let _ = self.registry.transfer_cancel(uuid).await;
                self.tracker.response_received(uuid, None, true, now).await;
            }
            Inbound::RenderEmpty { uuid } => {
                let _ = self.registry.transfer_cancel(uuid).await;
                self.tracker.response_received(uuid, Some(Vec::new()), false, now).await;
            }
            Inbound::PinChanged { uuid, pinned } => match self.registry.set_pinned(uuid, pinned).await {
                Ok(()) => {
                    info!("App {} {}", uuid, if pinned { "pinned" } else { "unpinned" });
                    self.notify(SchedulerEvent::PinStateChanged).await;
                }
                Err(e) => warn!("Pin change for {} dropped: {}", uuid, e),
            },
            Inbound::SkipChanged { uuid, skipped } => match self.registry.set_skipped(uuid, skipped).await {
                Ok(()) => {
                    info!("App {} {}", uuid, if skipped { "skipped" } else { "unskipped" });
                    self.notify(SchedulerEvent::PinStateChanged).await;
                }
                Err(e) => warn!("Skip change for {} dropped: {}", uuid, e),
            },
            Inbound::Brightness(percent) => {
                if let Err(e) = self.config.set_brightness(percent) {
                    warn!("Brightness not persisted: {}", e);
                }
                self.command(PlayerCommand::SetBrightness(percent.min(100))).await;
            }
            Inbound::ScreenEnabled(enabled) => {
                if let Err(e) = self.config.set_screen_enabled(enabled) {
                    warn!("Screen setting not persisted: {}", e);
                }
                self.command(PlayerCommand::SetScreenEnabled(enabled)).await;
            }
            Inbound::Connected => {
                self.supervisor.record_success();
                self.notify(SchedulerEvent::Connected).await;
            }
            Inbound::Disconnected => {
                self.notify(SchedulerEvent::Disconnected).await;
                return self.supervisor.record_failure();
            }
        }
        Escalation::None
    }

    /// A connection attempt failed before any message arrived
    pub fn connect_failed(&mut self) -> Escalation {
        self.supervisor.record_failure()
    }

    async fn start_transfer(
        &self,
        uuid: Uuid,
        total_size: usize,
        chunk_count: u32,
        chunk_size: usize,
        hash: ContentHash,
        now: Instant,
    ) {
        let max = self.tunables.max_sprite_bytes as usize;
        let result = if total_size > max {
            Err(TransferError::TooLarge { total_size, max })
        } else {
            self.registry.transfer_start(uuid, total_size, chunk_count, chunk_size, hash).await
        };
        match result {
            Ok(()) => {}
            Err(TransferError::UnknownApp) => debug!("Render header for unknown app {}", uuid),
            Err(e) => {
                warn!("Render header for {} rejected: {}", uuid, e);
                self.tracker.response_received(uuid, None, true, now).await;
            }
        }
    }

    async fn add_chunk(&self, uuid: Uuid, index: u32, data: &[u8], now: Instant) {
        match self.registry.transfer_add_chunk(uuid, index, data).await {
            Ok(false) => {}
            Ok(true) => match self.registry.transfer_finalize(uuid).await {
                Ok(bytes) => {
                    debug!("Transfer for {} complete ({} bytes)", uuid, bytes.len());
                    self.tracker.response_received(uuid, Some(bytes), false, now).await;
                }
                Err(e) => {
                    warn!("Transfer for {} failed: {}", uuid, e);
                    self.tracker.response_received(uuid, None, true, now).await;
                }
            },
            Err(e @ (TransferError::ChunkOverflow { .. } | TransferError::ChunkIndexOutOfRange { .. })) => {
                warn!("Transfer for {} aborted: {}", uuid, e);
                self.tracker.response_received(uuid, None, true, now).await;
            }
            Err(TransferError::UnknownApp) => debug!("Chunk for unknown app {}", uuid),
            Err(e) => warn!("Chunk {} for {} dropped: {}", index, uuid, e),
        }
    }

    async fn notify(&self, event: SchedulerEvent) {
        if !send_within(self.scheduler, event, self.tunables.command_timeout()).await {
            warn!("Scheduler inbox full, dropped {:?}", event);
        }
    }

    async fn command(&self, command: PlayerCommand) {
        if !send_within(self.player, command, self.tunables.command_timeout()).await {
            warn!("Playback queue full, command dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::ScheduleItem;
    use crate::config::tests::MemStorage;
    use crate::protocol::ScheduleItems;
    use crate::sprite::fixtures::still;
    use crate::tracker::RenderState;
    use crate::transfer::content_hash;
    use embassy_futures::block_on;
    use embassy_time::Duration;

    struct Fixture {
        registry: Registry,
        table: TrackingTable,
        outbox: Outbox,
        scheduler: SchedulerInbox,
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
                scheduler: SchedulerInbox::new(),
                player: PlayerInbox::new(),
                tunables,
            }
        }

        fn link(&self) -> Link<'_, MemStorage> {
            Link::new(
                &self.registry,
                &self.table,
                &self.outbox,
                &self.scheduler,
                &self.player,
                &self.tunables,
                ConfigStore::open(MemStorage::default()),
            )
        }

        fn tracker(&self) -> Tracker<'_> {
            Tracker::new(&self.table, &self.registry, &self.outbox, &self.scheduler, &self.tunables)
        }

        fn events(&self) -> Vec<SchedulerEvent> {
            let mut out = Vec::new();
            while let Ok(e) = self.scheduler.try_receive() {
                out.push(e);
            }
            out
        }
    }

    fn id(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn schedule(ids: &[u128]) -> Inbound {
        let mut items = ScheduleItems::new();
        for n in ids {
            items
                .push(ScheduleItem {
                    uuid: id(*n),
                    duration_secs: 15,
                    pinned: false,
                    skipped: false,
                })
                .unwrap();
        }
        Inbound::Schedule(items)
    }

    fn ms(n: u64) -> Instant {
        Instant::from_millis(n)
    }

    fn response(uuid: Uuid, success: bool, displayable: bool) -> SchedulerEvent {
        SchedulerEvent::RenderResponse {
            uuid,
            success,
            displayable,
        }
    }

    #[test]
    fn test_schedule_syncs_and_forgets_removed() {
        let f = Fixture::new();
        let mut link = f.link();
        block_on(async {
            link.handle(schedule(&[1, 2]), ms(0)).await;
            f.tracker().request(id(2), ms(0)).await;
            link.handle(schedule(&[1]), ms(10)).await;
            assert_eq!(f.registry.count().await, 1);
            assert_eq!(f.tracker().state(id(2)).await, RenderState::NeedsRender);
        });
        assert_eq!(
            f.events(),
            vec![SchedulerEvent::ScheduleReceived, SchedulerEvent::ScheduleReceived]
        );
    }

    #[test]
    fn test_out_of_order_chunks_complete_render() {
        let f = Fixture::new();
        let mut link = f.link();
        let sprite = still(8, 8, [10, 20, 30, 255]);
        let chunk = 16;
        let parts: Vec<&[u8]> = sprite.chunks(chunk).collect();
        block_on(async {
            link.handle(schedule(&[1]), ms(0)).await;
            f.events();
            link.handle(
                Inbound::RenderHeader {
                    uuid: id(1),
                    total_size: sprite.len() as u32,
                    chunk_count: parts.len() as u32,
                    chunk_size: chunk as u32,
                    hash: content_hash(&sprite),
                },
                ms(10),
            )
            .await;
            for index in (0..parts.len()).rev() {
                link.handle(
                    Inbound::Chunk {
                        uuid: id(1),
                        index: index as u32,
                        data: parts[index].to_vec(),
                    },
                    ms(20),
                )
                .await;
            }
            let app = f.registry.find(id(1)).await.unwrap();
            assert_eq!(app.lock(Duration::from_millis(10)).await.unwrap().sprite, sprite);
            assert_eq!(f.tracker().state(id(1)).await, RenderState::RenderComplete);
        });
        assert_eq!(f.events(), vec![response(id(1), true, true)]);
    }

    #[test]
    fn test_short_chunk_resend_completes() {
        let f = Fixture::new();
        let mut link = f.link();
        let sprite = still(4, 4, [0, 255, 0, 255]);
        let size = sprite.len() - 8;
        block_on(async {
            link.handle(schedule(&[1]), ms(0)).await;
            f.events();
            link.handle(
                Inbound::RenderHeader {
                    uuid: id(1),
                    total_size: sprite.len() as u32,
                    chunk_count: 2,
                    chunk_size: size as u32,
                    hash: content_hash(&sprite),
                },
                ms(0),
            )
            .await;
            let chunk = |index: u32, data: &[u8]| Inbound::Chunk {
                uuid: id(1),
                index,
                data: data.to_vec(),
            };
            link.handle(chunk(0, &sprite[..size]), ms(0)).await;
            link.handle(chunk(1, &sprite[size..size + 4]), ms(0)).await;
            assert!(!f.registry.transfer_is_complete(id(1)).await);
            assert_eq!(f.tracker().state(id(1)).await, RenderState::NeedsRender);

            link.handle(chunk(1, &sprite[size..]), ms(0)).await;
            assert_eq!(f.tracker().state(id(1)).await, RenderState::RenderComplete);
        });
        assert_eq!(f.events(), vec![response(id(1), true, true)]);
    }

    #[test]
    fn test_hash_mismatch_fails_render() {
        let f = Fixture::new();
        let mut link = f.link();
        let sprite = still(4, 4, [0, 0, 255, 255]);
        block_on(async {
            link.handle(schedule(&[1]), ms(0)).await;
            f.events();
            link.handle(
                Inbound::RenderHeader {
                    uuid: id(1),
                    total_size: sprite.len() as u32,
                    chunk_count: 1,
                    chunk_size: sprite.len() as u32,
                    hash: [7; 32],
                },
                ms(0),
            )
            .await;
            link.handle(
                Inbound::Chunk {
                    uuid: id(1),
                    index: 0,
                    data: sprite.clone(),
                },
                ms(0),
            )
            .await;
            let app = f.registry.find(id(1)).await.unwrap();
            assert!(!f.registry.is_qualified(&app).await);
            assert_eq!(f.tracker().state(id(1)).await, RenderState::RenderFailed);
        });
        assert_eq!(f.events(), vec![response(id(1), false, false)]);
    }

    #[test]
    fn test_overflowing_chunk_aborts_transfer() {
        let f = Fixture::new();
        let mut link = f.link();
        block_on(async {
            link.handle(schedule(&[1]), ms(0)).await;
            f.events();
            link.handle(
                Inbound::RenderHeader {
                    uuid: id(1),
                    total_size: 10,
                    chunk_count: 2,
                    chunk_size: 5,
                    hash: [0; 32],
                },
                ms(0),
            )
            .await;
            link.handle(
                Inbound::Chunk {
                    uuid: id(1),
                    index: 1,
                    data: vec![0; 8],
                },
                ms(0),
            )
            .await;
            assert!(!f.registry.transfer_is_complete(id(1)).await);
            assert_eq!(f.registry.transfer_cancel(id(1)).await, Err(TransferError::NoTransfer));
        });
        assert_eq!(f.events(), vec![response(id(1), false, false)]);
    }

    #[test]
    fn test_oversized_header_rejected() {
        let f = Fixture::new();
        let mut link = f.link();
        block_on(async {
            link.handle(schedule(&[1]), ms(0)).await;
            f.events();
            link.handle(
                Inbound::RenderHeader {
                    uuid: id(1),
                    total_size: f.tunables.max_sprite_bytes + 1,
                    chunk_count: f.tunables.max_sprite_bytes.div_ceil(f.tunables.chunk_size_hint) + 1,
                    chunk_size: f.tunables.chunk_size_hint,
                    hash: [0; 32],
                },
                ms(0),
            )
            .await;
            assert_eq!(f.registry.transfer_cancel(id(1)).await, Err(TransferError::NoTransfer));
        });
        assert_eq!(f.events(), vec![response(id(1), false, false)]);
    }

    #[test]
    fn test_render_error_and_empty() {
        let f = Fixture::new();
        let mut link = f.link();
        block_on(async {
            link.handle(schedule(&[1, 2]), ms(0)).await;
            f.events();
            link.handle(Inbound::RenderError { uuid: id(1) }, ms(0)).await;
            link.handle(Inbound::RenderEmpty { uuid: id(2) }, ms(0)).await;
        });
        assert_eq!(
            f.events(),
            vec![response(id(1), false, false), response(id(2), true, false)]
        );
    }

    #[test]
    fn test_pin_and_skip_changes() {
        let f = Fixture::new();
        let mut link = f.link();
        block_on(async {
            link.handle(schedule(&[1]), ms(0)).await;
            f.events();
            link.handle(Inbound::PinChanged { uuid: id(1), pinned: true }, ms(0)).await;
            link.handle(Inbound::SkipChanged { uuid: id(1), skipped: true }, ms(0)).await;
            // Unknown apps are ignored
            link.handle(Inbound::PinChanged { uuid: id(9), pinned: true }, ms(0)).await;
            let snap = f.registry.snapshots().await[0];
            assert!(snap.pinned);
            assert!(snap.skipped);
        });
        assert_eq!(
            f.events(),
            vec![SchedulerEvent::PinStateChanged, SchedulerEvent::PinStateChanged]
        );
    }

    #[test]
    fn test_display_settings_persist_and_apply() {
        let f = Fixture::new();
        let mut link = f.link();
        block_on(async {
            link.handle(Inbound::Brightness(180), ms(0)).await;
            link.handle(Inbound::ScreenEnabled(false), ms(0)).await;
        });
        assert_eq!(link.config().brightness, 100);
        assert!(!link.config().screen_enabled);

        let commands: Vec<_> = core::iter::from_fn(|| f.player.try_receive().ok()).collect();
        assert!(matches!(
            commands.as_slice(),
            [PlayerCommand::SetBrightness(100), PlayerCommand::SetScreenEnabled(false)]
        ));
    }

    #[test]
    fn test_apply_config_pushes_stored_settings() {
        let f = Fixture::new();
        let link = f.link();
        block_on(link.apply_config());
        let commands: Vec<_> = core::iter::from_fn(|| f.player.try_receive().ok()).collect();
        assert!(matches!(
            commands.as_slice(),
            [PlayerCommand::SetBrightness(50), PlayerCommand::SetScreenEnabled(true)]
        ));
    }

    #[test]
    fn test_connectivity_events_and_escalation() {
        let f = Fixture::new();
        let mut link = f.link();
        block_on(async {
            assert_eq!(link.handle(Inbound::Connected, ms(0)).await, Escalation::None);
            for _ in 0..3 {
                assert_eq!(link.handle(Inbound::Disconnected, ms(0)).await, Escalation::None);
            }
        });
        assert_eq!(link.connect_failed(), Escalation::None);
        assert_eq!(link.connect_failed(), Escalation::ResetConnectivity);
        assert_eq!(link.supervisor().failures(), 5);

        block_on(link.handle(Inbound::Connected, ms(0)));
        assert_eq!(link.supervisor().failures(), 0);

        let events = f.events();
        assert_eq!(events.first(), Some(&SchedulerEvent::Connected));
        assert_eq!(events.iter().filter(|e| **e == SchedulerEvent::Disconnected).count(), 3);
        assert!(f.outbox.try_receive().is_err());
    }

    #[test]
    fn test_supervisor_thresholds() {
        let mut supervisor = ConnectionSupervisor::new(&Tunables::default());
        let escalations: Vec<_> = (0..11).map(|_| supervisor.record_failure()).collect();
        assert_eq!(escalations[3], Escalation::None);
        assert_eq!(escalations[4], Escalation::ResetConnectivity);
        assert_eq!(escalations[5], Escalation::None);
        assert_eq!(escalations[9], Escalation::Restart);
        assert_eq!(escalations[10], Escalation::Restart);
        supervisor.record_success();
        assert_eq!(supervisor.failures(), 0);
    }
}

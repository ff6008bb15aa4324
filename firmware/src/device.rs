//! Composition root
//!
//! [`Device`] owns every piece of shared state (catalog, tracking table,
//! queues, tunables). Workers borrow it, so a board creates one `Device`
//! (typically in a `static_cell`) and spawns:
//!
//! - the transport task, calling [`Link::handle`] and draining [`Device::outbox`]
//! - [`Device::run`], driving the scheduler and the playback engine
//! - a button task calling [`Device::press`]

use embassy_futures::select::{Either, select};
use embassy_time::Instant;
use log::warn;

use crate::config::{ConfigStorage, ConfigStore, Tunables};
use crate::display::MatrixDisplay;
use crate::link::Link;
use crate::player::{Player, PlayerInbox};
use crate::protocol::Outbox;
use crate::registry::Registry;
use crate::scheduler::{Scheduler, SchedulerEvent, SchedulerInbox};
use crate::sprite::DecoderFactory;
use crate::sync::send_within;
use crate::tracker::{Tracker, TrackingTable};

/// Front-panel buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Next,
    Previous,
}

pub struct Device {
    tunables: Tunables,
    registry: Registry,
    table: TrackingTable,
    outbox: Outbox,
    scheduler_inbox: SchedulerInbox,
    player_inbox: PlayerInbox,
}

impl Device {
    pub fn new(tunables: Tunables) -> Self {
        Self {
            registry: Registry::new(tunables.lock_timeout()),
            table: TrackingTable::new(),
            outbox: Outbox::new(),
            scheduler_inbox: SchedulerInbox::new(),
            player_inbox: PlayerInbox::new(),
            tunables,
        }
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Messages for the server, drained by the transport
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn scheduler_inbox(&self) -> &SchedulerInbox {
        &self.scheduler_inbox
    }

    pub fn player_inbox(&self) -> &PlayerInbox {
        &self.player_inbox
    }

    pub fn tracker(&self) -> Tracker<'_> {
        Tracker::new(
            &self.table,
            &self.registry,
            &self.outbox,
            &self.scheduler_inbox,
            &self.tunables,
        )
    }

    pub fn scheduler(&self) -> Scheduler<'_> {
        Scheduler::new(
            &self.registry,
            &self.table,
            &self.outbox,
            &self.scheduler_inbox,
            &self.player_inbox,
            &self.tunables,
        )
    }

    pub fn player<F: DecoderFactory, D: MatrixDisplay>(&self, factory: F, display: D) -> Player<'_, F, D> {
        Player::new(
            factory,
            display,
            &self.player_inbox,
            &self.scheduler_inbox,
            self.tunables.clone(),
        )
    }

    pub fn link<S: ConfigStorage>(&self, config: ConfigStore<S>) -> Link<'_, S> {
        Link::new(
            &self.registry,
            &self.table,
            &self.outbox,
            &self.scheduler_inbox,
            &self.player_inbox,
            &self.tunables,
            config,
        )
    }

    /// Forward a button press to the scheduler
    pub async fn press(&self, button: Button) {
        let event = match button {
            Button::Next => SchedulerEvent::ButtonNext,
            Button::Previous => SchedulerEvent::ButtonPrevious,
        };
        if !send_within(&self.scheduler_inbox, event, self.tunables.command_timeout()).await {
            warn!("Scheduler inbox full, {:?} press dropped", button);
        }
    }

    /// Run the scheduler and the playback engine together
    pub async fn run<F: DecoderFactory, D: MatrixDisplay>(&self, factory: F, display: D) -> ! {
        let mut scheduler = self.scheduler();
        let mut player = self.player(factory, display);
        match select(scheduler.run(), player.run()).await {
            Either::First(never) | Either::Second(never) => never,
        }
    }

    /// Drive both loops by hand: dispatch queued events and commands,
    /// fire due timers and step playback once
    pub async fn pump<F: DecoderFactory, D: MatrixDisplay>(
        &self,
        scheduler: &mut Scheduler<'_>,
        player: &mut Player<'_, F, D>,
        now: Instant,
    ) {
        scheduler.poll_timers(now).await;
        while let Ok(event) = self.scheduler_inbox.try_receive() {
            scheduler.handle(event, now).await;
        }
        while let Ok(command) = self.player_inbox.try_receive() {
            player.handle(command, now).await;
        }
        player.step(now).await;
        while let Ok(event) = self.scheduler_inbox.try_receive() {
            scheduler.handle(event, now).await;
        }
    }
}

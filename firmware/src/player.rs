//! Playback engine
//!
//! A single task owns the decoder, the scratch buffer and the display.
//! Commands arrive through the [`PlayerInbox`] and are drained at the top
//! of every iteration; the only suspension point is the timed wait
//! between frames, so a command never races a half-decoded frame.
//!
//! Per iteration while playing:
//! 1. At the end of an animation loop decide whether to loop again
//!    (built-in assets and unbounded requests always do, others only while
//!    inside their duration budget), else move on to the staged next item
//!    or go idle.
//! 2. Decode the next frame, retrying a few times before giving up.
//! 3. Draw it.
//! 4. Signal "prepare next" once when the remaining budget drops under
//!    the lookahead window.
//! 5. Sleep for the frame delay; still images hold for the rest of their
//!    budget instead.

use std::sync::Arc;

use embassy_futures::select::select;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Timer};
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::App;
use crate::assets::BuiltinAsset;
use crate::config::Tunables;
use crate::display::MatrixDisplay;
use crate::error::SpriteError;
use crate::scheduler::{SchedulerEvent, SchedulerInbox};
use crate::sprite::{DecoderFactory, FrameDecoder, SpriteBytes};
use crate::sync::{RawMutex, send_within};

/// Depth of the playback command queue
pub const PLAYER_INBOX_DEPTH: usize = 8;

pub type PlayerInbox = Channel<RawMutex, PlayerCommand, PLAYER_INBOX_DEPTH>;

/// What to play
#[derive(Debug, Clone)]
pub enum Source {
    /// Catalog app; its sprite is copied into the scratch buffer
    App(Arc<App>),
    /// Embedded asset, decoded in place
    Builtin(BuiltinAsset),
}

impl Source {
    pub fn id(&self) -> SourceId {
        match self {
            Source::App(app) => SourceId::App(app.uuid()),
            Source::Builtin(asset) => SourceId::Builtin(*asset),
        }
    }
}

/// Identifies a source in events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceId {
    App(Uuid),
    Builtin(BuiltinAsset),
}

#[derive(Debug, Clone)]
pub enum PlayerCommand {
    /// Play `source` for `duration` (zero means until replaced). Unless
    /// `immediate`, a busy engine stages it as the next item instead.
    Play {
        source: Source,
        duration: Duration,
        immediate: bool,
    },
    /// Stage the item that follows the current one
    SetNext { source: Source, duration: Duration },
    /// Tear down playback and blank the panel
    Stop,
    Pause,
    Resume,
    /// Whether an idle engine keeps asking for content
    SetDisplayMode(bool),
    SetBrightness(u8),
    SetScreenEnabled(bool),
}

/// Notifications for the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    Playing(SourceId),
    /// Duration budget exhausted with nothing staged
    Stopped(SourceId),
    Error(SourceId),
    /// Idle in display mode, nothing to show
    NeedNext,
    /// Current item is inside its lookahead window
    PrepareNext(SourceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Playing,
    Paused,
}

struct Request {
    source: Source,
    duration: Duration,
}

/// The item being played
struct Playback<Dec> {
    id: SourceId,
    decoder: Dec,
    width: u32,
    height: u32,
    duration: Duration,
    loops_forever: bool,
    started_at: Instant,
    paused_for: Duration,
    loops: u32,
    frame_count: u32,
    frames_this_loop: u32,
    loop_duration: Duration,
    last_frame_at: Option<Instant>,
    decode_failures: u8,
    prepare_sent: bool,
}

impl<Dec> Playback<Dec> {
    fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
            .checked_sub(self.paused_for)
            .unwrap_or(Duration::MIN)
    }

    /// Remaining budget, `None` when unbounded
    fn remaining(&self, now: Instant) -> Option<Duration> {
        if self.loops_forever || self.duration == Duration::MIN {
            return None;
        }
        Some(self.duration.checked_sub(self.elapsed(now)).unwrap_or(Duration::MIN))
    }

    fn keeps_looping(&self, now: Instant) -> bool {
        self.remaining(now).is_none_or(|left| left > Duration::MIN)
    }
}

enum Ending {
    Finished,
    Failed,
}

/// The playback engine
pub struct Player<'d, F: DecoderFactory, D: MatrixDisplay> {
    factory: F,
    display: D,
    inbox: &'d PlayerInbox,
    events: &'d SchedulerInbox,
    tunables: Tunables,
    state: PlayerState,
    current: Option<Playback<F::Decoder>>,
    next: Option<Request>,
    scratch: Arc<Vec<u8>>,
    frame: Vec<u8>,
    display_mode: bool,
    screen_enabled: bool,
    paused_at: Option<Instant>,
    last_need_next: Option<Instant>,
}

impl<'d, F: DecoderFactory, D: MatrixDisplay> Player<'d, F, D> {
    pub fn new(
        factory: F,
        display: D,
        inbox: &'d PlayerInbox,
        events: &'d SchedulerInbox,
        tunables: Tunables,
    ) -> Self {
        Self {
            factory,
            display,
            inbox,
            events,
            tunables,
            state: PlayerState::Idle,
            current: None,
            next: None,
            scratch: Arc::new(Vec::new()),
            frame: Vec::new(),
            display_mode: false,
            screen_enabled: true,
            paused_at: None,
            last_need_next: None,
        }
    }

    pub fn state(&self) -> PlayerState {
        self.state
    }

    pub fn current(&self) -> Option<SourceId> {
        self.current.as_ref().map(|p| p.id)
    }

    /// The staged next item, if any
    pub fn staged(&self) -> Option<SourceId> {
        self.next.as_ref().map(|r| r.source.id())
    }

    /// Completed loops of the current item
    pub fn loops(&self) -> u32 {
        self.current.as_ref().map_or(0, |p| p.loops)
    }

    /// Length of one loop of the current item, known once it has looped
    pub fn loop_duration(&self) -> Option<Duration> {
        self.current.as_ref().filter(|p| p.loops > 0).map(|p| p.loop_duration)
    }

    /// When the last frame was drawn
    pub fn last_frame_at(&self) -> Option<Instant> {
        self.current.as_ref().and_then(|p| p.last_frame_at)
    }

    pub fn scratch_capacity(&self) -> usize {
        self.scratch.capacity()
    }

    pub fn display_mode(&self) -> bool {
        self.display_mode
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    /// Apply one command
    pub async fn handle(&mut self, command: PlayerCommand, now: Instant) {
        match command {
            PlayerCommand::Play {
                source,
                duration,
                immediate,
            } => {
                let request = Request { source, duration };
                if immediate || self.state == PlayerState::Idle {
                    self.next = None;
                    self.current = None;
                    self.start(request, now).await;
                } else {
                    self.stage(request);
                }
            }
            PlayerCommand::SetNext { source, duration } => {
                let request = Request { source, duration };
                if self.state == PlayerState::Idle {
                    self.start(request, now).await;
                } else {
                    self.stage(request);
                }
            }
            PlayerCommand::Stop => {
                self.current = None;
                self.next = None;
                self.paused_at = None;
                self.state = PlayerState::Idle;
                self.display.clear();
                info!("Playback stopped");
            }
            PlayerCommand::Pause => {
                if self.state == PlayerState::Playing {
                    self.state = PlayerState::Paused;
                    self.paused_at = Some(now);
                }
            }
            PlayerCommand::Resume => {
                if self.state == PlayerState::Paused {
                    if let (Some(at), Some(current)) = (self.paused_at.take(), self.current.as_mut()) {
                        current.paused_for += now.saturating_duration_since(at);
                    }
                    self.state = PlayerState::Playing;
                }
            }
            PlayerCommand::SetDisplayMode(enabled) => {
                self.display_mode = enabled;
                self.last_need_next = None;
            }
            PlayerCommand::SetBrightness(percent) => self.display.set_brightness(percent),
            PlayerCommand::SetScreenEnabled(enabled) => {
                self.screen_enabled = enabled;
                if !enabled {
                    self.display.clear();
                }
            }
        }
    }

    fn stage(&mut self, request: Request) {
        let id = request.source.id();
        if let Some(previous) = self.next.replace(request) {
            debug!("Staged {:?} replaces {:?}", id, previous.source.id());
        } else {
            debug!("Staged {:?}", id);
        }
    }

    /// Run one iteration, returning how long to wait before the next one
    pub async fn step(&mut self, now: Instant) -> Duration {
        match self.state {
            PlayerState::Idle => self.idle_step(now).await,
            PlayerState::Paused => self.tunables.idle_tick(),
            PlayerState::Playing => self.play_step(now).await,
        }
    }

    async fn idle_step(&mut self, now: Instant) -> Duration {
        if !self.display_mode {
            return self.tunables.idle_tick();
        }
        let interval = self.tunables.need_next_interval();
        if self
            .last_need_next
            .is_none_or(|at| now.saturating_duration_since(at) >= interval)
        {
            self.last_need_next = Some(now);
            self.emit(PlaybackEvent::NeedNext).await;
        }
        interval
    }

    async fn play_step(&mut self, now: Instant) -> Duration {
        let Some(current) = self.current.as_mut() else {
            self.state = PlayerState::Idle;
            return Duration::MIN;
        };

        // At most one rewind per iteration
        let mut frame_delay = None;
        for _ in 0..2 {
            match current.decoder.next_frame(&mut self.frame) {
                Ok(Some(delay)) => {
                    frame_delay = Some(delay);
                    break;
                }
                Ok(None) => {
                    if current.frames_this_loop == 0 {
                        warn!("{:?} has no frames", current.id);
                        return self.end(now, Ending::Failed).await;
                    }
                    current.loops += 1;
                    if !current.keeps_looping(now) {
                        return self.end(now, Ending::Finished).await;
                    }
                    if let Err(e) = current.decoder.rewind() {
                        return self.decode_failed(now, e).await;
                    }
                    current.frames_this_loop = 0;
                }
                Err(e) => return self.decode_failed(now, e).await,
            }
        }
        let Some(frame_delay) = frame_delay else {
            return self.end(now, Ending::Failed).await;
        };

        current.decode_failures = 0;
        current.frames_this_loop += 1;
        if current.loops == 0 {
            current.loop_duration += frame_delay;
        }
        current.last_frame_at = Some(now);

        let id = current.id;
        let (width, height) = (current.width, current.height);
        let is_still = current.frame_count <= 1;
        let remaining = current.remaining(now);
        let lookahead = self.tunables.prepare_lookahead();
        let prepare = !current.prepare_sent && remaining.is_some_and(|left| left <= lookahead);
        if prepare {
            current.prepare_sent = true;
        }
        let prepare_sent = current.prepare_sent;

        if self.screen_enabled {
            self.display.draw_frame(&self.frame, width, height);
        }
        if prepare {
            self.emit(PlaybackEvent::PrepareNext(id)).await;
        }

        let idle_tick = self.tunables.idle_tick();
        if is_still {
            // Wake up again at the start of the prepare window
            let hold = match remaining {
                Some(left) if !prepare_sent && left > lookahead => left - lookahead,
                Some(left) => left,
                None => idle_tick,
            };
            hold.max(idle_tick)
        } else {
            frame_delay.max(self.tunables.min_frame_delay())
        }
    }

    async fn decode_failed(&mut self, now: Instant, e: SpriteError) -> Duration {
        let Some(current) = self.current.as_mut() else {
            return Duration::MIN;
        };
        current.decode_failures += 1;
        if current.decode_failures < self.tunables.decode_retries {
            warn!(
                "{:?} frame decode failed ({}), attempt {}/{}",
                current.id, e, current.decode_failures, self.tunables.decode_retries
            );
            return self.tunables.decode_retry_delay();
        }
        error!("{:?} decode failed {} times, giving up", current.id, current.decode_failures);
        self.end(now, Ending::Failed).await
    }

    /// Tear down the current item and move on to the staged one or idle
    async fn end(&mut self, now: Instant, ending: Ending) -> Duration {
        let Some(finished) = self.current.take() else {
            return Duration::MIN;
        };
        let id = finished.id;
        info!("{:?} ended after {} loops", id, finished.loops);
        drop(finished);

        if let Ending::Failed = ending {
            self.emit(PlaybackEvent::Error(id)).await;
        }
        match self.next.take() {
            Some(next) => self.start(next, now).await,
            None => {
                self.state = PlayerState::Idle;
                if let Ending::Finished = ending {
                    self.emit(PlaybackEvent::Stopped(id)).await;
                }
            }
        }
        Duration::MIN
    }

    /// Start `request`, falling through to the staged item if it cannot be opened
    async fn start(&mut self, request: Request, now: Instant) {
        let mut pending = Some(request);
        while let Some(request) = pending.take() {
            let id = request.source.id();
            match self.open(&request.source).await {
                Ok(decoder) => {
                    let (width, height) = decoder.dimensions();
                    let frame_count = decoder.frame_count();
                    self.current = Some(Playback {
                        id,
                        decoder,
                        width,
                        height,
                        duration: request.duration,
                        loops_forever: matches!(request.source, Source::Builtin(_)),
                        started_at: now,
                        paused_for: Duration::MIN,
                        loops: 0,
                        frame_count,
                        frames_this_loop: 0,
                        loop_duration: Duration::MIN,
                        last_frame_at: None,
                        decode_failures: 0,
                        prepare_sent: false,
                    });
                    self.state = PlayerState::Playing;
                    self.paused_at = None;
                    info!(
                        "Playing {:?} ({}x{}, {} frames, {} ms)",
                        id,
                        width,
                        height,
                        frame_count,
                        request.duration.as_millis()
                    );
                    self.emit(PlaybackEvent::Playing(id)).await;
                    return;
                }
                Err(e) => {
                    warn!("Cannot play {:?}: {}", id, e);
                    self.emit(PlaybackEvent::Error(id)).await;
                    pending = self.next.take();
                }
            }
        }
        self.state = PlayerState::Idle;
    }

    async fn open(&mut self, source: &Source) -> Result<F::Decoder, SpriteError> {
        let bytes = match source {
            Source::Builtin(asset) => SpriteBytes::Static(asset.bytes()),
            Source::App(app) => {
                let state = app
                    .lock(self.tunables.lock_timeout())
                    .await
                    .ok_or(SpriteError::Unavailable)?;
                if state.sprite.is_empty() {
                    return Err(SpriteError::Empty);
                }
                self.load_scratch(&state.sprite);
                SpriteBytes::Shared(self.scratch.clone())
            }
        };
        self.factory.open(bytes)
    }

    /// Copy sprite bytes into the scratch buffer; it only ever grows
    fn load_scratch(&mut self, bytes: &[u8]) {
        if Arc::get_mut(&mut self.scratch).is_none() {
            warn!("Scratch buffer still shared, reallocating");
            self.scratch = Arc::new(Vec::with_capacity(bytes.len()));
        }
        if let Some(buf) = Arc::get_mut(&mut self.scratch) {
            buf.clear();
            buf.extend_from_slice(bytes);
        }
    }

    async fn emit(&self, event: PlaybackEvent) {
        let sent = send_within(
            self.events,
            SchedulerEvent::Playback(event),
            self.tunables.command_timeout(),
        )
        .await;
        if !sent {
            warn!("Scheduler inbox full, dropped {:?}", event);
        }
    }

    /// Drive the engine forever
    pub async fn run(&mut self) -> ! {
        let mut due = Instant::now();
        loop {
            let before = (self.state, self.current());
            while let Ok(command) = self.inbox.try_receive() {
                self.handle(command, Instant::now()).await;
            }
            let now = Instant::now();
            if now >= due || (self.state, self.current()) != before {
                due = now.checked_add(self.step(now).await).unwrap_or(Instant::MAX);
            }
            select(Timer::at(due), self.inbox.ready_to_receive()).await;
        }
    }
}

//! Runtime tunables and the persisted device configuration
//!
//! Tunables are the hand-tuned timing and retry constants of the core.
//! They default to the values the device ships with and can be
//! overridden from a JSON document, e.g.:
//! ```json
//! {"pending_timeout_ms": 8000, "retry_interval_ms": 15000}
//! ```
//!
//! The device configuration is a small record owned by the board's
//! key/value store. The core only touches it through [`ConfigStore`].

use embassy_time::Duration;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Size of the buffer used to (de)serialize [`DeviceConfig`]
const CONFIG_BUF_LEN: usize = 128;

macro_rules! millis_accessors {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) -> Duration {
                Duration::from_millis(self.$field as u64)
            }
        )*
    };
}

/// Timing, retry and sizing constants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// A pending render request is not re-sent before this elapses
    pub pending_timeout_ms: u32,
    /// A completed render is not re-requested before this elapses
    pub success_cooldown_ms: u32,
    /// Pending-timeout retries before falling back to NeedsRender
    pub max_request_retries: u8,
    /// Local validation failures tolerated before RenderFailed
    pub max_validation_attempts: u8,
    /// Scheduler retry timer while waiting for render data
    pub retry_interval_ms: u32,
    /// Prepare window before a playing item's duration expires
    pub prepare_lookahead_ms: u32,
    /// Upcoming apps prefetched when the prepare timer fires
    pub prefetch_count: u8,
    /// Schedule request backoff, first and capped interval
    pub schedule_retry_min_ms: u32,
    pub schedule_retry_max_ms: u32,
    /// Frame decode attempts before a playback error
    pub decode_retries: u8,
    pub decode_retry_delay_ms: u32,
    /// Playback hold when there is nothing better to wait for
    pub idle_tick_ms: u32,
    /// How often an idle engine in display mode asks for content
    pub need_next_interval_ms: u32,
    /// Floor for animation frame delays
    pub min_frame_delay_ms: u32,
    /// Largest accepted sprite width or height
    pub max_sprite_dimension: u32,
    /// Largest accepted chunked transfer
    pub max_sprite_bytes: u32,
    /// Preferred chunk size sent with render requests
    pub chunk_size_hint: u32,
    /// Bounded wait for catalog, app and tracking-table locks
    pub lock_timeout_ms: u32,
    /// Bounded wait for command and event queues
    pub command_timeout_ms: u32,
    /// Consecutive connection failures before a connectivity reset
    pub reset_connectivity_after: u8,
    /// Consecutive connection failures before a full restart
    pub restart_after: u8,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            pending_timeout_ms: 5_000,
            success_cooldown_ms: 5_000,
            max_request_retries: 3,
            max_validation_attempts: 3,
            retry_interval_ms: 10_000,
            prepare_lookahead_ms: 2_000,
            prefetch_count: 2,
            schedule_retry_min_ms: 10_000,
            schedule_retry_max_ms: 30_000,
            decode_retries: 3,
            decode_retry_delay_ms: 50,
            idle_tick_ms: 1_000,
            need_next_interval_ms: 1_000,
            min_frame_delay_ms: 10,
            max_sprite_dimension: 1024,
            max_sprite_bytes: 512 * 1024,
            chunk_size_hint: 4096,
            lock_timeout_ms: 100,
            command_timeout_ms: 100,
            reset_connectivity_after: 5,
            restart_after: 10,
        }
    }
}

impl Tunables {
    /// Parse tunables from JSON, missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json_core::from_str(json)
            .map(|(tunables, _)| tunables)
            .map_err(|_| ConfigError::Decode)
    }

    millis_accessors! {
        pending_timeout => pending_timeout_ms,
        success_cooldown => success_cooldown_ms,
        retry_interval => retry_interval_ms,
        prepare_lookahead => prepare_lookahead_ms,
        schedule_retry_min => schedule_retry_min_ms,
        schedule_retry_max => schedule_retry_max_ms,
        decode_retry_delay => decode_retry_delay_ms,
        idle_tick => idle_tick_ms,
        need_next_interval => need_next_interval_ms,
        min_frame_delay => min_frame_delay_ms,
        lock_timeout => lock_timeout_ms,
        command_timeout => command_timeout_ms,
    }
}

/// Device-local settings, persisted by the board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub screen_enabled: bool,
    /// Brightness percentage (0-100)
    pub brightness: u8,
    pub auto_brightness: bool,
    /// Ambient light level below which the screen turns off
    pub screen_off_lux: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            screen_enabled: true,
            brightness: 50,
            auto_brightness: false,
            screen_off_lux: 0,
        }
    }
}

/// Backing store for the serialized [`DeviceConfig`] (NVS partition, file, ...)
pub trait ConfigStorage {
    /// Copy the stored record into `buf`, returning its length
    fn load(&mut self, buf: &mut [u8]) -> Option<usize>;
    /// Replace the stored record
    fn store(&mut self, data: &[u8]) -> Result<(), ConfigError>;
}

/// Get/set accessors over a persisted [`DeviceConfig`]
pub struct ConfigStore<S> {
    storage: S,
    current: DeviceConfig,
}

impl<S: ConfigStorage> ConfigStore<S> {
    /// Load the stored config, falling back to defaults if it is missing or corrupt
    pub fn open(mut storage: S) -> Self {
        let mut buf = [0u8; CONFIG_BUF_LEN];
        let current = match storage.load(&mut buf) {
            Some(len) => match Self::decode(buf.get(..len)) {
                Some(config) => config,
                None => {
                    warn!("Stored device config is unreadable, using defaults");
                    DeviceConfig::default()
                }
            },
            None => {
                info!("No stored device config, using defaults");
                DeviceConfig::default()
            }
        };
        Self { storage, current }
    }

    fn decode(bytes: Option<&[u8]>) -> Option<DeviceConfig> {
        let json = core::str::from_utf8(bytes?).ok()?;
        serde_json_core::from_str(json).ok().map(|(config, _)| config)
    }

    pub fn get(&self) -> DeviceConfig {
        self.current
    }

    /// Persist `config` and make it current
    pub fn set(&mut self, config: DeviceConfig) -> Result<(), ConfigError> {
        let mut buf = [0u8; CONFIG_BUF_LEN];
        let len = serde_json_core::to_slice(&config, &mut buf).map_err(|_| ConfigError::Encode)?;
        self.storage.store(&buf[..len])?;
        self.current = config;
        Ok(())
    }

    /// Set brightness, clamped to 100%
    pub fn set_brightness(&mut self, brightness: u8) -> Result<(), ConfigError> {
        self.set(DeviceConfig {
            brightness: brightness.min(100),
            ..self.current
        })
    }

    pub fn set_screen_enabled(&mut self, enabled: bool) -> Result<(), ConfigError> {
        self.set(DeviceConfig {
            screen_enabled: enabled,
            ..self.current
        })
    }
}

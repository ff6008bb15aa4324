//! Messages exchanged with the transport layer
//!
//! The transport (socket client, framing, TLS) lives outside this crate.
//! It hands parsed [`Inbound`] messages to [`crate::link::Link`] and
//! drains [`Outbound`] messages from the [`Outbox`].
//!
//! Schedule JSON format from the server:
//! ```json
//! [{"uuid": "6f1c...", "duration": 15, "pinned": false, "skipped": false}]
//! ```

use embassy_sync::channel::Channel;
use heapless::Vec;
use serde::Deserialize;
use uuid::Uuid;

use crate::app::{ContentHash, ScheduleItem};
use crate::error::ProtocolError;
use crate::registry::MAX_APPS;
use crate::sync::RawMutex;

/// Maximum number of entries accepted in one schedule message. Entries
/// past the catalog capacity are rejected (and logged) by the registry.
pub const MAX_SCHEDULE_ITEMS: usize = MAX_APPS * 2;

/// Depth of the outbound message queue
pub const OUTBOX_DEPTH: usize = 8;

/// Default display duration when the server omits one
const DEFAULT_DURATION_SECS: u32 = 15;

pub type ScheduleItems = Vec<ScheduleItem, MAX_SCHEDULE_ITEMS>;

/// Messages for the server, drained by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Ask for an app's sprite. `hash` is the content we already hold.
    RenderRequest {
        uuid: Uuid,
        hash: ContentHash,
        chunk_size: u32,
    },
    CurrentlyDisplaying {
        uuid: Uuid,
    },
    ScheduleRequest,
}

pub type Outbox = Channel<RawMutex, Outbound, OUTBOX_DEPTH>;

/// Messages from the server (or the connection itself)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Schedule(ScheduleItems),
    /// Start of a chunked render response. Every chunk but the last
    /// carries exactly `chunk_size` bytes.
    RenderHeader {
        uuid: Uuid,
        total_size: u32,
        chunk_count: u32,
        chunk_size: u32,
        hash: ContentHash,
    },
    Chunk {
        uuid: Uuid,
        index: u32,
        data: std::vec::Vec<u8>,
    },
    /// Server failed to render the app
    RenderError {
        uuid: Uuid,
    },
    /// Server rendered the app but it has nothing to show
    RenderEmpty {
        uuid: Uuid,
    },
    PinChanged {
        uuid: Uuid,
        pinned: bool,
    },
    SkipChanged {
        uuid: Uuid,
        skipped: bool,
    },
    Brightness(u8),
    ScreenEnabled(bool),
    Connected,
    Disconnected,
}

#[derive(Deserialize)]
struct ScheduleEntry<'a> {
    uuid: &'a str,
    #[serde(default = "default_duration")]
    duration: u32,
    #[serde(default)]
    pinned: bool,
    #[serde(default)]
    skipped: bool,
}

fn default_duration() -> u32 {
    DEFAULT_DURATION_SECS
}

/// Parse a schedule JSON array
pub fn parse_schedule(json: &str) -> Result<ScheduleItems, ProtocolError> {
    let (entries, _): (Vec<ScheduleEntry, MAX_SCHEDULE_ITEMS>, _) =
        serde_json_core::from_str(json).map_err(|_| ProtocolError::Json)?;

    let mut items = ScheduleItems::new();
    for entry in entries {
        let uuid = Uuid::parse_str(entry.uuid).map_err(|_| ProtocolError::InvalidUuid)?;
        // Same capacity as `entries`
        let _ = items.push(ScheduleItem {
            uuid,
            duration_secs: entry.duration,
            pinned: entry.pinned,
            skipped: entry.skipped,
        });
    }
    Ok(items)
}

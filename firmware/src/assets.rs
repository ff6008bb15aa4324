//! Built-in assets stored in flash
//!
//! These are played straight from read-only memory, without copying
//! into the playback scratch buffer, and always loop until replaced.

/// Assets embedded in the firmware image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinAsset {
    /// Shown while the device has no server connection (64x32, animated)
    Connecting,
}

static CONNECTING_WEBP: &[u8] = include_bytes!("../assets/connecting.webp");

impl BuiltinAsset {
    pub fn bytes(&self) -> &'static [u8] {
        match self {
            BuiltinAsset::Connecting => CONNECTING_WEBP,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinAsset::Connecting => "connecting",
        }
    }
}

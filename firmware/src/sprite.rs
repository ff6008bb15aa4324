//! Sprite validation and frame decoding
//!
//! Sprites are WebP images, animated or still. Validation is structural
//! only (size, magic, dimensions) so a truncated or garbage transfer is
//! rejected without decoding any animation data. Decoding goes through
//! the [`FrameDecoder`] trait so the playback engine can be driven by
//! other decoders in tests.

use std::io::Cursor;
use std::sync::Arc;

use embassy_time::Duration;
use image_webp::{DecodingError, WebPDecoder};
use log::warn;

use crate::error::SpriteError;

/// Smallest byte count that can hold a RIFF header plus one chunk header
pub const MIN_SPRITE_LEN: usize = 20;

const RIFF_MAGIC: &[u8; 4] = b"RIFF";
const WEBP_MAGIC: &[u8; 4] = b"WEBP";

/// Structurally validate sprite bytes, returning the canvas dimensions
pub fn validate(bytes: &[u8], max_dimension: u32) -> Result<(u32, u32), SpriteError> {
    if bytes.len() < MIN_SPRITE_LEN {
        return Err(SpriteError::TooShort(bytes.len()));
    }
    if &bytes[0..4] != RIFF_MAGIC || &bytes[8..12] != WEBP_MAGIC {
        return Err(SpriteError::BadMagic);
    }

    let decoder = WebPDecoder::new(Cursor::new(bytes)).map_err(|e| {
        warn!("Sprite header rejected: {}", e);
        SpriteError::Decode
    })?;
    let (width, height) = decoder.dimensions();
    if width == 0 || height == 0 || width > max_dimension || height > max_dimension {
        return Err(SpriteError::TooLarge { width, height });
    }
    Ok((width, height))
}

/// Bytes handed to a decoder: embedded assets are borrowed, app sprites shared
#[derive(Debug, Clone)]
pub enum SpriteBytes {
    Static(&'static [u8]),
    Shared(Arc<Vec<u8>>),
}

impl AsRef<[u8]> for SpriteBytes {
    fn as_ref(&self) -> &[u8] {
        match self {
            SpriteBytes::Static(bytes) => bytes,
            SpriteBytes::Shared(bytes) => bytes.as_slice(),
        }
    }
}

/// Frame-by-frame decoder over one sprite
pub trait FrameDecoder {
    fn dimensions(&self) -> (u32, u32);

    /// Frames per animation loop, 1 for still images
    fn frame_count(&self) -> u32;

    /// Decode the next frame of the current loop into `out` as packed RGB888
    ///
    /// Returns the frame's display time, or `None` once the loop is exhausted.
    fn next_frame(&mut self, out: &mut Vec<u8>) -> Result<Option<Duration>, SpriteError>;

    /// Start the next loop from the first frame
    fn rewind(&mut self) -> Result<(), SpriteError>;
}

/// Creates decoders for the playback engine
pub trait DecoderFactory {
    type Decoder: FrameDecoder;

    fn open(&mut self, bytes: SpriteBytes) -> Result<Self::Decoder, SpriteError>;
}

/// [`FrameDecoder`] backed by `image-webp`
pub struct WebpDecoder {
    inner: WebPDecoder<Cursor<SpriteBytes>>,
    canvas: Vec<u8>,
    still_done: bool,
}

impl WebpDecoder {
    pub fn new(bytes: SpriteBytes) -> Result<Self, SpriteError> {
        let inner = WebPDecoder::new(Cursor::new(bytes)).map_err(decode_error)?;
        let (width, height) = inner.dimensions();
        let size = inner
            .output_buffer_size()
            .ok_or(SpriteError::TooLarge { width, height })?;
        Ok(Self {
            inner,
            canvas: vec![0; size],
            still_done: false,
        })
    }

    fn copy_canvas(&self, out: &mut Vec<u8>) {
        out.clear();
        if self.inner.has_alpha() {
            // Composite over black
            out.extend(self.canvas.chunks_exact(4).flat_map(|px| {
                let a = px[3] as u16;
                [
                    (px[0] as u16 * a / 255) as u8,
                    (px[1] as u16 * a / 255) as u8,
                    (px[2] as u16 * a / 255) as u8,
                ]
            }));
        } else {
            out.extend_from_slice(&self.canvas);
        }
    }
}

fn decode_error(e: DecodingError) -> SpriteError {
    warn!("WebP decode error: {}", e);
    SpriteError::Decode
}

impl FrameDecoder for WebpDecoder {
    fn dimensions(&self) -> (u32, u32) {
        self.inner.dimensions()
    }

    fn frame_count(&self) -> u32 {
        if self.inner.is_animated() {
            self.inner.num_frames()
        } else {
            1
        }
    }

    fn next_frame(&mut self, out: &mut Vec<u8>) -> Result<Option<Duration>, SpriteError> {
        let delay = if self.inner.is_animated() {
            match self.inner.read_frame(&mut self.canvas) {
                Ok(ms) => Duration::from_millis(ms as u64),
                Err(DecodingError::NoMoreFrames) => return Ok(None),
                Err(e) => return Err(decode_error(e)),
            }
        } else {
            if self.still_done {
                return Ok(None);
            }
            self.inner.read_image(&mut self.canvas).map_err(decode_error)?;
            self.still_done = true;
            Duration::from_ticks(0)
        };

        self.copy_canvas(out);
        Ok(Some(delay))
    }

    fn rewind(&mut self) -> Result<(), SpriteError> {
        if self.inner.is_animated() {
            self.inner.reset_animation();
        } else {
            self.still_done = false;
        }
        Ok(())
    }
}

/// Opens [`WebpDecoder`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct WebpDecoderFactory;

impl DecoderFactory for WebpDecoderFactory {
    type Decoder = WebpDecoder;

    fn open(&mut self, bytes: SpriteBytes) -> Result<WebpDecoder, SpriteError> {
        WebpDecoder::new(bytes)
    }
}

//! Turns an irregularly chunked PCM byte stream into fixed-size frames.

use bytes::BytesMut;

use super::format::{AudioFrame, FRAME_BYTES};

/// Accumulates capture chunks and cuts them into `FRAME_BYTES` frames.
///
/// Leftover bytes stay buffered until the next push. Short frames are never
/// produced; whatever is left when capture stops is discarded.
pub struct Framer {
    buf: BytesMut,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    pub fn new() -> Self {
        Self {
            // Room for a remainder plus a typical capture period without regrowing.
            buf: BytesMut::with_capacity(FRAME_BYTES * 4),
        }
    }

    /// Append `chunk` and return the frames that are now complete, in order.
    ///
    /// Frames are cut lazily; any the caller does not consume stay buffered
    /// and come out first on the next push.
    pub fn push(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.buf.extend_from_slice(chunk);
        Frames { buf: &mut self.buf }
    }

    /// Bytes of incomplete frame data currently held.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop any buffered partial frame.
    pub fn reset(&mut self) {
        if !self.buf.is_empty() {
            log::debug!("Framer discarding {} trailing bytes", self.buf.len());
        }
        self.buf.clear();
    }
}

pub struct Frames<'a> {
    buf: &'a mut BytesMut,
}

impl Iterator for Frames<'_> {
    type Item = AudioFrame;

    fn next(&mut self) -> Option<AudioFrame> {
        if self.buf.len() < FRAME_BYTES {
            return None;
        }
        let data = self.buf.split_to(FRAME_BYTES).freeze();
        // Length was checked above.
        AudioFrame::new(data).ok()
    }
}

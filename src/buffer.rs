//! Buffer management for AMI frame splitting

use crate::{
    constants::*,
    error::{AmiError, AmiResult},
};
use bytes::{BufMut, BytesMut};

/// Receive buffer. Frames may span several socket reads and one read may
/// carry several frames; whatever follows the last delimiter stays here.
pub struct AmiBuffer {
    buffer: BytesMut,
    position: usize,
}

impl AmiBuffer {
    /// Create new buffer with default capacity
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(BUF_CHUNK),
            position: 0,
        }
    }

    /// Get current length of unconsumed data in buffer
    pub fn len(&self) -> usize {
        self.buffer.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extend buffer with more data
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        if self.buffer.remaining_mut() < data.len() {
            let old_cap = self.buffer.capacity();
            self.buffer.reserve(data.len().max(BUF_CHUNK));
            tracing::trace!(
                "Buffer grew from {} to {} bytes",
                old_cap,
                self.buffer.capacity()
            );
        }
        self.buffer.extend_from_slice(data);
    }

    /// Get reference to current data
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.position..]
    }

    /// Consume bytes from the front of buffer.
    ///
    /// Returns `Err` if `count` exceeds the available data.
    pub fn advance(&mut self, count: usize) -> AmiResult<()> {
        let available = self.len();
        if count > available {
            return Err(AmiError::protocol_error(format!(
                "cannot advance {} bytes, only {} available",
                count, available
            )));
        }
        self.position += count;
        Ok(())
    }

    /// Find position of pattern in buffer, starting from current position
    pub fn find_pattern(&self, pattern: &[u8]) -> Option<usize> {
        let data = self.data();
        if pattern.is_empty() || data.len() < pattern.len() {
            return None;
        }

        data.windows(pattern.len())
            .position(|window| window == pattern)
    }

    /// Extract data up to (but not including) the pattern
    pub fn extract_until_pattern(&mut self, pattern: &[u8]) -> Option<Vec<u8>> {
        let pos = self.find_pattern(pattern)?;
        let result = self.data()[..pos].to_vec();
        // pos + pattern.len() <= self.len() is guaranteed by find_pattern
        let _ = self.advance(pos + pattern.len());
        Some(result)
    }

    /// Extract one frame, terminated by CRLFCRLF or LFLF, whichever comes first.
    pub fn extract_frame(&mut self) -> Option<Vec<u8>> {
        let crlf = self.find_pattern(FRAME_TERMINATOR);
        let lf = self.find_pattern(LF_FRAME_TERMINATOR);

        let pattern = match (crlf, lf) {
            (Some(c), Some(l)) if l < c => LF_FRAME_TERMINATOR,
            (Some(_), _) => FRAME_TERMINATOR,
            (None, Some(_)) => LF_FRAME_TERMINATOR,
            (None, None) => return None,
        };
        self.extract_until_pattern(pattern)
    }

    /// Compact buffer by removing consumed data
    pub fn compact(&mut self) {
        if self.position > 0 {
            let remaining_len = self.len();
            if remaining_len > 0 {
                self.buffer.copy_within(self.position.., 0);
            }
            self.buffer.truncate(remaining_len);
            self.position = 0;
        }
    }

    /// Drop everything, including partial frames
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.position = 0;
    }

    /// Check if buffer size exceeds reasonable limits
    pub fn check_size_limits(&self) -> AmiResult<()> {
        if self.len() > MAX_BUFFER_SIZE {
            tracing::error!(
                "Buffer overflow: {} bytes accumulated without a frame delimiter (limit {})",
                self.len(),
                MAX_BUFFER_SIZE
            );
            return Err(AmiError::BufferOverflow {
                size: self.len(),
                limit: MAX_BUFFER_SIZE,
            });
        }
        Ok(())
    }
}

impl Default for AmiBuffer {
    fn default() -> Self {
        Self::new()
    }
}

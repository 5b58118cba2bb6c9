//! Brace-balanced frame extraction over an arbitrarily chunked byte stream.
//!
//! Devices stream JSON objects back to back with no delimiter guarantees, so a
//! frame is whatever `{ ... }` span closes back to depth zero. Anything before
//! an opening brace is line noise and gets skipped.

/// Absolute cap on buffered, not-yet-framed text
pub const DEFAULT_BUFFER_CAP: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Frame buffer overflow: discarded {discarded} bytes (cap {cap})")]
    BufferOverflow { discarded: usize, cap: usize },
}

/// Per-connection reassembly buffer
#[derive(Debug)]
pub struct FrameExtractor {
    buffer: String,
    /// Start of a multi-byte character whose remaining bytes have not arrived
    partial: Vec<u8>,
    cap: usize,
    overflows: u64,
}

impl FrameExtractor {
    pub fn new() -> Self {
        Self::with_cap(DEFAULT_BUFFER_CAP)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            buffer: String::new(),
            partial: Vec::new(),
            cap,
            overflows: 0,
        }
    }

    /// Append raw bytes, decoding them as (lossy) UTF-8.
    ///
    /// A character split across pushes is decoded once its last byte arrives.
    /// Exceeding the cap drops the whole buffer, including any partial frame.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        let mut raw = std::mem::take(&mut self.partial);
        raw.extend_from_slice(bytes);
        let split = raw.len() - incomplete_tail(&raw);
        self.partial = raw.split_off(split);
        self.push_str(&String::from_utf8_lossy(&raw))
    }

    pub fn push_str(&mut self, text: &str) -> Result<(), FrameError> {
        self.buffer.push_str(text);
        if self.buffer.len() > self.cap {
            let discarded = self.buffer.len() + self.partial.len();
            self.buffer.clear();
            self.partial.clear();
            self.overflows += 1;
            return Err(FrameError::BufferOverflow { discarded, cap: self.cap });
        }
        Ok(())
    }

    /// Append bytes and return the lazy sequence of frames completed so far
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Frames<'_>, FrameError> {
        self.push(bytes)?;
        Ok(self.frames())
    }

    pub fn frames(&mut self) -> Frames<'_> {
        Frames { extractor: self }
    }

    /// Remove and return the next complete frame, if the buffer holds one
    pub fn next_frame(&mut self) -> Option<String> {
        loop {
            self.trim_leading_whitespace();
            if self.buffer.is_empty() {
                return None;
            }

            if !self.buffer.starts_with('{') {
                match self.buffer.find('{') {
                    Some(start) => {
                        log::trace!("Skipping {} bytes of noise before frame", start);
                        self.buffer.drain(..start);
                        continue;
                    }
                    None => {
                        log::trace!("Skipping {} bytes of noise", self.buffer.len());
                        self.buffer.clear();
                        return None;
                    }
                }
            }

            let end = self.complete_frame_end()?;
            let frame: String = self.buffer.drain(..=end).collect();
            self.trim_leading_whitespace();
            return Some(frame);
        }
    }

    /// Bytes currently held awaiting completion
    pub fn pending_len(&self) -> usize {
        self.buffer.len() + self.partial.len()
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflows
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.partial.clear();
    }

    // Braces are ASCII, so scanning bytes never lands inside a multi-byte char.
    fn complete_frame_end(&self) -> Option<usize> {
        let mut depth = 0usize;
        for (idx, byte) in self.buffer.bytes().enumerate() {
            match byte {
                b'{' => depth += 1,
                b'}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Some(idx);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn trim_leading_whitespace(&mut self) {
        let trimmed = self.buffer.len() - self.buffer.trim_start().len();
        if trimmed > 0 {
            self.buffer.drain(..trimmed);
        }
    }
}

/// Length of a truncated UTF-8 sequence at the end of `bytes`, 0 if none
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

impl Default for FrameExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazy iterator over complete frames; each item is removed from the buffer as it is yielded
pub struct Frames<'a> {
    extractor: &'a mut FrameExtractor,
}

impl Iterator for Frames<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.extractor.next_frame()
    }
}

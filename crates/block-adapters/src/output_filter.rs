//! Filters hardware-driver noise out of a stage's combined output.
//!
//! The video pipeline on the recording rigs logs allocator and codec chatter
//! on every clip. Those lines are dropped unless the caller asked to see them;
//! everything else is forwarded byte for byte and flushed immediately.

use std::io::{self, Write};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Line prefixes emitted by the GPU / codec drivers.
pub const NOISE_PREFIXES: [&[u8]; 5] = [b"TVMR", b"NvMM", b"--->", b"Allocating", b"OPENMAX"];

/// Counts of what a [`OutputFilter::forward`] pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub forwarded: u64,
    pub suppressed: u64,
}

/// Classifies output lines as forwarded or suppressed.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputFilter {
    show_gpu: bool,
}

impl OutputFilter {
    /// Creates a filter. With `show_gpu` set, nothing is suppressed.
    pub fn new(show_gpu: bool) -> Self {
        Self { show_gpu }
    }

    /// Returns true if `line` starts with a driver noise prefix.
    pub fn is_noise(line: &[u8]) -> bool {
        NOISE_PREFIXES.iter().any(|prefix| line.starts_with(prefix))
    }

    /// Returns true if `line` should reach the terminal.
    pub fn should_forward(&self, line: &[u8]) -> bool {
        self.show_gpu || !Self::is_noise(line)
    }

    /// Copies `reader` to `writer` line by line until end-of-stream.
    ///
    /// Holds at most one line in memory. A final line without a trailing
    /// newline is still classified and forwarded as is.
    pub async fn forward<R, W>(&self, reader: &mut R, writer: &mut W) -> io::Result<FilterStats>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut stats = FilterStats::default();
        let mut line = Vec::new();

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            if self.should_forward(&line) {
                writer.write_all(&line)?;
                writer.flush()?;
                stats.forwarded += 1;
            } else {
                stats.suppressed += 1;
            }
        }

        Ok(stats)
    }
}

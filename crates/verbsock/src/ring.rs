//! Fixed-capacity circular byte store.
//!
//! Each channel owns two of these: one staging outbound bytes until the
//! transport confirms the send, one holding inbound bytes until the reader
//! consumes them. Cursors grow monotonically and are reduced modulo the
//! capacity only for indexing, so `write_cursor - read_cursor` is always the
//! number of occupied bytes.

use crate::error::{ChannelError, Result};

/// Default ring size per direction (1 MiB).
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// Circular byte buffer with independent produce and consume cursors.
pub struct RingBuffer {
    data: Box<[u8]>,
    write_cursor: u64,
    read_cursor: u64,
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("write_cursor", &self.write_cursor)
            .field("read_cursor", &self.read_cursor)
            .finish()
    }
}

impl RingBuffer {
    /// Allocates a zeroed ring of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ChannelError::InvalidConfig {
                reason: "ring buffer capacity must be non-zero".to_string(),
            });
        }
        Ok(Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            write_cursor: 0,
            read_cursor: 0,
        })
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written but not yet consumed.
    pub fn occupied(&self) -> usize {
        (self.write_cursor - self.read_cursor) as usize
    }

    /// Bytes that can be written without overrunning unconsumed data.
    pub fn free(&self) -> usize {
        self.capacity() - self.occupied()
    }

    /// Whether no byte is buffered.
    pub fn is_empty(&self) -> bool {
        self.write_cursor == self.read_cursor
    }

    /// Whether no byte can be written.
    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    /// Position of the next byte to be produced.
    pub fn write_cursor(&self) -> u64 {
        self.write_cursor
    }

    /// Position of the next byte to be consumed.
    pub fn read_cursor(&self) -> u64 {
        self.read_cursor
    }

    fn index(&self, cursor: u64) -> usize {
        (cursor % self.capacity() as u64) as usize
    }

    /// Contiguous free region starting at the write cursor. Its length stops at
    /// the physical end of the buffer even if more space is free after wrapping.
    pub fn writable_window(&mut self) -> &mut [u8] {
        let start = self.index(self.write_cursor);
        let len = self.free().min(self.capacity() - start);
        &mut self.data[start..start + len]
    }

    /// Contiguous readable region starting at the read cursor.
    pub fn readable_window(&self) -> &[u8] {
        self.window(self.read_cursor, self.occupied())
    }

    /// Contiguous occupied bytes starting at `cursor`, at most `len` long.
    ///
    /// Returns an empty slice if `cursor` lies outside the occupied range.
    pub fn window(&self, cursor: u64, len: usize) -> &[u8] {
        if cursor < self.read_cursor || cursor > self.write_cursor {
            return &[];
        }
        let start = self.index(cursor);
        let available = (self.write_cursor - cursor) as usize;
        let len = len.min(available).min(self.capacity() - start);
        &self.data[start..start + len]
    }

    /// Copies as much of `src` as fits, wrapping at the physical boundary.
    /// Never blocks; returns 0 when the buffer is full.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let mut written = 0;
        while written < src.len() {
            let window = self.writable_window();
            if window.is_empty() {
                break;
            }
            let n = window.len().min(src.len() - written);
            window[..n].copy_from_slice(&src[written..written + n]);
            self.write_cursor += n as u64;
            written += n;
        }
        written
    }

    /// Copies up to `dst.len()` occupied bytes out, wrapping at the physical
    /// boundary. Returns 0 when the buffer is empty.
    pub fn read_into(&mut self, dst: &mut [u8]) -> usize {
        let mut read = 0;
        while read < dst.len() {
            let window = self.readable_window();
            if window.is_empty() {
                break;
            }
            let n = window.len().min(dst.len() - read);
            dst[read..read + n].copy_from_slice(&window[..n]);
            self.read_cursor += n as u64;
            read += n;
        }
        read
    }

    /// Marks `n` bytes as produced by someone who filled the writable window
    /// directly.
    pub fn advance_write(&mut self, n: usize) -> Result<()> {
        if n > self.free() {
            return Err(ChannelError::RingOverrun {
                requested: n,
                available: self.free(),
            });
        }
        self.write_cursor += n as u64;
        Ok(())
    }

    /// Marks `n` bytes as consumed without copying them out.
    pub fn advance_read(&mut self, n: usize) -> Result<()> {
        if n > self.occupied() {
            return Err(ChannelError::RingOverrun {
                requested: n,
                available: self.occupied(),
            });
        }
        self.read_cursor += n as u64;
        Ok(())
    }
}

//! Growable byte buffer with read/write cursors.
//!
//! ```text
//! ┌───────────────┬──────────────────┬──────────────────┐
//! │  prependable  │     readable     │     writable     │
//! └───────────────┴──────────────────┴──────────────────┘
//! 0           read_pos           write_pos          capacity
//! ```
//!
//! # Invariants
//!
//! - `0 <= read_pos <= write_pos <= capacity`
//! - The buffer never shrinks. Space is made either by compacting unread bytes
//!   back to the prepend offset or by growing the storage, whichever avoids a
//!   reallocation.

use std::io::{self, IoSliceMut, Read};

use bytes::{Buf, Bytes};

/// Bytes reserved in front of the readable region.
pub const CHEAP_PREPEND: usize = 8;

/// Default writable capacity of a new buffer.
pub const INITIAL_SIZE: usize = 1024;

/// Size of the on-stack spill region used by [`Buffer::read_from`].
pub const EXTRA_READ_SIZE: usize = 64 * 1024;

/// Byte container with independent read and write cursors.
#[derive(Debug, Clone)]
pub struct Buffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    /// Create a buffer with [`INITIAL_SIZE`] writable bytes.
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    /// Create a buffer with `initial_size` writable bytes.
    pub fn with_capacity(initial_size: usize) -> Self {
        Self {
            storage: vec![0; CHEAP_PREPEND + initial_size],
            read_pos: CHEAP_PREPEND,
            write_pos: CHEAP_PREPEND,
        }
    }

    /// Number of unread bytes.
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Number of bytes that can be appended without making space.
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_pos
    }

    /// Number of bytes in front of the readable region.
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// Total size of the underlying storage.
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// Consume `len` readable bytes.
    ///
    /// Consuming everything resets both cursors to the prepend offset.
    /// Requests beyond the readable region are clamped.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.read_pos += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consume all readable bytes.
    pub fn retrieve_all(&mut self) {
        self.read_pos = CHEAP_PREPEND;
        self.write_pos = CHEAP_PREPEND;
    }

    /// Consume `len` readable bytes and return them as an owned buffer.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Bytes {
        let len = len.min(self.readable_bytes());
        let bytes = Bytes::copy_from_slice(&self.peek()[..len]);
        self.retrieve(len);
        bytes
    }

    /// Make sure at least `len` bytes are writable.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Append `data` after the readable region.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Append `value` in network byte order.
    pub fn append_i32(&mut self, value: i32) {
        self.append(&value.to_be_bytes());
    }

    /// Read a network-order `i32` without consuming it. `None` if fewer than
    /// four bytes are readable.
    pub fn peek_i32(&self) -> Option<i32> {
        let bytes: [u8; 4] = self.peek().get(..4)?.try_into().ok()?;
        Some(i32::from_be_bytes(bytes))
    }

    /// Read and consume a network-order `i32`. `None` if fewer than four
    /// bytes are readable.
    pub fn read_i32(&mut self) -> Option<i32> {
        let value = self.peek_i32()?;
        self.retrieve(4);
        Some(value)
    }

    /// Perform one read from `reader` into the buffer.
    ///
    /// Uses a vectored read whose second slice is a 64 KiB stack region, so a
    /// small buffer can absorb a large burst without pre-allocating for it.
    /// Bytes that land in the spill region are appended afterwards.
    ///
    /// Returns the number of bytes read; `Ok(0)` means the peer closed the
    /// stream. Errors (including `WouldBlock`) are returned untouched for the
    /// caller to classify.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_READ_SIZE];
        let writable = self.writable_bytes();

        let n = {
            let primary = &mut self.storage[self.write_pos..];
            if writable < extra.len() {
                let mut slices = [IoSliceMut::new(primary), IoSliceMut::new(&mut extra)];
                reader.read_vectored(&mut slices)?
            } else {
                reader.read(primary)?
            }
        };

        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.storage.len();
            self.append(&extra[..n - writable]);
        }

        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.storage.resize(self.write_pos + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.storage.copy_within(self.read_pos..self.write_pos, CHEAP_PREPEND);
            self.read_pos = CHEAP_PREPEND;
            self.write_pos = CHEAP_PREPEND + readable;
        }
    }
}

impl Buf for Buffer {
    fn remaining(&self) -> usize {
        self.readable_bytes()
    }

    fn chunk(&self) -> &[u8] {
        self.peek()
    }

    fn advance(&mut self, cnt: usize) {
        self.retrieve(cnt.min(self.readable_bytes()));
    }
}

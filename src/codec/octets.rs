//! `Octets`: an owned, growable byte buffer with a read cursor.
//!
//! Writes always append. Reads consume from `pos` forward and never see
//! past the buffer's current length (`limit` is simply `buf.len()`).
//! Built on `bytes::BytesMut` so growth reuses the same amortized-doubling
//! allocator the teacher already depends on for the wire layer.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

/// A growable byte buffer with a cursor-based reader half.
#[derive(Debug, Clone, Default)]
pub struct Octets {
    buf: BytesMut,
    pos: usize,
}

impl Octets {
    /// An empty buffer.
    pub fn new() -> Self {
        Self { buf: BytesMut::new(), pos: 0 }
    }

    /// An empty buffer pre-sized to avoid reallocation.
    pub fn with_capacity(cap: usize) -> Self {
        Self { buf: BytesMut::with_capacity(cap), pos: 0 }
    }

    /// Wrap existing bytes for reading; `pos` starts at zero.
    pub fn from_vec(v: Vec<u8>) -> Self {
        Self { buf: BytesMut::from(&v[..]), pos: 0 }
    }

    /// Current read cursor.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Move the read cursor. Does not truncate or extend the buffer.
    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// The logical end of readable data (always `self.buf.len()`).
    pub fn limit(&self) -> usize {
        self.buf.len()
    }

    /// Bytes still unread between `pos` and `limit`.
    pub fn remaining(&self) -> usize {
        self.limit().saturating_sub(self.pos)
    }

    /// Whole written contents, ignoring the read cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Unread contents from `pos` to `limit`.
    pub fn remaining_slice(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Consume `self` and hand back the underlying bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    // -- writers --------------------------------------------------------

    pub fn put_u8(&mut self, b: u8) {
        self.buf.put_u8(b);
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    // -- readers ----------------------------------------------------------

    /// Read a single byte, advancing `pos`.
    pub fn get_u8(&mut self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(Error::MarshalUnderflow);
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    /// Peek the next byte without advancing `pos`.
    pub fn peek_u8(&self) -> Result<u8> {
        if self.remaining() < 1 {
            return Err(Error::MarshalUnderflow);
        }
        Ok(self.buf[self.pos])
    }

    /// Read exactly `n` bytes, advancing `pos`.
    pub fn get_bytes(&mut self, n: usize) -> Result<&[u8]> {
        if self.remaining() < n {
            return Err(Error::MarshalUnderflow);
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..self.pos])
    }

    /// Skip `n` unread bytes without copying them.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(Error::MarshalUnderflow);
        }
        self.pos += n;
        Ok(())
    }

    pub fn get_u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.get_bytes(4)?.try_into().unwrap()))
    }

    pub fn get_u64_le(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.get_bytes(8)?.try_into().unwrap()))
    }
}

// `bytes::Buf`/`BufMut` give us a couple of conveniences for free; used by
// the fixed-width float encoder in `record.rs`.
impl Octets {
    pub fn put_f32_le(&mut self, v: f32) {
        self.buf.put_f32_le(v);
    }

    pub fn put_f64_le(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    pub fn get_f32_le(&mut self) -> Result<f32> {
        if self.remaining() < 4 {
            return Err(Error::MarshalUnderflow);
        }
        let mut tmp = &self.buf[self.pos..self.pos + 4];
        self.pos += 4;
        Ok(tmp.get_f32_le())
    }

    pub fn get_f64_le(&mut self) -> Result<f64> {
        if self.remaining() < 8 {
            return Err(Error::MarshalUnderflow);
        }
        let mut tmp = &self.buf[self.pos..self.pos + 8];
        self.pos += 8;
        Ok(tmp.get_f64_le())
    }
}

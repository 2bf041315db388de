//! Byte buffers for encoded requests and replies.
//!
//! The write side is append-only with rollback to a recorded mark, which is
//! what the batch queue needs to undo a half-encoded request. The read side
//! is a cursor over borrowed reply bytes; every underrun or encoding fault
//! surfaces as [InvokeError::Marshal].
//!
//! Strings are u32-LE length-prefixed UTF-8, sequences are u32-LE counted.

use crate::error::InvokeError;

/// Append-only buffer holding one encoded outgoing request.
#[derive(Debug, Default)]
pub struct RequestBuffer {
    data: Vec<u8>,
}

impl RequestBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { data: Vec::with_capacity(cap) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Record the current length; a later [rollback](Self::rollback) with
    /// this value discards everything appended since.
    #[inline]
    pub fn mark(&self) -> usize {
        self.data.len()
    }

    pub fn rollback(&mut self, mark: usize) {
        self.data.truncate(mark);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.data.extend_from_slice(b);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.data.extend_from_slice(s.as_bytes());
    }

    pub fn write_string_seq(&mut self, items: &[&str]) {
        self.write_u32(items.len() as u32);
        for s in items {
            self.write_string(s);
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Read cursor over the raw bytes of one reply.
pub struct ReplyReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ReplyReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Everything after the cursor.
    #[inline]
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], InvokeError> {
        if self.data.len() - self.pos < n {
            return Err(InvokeError::Marshal(format!(
                "reply truncated: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.data.len() - self.pos
            )));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, InvokeError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, InvokeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_string(&mut self) -> Result<String, InvokeError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| InvokeError::Marshal("string is not valid UTF-8".into()))
    }

    pub fn read_string_seq(&mut self) -> Result<Vec<String>, InvokeError> {
        let count = self.read_u32()? as usize;
        let mut out = Vec::with_capacity(count.min(16));
        for _ in 0..count {
            out.push(self.read_string()?);
        }
        Ok(out)
    }
}

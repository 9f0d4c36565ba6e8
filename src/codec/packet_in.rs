//! Packet reader.

use bytes::Buf;
use std::borrow::Cow;

use super::CodecError;

/// Sequential reader over a received packet.
///
/// Multi-byte reads default to network (big-endian) order; the `_low`
/// variants read little-endian. Every read checks bounds and fails with
/// [`CodecError::UnexpectedEof`] without advancing.
#[derive(Debug, Clone)]
pub struct PacketIn<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketIn<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// The unread tail of the packet.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(CodecError::UnexpectedEof { needed: n, remaining });
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), CodecError> {
        self.take(n).map(|_| ())
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        Ok(self.take(2)?.get_u16())
    }

    pub fn read_u16_low(&mut self) -> Result<u16, CodecError> {
        Ok(self.take(2)?.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        Ok(self.take(4)?.get_u32())
    }

    pub fn read_u32_low(&mut self) -> Result<u32, CodecError> {
        Ok(self.take(4)?.get_u32_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        Ok(self.take(8)?.get_u64())
    }

    pub fn read_u64_low(&mut self) -> Result<u64, CodecError> {
        Ok(self.take(8)?.get_u64_le())
    }

    pub fn read_f32_low(&mut self) -> Result<f32, CodecError> {
        Ok(self.take(4)?.get_f32_le())
    }

    /// String with a one-byte length prefix.
    pub fn read_pascal_string(&mut self) -> Result<Cow<'a, str>, CodecError> {
        let len = usize::from(self.read_u8()?);
        self.read_prefixed(1, len)
    }

    /// String with a little-endian two-byte length prefix.
    pub fn read_pascal_string_low16(&mut self) -> Result<Cow<'a, str>, CodecError> {
        let len = usize::from(self.read_u16_low()?);
        self.read_prefixed(2, len)
    }

    // Rewinds over the prefix if the body is short, so a failed read never advances.
    fn read_prefixed(&mut self, prefix: usize, len: usize) -> Result<Cow<'a, str>, CodecError> {
        match self.take(len) {
            Ok(bytes) => Ok(String::from_utf8_lossy(bytes)),
            Err(e) => {
                self.pos -= prefix;
                Err(e)
            }
        }
    }

    /// String in a fixed field of `max` bytes, ending at the first NUL.
    ///
    /// Always consumes the whole field. Invalid UTF-8 is replaced, not rejected.
    pub fn read_string(&mut self, max: usize) -> Result<Cow<'a, str>, CodecError> {
        let field = self.take(max)?;
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        Ok(String::from_utf8_lossy(&field[..end]))
    }
}

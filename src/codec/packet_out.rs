//! Packet writer.

use bytes::{BufMut, Bytes, BytesMut};

use super::CodecError;

/// Position of a reserved length prefix, returned by
/// [`PacketOut::reserve_length_u16`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a reserved length prefix stays zero until finished"]
pub struct LengthMarker {
    offset: usize,
}

/// Growable packet builder over [`BytesMut`].
#[derive(Debug, Default, Clone)]
pub struct PacketOut {
    buf: BytesMut,
}

impl PacketOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.write_u8(u8::from(v))
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn write_u16_low(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn write_u32_low(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64(v);
        self
    }

    pub fn write_u64_low(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn write_f32_low(&mut self, v: f32) -> &mut Self {
        self.buf.put_f32_le(v);
        self
    }

    /// One-byte length prefix followed by the bytes of `s`, cut at 255 bytes.
    pub fn write_pascal_string(&mut self, s: &str) -> &mut Self {
        let bytes = &s.as_bytes()[..s.len().min(usize::from(u8::MAX))];
        self.buf.put_u8(bytes.len() as u8);
        self.buf.put_slice(bytes);
        self
    }

    /// Little-endian two-byte length prefix followed by `s`, cut at 65535 bytes.
    pub fn write_pascal_string_low16(&mut self, s: &str) -> &mut Self {
        let bytes = &s.as_bytes()[..s.len().min(usize::from(u16::MAX))];
        self.buf.put_u16_le(bytes.len() as u16);
        self.buf.put_slice(bytes);
        self
    }

    /// `s` in a fixed field of `max` bytes, zero-padded.
    ///
    /// At most `max - 1` bytes of `s` are written, so the field always ends
    /// with a NUL. A zero-width field writes nothing.
    pub fn write_string(&mut self, s: &str, max: usize) -> &mut Self {
        if max == 0 {
            return self;
        }
        let len = s.len().min(max - 1);
        self.buf.put_slice(&s.as_bytes()[..len]);
        self.buf.put_bytes(0, max - len);
        self
    }

    /// `count` copies of `value`.
    pub fn fill(&mut self, value: u8, count: usize) -> &mut Self {
        self.buf.put_bytes(value, count);
        self
    }

    /// Write a two-byte placeholder to be patched by [`finish_length_u16`](Self::finish_length_u16).
    pub fn reserve_length_u16(&mut self) -> LengthMarker {
        let offset = self.buf.len();
        self.buf.put_u16(0);
        LengthMarker { offset }
    }

    /// Patch `marker` with the number of bytes written after it, big-endian.
    pub fn finish_length_u16(&mut self, marker: LengthMarker) -> Result<(), CodecError> {
        let start = marker.offset + 2;
        if start > self.buf.len() {
            return Err(CodecError::InvalidMarker { offset: marker.offset });
        }
        let len = self.buf.len() - start;
        let prefix = u16::try_from(len).map_err(|_| CodecError::LengthOverflow { len, width: 2 })?;
        self.buf[marker.offset..start].copy_from_slice(&prefix.to_be_bytes());
        Ok(())
    }

    /// Finish the packet.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

//! Field-level helpers shared by the message and auth codecs.
//!
//! Strings and blobs are `u32 LE` length-prefixed; optional strings carry a
//! presence byte first.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

pub(crate) fn put_bytes(dst: &mut BytesMut, value: &[u8]) {
    dst.put_u32_le(value.len() as u32);
    dst.put_slice(value);
}

pub(crate) fn put_str(dst: &mut BytesMut, value: &str) {
    put_bytes(dst, value.as_bytes());
}

pub(crate) fn put_opt_str(dst: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(value) => {
            dst.put_u8(1);
            put_str(dst, value);
        }
        None => dst.put_u8(0),
    }
}

/// Cursor over a message body that turns every short read into `MalformedMessage`.
pub(crate) struct FieldReader {
    buf: Bytes,
}

impl FieldReader {
    pub(crate) fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub(crate) fn u8(&mut self, field: &str) -> Result<u8> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u64(&mut self, field: &str) -> Result<u64> {
        self.need(8, field)?;
        Ok(self.buf.get_u64_le())
    }

    pub(crate) fn bytes(&mut self, field: &str) -> Result<Bytes> {
        self.need(4, field)?;
        let len = self.buf.get_u32_le() as usize;
        self.need(len, field)?;
        Ok(self.buf.split_to(len))
    }

    pub(crate) fn string(&mut self, field: &str) -> Result<String> {
        let raw = self.bytes(field)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| FrameError::malformed(format!("{field} is not valid UTF-8")))
    }

    pub(crate) fn opt_string(&mut self, field: &str) -> Result<Option<String>> {
        match self.u8(field)? {
            0 => Ok(None),
            1 => self.string(field).map(Some),
            other => Err(FrameError::malformed(format!(
                "{field} has invalid presence flag {other}"
            ))),
        }
    }

    /// Everything left in the body.
    pub(crate) fn rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.len())
    }

    /// Fails if any bytes were left unread.
    pub(crate) fn finish(self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(FrameError::malformed(format!(
                "{} trailing bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn need(&self, len: usize, field: &str) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(FrameError::malformed(format!("truncated {field}")));
        }
        Ok(())
    }
}

//! Fixed-width field encoding and decoding.
//!
//! All multi-byte integers are big-endian. String fields occupy a fixed
//! width and are NUL-padded; decoding reads up to the first NUL. A non-zero
//! status byte in a response header short-circuits body parsing entirely and
//! carries the remote error code.

use crate::errdata;
use crate::error::{Error, Result};

use super::{Command, HEADER_SIZE};

/// The fixed packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub body_len: u64,
    pub command: u8,
    pub status: u8,
}

impl Header {
    /// A request header for the given command and body length.
    pub fn request(command: Command, body_len: usize) -> Self {
        Self { body_len: body_len as u64, command: command as u8, status: 0 }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.body_len.to_be_bytes());
        buf[8] = self.command;
        buf[9] = self.status;
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_SIZE {
            return errdata!("header must be {HEADER_SIZE} bytes, got {}", bytes.len());
        }
        let body_len = i64::from_be_bytes(bytes[0..8].try_into().expect("sliced 8 bytes"));
        if body_len < 0 {
            return errdata!("negative body length {body_len}");
        }
        Ok(Self { body_len: body_len as u64, command: bytes[8], status: bytes[9] })
    }
}

/// Appends a big-endian u32.
pub fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Appends a big-endian i64.
pub fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Appends a NUL-padded string field of the given width. The string must fit
/// with at least one byte left for the NUL terminator.
pub fn put_str(buf: &mut Vec<u8>, value: &str, width: usize) -> Result<()> {
    if value.len() >= width {
        return errdata!("string {value:?} does not fit in {width}-byte field");
    }
    buf.extend_from_slice(value.as_bytes());
    buf.extend(std::iter::repeat(0).take(width - value.len()));
    Ok(())
}

/// A sequential reader over a fixed-layout body.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return errdata!("body truncated: need {len} bytes, have {}", self.remaining());
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("took 4 bytes")))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().expect("took 8 bytes")))
    }

    /// Reads a fixed-width NUL-padded string field.
    pub fn str(&mut self, width: usize) -> Result<String> {
        let field = self.take(width)?;
        let end = field.iter().position(|&b| b == 0).unwrap_or(width);
        String::from_utf8(field[..end].to_vec())
            .map_err(|e| Error::InvalidData(format!("string field is not utf-8: {e}")))
    }

    /// Asserts that the body has been fully consumed.
    pub fn done(&self) -> Result<()> {
        if self.remaining() != 0 {
            return errdata!("{} trailing bytes in body", self.remaining());
        }
        Ok(())
    }
}

/// Validates an observed body length against the single valid size for a
/// command.
pub fn expect_len(actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return errdata!("body length {actual} does not match expected {expected}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = Header::request(Command::Beat, 104);
        let decoded = Header::decode(&header.encode()).unwrap();
        assert_eq!(header, decoded);
        assert_eq!(decoded.body_len, 104);
        assert_eq!(decoded.command, 83);
        assert_eq!(decoded.status, 0);
    }

    #[test]
    fn header_rejects_short_buffer() {
        assert!(Header::decode(&[0; 9]).is_err());
        assert!(Header::decode(&[0; 11]).is_err());
    }

    #[test]
    fn header_rejects_negative_length() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&(-1i64).to_be_bytes());
        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn str_field_padding() {
        let mut buf = Vec::new();
        put_str(&mut buf, "storage01", 16).unwrap();
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..9], b"storage01");
        assert!(buf[9..].iter().all(|&b| b == 0));

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.str(16).unwrap(), "storage01");
        reader.done().unwrap();
    }

    #[test]
    fn str_field_too_long() {
        let mut buf = Vec::new();
        // 16 chars needs a 17-byte field: one byte must remain for the NUL.
        assert!(put_str(&mut buf, "0123456789abcdef", 16).is_err());
    }

    #[test]
    fn reader_truncation() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 7);
        let mut reader = Reader::new(&buf);
        assert_eq!(reader.u32().unwrap(), 7);
        assert!(reader.i64().is_err());
    }
}

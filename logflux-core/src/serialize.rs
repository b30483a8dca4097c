//! Byte archive primitives for the versioned message codec.
//!
//! Everything on the wire is big-endian; strings are length-prefixed and
//! carried without a terminator.

use crate::error::{CoreError, CoreResult};
use std::io::{Read, Write};

/// Upper bound for a single length-prefixed string, matching the record
/// sanity limit of the disk queue.
const MAX_STRING_LEN: u32 = 100 * 1024 * 1024;

pub struct ArchiveWriter<W: Write> {
    inner: W,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        ArchiveWriter { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_u8(&mut self, value: u8) -> CoreResult<()> {
        self.inner.write_all(&[value])?;
        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> CoreResult<()> {
        self.inner.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> CoreResult<()> {
        self.inner.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> CoreResult<()> {
        self.inner.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    pub fn write_blob(&mut self, data: &[u8]) -> CoreResult<()> {
        self.inner.write_all(data)?;
        Ok(())
    }

    /// Length-prefixed byte string.
    pub fn write_cstring(&mut self, data: &[u8]) -> CoreResult<()> {
        self.write_u32(data.len() as u32)?;
        self.inner.write_all(data)?;
        Ok(())
    }
}

pub struct ArchiveReader<R: Read> {
    inner: R,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(inner: R) -> Self {
        ArchiveReader { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn read_u8(&mut self) -> CoreResult<u8> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&mut self) -> CoreResult<u16> {
        let mut buf = [0u8; 2];
        self.inner.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub fn read_u32(&mut self) -> CoreResult<u32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn read_u64(&mut self) -> CoreResult<u64> {
        let mut buf = [0u8; 8];
        self.inner.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    pub fn read_blob(&mut self, out: &mut [u8]) -> CoreResult<()> {
        self.inner.read_exact(out)?;
        Ok(())
    }

    pub fn read_cstring(&mut self) -> CoreResult<Vec<u8>> {
        let len = self.read_u32()?;
        if len > MAX_STRING_LEN {
            return Err(CoreError::Malformed("implausible string length"));
        }
        let mut data = vec![0u8; len as usize];
        self.inner.read_exact(&mut data)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn primitives_roundtrip_big_endian() {
        let mut writer = ArchiveWriter::new(Vec::new());
        writer.write_u8(0x17).unwrap();
        writer.write_u16(0xBEEF).unwrap();
        writer.write_u32(0xDEADBEEF).unwrap();
        writer.write_u64(0x0123_4567_89AB_CDEF).unwrap();
        writer.write_cstring(b"payload").unwrap();
        let bytes = writer.into_inner();

        assert_eq!(&bytes[1..3], &[0xBE, 0xEF]);

        let mut reader = ArchiveReader::new(Cursor::new(bytes));
        assert_eq!(reader.read_u8().unwrap(), 0x17);
        assert_eq!(reader.read_u16().unwrap(), 0xBEEF);
        assert_eq!(reader.read_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(reader.read_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(reader.read_cstring().unwrap(), b"payload");
    }

    #[test]
    fn oversized_string_is_rejected() {
        let mut writer = ArchiveWriter::new(Vec::new());
        writer.write_u32(MAX_STRING_LEN + 1).unwrap();
        let bytes = writer.into_inner();
        let mut reader = ArchiveReader::new(Cursor::new(bytes));
        assert!(reader.read_cstring().is_err());
    }
}

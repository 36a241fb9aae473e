//! A big-endian cursor over a byte slice.
//!
//! Everything inside a XEX container (and every PowerPC instruction word) is
//! stored big-endian. `BeReader` keeps a position into a borrowed slice and
//! decodes fixed-width integers at that position, failing with
//! `Error::Malformed` instead of panicking when the data runs out.

use crate::error::Error;
use crate::utils::ByteRegion;

use byteorder::{ByteOrder, BE};
use std::convert::TryFrom;

#[derive(Debug, Clone)]
pub struct BeReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BeReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Creates a reader positioned at `pos`.
    pub fn at(data: &'a [u8], pos: u32) -> Result<Self, Error> {
        let mut reader = Self::new(data);
        reader.seek(pos)?;
        Ok(reader)
    }

    pub fn position(&self) -> u32 {
        self.pos as u32
    }

    pub fn len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of bytes left after the current position.
    pub fn remaining(&self) -> u32 {
        (self.data.len() - self.pos) as u32
    }

    /// Moves the cursor to an absolute position.
    ///
    /// Seeking to exactly the end of the data is allowed.
    pub fn seek(&mut self, pos: u32) -> Result<(), Error> {
        if pos as usize > self.data.len() {
            return Err(Error::Malformed(format!(
                "seek to {:#X} past end of data ({:#X} bytes)",
                pos,
                self.data.len()
            )));
        }
        self.pos = pos as usize;
        Ok(())
    }

    pub fn skip(&mut self, bytes: u32) -> Result<(), Error> {
        let pos = self
            .position()
            .checked_add(bytes)
            .ok_or_else(|| Error::addr_overflow(self.position(), bytes))?;
        self.seek(pos)
    }

    /// Returns the next `len` bytes and advances past them.
    pub fn read_bytes(&mut self, len: u32) -> Result<&'a [u8], Error> {
        let start = self.position();
        let end = start
            .checked_add(len)
            .ok_or_else(|| Error::addr_overflow(start, len))?;
        let data: &'a [u8] = self.data;
        let bytes = data.region(start..end, "field")?;
        self.pos = end as usize;
        Ok(bytes)
    }

    /// Reads a fixed-size array, e.g. a digest or key.
    pub fn read_array16(&mut self) -> Result<[u8; 16], Error> {
        let bytes = self.read_bytes(16)?;
        // `read_bytes` returned exactly 16 bytes
        <[u8; 16]>::try_from(bytes).map_err(|_| Error::Malformed("short read".to_string()))
    }

    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, Error> {
        Ok(BE::read_u16(self.read_bytes(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, Error> {
        Ok(BE::read_u32(self.read_bytes(4)?))
    }

    /// Reads a `u32` without advancing the cursor.
    pub fn peek_u32(&self) -> Result<u32, Error> {
        let mut copy = self.clone();
        copy.read_u32()
    }

    /// Returns everything after the cursor without advancing it.
    pub fn rest(&self) -> &'a [u8] {
        let data: &'a [u8] = self.data;
        data.get(self.pos..).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_big_endian() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE];
        let mut r = BeReader::new(&data);
        assert_eq!(r.peek_u32().unwrap(), 0x12345678);
        assert_eq!(r.position(), 0);
        assert_eq!(r.read_u32().unwrap(), 0x12345678);
        assert_eq!(r.read_u16().unwrap(), 0x9ABC);
        assert_eq!(r.read_u8().unwrap(), 0xDE);
        assert_eq!(r.remaining(), 0);
        assert!(r.read_u8().is_err());
    }

    #[test]
    fn seek_and_skip() {
        let data = [0u8, 0, 0, 1, 0, 0, 0, 2];
        let mut r = BeReader::at(&data, 4).unwrap();
        assert_eq!(r.read_u32().unwrap(), 2);
        r.seek(0).unwrap();
        r.skip(2).unwrap();
        assert_eq!(r.read_u16().unwrap(), 1);
        assert_eq!(r.rest(), &[0, 0, 0, 2]);
        assert!(r.seek(9).is_err());
        assert!(r.skip(u32::MAX).is_err());
    }

    #[test]
    fn short_reads_fail_without_moving() {
        let data = [0xAAu8; 3];
        let mut r = BeReader::new(&data);
        assert!(r.read_u32().is_err());
        assert_eq!(r.position(), 0);
        assert!(r.read_array16().is_err());
        assert_eq!(r.read_bytes(3).unwrap().len(), 3);
    }
}

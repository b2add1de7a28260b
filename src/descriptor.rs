//! Byte builders and bounded readers shared by the Zip and ISO 9660 codecs.

use std::str;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{ArchiveError, Result};

/// Growable buffer used to assemble headers and records before they are
/// written to a sink in one call.
#[derive(Debug, Default)]
pub struct ArchiveDescriptor {
    buffer: Vec<u8>,
}

impl ArchiveDescriptor {
    pub fn new(capacity: usize) -> ArchiveDescriptor {
        ArchiveDescriptor {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, val: u8) {
        self.buffer.push(val);
    }

    pub fn write_u16(&mut self, val: u16) {
        self.buffer.extend_from_slice(&val.to_le_bytes());
    }

    pub fn write_u32(&mut self, val: u32) {
        self.buffer.extend_from_slice(&val.to_le_bytes());
    }

    pub fn write_i32(&mut self, val: i32) {
        self.buffer.extend_from_slice(&val.to_le_bytes());
    }

    pub fn write_u64(&mut self, val: u64) {
        self.buffer.extend_from_slice(&val.to_le_bytes());
    }

    pub fn write_u16_be(&mut self, val: u16) {
        self.buffer.extend_from_slice(&val.to_be_bytes());
    }

    pub fn write_u32_be(&mut self, val: u32) {
        self.buffer.extend_from_slice(&val.to_be_bytes());
    }

    /// Little endian value followed by the same value big endian.
    pub fn write_u16_both(&mut self, val: u16) {
        self.write_u16(val);
        self.write_u16_be(val);
    }

    /// Little endian value followed by the same value big endian.
    pub fn write_u32_both(&mut self, val: u32) {
        self.write_u32(val);
        self.write_u32_be(val);
    }

    pub fn write_str(&mut self, val: &str) {
        self.write_bytes(val.as_bytes());
    }

    pub fn write_bytes(&mut self, val: &[u8]) {
        self.buffer.extend_from_slice(val);
    }

    /// Writes `val` truncated or padded with `fill` to exactly `len` bytes.
    pub fn write_padded(&mut self, val: &[u8], len: usize, fill: u8) {
        let taken = val.len().min(len);
        self.buffer.extend_from_slice(&val[..taken]);
        self.buffer.resize(self.buffer.len() + len - taken, fill);
    }

    pub fn write_zeros(&mut self, len: usize) {
        self.buffer.resize(self.len() + len, 0);
    }

    /// Overwrites a previously written byte.
    pub fn patch_u8(&mut self, index: usize, val: u8) {
        if let Some(byte) = self.buffer.get_mut(index) {
            *byte = val;
        }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Cursor over a byte slice. Every read is bounds checked and a short slice
/// yields [`ArchiveError::BadArchiveStructure`] instead of panicking.
#[derive(Debug, Default)]
pub struct ArchiveDescriptorReader {
    index: usize,
}

macro_rules! read_type {
    ($self:expr, $stream:expr, $order:ty, $read:ident, $typ:ty) => {{
        let upper_bound = $self.index + ::std::mem::size_of::<$typ>();
        let slice = $self.slice($stream, upper_bound, stringify!($typ))?;
        let value = <$order>::$read(slice);
        $self.index = upper_bound;
        Ok(value)
    }};
}

impl ArchiveDescriptorReader {
    pub fn new() -> ArchiveDescriptorReader {
        ArchiveDescriptorReader { index: 0 }
    }

    pub fn at(index: usize) -> ArchiveDescriptorReader {
        ArchiveDescriptorReader { index }
    }

    pub fn get_index(&self) -> usize {
        self.index
    }

    pub fn skip(&mut self, len: usize) {
        self.index += len;
    }

    fn slice<'s>(&self, stream: &'s [u8], upper_bound: usize, what: &str) -> Result<&'s [u8]> {
        stream.get(self.index..upper_bound).ok_or_else(|| {
            ArchiveError::bad_structure(format!(
                "truncated record reading {what} at {} of {}",
                self.index,
                stream.len()
            ))
        })
    }

    pub fn read_u8(&mut self, stream: &[u8]) -> Result<u8> {
        let value = self.slice(stream, self.index + 1, "u8")?[0];
        self.index += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self, stream: &[u8]) -> Result<u16> {
        read_type!(self, stream, LittleEndian, read_u16, u16)
    }

    pub fn read_u32(&mut self, stream: &[u8]) -> Result<u32> {
        read_type!(self, stream, LittleEndian, read_u32, u32)
    }

    pub fn read_i32(&mut self, stream: &[u8]) -> Result<i32> {
        read_type!(self, stream, LittleEndian, read_i32, i32)
    }

    pub fn read_u64(&mut self, stream: &[u8]) -> Result<u64> {
        read_type!(self, stream, LittleEndian, read_u64, u64)
    }

    pub fn read_u16_be(&mut self, stream: &[u8]) -> Result<u16> {
        read_type!(self, stream, BigEndian, read_u16, u16)
    }

    pub fn read_u32_be(&mut self, stream: &[u8]) -> Result<u32> {
        read_type!(self, stream, BigEndian, read_u32, u32)
    }

    /// Reads a both-endian 16 bit field, keeping the little endian half.
    pub fn read_u16_both(&mut self, stream: &[u8]) -> Result<u16> {
        let value = self.read_u16(stream)?;
        self.skip(2);
        Ok(value)
    }

    /// Reads a both-endian 32 bit field, keeping the little endian half.
    pub fn read_u32_both(&mut self, stream: &[u8]) -> Result<u32> {
        let value = self.read_u32(stream)?;
        self.skip(4);
        Ok(value)
    }

    pub fn read_bytes<'s>(&mut self, stream: &'s [u8], len: usize) -> Result<&'s [u8]> {
        let upper_bound = self.index + len;
        let value = self.slice(stream, upper_bound, "bytes")?;
        self.index = upper_bound;
        Ok(value)
    }

    pub fn read_utf8_string(&mut self, stream: &[u8], string_len: usize) -> Result<String> {
        let bytes = self.read_bytes(stream, string_len)?;
        str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|e| ArchiveError::bad_structure(format!("invalid UTF-8 sequence: {e}")))
    }
}

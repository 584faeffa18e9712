//! Low-level byte order and safe reading utilities for the wire format.
//!
//! This module provides the [`WireValue`] trait for endian-aware encoding of
//! the primitive types the history format is built from, plus the cursor
//! types [`WireReader`] and [`WireWriter`] the serialization layer drives.
//! Everything on the wire is little-endian; strings are raw UTF-16 unit
//! sequences with an explicit length, never null-terminated.

use widestring::{U16Str, U16String};

use crate::{Error::OutOfBounds, Result};

/// Trait for type specific safe wire readers / writers.
///
/// Implemented for the integer types the history format uses. Values always
/// travel little-endian.
pub trait WireValue: Sized {
    /// Encoded width in bytes
    const SIZE: usize;

    /// Decode from exactly [`Self::SIZE`] little-endian bytes
    fn from_wire(bytes: &[u8]) -> Self;
    /// Append the little-endian encoding to `out`
    fn to_wire(self, out: &mut Vec<u8>);
}

impl WireValue for u32 {
    const SIZE: usize = 4;

    fn from_wire(bytes: &[u8]) -> Self {
        u32::from_le_bytes(bytes.try_into().expect("slice of WireValue::SIZE"))
    }

    fn to_wire(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl WireValue for i32 {
    const SIZE: usize = 4;

    fn from_wire(bytes: &[u8]) -> Self {
        i32::from_le_bytes(bytes.try_into().expect("slice of WireValue::SIZE"))
    }

    fn to_wire(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl WireValue for u64 {
    const SIZE: usize = 8;

    fn from_wire(bytes: &[u8]) -> Self {
        u64::from_le_bytes(bytes.try_into().expect("slice of WireValue::SIZE"))
    }

    fn to_wire(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl WireValue for u16 {
    const SIZE: usize = 2;

    fn from_wire(bytes: &[u8]) -> Self {
        u16::from_le_bytes(bytes.try_into().expect("slice of WireValue::SIZE"))
    }

    fn to_wire(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

/// Bounds-checked forward cursor over received wire data.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Wraps a received buffer.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Reads one primitive.
    ///
    /// # Errors
    /// [`OutOfBounds`] if fewer than `T::SIZE` bytes remain.
    pub fn read<T: WireValue>(&mut self) -> Result<T> {
        let end = self.pos.checked_add(T::SIZE).ok_or(OutOfBounds)?;
        if end > self.data.len() {
            return Err(OutOfBounds);
        }
        let value = T::from_wire(&self.data[self.pos..end]);
        self.pos = end;
        Ok(value)
    }

    /// Reads `units` UTF-16 code units as a string.
    ///
    /// # Errors
    /// [`OutOfBounds`] if the buffer ends inside the string.
    pub fn read_utf16(&mut self, units: usize) -> Result<U16String> {
        let mut string = U16String::with_capacity(units);
        for _ in 0..units {
            string.push_slice([self.read::<u16>()?]);
        }
        Ok(string)
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// True once the whole buffer is consumed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }
}

/// Append-only encoder for outgoing wire data.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// An empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A writer with `capacity` bytes preallocated. The serialization layer
    /// computes exact sizes up front, so growth never happens in practice.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Appends one primitive.
    pub fn write<T: WireValue>(&mut self, value: T) {
        value.to_wire(&mut self.buf);
    }

    /// Appends the raw UTF-16 units of `string`, without a terminator.
    pub fn write_utf16(&mut self, string: &U16Str) {
        for unit in string.as_slice() {
            self.write(*unit);
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consumes the writer, yielding the encoded buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use widestring::u16str;

    #[test]
    fn primitives_roundtrip() {
        let mut writer = WireWriter::new();
        writer.write(0xDEAD_BEEFu32);
        writer.write(-1i32);
        writer.write(0x0102_0304_0506_0708u64);
        let bytes = writer.into_bytes();

        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.read::<u32>().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read::<i32>().unwrap(), -1);
        assert_eq!(reader.read::<u64>().unwrap(), 0x0102_0304_0506_0708);
        assert!(reader.is_done());
    }

    #[test]
    fn encoding_is_little_endian() {
        let mut writer = WireWriter::new();
        writer.write(1u32);
        assert_eq!(writer.into_bytes(), vec![1, 0, 0, 0]);
    }

    #[test]
    fn utf16_roundtrip() {
        let mut writer = WireWriter::new();
        writer.write_utf16(u16str!("App.dll"));
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 14);

        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.read_utf16(7).unwrap(), u16str!("App.dll").to_ustring());
    }

    #[test]
    fn truncated_reads_fail() {
        let bytes = [1u8, 2, 3];
        let mut reader = WireReader::new(&bytes);
        assert!(matches!(reader.read::<u32>(), Err(OutOfBounds)));
        let mut reader = WireReader::new(&bytes);
        assert!(matches!(reader.read_utf16(2), Err(OutOfBounds)));
    }

    #[test]
    fn empty_input_reads_nothing() {
        let mut reader = WireReader::new(&[]);
        assert!(reader.is_done());
        assert!(matches!(reader.read::<u16>(), Err(OutOfBounds)));
    }
}

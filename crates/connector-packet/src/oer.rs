//! ASN.1 OER primitives: variable-length octet strings and unsigned
//! integers, over plain byte slices.

#![forbid(unsafe_code)]

use std::io::{Error, ErrorKind, Result};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};

const HIGH_BIT: u8 = 0x80;
const LOWER_SEVEN_BITS: u8 = 0x7f;

/// Returns the size (in bytes) of the buffer that encodes a VarOctetString of
/// `length` bytes.
pub fn predict_var_octet_string(length: usize) -> usize {
    if length < 128 {
        1 + length
    } else {
        1 + predict_var_uint_size(length as u64) + length
    }
}

/// Returns the minimum number of bytes needed to encode the value.
fn predict_var_uint_size(value: u64) -> usize {
    for i in 1..=8 {
        let max = u64::MAX >> (64 - 8 * i);
        if value <= max {
            return i;
        }
    }
    unreachable!()
}

/// Splits the var-octet-string content out of the front of the buffer,
/// discarding the length prefix and anything after the content.
pub fn extract_var_octet_string(mut buffer: BytesMut) -> Result<BytesMut> {
    let buffer_length = buffer.len();
    let mut reader = &buffer[..];
    let content_length = reader.read_var_octet_string_length()?;
    let content_offset = buffer_length - reader.len();

    let mut remaining = buffer.split_off(content_offset);
    if remaining.len() < content_length {
        Err(Error::new(ErrorKind::UnexpectedEof, "buffer too small"))
    } else {
        Ok(remaining.split_to(content_length))
    }
}

pub trait BufOerExt<'a> {
    fn peek_var_octet_string(&self) -> Result<&'a [u8]>;
    fn read_var_octet_string(&mut self) -> Result<&'a [u8]>;
    fn skip(&mut self, discard_bytes: usize) -> Result<()>;
    fn skip_var_octet_string(&mut self) -> Result<()>;
    fn read_var_octet_string_length(&mut self) -> Result<usize>;
    fn read_var_uint(&mut self) -> Result<u64>;
}

impl<'a> BufOerExt<'a> for &'a [u8] {
    /// Decodes a variable-length octet string without moving the cursor.
    #[inline]
    fn peek_var_octet_string(&self) -> Result<&'a [u8]> {
        let mut peek = &self[..];
        let actual_length = peek.read_var_octet_string_length()?;
        let offset = self.len() - peek.len();
        if peek.len() < actual_length {
            Err(Error::new(ErrorKind::UnexpectedEof, "buffer too small"))
        } else {
            Ok(&self[offset..(offset + actual_length)])
        }
    }

    /// Decodes a variable-length octet string and advances the cursor past it.
    #[inline]
    fn read_var_octet_string(&mut self) -> Result<&'a [u8]> {
        let actual_length = self.read_var_octet_string_length()?;
        if self.len() < actual_length {
            Err(Error::new(ErrorKind::UnexpectedEof, "buffer too small"))
        } else {
            let to_return = &self[..actual_length];
            *self = &self[actual_length..];
            Ok(to_return)
        }
    }

    #[inline]
    fn skip(&mut self, discard_bytes: usize) -> Result<()> {
        if self.len() < discard_bytes {
            Err(Error::new(ErrorKind::UnexpectedEof, "buffer too small"))
        } else {
            *self = &self[discard_bytes..];
            Ok(())
        }
    }

    #[inline]
    fn skip_var_octet_string(&mut self) -> Result<()> {
        let actual_length = self.read_var_octet_string_length()?;
        self.skip(actual_length)
    }

    #[doc(hidden)]
    #[inline]
    fn read_var_octet_string_length(&mut self) -> Result<usize> {
        let length = self.read_u8()?;
        if length & HIGH_BIT != 0 {
            let length_prefix_length = (length & LOWER_SEVEN_BITS) as usize;
            if length_prefix_length > 8 {
                Err(Error::new(ErrorKind::InvalidData, "length prefix too large"))
            } else {
                Ok(self.read_uint::<BigEndian>(length_prefix_length)? as usize)
            }
        } else {
            Ok(length as usize)
        }
    }

    /// Decodes a variable-length unsigned integer into a `u64`.
    #[inline]
    fn read_var_uint(&mut self) -> Result<u64> {
        let size = self.read_var_octet_string_length()?;
        if size == 0 {
            Err(Error::new(ErrorKind::InvalidData, "zero-length VarUInt"))
        } else if size > 8 {
            Err(Error::new(ErrorKind::InvalidData, "VarUInt too large"))
        } else {
            Ok(self.read_uint::<BigEndian>(size)?)
        }
    }
}

pub trait MutBufOerExt: BufMut + Sized {
    /// Encodes bytes as a variable-length octet string.
    #[inline]
    fn put_var_octet_string(&mut self, bytes: &[u8]) {
        self.put_var_octet_string_length(bytes.len());
        self.put_slice(bytes);
    }

    #[doc(hidden)]
    #[inline]
    fn put_var_octet_string_length(&mut self, length: usize) {
        if length < 128 {
            self.put_u8(length as u8);
        } else {
            let length_of_length = predict_var_uint_size(length as u64);
            self.put_u8(HIGH_BIT | length_of_length as u8);
            self.put_uint(length as u64, length_of_length);
        }
    }

    /// Encodes a `u64` as a variable-length unsigned integer.
    #[inline]
    fn put_var_uint(&mut self, uint: u64) {
        let size = predict_var_uint_size(uint);
        self.put_var_octet_string_length(size);
        self.put_uint(uint, size);
    }
}

impl<B: BufMut + Sized> MutBufOerExt for B {}

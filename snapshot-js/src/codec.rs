use crate::error::DecodeError;
use std::sync::Arc;

/// Value of a forward reference slot before it is patched.
pub const PLACEHOLDER: i32 = -1;

/// Growable little-endian byte sink.
///
/// Unsigned integers are LEB128 varints, signed integers are zig-zag varints, and
/// `put_i32`/`put_double` are fixed width so they can be patched or read without
/// decoding the preceding bytes.
#[derive(Default, Debug)]
pub struct BinaryEncoder {
  buf: Vec<u8>,
}

impl BinaryEncoder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn position(&self) -> usize {
    self.buf.len()
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.buf
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.buf
  }

  pub fn put_u8(&mut self, value: u8) {
    self.buf.push(value);
  }

  pub fn put_uint(&mut self, mut value: u64) {
    loop {
      let byte = (value & 0x7f) as u8;
      value >>= 7;
      if value == 0 {
        self.buf.push(byte);
        return;
      }
      self.buf.push(byte | 0x80);
    }
  }

  pub fn put_int(&mut self, value: i32) {
    self.put_uint(((value << 1) ^ (value >> 31)) as u32 as u64);
  }

  pub fn put_long(&mut self, value: i64) {
    self.put_uint(((value << 1) ^ (value >> 63)) as u64);
  }

  pub fn put_bool(&mut self, value: bool) {
    self.put_int(value as i32);
  }

  pub fn put_i32(&mut self, value: i32) {
    self.buf.extend_from_slice(&value.to_le_bytes());
  }

  pub fn put_double(&mut self, value: f64) {
    self.buf.extend_from_slice(&value.to_bits().to_le_bytes());
  }

  pub fn put_utf8(&mut self, value: &str) {
    self.put_uint(value.len() as u64);
    self.buf.extend_from_slice(value.as_bytes());
  }

  /// Back-writes `value` over the fixed-width placeholder at `position`. Returns
  /// false, leaving the buffer untouched, if the slot is out of range or does not
  /// hold `PLACEHOLDER`.
  pub fn patch_i32(&mut self, position: usize, value: i32) -> bool {
    let Some(end) = position.checked_add(4) else {
      return false;
    };
    let Some(slot) = self.buf.get_mut(position..end) else {
      return false;
    };
    if *slot != PLACEHOLDER.to_le_bytes() {
      return false;
    };
    slot.copy_from_slice(&value.to_le_bytes());
    true
  }
}

/// Cursor over a shared, immutable byte buffer. Cloning or repositioning a cursor
/// never copies the buffer.
#[derive(Clone, Debug)]
pub struct BinaryDecoder {
  buf: Arc<[u8]>,
  pos: usize,
}

impl BinaryDecoder {
  pub fn new(buf: Arc<[u8]>) -> Self {
    Self { buf, pos: 0 }
  }

  /// Independent cursor over the same buffer, starting at `position`.
  pub fn at(&self, position: usize) -> Result<Self, DecodeError> {
    if position > self.buf.len() {
      return Err(DecodeError::UnexpectedEnd);
    };
    Ok(Self {
      buf: self.buf.clone(),
      pos: position,
    })
  }

  pub fn buffer(&self) -> &Arc<[u8]> {
    &self.buf
  }

  pub fn position(&self) -> usize {
    self.pos
  }

  pub fn remaining(&self) -> usize {
    self.buf.len() - self.pos
  }

  pub fn has_remaining(&self) -> bool {
    self.pos < self.buf.len()
  }

  fn take(&mut self, n: usize) -> Result<&[u8], DecodeError> {
    if self.remaining() < n {
      return Err(DecodeError::UnexpectedEnd);
    };
    let bytes = &self.buf[self.pos..self.pos + n];
    self.pos += n;
    Ok(bytes)
  }

  pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
    Ok(self.take(1)?[0])
  }

  pub fn get_uint(&mut self) -> Result<u64, DecodeError> {
    let mut result = 0u64;
    let mut shift = 0;
    loop {
      let byte = self.get_u8()?;
      if shift == 63 && byte > 1 {
        return Err(DecodeError::Malformed("varint overflow"));
      };
      result |= ((byte & 0x7f) as u64) << shift;
      if byte & 0x80 == 0 {
        return Ok(result);
      };
      shift += 7;
      if shift > 63 {
        return Err(DecodeError::Malformed("varint overflow"));
      };
    }
  }

  pub fn get_int(&mut self) -> Result<i32, DecodeError> {
    let raw = u32::try_from(self.get_uint()?).map_err(|_| DecodeError::Malformed("int overflow"))?;
    Ok(((raw >> 1) as i32) ^ -((raw & 1) as i32))
  }

  pub fn get_long(&mut self) -> Result<i64, DecodeError> {
    let raw = self.get_uint()?;
    Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
  }

  pub fn get_bool(&mut self) -> Result<bool, DecodeError> {
    match self.get_int()? {
      0 => Ok(false),
      1 => Ok(true),
      _ => Err(DecodeError::Malformed("boolean out of range")),
    }
  }

  pub fn get_i32(&mut self) -> Result<i32, DecodeError> {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(self.take(4)?);
    Ok(i32::from_le_bytes(bytes))
  }

  pub fn get_double(&mut self) -> Result<f64, DecodeError> {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(self.take(8)?);
    Ok(f64::from_bits(u64::from_le_bytes(bytes)))
  }

  pub fn get_utf8(&mut self) -> Result<String, DecodeError> {
    let len = usize::try_from(self.get_uint()?).map_err(|_| DecodeError::UnexpectedEnd)?;
    let bytes = self.take(len)?;
    std::str::from_utf8(bytes)
      .map(str::to_string)
      .map_err(|_| DecodeError::Malformed("invalid utf-8"))
  }
}

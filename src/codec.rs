//! Little-endian binary framing for persisted state blobs.

use super::error::{DspError, Result};

/// Magic tag opening every pipeline state blob.
pub const STATE_MAGIC: [u8; 4] = *b"FDSP";

/// Format version of the pipeline state layout.
pub const STATE_VERSION: u16 = 1;

/// Append-only little-endian writer.
#[derive(Default)]
pub struct StateWriter {
    buf: Vec<u8>,
}

impl StateWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Length-prefixed vector of f64 values.
    pub fn write_f64_slice(&mut self, values: &[f64]) {
        self.write_u32(values.len() as u32);
        for &v in values {
            self.write_f64(v);
        }
    }

    /// Length-prefixed raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Checked little-endian reader. Every read fails with `StateCorrupted`
/// instead of running past the end.
pub struct StateReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StateReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(DspError::StateCorrupted(format!(
                "unexpected end of state at byte {}",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(f64::from_le_bytes(arr))
    }

    /// Read a vector written by `write_f64_slice`.
    pub fn read_f64_slice(&mut self) -> Result<Vec<f64>> {
        let len = self.read_u32()? as usize;
        // Bound the claimed length by the remaining bytes before allocating.
        if len > self.remaining() / 8 {
            return Err(DspError::StateCorrupted(format!(
                "f64 vector of claimed length {len} exceeds remaining payload"
            )));
        }
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(self.read_f64()?);
        }
        Ok(out)
    }

    /// Read bytes written by `write_bytes`.
    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        if len > self.remaining() {
            return Err(DspError::StateCorrupted(format!(
                "byte vector of claimed length {len} exceeds remaining payload"
            )));
        }
        self.take(len)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fail unless the reader consumed everything.
    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(DspError::StateCorrupted(format!(
                "{} trailing bytes in state payload",
                self.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut writer = StateWriter::new();
        writer.write_u8(7);
        writer.write_u16(1000);
        writer.write_u32(123456);
        writer.write_u64(1 << 40);
        writer.write_f64(-0.125);
        writer.write_f64_slice(&[1.0, 2.5, -3.75]);
        writer.write_bytes(b"tail");
        let bytes = writer.into_bytes();

        let mut reader = StateReader::new(&bytes);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u16().unwrap(), 1000);
        assert_eq!(reader.read_u32().unwrap(), 123456);
        assert_eq!(reader.read_u64().unwrap(), 1 << 40);
        assert_eq!(reader.read_f64().unwrap(), -0.125);
        assert_eq!(reader.read_f64_slice().unwrap(), vec![1.0, 2.5, -3.75]);
        assert_eq!(reader.read_bytes().unwrap(), b"tail");
        reader.finish().unwrap();
    }

    #[test]
    fn test_truncation_detected() {
        let mut writer = StateWriter::new();
        writer.write_f64_slice(&[1.0, 2.0, 3.0, 4.0]);
        let bytes = writer.into_bytes();
        let mut reader = StateReader::new(&bytes[..bytes.len() - 3]);
        assert!(reader.read_f64_slice().is_err());
    }

    #[test]
    fn test_trailing_bytes_detected() {
        let mut writer = StateWriter::new();
        writer.write_u32(5);
        let bytes = writer.into_bytes();
        let mut reader = StateReader::new(&bytes);
        reader.read_u16().unwrap();
        assert!(reader.finish().is_err());
    }
}

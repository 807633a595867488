#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fragment address within the filesystem (UFS `daddr_t`, in fragments).
///
/// Fragments are the filesystem's smallest addressing unit; block addresses
/// stored in the superblock (`fs_csaddr`, `fs_sblkno`, ...) are fragment
/// numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FragNumber(pub i64);

/// Device block address (units of the underlying device's sector size).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DevBlock(pub i64);

/// Byte offset on a `ByteDevice` (pread/pwrite semantics).
///
/// Unit-carrying wrapper to prevent mixing bytes, fragments and device blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

/// Cylinder-group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CgNumber(pub u32);

impl FragNumber {
    /// Convert to a device block address given `log2(fsize / dev_bsize)`
    /// (the superblock's `fs_fsbtodb` shift).
    ///
    /// Returns `None` for negative addresses or on overflow.
    #[must_use]
    pub fn to_dev_block(self, fsbtodb_shift: u32) -> Option<DevBlock> {
        if self.0 < 0 || fsbtodb_shift >= 63 {
            return None;
        }
        self.0.checked_shl(fsbtodb_shift).map(DevBlock)
    }
}

impl DevBlock {
    /// Byte offset of this device block for a `dev_bsize`-byte sector.
    ///
    /// Returns `None` for negative addresses or on overflow.
    #[must_use]
    pub fn to_byte_offset(self, dev_bsize: u32) -> Option<ByteOffset> {
        let block = u64::try_from(self.0).ok()?;
        block.checked_mul(u64::from(dev_bsize)).map(ByteOffset)
    }
}

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Round up to the nearest multiple of `alignment` (non-zero power of two).
    #[must_use]
    pub fn align_up(self, alignment: u64) -> Option<Self> {
        align_up(self.0, alignment).map(Self)
    }

    /// Narrow to `usize`, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_usize(self) -> Result<usize, ParseError> {
        usize::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "byte_offset",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(i64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_i32(data: &mut [u8], offset: usize, value: i32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_i64(data: &mut [u8], offset: usize, value: i64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Write `text` into a fixed-width NUL-padded field, truncating if needed.
///
/// The field always ends with at least one NUL byte.
pub fn write_nul_padded(
    data: &mut [u8],
    offset: usize,
    width: usize,
    text: &str,
) -> Result<(), ParseError> {
    let field = ensure_slice_mut(data, offset, width)?;
    field.fill(0);
    let take = text.len().min(width.saturating_sub(1));
    field[..take].copy_from_slice(&text.as_bytes()[..take]);
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Round `value` up to a multiple of `unit` (any non-zero unit, not
/// necessarily a power of two). Used for fragment rounding, where the
/// fragment size is a power of two but the roundup is expressed in units.
#[must_use]
pub fn round_up_to_unit(value: u64, unit: u64) -> Option<u64> {
    if unit == 0 {
        return None;
    }
    value.div_ceil(unit).checked_mul(unit)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Widen a signed on-disk count to `u64`, rejecting negative values.
pub fn i32_to_u64(value: i32, field: &'static str) -> Result<u64, ParseError> {
    u64::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

impl fmt::Display for FragNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DevBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CgNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert_eq!(read_le_i32(&bytes, 4).expect("i32"), -0x6F54_3211);
    }

    #[test]
    fn test_write_helpers_round_trip() {
        let mut buf = [0_u8; 16];
        write_le_u32(&mut buf, 0, 0xDEAD_BEEF).expect("u32");
        write_le_i32(&mut buf, 4, -1).expect("i32");
        write_le_u64(&mut buf, 8, 0x0102_0304_0506_0708).expect("u64");

        assert_eq!(read_le_u32(&buf, 0).expect("u32"), 0xDEAD_BEEF);
        assert_eq!(read_le_i32(&buf, 4).expect("i32"), -1);
        assert_eq!(read_le_u64(&buf, 8).expect("u64"), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_write_bounds_checked() {
        let mut buf = [0_u8; 4];
        assert!(write_le_u32(&mut buf, 0, 1).is_ok());
        assert!(write_le_u32(&mut buf, 1, 1).is_err());
        assert!(write_le_u64(&mut buf, 0, 1).is_err());
    }

    #[test]
    fn test_nul_padded_round_trip() {
        let mut buf = [0xFF_u8; 16];
        write_nul_padded(&mut buf, 0, 8, "rufs /").expect("label");
        assert_eq!(trim_nul_padded(&buf[..8]), "rufs /");
        // Padding beyond the text is zeroed, bytes past the field untouched.
        assert_eq!(buf[7], 0);
        assert_eq!(buf[8], 0xFF);
    }

    #[test]
    fn test_nul_padded_truncates() {
        let mut buf = [0_u8; 4];
        write_nul_padded(&mut buf, 0, 4, "abcdef").expect("label");
        assert_eq!(&buf, b"abc\0");
    }

    #[test]
    fn test_frag_to_dev_block() {
        // fsize 1024, dev_bsize 512 => shift 1
        assert_eq!(FragNumber(24).to_dev_block(1), Some(DevBlock(48)));
        assert_eq!(FragNumber(0).to_dev_block(1), Some(DevBlock(0)));
        assert_eq!(FragNumber(-1).to_dev_block(1), None);
    }

    #[test]
    fn test_dev_block_to_bytes() {
        assert_eq!(
            DevBlock(48).to_byte_offset(512),
            Some(ByteOffset(24 * 1024))
        );
        assert_eq!(DevBlock(-1).to_byte_offset(512), None);
        assert_eq!(DevBlock(i64::MAX).to_byte_offset(512), None);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(4096, 4096), Some(4096));
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_up(0, 4096), Some(0));
        assert_eq!(align_up(u64::MAX, 4096), None);
        assert_eq!(align_up(100, 0), None);
        assert_eq!(align_up(100, 3), None);
    }

    #[test]
    fn test_round_up_to_unit() {
        assert_eq!(round_up_to_unit(32, 1024), Some(1024));
        assert_eq!(round_up_to_unit(1024, 1024), Some(1024));
        assert_eq!(round_up_to_unit(1025, 1024), Some(2048));
        assert_eq!(round_up_to_unit(0, 1024), Some(0));
        assert_eq!(round_up_to_unit(10, 0), None);
    }

    #[test]
    fn test_i32_to_u64() {
        assert_eq!(i32_to_u64(42, "x"), Ok(42));
        assert!(i32_to_u64(-1, "x").is_err());
    }
}

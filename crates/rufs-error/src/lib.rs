#![forbid(unsafe_code)]
//! Error types for rufs.
//!
//! # Error Taxonomy
//!
//! rufs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `rufs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `HyperError` | `rufs-error` (this crate) | Operator-facing errors for mount, sync and mode changes |
//!
//! `rufs-error` is intentionally independent of `rufs-types` and
//! `rufs-ondisk` to avoid cyclic dependencies. The conversion from
//! `ParseError` to `HyperError` is implemented in `rufs-core`, which depends
//! on both crates.
//!
//! ## Severity classes
//!
//! | Class | Variants | Outcome |
//! |-------|----------|---------|
//! | Fatal configuration | `BadMagic`, `BlockSizeTooLarge`, `BlockSizeTooSmall`, `SymlinkLenTooLarge`, `Misaligned`, `CapacityShortfall`, `MediaFault`, `Parse` | Mount aborts; the image is left exactly as found |
//! | I/O | `Io`, `ProtectionViolation` | Surfaced to the caller; the csum-dirty flag stays set so a later sync retries |
//!
//! Consistency *warnings* (unclean at mount, unclean writable remount,
//! forced compatibility upgrade) are not errors at all — they are `tracing`
//! warn events, and processing continues under a safe fallback. Invariant
//! violations inside write-back (a dirty superblock while read-only) are
//! assertions, not variants: they indicate the dirty-state machine was
//! broken by a caller and are not user-recoverable.

use thiserror::Error;

/// Unified error type for hypermetadata operations.
///
/// Internal crate-specific errors (e.g. `ParseError` from `rufs-types`) are
/// converted into `HyperError` at crate boundaries.
#[derive(Debug, Error)]
pub enum HyperError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The superblock region does not carry the UFS magic number.
    #[error("bad magic number {actual:#x} (should be {expected:#x})")]
    BadMagic { actual: u32, expected: u32 },

    /// `fs_bsize` exceeds the largest supported filesystem block size.
    #[error("block size {bsize} is too big (max is {max} bytes)")]
    BlockSizeTooLarge { bsize: i32, max: u32 },

    /// `fs_bsize` is smaller than the superblock record itself.
    #[error("block size {bsize} is too small (min is {min} bytes)")]
    BlockSizeTooSmall { bsize: i32, min: u32 },

    /// `fs_maxsymlinklen` exceeds the compile-time inline symlink bound.
    #[error("max shortcut symlink length {len} is too big (max is {max})")]
    SymlinkLenTooLarge { len: i32, max: u32 },

    /// Block size and mapping granularity or device sector size do not line up.
    #[error("misaligned geometry: {0}")]
    Misaligned(String),

    /// The device is smaller than the space the superblock claims.
    #[error("disk size ({device_bytes}) less than necessary (superblock says we need {needed_bytes})")]
    CapacityShortfall { device_bytes: u64, needed_bytes: u64 },

    /// A guarded read of the mapped image faulted on bad media.
    #[error("media fault reading {len} bytes at offset {offset}")]
    MediaFault { offset: u64, len: usize },

    /// Parse-layer error surfaced to the operator.
    ///
    /// Carries the string representation of a `ParseError` from
    /// `rufs-types` when no more specific variant applies.
    #[error("parse error: {0}")]
    Parse(String),

    /// A write was attempted through a read-protected disk image.
    #[error("write of {len} bytes at offset {offset} through read-protected image")]
    ProtectionViolation { offset: u64, len: usize },
}

impl HyperError {
    /// Whether this error belongs to the fatal-configuration class: the
    /// mount cannot proceed and retrying without operator intervention
    /// (running a repair tool) cannot succeed.
    #[must_use]
    pub fn is_fatal_config(&self) -> bool {
        match self {
            Self::BadMagic { .. }
            | Self::BlockSizeTooLarge { .. }
            | Self::BlockSizeTooSmall { .. }
            | Self::SymlinkLenTooLarge { .. }
            | Self::Misaligned(_)
            | Self::CapacityShortfall { .. }
            | Self::MediaFault { .. }
            | Self::Parse(_) => true,
            Self::Io(_) | Self::ProtectionViolation { .. } => false,
        }
    }
}

/// Result alias using `HyperError`.
pub type Result<T> = std::result::Result<T, HyperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        let err = HyperError::BadMagic {
            actual: 0xBEEF,
            expected: 0x011954,
        };
        assert_eq!(
            err.to_string(),
            "bad magic number 0xbeef (should be 0x11954)"
        );

        let err = HyperError::BlockSizeTooLarge {
            bsize: 16384,
            max: 8192,
        };
        assert_eq!(
            err.to_string(),
            "block size 16384 is too big (max is 8192 bytes)"
        );

        let err = HyperError::CapacityShortfall {
            device_bytes: 1024,
            needed_bytes: 4096,
        };
        assert_eq!(
            err.to_string(),
            "disk size (1024) less than necessary (superblock says we need 4096)"
        );

        let err = HyperError::MediaFault {
            offset: 8192,
            len: 8192,
        };
        assert!(err.to_string().contains("media fault"));
    }

    #[test]
    fn fatal_classification_covers_all_variants() {
        let fatal: Vec<HyperError> = vec![
            HyperError::BadMagic {
                actual: 0,
                expected: 0x011954,
            },
            HyperError::BlockSizeTooLarge {
                bsize: 16384,
                max: 8192,
            },
            HyperError::BlockSizeTooSmall { bsize: 512, min: 1380 },
            HyperError::SymlinkLenTooLarge { len: 100, max: 60 },
            HyperError::Misaligned("bsize % 512 != 0".into()),
            HyperError::CapacityShortfall {
                device_bytes: 0,
                needed_bytes: 1,
            },
            HyperError::MediaFault { offset: 0, len: 1 },
            HyperError::Parse("truncated".into()),
        ];
        for err in &fatal {
            assert!(err.is_fatal_config(), "{err} should be fatal");
        }

        let transient: Vec<HyperError> = vec![
            HyperError::Io(std::io::Error::other("test")),
            HyperError::ProtectionViolation { offset: 0, len: 1 },
        ];
        for err in &transient {
            assert!(!err.is_fatal_config(), "{err} should not be fatal");
        }
    }
}

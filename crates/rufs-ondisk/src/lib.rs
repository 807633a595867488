#![forbid(unsafe_code)]
//! On-disk UFS hypermetadata codec.
//!
//! Parses and re-encodes the 4.4BSD `struct fs` superblock and the
//! cylinder-group summary ("csum") table. Fields are little-endian at fixed
//! offsets; the full raw superblock region is retained alongside the parsed
//! record so that bytes this crate does not model round-trip bit-exactly.

pub mod csum;
pub mod superblock;

pub use csum::{Csum, CsumTable};
pub use superblock::{FsRevision, Superblock};

/// UFS superblock signature (`fs_magic`).
pub const FS_MAGIC: u32 = 0x0001_1954;

/// Byte offset of the superblock within the volume.
pub const SBOFF: u64 = 8192;

/// Size of the on-disk superblock region in bytes.
pub const SBSIZE: usize = 8192;

/// Size of the superblock record itself (`sizeof(struct fs)`); the
/// filesystem block size must be at least this large.
pub const SUPERBLOCK_RECORD_SIZE: u32 = 1380;

/// Device sector size assumed by fragment-to-device-block addressing.
pub const DEV_BSIZE: u32 = 512;

/// Largest supported filesystem block size.
pub const MAXBSIZE: u32 = 8192;

/// Direct block pointers per inode.
pub const NDADDR: u32 = 12;

/// Indirect block pointer levels per inode.
pub const NIADDR: u32 = 3;

/// Longest symlink target that can be stored inline in the inode's block
/// pointer area: `(NDADDR + NIADDR) * sizeof(daddr_t)`.
pub const MAXSYMLINKLEN: u32 = (NDADDR + NIADDR) * 4;

/// Width of the `fs_fsmnt` mount-point label field.
pub const MAXMNTLEN: usize = 512;

/// 4.2BSD inode format tag (`fs_inodefmt`).
pub const FS_42INODEFMT: i32 = -1;

/// 4.4BSD inode format tag; anything below it is an old-format image.
pub const FS_44INODEFMT: i32 = 2;

/// Static rotational-position table layout (`fs_postblformat`), the oldest
/// revision.
pub const FS_42POSTBLFMT: i32 = -1;

/// Dynamic rotational-position table layout.
pub const FS_DYNAMICPOSTBLFMT: i32 = 1;

#![forbid(unsafe_code)]

use crate::csum::Csum;
use crate::{
    DEV_BSIZE, FS_42POSTBLFMT, FS_44INODEFMT, FS_MAGIC, MAXMNTLEN, NDADDR, NIADDR, SBSIZE,
};
use rufs_types::{
    ByteOffset, DevBlock, FragNumber, ParseError, ensure_slice, i32_to_u64, read_le_i32,
    read_le_i64, read_le_u32, read_le_u64, trim_nul_padded, write_le_i32, write_le_i64,
    write_le_u32, write_le_u64, write_nul_padded,
};
use serde::{Deserialize, Serialize};

/// Field offsets within the on-disk `struct fs`.
pub mod off {
    pub const SBLKNO: usize = 0x08;
    pub const CBLKNO: usize = 0x0C;
    pub const IBLKNO: usize = 0x10;
    pub const DBLKNO: usize = 0x14;
    pub const TIME: usize = 0x20;
    pub const SIZE: usize = 0x24;
    pub const DSIZE: usize = 0x28;
    pub const NCG: usize = 0x2C;
    pub const BSIZE: usize = 0x30;
    pub const FSIZE: usize = 0x34;
    pub const FRAG: usize = 0x38;
    pub const BMASK: usize = 0x48;
    pub const FMASK: usize = 0x4C;
    pub const FSBTODB: usize = 0x64;
    pub const SBSIZE_FIELD: usize = 0x68;
    pub const NINDIR: usize = 0x74;
    pub const NPSECT: usize = 0x84;
    pub const INTERLEAVE: usize = 0x88;
    pub const CSADDR: usize = 0x98;
    pub const CSSIZE: usize = 0x9C;
    pub const NSECT: usize = 0xA8;
    pub const CSTOTAL: usize = 0xC0;
    pub const FMOD: usize = 0xD0;
    pub const CLEAN: usize = 0xD1;
    pub const RONLY: usize = 0xD2;
    pub const FSMNT: usize = 0xD4;
    pub const MAXSYMLINKLEN: usize = 0x528;
    pub const INODEFMT: usize = 0x52C;
    pub const MAXFILESIZE: usize = 0x530;
    pub const QBMASK: usize = 0x538;
    pub const QFMASK: usize = 0x540;
    pub const STATE: usize = 0x548;
    pub const POSTBLFORMAT: usize = 0x54C;
    pub const NRPOS: usize = 0x550;
    pub const MAGIC: usize = 0x55C;
}

/// Superblock layout revision.
///
/// Successive on-disk revisions added fields; older images need derivation
/// at load time and sentinel substitution at write-back. Both are one
/// exhaustive match over this enum, so a new revision cannot be added
/// without updating both sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsRevision {
    /// Static rotational-position tables (`fs_postblformat == FS_42POSTBLFMT`)
    /// and pre-4.4 inodes: the oldest revision.
    Bsd42,
    /// Dynamic rotational-position tables, but the inode format predates
    /// 4.4: `fs_maxfilesize` and the quad masks are not stored on disk.
    Pre44,
    /// 4.4BSD: every modeled field is stored on disk.
    Bsd44,
}

/// In-memory mirror of the on-disk superblock.
///
/// Constructed once at mount time from the raw bytes at [`crate::SBOFF`],
/// mutated in place thereafter. The raw region is kept so that
/// [`encode`](Self::encode) reproduces unmodeled bytes exactly as loaded.
#[derive(Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Fragment address of the superblock within a cylinder group.
    pub sblkno: i32,
    /// Fragment address of the cylinder-group block.
    pub cblkno: i32,
    /// Fragment address of the inode blocks.
    pub iblkno: i32,
    /// Fragment address of the first data block.
    pub dblkno: i32,
    /// Last superblock write timestamp.
    pub time: i32,
    /// Total filesystem size in fragments.
    pub size: i32,
    /// Data fragments available to files.
    pub dsize: i32,
    /// Number of cylinder groups.
    pub ncg: i32,
    /// Filesystem block size in bytes.
    pub bsize: i32,
    /// Fragment size in bytes.
    pub fsize: i32,
    /// Fragments per block.
    pub frag: i32,
    /// Block offset mask (`~(bsize - 1)`).
    pub bmask: i32,
    /// Fragment offset mask (`~(fsize - 1)`).
    pub fmask: i32,
    /// Shift converting fragment addresses to device blocks.
    pub fsbtodb: i32,
    /// Actual size of the superblock as written (`fs_sbsize`).
    pub sbsize: i32,
    /// Indirect pointers per block (`bsize / 4`).
    pub nindir: i32,
    /// Physical sectors per track.
    pub npsect: i32,
    /// Hardware sector interleave.
    pub interleave: i32,
    /// Logical sectors per track.
    pub nsect: i32,
    /// Fragment address of the cylinder-group summary area.
    pub csaddr: i32,
    /// Byte size of the summary area.
    pub cssize: i32,
    /// Filesystem-wide summary counts.
    pub cstotal: Csum,
    /// Superblock modified flag.
    pub fmod: i8,
    /// Filesystem was cleanly unmounted.
    pub clean: bool,
    /// Mounted read-only without updates.
    pub ronly: i8,
    /// Mount-point label.
    pub fsmnt: String,
    /// Longest inline symlink; positive iff the 4.4 symlink/dirtype
    /// extension is in effect.
    pub maxsymlinklen: i32,
    /// Inode format revision tag.
    pub inodefmt: i32,
    /// Largest representable file offset + 1, minus 1.
    pub maxfilesize: u64,
    /// Quad-width complement of `bmask`.
    pub qbmask: i64,
    /// Quad-width complement of `fmask`.
    pub qfmask: i64,
    /// Validation state stamp.
    pub state: i32,
    /// Rotational-position table layout tag.
    pub postblformat: i32,
    /// Number of rotational positions.
    pub nrpos: i32,
    /// Filesystem signature.
    pub magic: u32,

    raw: Vec<u8>,
}

impl std::fmt::Debug for Superblock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Superblock")
            .field("magic", &format_args!("{:#x}", self.magic))
            .field("bsize", &self.bsize)
            .field("fsize", &self.fsize)
            .field("size", &self.size)
            .field("ncg", &self.ncg)
            .field("inodefmt", &self.inodefmt)
            .field("postblformat", &self.postblformat)
            .field("clean", &self.clean)
            .field("fsmnt", &self.fsmnt)
            .finish_non_exhaustive()
    }
}

impl Superblock {
    /// Parse a superblock from an `SBSIZE`-byte on-disk region.
    ///
    /// Only the magic number is checked here; geometry bounds are a
    /// separate [`validate`](Self::validate) step so the mount layer can
    /// report each failure distinctly.
    pub fn parse(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SBSIZE {
            return Err(ParseError::InsufficientData {
                needed: SBSIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u32(region, off::MAGIC)?;
        if magic != FS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(FS_MAGIC),
                actual: u64::from(magic),
            });
        }

        let fsmnt_raw = ensure_slice(region, off::FSMNT, MAXMNTLEN)?;

        Ok(Self {
            sblkno: read_le_i32(region, off::SBLKNO)?,
            cblkno: read_le_i32(region, off::CBLKNO)?,
            iblkno: read_le_i32(region, off::IBLKNO)?,
            dblkno: read_le_i32(region, off::DBLKNO)?,
            time: read_le_i32(region, off::TIME)?,
            size: read_le_i32(region, off::SIZE)?,
            dsize: read_le_i32(region, off::DSIZE)?,
            ncg: read_le_i32(region, off::NCG)?,
            bsize: read_le_i32(region, off::BSIZE)?,
            fsize: read_le_i32(region, off::FSIZE)?,
            frag: read_le_i32(region, off::FRAG)?,
            bmask: read_le_i32(region, off::BMASK)?,
            fmask: read_le_i32(region, off::FMASK)?,
            fsbtodb: read_le_i32(region, off::FSBTODB)?,
            sbsize: read_le_i32(region, off::SBSIZE_FIELD)?,
            nindir: read_le_i32(region, off::NINDIR)?,
            npsect: read_le_i32(region, off::NPSECT)?,
            interleave: read_le_i32(region, off::INTERLEAVE)?,
            nsect: read_le_i32(region, off::NSECT)?,
            csaddr: read_le_i32(region, off::CSADDR)?,
            cssize: read_le_i32(region, off::CSSIZE)?,
            cstotal: Csum::parse(region, off::CSTOTAL)?,
            fmod: ensure_slice(region, off::FMOD, 1)?[0] as i8,
            clean: ensure_slice(region, off::CLEAN, 1)?[0] != 0,
            ronly: ensure_slice(region, off::RONLY, 1)?[0] as i8,
            fsmnt: trim_nul_padded(fsmnt_raw),
            maxsymlinklen: read_le_i32(region, off::MAXSYMLINKLEN)?,
            inodefmt: read_le_i32(region, off::INODEFMT)?,
            maxfilesize: read_le_u64(region, off::MAXFILESIZE)?,
            qbmask: read_le_i64(region, off::QBMASK)?,
            qfmask: read_le_i64(region, off::QFMASK)?,
            state: read_le_i32(region, off::STATE)?,
            postblformat: read_le_i32(region, off::POSTBLFORMAT)?,
            nrpos: read_le_i32(region, off::NRPOS)?,
            magic,
            raw: region[..SBSIZE].to_vec(),
        })
    }

    /// Structural bounds checked after parse, in reporting order.
    pub fn validate(&self) -> Result<(), ParseError> {
        if i64::from(self.bsize) > i64::from(crate::MAXBSIZE) {
            return Err(ParseError::InvalidField {
                field: "fs_bsize",
                reason: "exceeds the largest supported block size",
            });
        }
        if i64::from(self.bsize) < i64::from(crate::SUPERBLOCK_RECORD_SIZE) {
            return Err(ParseError::InvalidField {
                field: "fs_bsize",
                reason: "smaller than the superblock record",
            });
        }
        if self.fsize <= 0 || self.fsize > self.bsize {
            return Err(ParseError::InvalidField {
                field: "fs_fsize",
                reason: "must be positive and no larger than fs_bsize",
            });
        }
        if i64::from(self.maxsymlinklen) > i64::from(crate::MAXSYMLINKLEN) {
            return Err(ParseError::InvalidField {
                field: "fs_maxsymlinklen",
                reason: "exceeds the inline symlink bound",
            });
        }
        Ok(())
    }

    /// The layout revision of this image.
    #[must_use]
    pub fn revision(&self) -> FsRevision {
        if self.postblformat == FS_42POSTBLFMT {
            FsRevision::Bsd42
        } else if self.inodefmt < FS_44INODEFMT {
            FsRevision::Pre44
        } else {
            FsRevision::Bsd44
        }
    }

    /// Whether the 4.4 symlink/dirtype extension is in effect: directory
    /// entries carry an explicit type byte and short symlinks are stored
    /// inline in the inode.
    #[must_use]
    pub fn direct_symlink_extension(&self) -> bool {
        self.maxsymlinklen > 0
    }

    /// Repair fields that very old images leave zeroed or absent.
    ///
    /// Old-format derivations are mount-session conveniences; they are
    /// substituted back to sentinels at encode time so they never leak
    /// onto an older-format disk image.
    pub fn normalize(&mut self) {
        if self.npsect < self.nsect {
            self.npsect = self.nsect;
        }
        if self.interleave < 1 {
            self.interleave = 1;
        }
        match self.revision() {
            FsRevision::Bsd42 => {
                // The static-table revision's implicit constant.
                self.nrpos = 8;
                self.derive_old_format_fields();
            }
            FsRevision::Pre44 => self.derive_old_format_fields(),
            FsRevision::Bsd44 => {}
        }
    }

    fn derive_old_format_fields(&mut self) {
        self.maxfilesize = self.derived_max_file_size();
        self.qbmask = i64::from(!self.bmask);
        self.qfmask = i64::from(!self.fmask);
    }

    /// Largest addressable file size for an old-format image: the direct
    /// blocks, plus each indirect level's reach, minus one for the byte
    /// offset boundary.
    #[must_use]
    pub fn derived_max_file_size(&self) -> u64 {
        let bsize = u64::try_from(self.bsize).unwrap_or(0);
        let nindir = u64::try_from(self.nindir).unwrap_or(0);

        let mut maxfilesize = bsize
            .saturating_mul(u64::from(NDADDR))
            .saturating_sub(1);
        let mut sizepb = bsize;
        for _ in 0..NIADDR {
            sizepb = sizepb.saturating_mul(nindir);
            maxfilesize = maxfilesize.saturating_add(sizepb);
        }
        maxfilesize
    }

    /// Byte offset of fragment `frag` via the device-block shift.
    pub fn frag_to_byte(&self, frag: i64) -> Result<ByteOffset, ParseError> {
        let shift = u32::try_from(self.fsbtodb)
            .map_err(|_| ParseError::IntegerConversion { field: "fs_fsbtodb" })?;
        FragNumber(frag)
            .to_dev_block(shift)
            .and_then(|dev: DevBlock| dev.to_byte_offset(DEV_BSIZE))
            .ok_or(ParseError::IntegerConversion { field: "fs_csaddr" })
    }

    /// Byte address of the cylinder-group summary area.
    pub fn csum_byte_addr(&self) -> Result<ByteOffset, ParseError> {
        self.frag_to_byte(i64::from(self.csaddr))
    }

    /// Byte length of the summary area: `fs_cssize` rounded up to whole
    /// fragments.
    pub fn csum_region_len(&self) -> Result<usize, ParseError> {
        let cssize = i32_to_u64(self.cssize, "fs_cssize")?;
        let fsize = i32_to_u64(self.fsize, "fs_fsize")?;
        let frags = cssize.div_ceil(fsize);
        self.frag_to_byte(
            i64::try_from(frags).map_err(|_| ParseError::IntegerConversion { field: "fs_cssize" })?,
        )?
        .to_usize()
    }

    /// Total space the filesystem claims, in bytes.
    pub fn size_bytes(&self) -> Result<u64, ParseError> {
        let size = i32_to_u64(self.size, "fs_size")?;
        let fsize = i32_to_u64(self.fsize, "fs_fsize")?;
        size.checked_mul(fsize)
            .ok_or(ParseError::IntegerConversion { field: "fs_size" })
    }

    /// Byte length of one filesystem block, for scratch allocation.
    pub fn block_len(&self) -> Result<usize, ParseError> {
        usize::try_from(self.bsize).map_err(|_| ParseError::IntegerConversion { field: "fs_bsize" })
    }

    /// Build the on-disk image of this record.
    ///
    /// Every modeled field is re-stamped onto a copy of the loaded raw
    /// region; unmodeled bytes pass through unchanged. For pre-4.4
    /// revisions the derived fields are overwritten with the all-ones
    /// sentinel on the copy — the in-memory record is never touched.
    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let mut out = self.raw.clone();

        write_le_i32(&mut out, off::SBLKNO, self.sblkno)?;
        write_le_i32(&mut out, off::CBLKNO, self.cblkno)?;
        write_le_i32(&mut out, off::IBLKNO, self.iblkno)?;
        write_le_i32(&mut out, off::DBLKNO, self.dblkno)?;
        write_le_i32(&mut out, off::TIME, self.time)?;
        write_le_i32(&mut out, off::SIZE, self.size)?;
        write_le_i32(&mut out, off::DSIZE, self.dsize)?;
        write_le_i32(&mut out, off::NCG, self.ncg)?;
        write_le_i32(&mut out, off::BSIZE, self.bsize)?;
        write_le_i32(&mut out, off::FSIZE, self.fsize)?;
        write_le_i32(&mut out, off::FRAG, self.frag)?;
        write_le_i32(&mut out, off::BMASK, self.bmask)?;
        write_le_i32(&mut out, off::FMASK, self.fmask)?;
        write_le_i32(&mut out, off::FSBTODB, self.fsbtodb)?;
        write_le_i32(&mut out, off::SBSIZE_FIELD, self.sbsize)?;
        write_le_i32(&mut out, off::NINDIR, self.nindir)?;
        write_le_i32(&mut out, off::NPSECT, self.npsect)?;
        write_le_i32(&mut out, off::INTERLEAVE, self.interleave)?;
        write_le_i32(&mut out, off::NSECT, self.nsect)?;
        write_le_i32(&mut out, off::CSADDR, self.csaddr)?;
        write_le_i32(&mut out, off::CSSIZE, self.cssize)?;
        self.cstotal.encode_into(&mut out, off::CSTOTAL)?;
        out[off::FMOD] = self.fmod as u8;
        out[off::CLEAN] = u8::from(self.clean);
        out[off::RONLY] = self.ronly as u8;
        write_nul_padded(&mut out, off::FSMNT, MAXMNTLEN, &self.fsmnt)?;
        write_le_i32(&mut out, off::MAXSYMLINKLEN, self.maxsymlinklen)?;
        write_le_i32(&mut out, off::INODEFMT, self.inodefmt)?;
        write_le_u64(&mut out, off::MAXFILESIZE, self.maxfilesize)?;
        write_le_i64(&mut out, off::QBMASK, self.qbmask)?;
        write_le_i64(&mut out, off::QFMASK, self.qfmask)?;
        write_le_i32(&mut out, off::STATE, self.state)?;
        write_le_i32(&mut out, off::POSTBLFORMAT, self.postblformat)?;
        write_le_i32(&mut out, off::NRPOS, self.nrpos)?;
        write_le_u32(&mut out, off::MAGIC, self.magic)?;

        match self.revision() {
            FsRevision::Bsd42 => {
                write_le_i32(&mut out, off::NRPOS, -1)?;
                Self::substitute_old_format_sentinels(&mut out)?;
            }
            FsRevision::Pre44 => Self::substitute_old_format_sentinels(&mut out)?,
            FsRevision::Bsd44 => {}
        }

        Ok(out)
    }

    fn substitute_old_format_sentinels(out: &mut [u8]) -> Result<(), ParseError> {
        write_le_u64(out, off::MAXFILESIZE, u64::MAX)?;
        write_le_i64(out, off::QBMASK, -1)?;
        write_le_i64(out, off::QFMASK, -1)?;
        Ok(())
    }
}

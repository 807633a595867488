#![forbid(unsafe_code)]

use rufs_types::{CgNumber, ParseError, ensure_slice, read_le_i32, write_le_i32};
use serde::{Deserialize, Serialize};

/// Per-cylinder-group summary counts used by the block/inode allocator.
///
/// Also the type of the superblock's filesystem-wide `fs_cstotal` field.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Csum {
    /// Directories.
    pub ndir: i32,
    /// Free blocks.
    pub nbfree: i32,
    /// Free inodes.
    pub nifree: i32,
    /// Free fragments.
    pub nffree: i32,
}

impl Csum {
    /// On-disk size of one summary record.
    pub const SIZE: usize = 16;

    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            ndir: read_le_i32(data, offset)?,
            nbfree: read_le_i32(data, offset + 4)?,
            nifree: read_le_i32(data, offset + 8)?,
            nffree: read_le_i32(data, offset + 12)?,
        })
    }

    pub fn encode_into(&self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_i32(data, offset, self.ndir)?;
        write_le_i32(data, offset + 4, self.nbfree)?;
        write_le_i32(data, offset + 8, self.nifree)?;
        write_le_i32(data, offset + 12, self.nffree)?;
        Ok(())
    }
}

/// The cylinder-group summary table.
///
/// Holds the raw fragment-rounded byte region read from `fs_csaddr`, with
/// typed per-group accessors over the first `fs_ncg` records. Padding bytes
/// beyond `fs_cssize` are preserved verbatim so that a read-modify-write of
/// the region never disturbs them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsumTable {
    raw: Vec<u8>,
    ncg: usize,
    cssize: usize,
}

impl CsumTable {
    /// Build a table from the fragment-rounded on-disk region.
    ///
    /// `region` must hold at least `cssize` bytes, and `cssize` must cover
    /// `ncg` records.
    pub fn parse(region: &[u8], ncg: i32, cssize: i32) -> Result<Self, ParseError> {
        let ncg = usize::try_from(ncg)
            .map_err(|_| ParseError::IntegerConversion { field: "fs_ncg" })?;
        let cssize = usize::try_from(cssize)
            .map_err(|_| ParseError::IntegerConversion { field: "fs_cssize" })?;

        let needed = ncg
            .checked_mul(Csum::SIZE)
            .ok_or(ParseError::IntegerConversion { field: "fs_ncg" })?;
        if cssize < needed {
            return Err(ParseError::InvalidField {
                field: "fs_cssize",
                reason: "does not cover one record per cylinder group",
            });
        }
        if region.len() < cssize {
            return Err(ParseError::InsufficientData {
                needed: cssize,
                offset: 0,
                actual: region.len(),
            });
        }

        Ok(Self {
            raw: region.to_vec(),
            ncg,
            cssize,
        })
    }

    /// Number of cylinder groups covered.
    #[must_use]
    pub fn groups(&self) -> usize {
        self.ncg
    }

    /// Summary record for group `cg`.
    pub fn get(&self, cg: CgNumber) -> Result<Csum, ParseError> {
        let index = self.record_offset(cg)?;
        Csum::parse(&self.raw, index)
    }

    /// Replace the summary record for group `cg`.
    ///
    /// The caller must hold the shared allocation lock and mark the table
    /// dirty through the mount afterwards.
    pub fn set(&mut self, cg: CgNumber, value: Csum) -> Result<(), ParseError> {
        let index = self.record_offset(cg)?;
        value.encode_into(&mut self.raw, index)
    }

    fn record_offset(&self, cg: CgNumber) -> Result<usize, ParseError> {
        let cg = usize::try_from(cg.0)
            .map_err(|_| ParseError::IntegerConversion { field: "cg" })?;
        if cg >= self.ncg {
            return Err(ParseError::InvalidField {
                field: "cg",
                reason: "beyond fs_ncg",
            });
        }
        Ok(cg * Csum::SIZE)
    }

    /// The full fragment-rounded region.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.raw
    }

    /// The `fs_cssize` prefix that write-back overlays onto the on-disk
    /// region; padding past it keeps whatever the disk already holds.
    pub fn written_span(&self) -> Result<&[u8], ParseError> {
        ensure_slice(&self.raw, 0, self.cssize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> CsumTable {
        // Two groups, cssize fragment-rounded to 1024.
        let mut region = vec![0_u8; 1024];
        Csum {
            ndir: 2,
            nbfree: 100,
            nifree: 50,
            nffree: 7,
        }
        .encode_into(&mut region, 0)
        .expect("group 0");
        Csum {
            ndir: 1,
            nbfree: 80,
            nifree: 60,
            nffree: 3,
        }
        .encode_into(&mut region, Csum::SIZE)
        .expect("group 1");
        region[1023] = 0xEE; // padding byte past cssize
        CsumTable::parse(&region, 2, 1024).expect("table")
    }

    #[test]
    fn csum_record_round_trips() {
        let mut buf = [0_u8; Csum::SIZE];
        let rec = Csum {
            ndir: -1,
            nbfree: 2,
            nifree: 3,
            nffree: 4,
        };
        rec.encode_into(&mut buf, 0).expect("encode");
        assert_eq!(Csum::parse(&buf, 0).expect("parse"), rec);
    }

    #[test]
    fn table_get_set() {
        let mut table = sample_table();
        assert_eq!(table.groups(), 2);
        assert_eq!(table.get(CgNumber(0)).expect("cg0").nbfree, 100);
        assert_eq!(table.get(CgNumber(1)).expect("cg1").nifree, 60);

        let mut cg1 = table.get(CgNumber(1)).expect("cg1");
        cg1.nbfree -= 1;
        table.set(CgNumber(1), cg1).expect("set");
        assert_eq!(table.get(CgNumber(1)).expect("cg1").nbfree, 79);

        assert!(table.get(CgNumber(2)).is_err());
        assert!(table.set(CgNumber(2), Csum::default()).is_err());
    }

    #[test]
    fn table_preserves_padding() {
        let table = sample_table();
        assert_eq!(table.bytes()[1023], 0xEE);
        assert_eq!(table.written_span().expect("span").len(), 1024);
    }

    #[test]
    fn parse_rejects_undersized_regions() {
        let region = vec![0_u8; 16];
        // cssize smaller than ncg records
        assert!(CsumTable::parse(&region, 2, 16).is_err());
        // region smaller than cssize
        assert!(CsumTable::parse(&region, 1, 32).is_err());
    }
}

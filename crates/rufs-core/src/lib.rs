#![forbid(unsafe_code)]
//! Mount-session hypermetadata management.
//!
//! A [`Mount`] owns the in-memory superblock record and cylinder-group
//! summary table for one volume, loads and validates them at mount time,
//! tracks dirty state under a single lock shared with the allocation layer,
//! and coordinates write-back of both structures.
//!
//! The clean-bit rules: an unclean image forces the mount read-only; a
//! synchronization with the mark-clean option writes the clean flag only if
//! the filesystem was clean when mounted; and immediately after any
//! write-back of a clean superblock the in-core record flips back to dirty,
//! so the next write-back re-marks the disk before further mutation can be
//! lost.

use parking_lot::{Mutex, MutexGuard};
use rufs_block::{DiskImage, PAGE_SIZE, Protection, round_page};
use rufs_error::{HyperError, Result};
use rufs_ondisk::{
    CsumTable, DEV_BSIZE, FsRevision, MAXBSIZE, MAXSYMLINKLEN, SBOFF, SBSIZE,
    SUPERBLOCK_RECORD_SIZE, Superblock,
};
use rufs_types::{ByteOffset, ParseError};
use tracing::{debug, warn};

/// Label stamped into `fs_fsmnt` when the mount becomes writable.
const MOUNT_LABEL: &str = "rufs /";

// The mapping granularity must tile device sectors.
const _: () = assert!(PAGE_SIZE % DEV_BSIZE == 0);

/// Caller-selectable compatibility profile.
///
/// Governs which on-disk semantics the surrounding translator exposes. The
/// mount never lets the profile regress below what the image actually
/// uses: a 4.4 image requested in 4.2 mode is upgraded with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatMode {
    Bsd42,
    Bsd44,
}

/// Options supplied by the caller at mount time.
#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    pub read_only: bool,
    pub compat: CompatMode,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            compat: CompatMode::Bsd44,
        }
    }
}

/// Mutable hypermetadata shared with the allocation layer.
///
/// Reached through [`Mount::lock_state`]; the guard is the single
/// mutual-exclusion lock that also serializes allocation bookkeeping.
/// Collaborators that mutate `sblock` subfields or `csum` must call the
/// matching `mark_*_dirty` method before releasing the guard.
pub struct HyperState {
    pub sblock: Superblock,
    pub csum: CsumTable,
    sblock_dirty: bool,
    csum_dirty: bool,
    read_only: bool,
    clean_at_mount: bool,
    compat: CompatMode,
    zero_block: Vec<u8>,
}

impl HyperState {
    pub fn mark_sblock_dirty(&mut self) {
        self.sblock_dirty = true;
    }

    pub fn mark_csum_dirty(&mut self) {
        self.csum_dirty = true;
    }

    #[must_use]
    pub fn sblock_dirty(&self) -> bool {
        self.sblock_dirty
    }

    #[must_use]
    pub fn csum_dirty(&self) -> bool {
        self.csum_dirty
    }

    #[must_use]
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the filesystem was clean when this mount loaded it.
    /// Immutable for the life of the mount.
    #[must_use]
    pub fn clean_at_mount(&self) -> bool {
        self.clean_at_mount
    }

    #[must_use]
    pub fn compat(&self) -> CompatMode {
        self.compat
    }

    /// Zero-filled scratch buffer of exactly one filesystem block, for
    /// read-path helpers.
    #[must_use]
    pub fn zero_block(&self) -> &[u8] {
        &self.zero_block
    }
}

/// One mounted volume's hypermetadata session.
pub struct Mount {
    image: DiskImage,
    options: MountOptions,
    state: Mutex<HyperState>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Mount")
            .field("sblock", &state.sblock)
            .field("read_only", &state.read_only)
            .field("clean_at_mount", &state.clean_at_mount)
            .finish_non_exhaustive()
    }
}

impl Mount {
    /// Load, validate and normalize the hypermetadata, then bring the mount
    /// into its effective mode.
    ///
    /// An unclean image forces read-only regardless of the requested mode.
    /// A writable mount runs the writable-mode transition (label stamp,
    /// clean flip, immediate synchronization) before returning, so the disk
    /// is marked dirty the moment writes become possible.
    ///
    /// Any failure aborts the mount with the image exactly as found.
    pub fn open(image: DiskImage, options: MountOptions) -> Result<Self> {
        let mut state = load_hypermetadata(&image, &options)?;
        let writable = !state.read_only;

        // Mounts come up read-only and transition from there.
        state.read_only = true;
        image.protect(Protection::Read);

        let mount = Self {
            image,
            options,
            state: Mutex::new(state),
        };
        if writable {
            mount.on_mode_change(false)?;
        }
        Ok(mount)
    }

    /// Re-run the load path, replacing the superblock record, csum table
    /// and scratch block. The previous allocations are dropped only after
    /// the new state is fully populated.
    ///
    /// Mount-initialization-time only; the exclusive receiver keeps a
    /// reload from racing the mount's own mutation.
    pub fn reload(&mut self) -> Result<()> {
        let mut state = load_hypermetadata(&self.image, &self.options)?;
        let writable = !state.read_only;

        state.read_only = true;
        self.image.protect(Protection::Read);
        *self.state.get_mut() = state;

        if writable {
            self.on_mode_change(false)?;
        }
        Ok(())
    }

    /// Lock the shared hypermetadata state.
    pub fn lock_state(&self) -> MutexGuard<'_, HyperState> {
        self.state.lock()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.state.lock().read_only
    }

    #[must_use]
    pub fn compat(&self) -> CompatMode {
        self.state.lock().compat
    }

    /// The mapped device image backing this mount.
    #[must_use]
    pub fn image(&self) -> &DiskImage {
        &self.image
    }

    /// Write back dirty hypermetadata.
    ///
    /// `wait` asks for the device write to be flushed before returning
    /// (advisory; the device may be synchronous regardless). `clean`
    /// requests the clean-bit transition: allowed only when the filesystem
    /// was clean at mount time and the record currently shows dirty.
    ///
    /// The csum write is a read-modify-write of the page-aligned region
    /// containing the summary area, so bytes that share a device block with
    /// the table are never clobbered. An I/O failure there leaves the
    /// csum-dirty flag set for a later synchronization to retry.
    pub fn sync(&self, wait: bool, clean: bool) -> Result<()> {
        let csum_work = {
            let mut state = self.state.lock();

            let work = if state.csum_dirty {
                let plan = csum_write_plan(&state)?;
                state.csum_dirty = false;
                Some(plan)
            } else {
                None
            };

            if clean && state.clean_at_mount && !state.sblock.clean {
                state.sblock.clean = true;
                state.sblock_dirty = true;
            }

            work
        };

        let mut csum_result = Ok(());
        if let Some(plan) = csum_work {
            if let Err(err) = self.write_csum_region(&plan, wait) {
                warn!(
                    target: "rufs::hyper",
                    error = %err,
                    "csum write-back failed; will retry on next sync"
                );
                self.state.lock().csum_dirty = true;
                csum_result = Err(err);
            }
        }

        // A clean-bit flip must reach the device before we return.
        let sblock_result = self.writeback_superblock(wait);
        csum_result.and(sblock_result)
    }

    /// Write back the superblock if it is dirty.
    ///
    /// For pre-4.4 revisions the encoded copy carries sentinel values in
    /// place of the derived fields; the in-memory record is untouched.
    /// After every invocation, a writable mount whose record shows clean is
    /// flipped back to dirty in core without writing, so a clean flag only
    /// ever reaches the disk as the product of an explicit flush.
    pub fn writeback_superblock(&self, wait: bool) -> Result<()> {
        let pending = {
            let mut state = self.state.lock();

            let pending = if state.sblock_dirty {
                // A read-only mount never marks the superblock dirty; this
                // is the dirty-state machine being violated by a caller.
                assert!(
                    !state.read_only,
                    "dirty superblock on a read-only mount"
                );
                let bytes = state
                    .sblock
                    .encode()
                    .map_err(|err| HyperError::Parse(err.to_string()))?;
                state.sblock_dirty = false;
                debug!(
                    target: "rufs::hyper",
                    clean = state.sblock.clean,
                    revision = ?state.sblock.revision(),
                    "superblock write-back"
                );
                Some(bytes)
            } else {
                None
            };

            if !state.read_only && state.sblock.clean {
                state.sblock.clean = false;
                state.sblock_dirty = true;
            }

            pending
        };

        if let Some(bytes) = pending {
            let written = self
                .image
                .write_all_at(ByteOffset(SBOFF), &bytes)
                .and_then(|()| if wait { self.image.sync() } else { Ok(()) });
            if let Err(err) = written {
                self.state.lock().sblock_dirty = true;
                return Err(err);
            }
        }
        Ok(())
    }

    /// React to the mount toggling between read-only and writable.
    ///
    /// Always adjusts the image protection over the full device extent.
    /// Going read-only, the superblock is treated as already synchronized:
    /// the dirty flag is cleared without writing, leaving the last written
    /// state as final. Going writable, the mount label is stamped, the
    /// clean bit transitions (or an unclean warning is surfaced), and a
    /// synchronization runs immediately.
    pub fn on_mode_change(&self, read_only: bool) -> Result<()> {
        self.image.protect(if read_only {
            Protection::Read
        } else {
            Protection::ReadWrite
        });

        {
            let mut state = self.state.lock();
            state.read_only = read_only;

            if read_only {
                state.sblock_dirty = false;
                return Ok(());
            }

            state.sblock.fsmnt = MOUNT_LABEL.to_owned();
            if state.sblock.clean {
                state.sblock.clean = false;
            } else {
                warn!(
                    target: "rufs::hyper",
                    "unclean filesystem now writable"
                );
            }
            state.sblock_dirty = true;
        }

        self.sync(true, false)
    }

    fn write_csum_region(&self, plan: &CsumWritePlan, wait: bool) -> Result<()> {
        let mut buf = vec![0_u8; plan.region_len];
        self.image.read_exact_at(plan.addr, &mut buf)?;
        buf[..plan.span.len()].copy_from_slice(&plan.span);
        self.image.write_all_at(plan.addr, &buf)?;
        if wait {
            self.image.sync()?;
        }
        Ok(())
    }
}

/// Snapshot of everything a csum write-back needs, taken under the lock so
/// the device I/O can run outside it.
struct CsumWritePlan {
    addr: ByteOffset,
    span: Vec<u8>,
    region_len: usize,
}

fn csum_write_plan(state: &HyperState) -> Result<CsumWritePlan> {
    let to_parse_err = |err: ParseError| HyperError::Parse(err.to_string());

    let addr = state.sblock.csum_byte_addr().map_err(to_parse_err)?;
    let frag_len = state.sblock.csum_region_len().map_err(to_parse_err)?;
    let region_len = round_page(frag_len as u64)
        .and_then(|len| usize::try_from(len).ok())
        .ok_or_else(|| HyperError::Parse("csum region length overflow".to_owned()))?;
    let span = state.csum.written_span().map_err(to_parse_err)?.to_vec();

    Ok(CsumWritePlan {
        addr,
        span,
        region_len,
    })
}

/// Run the load path: read and validate the superblock, normalize for the
/// image's revision, load the csum table, and check device capacity.
///
/// Each validation failure is a distinct fatal error; nothing is written.
fn load_hypermetadata(image: &DiskImage, options: &MountOptions) -> Result<HyperState> {
    let mut region = vec![0_u8; SBSIZE];
    image.read_guarded(ByteOffset(SBOFF), &mut region)?;

    let mut sblock = Superblock::parse(&region).map_err(|err| match err {
        ParseError::InvalidMagic { actual, .. } => HyperError::BadMagic {
            actual: u32::try_from(actual).unwrap_or(u32::MAX),
            expected: rufs_ondisk::FS_MAGIC,
        },
        other => HyperError::Parse(other.to_string()),
    })?;

    sblock
        .validate()
        .map_err(|err| validation_error(&sblock, &err))?;
    check_alignment(&sblock)?;

    // Examine the clean bit and force read-only if unclean.
    let clean_at_mount = sblock.clean;
    let mut read_only = options.read_only;
    if !clean_at_mount {
        warn!(
            target: "rufs::hyper",
            "filesystem was not unmounted cleanly; please fsck"
        );
        if !read_only {
            read_only = true;
            warn!(
                target: "rufs::hyper",
                "mounted read-only; request writable mode again after repair"
            );
        }
    }

    sblock.normalize();

    // If the image has newer features in it, don't pay attention to the
    // caller's request not to use them.
    let mut compat = options.compat;
    if (sblock.revision() == FsRevision::Bsd44 || sblock.direct_symlink_extension())
        && compat == CompatMode::Bsd42
    {
        compat = CompatMode::Bsd44;
        warn!(
            target: "rufs::hyper",
            "4.2 compat mode requested on a 4.4 filesystem; switched to 4.4 mode"
        );
    }

    let csum = load_csum(image, &sblock)?;

    let needed_bytes = sblock
        .size_bytes()
        .map_err(|err| HyperError::Parse(err.to_string()))?;
    if image.len_bytes() < needed_bytes {
        return Err(HyperError::CapacityShortfall {
            device_bytes: image.len_bytes(),
            needed_bytes,
        });
    }

    let zero_block = vec![
        0_u8;
        sblock
            .block_len()
            .map_err(|err| HyperError::Parse(err.to_string()))?
    ];

    debug!(
        target: "rufs::hyper",
        bsize = sblock.bsize,
        fsize = sblock.fsize,
        ncg = sblock.ncg,
        revision = ?sblock.revision(),
        clean = clean_at_mount,
        read_only,
        "hypermetadata loaded"
    );

    Ok(HyperState {
        sblock,
        csum,
        sblock_dirty: false,
        csum_dirty: false,
        read_only,
        clean_at_mount,
        compat,
        zero_block,
    })
}

fn load_csum(image: &DiskImage, sblock: &Superblock) -> Result<CsumTable> {
    let to_parse_err = |err: ParseError| HyperError::Parse(err.to_string());

    let addr = sblock.csum_byte_addr().map_err(to_parse_err)?;
    let len = sblock.csum_region_len().map_err(to_parse_err)?;

    let mut region = vec![0_u8; len];
    image.read_guarded(addr, &mut region)?;

    CsumTable::parse(&region, sblock.ncg, sblock.cssize).map_err(to_parse_err)
}

fn check_alignment(sblock: &Superblock) -> Result<()> {
    let bsize = sblock.bsize;
    if bsize % i32::try_from(DEV_BSIZE).unwrap_or(i32::MAX) != 0 {
        return Err(HyperError::Misaligned(format!(
            "block size {bsize} is not a multiple of the {DEV_BSIZE}-byte device sector"
        )));
    }
    if i64::from(bsize) < i64::from(PAGE_SIZE) {
        return Err(HyperError::Misaligned(format!(
            "block size {bsize} is below the {PAGE_SIZE}-byte mapping granularity"
        )));
    }
    Ok(())
}

fn validation_error(sblock: &Superblock, err: &ParseError) -> HyperError {
    match err {
        ParseError::InvalidField {
            field: "fs_bsize",
            reason: "exceeds the largest supported block size",
        } => HyperError::BlockSizeTooLarge {
            bsize: sblock.bsize,
            max: MAXBSIZE,
        },
        ParseError::InvalidField {
            field: "fs_bsize", ..
        } => HyperError::BlockSizeTooSmall {
            bsize: sblock.bsize,
            min: SUPERBLOCK_RECORD_SIZE,
        },
        ParseError::InvalidField {
            field: "fs_maxsymlinklen",
            ..
        } => HyperError::SymlinkLenTooLarge {
            len: sblock.maxsymlinklen,
            max: MAXSYMLINKLEN,
        },
        other => HyperError::Parse(other.to_string()),
    }
}

#![deny(unsafe_code)]
//! File extent queries and the deallocate/reallocate primitives.
//!
//! - [`ExtentSource`]: two-phase extent query (count, then fill). Zero extents
//!   is a distinct signal meaning "device file, no block mapping".
//! - [`SpaceOps`]: hole-punch then re-allocate a byte range of an open file,
//!   giving it fresh physical backing.
//!
//! [`FiemapSource`] and [`Fallocate`] implement both on Linux.

#[allow(unsafe_code)]
mod fiemap;

use std::fs::{self, File};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use nix::fcntl::{self, FallocateFlags};
use pmbb_error::{PmbbError, Result};
use pmbb_types::{Extent, ExtentList};
use tracing::{debug, trace};

use crate::fiemap::{FIEMAP_EXTENT_LAST, FiemapBatch};

// ── Extent query ────────────────────────────────────────────────────────────

/// The platform's file extent query interface.
pub trait ExtentSource {
    /// Number of mapped extents; `0` for device files.
    fn extent_count(&self, path: &Path) -> Result<usize>;

    /// The extents themselves, at most `count` of them, plus the file's
    /// allocation block size.
    fn extents(&self, path: &Path, count: usize) -> Result<ExtentList>;
}

/// Extent query through `FS_IOC_FIEMAP`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FiemapSource;

fn stat_for(what: &'static str, path: &Path) -> Result<fs::Metadata> {
    fs::metadata(path)
        .map_err(|err| PmbbError::query(what, format!("stat {}: {err}", path.display())))
}

fn open_for(what: &'static str, path: &Path) -> Result<File> {
    File::open(path)
        .map_err(|err| PmbbError::query(what, format!("open {}: {err}", path.display())))
}

impl ExtentSource for FiemapSource {
    fn extent_count(&self, path: &Path) -> Result<usize> {
        let meta = stat_for("extent count", path)?;
        if meta.file_type().is_char_device() || meta.len() == 0 {
            debug!(target: "pmbb::extent", path = %path.display(), "no_extents");
            return Ok(0);
        }
        let file = open_for("extent count", path)?;
        let mapped = fiemap::mapped_extent_count(&file, 0, meta.len()).map_err(|errno| {
            PmbbError::query("extent count", format!("FIEMAP {}: {errno}", path.display()))
        })?;
        let count = usize::try_from(mapped)
            .map_err(|_| PmbbError::query("extent count", format!("{mapped} extents")))?;
        debug!(target: "pmbb::extent", path = %path.display(), count, "extent_count");
        Ok(count)
    }

    fn extents(&self, path: &Path, count: usize) -> Result<ExtentList> {
        let meta = stat_for("extent list", path)?;
        let blksize = meta.blksize();
        if !blksize.is_power_of_two() {
            return Err(PmbbError::query(
                "extent list",
                format!("block size {blksize} is not a power of two"),
            ));
        }

        let mut extents: Vec<Extent> = Vec::new();
        extents
            .try_reserve_exact(count)
            .map_err(|_| PmbbError::AllocationFailed {
                what: "extent list",
                requested: count,
            })?;
        if count == 0 || meta.file_type().is_char_device() {
            return Ok(ExtentList { blksize, extents });
        }

        let file = open_for("extent list", path)?;
        let size = meta.len();
        let mut batch = FiemapBatch::default();
        let mut start = 0_u64;

        'fetch: while extents.len() < count && start < size {
            let fetched = fiemap::fetch_batch(&file, start, size - start, &mut batch)
                .map_err(|errno| {
                    PmbbError::query("extent list", format!("FIEMAP {}: {errno}", path.display()))
                })?;
            let Some(last) = fetched.last() else {
                break;
            };
            let next = last.fe_logical.saturating_add(last.fe_length);

            for fe in fetched {
                extents.push(Extent {
                    offset_physical: fe.fe_physical,
                    offset_logical: fe.fe_logical,
                    length: fe.fe_length,
                });
                trace!(
                    target: "pmbb::extent",
                    physical = fe.fe_physical,
                    logical = fe.fe_logical,
                    length = fe.fe_length,
                    "extent"
                );
                if extents.len() == count || fe.fe_flags & FIEMAP_EXTENT_LAST != 0 {
                    break 'fetch;
                }
            }
            if next <= start {
                break;
            }
            start = next;
        }

        debug!(
            target: "pmbb::extent",
            path = %path.display(),
            requested = count,
            fetched = extents.len(),
            blksize,
            "extents_fetched"
        );
        Ok(ExtentList { blksize, extents })
    }
}

// ── Deallocate / reallocate ─────────────────────────────────────────────────

/// Kernel-level space management on an open regular file.
pub trait SpaceOps {
    /// Release the physical backing of the range; file size is unchanged.
    fn deallocate(&self, file: &File, offset: u64, length: u64) -> Result<()>;

    /// Give the range fresh physical backing; file size is unchanged.
    fn reallocate(&self, file: &File, offset: u64, length: u64) -> Result<()>;
}

/// [`SpaceOps`] through `fallocate(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fallocate;

impl SpaceOps for Fallocate {
    fn deallocate(&self, file: &File, offset: u64, length: u64) -> Result<()> {
        fallocate(
            file,
            "deallocate",
            FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
            offset,
            length,
        )
    }

    fn reallocate(&self, file: &File, offset: u64, length: u64) -> Result<()> {
        fallocate(
            file,
            "reallocate",
            FallocateFlags::FALLOC_FL_KEEP_SIZE,
            offset,
            length,
        )
    }
}

fn fallocate(
    file: &File,
    op: &'static str,
    flags: FallocateFlags,
    offset: u64,
    length: u64,
) -> Result<()> {
    let failed = |source: io::Error| PmbbError::IoFailed {
        op,
        offset,
        length,
        source,
    };
    let off = nix::libc::off_t::try_from(offset)
        .map_err(|_| failed(io::Error::from(io::ErrorKind::InvalidInput)))?;
    let len = nix::libc::off_t::try_from(length)
        .map_err(|_| failed(io::Error::from(io::ErrorKind::InvalidInput)))?;
    fcntl::fallocate(file.as_raw_fd(), flags, off, len)
        .map_err(|errno| failed(io::Error::from(errno)))?;
    trace!(target: "pmbb::extent", op, offset, length, "fallocate_done");
    Ok(())
}

//! `FS_IOC_FIEMAP` request layouts (`<linux/fiemap.h>`).
//!
//! The request number encodes only the 32-byte header; the kernel writes up
//! to `fm_extent_count` extents into the array that follows it.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::ptr;

/// Set on the last extent of the file.
pub(crate) const FIEMAP_EXTENT_LAST: u32 = 0x1;

/// Extents fetched per ioctl.
pub(crate) const BATCH: usize = 32;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FiemapHeader {
    pub fm_start: u64,
    pub fm_length: u64,
    pub fm_flags: u32,
    pub fm_mapped_extents: u32,
    pub fm_extent_count: u32,
    pub fm_reserved: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FiemapExtent {
    pub fe_logical: u64,
    pub fe_physical: u64,
    pub fe_length: u64,
    pub fe_reserved64: [u64; 2],
    pub fe_flags: u32,
    pub fe_reserved: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FiemapBatch {
    header: FiemapHeader,
    extents: [FiemapExtent; BATCH],
}

nix::ioctl_readwrite!(fs_ioc_fiemap, b'f', 11, FiemapHeader);

/// Count-only request: how many extents map `[start, start + length)`.
pub(crate) fn mapped_extent_count(file: &File, start: u64, length: u64) -> nix::Result<u32> {
    let mut header = FiemapHeader {
        fm_start: start,
        fm_length: length,
        ..FiemapHeader::default()
    };
    // SAFETY: with `fm_extent_count == 0` the kernel writes the header only,
    // and `header` is an exclusively borrowed `#[repr(C)]` value.
    unsafe { fs_ioc_fiemap(file.as_raw_fd(), &mut header) }?;
    Ok(header.fm_mapped_extents)
}

/// Fetch up to [`BATCH`] extents starting at logical byte `start`.
pub(crate) fn fetch_batch<'b>(
    file: &File,
    start: u64,
    length: u64,
    batch: &'b mut FiemapBatch,
) -> nix::Result<&'b [FiemapExtent]> {
    batch.header = FiemapHeader {
        fm_start: start,
        fm_length: length,
        fm_extent_count: BATCH as u32,
        ..FiemapHeader::default()
    };
    // SAFETY: `FiemapBatch` is `#[repr(C)]` with the header first, followed
    // by exactly `fm_extent_count` extent slots the kernel may fill.
    unsafe { fs_ioc_fiemap(file.as_raw_fd(), ptr::from_mut(batch).cast()) }?;
    let mapped = (batch.header.fm_mapped_extents as usize).min(BATCH);
    Ok(&batch.extents[..mapped])
}

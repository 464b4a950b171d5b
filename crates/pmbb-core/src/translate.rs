//! Namespace-relative defects → file-relative, block-aligned bad blocks.
//!
//! Each `(defect, extent)` pair whose physical ranges overlap yields one
//! output record. The overlap is moved into the logical frame, widened down
//! to a block boundary, and its length rounded up to whole blocks. Widening
//! never drops a byte of the overlap. Outputs are not merged.

use std::path::Path;

use pmbb_error::{PmbbError, Result};
use pmbb_types::{BadBlock, BadBlockSet, Extent, ExtentList, align_up, overlap};
use tracing::{debug, trace, warn};

use crate::Platform;
use crate::collect::collect_for_path;
use crate::records::push_record;

/// Bad blocks of the file at `path`, in file-relative bytes.
///
/// A defect-free namespace returns before the extent interface is touched.
/// A file with no extents (device-DAX) gets its namespace defects verbatim.
pub fn translate(platform: &Platform<'_>, path: &Path) -> Result<BadBlockSet> {
    let defects = collect_for_path(platform.ndctl, path)?;
    if defects.is_empty() {
        debug!(target: "pmbb::translate", path = %path.display(), "no_defects");
        return Ok(BadBlockSet::empty());
    }

    let count = platform
        .extents
        .extent_count(path)
        .inspect_err(|err| warn!(target: "pmbb::translate", error = %err, "extent_count_failed"))?;
    if count == 0 {
        debug!(
            target: "pmbb::translate",
            path = %path.display(),
            count = defects.count(),
            "device_file_defects"
        );
        return Ok(defects);
    }

    let list = platform
        .extents
        .extents(path, count)
        .inspect_err(|err| warn!(target: "pmbb::translate", error = %err, "extents_failed"))?;
    let records = map_through_extents(defects.records(), &list)?;
    debug!(
        target: "pmbb::translate",
        path = %path.display(),
        defects = defects.count(),
        extents = list.len(),
        blksize = list.blksize,
        found = records.len(),
        "translated"
    );
    Ok(BadBlockSet::new(defects.ns_resource(), records))
}

/// Map every defect through every extent it overlaps.
pub fn map_through_extents(defects: &[BadBlock], list: &ExtentList) -> Result<Vec<BadBlock>> {
    if !list.blksize.is_power_of_two() {
        return Err(PmbbError::query(
            "extent list",
            format!("block size {} is not a power of two", list.blksize),
        ));
    }

    let mut records = Vec::new();
    let mut overlaps = 0_usize;
    for defect in defects {
        let Some(bb_end) = defect.last_byte() else {
            continue;
        };
        for extent in &list.extents {
            let Some(ext_end) = extent.physical_last() else {
                continue;
            };
            // each extent sees the whole defect, not what earlier extents left
            let Some((beg, end)) =
                overlap((defect.offset, bb_end), (extent.offset_physical, ext_end))
            else {
                continue;
            };
            overlaps += 1;
            let record = translate_overlap(beg, end, extent, list.blksize)?;
            push_record(&mut records, "translated bad blocks", record)?;
        }
    }

    debug_assert_eq!(overlaps, records.len(), "overlap count drifted from output");
    if overlaps != records.len() {
        return Err(PmbbError::Inconsistent {
            detail: format!("{overlaps} overlaps but {} records", records.len()),
        });
    }
    Ok(records)
}

/// Translate the physical overlap `[beg, end]` inside `extent` into an
/// aligned logical record. `blksize` must be a power of two.
pub fn translate_overlap(beg: u64, end: u64, extent: &Extent, blksize: u64) -> Result<BadBlock> {
    let overflow = || {
        PmbbError::query(
            "extent list",
            format!(
                "overlap {beg}..={end} does not fit extent at logical {}",
                extent.offset_logical
            ),
        )
    };

    let logical = (beg - extent.offset_physical)
        .checked_add(extent.offset_logical)
        .ok_or_else(overflow)?;
    let misalignment = logical & (blksize - 1);
    let offset = logical - misalignment;
    let length = (end - beg + 1)
        .checked_add(misalignment)
        .and_then(|len| align_up(len, blksize))
        .ok_or_else(overflow)?;
    let length = u32::try_from(length).map_err(|_| {
        PmbbError::query(
            "extent list",
            format!("translated record at {offset} is {length} bytes"),
        )
    })?;

    trace!(
        target: "pmbb::translate",
        physical = beg,
        physical_len = end - beg + 1,
        offset,
        length,
        "bad_block_found"
    );
    Ok(BadBlock::new(offset, length))
}

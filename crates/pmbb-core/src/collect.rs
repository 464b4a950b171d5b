//! Defect collection: raw sector records → namespace-relative byte ranges.
//!
//! Filesystem-DAX namespaces expose their own defect list through the block
//! device, already namespace-relative and readable without privilege. Every
//! other mode goes through the region-wide list, which is region-relative,
//! needs privilege, and has to be clipped to the namespace window.

use std::path::Path;

use pmbb_error::{PmbbError, Result};
use pmbb_ndctl::{Namespace, NdctlCtx, Region};
use pmbb_types::{
    BadBlock, BadBlockSet, NamespaceBounds, NamespaceMode, RawBadBlock, inclusive_end, overlap,
    sectors_to_bytes,
};
use tracing::{debug, trace, warn};

use crate::bounds::resolve_bounds;
use crate::locate::locate;
use crate::records::push_record;

/// Namespace-relative defects of `namespace`, least-privileged query first.
pub fn collect(region: &Region, namespace: &Namespace) -> Result<BadBlockSet> {
    let set = if namespace.mode() == NamespaceMode::Fsdax {
        collect_by_namespace(namespace)
    } else {
        collect_by_region(region, namespace)
    }
    .inspect_err(|err| {
        warn!(
            target: "pmbb::collect",
            region = region.name(),
            namespace = namespace.name(),
            error = %err,
            "collect_failed"
        );
    })?;

    debug!(
        target: "pmbb::collect",
        region = region.name(),
        namespace = namespace.name(),
        mode = %namespace.mode(),
        count = set.count(),
        ns_resource = set.ns_resource(),
        "collected"
    );
    Ok(set)
}

/// Defects of the namespace `path` lives on. Empty when the path is on no
/// recognized namespace.
pub fn collect_for_path(ndctl: &dyn NdctlCtx, path: &Path) -> Result<BadBlockSet> {
    let placement = locate(ndctl, path)?;
    match (&placement.region, &placement.namespace) {
        (Some(region), Some(namespace)) => collect(region, namespace),
        _ => {
            debug!(target: "pmbb::collect", path = %path.display(), "not_on_namespace");
            Ok(BadBlockSet::empty())
        }
    }
}

fn collect_by_namespace(namespace: &Namespace) -> Result<BadBlockSet> {
    let raw = namespace.badblocks()?;
    let records = sectors_to_namespace(&raw)?;
    Ok(BadBlockSet::new(0, records))
}

fn collect_by_region(region: &Region, namespace: &Namespace) -> Result<BadBlockSet> {
    let bounds = resolve_bounds(region, namespace)?;
    let raw = region.badblocks()?;
    let records = clip_to_namespace(&raw, bounds)?;
    let ns_resource = region
        .resource()
        .and_then(|resource| resource.checked_add(bounds.offset))
        .ok_or_else(|| PmbbError::BoundsUnavailable {
            object: region.name().to_owned(),
            attribute: "resource",
        })?;
    Ok(BadBlockSet::new(ns_resource, records))
}

/// Namespace-scoped records: sectors → bytes, nothing to clip.
pub fn sectors_to_namespace(raw: &[RawBadBlock]) -> Result<Vec<BadBlock>> {
    let mut records = Vec::new();
    for bb in raw {
        if bb.len == 0 {
            trace!(target: "pmbb::collect", sector = bb.offset, "namespace_bad_block_skipped");
            continue;
        }
        let offset = raw_offset(bb)?;
        let length = u32::try_from(u64::from(bb.len) * pmbb_types::SECTOR_SIZE).map_err(|_| {
            PmbbError::query(
                "namespace badblocks",
                format!("record at sector {} is {} sectors long", bb.offset, bb.len),
            )
        })?;
        trace!(target: "pmbb::collect", offset, length, "namespace_bad_block");
        push_record(&mut records, "namespace bad blocks", BadBlock::new(offset, length))?;
    }
    Ok(records)
}

/// Region-scoped records: keep the ones overlapping `bounds`, clip each to
/// the window, and rebase onto the window start. Overlapping or adjacent
/// input records stay distinct.
pub fn clip_to_namespace(raw: &[RawBadBlock], bounds: NamespaceBounds) -> Result<Vec<BadBlock>> {
    let mut records = Vec::new();
    let Some(ns_end) = bounds.last_byte() else {
        return Ok(records);
    };
    let ns_beg = bounds.offset;

    for bb in raw {
        let bb_beg = raw_offset(bb)?;
        let Some(bb_end) = inclusive_end(bb_beg, u64::from(bb.len) * pmbb_types::SECTOR_SIZE)
        else {
            trace!(target: "pmbb::collect", sector = bb.offset, len = bb.len, "region_bad_block_skipped");
            continue;
        };
        let Some((beg, end)) = overlap((bb_beg, bb_end), (ns_beg, ns_end)) else {
            continue;
        };
        let length = u32::try_from(end - beg + 1).map_err(|_| {
            PmbbError::query(
                "region badblocks",
                format!("clipped record {beg}..={end} exceeds u32 bytes"),
            )
        })?;
        trace!(
            target: "pmbb::collect",
            region_begin = bb_beg,
            region_end = bb_end,
            offset = beg - ns_beg,
            length,
            "region_bad_block"
        );
        push_record(&mut records, "region bad blocks", BadBlock::new(beg - ns_beg, length))?;
    }
    Ok(records)
}

fn raw_offset(bb: &RawBadBlock) -> Result<u64> {
    sectors_to_bytes(bb.offset).ok_or_else(|| {
        PmbbError::query("badblocks", format!("sector offset {} overflows", bb.offset))
    })
}

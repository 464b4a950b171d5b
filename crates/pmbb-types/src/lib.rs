#![forbid(unsafe_code)]
//! Data model for persistent-memory bad blocks.
//!
//! Offsets live in one of three coordinate frames: region-relative,
//! namespace-relative, and file-relative. A [`BadBlock`] carries no frame tag
//! of its own; the frame is fixed by the stage that produced the
//! [`BadBlockSet`] holding it (namespace-relative out of the collector,
//! file-relative out of the translator).

use serde::{Deserialize, Serialize};
use std::fmt;

// ── Sectors ─────────────────────────────────────────────────────────────────

/// Raw defect records are addressed in 512-byte sectors.
pub const SECTOR_SIZE: u64 = 512;

/// Healthy replica count meaning "unknown".
pub const NO_HEALTHY_REPLICA: i32 = -1;

/// Convert a sector count to bytes, `None` on overflow.
#[must_use]
pub fn sectors_to_bytes(sectors: u64) -> Option<u64> {
    sectors.checked_mul(SECTOR_SIZE)
}

/// Convert bytes to whole sectors (truncating). Used for diagnostics only.
#[must_use]
pub const fn bytes_to_sectors(bytes: u64) -> u64 {
    bytes / SECTOR_SIZE
}

/// A defect record as the platform reports it: offset and length in sectors.
///
/// The offset is region-relative for the region-scoped query and
/// namespace-relative for the namespace-scoped query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBadBlock {
    pub offset: u64,
    pub len: u32,
}

// ── Bad blocks ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadBlock {
    /// Byte offset in the frame of the owning set.
    pub offset: u64,
    /// Length in bytes.
    pub length: u32,
    /// Healthy replicas on mirrored media; [`NO_HEALTHY_REPLICA`] if unknown.
    pub healthy_replica_count: i32,
}

impl BadBlock {
    /// A bad block with an unknown healthy replica count.
    #[must_use]
    pub const fn new(offset: u64, length: u32) -> Self {
        Self {
            offset,
            length,
            healthy_replica_count: NO_HEALTHY_REPLICA,
        }
    }

    /// Inclusive last byte covered, `None` for zero-length records.
    #[must_use]
    pub fn last_byte(&self) -> Option<u64> {
        inclusive_end(self.offset, u64::from(self.length))
    }
}

impl fmt::Display for BadBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "offset {} length {}", self.offset, self.length)
    }
}

/// An ordered list of bad blocks plus the namespace resource they belong to.
///
/// Order is discovery order. An empty set always has `ns_resource == 0`; it
/// is a valid "no defects" result, never an error marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadBlockSet {
    ns_resource: u64,
    records: Vec<BadBlock>,
}

impl BadBlockSet {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a set. The resource is dropped when `records` is empty.
    #[must_use]
    pub fn new(ns_resource: u64, records: Vec<BadBlock>) -> Self {
        let ns_resource = if records.is_empty() { 0 } else { ns_resource };
        Self {
            ns_resource,
            records,
        }
    }

    /// Absolute resource offset of the namespace. Only device-mapped
    /// remediation uses it, to turn namespace offsets into bus addresses.
    #[must_use]
    pub fn ns_resource(&self) -> u64 {
        self.ns_resource
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn records(&self) -> &[BadBlock] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, BadBlock> {
        self.records.iter()
    }

    #[must_use]
    pub fn into_records(self) -> Vec<BadBlock> {
        self.records
    }
}

impl<'a> IntoIterator for &'a BadBlockSet {
    type Item = &'a BadBlock;
    type IntoIter = std::slice::Iter<'a, BadBlock>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

// ── Extents ─────────────────────────────────────────────────────────────────

/// One contiguous run of file bytes, identically laid out in both frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub offset_physical: u64,
    pub offset_logical: u64,
    pub length: u64,
}

impl Extent {
    /// Inclusive last physical byte, `None` for empty extents.
    #[must_use]
    pub fn physical_last(&self) -> Option<u64> {
        inclusive_end(self.offset_physical, self.length)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentList {
    /// Allocation block size in bytes, a power of two.
    pub blksize: u64,
    pub extents: Vec<Extent>,
}

impl ExtentList {
    #[must_use]
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }
}

// ── Namespaces ──────────────────────────────────────────────────────────────

/// Namespace window, relative to the start of its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceBounds {
    pub offset: u64,
    pub size: u64,
}

impl NamespaceBounds {
    /// Inclusive last byte of the window, `None` for an empty namespace.
    #[must_use]
    pub fn last_byte(&self) -> Option<u64> {
        inclusive_end(self.offset, self.size)
    }
}

/// Operating mode of a namespace as the platform names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceMode {
    Raw,
    Sector,
    Fsdax,
    Devdax,
    Unknown,
}

impl NamespaceMode {
    /// Parse a mode string, accepting the legacy `memory` and `dax` aliases.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "raw" => Self::Raw,
            "sector" | "safe" => Self::Sector,
            "fsdax" | "memory" => Self::Fsdax,
            "devdax" | "dax" => Self::Devdax,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Sector => "sector",
            Self::Fsdax => "fsdax",
            Self::Devdax => "devdax",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NamespaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which device carries a namespace's resource and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceKind {
    PfnMapped,
    DeviceDax,
    RawOrBtt,
}

impl NamespaceKind {
    #[must_use]
    pub const fn from_mode(mode: NamespaceMode) -> Self {
        match mode {
            NamespaceMode::Fsdax => Self::PfnMapped,
            NamespaceMode::Devdax => Self::DeviceDax,
            NamespaceMode::Raw | NamespaceMode::Sector | NamespaceMode::Unknown => Self::RawOrBtt,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::PfnMapped => "pfn",
            Self::DeviceDax => "dax",
            Self::RawOrBtt => "raw/btt",
        }
    }
}

/// Media type of a file, as far as remediation is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    /// A regular file on a (possibly DAX-mounted) filesystem.
    Regular,
    /// A device-DAX character device.
    DevDax,
}

// ── Interval helpers ────────────────────────────────────────────────────────

/// Inclusive end of `[start, start + len)`, `None` when `len == 0` or the
/// range wraps.
#[must_use]
pub fn inclusive_end(start: u64, len: u64) -> Option<u64> {
    len.checked_sub(1).and_then(|tail| start.checked_add(tail))
}

/// Intersection of two inclusive intervals.
#[must_use]
pub fn overlap(a: (u64, u64), b: (u64, u64)) -> Option<(u64, u64)> {
    if a.0 > b.1 || b.0 > a.1 {
        return None;
    }
    Some((a.0.max(b.0), a.1.min(b.1)))
}

/// Round `value` down to a multiple of `align` (a power of two).
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Round `value` up to a multiple of `align` (a power of two), `None` on
/// overflow.
#[must_use]
pub fn align_up(value: u64, align: u64) -> Option<u64> {
    value
        .checked_add(align - 1)
        .map(|bumped| align_down(bumped, align))
}

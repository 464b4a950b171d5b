#![forbid(unsafe_code)]
//! Persistent-memory bad block engine.
//!
//! Defects flow through four stages, each owning its output and handing it
//! to the next:
//!
//! - **bounds**: [`bounds::resolve_bounds`]: namespace window in its region.
//! - **collect**: [`collect::collect`]: namespace-relative defects, through
//!   the least-privileged query the namespace mode allows.
//! - **translate**: [`translate::translate`]: file-relative, block-aligned
//!   bad blocks through the file's extent map.
//! - **remediate**: [`remediate::clear`]: bus scrub + clear for device-DAX,
//!   deallocate + reallocate for regular files.
//!
//! All public offsets and lengths are bytes, file-relative. Operations are
//! synchronous and keep no state between calls.

pub mod bounds;
pub mod collect;
pub mod locate;
mod records;
pub mod remediate;
pub mod translate;

use std::path::Path;

use pmbb_error::Result;
use pmbb_extent::{ExtentSource, Fallocate, FiemapSource, SpaceOps};
use pmbb_ndctl::{NdctlCtx, SysfsConfig, SysfsCtx};
use pmbb_types::{BadBlockSet, NamespaceBounds, NamespaceKind, NamespaceMode};
use serde::Serialize;
use tracing::debug;

pub use pmbb_error::PmbbError;

// ── Platform ────────────────────────────────────────────────────────────────

/// The three platform seams the engine runs against.
#[derive(Clone, Copy)]
pub struct Platform<'a> {
    pub ndctl: &'a dyn NdctlCtx,
    pub extents: &'a dyn ExtentSource,
    pub space: &'a dyn SpaceOps,
}

/// Linux sysfs topology, FIEMAP extents, and `fallocate(2)`.
#[derive(Debug, Clone, Default)]
pub struct LinuxPlatform {
    ndctl: SysfsCtx,
    extents: FiemapSource,
    space: Fallocate,
}

impl LinuxPlatform {
    #[must_use]
    pub fn new(config: SysfsConfig) -> Self {
        Self {
            ndctl: SysfsCtx::new(config),
            extents: FiemapSource,
            space: Fallocate,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SysfsConfig {
        self.ndctl.config()
    }

    #[must_use]
    pub fn platform(&self) -> Platform<'_> {
        Platform {
            ndctl: &self.ndctl,
            extents: &self.extents,
            space: &self.space,
        }
    }
}

// ── Public surface ──────────────────────────────────────────────────────────

/// File-relative bad blocks of `path`. Empty when the path is on no
/// namespace or the namespace reports no defects.
pub fn get_badblocks(platform: &Platform<'_>, path: &Path) -> Result<BadBlockSet> {
    translate::translate(platform, path)
}

/// Number of bad blocks in `path`, `-1` on any error.
#[must_use]
pub fn count_badblocks(platform: &Platform<'_>, path: &Path) -> i64 {
    match get_badblocks(platform, path) {
        Ok(set) => i64::try_from(set.count()).unwrap_or(i64::MAX),
        Err(err) => {
            debug!(target: "pmbb::translate", path = %path.display(), error = %err, "count_failed");
            -1
        }
    }
}

/// Clear `targets`, or everything currently reported for `path`.
pub fn clear_badblocks(
    platform: &Platform<'_>,
    path: &Path,
    targets: Option<&BadBlockSet>,
) -> Result<()> {
    remediate::clear(platform, path, targets)
}

pub fn clear_all_badblocks(platform: &Platform<'_>, path: &Path) -> Result<()> {
    remediate::clear(platform, path, None)
}

/// Where a file lives and the namespace window around it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceReport {
    pub region: String,
    pub namespace: String,
    pub mode: NamespaceMode,
    pub kind: NamespaceKind,
    pub bounds: NamespaceBounds,
}

/// `None` when `path` is not on a recognized namespace.
pub fn namespace_report(platform: &Platform<'_>, path: &Path) -> Result<Option<NamespaceReport>> {
    let placement = locate::locate(platform.ndctl, path)?;
    let (Some(region), Some(namespace)) = (placement.region, placement.namespace) else {
        return Ok(None);
    };
    let bounds = bounds::resolve_bounds(&region, &namespace)?;
    Ok(Some(NamespaceReport {
        region: region.name().to_owned(),
        namespace: namespace.name().to_owned(),
        mode: namespace.mode(),
        kind: namespace.kind(),
        bounds,
    }))
}

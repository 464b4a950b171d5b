//! File → region/namespace/bus resolution.

use std::path::Path;

use pmbb_error::{PmbbError, Result};
use pmbb_ndctl::{Bus, NdctlCtx, Placement};
use tracing::debug;

/// Where `path` lives. A path on no namespace is a value, not an error.
pub fn locate(ndctl: &dyn NdctlCtx, path: &Path) -> Result<Placement> {
    let placement = ndctl.locate(path)?;
    debug!(
        target: "pmbb::collect",
        path = %path.display(),
        region = placement.region.as_ref().map(|r| r.name()),
        namespace = placement.namespace.as_ref().map(|ns| ns.name()),
        "located"
    );
    Ok(placement)
}

/// The bus owning `path`'s region. Unlike defect collection, a path with no
/// region is an error here.
pub fn resolve_bus_for_path(ndctl: &dyn NdctlCtx, path: &Path) -> Result<Box<dyn Bus>> {
    let placement = locate(ndctl, path)?;
    let region = placement
        .region
        .ok_or_else(|| PmbbError::lookup(path, "region unknown"))?;
    ndctl.bus(&region)
}

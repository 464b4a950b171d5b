//! Namespace window inside its region.

use pmbb_error::{PmbbError, Result};
use pmbb_ndctl::{Namespace, Region};
use pmbb_types::NamespaceBounds;
use tracing::debug;

/// Region-relative offset and size of `namespace`.
///
/// Resource and size are read through the kind-specific device (pfn, dax,
/// or the namespace itself for raw/btt). Any unreadable value fails
/// [`PmbbError::BoundsUnavailable`]; there are no retries.
pub fn resolve_bounds(region: &Region, namespace: &Namespace) -> Result<NamespaceBounds> {
    let kind = namespace.kind();
    let object = format!("{} ({})", namespace.name(), kind.label());
    let unavailable = |attribute| PmbbError::BoundsUnavailable {
        object: object.clone(),
        attribute,
    };

    let ns_resource = namespace.resource().ok_or_else(|| unavailable("resource"))?;
    let size = namespace.size().ok_or_else(|| unavailable("size"))?;
    let region_resource = region
        .resource()
        .ok_or_else(|| PmbbError::BoundsUnavailable {
            object: region.name().to_owned(),
            attribute: "resource",
        })?;
    let offset = ns_resource
        .checked_sub(region_resource)
        .ok_or_else(|| unavailable("offset"))?;

    debug!(
        target: "pmbb::bounds",
        region = region.name(),
        namespace = namespace.name(),
        kind = kind.label(),
        ns_resource,
        region_resource,
        offset,
        size,
        "bounds_resolved"
    );
    Ok(NamespaceBounds { offset, size })
}

#![deny(unsafe_code)]
//! NVDIMM topology, defect queries and bus commands.
//!
//! Persistent memory is addressed through nested coordinate spaces: a bus
//! hosts regions, a region hosts namespaces, a namespace hosts a filesystem
//! or a device-DAX node. This crate exposes that topology to the engine:
//!
//! - **lookup**: [`NdctlCtx::locate`] maps a path onto its region/namespace.
//! - **topology**: [`Region`] / [`Namespace`] resource, size, mode, and the
//!   region- and namespace-scoped defect queries.
//! - **bus**: [`Bus`] scrub-capability and clear-error commands.
//!
//! [`SysfsCtx`] implements all of it against Linux sysfs and `/dev/ndctlN`.

pub mod bus;
pub mod config;
#[allow(unsafe_code)]
mod ioctl;
pub mod lookup;
pub mod sysfs;
pub mod topology;

use std::path::Path;

use pmbb_error::Result;
use pmbb_types::FileType;

pub use bus::{ArsCap, Bus, ClearRange, NdctlBus};
pub use config::SysfsConfig;
pub use lookup::SysfsCtx;
pub use topology::{Namespace, Region};

/// Where a path lives in the NVDIMM topology.
///
/// `region: None` means the path is not on persistent memory at all;
/// a region without a namespace means it is on a region but not on any
/// recognized namespace. Neither is an error.
#[derive(Debug, Clone, Default)]
pub struct Placement {
    pub region: Option<Region>,
    pub namespace: Option<Namespace>,
}

/// The platform's topology and defect-query interface.
pub trait NdctlCtx {
    /// Media type of `path` (regular file or device-DAX node).
    fn file_type(&self, path: &Path) -> Result<FileType>;

    /// File-status → region/namespace lookup.
    fn locate(&self, path: &Path) -> Result<Placement>;

    /// The bus owning `region`.
    fn bus(&self, region: &Region) -> Result<Box<dyn Bus>>;
}

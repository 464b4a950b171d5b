//! File → bus/region/namespace resolution through sysfs device numbers.
//!
//! A regular file is resolved through the block device it lives on
//! (`st_dev`), a device-DAX node through its own character device
//! (`st_rdev`). `/sys/dev/<class>/<major>:<minor>` links into the device
//! tree, where the path components name the bus, the region, and the
//! namespace (or the pfn/dax/btt device claiming it).

use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use pmbb_error::{PmbbError, Result};
use pmbb_types::FileType;
use tracing::{debug, trace};

use crate::bus::{Bus, NdctlBus};
use crate::config::SysfsConfig;
use crate::sysfs::{is_dotted, is_indexed, read_attr, split_dev};
use crate::topology::{Namespace, Region};
use crate::{NdctlCtx, Placement};

/// The platform's NVDIMM topology as exposed by Linux sysfs.
#[derive(Debug, Clone, Default)]
pub struct SysfsCtx {
    config: SysfsConfig,
}

impl SysfsCtx {
    #[must_use]
    pub fn new(config: SysfsConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &SysfsConfig {
        &self.config
    }

    fn device_path(&self, path: &Path) -> Result<Option<PathBuf>> {
        let meta = fs::metadata(path).map_err(|err| PmbbError::from_stat(path, &err))?;
        let (class, dev) = if meta.file_type().is_char_device() {
            ("char", meta.rdev())
        } else {
            ("block", meta.dev())
        };
        let (major, minor) = split_dev(dev);
        let link = self.config.dev_link(class, major, minor);
        match fs::canonicalize(&link) {
            Ok(device) => {
                trace!(target: "pmbb::sysfs", path = %path.display(), device = %device.display(), "device_resolved");
                Ok(Some(device))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(target: "pmbb::sysfs", path = %path.display(), major, minor, class, "device_unknown");
                Ok(None)
            }
            Err(err) => Err(PmbbError::lookup(
                path,
                format!("resolve {}: {err}", link.display()),
            )),
        }
    }
}

impl NdctlCtx for SysfsCtx {
    fn file_type(&self, path: &Path) -> Result<FileType> {
        let meta = fs::metadata(path).map_err(|err| PmbbError::from_stat(path, &err))?;
        let file_type = meta.file_type();
        if file_type.is_file() {
            return Ok(FileType::Regular);
        }
        if !file_type.is_char_device() {
            return Err(PmbbError::lookup(path, "unsupported file type"));
        }

        let (major, minor) = split_dev(meta.rdev());
        let subsystem = self.config.dev_link("char", major, minor).join("subsystem");
        let resolved = fs::canonicalize(&subsystem).map_err(|err| {
            PmbbError::lookup(path, format!("resolve {}: {err}", subsystem.display()))
        })?;
        if resolved.file_name().and_then(|name| name.to_str()) == Some("dax") {
            Ok(FileType::DevDax)
        } else {
            Err(PmbbError::lookup(
                path,
                "character device is not a device-dax instance",
            ))
        }
    }

    fn locate(&self, path: &Path) -> Result<Placement> {
        match self.device_path(path)? {
            Some(device) => placement_from_device_path(&device)
                .map_err(|err| PmbbError::lookup(path, err.to_string())),
            None => Ok(Placement::default()),
        }
    }

    fn bus(&self, region: &Region) -> Result<Box<dyn Bus>> {
        let bus_dir = region
            .bus_dir()
            .ok_or_else(|| PmbbError::lookup(region.dir(), "region has no parent bus"))?;
        let bus_name = bus_dir
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("ndbus");
        let provider = read_attr(bus_dir, "provider").unwrap_or_else(|| bus_name.to_owned());
        let control = control_device_name(bus_dir, bus_name)
            .ok_or_else(|| PmbbError::lookup(bus_dir, "bus has no ndctl control device"))?;
        Ok(Box::new(NdctlBus::new(
            provider,
            self.config.dev_node(&control),
        )))
    }
}

/// Walk a canonical device path for `ndbusN/regionN[/<namespace or claim>]`.
pub fn placement_from_device_path(device: &Path) -> Result<Placement> {
    let mut prefix = PathBuf::new();
    let mut previous: Option<String> = None;
    let mut components = device.components();

    while let Some(component) = components.next() {
        prefix.push(component);
        let name = component.as_os_str().to_string_lossy().into_owned();
        let under_bus = previous
            .as_deref()
            .is_some_and(|prev| is_indexed(prev, "ndbus"));
        if under_bus && is_indexed(&name, "region") {
            let region = Region::open(&prefix)?;
            let namespace = match components.next() {
                Some(child) => namespace_name(&prefix, &child.as_os_str().to_string_lossy())
                    .map(|ns| Namespace::open(&prefix, &ns))
                    .transpose()?,
                None => None,
            };
            return Ok(Placement {
                region: Some(region),
                namespace,
            });
        }
        previous = Some(name);
    }

    Ok(Placement::default())
}

fn namespace_name(region_dir: &Path, child: &str) -> Option<String> {
    if is_dotted(child, "namespace") {
        return Some(child.to_owned());
    }
    if ["pfn", "dax", "btt"]
        .iter()
        .any(|prefix| is_dotted(child, prefix))
    {
        return read_attr(&region_dir.join(child), "namespace").filter(|ns| !ns.is_empty());
    }
    None
}

fn control_device_name(bus_dir: &Path, bus_name: &str) -> Option<String> {
    let mut found: Vec<String> = fs::read_dir(bus_dir)
        .ok()
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| is_indexed(name, "ndctl"))
        .collect();
    found.sort();
    found
        .into_iter()
        .next()
        .or_else(|| {
            bus_name
                .strip_prefix("ndbus")
                .map(|index| format!("ndctl{index}"))
        })
}

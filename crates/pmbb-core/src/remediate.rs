//! Defect remediation.
//!
//! Device-DAX ranges are cleared through the bus: a scrub-capability command
//! reports the clearable sub-range, a clear-error command clears it, and the
//! cleared count must match what was asked for. Regular-file ranges are hole
//! punched and then re-allocated, so the filesystem hands them fresh media.
//!
//! The first failing range aborts the rest.

use std::borrow::Cow;
use std::fs::OpenOptions;
use std::path::Path;

use pmbb_error::{PmbbError, Result};
use pmbb_ndctl::{Bus, NdctlCtx};
use pmbb_types::{BadBlockSet, FileType};
use tracing::{debug, trace, warn};

use crate::Platform;
use crate::collect::collect;
use crate::locate::{locate, resolve_bus_for_path};
use crate::translate::translate;

/// Clear `targets` in `path`, or everything currently reported when `None`.
pub fn clear(platform: &Platform<'_>, path: &Path, targets: Option<&BadBlockSet>) -> Result<()> {
    match platform.ndctl.file_type(path)? {
        FileType::DevDax => clear_device(platform.ndctl, path, targets),
        FileType::Regular => clear_file(platform, path, targets),
    }
}

// ── Device-DAX ──────────────────────────────────────────────────────────────

fn clear_device(ndctl: &dyn NdctlCtx, path: &Path, targets: Option<&BadBlockSet>) -> Result<()> {
    let (bus, set): (Box<dyn Bus>, Cow<'_, BadBlockSet>) = if let Some(set) = targets {
        (resolve_bus_for_path(ndctl, path)?, Cow::Borrowed(set))
    } else {
        // device files need no extent step; namespace offsets are file offsets
        let placement = locate(ndctl, path)?;
        let (Some(region), Some(namespace)) = (&placement.region, &placement.namespace) else {
            debug!(target: "pmbb::remediate", path = %path.display(), "not_on_namespace");
            return Ok(());
        };
        let set = collect(region, namespace)?;
        if set.is_empty() {
            debug!(target: "pmbb::remediate", path = %path.display(), "nothing_to_clear");
            return Ok(());
        }
        (ndctl.bus(region)?, Cow::Owned(set))
    };

    if set.is_empty() {
        debug!(target: "pmbb::remediate", path = %path.display(), "nothing_to_clear");
        return Ok(());
    }
    clear_on_bus(bus.as_ref(), &set)
}

/// Clear every record of `set` through `bus`, in order.
pub fn clear_on_bus(bus: &dyn Bus, set: &BadBlockSet) -> Result<()> {
    debug!(
        target: "pmbb::remediate",
        provider = bus.provider(),
        count = set.count(),
        ns_resource = set.ns_resource(),
        "clearing_device_ranges"
    );
    for record in set {
        let length = u64::from(record.length);
        let address = set.ns_resource().checked_add(record.offset).ok_or_else(|| {
            PmbbError::command(
                bus.provider(),
                format!("address of offset {} overflows", record.offset),
            )
        })?;
        clear_one(bus, address, length).inspect_err(|err| {
            warn!(
                target: "pmbb::remediate",
                provider = bus.provider(),
                address,
                length,
                error = %err,
                "clear_failed"
            );
        })?;
    }
    Ok(())
}

fn clear_one(bus: &dyn Bus, address: u64, length: u64) -> Result<()> {
    let cap = bus.ars_cap(address, length)?;
    let range = cap.range().ok_or_else(|| {
        PmbbError::command(
            bus.provider(),
            format!("ars_cap status {:#x} for {address:#x}+{length}", cap.status),
        )
    })?;
    let cleared = bus.clear_error(&cap, range)?;
    trace!(
        target: "pmbb::remediate",
        address,
        length,
        clear_address = range.address,
        clear_length = range.length,
        cleared,
        "range_cleared"
    );
    if cleared != length {
        return Err(PmbbError::command(
            bus.provider(),
            format!("cleared {cleared} of {length} bytes at {address:#x}"),
        ));
    }
    Ok(())
}

// ── Regular files ───────────────────────────────────────────────────────────

fn clear_file(platform: &Platform<'_>, path: &Path, targets: Option<&BadBlockSet>) -> Result<()> {
    let set = match targets {
        Some(set) => Cow::Borrowed(set),
        None => Cow::Owned(translate(platform, path)?),
    };
    if set.is_empty() {
        debug!(target: "pmbb::remediate", path = %path.display(), "nothing_to_clear");
        return Ok(());
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| PmbbError::lookup(path, format!("open read-write: {err}")))?;

    debug!(
        target: "pmbb::remediate",
        path = %path.display(),
        count = set.count(),
        "clearing_file_ranges"
    );
    for record in set.iter() {
        let length = u64::from(record.length);
        platform
            .space
            .deallocate(&file, record.offset, length)
            .and_then(|()| platform.space.reallocate(&file, record.offset, length))
            .inspect_err(|err| {
                warn!(
                    target: "pmbb::remediate",
                    path = %path.display(),
                    offset = record.offset,
                    length,
                    error = %err,
                    "clear_failed"
                );
            })?;
        trace!(target: "pmbb::remediate", offset = record.offset, length, "range_reallocated");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmbb_ndctl::{ArsCap, ClearRange};
    use pmbb_types::BadBlock;
    use std::cell::RefCell;

    /// Echoes the requested range back and clears `cleared(len)` bytes.
    struct EchoBus {
        cleared: fn(u64) -> u64,
        calls: RefCell<Vec<(u64, u64)>>,
    }

    impl EchoBus {
        fn new(cleared: fn(u64) -> u64) -> Self {
            Self {
                cleared,
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Bus for EchoBus {
        fn provider(&self) -> &str {
            "echo"
        }

        fn ars_cap(&self, address: u64, length: u64) -> Result<ArsCap> {
            Ok(ArsCap {
                address,
                length,
                status: 0,
                max_ars_out: 0,
                clear_err_unit: 512,
                flags: 0,
            })
        }

        fn clear_error(&self, _cap: &ArsCap, range: ClearRange) -> Result<u64> {
            self.calls.borrow_mut().push((range.address, range.length));
            Ok((self.cleared)(range.length))
        }
    }

    #[test]
    fn device_ranges_are_offset_by_namespace_resource() {
        let bus = EchoBus::new(|len| len);
        let set = BadBlockSet::new(
            0x1_0000_0000,
            vec![BadBlock::new(0, 4096), BadBlock::new(8192, 512)],
        );
        clear_on_bus(&bus, &set).expect("clear");
        assert_eq!(
            *bus.calls.borrow(),
            vec![(0x1_0000_0000, 4096), (0x1_0000_2000, 512)]
        );
    }

    #[test]
    fn short_clear_halts_remaining_ranges() {
        let bus = EchoBus::new(|len| len / 2);
        let set = BadBlockSet::new(0, vec![BadBlock::new(0, 4096), BadBlock::new(8192, 4096)]);
        match clear_on_bus(&bus, &set).expect_err("short clear") {
            PmbbError::CommandFailed { provider, detail } => {
                assert_eq!(provider, "echo");
                assert_eq!(detail, "cleared 2048 of 4096 bytes at 0x0");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(bus.calls.borrow().len(), 1);
    }

    #[test]
    fn failed_capability_status_is_command_failure() {
        struct Busy;
        impl Bus for Busy {
            fn provider(&self) -> &str {
                "busy"
            }
            fn ars_cap(&self, address: u64, length: u64) -> Result<ArsCap> {
                Ok(ArsCap {
                    address,
                    length,
                    status: 6,
                    max_ars_out: 0,
                    clear_err_unit: 0,
                    flags: 0,
                })
            }
            fn clear_error(&self, _cap: &ArsCap, _range: ClearRange) -> Result<u64> {
                panic!("clear must not be issued after a failed capability query");
            }
        }

        let set = BadBlockSet::new(0, vec![BadBlock::new(0, 512)]);
        let err = clear_on_bus(&Busy, &set).expect_err("busy");
        assert!(err.to_string().contains("ars_cap status 0x6"));
    }
}

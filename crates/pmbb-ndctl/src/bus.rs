//! Bus commands used to clear device-mapped defects.
//!
//! Clearing is a two-command sequence: an address-range-scrub capability
//! query reports which sub-range the firmware can clear (and its clear
//! unit), then a clear-error command over that sub-range reports how many
//! bytes it actually cleared.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use pmbb_error::{PmbbError, Result};
use tracing::{debug, trace};

use crate::ioctl::{NdCmdArsCap, NdCmdClearError, submit_ars_cap, submit_clear_error};

/// A bus-address range, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearRange {
    pub address: u64,
    pub length: u64,
}

/// Completed ARS capability command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArsCap {
    pub address: u64,
    pub length: u64,
    /// Firmware status; the low 16 bits are the command status.
    pub status: u32,
    pub max_ars_out: u32,
    pub clear_err_unit: u32,
    pub flags: u16,
}

impl ArsCap {
    /// The clearable sub-range, available only on a successful command.
    #[must_use]
    pub fn range(&self) -> Option<ClearRange> {
        (self.status & 0xffff == 0).then_some(ClearRange {
            address: self.address,
            length: self.length,
        })
    }

    /// Check that `range` can be handed to a clear-error command.
    pub fn validate_clear(&self, range: ClearRange) -> std::result::Result<(), String> {
        let unit = u64::from(self.clear_err_unit);
        if !unit.is_power_of_two() {
            return Err(format!("invalid clear_err_unit {}", self.clear_err_unit));
        }
        let mask = unit - 1;
        if (range.address | range.length) & mask != 0 {
            return Err(format!(
                "range {:#x}+{} not aligned to clear_err_unit {unit}",
                range.address, range.length
            ));
        }
        Ok(())
    }
}

/// A bus capable of running scrub-capability and clear-error commands.
///
/// Each call is one complete command: submitted, read back, and released
/// before it returns, whether it succeeded or not.
pub trait Bus {
    /// Provider name, for diagnostics.
    fn provider(&self) -> &str;

    fn ars_cap(&self, address: u64, length: u64) -> Result<ArsCap>;

    /// Clear `range`; returns the number of bytes cleared.
    fn clear_error(&self, cap: &ArsCap, range: ClearRange) -> Result<u64>;
}

/// A bus driven through its `/dev/ndctlN` control device.
#[derive(Debug, Clone)]
pub struct NdctlBus {
    provider: String,
    control: PathBuf,
}

impl NdctlBus {
    #[must_use]
    pub fn new(provider: impl Into<String>, control: impl Into<PathBuf>) -> Self {
        Self {
            provider: provider.into(),
            control: control.into(),
        }
    }

    fn open_control(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.control)
            .map_err(|err| {
                PmbbError::command(
                    &self.provider,
                    format!("open {}: {err}", self.control.display()),
                )
            })
    }
}

impl Bus for NdctlBus {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn ars_cap(&self, address: u64, length: u64) -> Result<ArsCap> {
        let control = self.open_control()?;
        let mut cmd = NdCmdArsCap {
            address,
            length,
            ..NdCmdArsCap::default()
        };
        submit_ars_cap(&control, &mut cmd).map_err(|errno| {
            PmbbError::command(&self.provider, format!("ars_cap submit: {errno}"))
        })?;
        trace!(
            target: "pmbb::bus",
            provider = %self.provider,
            address,
            length,
            status = cmd.status,
            clear_err_unit = cmd.clear_err_unit,
            "ars_cap_done"
        );
        Ok(ArsCap {
            address: cmd.address,
            length: cmd.length,
            status: cmd.status,
            max_ars_out: cmd.max_ars_out,
            clear_err_unit: cmd.clear_err_unit,
            flags: cmd.flags,
        })
    }

    fn clear_error(&self, cap: &ArsCap, range: ClearRange) -> Result<u64> {
        cap.validate_clear(range)
            .map_err(|detail| PmbbError::command(&self.provider, detail))?;
        let control = self.open_control()?;
        let mut cmd = NdCmdClearError {
            address: range.address,
            length: range.length,
            ..NdCmdClearError::default()
        };
        submit_clear_error(&control, &mut cmd).map_err(|errno| {
            PmbbError::command(&self.provider, format!("clear_error submit: {errno}"))
        })?;
        if cmd.status & 0xffff != 0 {
            return Err(PmbbError::command(
                &self.provider,
                format!("clear_error firmware status {:#x}", cmd.status),
            ));
        }
        debug!(
            target: "pmbb::bus",
            provider = %self.provider,
            address = range.address,
            length = range.length,
            cleared = cmd.cleared,
            "clear_error_done"
        );
        Ok(cmd.cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(status: u32, unit: u32) -> ArsCap {
        ArsCap {
            address: 0x1_0000_1000,
            length: 4096,
            status,
            max_ars_out: 0,
            clear_err_unit: unit,
            flags: 0,
        }
    }

    #[test]
    fn range_requires_clean_status() {
        assert_eq!(
            cap(0, 256).range(),
            Some(ClearRange {
                address: 0x1_0000_1000,
                length: 4096
            })
        );
        // extended status bits alone do not fail the command
        assert!(cap(0x0001_0000, 256).range().is_some());
        assert_eq!(cap(3, 256).range(), None);
    }

    #[test]
    fn clear_must_be_unit_aligned() {
        let cap = cap(0, 256);
        assert!(
            cap.validate_clear(ClearRange {
                address: 0x1000,
                length: 512
            })
            .is_ok()
        );
        assert!(
            cap.validate_clear(ClearRange {
                address: 0x1080,
                length: 512
            })
            .is_err()
        );
        assert!(
            cap.validate_clear(ClearRange {
                address: 0x1000,
                length: 300
            })
            .is_err()
        );
    }

    #[test]
    fn zero_clear_unit_is_rejected() {
        let err = cap(0, 0)
            .validate_clear(ClearRange {
                address: 0,
                length: 512,
            })
            .expect_err("zero unit");
        assert!(err.contains("clear_err_unit"));
    }

    #[test]
    fn missing_control_device_is_command_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bus = NdctlBus::new("nfit_test.0", dir.path().join("ndctl7"));
        let err = bus.ars_cap(0, 4096).expect_err("no device");
        match err {
            PmbbError::CommandFailed { provider, detail } => {
                assert_eq!(provider, "nfit_test.0");
                assert!(detail.contains("ndctl7"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}

//! Raw ND bus ioctls on the `/dev/ndctlN` control device.
//!
//! Layouts follow `<linux/ndctl.h>`. Both commands are fixed-size, so the
//! size encoded into the request number matches the payload exactly.

use std::fs::File;
use std::os::fd::AsRawFd;

const ND_IOCTL: u8 = b'N';
const ND_CMD_ARS_CAP: u8 = 1;
const ND_CMD_CLEAR_ERROR: u8 = 4;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct NdCmdArsCap {
    pub address: u64,
    pub length: u64,
    pub status: u32,
    pub max_ars_out: u32,
    pub clear_err_unit: u32,
    pub flags: u16,
    pub reserved: u16,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct NdCmdClearError {
    pub address: u64,
    pub length: u64,
    pub status: u32,
    pub reserved: [u8; 4],
    pub cleared: u64,
}

nix::ioctl_readwrite!(nd_ioctl_ars_cap, ND_IOCTL, ND_CMD_ARS_CAP, NdCmdArsCap);
nix::ioctl_readwrite!(
    nd_ioctl_clear_error,
    ND_IOCTL,
    ND_CMD_CLEAR_ERROR,
    NdCmdClearError
);

pub(crate) fn submit_ars_cap(control: &File, cmd: &mut NdCmdArsCap) -> nix::Result<()> {
    // SAFETY: `cmd` is a live, exclusively borrowed `#[repr(C)]` payload of
    // the size encoded in the request; the fd stays open for the call.
    unsafe { nd_ioctl_ars_cap(control.as_raw_fd(), cmd) }.map(drop)
}

pub(crate) fn submit_clear_error(control: &File, cmd: &mut NdCmdClearError) -> nix::Result<()> {
    // SAFETY: as above, for the clear-error payload.
    unsafe { nd_ioctl_clear_error(control.as_raw_fd(), cmd) }.map(drop)
}

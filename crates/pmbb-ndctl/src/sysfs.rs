//! Sysfs attribute access and the badblocks text format.

use std::fs;
use std::io;
use std::path::Path;

use pmbb_error::{PmbbError, Result};
use pmbb_types::RawBadBlock;
use tracing::trace;

/// Read an attribute as trimmed text. `None` if missing or unreadable.
#[must_use]
pub fn read_attr(dir: &Path, name: &str) -> Option<String> {
    let path = dir.join(name);
    match fs::read_to_string(&path) {
        Ok(raw) => Some(raw.trim().to_owned()),
        Err(err) => {
            trace!(target: "pmbb::sysfs", path = %path.display(), error = %err, "attr_unreadable");
            None
        }
    }
}

/// Read a numeric attribute. Accepts `0x`-prefixed hex (as `resource` is
/// printed) and decimal (as `size` is printed). `None` is the platform's
/// "unknown" value.
#[must_use]
pub fn read_u64_attr(dir: &Path, name: &str) -> Option<u64> {
    let raw = read_attr(dir, name)?;
    let parsed = parse_u64(&raw);
    if parsed.is_none() {
        trace!(target: "pmbb::sysfs", dir = %dir.display(), name, raw = %raw, "attr_not_numeric");
    }
    parsed
}

fn parse_u64(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        raw.parse().ok()
    }
}

/// Read and parse a `badblocks` attribute file.
pub fn read_badblocks(path: &Path) -> Result<Vec<RawBadBlock>> {
    let text = fs::read_to_string(path).map_err(|err| {
        let detail = if err.kind() == io::ErrorKind::PermissionDenied {
            format!("{}: {err} (region defects need elevated privilege)", path.display())
        } else {
            format!("{}: {err}", path.display())
        };
        PmbbError::query("badblocks", detail)
    })?;
    parse_badblocks(&text).map_err(|err| match err {
        PmbbError::QueryFailed { what, detail } => {
            PmbbError::query(what, format!("{}: {detail}", path.display()))
        }
        other => other,
    })
}

/// Parse `<offset> <length>` sector pairs, one per line.
pub fn parse_badblocks(text: &str) -> Result<Vec<RawBadBlock>> {
    let malformed = |lineno: usize, detail: String| {
        PmbbError::query("badblocks", format!("line {}: {detail}", lineno + 1))
    };
    let mut out = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(offset), Some(len), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(malformed(lineno, "expected '<offset> <length>'".to_owned()));
        };
        let offset = offset
            .parse()
            .map_err(|_| malformed(lineno, format!("invalid offset {offset:?}")))?;
        let len = len
            .parse()
            .map_err(|_| malformed(lineno, format!("invalid length {len:?}")))?;
        append_raw(&mut out, RawBadBlock { offset, len })?;
    }
    Ok(out)
}

/// Fallible append; a long list surfaces exhaustion instead of aborting.
fn append_raw(out: &mut Vec<RawBadBlock>, record: RawBadBlock) -> Result<()> {
    out.try_reserve(1).map_err(|_| PmbbError::AllocationFailed {
        what: "badblocks",
        requested: out.len().saturating_add(1),
    })?;
    out.push(record);
    Ok(())
}

/// Split a Linux `dev_t` into (major, minor), glibc encoding.
#[must_use]
pub const fn split_dev(dev: u64) -> (u64, u64) {
    let major = ((dev >> 32) & 0xffff_f000) | ((dev >> 8) & 0x0000_0fff);
    let minor = ((dev >> 12) & 0xffff_ff00) | (dev & 0x0000_00ff);
    (major, minor)
}

/// Whether `name` is `<prefix><digits>` (e.g. `region3`, `ndbus0`).
#[must_use]
pub fn is_indexed(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

/// Whether `name` is `<prefix><digits>.<digits>` (e.g. `namespace0.1`).
#[must_use]
pub fn is_dotted(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.split_once('.'))
        .is_some_and(|(a, b)| {
            !a.is_empty()
                && !b.is_empty()
                && a.bytes().all(|c| c.is_ascii_digit())
                && b.bytes().all(|c| c.is_ascii_digit())
        })
}

//! Region and namespace snapshots backed by sysfs device directories.
//!
//! A region directory (`.../ndbusN/regionN`) holds its namespaces
//! (`namespaceN.M`) and the devices that may claim them (`pfnN.M` for
//! fsdax, `daxN.M` for devdax, `bttN.M` for sector mode). A claiming
//! device names its namespace through its `namespace` attribute.

use std::fs;
use std::path::{Path, PathBuf};

use pmbb_error::{PmbbError, Result};
use pmbb_types::{NamespaceKind, NamespaceMode, RawBadBlock};

use crate::sysfs::{is_dotted, read_attr, read_badblocks, read_u64_attr};

// ── Region ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    name: String,
    dir: PathBuf,
}

impl Region {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let name = dir_name(&dir)?;
        if !dir.is_dir() {
            return Err(PmbbError::lookup(&dir, "region directory not found"));
        }
        Ok(Self { name, dir })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The `ndbusN` directory owning this region.
    #[must_use]
    pub fn bus_dir(&self) -> Option<&Path> {
        self.dir.parent()
    }

    /// Absolute resource offset of the region; `None` when unknown.
    #[must_use]
    pub fn resource(&self) -> Option<u64> {
        read_u64_attr(&self.dir, "resource")
    }

    /// Region-scoped defect query. Offsets are region-relative sectors.
    /// Needs read access to privileged device information.
    pub fn badblocks(&self) -> Result<Vec<RawBadBlock>> {
        read_badblocks(&self.dir.join("badblocks"))
    }
}

// ── Namespace ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimKind {
    Pfn,
    Dax,
    Btt,
}

impl ClaimKind {
    fn from_dir_name(name: &str) -> Option<Self> {
        if is_dotted(name, "pfn") {
            Some(Self::Pfn)
        } else if is_dotted(name, "dax") {
            Some(Self::Dax)
        } else if is_dotted(name, "btt") {
            Some(Self::Btt)
        } else {
            None
        }
    }

    const fn implied_mode(self) -> NamespaceMode {
        match self {
            Self::Pfn => NamespaceMode::Fsdax,
            Self::Dax => NamespaceMode::Devdax,
            Self::Btt => NamespaceMode::Sector,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Claim {
    kind: ClaimKind,
    dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    name: String,
    dir: PathBuf,
    mode: NamespaceMode,
    claim: Option<Claim>,
}

impl Namespace {
    /// Open `name` inside `region_dir`, resolving its claiming device and
    /// reading its mode once.
    pub fn open(region_dir: &Path, name: &str) -> Result<Self> {
        let dir = region_dir.join(name);
        if !dir.is_dir() {
            return Err(PmbbError::lookup(&dir, "namespace directory not found"));
        }
        let claim = find_claim(region_dir, name)?;
        let mode = match read_attr(&dir, "mode").map(|raw| NamespaceMode::parse(&raw)) {
            Some(mode) if mode != NamespaceMode::Unknown => mode,
            _ => claim
                .as_ref()
                .map_or(NamespaceMode::Raw, |claim| claim.kind.implied_mode()),
        };
        Ok(Self {
            name: name.to_owned(),
            dir,
            mode,
            claim,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn mode(&self) -> NamespaceMode {
        self.mode
    }

    #[must_use]
    pub fn kind(&self) -> NamespaceKind {
        NamespaceKind::from_mode(self.mode)
    }

    /// Directory of the kind-specific device carrying resource and size.
    fn accessor_dir(&self) -> Option<&Path> {
        let wanted = match self.kind() {
            NamespaceKind::PfnMapped => ClaimKind::Pfn,
            NamespaceKind::DeviceDax => ClaimKind::Dax,
            NamespaceKind::RawOrBtt => return Some(&self.dir),
        };
        self.claim
            .as_ref()
            .filter(|claim| claim.kind == wanted)
            .map(|claim| claim.dir.as_path())
    }

    /// Absolute resource offset through the kind-specific accessor.
    #[must_use]
    pub fn resource(&self) -> Option<u64> {
        self.accessor_dir()
            .and_then(|dir| read_u64_attr(dir, "resource"))
    }

    /// Usable size through the kind-specific accessor.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.accessor_dir().and_then(|dir| read_u64_attr(dir, "size"))
    }

    /// Name of the block device exposing this namespace (`pmemN`), if any.
    #[must_use]
    pub fn block_device(&self) -> Option<String> {
        let mut names: Vec<String> = fs::read_dir(self.block_parent().join("block"))
            .ok()?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names.into_iter().next()
    }

    /// Namespace-scoped defect query through the block device.
    /// Offsets are namespace-relative sectors; no privilege needed.
    pub fn badblocks(&self) -> Result<Vec<RawBadBlock>> {
        let Some(block) = self.block_device() else {
            return Err(PmbbError::query(
                "namespace badblocks",
                format!("{} has no block device", self.name),
            ));
        };
        read_badblocks(
            &self
                .block_parent()
                .join("block")
                .join(block)
                .join("badblocks"),
        )
    }

    /// Block devices hang off the pfn/btt claim, or the namespace itself.
    fn block_parent(&self) -> &Path {
        self.claim
            .as_ref()
            .filter(|claim| claim.kind != ClaimKind::Dax)
            .map_or(self.dir.as_path(), |claim| claim.dir.as_path())
    }
}

fn find_claim(region_dir: &Path, namespace: &str) -> Result<Option<Claim>> {
    let entries = fs::read_dir(region_dir)
        .map_err(|err| PmbbError::lookup(region_dir, format!("read_dir: {err}")))?;
    let mut candidates: Vec<(String, ClaimKind, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let kind = ClaimKind::from_dir_name(&name)?;
            Some((name, kind, entry.path()))
        })
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(candidates
        .into_iter()
        .find(|(_, _, dir)| read_attr(dir, "namespace").as_deref() == Some(namespace))
        .map(|(_, kind, dir)| Claim { kind, dir }))
}

fn dir_name(dir: &Path) -> Result<String> {
    dir.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| PmbbError::lookup(dir, "device directory has no name"))
}

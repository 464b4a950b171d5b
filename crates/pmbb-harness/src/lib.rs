#![forbid(unsafe_code)]
//! Test tooling for the bad block engine.
//!
//! - **fixtures**: [`TopologyFixture`] describes one bus/region and its
//!   namespaces; [`TopologyFixture::materialize`] writes it out as a fake
//!   sysfs tree next to a real data file whose device number links into it.
//! - **stubs**: [`RecordingBus`], [`StaticExtents`] and [`RecordingSpace`]
//!   stand in for firmware, FIEMAP and `fallocate(2)`, recording every call.

use std::cell::{Cell, RefCell};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, bail, ensure};
use pmbb_core::{LinuxPlatform, Platform};
use pmbb_error::PmbbError;
use pmbb_extent::{ExtentSource, SpaceOps};
use pmbb_ndctl::sysfs::{is_indexed, split_dev};
use pmbb_ndctl::{ArsCap, Bus, ClearRange, NdctlCtx, Placement, Region, SysfsConfig, SysfsCtx};
use pmbb_types::{ExtentList, FileType, NamespaceMode, RawBadBlock};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

// ── Fixtures ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyFixture {
    pub description: String,
    pub bus: BusFixture,
    pub region: RegionFixture,
    #[serde(default)]
    pub namespaces: Vec<NamespaceFixture>,
    /// Where the data file's device sits.
    #[serde(default)]
    pub file: FilePlacement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusFixture {
    /// `ndbusN`.
    pub name: String,
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionFixture {
    /// `regionN`.
    pub name: String,
    pub resource: Option<u64>,
    pub size: Option<u64>,
    /// Region-relative sector records; `None` leaves the list unreadable.
    pub badblocks: Option<Vec<RawBadBlock>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceFixture {
    /// `namespaceX.Y`.
    pub name: String,
    pub mode: String,
    pub resource: Option<u64>,
    pub size: Option<u64>,
    #[serde(default)]
    pub claim: Option<ClaimFixture>,
    /// `pmemN`, hung off the pfn/btt claim or the namespace itself.
    #[serde(default)]
    pub block_device: Option<String>,
    /// Namespace-relative sector records served by the block device.
    #[serde(default)]
    pub badblocks: Vec<RawBadBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimFixture {
    /// `pfnX.Y`, `daxX.Y` or `bttX.Y`.
    pub device: String,
    pub resource: Option<u64>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilePlacement {
    /// On the named namespace.
    Namespace(String),
    /// On the region, outside every namespace.
    Region,
    /// Not on persistent memory.
    #[default]
    Nowhere,
}

impl TopologyFixture {
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn namespace(&self, name: &str) -> Option<&NamespaceFixture> {
        self.namespaces.iter().find(|ns| ns.name == name)
    }

    /// Structural checks a fixture must pass before it is materialized.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            is_indexed(&self.bus.name, "ndbus"),
            "bus name {:?} is not ndbusN",
            self.bus.name
        );
        ensure!(
            is_indexed(&self.region.name, "region"),
            "region name {:?} is not regionN",
            self.region.name
        );
        for ns in &self.namespaces {
            ensure!(
                NamespaceMode::parse(&ns.mode) != NamespaceMode::Unknown,
                "{}: unknown mode {:?}",
                ns.name,
                ns.mode
            );
            if let Some(claim) = &ns.claim {
                ensure!(
                    ["pfn", "dax", "btt"]
                        .iter()
                        .any(|prefix| claim.device.starts_with(prefix)),
                    "{}: claim {:?} is not a pfn/dax/btt device",
                    ns.name,
                    claim.device
                );
            }
            if ns.block_device.is_none() {
                ensure!(
                    ns.badblocks.is_empty(),
                    "{}: namespace badblocks need a block device",
                    ns.name
                );
            }
        }
        if let FilePlacement::Namespace(name) = &self.file {
            ensure!(
                self.namespace(name).is_some(),
                "file placed on unknown namespace {name:?}"
            );
        }
        Ok(())
    }

    /// Write the topology under a fresh temporary root.
    pub fn materialize(&self) -> Result<MaterializedTopology> {
        self.validate()?;
        let root = tempfile::tempdir().context("failed to create fixture root")?;
        let sys = root.path().join("sys");
        let dev = root.path().join("dev");
        fs::create_dir_all(&dev)?;

        let bus_dir = sys
            .join("devices/platform/nfit_test.0")
            .join(&self.bus.name);
        write_attr(&bus_dir, "provider", &self.bus.provider)?;
        let index = self.bus.name.trim_start_matches("ndbus");
        fs::create_dir_all(bus_dir.join(format!("ndctl{index}")))?;

        let region_dir = bus_dir.join(&self.region.name);
        fs::create_dir_all(&region_dir)?;
        write_opt(&region_dir, "resource", self.region.resource.map(hex))?;
        write_opt(&region_dir, "size", self.region.size.map(|v| v.to_string()))?;
        if let Some(records) = &self.region.badblocks {
            write_attr(&region_dir, "badblocks", &badblocks_text(records))?;
        }

        for ns in &self.namespaces {
            materialize_namespace(&region_dir, ns)?;
        }

        let file = root.path().join("pool.obj");
        fs::write(&file, vec![0_u8; 64 * 1024])
            .with_context(|| format!("failed to write {}", file.display()))?;

        let target = match &self.file {
            FilePlacement::Namespace(name) => {
                let ns = self
                    .namespace(name)
                    .with_context(|| format!("unknown namespace {name}"))?;
                Some(device_dir(&region_dir, ns))
            }
            FilePlacement::Region => Some(region_dir),
            FilePlacement::Nowhere => None,
        };
        if let Some(target) = target {
            let (major, minor) = split_dev(fs::metadata(&file)?.dev());
            let links = sys.join("dev/block");
            fs::create_dir_all(&links)?;
            std::os::unix::fs::symlink(&target, links.join(format!("{major}:{minor}")))
                .with_context(|| format!("failed to link {}", target.display()))?;
        }

        Ok(MaterializedTopology {
            config: SysfsConfig::new(sys, dev),
            file,
            _root: root,
        })
    }
}

fn materialize_namespace(region_dir: &Path, ns: &NamespaceFixture) -> Result<()> {
    let ns_dir = region_dir.join(&ns.name);
    write_attr(&ns_dir, "mode", &ns.mode)?;
    write_opt(&ns_dir, "resource", ns.resource.map(hex))?;
    write_opt(&ns_dir, "size", ns.size.map(|v| v.to_string()))?;

    if let Some(claim) = &ns.claim {
        let claim_dir = region_dir.join(&claim.device);
        write_attr(&claim_dir, "namespace", &ns.name)?;
        write_opt(&claim_dir, "resource", claim.resource.map(hex))?;
        write_opt(&claim_dir, "size", claim.size.map(|v| v.to_string()))?;
    }
    if let Some(block) = &ns.block_device {
        let dir = block_parent(region_dir, ns).join("block").join(block);
        write_attr(&dir, "badblocks", &badblocks_text(&ns.badblocks))?;
    }
    Ok(())
}

/// Claims other than dax carry the block device.
fn block_parent(region_dir: &Path, ns: &NamespaceFixture) -> PathBuf {
    match &ns.claim {
        Some(claim) if !claim.device.starts_with("dax") => region_dir.join(&claim.device),
        _ => region_dir.join(&ns.name),
    }
}

/// The sysfs device a file on `ns` resolves to.
fn device_dir(region_dir: &Path, ns: &NamespaceFixture) -> PathBuf {
    match (&ns.block_device, &ns.claim) {
        (Some(block), _) => block_parent(region_dir, ns).join("block").join(block),
        (None, Some(claim)) => region_dir.join(&claim.device),
        (None, None) => region_dir.join(&ns.name),
    }
}

fn hex(value: u64) -> String {
    format!("{value:#x}")
}

fn badblocks_text(records: &[RawBadBlock]) -> String {
    records
        .iter()
        .map(|bb| format!("{} {}\n", bb.offset, bb.len))
        .collect()
}

fn write_attr(dir: &Path, name: &str, value: &str) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let path = dir.join(name);
    fs::write(&path, format!("{value}\n"))
        .with_context(|| format!("failed to write {}", path.display()))
}

fn write_opt(dir: &Path, name: &str, value: Option<String>) -> Result<()> {
    match value {
        Some(value) => write_attr(dir, name, &value),
        None => fs::create_dir_all(dir).context("failed to create attribute directory"),
    }
}

/// Load and materialize-check a fixture file.
pub fn validate_topology_fixture(path: &Path) -> Result<TopologyFixture> {
    let fixture = TopologyFixture::load(path)?;
    let materialized = fixture.materialize()?;
    let placement = SysfsCtx::new(materialized.config())
        .locate(materialized.file())
        .context("fixture does not resolve")?;
    match (&fixture.file, &placement) {
        (FilePlacement::Namespace(name), Placement { namespace: Some(ns), .. })
            if ns.name() == name.as_str() => {}
        (FilePlacement::Region, Placement { region: Some(_), namespace: None }) => {}
        (FilePlacement::Nowhere, Placement { region: None, .. }) => {}
        (expected, _) => bail!("file resolves differently than placed ({expected:?})"),
    }
    Ok(fixture)
}

/// A topology written out under a temporary root, removed on drop.
#[derive(Debug)]
pub struct MaterializedTopology {
    config: SysfsConfig,
    file: PathBuf,
    _root: TempDir,
}

impl MaterializedTopology {
    /// The data file placed on the topology.
    #[must_use]
    pub fn file(&self) -> &Path {
        &self.file
    }

    #[must_use]
    pub fn config(&self) -> SysfsConfig {
        self.config.clone()
    }

    /// A context serving this topology as `file_type`, with `bus` as the
    /// bus of every region.
    #[must_use]
    pub fn ctx(&self, file_type: FileType, bus: RecordingBus) -> FixtureCtx {
        FixtureCtx {
            sysfs: SysfsCtx::new(self.config()),
            file_type,
            bus,
        }
    }

    /// The production platform pointed at this topology.
    #[must_use]
    pub fn linux(&self) -> LinuxPlatform {
        LinuxPlatform::new(self.config())
    }
}

// ── Platform stubs ──────────────────────────────────────────────────────────

/// Real sysfs lookup over a fixture, with a fixed file type and bus.
#[derive(Debug, Clone)]
pub struct FixtureCtx {
    sysfs: SysfsCtx,
    file_type: FileType,
    bus: RecordingBus,
}

impl NdctlCtx for FixtureCtx {
    fn file_type(&self, path: &Path) -> pmbb_error::Result<FileType> {
        fs::metadata(path).map_err(|err| PmbbError::from_stat(path, &err))?;
        Ok(self.file_type)
    }

    fn locate(&self, path: &Path) -> pmbb_error::Result<Placement> {
        self.sysfs.locate(path)
    }

    fn bus(&self, _region: &Region) -> pmbb_error::Result<Box<dyn Bus>> {
        Ok(Box::new(self.bus.clone()))
    }
}

/// Borrow the three seams as a [`Platform`].
#[must_use]
pub fn platform<'a>(
    ndctl: &'a dyn NdctlCtx,
    extents: &'a dyn ExtentSource,
    space: &'a dyn SpaceOps,
) -> Platform<'a> {
    Platform {
        ndctl,
        extents,
        space,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusCall {
    ArsCap { address: u64, length: u64 },
    ClearError { address: u64, length: u64 },
}

#[derive(Debug, Default)]
struct BusLog {
    calls: Vec<BusCall>,
    acquired: usize,
    released: usize,
}

/// Scripted firmware. The capability command echoes the requested range;
/// clear-error clears all of it, except on the scripted short-clear call.
/// Clones share one log, so a clone kept by the test inspects what the
/// engine did with the other.
#[derive(Debug, Clone)]
pub struct RecordingBus {
    provider: String,
    ars_status: u32,
    clear_err_unit: u32,
    short_clear_at: Option<usize>,
    log: Arc<Mutex<BusLog>>,
}

impl RecordingBus {
    #[must_use]
    pub fn new(provider: &str) -> Self {
        Self {
            provider: provider.to_owned(),
            ars_status: 0,
            clear_err_unit: 512,
            short_clear_at: None,
            log: Arc::new(Mutex::new(BusLog::default())),
        }
    }

    /// Capability commands complete with this firmware status.
    #[must_use]
    pub fn with_ars_status(mut self, status: u32) -> Self {
        self.ars_status = status;
        self
    }

    /// The `index`th clear-error command (0-based) clears one unit short.
    #[must_use]
    pub fn with_short_clear_at(mut self, index: usize) -> Self {
        self.short_clear_at = Some(index);
        self
    }

    #[must_use]
    pub fn calls(&self) -> Vec<BusCall> {
        self.lock().calls.clone()
    }

    /// `(acquired, released)` command objects.
    #[must_use]
    pub fn command_balance(&self) -> (usize, usize) {
        let log = self.lock();
        (log.acquired, log.released)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, call: BusCall) -> CommandGuard<'_> {
        let mut log = self.lock();
        log.calls.push(call);
        log.acquired += 1;
        CommandGuard { bus: self }
    }
}

/// Released on every exit path of a command.
struct CommandGuard<'b> {
    bus: &'b RecordingBus,
}

impl Drop for CommandGuard<'_> {
    fn drop(&mut self) {
        self.bus.lock().released += 1;
    }
}

impl Bus for RecordingBus {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn ars_cap(&self, address: u64, length: u64) -> pmbb_error::Result<ArsCap> {
        let _cmd = self.acquire(BusCall::ArsCap { address, length });
        Ok(ArsCap {
            address,
            length,
            status: self.ars_status,
            max_ars_out: 0,
            clear_err_unit: self.clear_err_unit,
            flags: 0,
        })
    }

    fn clear_error(&self, cap: &ArsCap, range: ClearRange) -> pmbb_error::Result<u64> {
        let index = self
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, BusCall::ClearError { .. }))
            .count();
        let _cmd = self.acquire(BusCall::ClearError {
            address: range.address,
            length: range.length,
        });
        cap.validate_clear(range)
            .map_err(|detail| PmbbError::command(&self.provider, detail))?;
        if self.short_clear_at == Some(index) {
            Ok(range.length.saturating_sub(u64::from(self.clear_err_unit)))
        } else {
            Ok(range.length)
        }
    }
}

/// A fixed extent map that counts how often it is asked.
#[derive(Debug, Default)]
pub struct StaticExtents {
    list: Option<ExtentList>,
    fill_fails: bool,
    calls: Cell<usize>,
}

impl StaticExtents {
    #[must_use]
    pub fn new(list: ExtentList) -> Self {
        Self {
            list: Some(list),
            fill_fails: false,
            calls: Cell::new(0),
        }
    }

    /// A device file: no extents.
    #[must_use]
    pub fn none() -> Self {
        Self::new(ExtentList {
            blksize: 4096,
            extents: Vec::new(),
        })
    }

    /// Every query fails.
    #[must_use]
    pub fn failing() -> Self {
        Self::default()
    }

    /// Counts `list` but fails the fill that follows.
    #[must_use]
    pub fn failing_fill(list: ExtentList) -> Self {
        Self {
            fill_fails: true,
            ..Self::new(list)
        }
    }

    /// Extent-interface calls so far, both phases.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    fn served(&self, what: &'static str) -> pmbb_error::Result<&ExtentList> {
        self.calls.set(self.calls.get() + 1);
        self.list
            .as_ref()
            .ok_or_else(|| PmbbError::query(what, "injected failure"))
    }
}

impl ExtentSource for StaticExtents {
    fn extent_count(&self, _path: &Path) -> pmbb_error::Result<usize> {
        Ok(self.served("extent count")?.len())
    }

    fn extents(&self, _path: &Path, count: usize) -> pmbb_error::Result<ExtentList> {
        let list = self.served("extent list")?;
        if self.fill_fails {
            return Err(PmbbError::query("extent list", "injected failure"));
        }
        Ok(ExtentList {
            blksize: list.blksize,
            extents: list.extents.iter().take(count).copied().collect(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceOp {
    Deallocate,
    Reallocate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceCall {
    pub op: SpaceOp,
    pub offset: u64,
    pub length: u64,
}

/// Records deallocate/reallocate calls; optionally fails the `n`th one.
#[derive(Debug, Default)]
pub struct RecordingSpace {
    calls: RefCell<Vec<SpaceCall>>,
    fail_at: Option<usize>,
}

impl RecordingSpace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The `index`th call (0-based, both kinds counted) fails.
    #[must_use]
    pub fn failing_at(index: usize) -> Self {
        Self {
            calls: RefCell::default(),
            fail_at: Some(index),
        }
    }

    #[must_use]
    pub fn calls(&self) -> Vec<SpaceCall> {
        self.calls.borrow().clone()
    }

    fn record(&self, op: SpaceOp, offset: u64, length: u64) -> pmbb_error::Result<()> {
        let mut calls = self.calls.borrow_mut();
        let index = calls.len();
        calls.push(SpaceCall { op, offset, length });
        if self.fail_at == Some(index) {
            return Err(PmbbError::IoFailed {
                op: match op {
                    SpaceOp::Deallocate => "deallocate",
                    SpaceOp::Reallocate => "reallocate",
                },
                offset,
                length,
                source: io::Error::other("injected failure"),
            });
        }
        Ok(())
    }
}

impl SpaceOps for RecordingSpace {
    fn deallocate(&self, _file: &fs::File, offset: u64, length: u64) -> pmbb_error::Result<()> {
        self.record(SpaceOp::Deallocate, offset, length)
    }

    fn reallocate(&self, _file: &fs::File, offset: u64, length: u64) -> pmbb_error::Result<()> {
        self.record(SpaceOp::Reallocate, offset, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fsdax_fixture() -> TopologyFixture {
        serde_json::from_str(
            r#"{
                "description": "fsdax namespace on pfn",
                "bus": { "name": "ndbus0", "provider": "nfit_test.0" },
                "region": { "name": "region0", "resource": 4294967296, "size": 17179869184,
                            "badblocks": [] },
                "namespaces": [{
                    "name": "namespace0.0", "mode": "fsdax",
                    "resource": 4294967296, "size": 2147483648,
                    "claim": { "device": "pfn0.0", "resource": 4296015872, "size": 2146435072 },
                    "block_device": "pmem0",
                    "badblocks": [{ "offset": 16, "len": 8 }]
                }],
                "file": { "namespace": "namespace0.0" }
            }"#,
        )
        .expect("fixture json")
    }

    #[test]
    fn materialized_fixture_resolves_to_its_namespace() {
        let topo = fsdax_fixture().materialize().expect("materialize");
        let placement = SysfsCtx::new(topo.config())
            .locate(topo.file())
            .expect("locate");
        let ns = placement.namespace.expect("namespace");
        assert_eq!(ns.name(), "namespace0.0");
        assert_eq!(ns.resource(), Some(4_296_015_872));
        assert_eq!(
            ns.badblocks().expect("badblocks"),
            vec![RawBadBlock { offset: 16, len: 8 }]
        );
    }

    #[test]
    fn file_on_unknown_namespace_is_rejected() {
        let mut fixture = fsdax_fixture();
        fixture.file = FilePlacement::Namespace("namespace9.9".into());
        assert!(fixture.validate().is_err());
    }

    #[test]
    fn bus_guard_releases_on_failure() {
        let bus = RecordingBus::new("nfit_test.0");
        let cap = bus.ars_cap(0x1000, 300).expect("cap");
        // 300 bytes is not a multiple of the 512-byte clear unit
        assert!(
            bus.clear_error(
                &cap,
                ClearRange {
                    address: 0x1000,
                    length: 300
                }
            )
            .is_err()
        );
        assert_eq!(bus.command_balance(), (2, 2));
    }

    #[test]
    fn recording_space_fails_requested_call() {
        let file = tempfile::tempfile().expect("tempfile");
        let space = RecordingSpace::failing_at(1);
        space.deallocate(&file, 0, 4096).expect("first");
        assert!(matches!(
            space.reallocate(&file, 0, 4096),
            Err(PmbbError::IoFailed { op: "reallocate", .. })
        ));
        assert_eq!(space.calls().len(), 2);
    }
}

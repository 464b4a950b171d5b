#![forbid(unsafe_code)]

use pmbb_core::collect::clip_to_namespace;
use pmbb_core::translate::map_through_extents;
use pmbb_core::{
    PmbbError, clear_all_badblocks, clear_badblocks, count_badblocks, get_badblocks,
};
use pmbb_harness::{
    BusCall, ClaimFixture, BusFixture, FilePlacement, NamespaceFixture, RecordingBus,
    RecordingSpace, RegionFixture, SpaceCall, SpaceOp, StaticExtents, TopologyFixture, platform,
};
use pmbb_types::{
    BadBlock, BadBlockSet, Extent, ExtentList, FileType, NamespaceBounds, RawBadBlock,
};

const REGION_RESOURCE: u64 = 0x1_0000_0000;

fn raw(offset: u64, len: u32) -> RawBadBlock {
    RawBadBlock { offset, len }
}

fn extent(physical: u64, logical: u64, length: u64) -> Extent {
    Extent {
        offset_physical: physical,
        offset_logical: logical,
        length,
    }
}

fn topology(namespace: NamespaceFixture, region_badblocks: Vec<RawBadBlock>) -> TopologyFixture {
    TopologyFixture {
        description: "scenario".to_owned(),
        bus: BusFixture {
            name: "ndbus0".to_owned(),
            provider: "nfit_test.0".to_owned(),
        },
        region: RegionFixture {
            name: "region0".to_owned(),
            resource: Some(REGION_RESOURCE),
            size: Some(16 << 30),
            badblocks: Some(region_badblocks),
        },
        file: FilePlacement::Namespace(namespace.name.clone()),
        namespaces: vec![namespace],
    }
}

/// fsdax namespace whose pmem0 block device reports `badblocks`.
fn fsdax(badblocks: Vec<RawBadBlock>) -> TopologyFixture {
    topology(
        NamespaceFixture {
            name: "namespace0.0".to_owned(),
            mode: "fsdax".to_owned(),
            resource: Some(REGION_RESOURCE),
            size: Some(2 << 30),
            claim: Some(ClaimFixture {
                device: "pfn0.0".to_owned(),
                resource: Some(REGION_RESOURCE + 0x10_0000),
                size: Some((2 << 30) - 0x10_0000),
            }),
            block_device: Some("pmem0".to_owned()),
            badblocks,
        },
        vec![raw(2048, 8)],
    )
}

/// devdax namespace at region offset 2 MiB, 4 GiB long.
fn devdax(region_badblocks: Vec<RawBadBlock>) -> TopologyFixture {
    topology(
        NamespaceFixture {
            name: "namespace0.0".to_owned(),
            mode: "devdax".to_owned(),
            resource: Some(REGION_RESOURCE),
            size: Some(4 << 30),
            claim: Some(ClaimFixture {
                device: "dax0.0".to_owned(),
                resource: Some(REGION_RESOURCE + 0x20_0000),
                size: Some(4 << 30),
            }),
            block_device: None,
            badblocks: Vec::new(),
        },
        region_badblocks,
    )
}

fn covering_extent() -> StaticExtents {
    StaticExtents::new(ExtentList {
        blksize: 4096,
        extents: vec![extent(507_904_000, 102_400_000, 40_960_000)],
    })
}

// ── Discovery ───────────────────────────────────────────────────────────────

#[test]
fn filesystem_file_one_defect_one_covering_extent() {
    let topo = fsdax(vec![raw(1_000_000, 16)]).materialize().expect("topology");
    let ctx = topo.ctx(FileType::Regular, RecordingBus::new("nfit_test.0"));
    let extents = covering_extent();
    let space = RecordingSpace::new();

    let set = get_badblocks(&platform(&ctx, &extents, &space), topo.file()).expect("get");
    assert_eq!(set.records(), &[BadBlock::new(106_496_000, 8192)]);
    assert_eq!(set.records()[0].healthy_replica_count, -1);
    assert_eq!(extents.calls(), 2);
}

#[test]
fn discovery_is_idempotent() {
    let topo = fsdax(vec![raw(1_000_000, 16), raw(1_000_040, 3), raw(8, 8)])
        .materialize()
        .expect("topology");
    let ctx = topo.ctx(FileType::Regular, RecordingBus::new("nfit_test.0"));
    let extents = StaticExtents::new(ExtentList {
        blksize: 4096,
        extents: vec![
            extent(0, 1 << 20, 1 << 20),
            extent(507_904_000, 102_400_000, 40_960_000),
        ],
    });
    let space = RecordingSpace::new();
    let platform = platform(&ctx, &extents, &space);

    let first = get_badblocks(&platform, topo.file()).expect("first");
    let second = get_badblocks(&platform, topo.file()).expect("second");
    assert_eq!(first, second);
    assert_eq!(first.count(), 3);
}

#[test]
fn no_defects_is_empty_and_never_queries_extents() {
    let topo = fsdax(Vec::new()).materialize().expect("topology");
    let ctx = topo.ctx(FileType::Regular, RecordingBus::new("nfit_test.0"));
    // a failing extent source proves it is never consulted
    let extents = StaticExtents::failing();
    let space = RecordingSpace::new();
    let platform = platform(&ctx, &extents, &space);

    let set = get_badblocks(&platform, topo.file()).expect("get");
    assert!(set.is_empty());
    assert_eq!(set.ns_resource(), 0);
    assert_eq!(count_badblocks(&platform, topo.file()), 0);
    assert_eq!(extents.calls(), 0);
}

#[test]
fn device_dax_defects_are_reported_verbatim() {
    // region sector 4096 is the first byte of the namespace
    let topo = devdax(vec![raw(4096, 8)]).materialize().expect("topology");
    let ctx = topo.ctx(FileType::DevDax, RecordingBus::new("nfit_test.0"));
    let extents = StaticExtents::none();
    let space = RecordingSpace::new();

    let set = get_badblocks(&platform(&ctx, &extents, &space), topo.file()).expect("get");
    assert_eq!(set.records(), &[BadBlock::new(0, 4096)]);
    assert_eq!(set.ns_resource(), REGION_RESOURCE + 0x20_0000);
    assert_eq!(extents.calls(), 1);
}

#[test]
fn defect_outside_every_extent_is_empty_success() {
    let topo = fsdax(vec![raw(1_000_000, 16)]).materialize().expect("topology");
    let ctx = topo.ctx(FileType::Regular, RecordingBus::new("nfit_test.0"));
    let extents = StaticExtents::new(ExtentList {
        blksize: 4096,
        extents: vec![extent(0, 0, 1 << 20)],
    });
    let space = RecordingSpace::new();
    let platform = platform(&ctx, &extents, &space);

    let set = get_badblocks(&platform, topo.file()).expect("get");
    assert!(set.is_empty());
    assert_eq!(count_badblocks(&platform, topo.file()), 0);
}

#[test]
fn extent_failure_discards_defects() {
    let topo = fsdax(vec![raw(8, 8)]).materialize().expect("topology");
    let ctx = topo.ctx(FileType::Regular, RecordingBus::new("nfit_test.0"));
    let extents = StaticExtents::failing();
    let space = RecordingSpace::new();
    let platform = platform(&ctx, &extents, &space);

    assert!(matches!(
        get_badblocks(&platform, topo.file()),
        Err(PmbbError::QueryFailed { what: "extent count", .. })
    ));
    assert_eq!(count_badblocks(&platform, topo.file()), -1);
}

#[test]
fn extent_fill_failure_discards_defects() {
    let topo = fsdax(vec![raw(1_000_000, 16)]).materialize().expect("topology");
    let ctx = topo.ctx(FileType::Regular, RecordingBus::new("nfit_test.0"));
    let extents = StaticExtents::failing_fill(ExtentList {
        blksize: 4096,
        extents: vec![extent(507_904_000, 102_400_000, 40_960_000)],
    });
    let space = RecordingSpace::new();
    let platform = platform(&ctx, &extents, &space);

    assert!(matches!(
        get_badblocks(&platform, topo.file()),
        Err(PmbbError::QueryFailed { what: "extent list", .. })
    ));
    // count succeeded, fill failed
    assert_eq!(extents.calls(), 2);
    assert_eq!(count_badblocks(&platform, topo.file()), -1);
}

#[test]
fn unreadable_region_list_fails_collection() {
    let mut fixture = devdax(Vec::new());
    fixture.region.badblocks = None;
    let topo = fixture.materialize().expect("topology");
    let ctx = topo.ctx(FileType::DevDax, RecordingBus::new("nfit_test.0"));
    let extents = StaticExtents::none();
    let space = RecordingSpace::new();

    assert!(matches!(
        get_badblocks(&platform(&ctx, &extents, &space), topo.file()),
        Err(PmbbError::QueryFailed { .. })
    ));
}

// ── Properties ──────────────────────────────────────────────────────────────

/// Deterministic xorshift stream for input grids.
struct Inputs(u64);

impl Inputs {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0 % bound
    }
}

#[test]
fn alignment_never_shrinks_coverage() {
    let mut inputs = Inputs(0x9E37_79B9_7F4A_7C15);
    for _ in 0..2000 {
        let blksize = 512_u64 << inputs.next(5);
        let defect = BadBlock::new(
            inputs.next(1 << 24),
            u32::try_from(1 + inputs.next(64 * 1024)).expect("small length"),
        );
        let ext = extent(
            inputs.next(1 << 24),
            inputs.next(1 << 30),
            1 + inputs.next(1 << 22),
        );
        let list = ExtentList {
            blksize,
            extents: vec![ext],
        };

        let out = map_through_extents(&[defect], &list).expect("translate");
        let bb_end = defect.last_byte().expect("non-empty");
        let ext_end = ext.physical_last().expect("non-empty");
        let overlaps = defect.offset <= ext_end && ext.offset_physical <= bb_end;
        assert_eq!(out.len(), usize::from(overlaps), "{defect:?} {ext:?}");

        if let Some(bb) = out.first() {
            let beg = defect.offset.max(ext.offset_physical);
            let end = bb_end.min(ext_end);
            let logical_beg = beg - ext.offset_physical + ext.offset_logical;
            let logical_end = end - ext.offset_physical + ext.offset_logical;
            assert_eq!(bb.offset % blksize, 0);
            assert_eq!(u64::from(bb.length) % blksize, 0);
            assert!(bb.offset <= logical_beg, "{bb:?} starts after {logical_beg}");
            assert!(
                bb.offset + u64::from(bb.length) > logical_end,
                "{bb:?} ends before {logical_end}"
            );
        }
    }
}

#[test]
fn region_clipping_matches_interval_intersection() {
    let mut inputs = Inputs(0x0123_4567_89AB_CDEF);
    for _ in 0..200 {
        let bounds = NamespaceBounds {
            offset: inputs.next(1 << 20) * 512,
            size: (1 + inputs.next(1 << 16)) * 512,
        };
        let ns_beg = bounds.offset;
        let ns_end = bounds.last_byte().expect("non-empty");
        let records: Vec<RawBadBlock> = (0..16)
            .map(|_| {
                raw(
                    inputs.next((1 << 20) + (1 << 16)),
                    u32::try_from(1 + inputs.next(256)).expect("small"),
                )
            })
            .collect();

        let out = clip_to_namespace(&records, bounds).expect("clip");
        let mut produced = out.iter();
        for record in &records {
            let bb_beg = record.offset * 512;
            let bb_end = bb_beg + u64::from(record.len) * 512 - 1;
            if bb_beg <= ns_end && ns_beg <= bb_end {
                let beg = bb_beg.max(ns_beg);
                let end = bb_end.min(ns_end);
                let bb = produced.next().expect("record for overlap");
                assert_eq!(bb.offset, beg - ns_beg);
                assert_eq!(u64::from(bb.length), end - beg + 1);
            }
        }
        assert!(produced.next().is_none(), "record without overlap");
    }
}

// ── Remediation ─────────────────────────────────────────────────────────────

#[test]
fn short_device_clear_fails_and_halts() {
    let topo = devdax(vec![raw(4096, 8), raw(4200, 8)])
        .materialize()
        .expect("topology");
    let bus = RecordingBus::new("nfit_test.0").with_short_clear_at(0);
    let ctx = topo.ctx(FileType::DevDax, bus.clone());
    let extents = StaticExtents::none();
    let space = RecordingSpace::new();

    let err = clear_all_badblocks(&platform(&ctx, &extents, &space), topo.file())
        .expect_err("short clear");
    assert!(matches!(err, PmbbError::CommandFailed { .. }), "{err:?}");

    let ns_resource = REGION_RESOURCE + 0x20_0000;
    assert_eq!(
        bus.calls(),
        vec![
            BusCall::ArsCap {
                address: ns_resource,
                length: 4096
            },
            BusCall::ClearError {
                address: ns_resource,
                length: 4096
            },
        ]
    );
    let (acquired, released) = bus.command_balance();
    assert_eq!(acquired, released);
    // clearing never needs the extent map
    assert_eq!(extents.calls(), 0);
}

#[test]
fn failed_capability_status_releases_command() {
    let topo = devdax(vec![raw(4096, 8)]).materialize().expect("topology");
    let bus = RecordingBus::new("nfit_test.0").with_ars_status(6);
    let ctx = topo.ctx(FileType::DevDax, bus.clone());
    let extents = StaticExtents::none();
    let space = RecordingSpace::new();

    let err = clear_all_badblocks(&platform(&ctx, &extents, &space), topo.file())
        .expect_err("busy firmware");
    assert!(matches!(err, PmbbError::CommandFailed { .. }));
    assert_eq!(bus.calls().len(), 1);
    assert_eq!(bus.command_balance(), (1, 1));
}

#[test]
fn device_clear_of_supplied_set_uses_its_resource() {
    let topo = devdax(Vec::new()).materialize().expect("topology");
    let bus = RecordingBus::new("nfit_test.0");
    let ctx = topo.ctx(FileType::DevDax, bus.clone());
    let extents = StaticExtents::none();
    let space = RecordingSpace::new();
    let targets = BadBlockSet::new(0x2_0000_0000, vec![BadBlock::new(8192, 1024)]);

    clear_badblocks(&platform(&ctx, &extents, &space), topo.file(), Some(&targets))
        .expect("clear");
    assert_eq!(
        bus.calls()[1],
        BusCall::ClearError {
            address: 0x2_0000_2000,
            length: 1024
        }
    );
}

#[test]
fn device_clear_with_nothing_reported_is_a_no_op() {
    let topo = devdax(Vec::new()).materialize().expect("topology");
    let bus = RecordingBus::new("nfit_test.0");
    let ctx = topo.ctx(FileType::DevDax, bus.clone());
    let extents = StaticExtents::none();
    let space = RecordingSpace::new();

    clear_all_badblocks(&platform(&ctx, &extents, &space), topo.file()).expect("clear");
    assert!(bus.calls().is_empty());
}

#[test]
fn device_clear_off_region_is_lookup_failure() {
    let mut fixture = devdax(Vec::new());
    fixture.file = FilePlacement::Nowhere;
    let topo = fixture.materialize().expect("topology");
    let ctx = topo.ctx(FileType::DevDax, RecordingBus::new("nfit_test.0"));
    let extents = StaticExtents::none();
    let space = RecordingSpace::new();
    let targets = BadBlockSet::new(0, vec![BadBlock::new(0, 512)]);

    match clear_badblocks(&platform(&ctx, &extents, &space), topo.file(), Some(&targets)) {
        Err(PmbbError::LookupFailed { detail, .. }) => assert_eq!(detail, "region unknown"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn file_clear_deallocates_then_reallocates_each_range() {
    let topo = fsdax(vec![raw(1_000_000, 16), raw(1_000_100, 1)])
        .materialize()
        .expect("topology");
    let ctx = topo.ctx(FileType::Regular, RecordingBus::new("nfit_test.0"));
    let extents = covering_extent();
    let space = RecordingSpace::new();

    clear_all_badblocks(&platform(&ctx, &extents, &space), topo.file()).expect("clear");

    let call = |op, offset, length| SpaceCall { op, offset, length };
    // sector 1_000_100 is 51_200 bytes past the first defect
    assert_eq!(
        space.calls(),
        vec![
            call(SpaceOp::Deallocate, 106_496_000, 8192),
            call(SpaceOp::Reallocate, 106_496_000, 8192),
            call(SpaceOp::Deallocate, 106_496_000 + 49_152, 4096),
            call(SpaceOp::Reallocate, 106_496_000 + 49_152, 4096),
        ]
    );
}

#[test]
fn file_clear_failure_aborts_remaining_ranges() {
    let topo = fsdax(Vec::new()).materialize().expect("topology");
    let ctx = topo.ctx(FileType::Regular, RecordingBus::new("nfit_test.0"));
    let extents = StaticExtents::failing();
    let space = RecordingSpace::failing_at(0);
    let targets = BadBlockSet::new(
        0,
        vec![BadBlock::new(0, 4096), BadBlock::new(8192, 4096)],
    );

    let err = clear_badblocks(&platform(&ctx, &extents, &space), topo.file(), Some(&targets))
        .expect_err("injected");
    assert!(matches!(err, PmbbError::IoFailed { op: "deallocate", .. }));
    assert_eq!(space.calls().len(), 1);
    assert_eq!(extents.calls(), 0);
}

#[test]
fn file_reallocate_failure_aborts_remaining_ranges() {
    let topo = fsdax(Vec::new()).materialize().expect("topology");
    let ctx = topo.ctx(FileType::Regular, RecordingBus::new("nfit_test.0"));
    let extents = StaticExtents::failing();
    let space = RecordingSpace::failing_at(1);
    let targets = BadBlockSet::new(
        0,
        vec![BadBlock::new(0, 4096), BadBlock::new(8192, 4096)],
    );

    let err = clear_badblocks(&platform(&ctx, &extents, &space), topo.file(), Some(&targets))
        .expect_err("injected");
    assert!(matches!(
        err,
        PmbbError::IoFailed {
            op: "reallocate",
            offset: 0,
            length: 4096,
            ..
        }
    ));
    assert_eq!(
        space.calls(),
        vec![
            SpaceCall {
                op: SpaceOp::Deallocate,
                offset: 0,
                length: 4096
            },
            SpaceCall {
                op: SpaceOp::Reallocate,
                offset: 0,
                length: 4096
            },
        ]
    );
}

#[test]
fn file_clear_with_no_defects_touches_nothing() {
    let topo = fsdax(Vec::new()).materialize().expect("topology");
    let ctx = topo.ctx(FileType::Regular, RecordingBus::new("nfit_test.0"));
    let extents = StaticExtents::failing();
    let space = RecordingSpace::new();

    clear_all_badblocks(&platform(&ctx, &extents, &space), topo.file()).expect("clear");
    assert!(space.calls().is_empty());
    assert_eq!(extents.calls(), 0);
}

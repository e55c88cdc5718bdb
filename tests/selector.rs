extern crate tilegemm;

use tilegemm::{forced_reformat, padding_plan, BlockScheduler, BlockShape, Calibration, Device,
               ElementKind, Error, KernelVariant, Layout, OperandId, PaddingTag,
               PlatformCapacities, ProblemShape, TilingDecision, TilingSelector, MAX_DIM};

fn device(units: usize) -> Device {
    Device::new(PlatformCapacities::reference().with_units(units))
}

#[test]
fn test_single_tile_problem_is_small() {
    let plat = PlatformCapacities::reference().with_units(20);
    let p = ProblemShape::builder(128, 128, 128).build().unwrap();
    let d = Device::new(plat.clone()).select(&p).unwrap();
    assert_eq!(d.variant(), KernelVariant::Small);
    assert_eq!(d.split(), 1);
    for &id in &[OperandId::A, OperandId::B, OperandId::C] {
        assert_eq!(d.padding(id), PaddingTag::None);
    }
    // the tile is balanced to spread one wave; every tile gets a unit
    assert_eq!(d.units(), BlockScheduler::of(&d).total_tasks());

    // a single 128 x 128 tile is one task on one unit
    let pinned = TilingDecision::builder(&p, &plat, KernelVariant::Small,
                                         BlockShape::new(128, 128, 128))
        .build().unwrap();
    assert_eq!(BlockScheduler::of(&pinned).total_tasks(), 1);
    assert_eq!(pinned.units(), 1);
}

#[test]
fn test_balance_fills_idle_units() {
    // 128 x 256 tiles give 16 blocks on 20 units; 112 rows give 18
    let p = ProblemShape::builder(1000, 512, 64).build().unwrap();
    let d = device(20).select(&p).unwrap();
    assert_eq!((d.tile().l1.m, d.tile().l1.n), (112, 256));
    assert!(d.units() <= 18);
}

#[test]
fn test_tail_wave_streams_k() {
    // 10 tiles of 128 x 256 on 4 units leave a tail of 2
    let p = ProblemShape::builder(640, 512, 3200).build().unwrap();
    let d = device(4).select(&p).unwrap();
    assert_eq!(d.variant(), KernelVariant::StreamK);
    assert_eq!(d.units(), 4);
    assert_eq!(d.split(), 1);
    assert_eq!((d.tile().l1.m, d.tile().l1.n), (128, 256));
    assert_eq!(d.padding(OperandId::C), PaddingTag::None);
}

#[test]
fn test_starved_operand_is_reformatted_by_cost() {
    // one column of tiles feeds 16 units; reformatting B beats reading it in place
    let dev = device(24);
    let p = ProblemShape::builder(4096, 128, 128).build().unwrap();
    let d = dev.select(&p).unwrap();
    assert_eq!(d.variant(), KernelVariant::Padding);
    assert_eq!(d.padding(OperandId::A), PaddingTag::None);
    assert_eq!(d.padding(OperandId::B), PaddingTag::FractalPad);
    assert!(!forced_reformat(dev.calibration(), 128, 128));

    let plan = padding_plan(&p, d.tile().l1, 1, dev.platform(), dev.calibration());
    let [none, b_only, a_only, both] = plan.times;
    assert!(b_only < none && b_only < a_only && b_only < both, "{:?}", plan.times);
}

#[test]
fn test_unaligned_wide_output_pads_c() {
    let p = ProblemShape::builder(4096, 1100, 64).build().unwrap();
    let d = device(24).select(&p).unwrap();
    assert_eq!(d.padding(OperandId::C), PaddingTag::SimplePad);
    assert_eq!(d.variant(), KernelVariant::Padding);

    // aligned n keeps C in place
    let p = ProblemShape::builder(4096, 1024, 64).build().unwrap();
    assert_eq!(device(24).select(&p).unwrap().padding(OperandId::C), PaddingTag::None);
}

#[test]
fn test_oversized_problems_are_errors() {
    let huge = 1 << 31;
    match ProblemShape::builder(huge, huge, huge).build() {
        Err(Error::ExceedsLimits(_)) => {}
        other => panic!("expected a size error, got {:?}", other),
    }
    assert!(matches!(ProblemShape::builder(MAX_DIM + 1, 1, 1).build(),
                     Err(Error::ExceedsLimits(_))));

    // the largest cube that still builds selects without overflowing
    let big = 1 << 30;
    let p = ProblemShape::builder(big, big, big).build().unwrap();
    let d = device(24).select(&p).unwrap();
    assert_eq!((d.tile().l1.m, d.tile().l1.n), (128, 256));
    assert!(d.workspace_bytes() > 0);
}

#[test]
fn test_bad_calibration_is_an_error() {
    let p = ProblemShape::builder(256, 256, 256).build().unwrap();
    let mut cal = Calibration::default();
    cal.padding.strip_rows = 0;
    match device(24).with_calibration(cal).select(&p) {
        Err(Error::InvalidCalibration(_)) => {}
        other => panic!("expected a calibration error, got {:?}", other),
    }
    assert!(Calibration::from_json_str(r#"{"padding": {"strip_rows": 0}}"#).is_err());
    assert!(Calibration::from_json_str(r#"{"tiling": {"align": 0}}"#).is_err());
}

#[test]
fn test_long_k_splits() {
    let dev = device(24);
    let p = ProblemShape::builder(256, 256, 20000).build().unwrap();
    let d = dev.select(&p).unwrap();
    assert_eq!(d.variant(), KernelVariant::SplitK);
    // two 128 x 256 tiles; 24 / 2 units per tile, below the top bucket
    assert_eq!(d.tile().l1.m, 128);
    assert_eq!(d.tile().l1.n, 256);
    assert_eq!(d.split(), 12);
    assert_eq!(d.padding(OperandId::C), PaddingTag::None);
    assert!(d.split() <= (20000 + d.tile().l1.k - 1) / d.tile().l1.k);
}

#[test]
fn test_tiny_inner_dimension_is_reformatted() {
    let p = ProblemShape::builder(4096, 64, 7)
        .layouts(Layout::RowMajor, Layout::RowMajor, Layout::RowMajor)
        .build()
        .unwrap();
    let d = device(24).select(&p).unwrap();
    assert_eq!(d.padding(OperandId::A), PaddingTag::FractalPad);
    assert_eq!(d.variant(), KernelVariant::Padding);
    assert!(d.workspace_bytes() >= 4096 * 16 * 2);
}

#[test]
fn test_selection_is_pure() {
    let plat = PlatformCapacities::reference().with_units(20);
    let cal = Calibration::default();
    let selector = TilingSelector::new(&plat, &cal);
    let layouts = [Layout::RowMajor, Layout::ColumnMajor];
    for &(m, n, k) in &[(1, 1, 1), (4000, 4000, 4000), (777, 3, 9000), (2048, 300, 64)] {
        for &la in &layouts {
            for &lb in &layouts {
                let p = ProblemShape::builder(m, n, k).layouts(la, lb, Layout::RowMajor)
                    .build().unwrap();
                let first = selector.select(&p).unwrap();
                let second = selector.select(&p).unwrap();
                assert_eq!(first, second);
                assert_eq!(first.tiling_key(), second.tiling_key());
                assert!(first.units() >= 1 && first.units() <= 20);
                first.tile().validate(ElementKind::F16, &plat).unwrap();
            }
        }
    }
}

#[test]
fn test_calibration_changes_selection() {
    let p = ProblemShape::builder(256, 256, 20000).build().unwrap();
    let dev = device(24);
    assert_eq!(dev.select(&p).unwrap().variant(), KernelVariant::SplitK);

    let mut cal = Calibration::default();
    cal.split_k.few_blocks_min_k = usize::MAX;
    cal.split_k.half_units_min_k = usize::MAX;
    let d = dev.clone().with_calibration(cal).select(&p).unwrap();
    assert_ne!(d.variant(), KernelVariant::SplitK);
    assert_eq!(d.split(), 1);
}

#[test]
fn test_no_units_is_an_error() {
    let p = ProblemShape::builder(64, 64, 64).build().unwrap();
    assert!(device(0).select(&p).is_err());
}

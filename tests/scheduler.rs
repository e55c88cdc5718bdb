extern crate itertools;
extern crate tilegemm;

use std::collections::HashSet;

use itertools::Itertools;

use tilegemm::{BlockCoord, BlockScheduler, BlockShape, ProblemShape, StreamkScheduler, Swizzle,
               SwizzleDirection};

fn problem(m: usize, n: usize, k: usize) -> ProblemShape {
    ProblemShape::builder(m, n, k).build().unwrap()
}

fn swizzles() -> Vec<Swizzle> {
    [SwizzleDirection::Zn, SwizzleDirection::Nz].iter()
        .cartesian_product(&[1, 2, 3, 5, 16])
        .map(|(&direction, &offset)| Swizzle { offset, direction })
        .collect()
}

/// Each unit walks `unit, unit + units, ...`; together they must see every
/// coordinate exactly once.
fn assert_permutation(sched: &BlockScheduler, swizzle: Swizzle, units: usize) {
    let mut seen = HashSet::new();
    for unit in 0..units {
        for task in (unit..sched.total_tasks()).step_by(units) {
            let coord = sched.coord_of(task, swizzle);
            if !seen.insert(coord) {
                panic!("{:?} visited twice (task {}, {:?})", coord, task, swizzle);
            }
        }
    }
    let (lm, ln, _) = sched.loops();
    assert_eq!(seen.len(), sched.total_tasks());
    assert!(seen.iter().all(|c| c.row < lm && c.col < ln));
}

#[test]
fn test_large_square_is_a_permutation() {
    let sched = BlockScheduler::new(&problem(4000, 4000, 512), BlockShape::new(256, 256, 256), 1)
        .unwrap();
    assert_eq!(sched.total_tasks(), 256);
    for swizzle in swizzles() {
        assert_permutation(&sched, swizzle, 20);
    }
}

#[test]
fn test_uneven_grids() {
    for &(m, n) in &[(1, 1), (100, 3000), (3000, 100), (999, 1001), (256, 4096)] {
        let sched = BlockScheduler::new(&problem(m, n, 64), BlockShape::new(128, 256, 64), 1)
            .unwrap();
        for swizzle in swizzles() {
            assert_permutation(&sched, swizzle, 7);
        }
    }
}

#[test]
fn test_split_permutation() {
    let sched = BlockScheduler::new(&problem(300, 500, 4096), BlockShape::new(128, 256, 256), 5)
        .unwrap();
    assert_eq!(sched.total_tasks(), 3 * 2 * 5);
    for swizzle in swizzles() {
        assert_permutation(&sched, swizzle, 24);
    }
}

#[test]
fn test_partition_is_complete() {
    let (m, n) = (1000, 700);
    let tile = BlockShape::new(128, 96, 64);
    let sched = BlockScheduler::new(&problem(m, n, 64), tile, 1).unwrap();
    let (lm, ln, _) = sched.loops();
    for col in 0..ln {
        let rows: usize = (0..lm).map(|row| sched.actual_shape_of(BlockCoord::new(row, col, 0)).m)
            .sum();
        assert_eq!(rows, m);
    }
    for row in 0..lm {
        let cols: usize = (0..ln).map(|col| sched.actual_shape_of(BlockCoord::new(row, col, 0)).n)
            .sum();
        assert_eq!(cols, n);
    }
    // boundary tiles are dim - (tiles - 1) * tile
    let last = sched.actual_shape_of(BlockCoord::new(lm - 1, ln - 1, 0));
    assert_eq!(last.m, m - (lm - 1) * 128);
    assert_eq!(last.n, n - (ln - 1) * 96);
}

#[test]
fn test_split_k_ranges_tile_k() {
    let k = 1000;
    for split in 1..=4 {
        let sched = BlockScheduler::new(&problem(64, 64, k), BlockShape::new(64, 64, 256), split)
            .unwrap();
        let mut next = 0;
        for slice in 0..split {
            let (offset, len) = sched.k_range(slice);
            assert_eq!(offset, next);
            assert!(len > 0);
            next = offset + len;
        }
        assert_eq!(next, k);
    }
}

#[test]
fn test_stream_k_conserves_iterations() {
    let tile = BlockShape::new(128, 256, 256);
    for &(m, n, k, units) in &[(1000, 1000, 4000, 20), (640, 1280, 3000, 24), (256, 256, 512, 3)] {
        let base = BlockScheduler::new(&problem(m, n, k), tile, 1).unwrap();
        let sk = StreamkScheduler::new(base, Swizzle { offset: 3, direction: SwizzleDirection::Zn },
                                       units);
        let (_, _, lk) = base.loops();
        assert_eq!(sk.normal_blocks() + sk.stream_blocks(), base.tiles());
        assert_eq!(sk.normal_blocks() % units, 0);

        let mut covered = vec![vec![false; lk]; sk.stream_blocks()];
        let mut normal = HashSet::new();
        for unit in 0..units {
            normal.extend(sk.normal_tasks(unit));
            let segments = sk.segments(unit);
            assert!(segments.len() <= 2);
            assert_eq!(sk.is_cross(unit), segments.len() == 2);
            for seg in segments {
                for kt in seg.k_tiles.clone() {
                    assert!(!covered[seg.block][kt], "k tile covered twice");
                    covered[seg.block][kt] = true;
                }
                assert!(sk.contributors(seg.block).contains(&(unit, seg.slot)));
            }
        }
        assert_eq!(normal.len(), sk.normal_blocks());
        assert!(covered.iter().flatten().all(|&c| c));
    }
}

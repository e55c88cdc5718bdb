extern crate tilegemm;

#[macro_use]
extern crate bencher;

use bencher::{black_box, Bencher};
use tilegemm::{Device, Layout, PlatformCapacities, ProblemShape};

// Compute GFlop/s
// by flop / s = 2 M N K / time


benchmark_main!(mat_mul_f32, mat_mul_f16, select_tiling);

fn device() -> Device {
    Device::new(PlatformCapacities::reference().with_units(8))
}

macro_rules! mat_mul {
    ($modname:ident, $ty:ty, $(($name:ident, $m:expr, $n:expr, $k:expr))+) => {
        mod $modname {
            use bencher::{Bencher};
            use tilegemm::{Element, MatMut, MatRef};
            $(
            pub fn $name(bench: &mut Bencher)
            {
                let device = super::device();
                let a = vec![<$ty as Element>::from_acc(1.); $m * $k];
                let b = vec![<$ty as Element>::from_acc(1.); $k * $n];
                let mut c = vec![<$ty as Element>::zero(); $m * $n];
                bench.iter(|| {
                    device.gemm(1.,
                                MatRef::row_major(&a, $m, $k),
                                MatRef::row_major(&b, $k, $n),
                                0.,
                                MatMut::row_major(&mut c, $m, $n))
                });
            }
            )+
        }
        benchmark_group!{ $modname, $($modname::$name),+ }
    };
}

mat_mul!{mat_mul_f32, f32,
    (m016, 16, 16, 16)
    (m064, 64, 64, 64)
    (m127, 127, 127, 127)
    (m256, 256, 256, 256)
    (tall_k, 64, 64, 4096)
    (thin_a, 1024, 64, 7)
}

mat_mul!{mat_mul_f16, tilegemm::f16,
    (m064, 64, 64, 64)
    (m256, 256, 256, 256)
}

fn select_square(bench: &mut Bencher) {
    let device = device();
    let p = ProblemShape::builder(4000, 4000, 4000).build().unwrap();
    bench.iter(|| device.select(black_box(&p)));
}

fn select_mixed_layouts(bench: &mut Bencher) {
    let device = device();
    let p = ProblemShape::builder(2048, 300, 9000)
        .layouts(Layout::ColumnMajor, Layout::RowMajor, Layout::RowMajor)
        .build()
        .unwrap();
    bench.iter(|| device.select(black_box(&p)));
}

benchmark_group!(select_tiling, select_square, select_mixed_layouts);

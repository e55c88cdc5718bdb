// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use core::cmp::min;

#[derive(Copy, Clone, Debug)]
pub struct RangeChunk { i: usize, n: usize, chunk: usize }

/// Create an iterator that splits `n` in chunks of size `chunk`;
/// the last item can be an uneven chunk.
///
/// Items are `(chunk index, chunk length)`.
pub fn range_chunk(n: usize, chunk: usize) -> RangeChunk {
    debug_assert_ne!(chunk, 0);
    RangeChunk {
        i: 0,
        n,
        chunk,
    }
}

impl Iterator for RangeChunk {
    type Item = (usize, usize);

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.n == 0 {
            None
        } else {
            let i = self.i;
            let rem = min(self.n, self.chunk);
            self.i += 1;
            self.n -= rem;
            Some((i, rem))
        }
    }
}

impl RangeChunk {
    /// Offset of chunk `index` in the original range.
    #[inline]
    pub fn start_of(&self, index: usize) -> usize {
        index * self.chunk
    }
}

#[inline]
pub fn round_up_to(x: usize, multiple_of: usize) -> usize {
    let (mut d, r) = (x / multiple_of, x % multiple_of);
    if r > 0 { d += 1; }
    d * multiple_of
}

#[inline]
pub fn ceil_div(x: usize, y: usize) -> usize {
    debug_assert_ne!(y, 0);
    (x + y - 1) / y
}

/// Split `0..n` in `total` contiguous parts and return the `index`th one.
///
/// Parts are as even as possible; trailing parts may be empty when `n` is
/// smaller than `total`.
pub fn static_part(n: usize, index: usize, total: usize) -> core::ops::Range<usize> {
    debug_assert_ne!(total, 0);
    debug_assert!(index < total);
    let per = ceil_div(n, total);
    let start = min(n, per * index);
    let end = min(n, start + per);
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_chunk_covers_range() {
        let chunks: Vec<_> = range_chunk(10, 4).collect();
        assert_eq!(chunks, vec![(0, 4), (1, 4), (2, 2)]);
        assert_eq!(range_chunk(0, 4).count(), 0);
        assert_eq!(range_chunk(8, 4).start_of(1), 4);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up_to(0, 16), 0);
        assert_eq!(round_up_to(1, 16), 16);
        assert_eq!(round_up_to(32, 16), 32);
        assert_eq!(ceil_div(4000, 256), 16);
        assert_eq!(ceil_div(1, 7), 1);
    }

    #[test]
    fn static_parts_partition() {
        for n in 0..40 {
            for total in 1..9 {
                let mut next = 0;
                for index in 0..total {
                    let part = static_part(n, index, total);
                    assert_eq!(part.start, next.min(n));
                    next = part.end;
                }
                assert_eq!(next, n);
            }
        }
    }
}

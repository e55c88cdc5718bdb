// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use rawpointer::PointerExt;

/// A raw pointer that engines on other threads may use.
///
/// Engines read shared operands and write disjoint parts of C and of the
/// workspace; each dereference is a promise that no other engine writes
/// the same element at the same time.
#[derive(Debug)]
pub struct Ptr<T>(*mut T);

impl<T> Copy for Ptr<T> {}
impl<T> Clone for Ptr<T> {
    fn clone(&self) -> Self { *self }
}

unsafe impl<T: Sync> Send for Ptr<T> {}
unsafe impl<T: Sync> Sync for Ptr<T> {}

impl<T> Ptr<T> {
    #[inline]
    pub(crate) fn new(ptr: *mut T) -> Self { Ptr(ptr) }

    #[inline(always)]
    pub fn ptr(self) -> *mut T { self.0 }

    #[inline(always)]
    pub unsafe fn add(self, i: usize) -> Self {
        Ptr(self.0.add(i))
    }

    /// Offset by `s` multiplied by `index`.
    #[inline(always)]
    pub unsafe fn stride_offset(self, s: isize, index: usize) -> Self {
        Ptr(self.0.stride_offset(s, index))
    }
}

// Copyright 2016 - 2018 Ulrik Sverdrup "bluss"
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::alloc::{Layout, handle_alloc_error};
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::{mem, cmp, slice};

/// Byte alignment of every tier buffer.
pub(crate) const BUFFER_ALIGN: usize = 64;

/// Fixed size, aligned buffer; backs tier slots and the workspace arena.
pub(crate) struct Alloc<T> { ptr: *mut T, len: usize, align: usize }

unsafe impl<T: Send> Send for Alloc<T> {}
unsafe impl<T: Sync> Sync for Alloc<T> {}

impl<T: Copy> Alloc<T> {
    /// Allocate `len` elements aligned to `align` bytes, all set to `elt`.
    pub fn filled(len: usize, align: usize, elt: T) -> Self {
        let align = cmp::max(align, mem::align_of::<T>());
        if len == 0 || mem::size_of::<T>() == 0 {
            return Alloc { ptr: NonNull::dangling().as_ptr(), len: 0, align };
        }
        let size = match mem::size_of::<T>().checked_mul(len) {
            Some(size) => size,
            None => panic!("buffer of {} elements overflows the address space", len),
        };
        debug_assert!(Layout::from_size_align(size, align).is_ok());
        unsafe {
            let layout = Layout::from_size_align_unchecked(size, align);
            let ptr = std::alloc::alloc(layout) as *mut T;
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            for i in 0..len {
                ptr::write(ptr.add(i), elt);
            }
            Alloc { ptr, len, align }
        }
    }
}

impl<T> Alloc<T> {
    /// Raw pointer to the first element, usable for writes through a shared
    /// borrow.
    ///
    /// The launch workspace is shared by every engine thread. Each thread
    /// writes only the regions the static `(unit, slot)` partition gives it,
    /// and no `&[T]` is formed over memory another thread may write while
    /// the launch runs.
    #[inline]
    pub fn ptr_mut(&self) -> *mut T { self.ptr }

    #[inline]
    pub fn len(&self) -> usize { self.len }
}

impl<T> Drop for Alloc<T> {
    fn drop(&mut self) {
        if self.len == 0 || mem::size_of::<T>() == 0 {
            return;
        }
        unsafe {
            let layout = Layout::from_size_align_unchecked(mem::size_of::<T>() * self.len, self.align);
            std::alloc::dealloc(self.ptr as _, layout);
        }
    }
}

impl<T> Deref for Alloc<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        unsafe {
            slice::from_raw_parts(self.ptr, self.len)
        }
    }
}

impl<T> DerefMut for Alloc<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe {
            slice::from_raw_parts_mut(self.ptr, self.len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_and_aligned() {
        let buf = Alloc::filled(100, BUFFER_ALIGN, 1.5f32);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.ptr_mut() as usize % BUFFER_ALIGN, 0);
        assert!(buf.iter().all(|&x| x == 1.5));
    }

    #[test]
    fn disjoint_writes_through_shared_borrow() {
        let buf = Alloc::filled(64, BUFFER_ALIGN, 0u32);
        crossbeam::scope(|s| {
            for part in 0..4 {
                let buf = &buf;
                s.spawn(move |_| {
                    for i in part * 16..(part + 1) * 16 {
                        unsafe { *buf.ptr_mut().add(i) = part as u32 + 1; }
                    }
                });
            }
        }).unwrap();
        for (i, &x) in buf.iter().enumerate() {
            assert_eq!(x, i as u32 / 16 + 1);
        }
    }

    #[test]
    fn empty_buffer() {
        let mut buf = Alloc::filled(0, BUFFER_ALIGN, 0u16);
        assert!(buf.is_empty());
        assert!(buf.iter_mut().next().is_none());
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Anonymous shared-memory mappings and typed placement.
//!
//! The supervisor creates every shared structure with [`SharedRegion`]
//! *before* forking children; `fork` then inherits the mapping at the same
//! address in every process, so plain references into the region stay
//! valid on both sides. Structures are addressed by offset or index, never
//! by absolute pointer stored inside the region itself.

#[macro_use]
extern crate log;

use core::{
    mem::{align_of, size_of},
    ops::Deref,
    ptr::NonNull,
};

use dberr::{DbError, DbResult};

mod tests;

/// Marker for types that may be placed in a shared mapping.
///
/// # Safety
///
/// Implementors must be `repr(C)`, contain no pointers, references, heap
/// allocations or other process-local handles, and must be in a valid
/// state when zero-initialised (atomics at zero, locks unlocked).
pub unsafe trait ShmSafe: Sync {}

/// An anonymous `MAP_SHARED` mapping holding one `T` plus optional
/// trailing bytes (ring buffers use the trailing space).
///
/// The mapping is zero-filled by the kernel, which is a valid initial
/// state for any [`ShmSafe`] type.
pub struct SharedRegion<T: ShmSafe> {
    ptr: NonNull<T>,
    map_len: usize,
    trailing: usize,
}

unsafe impl<T: ShmSafe> Send for SharedRegion<T> {}
unsafe impl<T: ShmSafe> Sync for SharedRegion<T> {}

impl<T: ShmSafe> SharedRegion<T> {
    /// Maps a region sized for `T` alone.
    pub fn create() -> DbResult<Self> {
        Self::create_with_trailing(0)
    }

    /// Maps a region sized for `T` followed by `trailing` shared bytes.
    pub fn create_with_trailing(trailing: usize) -> DbResult<Self> {
        // mmap returns page-aligned memory, which satisfies any repr(C)
        // struct alignment we use.
        debug_assert!(align_of::<T>() <= 4096);

        let map_len = size_of::<T>()
            .checked_add(trailing)
            .ok_or(DbError::InvalidState("shared region size overflow"))?;

        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                map_len.max(1),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            warn!("mmap of {map_len} shared bytes failed: errno {}", dberr::errno());
            return Err(DbError::last_os());
        }

        debug!("mapped {map_len} shared bytes at {ptr:p}");
        Ok(Self {
            // mmap never hands back null once MAP_FAILED is ruled out.
            ptr: unsafe { NonNull::new_unchecked(ptr as *mut T) },
            map_len,
            trailing,
        })
    }

    /// Pointer to the first trailing byte.
    pub fn trailing_ptr(&self) -> *mut u8 {
        unsafe { (self.ptr.as_ptr() as *mut u8).add(size_of::<T>()) }
    }

    /// Number of trailing bytes requested at creation.
    pub fn trailing_len(&self) -> usize {
        self.trailing
    }

    /// Gives up unmapping and hands out a `'static` reference.
    ///
    /// Shared structures normally live for the whole process tree anyway;
    /// leaking is what makes "latch memory is never freed" literally true.
    pub fn leak(self) -> &'static T {
        let r = unsafe { &*self.ptr.as_ptr() };
        core::mem::forget(self);
        r
    }
}

impl<T: ShmSafe> Deref for SharedRegion<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: ShmSafe> Drop for SharedRegion<T> {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.map_len.max(1)) };
        if rc != 0 {
            warn!("munmap failed: errno {}", dberr::errno());
        }
    }
}

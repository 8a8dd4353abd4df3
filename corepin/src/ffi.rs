//! C ABI for embedding runtimes.
//!
//! Masks cross the boundary as opaque `corepin_mask` pointers owned by the
//! caller, who must pass each of them to [`corepin_release`] exactly once.
//! Failures are reported with a sentinel return value and `errno`. See
//! `include/corepin.h` for the C declarations.

use crate::{AffinityError, CpuSet, get_affinity, reset_affinity, set_affinity};
use libc::{c_int, pid_t};
use std::ptr;
use tracing::debug;

/// Opaque mask handle given to C callers.
pub struct Mask(CpuSet);

impl Mask {
    pub fn cpu_set(&self) -> &CpuSet {
        &self.0
    }
}

fn set_errno(errno: c_int) {
    unsafe { *libc::__errno_location() = errno };
}

fn fail(err: &AffinityError) {
    debug!("{err}");
    set_errno(err.errno());
}

fn to_pid(pid: i64) -> Option<pid_t> {
    pid_t::try_from(pid).ok()
}

fn to_cpu(cpu: i64) -> Option<usize> {
    usize::try_from(cpu).ok()
}

/// Reads the affinity mask of `pid` (0 is the calling thread).
///
/// Returns a new mask, or null with `errno` set on failure.
#[unsafe(no_mangle)]
pub extern "C" fn corepin_get_affinity(pid: i64) -> *mut Mask {
    let Some(pid) = to_pid(pid) else {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    };
    match get_affinity(pid) {
        Ok(set) => Box::into_raw(Box::new(Mask(set))),
        Err(err) => {
            fail(&err);
            ptr::null_mut()
        }
    }
}

/// Pins `pid` to the single CPU `cpu`.
///
/// Returns 0 on success, or -1 with `errno` set on failure.
#[unsafe(no_mangle)]
pub extern "C" fn corepin_set_affinity(pid: i64, cpu: i64) -> c_int {
    let (Some(pid), Some(cpu)) = (to_pid(pid), to_cpu(cpu)) else {
        set_errno(libc::EINVAL);
        return -1;
    };
    match set_affinity(pid, cpu) {
        Ok(()) => 0,
        Err(err) => {
            fail(&err);
            -1
        }
    }
}

/// Sets the affinity of `pid` to the CPUs in `mask`. The mask stays owned by
/// the caller.
///
/// Returns 0 on success, or -1 with `errno` set on failure.
///
/// # Safety
///
/// `mask` must be null or a pointer returned by [`corepin_get_affinity`] that
/// has not been released.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn corepin_reset_affinity(pid: i64, mask: *const Mask) -> c_int {
    let Some(pid) = to_pid(pid) else {
        set_errno(libc::EINVAL);
        return -1;
    };
    // SAFETY: guaranteed by the caller
    let Some(mask) = (unsafe { mask.as_ref() }) else {
        set_errno(libc::EINVAL);
        return -1;
    };
    match reset_affinity(pid, &mask.0) {
        Ok(()) => 0,
        Err(err) => {
            fail(&err);
            -1
        }
    }
}

/// Frees a mask. Null is ignored.
///
/// # Safety
///
/// `mask` must be null or a pointer returned by [`corepin_get_affinity`] that
/// has not been released yet. It must not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn corepin_release(mask: *mut Mask) {
    if !mask.is_null() {
        // SAFETY: the pointer comes from Box::into_raw in corepin_get_affinity
        drop(unsafe { Box::from_raw(mask) });
    }
}

/// Returns 1 if `cpu` is in `mask`, 0 if it is not, or -1 with `errno` set if
/// `mask` is null.
///
/// # Safety
///
/// Same requirements on `mask` as [`corepin_reset_affinity`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn corepin_mask_contains(mask: *const Mask, cpu: i64) -> c_int {
    // SAFETY: guaranteed by the caller
    let Some(mask) = (unsafe { mask.as_ref() }) else {
        set_errno(libc::EINVAL);
        return -1;
    };
    match to_cpu(cpu) {
        Some(cpu) => mask.0.contains(cpu).into(),
        None => 0,
    }
}

/// Returns the number of CPUs in `mask`, or -1 with `errno` set if `mask` is
/// null.
///
/// # Safety
///
/// Same requirements on `mask` as [`corepin_reset_affinity`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn corepin_mask_count(mask: *const Mask) -> i64 {
    // SAFETY: guaranteed by the caller
    match unsafe { mask.as_ref() } {
        Some(mask) => mask.0.count() as i64,
        None => {
            set_errno(libc::EINVAL);
            -1
        }
    }
}

//! CPU affinity control for a host process scheduler.
//!
//! This crate reads, pins and restores the Linux scheduler affinity mask of a
//! process or thread. Masks are returned as owned [`CpuSet`] values that are
//! released when dropped. The [`ffi`] module exposes the same operations
//! through a C ABI for runtimes that embed this library.

#[cfg(not(target_os = "linux"))]
compile_error!("corepin only supports the Linux sched_getaffinity/sched_setaffinity mask model");

mod affinity;
mod cpu_set;
mod error;
pub mod ffi;

pub use affinity::{CURRENT, PinGuard, get_affinity, pin, release, reset_affinity, set_affinity};
pub use cpu_set::{CpuSet, Iter, MAX_MASK_BITS, platform_bits};
pub use error::{AffinityError, ParseCpuSetError};

pub mod prelude {
    pub use crate::{
        AffinityError, CURRENT, CpuSet, PinGuard, get_affinity, pin, reset_affinity, set_affinity,
    };
}

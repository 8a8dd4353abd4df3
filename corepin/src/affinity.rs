use crate::{
    cpu_set::{self, CpuSet, MAX_MASK_BITS, platform_bits},
    error::AffinityError,
};
use libc::pid_t;
use std::io;
use tracing::{debug, trace, warn};

/// Identifier that addresses the calling thread.
pub const CURRENT: pid_t = 0;

const GET_OP: &str = "sched_getaffinity";
const SET_OP: &str = "sched_setaffinity";

/// Reads the affinity mask of `pid`.
///
/// The returned set is a snapshot taken at the time of the call, owned by the
/// caller. If the kernel mask is wider than [`platform_bits`] the query is
/// retried with a larger set.
pub fn get_affinity(pid: pid_t) -> Result<CpuSet, AffinityError> {
    let set = query_growing(platform_bits(), |set| {
        let r = unsafe { libc::sched_getaffinity(pid, set.byte_len(), set.as_mut_ptr()) };
        if r == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    })
    .map_err(|source| AffinityError::Os {
        op: GET_OP,
        pid,
        source,
    })?;
    debug!(pid, mask = %set, "read affinity");
    Ok(set)
}

/// Runs `query` on a set of `start` bits, doubling the width while the query
/// fails with `EINVAL`, up to [`MAX_MASK_BITS`]. The platform width is raised
/// to the width that succeeded.
pub(crate) fn query_growing(
    start: usize,
    mut query: impl FnMut(&mut CpuSet) -> io::Result<()>,
) -> io::Result<CpuSet> {
    let mut set = CpuSet::with_capacity(start);
    loop {
        let err = match query(&mut set) {
            Ok(()) => {
                cpu_set::raise_platform_bits(set.capacity());
                return Ok(set);
            }
            Err(err) => err,
        };
        let bits = (set.capacity() * 2).max(libc::CPU_SETSIZE as usize);
        if err.raw_os_error() != Some(libc::EINVAL) || bits > MAX_MASK_BITS {
            return Err(err);
        }
        trace!(bits, "kernel mask wider than buffer, retrying");
        set = CpuSet::with_capacity(bits);
    }
}

/// Pins `pid` to the single CPU `cpu`.
///
/// The index is not checked against the CPUs present in the machine. The
/// kernel rejects CPUs that are not online with `EINVAL`.
pub fn set_affinity(pid: pid_t, cpu: usize) -> Result<(), AffinityError> {
    if cpu >= MAX_MASK_BITS {
        return Err(AffinityError::CpuOutOfRange {
            cpu,
            max: MAX_MASK_BITS,
        });
    }
    let mut set = CpuSet::with_capacity(platform_bits().max(cpu + 1));
    set.insert(cpu);
    apply(pid, &set)
}

/// Sets the affinity of `pid` to exactly the CPUs in `set`.
///
/// This is used to undo [`set_affinity`] with a mask obtained earlier from
/// [`get_affinity`]. The set remains owned by the caller.
pub fn reset_affinity(pid: pid_t, set: &CpuSet) -> Result<(), AffinityError> {
    apply(pid, set)
}

/// Releases a mask obtained from [`get_affinity`].
pub fn release(set: CpuSet) {
    set.release()
}

fn apply(pid: pid_t, set: &CpuSet) -> Result<(), AffinityError> {
    let r = unsafe { libc::sched_setaffinity(pid, set.byte_len(), set.as_ptr()) };
    if r != 0 {
        return Err(AffinityError::last_os_error(SET_OP, pid));
    }
    debug!(pid, mask = %set, "set affinity");
    Ok(())
}

/// Pins `pid` to `cpu` until the returned guard is dropped.
pub fn pin(pid: pid_t, cpu: usize) -> Result<PinGuard, AffinityError> {
    let saved = get_affinity(pid)?;
    set_affinity(pid, cpu)?;
    Ok(PinGuard {
        pid,
        cpu,
        saved,
        restored: false,
    })
}

/// Restores the affinity captured by [`pin`] when dropped.
///
/// A failure to restore during drop is logged. Use [`PinGuard::restore`] to
/// handle it instead.
#[must_use = "dropping the guard restores the previous affinity immediately"]
#[derive(Debug)]
pub struct PinGuard {
    pid: pid_t,
    cpu: usize,
    saved: CpuSet,
    restored: bool,
}

impl PinGuard {
    pub fn pid(&self) -> pid_t {
        self.pid
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Mask that was in effect before pinning.
    pub fn saved(&self) -> &CpuSet {
        &self.saved
    }

    /// Restores the saved mask and returns it.
    ///
    /// On failure the saved mask is returned together with the error, so that
    /// the caller can retry with [`reset_affinity`]. The guard does not retry
    /// when dropped.
    pub fn restore(mut self) -> Result<CpuSet, (AffinityError, CpuSet)> {
        self.restored = true;
        let saved = std::mem::replace(&mut self.saved, CpuSet::with_capacity(0));
        match reset_affinity(self.pid, &saved) {
            Ok(()) => Ok(saved),
            Err(err) => Err((err, saved)),
        }
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(err) = reset_affinity(self.pid, &self.saved) {
            warn!(pid = self.pid, mask = %self.saved, "could not restore affinity: {err}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cpu_out_of_range() {
        let err = set_affinity(CURRENT, MAX_MASK_BITS).unwrap_err();
        assert!(matches!(
            err,
            AffinityError::CpuOutOfRange {
                cpu: MAX_MASK_BITS,
                ..
            }
        ));
        assert_eq!(err.raw_os_error(), None);
        let err = set_affinity(CURRENT, usize::MAX).unwrap_err();
        assert!(matches!(err, AffinityError::CpuOutOfRange { .. }));
    }

    #[test]
    fn negative_pid() {
        let err = get_affinity(-1).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
        let err = set_affinity(-1, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
    }

    fn einval() -> io::Error {
        io::Error::from_raw_os_error(libc::EINVAL)
    }

    #[test]
    fn query_grows_until_accepted() {
        let mut tried = Vec::new();
        let set = query_growing(1024, |set| {
            tried.push(set.capacity());
            if set.capacity() < 8192 {
                Err(einval())
            } else {
                set.insert(5000);
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(tried, vec![1024, 2048, 4096, 8192]);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![5000]);
        assert!(platform_bits() >= 8192);
        assert!(CpuSet::new().capacity() >= 8192);
    }

    #[test]
    fn query_stops_at_max_width() {
        let mut tried = Vec::new();
        let err = query_growing(1024, |set| {
            tried.push(set.capacity());
            Err(einval())
        })
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        assert_eq!(tried.first(), Some(&1024));
        assert_eq!(tried.last(), Some(&MAX_MASK_BITS));
        assert!(tried.windows(2).all(|w| w[1] == 2 * w[0]));
    }

    #[test]
    fn query_other_errors_are_not_retried() {
        let mut calls = 0;
        let err = query_growing(1024, |_| {
            calls += 1;
            Err(io::Error::from_raw_os_error(libc::EPERM))
        })
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EPERM));
        assert_eq!(calls, 1);
    }
}

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AffinityError {
    #[error("{op} failed for pid {pid}")]
    Os {
        op: &'static str,
        pid: libc::pid_t,
        #[source]
        source: io::Error,
    },
    #[error("cpu index {cpu} does not fit in the largest supported mask ({max} bits)")]
    CpuOutOfRange { cpu: usize, max: usize },
}

impl AffinityError {
    pub(crate) fn last_os_error(op: &'static str, pid: libc::pid_t) -> AffinityError {
        AffinityError::Os {
            op,
            pid,
            source: io::Error::last_os_error(),
        }
    }

    /// Returns the errno reported by the kernel, if this is an OS error.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            AffinityError::Os { source, .. } => source.raw_os_error(),
            AffinityError::CpuOutOfRange { .. } => None,
        }
    }

    /// errno equivalent, used to report the error through the C ABI.
    pub(crate) fn errno(&self) -> i32 {
        self.raw_os_error().unwrap_or(libc::EINVAL)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseCpuSetError {
    #[error("invalid cpu index {0:?}")]
    InvalidIndex(String),
    #[error("invalid cpu range {0:?}")]
    InvalidRange(String),
    #[error("cpu index {0} exceeds the largest supported mask")]
    OutOfRange(usize),
}

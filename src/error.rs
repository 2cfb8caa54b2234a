//! Closed error enum for recoverable failures. Same shape as the teacher's
//! `error.rs`: a `#[repr(isize)]` enum with a `Display` impl, no
//! backtrace/context machinery (xv6's error model is binary: -1 or a null
//! pointer means failure).

#[repr(isize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    AllocError = -1,
    InvalidPageError = -2,
    OutOfProcs = -3,
    NoSuchPid = -4,
    InvalidCpu = -5,
    CopyFault = -6,
}

impl KernelError {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelError::AllocError => "alloc error",
            KernelError::InvalidPageError => "invalid page",
            KernelError::OutOfProcs => "out of process slots",
            KernelError::NoSuchPid => "no such pid",
            KernelError::InvalidCpu => "cpu index out of range",
            KernelError::CopyFault => "copyin/copyout fault",
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

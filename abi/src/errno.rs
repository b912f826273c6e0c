//! Kernel-wide status codes.
//!
//! Every fallible kernel service returns `KResult<T>`; syscall handlers
//! translate the error into the value userland sees in eax.

/// POSIX-shaped error kinds with their conventional numeric values.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EINTR = 4,
    EIO = 5,
    E2BIG = 7,
    ENOEXEC = 8,
    EBADF = 9,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    EXDEV = 18,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    ENFILE = 23,
    EMFILE = 24,
    ENOTTY = 25,
    EFBIG = 27,
    ENOSPC = 28,
    ESPIPE = 29,
    EMLINK = 31,
    EPIPE = 32,
    ERANGE = 34,
    ENAMETOOLONG = 36,
    ENOTEMPTY = 39,
    ELOOP = 40,
    EOVERFLOW = 75,
}

pub type KResult<T> = Result<T, Errno>;

/// Keep the first failure while still running every cleanup step.
///
/// Teardown paths (close, unmount, exit) compose several fallible
/// operations and must report the first error without skipping the rest.
#[inline]
pub fn retain_first_failure(acc: &mut KResult<()>, next: KResult<()>) {
    if acc.is_ok() {
        *acc = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retains_only_the_first_failure() {
        let mut acc: KResult<()> = Ok(());
        retain_first_failure(&mut acc, Ok(()));
        assert_eq!(acc, Ok(()));
        retain_first_failure(&mut acc, Err(Errno::EIO));
        retain_first_failure(&mut acc, Err(Errno::ENOENT));
        assert_eq!(acc, Err(Errno::EIO));
    }
}

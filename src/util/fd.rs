use std::{io, os::fd::RawFd};

use tracing::{debug, warn};

pub fn close_fd_quiet(fd: RawFd) {
    // After this call, consider fd dead in all code paths.
    let ret = unsafe { libc::close(fd) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EBADF) => {
                warn!(fd, "close -> EBADF (double close / invalid fd)");
            }
            Some(libc::EINTR) => {
                debug!(fd, "close interrupted by signal (EINTR); not retrying");
            }
            _ => {
                warn!(fd, error = %err, "close failed");
            }
        }
    }
}

/// Shut both directions of a socket so operations pending on it complete.
pub fn shutdown_fd_quiet(fd: RawFd) {
    let ret = unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOTCONN) {
            debug!(fd, error = %err, "shutdown failed");
        }
    }
}

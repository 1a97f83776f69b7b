//! Submission/completion ring abstraction
//!
//! Workers talk to their ring only through the [`Ring`] trait so the event
//! loops can be driven by io_uring in production and by a recording ring in
//! tests.

pub mod uring;

#[cfg(test)]
pub(crate) mod testing;

use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::Result;

pub use uring::{UringRing, probe_features};

/// One operation to place in a submission slot.
#[derive(Copy, Clone, Debug)]
pub enum Op {
    Accept {
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
    },
    Recv {
        fd: RawFd,
        buf: *mut u8,
        len: u32,
    },
    Send {
        fd: RawFd,
        buf: *const u8,
        len: u32,
    },
    Close {
        fd: RawFd,
    },
    /// Post a completion carrying `result` and `user_data` onto another ring.
    MsgRing {
        ring_fd: RawFd,
        result: i32,
        user_data: u64,
    },
}

/// A finished operation: the echoed tag and the kernel's result code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Completion {
    pub user_data: u64,
    pub result: i32,
}

/// Kernel capabilities that change how workers exchange descriptors.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Features {
    /// `IORING_OP_MSG_RING` is available (Linux 5.18+).
    pub ring_messaging: bool,
}

pub trait Ring {
    /// Descriptor of the ring itself, the target of ring messages.
    fn fd(&self) -> RawFd;

    /// Place `op` tagged with `user_data` in the submission queue.
    ///
    /// # Safety
    ///
    /// Every pointer carried by `op` must stay valid until the matching
    /// completion has been drained.
    unsafe fn push(&mut self, op: Op, user_data: u64) -> Result<()>;

    /// Submit queued entries and block until `want` completions are ready or
    /// `timeout` elapses. Timeouts and interrupts are not errors.
    fn submit_and_wait(&mut self, want: usize, timeout: Option<Duration>) -> Result<usize>;

    /// Move every ready completion into `out`.
    fn drain(&mut self, out: &mut Vec<Completion>);
}

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};

use super::{Completion, Op, Ring};

/// What a [`TestRing`] saw pushed, without the raw pointers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Submitted {
    Accept { fd: RawFd },
    Recv { fd: RawFd, len: u32 },
    Send { fd: RawFd, data: Vec<u8> },
    Close { fd: RawFd },
    MsgRing { ring_fd: RawFd, result: i32, user_data: u64 },
}

/// Recording ring: keeps every submission and hands out completions the test
/// queued by hand.
pub struct TestRing {
    fd: RawFd,
    pub submitted: Vec<(Submitted, u64)>,
    pending: VecDeque<Completion>,
    /// Number of upcoming pushes to reject as if the queue were full.
    pub fail_next: usize,
    pub waits: usize,
    /// Pushes not yet handed to the kernel by a submit.
    pub unsubmitted: usize,
    /// Raised while waiting, as if a stop signal landed mid-wait.
    pub raise_on_wait: Option<Arc<AtomicBool>>,
    recv_buffers: HashMap<RawFd, (usize, u32)>,
}

impl TestRing {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            submitted: Vec::new(),
            pending: VecDeque::new(),
            fail_next: 0,
            waits: 0,
            unsubmitted: 0,
            raise_on_wait: None,
            recv_buffers: HashMap::new(),
        }
    }

    pub fn complete(&mut self, user_data: u64, result: i32) {
        self.pending.push_back(Completion { user_data, result });
    }

    /// Fill the buffer of the outstanding recv on `fd` and queue its completion.
    pub fn complete_recv(&mut self, fd: RawFd, data: &[u8]) {
        let (ptr, len) = self
            .recv_buffers
            .remove(&fd)
            .expect("no recv in flight for fd");
        assert!(data.len() <= len as usize, "recv data larger than buffer");
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len());
        }
        self.complete(fd as u64, data.len() as i32);
    }

    pub fn take_submitted(&mut self) -> Vec<(Submitted, u64)> {
        std::mem::take(&mut self.submitted)
    }

    pub fn last(&self) -> Option<&(Submitted, u64)> {
        self.submitted.last()
    }

    pub fn count(&self, pred: impl Fn(&Submitted) -> bool) -> usize {
        self.submitted.iter().filter(|(s, _)| pred(s)).count()
    }
}

impl Ring for TestRing {
    fn fd(&self) -> RawFd {
        self.fd
    }

    unsafe fn push(&mut self, op: Op, user_data: u64) -> Result<()> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(Error::SubmissionQueueFull);
        }
        let recorded = match op {
            Op::Accept { fd, .. } => Submitted::Accept { fd },
            Op::Recv { fd, buf, len } => {
                self.recv_buffers.insert(fd, (buf as usize, len));
                Submitted::Recv { fd, len }
            }
            Op::Send { fd, buf, len } => {
                let data = unsafe { std::slice::from_raw_parts(buf, len as usize) }.to_vec();
                Submitted::Send { fd, data }
            }
            Op::Close { fd } => Submitted::Close { fd },
            Op::MsgRing {
                ring_fd,
                result,
                user_data,
            } => Submitted::MsgRing {
                ring_fd,
                result,
                user_data,
            },
        };
        self.submitted.push((recorded, user_data));
        self.unsubmitted += 1;
        Ok(())
    }

    fn submit_and_wait(&mut self, _want: usize, _timeout: Option<Duration>) -> Result<usize> {
        self.waits += 1;
        self.unsubmitted = 0;
        if let Some(flag) = &self.raise_on_wait {
            flag.store(true, Ordering::Release);
        }
        Ok(self.pending.len())
    }

    fn drain(&mut self, out: &mut Vec<Completion>) {
        out.extend(self.pending.drain(..));
    }
}

/// Fill `storage` the way the kernel does for an IPv4 peer.
pub fn write_sockaddr_v4(storage: &mut libc::sockaddr_storage, addr: SocketAddrV4) {
    let mut st: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    st.sin_family = libc::AF_INET as libc::sa_family_t;
    st.sin_port = addr.port().to_be();
    st.sin_addr = libc::in_addr {
        s_addr: u32::from_be_bytes(addr.ip().octets()).to_be(),
    };
    unsafe { std::ptr::write(storage as *mut _ as *mut libc::sockaddr_in, st) };
}

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use io_uring::types::{Fd, SubmitArgs, Timespec};
use io_uring::{IoUring, Probe, opcode};
use tracing::debug;

use crate::error::{Error, Result};

use super::{Completion, Features, Op, Ring};

/// io_uring-backed ring, one per worker thread.
pub struct UringRing {
    ring: IoUring,
}

impl UringRing {
    pub fn new(entries: u32) -> io::Result<Self> {
        Ok(Self {
            ring: IoUring::new(entries)?,
        })
    }
}

impl Ring for UringRing {
    fn fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }

    unsafe fn push(&mut self, op: Op, user_data: u64) -> Result<()> {
        let entry = match op {
            Op::Accept { fd, addr, addrlen } => opcode::Accept::new(Fd(fd), addr, addrlen).build(),
            Op::Recv { fd, buf, len } => opcode::Recv::new(Fd(fd), buf, len).build(),
            Op::Send { fd, buf, len } => opcode::Send::new(Fd(fd), buf, len).build(),
            Op::Close { fd } => opcode::Close::new(Fd(fd)).build(),
            Op::MsgRing {
                ring_fd,
                result,
                user_data,
            } => opcode::MsgRingData::new(Fd(ring_fd), result, user_data, None).build(),
        }
        .user_data(user_data);

        if unsafe { self.ring.submission().push(&entry) }.is_ok() {
            return Ok(());
        }

        // full: hand the queued entries to the kernel and try once more
        if let Err(err) = self.ring.submit() {
            debug!(error = %err, "submit on full queue failed");
            return Err(Error::SubmissionQueueFull);
        }
        unsafe { self.ring.submission().push(&entry) }.map_err(|_| Error::SubmissionQueueFull)
    }

    fn submit_and_wait(&mut self, want: usize, timeout: Option<Duration>) -> Result<usize> {
        let res = match timeout {
            Some(t) => {
                let ts = Timespec::new().sec(t.as_secs()).nsec(t.subsec_nanos());
                let args = SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(want, &args)
            }
            None => self.ring.submit_and_wait(want),
        };

        match res {
            Ok(n) => Ok(n),
            Err(e) => match e.raw_os_error() {
                Some(libc::ETIME) | Some(libc::EINTR) => Ok(0),
                // completion queue overflowed; draining makes room
                Some(libc::EBUSY) => {
                    debug!("completion queue busy");
                    Ok(0)
                }
                _ => Err(e.into()),
            },
        }
    }

    fn drain(&mut self, out: &mut Vec<Completion>) {
        out.extend(self.ring.completion().map(|cqe| Completion {
            user_data: cqe.user_data(),
            result: cqe.result(),
        }));
    }
}

/// Probe the running kernel for the operations the engine can take advantage of.
pub fn probe_features() -> Features {
    match IoUring::new(8) {
        Ok(ring) => {
            let mut probe = Probe::new();
            if ring.submitter().register_probe(&mut probe).is_err() {
                return Features::default();
            }
            Features {
                ring_messaging: probe.is_supported(opcode::MsgRingData::CODE),
            }
        }
        Err(_) => Features::default(),
    }
}

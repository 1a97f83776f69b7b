use std::net::SocketAddr;
use std::os::fd::RawFd;

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::ring::{Features, Ring};

use super::Worker;
use super::uring_ops::post_msg_ring;

/// Per-worker receiving side of a connection handoff
///
/// The accepting thread writes, the owning worker reads. Remote addresses do
/// not fit in a completion tag, so they travel through the map keyed by
/// descriptor. The queue only exists when the kernel cannot post descriptors
/// between rings.
pub struct Inbox {
    socket_addresses: DashMap<RawFd, SocketAddr>,
    conn_queue: Option<SegQueue<RawFd>>,
}

impl Inbox {
    pub fn new(features: Features) -> Self {
        Self {
            socket_addresses: DashMap::new(),
            conn_queue: (!features.ring_messaging).then(SegQueue::new),
        }
    }

    pub fn set_socket_addr(&self, fd: RawFd, addr: SocketAddr) {
        self.socket_addresses.insert(fd, addr);
    }

    /// Read and delete the stored address in one step.
    pub fn take_socket_addr(&self, fd: RawFd) -> Option<SocketAddr> {
        self.socket_addresses.remove(&fd).map(|(_, addr)| addr)
    }

    pub fn pending_addresses(&self) -> usize {
        self.socket_addresses.len()
    }

    pub fn push(&self, fd: RawFd) -> Result<()> {
        let queue = self.conn_queue.as_ref().ok_or(Error::ConnectionQueueMissing)?;
        queue.push(fd);
        Ok(())
    }

    pub fn pop(&self) -> Option<RawFd> {
        self.conn_queue.as_ref().and_then(|q| q.pop())
    }

    pub fn has_queue(&self) -> bool {
        self.conn_queue.is_some()
    }
}

/// Transfer an accepted descriptor to `target`.
///
/// With ring messaging the post is only queued on `ring`; the target cannot
/// see it before the next submit, by which time its address is stored.
pub fn hand_off<R: Ring>(
    ring: &mut R,
    features: Features,
    target: &dyn Worker,
    fd: RawFd,
    addr: Option<SocketAddr>,
) -> Result<()> {
    debug!(fd, worker = target.index(), native = features.ring_messaging, "handing off connection");
    if features.ring_messaging {
        post_msg_ring(ring, target.ring_fd(), fd)?;
        if let Some(addr) = addr {
            target.set_socket_addr(fd, addr);
        }
        Ok(())
    } else {
        if let Some(addr) = addr {
            target.set_socket_addr(fd, addr);
        }
        target.add_conn_to_queue(fd)
    }
}

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::core::connection::Connection;

/// Connections tracked by one worker, indexed directly by descriptor
///
/// Descriptors are small dense integers, so a vector of optional slots is
/// used instead of a map. The number of open connections is mirrored into an
/// atomic counter that other threads (the load balancer) read without locking.
pub struct ConnectionRegistry {
    conns: Vec<Option<Connection>>,
    open: Arc<AtomicUsize>,
    read_buffer_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(initial_capacity: usize, read_buffer_capacity: usize) -> Self {
        Self {
            conns: Vec::with_capacity(initial_capacity),
            open: Arc::new(AtomicUsize::new(0)),
            read_buffer_capacity,
        }
    }

    /// Shared handle on the open-connection count.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.open)
    }

    /// Start tracking `fd`. Returns `None` if it is already tracked.
    pub fn register(&mut self, fd: RawFd) -> Option<&mut Connection> {
        let idx = usize::try_from(fd).ok()?;
        if idx >= self.conns.len() {
            self.conns.resize_with(idx + 1, || None);
        }
        let slot = &mut self.conns[idx];
        if slot.is_some() {
            return None;
        }
        self.open.fetch_add(1, Ordering::Release);
        Some(slot.insert(Connection::new(fd, self.read_buffer_capacity)))
    }

    pub fn get(&self, fd: RawFd) -> Option<&Connection> {
        let idx = usize::try_from(fd).ok()?;
        self.conns.get(idx).and_then(|c| c.as_ref())
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        let idx = usize::try_from(fd).ok()?;
        self.conns.get_mut(idx).and_then(|c| c.as_mut())
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.get(fd).is_some()
    }

    /// Stop tracking `fd` and hand back its connection. The descriptor itself
    /// is not closed.
    pub fn release(&mut self, fd: RawFd) -> Option<Connection> {
        let idx = usize::try_from(fd).ok()?;
        let conn = self.conns.get_mut(idx).and_then(|c| c.take())?;
        self.open.fetch_sub(1, Ordering::Release);
        Some(conn)
    }

    /// Descriptors of the tracked connections matching `filter`.
    pub fn fds_where(&self, filter: impl Fn(&Connection) -> bool) -> Vec<RawFd> {
        self.conns
            .iter()
            .flatten()
            .filter(|c| filter(c))
            .map(|c| c.fd())
            .collect()
    }

    pub fn active_connections(&self, filter: impl Fn(&Connection) -> bool) -> usize {
        self.conns.iter().flatten().filter(|c| filter(c)).count()
    }

    pub fn len(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_closed(&self) -> bool {
        self.is_empty()
    }
}

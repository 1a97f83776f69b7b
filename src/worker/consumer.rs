use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::core::connection::ConnState;
use crate::core::user_data::{ADD_CONN_FLAG, CLOSE_CONN_FLAG, WRITE_DATA_FLAG, fd_of, has_flag};
use crate::error::{Error, Result};
use crate::ring::{Completion, Features, Ring};
use crate::util::fd::{close_fd_quiet, shutdown_fd_quiet};

use super::handler::EventHandler;
use super::handoff::Inbox;
use super::registry::ConnectionRegistry;
use super::uring_ops::{post_close, post_recv, post_send};
use super::{Worker, WorkerEvent};

/// A worker that serves connections handed to it
///
/// The shared half (flags, counters, inbox) is read by other threads; the
/// event loop itself is parked in a mutex until `run` takes it onto the
/// worker's own thread.
pub struct ConsumerWorker<R, H> {
    index: AtomicUsize,
    ring_fd: RawFd,
    started: AtomicBool,
    shutdown: AtomicBool,
    active: Arc<AtomicUsize>,
    inbox: Inbox,
    events: Option<flume::Sender<WorkerEvent>>,
    event_loop: Mutex<Option<EventLoop<R, H>>>,
}

/// State owned by the thread running the loop.
pub(crate) struct EventLoop<R, H> {
    ring: R,
    registry: ConnectionRegistry,
    handler: H,
    local_addr: Option<SocketAddr>,
    wait_timeout: Duration,
    shutdown_in_progress: bool,
    completions: Vec<Completion>,
    index: usize,
}

impl<R: Ring, H: EventHandler> ConsumerWorker<R, H> {
    pub fn new(
        index: usize,
        ring: R,
        handler: H,
        local_addr: Option<SocketAddr>,
        features: Features,
        config: &WorkerConfig,
        events: Option<flume::Sender<WorkerEvent>>,
    ) -> Self {
        let registry =
            ConnectionRegistry::new(config.registry_capacity, config.read_buffer_capacity);
        let active = registry.counter();
        let ring_fd = ring.fd();

        Self {
            index: AtomicUsize::new(index),
            ring_fd,
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            active,
            inbox: Inbox::new(features),
            events,
            event_loop: Mutex::new(Some(EventLoop {
                ring,
                registry,
                handler,
                local_addr,
                wait_timeout: config.wait_timeout,
                shutdown_in_progress: false,
                completions: Vec::with_capacity(config.ring_size as usize),
                index,
            })),
        }
    }

    fn notify(&self, event: WorkerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn prepare(&self, ev: &mut EventLoop<R, H>) {
        ev.index = self.index.load(Ordering::Relaxed);
        self.started.store(true, Ordering::Release);
        self.notify(WorkerEvent::Started(ev.index));
    }

    /// One pass of the loop. Returns true once shutdown has drained every
    /// connection.
    pub(crate) fn iterate(&self, ev: &mut EventLoop<R, H>) -> Result<bool> {
        if self.shutdown.load(Ordering::Acquire) && !ev.shutdown_in_progress {
            ev.close_all_conns();
        }
        if ev.finished() {
            return Ok(true);
        }

        ev.ring.submit_and_wait(1, Some(ev.wait_timeout))?;

        let mut completions = std::mem::take(&mut ev.completions);
        ev.ring.drain(&mut completions);
        for cqe in completions.drain(..) {
            ev.dispatch(&self.inbox, cqe);
        }
        ev.completions = completions;

        if self.inbox.has_queue() {
            ev.claim_queued_conns(&self.inbox);
        }

        Ok(ev.finished())
    }

    fn run_loop(&self, ev: &mut EventLoop<R, H>) -> Result<()> {
        info!(worker = ev.index, "starting consumer loop");
        self.prepare(ev);
        while !self.iterate(ev)? {}
        info!(worker = ev.index, "consumer loop finished");
        self.notify(WorkerEvent::Finished(ev.index));
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn take_loop(&self) -> EventLoop<R, H> {
        self.event_loop.lock().take().expect("loop already taken")
    }

    #[cfg(test)]
    pub(crate) fn inbox(&self) -> &Inbox {
        &self.inbox
    }
}

impl<R, H> Worker for ConsumerWorker<R, H>
where
    R: Ring + Send + 'static,
    H: EventHandler + 'static,
{
    fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn index(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::Relaxed);
    }

    fn run(&self, index: usize) -> Result<()> {
        self.set_index(index);
        let mut ev = self.event_loop.lock().take().ok_or(Error::AlreadyRunning)?;
        let res = self.run_loop(&mut ev);
        if let Err(err) = &res {
            error!(worker = index, error = %err, "consumer loop failed");
        }
        res
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn add_conn_to_queue(&self, fd: RawFd) -> Result<()> {
        self.inbox.push(fd)
    }

    fn set_socket_addr(&self, fd: RawFd, addr: SocketAddr) {
        self.inbox.set_socket_addr(fd, addr);
    }

    fn take_socket_addr(&self, fd: RawFd) -> Option<SocketAddr> {
        self.inbox.take_socket_addr(fd)
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn ring_fd(&self) -> RawFd {
        self.ring_fd
    }
}

impl<R: Ring, H: EventHandler> EventLoop<R, H> {
    fn finished(&self) -> bool {
        self.shutdown_in_progress && self.registry.all_closed()
    }

    fn dispatch(&mut self, inbox: &Inbox, cqe: Completion) {
        let tag = cqe.user_data;

        if has_flag(tag, ADD_CONN_FLAG) {
            if cqe.result < 0 {
                error!(
                    worker = self.index,
                    fd = fd_of(tag),
                    error = %io::Error::from_raw_os_error(-cqe.result),
                    "ring message failed"
                );
                return;
            }
            self.claim_connection(inbox, cqe.result);
            return;
        }

        let fd = fd_of(tag);
        if fd <= libc::STDERR_FILENO {
            error!(worker = self.index, fd, "invalid file descriptor");
            return;
        }
        if !self.registry.contains(fd) {
            debug!(worker = self.index, fd, "completion for untracked connection");
            return;
        }
        self.handle_conn(fd, tag, cqe.result);
    }

    /// Start serving a descriptor handed over by another thread. Both the
    /// ring-message path and the queue path end here.
    fn claim_connection(&mut self, inbox: &Inbox, fd: RawFd) {
        let local_addr = self.local_addr;
        let Some(conn) = self.registry.register(fd) else {
            error!(worker = self.index, fd, "descriptor is already tracked");
            return;
        };
        conn.local_addr = local_addr;
        match inbox.take_socket_addr(fd) {
            Some(addr) => conn.remote_addr = Some(addr),
            None => {
                error!(worker = self.index, error = %Error::AddressNotFound(fd), "get new connection error");
            }
        }

        conn.set_user_space();
        self.handler.on_accept(conn);

        if let Err(err) = self.add_next_request(fd) {
            error!(worker = self.index, fd, error = %err, "add request error");
            self.close_conn(fd);
            return;
        }
        if self.shutdown_in_progress {
            warn!(worker = self.index, fd, "connection arrived during shutdown");
            self.close_conn(fd);
        }
    }

    fn claim_queued_conns(&mut self, inbox: &Inbox) {
        while let Some(fd) = inbox.pop() {
            self.claim_connection(inbox, fd);
        }
    }

    fn handle_conn(&mut self, fd: RawFd, tag: u64, res: i32) {
        let Some(conn) = self.registry.get(fd) else {
            return;
        };

        let result = match conn.state() {
            ConnState::Read => self.on_read(fd, res),
            ConnState::Write => self.on_write(fd, res),
            ConnState::Close => {
                self.on_closing(fd, tag, res);
                Ok(())
            }
            state => Err(Error::UnknownConnectionState { fd, state }),
        };

        if let Err(err) = result {
            if err.is_connection_local() {
                warn!(worker = self.index, fd, error = %err, "connection error");
            } else {
                error!(worker = self.index, fd, error = %err, "connection error");
            }
            self.close_conn(fd);
        }
    }

    fn on_read(&mut self, fd: RawFd, res: i32) -> Result<()> {
        let conn = self
            .registry
            .get_mut(fd)
            .ok_or(Error::ConnectionMissing(fd))?;
        conn.set_user_space();

        if res <= 0 {
            if res < 0 {
                debug!(worker = self.index, fd, error = %io::Error::from_raw_os_error(-res), "read error");
            } else {
                debug!(worker = self.index, fd, "peer closed connection");
            }
            self.close_conn(fd);
            return Ok(());
        }

        conn.on_kernel_read(res as usize);
        debug!(worker = self.index, fd, count = res, "bytes read");
        self.handler.on_read(conn);

        self.add_next_request(fd)
    }

    fn on_write(&mut self, fd: RawFd, res: i32) -> Result<()> {
        if res < 0 {
            return Err(io::Error::from_raw_os_error(-res).into());
        }
        let conn = self
            .registry
            .get_mut(fd)
            .ok_or(Error::ConnectionMissing(fd))?;

        let n = res as usize;
        conn.on_kernel_write(n);
        debug!(worker = self.index, fd, count = n, "bytes written");

        conn.set_user_space();
        self.handler.on_write(conn, n);

        self.add_next_request(fd)
    }

    fn on_closing(&mut self, fd: RawFd, tag: u64, res: i32) {
        if has_flag(tag, CLOSE_CONN_FLAG) {
            if res < 0 {
                warn!(worker = self.index, fd, error = %io::Error::from_raw_os_error(-res), "close error");
            }
            if let Some(mut conn) = self.registry.release(fd) {
                debug!(worker = self.index, fd, "connection closed");
                self.handler.on_close(&mut conn);
            }
            return;
        }

        let Some(conn) = self.registry.get_mut(fd) else {
            return;
        };
        conn.set_user_space();
        if has_flag(tag, WRITE_DATA_FLAG) {
            // a write in flight when closing began has drained
            let n = res.max(0) as usize;
            conn.on_kernel_write(n);
            debug!(worker = self.index, fd, count = n, "bytes written");
            self.handler.on_write(conn, n);
        }
    }

    /// Submit whatever the connection needs next: close if requested, write
    /// if output is pending, read otherwise.
    fn add_next_request(&mut self, fd: RawFd) -> Result<()> {
        let conn = self
            .registry
            .get_mut(fd)
            .ok_or(Error::ConnectionMissing(fd))?;

        if conn.close_requested() {
            post_close(&mut self.ring, conn)
        } else if conn.pending_write() > 0 {
            post_send(&mut self.ring, conn)
        } else {
            post_recv(&mut self.ring, conn)
        }
    }

    /// Schedule a close through the ring, or close synchronously when the
    /// ring cannot take it.
    fn close_conn(&mut self, fd: RawFd) {
        let Some(conn) = self.registry.get_mut(fd) else {
            return;
        };
        if conn.state() == ConnState::Close {
            return;
        }
        if conn.is_in_kernel() {
            shutdown_fd_quiet(fd);
        }
        if let Err(err) = post_close(&mut self.ring, conn) {
            error!(worker = self.index, fd, error = %err, "add close() connection request error");
            self.force_close(fd);
        }
    }

    fn force_close(&mut self, fd: RawFd) {
        let Some(mut conn) = self.registry.release(fd) else {
            return;
        };
        if conn.is_in_kernel() {
            shutdown_fd_quiet(fd);
        }
        close_fd_quiet(fd);
        self.handler.on_close(&mut conn);
    }

    /// Issue one close per open connection. Failures are logged and not
    /// retried.
    fn close_all_conns(&mut self) {
        if self.shutdown_in_progress {
            return;
        }
        self.shutdown_in_progress = true;
        warn!(worker = self.index, open = self.registry.len(), "closing connections");

        for fd in self
            .registry
            .fds_where(|c| c.state() != ConnState::Close)
        {
            let Some(conn) = self.registry.get_mut(fd) else {
                continue;
            };
            if conn.is_in_kernel() {
                // wakes a pending read so the ring lets go of the buffer
                shutdown_fd_quiet(fd);
            }
            if let Err(err) = post_close(&mut self.ring, conn) {
                error!(worker = self.index, fd, error = %err, "add close() connection request error");
            }
        }
    }
}

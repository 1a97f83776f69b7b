use std::net::SocketAddr;
use std::os::fd::RawFd;

/// Where a connection is in its I/O lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnState {
    Accept,
    Read,
    Write,
    Close,
}

/// One accepted socket, owned by exactly one worker.
///
/// While `in_kernel` is set the read buffer or the outbound bytes are
/// referenced by a submitted operation and must not be touched.
pub struct Connection {
    pub(crate) fd: RawFd,
    pub(crate) state: ConnState,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) in_kernel: bool,

    /// Fixed-size receive buffer reused for every read.
    read_buffer: Vec<u8>,
    /// Number of valid bytes from the last completed read.
    bytes_read: usize,

    /// Bytes queued by user code and not yet confirmed by the kernel.
    outbound: Vec<u8>,
    /// How many of `outbound` have been written so far (partial writes).
    bytes_written: usize,

    close_requested: bool,
}

impl Connection {
    pub fn new(fd: RawFd, read_buffer_capacity: usize) -> Self {
        Self {
            fd,
            state: ConnState::Accept,
            local_addr: None,
            remote_addr: None,
            in_kernel: false,
            read_buffer: vec![0u8; read_buffer_capacity],
            bytes_read: 0,
            outbound: Vec::new(),
            bytes_written: 0,
            close_requested: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Bytes delivered by the last read completion.
    pub fn read_data(&self) -> &[u8] {
        &self.read_buffer[..self.bytes_read]
    }

    /// Queue bytes to be written once control returns to the worker.
    pub fn write(&mut self, data: &[u8]) {
        debug_assert!(!self.in_kernel, "write while buffers are owned by the kernel");
        self.outbound.extend_from_slice(data);
    }

    /// Bytes queued but not yet written.
    pub fn pending_write(&self) -> usize {
        self.outbound.len() - self.bytes_written
    }

    /// Ask the worker to close this connection after the current callback.
    pub fn close(&mut self) {
        self.close_requested = true;
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub fn is_in_kernel(&self) -> bool {
        self.in_kernel
    }

    pub(crate) fn set_user_space(&mut self) {
        self.in_kernel = false;
    }

    pub(crate) fn set_kernel_space(&mut self) {
        self.in_kernel = true;
    }

    /// Reset the read window and hand out the whole buffer for the next read.
    pub(crate) fn read_ptr_len(&mut self) -> (*mut u8, u32) {
        self.bytes_read = 0;
        (self.read_buffer.as_mut_ptr(), self.read_buffer.len() as u32)
    }

    pub(crate) fn on_kernel_read(&mut self, n: usize) {
        self.bytes_read = n.min(self.read_buffer.len());
    }

    /// Unsent tail of the outbound bytes.
    pub(crate) fn write_ptr_len(&self) -> (*const u8, u32) {
        let pending = &self.outbound[self.bytes_written..];
        (pending.as_ptr(), pending.len() as u32)
    }

    /// Account for `n` bytes confirmed written by the kernel.
    pub(crate) fn on_kernel_write(&mut self, n: usize) {
        self.bytes_written = (self.bytes_written + n).min(self.outbound.len());
        if self.bytes_written == self.outbound.len() {
            self.outbound.clear();
            self.bytes_written = 0;
        }
    }
}

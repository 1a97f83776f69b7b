use std::net::SocketAddr;
use std::os::fd::RawFd;

use libc::sockaddr_storage;

use crate::core::connection::ConnState;
use crate::core::socket::{new_client_addr, sockaddr_to_socketaddr};
use crate::core::user_data::{ACCEPT_FLAG, pack_user_data};
use crate::error::{Error, Result};
use crate::ring::{Op, Ring};

use super::registry::ConnectionRegistry;

/// Submits accepts for one listening descriptor and captures the peer address
///
/// The address buffer is reused by every accept, so at most one accept may be
/// in flight and `last_client_addr` must be read before the next submission.
pub struct Acceptor {
    fd: RawFd,
    client_addr: Box<sockaddr_storage>,
    client_len: Box<libc::socklen_t>,
}

impl Acceptor {
    pub fn new(listen_fd: RawFd) -> Self {
        let (client_addr, client_len) = new_client_addr();
        Self {
            fd: listen_fd,
            client_addr,
            client_len,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn submit_accept<R: Ring>(&mut self, ring: &mut R) -> Result<()> {
        *self.client_len = std::mem::size_of::<sockaddr_storage>() as libc::socklen_t;
        let op = Op::Accept {
            fd: self.fd,
            addr: self.client_addr.as_mut() as *mut sockaddr_storage as *mut libc::sockaddr,
            addrlen: self.client_len.as_mut(),
        };
        // both buffers are boxed and owned by self, which outlives the accept
        unsafe { ring.push(op, pack_user_data(ACCEPT_FLAG, self.fd)) }
    }

    /// Submit an accept and move the listener's tracked connection to `Accept`.
    pub fn submit_accept_conn<R: Ring>(
        &mut self,
        ring: &mut R,
        registry: &mut ConnectionRegistry,
    ) -> Result<()> {
        self.submit_accept(ring)?;
        let conn = registry
            .get_mut(self.fd)
            .ok_or(Error::ConnectionMissing(self.fd))?;
        conn.state = ConnState::Accept;
        Ok(())
    }

    pub fn last_client_addr(&self) -> Result<SocketAddr> {
        sockaddr_to_socketaddr(&self.client_addr)
    }

    #[cfg(test)]
    pub(crate) fn client_addr_mut(&mut self) -> &mut sockaddr_storage {
        &mut self.client_addr
    }
}

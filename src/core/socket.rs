//! Socket helpers shared by the acceptor and the workers
//!
//! - SO_REUSEPORT listener setup
//! - raw `sockaddr_storage` conversion for addresses captured by the kernel

use libc::{sockaddr_in, sockaddr_in6, sockaddr_storage};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, TcpListener};
use std::os::fd::RawFd;
use std::{io, mem};

use crate::core::constants::LISTEN_BACKLOG;
use crate::error::{Error, Result};

/// Create a SO_REUSEPORT listening socket
///
/// The acceptor submits accepts against this socket through its ring, so it
/// is left in blocking mode.
pub fn make_reuseport_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    sock.set_reuse_port(true)?;
    sock.bind(&addr.into())?;
    sock.listen(LISTEN_BACKLOG)?;
    Ok(sock.into())
}

/// Zeroed address storage and its length field, boxed so the kernel can
/// write into them while an accept is in flight.
pub fn new_client_addr() -> (Box<sockaddr_storage>, Box<libc::socklen_t>) {
    let storage: sockaddr_storage = unsafe { mem::zeroed() };
    let len = mem::size_of::<sockaddr_storage>() as libc::socklen_t;
    (Box::new(storage), Box::new(len))
}

/// Convert a kernel-filled `sockaddr_storage` into a `SocketAddr`.
///
/// Listeners are TCP only, so any family other than IPv4 and IPv6, Unix
/// domain peers included, is reported as unsupported.
pub fn sockaddr_to_socketaddr(storage: &sockaddr_storage) -> Result<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            // s_addr is in network byte order
            let addr = unsafe { *(storage as *const _ as *const sockaddr_in) };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let addr = unsafe { *(storage as *const _ as *const sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr.sin6_addr.s6_addr),
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        family => Err(Error::UnsupportedAddressFamily(family)),
    }
}

/// Local address a socket is bound to.
pub fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    let (mut storage, mut len) = new_client_addr();
    let ret = unsafe {
        libc::getsockname(
            fd,
            storage.as_mut() as *mut sockaddr_storage as *mut libc::sockaddr,
            len.as_mut(),
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error().into());
    }
    sockaddr_to_socketaddr(&storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn storage_v4(ip: Ipv4Addr, port: u16) -> sockaddr_storage {
        let mut st: sockaddr_in = unsafe { mem::zeroed() };
        st.sin_family = libc::AF_INET as libc::sa_family_t;
        st.sin_port = port.to_be();
        st.sin_addr = libc::in_addr {
            s_addr: u32::from_be_bytes(ip.octets()).to_be(),
        };
        let mut ss: sockaddr_storage = unsafe { mem::zeroed() };
        unsafe { std::ptr::write(&mut ss as *mut _ as *mut sockaddr_in, st) };
        ss
    }

    #[test]
    fn converts_ipv4_storage() {
        let ss = storage_v4(Ipv4Addr::new(10, 1, 2, 3), 4242);
        let addr = sockaddr_to_socketaddr(&ss).unwrap();
        assert_eq!(addr, "10.1.2.3:4242".parse().unwrap());
    }

    #[test]
    fn converts_ipv6_storage() {
        let mut st: sockaddr_in6 = unsafe { mem::zeroed() };
        st.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        st.sin6_port = 8080u16.to_be();
        st.sin6_addr = libc::in6_addr {
            s6_addr: Ipv6Addr::LOCALHOST.octets(),
        };
        let mut ss: sockaddr_storage = unsafe { mem::zeroed() };
        unsafe { std::ptr::write(&mut ss as *mut _ as *mut sockaddr_in6, st) };

        let addr = sockaddr_to_socketaddr(&ss).unwrap();
        assert_eq!(addr, "[::1]:8080".parse().unwrap());
    }

    #[test]
    fn rejects_unknown_family() {
        let ss: sockaddr_storage = unsafe { mem::zeroed() };
        assert!(matches!(
            sockaddr_to_socketaddr(&ss),
            Err(Error::UnsupportedAddressFamily(0))
        ));
    }

    #[test]
    fn rejects_unix_domain_peer() {
        let mut st: libc::sockaddr_un = unsafe { mem::zeroed() };
        st.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let mut ss: sockaddr_storage = unsafe { mem::zeroed() };
        unsafe { std::ptr::write(&mut ss as *mut _ as *mut libc::sockaddr_un, st) };

        assert!(matches!(
            sockaddr_to_socketaddr(&ss),
            Err(Error::UnsupportedAddressFamily(libc::AF_UNIX))
        ));
    }

    #[test]
    fn reads_listener_local_addr() {
        let listener = make_reuseport_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let expected = listener.local_addr().unwrap();
        assert_eq!(local_addr(listener.as_raw_fd()).unwrap(), expected);
    }
}

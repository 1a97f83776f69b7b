//! Ring submission helpers
//!
//! Each helper tags the operation with the connection's descriptor and the
//! flag of its kind, and only moves the connection to its new state once the
//! submission slot was obtained.

use std::os::fd::RawFd;

use crate::core::connection::{ConnState, Connection};
use crate::core::user_data::{ADD_CONN_FLAG, CLOSE_CONN_FLAG, WRITE_DATA_FLAG, pack_user_data};
use crate::error::Result;
use crate::ring::{Op, Ring};

/// Post a read into the connection's receive buffer
pub fn post_recv<R: Ring>(ring: &mut R, conn: &mut Connection) -> Result<()> {
    let (buf, len) = conn.read_ptr_len();
    let op = Op::Recv {
        fd: conn.fd,
        buf,
        len,
    };
    // the buffer lives as long as the connection, which outlives the read
    unsafe { ring.push(op, pack_user_data(0, conn.fd))? };
    conn.state = ConnState::Read;
    conn.set_kernel_space();
    Ok(())
}

/// Post a write of the connection's unsent outbound bytes
pub fn post_send<R: Ring>(ring: &mut R, conn: &mut Connection) -> Result<()> {
    let (buf, len) = conn.write_ptr_len();
    let op = Op::Send {
        fd: conn.fd,
        buf,
        len,
    };
    // outbound bytes are not touched while the connection is in kernel space
    unsafe { ring.push(op, pack_user_data(WRITE_DATA_FLAG, conn.fd))? };
    conn.state = ConnState::Write;
    conn.set_kernel_space();
    Ok(())
}

/// Post a close of the connection's descriptor
pub fn post_close<R: Ring>(ring: &mut R, conn: &mut Connection) -> Result<()> {
    let op = Op::Close { fd: conn.fd };
    unsafe { ring.push(op, pack_user_data(CLOSE_CONN_FLAG, conn.fd))? };
    conn.state = ConnState::Close;
    Ok(())
}

/// Post `fd` to another worker's ring; it surfaces there as a completion
/// tagged with the added-connection flag whose result is the descriptor.
pub fn post_msg_ring<R: Ring>(ring: &mut R, target_ring_fd: RawFd, fd: RawFd) -> Result<()> {
    let tag = pack_user_data(ADD_CONN_FLAG, fd);
    let op = Op::MsgRing {
        ring_fd: target_ring_fd,
        result: fd,
        user_data: tag,
    };
    unsafe { ring.push(op, tag) }
}

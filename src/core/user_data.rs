/*
* io_uring echoes back a 64-bit user_data value for every submission. It is the only
* routing information a completion carries, so each tag packs:
*
* 1. The kind of operation, as one of a small set of mutually exclusive flag bits at
*    the top of the word.
*
* 2. The file descriptor the operation belongs to, in the low 32 bits.
*
* Reads are submitted with the bare descriptor and no flag.
*/

use std::os::fd::RawFd;

pub const ACCEPT_FLAG: u64 = 1 << 63;
pub const ADD_CONN_FLAG: u64 = 1 << 62;
pub const CLOSE_CONN_FLAG: u64 = 1 << 61;
pub const WRITE_DATA_FLAG: u64 = 1 << 60;

pub const ALL_FLAGS_MASK: u64 = ACCEPT_FLAG | ADD_CONN_FLAG | CLOSE_CONN_FLAG | WRITE_DATA_FLAG;

const FD_MASK: u64 = u32::MAX as u64;

const _: () = assert!(ALL_FLAGS_MASK & FD_MASK == 0);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TagKind {
    Accept,
    AddedConnection,
    Close,
    WriteData,
    Read,
}

#[inline]
pub fn pack_user_data(flag: u64, fd: RawFd) -> u64 {
    debug_assert!(flag & !ALL_FLAGS_MASK == 0, "unknown tag flag {flag:#x}");
    debug_assert!(fd >= 0, "negative fd {fd}");
    flag | (fd as u32 as u64)
}

/// Strip the flag bits and recover the descriptor.
#[inline]
pub fn fd_of(tag: u64) -> RawFd {
    (tag & !ALL_FLAGS_MASK & FD_MASK) as u32 as RawFd
}

#[inline]
pub fn has_flag(tag: u64, flag: u64) -> bool {
    tag & flag != 0
}

#[inline]
pub fn kind_of(tag: u64) -> TagKind {
    if has_flag(tag, ACCEPT_FLAG) {
        TagKind::Accept
    } else if has_flag(tag, ADD_CONN_FLAG) {
        TagKind::AddedConnection
    } else if has_flag(tag, CLOSE_CONN_FLAG) {
        TagKind::Close
    } else if has_flag(tag, WRITE_DATA_FLAG) {
        TagKind::WriteData
    } else {
        TagKind::Read
    }
}

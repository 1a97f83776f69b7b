//! Ring-owning workers and the connection lifecycle
//!
//! - `Worker`: the narrow capability set the balancer and server rely on
//! - Consumer worker event loop and per-connection state machine
//! - Acceptor and the accepting worker that hands descriptors off
//! - Connection registry and ring submission helpers

pub mod acceptor;
pub mod acceptor_worker;
pub mod consumer;
pub mod handler;
pub mod handoff;
pub mod registry;
pub mod uring_ops;

use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::error::Result;

pub use acceptor::Acceptor;
pub use acceptor_worker::AcceptorWorker;
pub use consumer::ConsumerWorker;
pub use handler::{Echo, EventHandler};
pub use handoff::{Inbox, hand_off};
pub use registry::ConnectionRegistry;

/// What the load balancer and the server need from a worker.
pub trait Worker: Send + Sync {
    /// Live connections, read fresh on every call.
    fn active_connections(&self) -> usize;

    fn index(&self) -> usize;

    fn set_index(&self, index: usize);

    /// Drive the worker's loop on the calling thread until shutdown completes.
    fn run(&self, index: usize) -> Result<()>;

    fn shutdown(&self);

    /// Hand `fd` over through the fallback queue.
    fn add_conn_to_queue(&self, fd: RawFd) -> Result<()>;

    /// Record the remote address of a descriptor about to be handed over.
    fn set_socket_addr(&self, fd: RawFd, addr: SocketAddr);

    /// Withdraw a stored address whose handoff never arrived.
    fn take_socket_addr(&self, fd: RawFd) -> Option<SocketAddr>;

    /// The loop finished its prepare step and is consuming completions.
    fn started(&self) -> bool;

    fn ring_fd(&self) -> RawFd;
}

/// Lifecycle notifications a worker sends to its controller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WorkerEvent {
    Started(usize),
    Finished(usize),
}

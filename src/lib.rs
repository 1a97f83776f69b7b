//! Socket server engine with one io_uring per worker thread.
//!
//! An acceptor thread accepts connections on its own ring, asks a
//! [`LoadBalancer`] which worker should serve each one, and hands the
//! descriptor over either by posting it to the worker's ring or through the
//! worker's fallback queue. Each [`ConsumerWorker`] then drives its
//! connections through accept, read, write and close by dispatching ring
//! completions to user [`EventHandler`] callbacks.

pub mod balancer;
pub mod config;
pub mod core;
pub mod error;
pub mod ring;
pub mod server;
pub mod signal;
pub mod util;
pub mod worker;

pub use balancer::{LoadBalancer, Strategy};
pub use config::{ServerConfig, WorkerConfig};
pub use crate::core::connection::{ConnState, Connection};
pub use error::{Error, Result};
pub use server::Server;
pub use worker::{ConsumerWorker, Echo, EventHandler, Worker};

//! Connection-to-worker assignment
//!
//! This module decides which worker serves the next accepted connection:
//! - Round-robin over the registered workers
//! - Least-connections using each worker's live connection count

pub mod load_balancer;

pub use load_balancer::{LeastConnections, LoadBalancer, RoundRobin, Strategy};

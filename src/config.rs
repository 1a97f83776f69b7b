use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use crate::balancer::Strategy;
use crate::core::constants;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Size of each io_uring submission queue
    pub ring_size: u32,
    /// Capacity of the per-connection read buffer
    pub read_buffer_capacity: usize,
    /// Initial slot count of the connection registry
    pub registry_capacity: usize,
    /// Longest a loop blocks before re-checking shutdown and the handoff queue
    pub wait_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            ring_size: constants::RING_SIZE,
            read_buffer_capacity: constants::READ_BUFFER_CAPACITY,
            registry_capacity: constants::REGISTRY_CAPACITY,
            wait_timeout: Duration::from_millis(constants::WAIT_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Number of consumer workers, one ring and thread each
    pub workers: usize,
    pub strategy: Strategy,
    /// Pin each worker thread to its own core
    pub pin_cores: bool,
    pub worker: WorkerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            workers: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            strategy: Strategy::default(),
            pin_cores: true,
            worker: WorkerConfig::default(),
        }
    }
}

pub const READ_BUFFER_CAPACITY: usize = 16 * 1024;
pub const RING_SIZE: u32 = 1024;
pub const REGISTRY_CAPACITY: usize = 4096;

/// Upper bound on how long a loop blocks waiting for completions.
pub const WAIT_TIMEOUT_MS: u64 = 50;

pub const LISTEN_BACKLOG: i32 = 1024;

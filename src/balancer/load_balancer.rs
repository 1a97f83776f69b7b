use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Error;
use crate::worker::Worker;

/// Picks the worker for the next unit of work.
///
/// Workers are registered once at startup; `next` is then called
/// concurrently from accepting threads and only needs `&self`.
pub trait LoadBalancer: Send + Sync {
    fn register(&mut self, worker: Arc<dyn Worker>);

    /// `hint` is a reserved locality key and is currently ignored.
    fn next(&self, hint: Option<&[u8]>) -> Option<Arc<dyn Worker>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct RoundRobin {
    workers: Vec<Arc<dyn Worker>>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn register(&mut self, worker: Arc<dyn Worker>) {
        self.workers.push(worker);
    }

    fn next(&self, _hint: Option<&[u8]>) -> Option<Arc<dyn Worker>> {
        if self.workers.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Some(Arc::clone(&self.workers[idx]))
    }

    fn len(&self) -> usize {
        self.workers.len()
    }
}

#[derive(Default)]
pub struct LeastConnections {
    workers: Vec<Arc<dyn Worker>>,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for LeastConnections {
    fn register(&mut self, worker: Arc<dyn Worker>) {
        self.workers.push(worker);
    }

    fn next(&self, _hint: Option<&[u8]>) -> Option<Arc<dyn Worker>> {
        // first worker at the minimum wins ties
        let mut best: Option<(&Arc<dyn Worker>, usize)> = None;
        for worker in &self.workers {
            let conns = worker.active_connections();
            match best {
                Some((_, min)) if conns >= min => {}
                _ => best = Some((worker, conns)),
            }
        }
        best.map(|(worker, _)| Arc::clone(worker))
    }

    fn len(&self) -> usize {
        self.workers.len()
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConnections,
}

impl Strategy {
    pub fn build(self) -> Box<dyn LoadBalancer> {
        match self {
            Strategy::RoundRobin => Box::new(RoundRobin::new()),
            Strategy::LeastConnections => Box::new(LeastConnections::new()),
        }
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" | "rr" => Ok(Strategy::RoundRobin),
            "least-connections" | "lc" => Ok(Strategy::LeastConnections),
            other => Err(Error::InvalidStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::RoundRobin => f.write_str("round-robin"),
            Strategy::LeastConnections => f.write_str("least-connections"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::net::SocketAddr;
    use std::os::fd::RawFd;
    use std::thread;

    const NUMBER_OF_TEST_WORKERS: usize = 4;

    #[derive(Default)]
    struct TestWorker {
        conns: AtomicUsize,
    }

    impl Worker for TestWorker {
        fn active_connections(&self) -> usize {
            self.conns.load(Ordering::Relaxed)
        }

        fn index(&self) -> usize {
            0
        }

        fn set_index(&self, _index: usize) {}

        fn run(&self, _index: usize) -> Result<()> {
            self.conns.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn shutdown(&self) {}

        fn add_conn_to_queue(&self, _fd: RawFd) -> Result<()> {
            Ok(())
        }

        fn set_socket_addr(&self, _fd: RawFd, _addr: SocketAddr) {}

        fn take_socket_addr(&self, _fd: RawFd) -> Option<SocketAddr> {
            None
        }

        fn started(&self) -> bool {
            true
        }

        fn ring_fd(&self) -> RawFd {
            0
        }
    }

    fn create_test_workers() -> Vec<Arc<TestWorker>> {
        (0..NUMBER_OF_TEST_WORKERS)
            .map(|_| Arc::new(TestWorker::default()))
            .collect()
    }

    fn register_all(lb: &mut dyn LoadBalancer, workers: &[Arc<TestWorker>]) {
        for worker in workers {
            lb.register(Arc::clone(worker) as Arc<dyn Worker>);
        }
    }

    fn same(picked: &Arc<dyn Worker>, expected: &Arc<TestWorker>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(picked), Arc::as_ptr(expected))
    }

    #[test]
    fn round_robin_cycles_in_registration_order() {
        let mut lb = RoundRobin::new();
        let workers = create_test_workers();
        register_all(&mut lb, &workers);

        for i in 0..2 * NUMBER_OF_TEST_WORKERS {
            let worker = lb.next(None).unwrap();
            worker.run(0).unwrap();
            assert!(same(&worker, &workers[i % NUMBER_OF_TEST_WORKERS]), "call {i}");
        }
    }

    #[test]
    fn least_connections_picks_first_minimum() {
        let mut lb = LeastConnections::new();
        let workers = create_test_workers();
        register_all(&mut lb, &workers);

        for (worker, conns) in workers.iter().zip([1, 0, 2, 1]) {
            worker.conns.store(conns, Ordering::Relaxed);
        }

        // each pick serves one more connection before the next call
        for (call, expected) in [1, 0, 1, 3, 0, 1, 2, 3].into_iter().enumerate() {
            let worker = lb.next(None).unwrap();
            worker.run(0).unwrap();
            assert!(same(&worker, &workers[expected]), "call {call}");
        }
    }

    #[test]
    fn single_worker_is_always_returned() {
        let workers: Vec<Arc<TestWorker>> = vec![Arc::new(TestWorker::default())];
        for strategy in [Strategy::RoundRobin, Strategy::LeastConnections] {
            let mut lb = strategy.build();
            register_all(lb.as_mut(), &workers);
            for _ in 0..3 {
                assert!(same(&lb.next(None).unwrap(), &workers[0]));
            }
        }
    }

    #[test]
    fn empty_pool_yields_nothing() {
        assert!(RoundRobin::new().next(None).is_none());
        assert!(LeastConnections::new().next(None).is_none());
    }

    #[test]
    fn concurrent_round_robin_spreads_evenly() {
        let mut lb = RoundRobin::new();
        let workers = create_test_workers();
        register_all(&mut lb, &workers);
        let lb = Arc::new(lb);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lb = Arc::clone(&lb);
                thread::spawn(move || {
                    for _ in 0..100 {
                        lb.next(None).unwrap().run(0).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for worker in &workers {
            assert_eq!(worker.active_connections(), 100);
        }
    }

    #[test]
    fn strategy_parses_from_config_strings() {
        assert_eq!("round-robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert_eq!("lc".parse::<Strategy>().unwrap(), Strategy::LeastConnections);
        assert!(matches!(
            "random".parse::<Strategy>(),
            Err(Error::InvalidStrategy(_))
        ));
        assert_eq!(Strategy::LeastConnections.to_string(), "least-connections");
    }
}

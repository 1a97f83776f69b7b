use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::balancer::LoadBalancer;
use crate::config::WorkerConfig;
use crate::core::user_data::{TagKind, fd_of, kind_of};
use crate::error::{Error, Result};
use crate::ring::{Completion, Features, Ring};
use crate::util::fd::close_fd_quiet;

use super::acceptor::Acceptor;
use super::Worker;
use super::handoff::hand_off;
use super::registry::ConnectionRegistry;

/// Accepts on one listener and hands every new descriptor to the worker the
/// balancer picks
///
/// The listener itself is tracked as a connection in this worker's registry.
pub struct AcceptorWorker<R> {
    ring: R,
    acceptor: Acceptor,
    registry: ConnectionRegistry,
    balancer: Arc<dyn LoadBalancer>,
    features: Features,
    shutdown: Arc<AtomicBool>,
    wait_timeout: Duration,
    accept_armed: bool,
    /// Ring-message handoffs whose acknowledgement has not come back yet.
    in_flight: HashMap<RawFd, Arc<dyn Worker>>,
    completions: Vec<Completion>,
}

impl<R: Ring> AcceptorWorker<R> {
    pub fn new(
        ring: R,
        listen_fd: RawFd,
        balancer: Arc<dyn LoadBalancer>,
        features: Features,
        shutdown: Arc<AtomicBool>,
        config: &WorkerConfig,
    ) -> Self {
        let mut registry = ConnectionRegistry::new(1, 0);
        registry.register(listen_fd);

        Self {
            ring,
            acceptor: Acceptor::new(listen_fd),
            registry,
            balancer,
            features,
            shutdown,
            wait_timeout: config.wait_timeout,
            accept_armed: false,
            in_flight: HashMap::new(),
            completions: Vec::with_capacity(64),
        }
    }

    pub fn run(&mut self) -> Result<()> {
        if self.balancer.is_empty() {
            return Err(Error::EmptyPool);
        }
        info!(
            fd = self.acceptor.fd(),
            native = self.features.ring_messaging,
            "starting acceptor loop"
        );
        self.acceptor
            .submit_accept_conn(&mut self.ring, &mut self.registry)?;
        self.accept_armed = true;

        while !self.shutdown.load(Ordering::Acquire) {
            self.iterate()?;
        }
        self.finish()?;
        info!(fd = self.acceptor.fd(), "acceptor loop finished");
        Ok(())
    }

    /// Submit whatever the last pass queued, ring messages included, and
    /// collect the acknowledgements that are already back.
    pub(crate) fn finish(&mut self) -> Result<()> {
        let want = usize::from(!self.in_flight.is_empty());
        self.ring.submit_and_wait(want, Some(self.wait_timeout))?;

        let mut completions = std::mem::take(&mut self.completions);
        self.ring.drain(&mut completions);
        for cqe in completions.drain(..) {
            self.dispatch(cqe);
        }
        self.completions = completions;

        if !self.in_flight.is_empty() {
            // submitted, so the targets still claim them
            debug!(pending = self.in_flight.len(), "handoffs left unacknowledged");
            self.in_flight.clear();
        }
        Ok(())
    }

    pub(crate) fn iterate(&mut self) -> Result<()> {
        if !self.accept_armed {
            self.rearm();
        }

        self.ring.submit_and_wait(1, Some(self.wait_timeout))?;

        let mut completions = std::mem::take(&mut self.completions);
        self.ring.drain(&mut completions);
        for cqe in completions.drain(..) {
            self.dispatch(cqe);
        }
        self.completions = completions;
        Ok(())
    }

    fn dispatch(&mut self, cqe: Completion) {
        match kind_of(cqe.user_data) {
            TagKind::Accept => self.on_accept(cqe.result),
            TagKind::AddedConnection => self.on_handoff_ack(fd_of(cqe.user_data), cqe.result),
            kind => debug!(?kind, "unexpected completion on acceptor ring"),
        }
    }

    fn on_accept(&mut self, res: i32) {
        self.accept_armed = false;

        if self.shutdown.load(Ordering::Acquire) {
            if res >= 0 {
                debug!(fd = res, "closing connection accepted during shutdown");
                close_fd_quiet(res);
            }
            return;
        }

        if res < 0 {
            warn!(error = %io::Error::from_raw_os_error(-res), "accept failed");
        } else {
            // the address buffer is reused by the next accept
            let addr = match self.acceptor.last_client_addr() {
                Ok(addr) => Some(addr),
                Err(err) => {
                    warn!(fd = res, error = %err, "cannot read client address");
                    None
                }
            };
            self.distribute(res, addr);
        }

        self.rearm();
    }

    /// Acknowledgement of a ring message posted to another worker.
    fn on_handoff_ack(&mut self, fd: RawFd, res: i32) {
        let target = self.in_flight.remove(&fd);
        if res >= 0 {
            return;
        }
        error!(
            fd,
            error = %io::Error::from_raw_os_error(-res),
            "connection handoff failed"
        );
        if let Some(target) = target {
            target.take_socket_addr(fd);
        }
        close_fd_quiet(fd);
    }

    fn rearm(&mut self) {
        match self.acceptor.submit_accept(&mut self.ring) {
            Ok(()) => self.accept_armed = true,
            Err(err) => error!(error = %err, "add accept request error"),
        }
    }

    fn distribute(&mut self, fd: RawFd, addr: Option<SocketAddr>) {
        let Some(target) = self.balancer.next(None) else {
            error!(fd, error = %Error::EmptyPool, "no worker for connection");
            close_fd_quiet(fd);
            return;
        };
        match hand_off(&mut self.ring, self.features, target.as_ref(), fd, addr) {
            Ok(()) if self.features.ring_messaging => {
                self.in_flight.insert(fd, target);
            }
            Ok(()) => {}
            Err(err) => {
                error!(fd, worker = target.index(), error = %err, "connection handoff error");
                close_fd_quiet(fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{LeastConnections, RoundRobin};
    use crate::core::connection::ConnState;
    use crate::core::user_data::{ACCEPT_FLAG, ADD_CONN_FLAG, pack_user_data};
    use crate::ring::testing::{Submitted, TestRing, write_sockaddr_v4};
    use crate::worker::{ConsumerWorker, Echo, Worker};
    use std::net::SocketAddr;

    const LISTEN_FD: RawFd = 1000;

    type Target = ConsumerWorker<TestRing, Echo>;

    fn targets(n: usize, features: Features) -> Vec<Arc<Target>> {
        (0..n)
            .map(|i| {
                Arc::new(ConsumerWorker::new(
                    i,
                    TestRing::new(900 + i as RawFd),
                    Echo,
                    None,
                    features,
                    &WorkerConfig::default(),
                    None,
                ))
            })
            .collect()
    }

    fn acceptor_for(
        balancer: Box<dyn LoadBalancer>,
        features: Features,
    ) -> AcceptorWorker<TestRing> {
        AcceptorWorker::new(
            TestRing::new(800),
            LISTEN_FD,
            Arc::from(balancer),
            features,
            Arc::new(AtomicBool::new(false)),
            &WorkerConfig::default(),
        )
    }

    fn arm(worker: &mut AcceptorWorker<TestRing>) {
        worker
            .acceptor
            .submit_accept_conn(&mut worker.ring, &mut worker.registry)
            .unwrap();
        worker.accept_armed = true;
    }

    fn accept(worker: &mut AcceptorWorker<TestRing>, fd: RawFd, peer: &str) {
        write_sockaddr_v4(worker.acceptor.client_addr_mut(), peer.parse().unwrap());
        worker.ring.complete(pack_user_data(ACCEPT_FLAG, LISTEN_FD), fd);
        worker.iterate().unwrap();
    }

    #[test]
    fn fallback_handoff_round_robins_through_queues() {
        let features = Features::default();
        let workers = targets(2, features);
        let mut lb = RoundRobin::new();
        for w in &workers {
            lb.register(Arc::clone(w) as Arc<dyn Worker>);
        }
        let mut acceptor = acceptor_for(Box::new(lb), features);
        arm(&mut acceptor);
        assert_eq!(acceptor.registry.get(LISTEN_FD).unwrap().state(), ConnState::Accept);

        accept(&mut acceptor, 1001, "10.0.0.1:5001");
        accept(&mut acceptor, 1002, "10.0.0.2:5002");

        assert_eq!(workers[0].inbox().pop(), Some(1001));
        assert_eq!(workers[1].inbox().pop(), Some(1002));
        assert_eq!(
            workers[0].inbox().take_socket_addr(1001),
            Some("10.0.0.1:5001".parse::<SocketAddr>().unwrap())
        );
        // one initial accept plus one re-arm per completion
        assert_eq!(acceptor.ring.count(|s| matches!(s, Submitted::Accept { .. })), 3);
    }

    #[test]
    fn native_handoff_posts_to_target_ring() {
        let features = Features {
            ring_messaging: true,
        };
        let workers = targets(3, features);
        let mut lb = LeastConnections::new();
        for w in &workers {
            lb.register(Arc::clone(w) as Arc<dyn Worker>);
        }
        let mut acceptor = acceptor_for(Box::new(lb), features);

        accept(&mut acceptor, 1001, "10.0.0.1:5001");

        let posted = acceptor
            .ring
            .submitted
            .iter()
            .find(|(s, _)| matches!(s, Submitted::MsgRing { .. }))
            .cloned()
            .unwrap();
        assert_eq!(
            posted.0,
            Submitted::MsgRing {
                ring_fd: 900,
                result: 1001,
                user_data: pack_user_data(ADD_CONN_FLAG, 1001),
            }
        );
        assert_eq!(
            workers[0].inbox().take_socket_addr(1001),
            Some("10.0.0.1:5001".parse::<SocketAddr>().unwrap())
        );
    }

    #[test]
    fn failed_native_post_withdraws_address() {
        let features = Features {
            ring_messaging: true,
        };
        let workers = targets(1, features);
        let mut lb = RoundRobin::new();
        lb.register(Arc::clone(&workers[0]) as Arc<dyn Worker>);
        let mut acceptor = acceptor_for(Box::new(lb), features);

        // far above any open descriptor, so the close is a harmless EBADF
        let fd: RawFd = 1 << 24;
        accept(&mut acceptor, fd, "10.0.0.1:5001");
        assert_eq!(workers[0].inbox().pending_addresses(), 1);
        assert!(acceptor.in_flight.contains_key(&fd));

        acceptor.ring.complete(pack_user_data(ADD_CONN_FLAG, fd), -libc::EBADFD);
        acceptor.iterate().unwrap();

        assert!(acceptor.in_flight.is_empty());
        assert_eq!(workers[0].inbox().pending_addresses(), 0);
    }

    #[test]
    fn acknowledged_post_keeps_address_for_target() {
        let features = Features {
            ring_messaging: true,
        };
        let workers = targets(1, features);
        let mut lb = RoundRobin::new();
        lb.register(Arc::clone(&workers[0]) as Arc<dyn Worker>);
        let mut acceptor = acceptor_for(Box::new(lb), features);

        accept(&mut acceptor, 1001, "10.0.0.1:5001");
        acceptor.ring.complete(pack_user_data(ADD_CONN_FLAG, 1001), 0);
        acceptor.iterate().unwrap();

        assert!(acceptor.in_flight.is_empty());
        assert_eq!(workers[0].inbox().pending_addresses(), 1);
    }

    #[test]
    fn failed_accept_is_rearmed() {
        let features = Features::default();
        let workers = targets(1, features);
        let mut lb = RoundRobin::new();
        lb.register(Arc::clone(&workers[0]) as Arc<dyn Worker>);
        let mut acceptor = acceptor_for(Box::new(lb), features);

        acceptor.ring.complete(pack_user_data(ACCEPT_FLAG, LISTEN_FD), -libc::EMFILE);
        acceptor.iterate().unwrap();

        assert_eq!(workers[0].inbox().pop(), None);
        assert!(acceptor.accept_armed);
        assert_eq!(acceptor.ring.last().unwrap().0, Submitted::Accept { fd: LISTEN_FD });
    }

    #[test]
    fn full_queue_defers_rearm_to_next_iteration() {
        let features = Features::default();
        let workers = targets(1, features);
        let mut lb = RoundRobin::new();
        lb.register(Arc::clone(&workers[0]) as Arc<dyn Worker>);
        let mut acceptor = acceptor_for(Box::new(lb), features);
        arm(&mut acceptor);

        acceptor.ring.fail_next = 1;
        accept(&mut acceptor, 1001, "10.0.0.1:5001");
        assert!(!acceptor.accept_armed);
        assert_eq!(workers[0].inbox().pop(), Some(1001));

        acceptor.iterate().unwrap();
        assert!(acceptor.accept_armed);
    }

    #[test]
    fn stop_during_wait_leaves_nothing_queued() {
        let features = Features {
            ring_messaging: true,
        };
        let workers = targets(1, features);
        let mut lb = RoundRobin::new();
        lb.register(Arc::clone(&workers[0]) as Arc<dyn Worker>);
        let mut acceptor = acceptor_for(Box::new(lb), features);
        acceptor.ring.raise_on_wait = Some(Arc::clone(&acceptor.shutdown));

        // far above any open descriptor, so the close is a harmless EBADF
        let fd: RawFd = 1 << 24;
        write_sockaddr_v4(acceptor.acceptor.client_addr_mut(), "10.0.0.1:5001".parse().unwrap());
        acceptor.ring.complete(pack_user_data(ACCEPT_FLAG, LISTEN_FD), fd);
        acceptor.run().unwrap();

        assert_eq!(acceptor.ring.unsubmitted, 0);
        assert_eq!(acceptor.ring.count(|s| matches!(s, Submitted::MsgRing { .. })), 0);
        assert!(acceptor.in_flight.is_empty());
        assert_eq!(workers[0].inbox().pending_addresses(), 0);
    }

    #[test]
    fn handoff_queued_before_stop_is_submitted() {
        let features = Features {
            ring_messaging: true,
        };
        let workers = targets(1, features);
        let mut lb = RoundRobin::new();
        lb.register(Arc::clone(&workers[0]) as Arc<dyn Worker>);
        let mut acceptor = acceptor_for(Box::new(lb), features);
        arm(&mut acceptor);

        accept(&mut acceptor, 1001, "10.0.0.1:5001");
        assert!(acceptor.ring.unsubmitted > 0);
        assert!(acceptor.in_flight.contains_key(&1001));

        acceptor.shutdown.store(true, Ordering::Release);
        acceptor.ring.complete(pack_user_data(ADD_CONN_FLAG, 1001), 0);
        acceptor.finish().unwrap();

        assert_eq!(acceptor.ring.unsubmitted, 0);
        assert!(acceptor.in_flight.is_empty());
        // the target claims it and reads the address then
        assert_eq!(workers[0].inbox().pending_addresses(), 1);
    }

    #[test]
    fn run_refuses_empty_pool() {
        let mut acceptor = acceptor_for(Box::new(RoundRobin::new()), Features::default());
        assert!(matches!(acceptor.run(), Err(Error::EmptyPool)));
    }
}

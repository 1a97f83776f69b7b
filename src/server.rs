use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use core_affinity::CoreId;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::core::socket::{local_addr, make_reuseport_listener};
use crate::error::{Error, Result};
use crate::ring::{Ring, UringRing, probe_features};
use crate::worker::{AcceptorWorker, ConsumerWorker, EventHandler, Worker, WorkerEvent};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What a ring is being built for during startup.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum RingRole {
    Worker(usize),
    Acceptor,
}

/// A running pool: one acceptor thread and `workers` consumer threads, each
/// with its own ring.
pub struct Server {
    local_addr: SocketAddr,
    workers: Vec<Arc<dyn Worker>>,
    worker_handles: Vec<JoinHandle<()>>,
    acceptor_shutdown: Arc<AtomicBool>,
    acceptor_handle: Option<JoinHandle<Result<()>>>,
    events: flume::Receiver<WorkerEvent>,
    _listener: TcpListener,
}

impl Server {
    /// Build the pool, start every worker and wait for each to report ready
    /// before accepting.
    pub fn start<H, F>(config: ServerConfig, factory: F) -> Result<Self>
    where
        H: EventHandler + 'static,
        F: FnMut(usize) -> H,
    {
        let ring_size = config.worker.ring_size;
        Self::start_with(config, factory, |_| UringRing::new(ring_size))
    }

    /// Like [`Server::start`], with every ring built by `new_ring`. Once any
    /// worker thread runs, a failure stops and joins them all before
    /// returning.
    pub(crate) fn start_with<R, H, F, N>(
        config: ServerConfig,
        mut factory: F,
        mut new_ring: N,
    ) -> Result<Self>
    where
        R: Ring + Send + 'static,
        H: EventHandler + 'static,
        F: FnMut(usize) -> H,
        N: FnMut(RingRole) -> io::Result<R>,
    {
        if config.workers == 0 {
            return Err(Error::EmptyPool);
        }

        let features = probe_features();
        let listener = make_reuseport_listener(config.listen_addr)?;
        let local_addr = local_addr(listener.as_raw_fd())?;
        info!(
            addr = %local_addr,
            workers = config.workers,
            strategy = %config.strategy,
            ring_messaging = features.ring_messaging,
            "starting server"
        );

        let (tx, rx) = flume::unbounded();
        let mut balancer = config.strategy.build();
        let mut workers: Vec<Arc<dyn Worker>> = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let ring = new_ring(RingRole::Worker(i))?;
            let worker: Arc<dyn Worker> = Arc::new(ConsumerWorker::new(
                i,
                ring,
                factory(i),
                Some(local_addr),
                features,
                &config.worker,
                Some(tx.clone()),
            ));
            balancer.register(Arc::clone(&worker));
            workers.push(worker);
        }

        let cores: Vec<CoreId> = if config.pin_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut worker_handles = Vec::with_capacity(workers.len());
        let launched = spawn_workers(&workers, &cores, &mut worker_handles)
            .and_then(|()| wait_started(&rx, &workers))
            .and_then(|()| {
                let acceptor_shutdown = Arc::new(AtomicBool::new(false));
                let mut acceptor = AcceptorWorker::new(
                    new_ring(RingRole::Acceptor)?,
                    listener.as_raw_fd(),
                    Arc::from(balancer),
                    features,
                    Arc::clone(&acceptor_shutdown),
                    &config.worker,
                );
                let handle = thread::Builder::new()
                    .name("ringserve-acceptor".to_string())
                    .spawn(move || acceptor.run())?;
                Ok((acceptor_shutdown, handle))
            });

        let (acceptor_shutdown, acceptor_handle) = match launched {
            Ok(acceptor) => acceptor,
            Err(err) => {
                error!(error = %err, "startup failed, stopping workers");
                stop_workers(&workers, &mut worker_handles);
                return Err(err);
            }
        };

        Ok(Self {
            local_addr,
            workers,
            worker_handles,
            acceptor_shutdown,
            acceptor_handle: Some(acceptor_handle),
            events: rx,
            _listener: listener,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.workers.iter().map(|w| w.active_connections()).sum()
    }

    /// Block until `stop` is raised, then shut the server down.
    pub fn wait(self, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::Acquire) {
            thread::sleep(STOP_POLL_INTERVAL);
        }
        info!(open = self.active_connections(), "draining connections");
        self.shutdown()
    }

    /// Stop accepting, close every connection and wait for all loops to exit.
    pub fn shutdown(mut self) -> Result<()> {
        info!("shutting down server");
        self.acceptor_shutdown.store(true, Ordering::Release);
        let mut acceptor_result = Ok(());
        if let Some(handle) = self.acceptor_handle.take() {
            match handle.join() {
                Ok(res) => acceptor_result = res,
                Err(_) => error!("acceptor thread panicked"),
            }
        }

        stop_workers(&self.workers, &mut self.worker_handles);

        let finished = self
            .events
            .try_iter()
            .filter(|e| matches!(e, WorkerEvent::Finished(_)))
            .count();
        if finished != self.workers.len() {
            warn!(finished, workers = self.workers.len(), "not every worker finished cleanly");
        }
        acceptor_result
    }
}

fn spawn_workers(
    workers: &[Arc<dyn Worker>],
    cores: &[CoreId],
    handles: &mut Vec<JoinHandle<()>>,
) -> Result<()> {
    for (i, worker) in workers.iter().enumerate() {
        let worker = Arc::clone(worker);
        let core = (!cores.is_empty()).then(|| cores[i % cores.len()]);
        let handle = thread::Builder::new()
            .name(format!("ringserve-worker-{i}"))
            .spawn(move || {
                if let Some(core) = core {
                    core_affinity::set_for_current(core);
                    info!(worker = i, core = core.id, "pinned to core");
                }
                if let Err(err) = worker.run(i) {
                    error!(worker = i, error = %err, "worker fatal");
                }
            })?;
        handles.push(handle);
    }
    Ok(())
}

/// Signal every worker and join the threads spawned so far.
fn stop_workers(workers: &[Arc<dyn Worker>], handles: &mut Vec<JoinHandle<()>>) {
    for worker in workers {
        worker.shutdown();
    }
    for handle in handles.drain(..) {
        if handle.join().is_err() {
            error!("worker thread panicked");
        }
    }
}

fn wait_started(rx: &flume::Receiver<WorkerEvent>, workers: &[Arc<dyn Worker>]) -> Result<()> {
    let mut started = 0;
    while started < workers.len() {
        match rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(WorkerEvent::Started(index)) => {
                info!(worker = index, "worker started");
                started += 1;
            }
            Ok(WorkerEvent::Finished(index)) => {
                warn!(worker = index, "worker finished during startup");
            }
            Err(_) => {
                let ready = workers.iter().filter(|w| w.started()).count();
                error!(ready, workers = workers.len(), "workers did not start in time");
                return Err(io::Error::new(io::ErrorKind::TimedOut, "worker startup timed out").into());
            }
        }
    }
    Ok(())
}

//! Wires the dispatcher to the store workers, installs signal handling,
//! and supervises the worker threads until shutdown.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::net_worker::NetWorker;
use crate::store::KvStore;
use crate::store_worker::StoreWorker;
use crate::worker::{WorkerCore, WorkerCtl, WorkerHandle};

/// Process-wide stop request. Signal handlers only flip this flag; the
/// supervisor's poll loop does the actual stopping.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

extern "C" fn handle_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Route `SIGINT` and `SIGTERM` into the shutdown flag.
pub fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
}

/// Handle for stopping one running [`Server`] from another thread.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A fully launched server: dispatcher, store workers, and the registry
/// of their control handles.
pub struct Server {
    net: WorkerHandle<NetWorker>,
    stores: Vec<WorkerHandle<StoreWorker>>,
    ctls: Vec<WorkerCtl>,
    latency_log: Option<std::path::PathBuf>,
    stop: Arc<AtomicBool>,
}

impl Server {
    /// Construct the store and workers, wire every peer channel, and
    /// launch the threads: the dispatcher first, then the store workers.
    ///
    /// When any launch fails, everything launched so far is stopped and
    /// joined before the error is returned.
    pub fn launch(config: ServerConfig) -> Result<Self, ServerError> {
        let store = Arc::new(KvStore::new(config.cmd_file.as_deref()));
        info!(read_only = !store.writeable(), "kv store ready");

        let pin = |idx: usize| {
            config
                .pinning
                .enabled
                .then_some(config.pinning.core_offset + idx)
        };

        let mut net = NetWorker::new(
            config.bind,
            config.policy,
            config.latency_log.is_some(),
            pin(0),
        );
        let mut stores = Vec::with_capacity(config.workers);
        for id in 1..=config.workers {
            let mut worker = StoreWorker::new(id, store.clone(), pin(id));
            WorkerCore::register_peers(net.core_mut(), worker.core_mut())?;
            stores.push(worker);
        }

        let net_handle = WorkerHandle::launch(net)?;
        let mut ctls = vec![net_handle.ctl()];
        let mut store_handles = Vec::with_capacity(stores.len());
        for worker in stores {
            match WorkerHandle::launch(worker) {
                Ok(handle) => {
                    ctls.push(handle.ctl());
                    store_handles.push(handle);
                }
                Err(e) => {
                    error!(error = %e, "store worker failed to launch; stopping");
                    stop_all(&ctls);
                    join_all(net_handle, store_handles, config.latency_log.as_deref());
                    return Err(e);
                }
            }
        }

        Ok(Self {
            net: net_handle,
            stores: store_handles,
            ctls,
            latency_log: config.latency_log,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Handle used to stop this server from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    /// Poll until a worker exits or shutdown is requested, then stop and
    /// join every worker and dump the latency log.
    pub fn supervise(self) -> Result<(), ServerError> {
        let Server {
            net,
            stores,
            ctls,
            latency_log,
            stop,
        } = self;
        loop {
            thread::sleep(POLL_INTERVAL);
            if SHUTDOWN.load(Ordering::SeqCst) || stop.load(Ordering::SeqCst) {
                info!("shutdown requested");
                stop_all(&ctls);
                break;
            }
            if net.has_exited() || stores.iter().any(|h| h.has_exited()) {
                warn!("a worker exited; stopping all workers");
                stop_all(&ctls);
                break;
            }
        }
        join_all(net, stores, latency_log.as_deref());
        info!("execution complete");
        Ok(())
    }
}

fn stop_all(ctls: &[WorkerCtl]) {
    debug!("stopping all workers");
    for ctl in ctls {
        ctl.stop();
    }
}

/// Join every worker, log run errors, and dump the latency samples the
/// dispatcher collected.
fn join_all(
    net: WorkerHandle<NetWorker>,
    stores: Vec<WorkerHandle<StoreWorker>>,
    latency_log: Option<&Path>,
) {
    let (outcome, net_worker) = net.join();
    if let Err(e) = outcome {
        error!(error = %e, "dispatcher exited with error");
    }
    for handle in stores {
        let (outcome, _worker) = handle.join();
        if let Err(e) = outcome {
            error!(error = %e, "store worker exited with error");
        }
    }

    if let (Some(path), Some(worker)) = (latency_log, net_worker) {
        if let Some(latency) = worker.latency() {
            match latency.dump(path) {
                Ok(()) => info!(path = %path.display(), "wrote net traces"),
                Err(e) => error!(path = %path.display(), error = %e, "could not write net traces"),
            }
        }
    }
}

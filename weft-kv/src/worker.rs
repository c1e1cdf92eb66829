//! Worker lifecycle: pinned threads, peer wiring, launch/stop/join.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info};
use weft::{QDesc, QResult, QToken, ServiceUnit};

use crate::envelope::Envelope;
use crate::error::ServerError;

/// Worker identifier. The dispatcher is always [`NET_WORKER_ID`]; store
/// workers take `1..=n`.
pub type WorkerId = usize;

/// Identifier of the dispatcher.
pub const NET_WORKER_ID: WorkerId = 0;

/// How long `launch` sleeps between checks for the thread coming up.
const LAUNCH_POLL: Duration = Duration::from_millis(10);

/// Behavior of one worker thread, driven by the launch harness:
/// `setup()` once on the new thread, then `dequeue()`/`work()` until the
/// worker is stopped or returns an error.
pub trait Worker: Send {
    fn id(&self) -> WorkerId;

    /// One-time initialization on the worker thread. A non-`Ok` return
    /// fails the launch.
    fn setup(&mut self) -> Result<(), ServerError>;

    /// Try to produce one completion. `Ok(None)` means nothing was ready
    /// this pass.
    fn dequeue(&mut self) -> Result<Option<QResult<Envelope>>, ServerError>;

    /// Handle one completion. A non-`Ok` return terminates the worker.
    fn work(&mut self, completion: QResult<Envelope>) -> Result<(), ServerError>;
}

/// Queue table plus peer registry shared by every worker flavor.
///
/// The two registry maps are mutual inverses: every wired peer id maps to
/// exactly one local queue descriptor and back.
pub struct WorkerCore {
    id: WorkerId,
    unit: ServiceUnit<Envelope>,
    peer_ids: Vec<WorkerId>,
    peer_id_to_qd: HashMap<WorkerId, QDesc>,
    peer_qd_to_id: HashMap<QDesc, WorkerId>,
}

impl WorkerCore {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            unit: ServiceUnit::new(),
            peer_ids: Vec::new(),
            peer_id_to_qd: HashMap::new(),
            peer_qd_to_id: HashMap::new(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn unit_mut(&mut self) -> &mut ServiceUnit<Envelope> {
        &mut self.unit
    }

    /// Wired peers in registration order.
    pub fn peer_ids(&self) -> &[WorkerId] {
        &self.peer_ids
    }

    /// The local queue descriptor for a wired peer.
    pub fn peer_qd(&self, peer: WorkerId) -> Option<QDesc> {
        self.peer_id_to_qd.get(&peer).copied()
    }

    /// The peer on the far side of `qd`, or `None` for plain sockets.
    pub fn peer_id(&self, qd: QDesc) -> Option<WorkerId> {
        self.peer_qd_to_id.get(&qd).copied()
    }

    /// Wire `a` and `b` with a fresh pair of single-slot channels, one
    /// per direction, and record the peer on both sides.
    pub fn register_peers(a: &mut WorkerCore, b: &mut WorkerCore) -> Result<(), ServerError> {
        if a.peer_id_to_qd.contains_key(&b.id) || b.peer_id_to_qd.contains_key(&a.id) {
            return Err(ServerError::DuplicatePeer(a.id, b.id));
        }
        let (a_to_b_tx, a_to_b_rx) = crossbeam_channel::bounded(1);
        let (b_to_a_tx, b_to_a_rx) = crossbeam_channel::bounded(1);
        let a_qd = a.unit.shared_queue(a_to_b_tx, b_to_a_rx);
        let b_qd = b.unit.shared_queue(b_to_a_tx, a_to_b_rx);
        a.install_peer(b.id, a_qd);
        b.install_peer(a.id, b_qd);
        debug!(a = a.id, b = b.id, "registered peers");
        Ok(())
    }

    fn install_peer(&mut self, peer: WorkerId, qd: QDesc) {
        self.peer_id_to_qd.insert(peer, qd);
        self.peer_qd_to_id.insert(qd, peer);
        self.peer_ids.push(peer);
    }

    /// Push an envelope to a peer and wait for the slot to take it. At
    /// steady state each direction carries at most one in-flight message,
    /// so the wait returns almost immediately.
    pub fn push_to_peer(&mut self, peer: WorkerId, envelope: Envelope) -> Result<(), ServerError> {
        let qd = self
            .peer_qd(peer)
            .ok_or(ServerError::MissingPeer(self.id, peer))?;
        let token = self.unit.push_msg(qd, envelope)?;
        self.unit.wait(token)?;
        debug!(from = self.id, to = peer, "pushed to peer");
        Ok(())
    }

    /// Arm a pop on the channel from `peer`.
    pub fn pop_from_peer(&mut self, peer: WorkerId) -> Result<QToken, ServerError> {
        let qd = self
            .peer_qd(peer)
            .ok_or(ServerError::MissingPeer(self.id, peer))?;
        Ok(self.unit.pop(qd)?)
    }
}

/// Pin the current thread to a CPU core.
///
/// Callers treat failure as advisory: the worker logs it and keeps
/// running unpinned.
pub fn pin_to_core(core: usize) -> Result<(), ServerError> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(ServerError::Io(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Shared control flags for one launched worker.
#[derive(Clone)]
pub struct WorkerCtl {
    id: WorkerId,
    started: Arc<AtomicBool>,
    exited: Arc<AtomicBool>,
    terminate: Arc<AtomicBool>,
}

impl WorkerCtl {
    fn new(id: WorkerId) -> Self {
        Self {
            id,
            started: Arc::new(AtomicBool::new(false)),
            exited: Arc::new(AtomicBool::new(false)),
            terminate: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Ask the worker to stop at its next loop turn.
    pub fn stop(&self) {
        debug!(worker = self.id, "terminating worker");
        self.terminate.store(true, Ordering::Release);
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

/// A running worker thread. `join` hands the worker itself back so
/// callers can pull post-run state (e.g. latency samples) out of it.
pub struct WorkerHandle<W> {
    ctl: WorkerCtl,
    thread: thread::JoinHandle<(Result<(), ServerError>, W)>,
}

impl<W: Worker + 'static> WorkerHandle<W> {
    /// Spawn the worker thread, then wait for setup to succeed or fail.
    /// Launching consumes the worker, so a second launch of the same
    /// worker cannot be expressed.
    pub fn launch(worker: W) -> Result<Self, ServerError> {
        let ctl = WorkerCtl::new(worker.id());
        let thread_ctl = ctl.clone();
        let thread = thread::Builder::new()
            .name(format!("weft-worker-{}", ctl.id))
            .spawn(move || run_wrapper(worker, thread_ctl))?;

        while !ctl.started.load(Ordering::Acquire) && !ctl.exited.load(Ordering::Acquire) {
            thread::sleep(LAUNCH_POLL);
        }
        debug!(worker = ctl.id, "worker launched");
        if ctl.exited.load(Ordering::Acquire) && !ctl.started.load(Ordering::Acquire) {
            // Setup failed; surface the worker's own error.
            let err = match thread.join() {
                Ok((Err(e), _worker)) => e,
                Ok((Ok(()), _worker)) => ServerError::LaunchFailed(ctl.id),
                Err(_) => ServerError::Panicked(ctl.id),
            };
            return Err(err);
        }
        Ok(Self { ctl, thread })
    }

    pub fn ctl(&self) -> WorkerCtl {
        self.ctl.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.ctl.has_exited()
    }

    /// Join the thread, returning the run outcome and the worker. The
    /// worker is `None` only when its thread panicked.
    pub fn join(self) -> (Result<(), ServerError>, Option<W>) {
        match self.thread.join() {
            Ok((outcome, worker)) => (outcome, Some(worker)),
            Err(_) => (Err(ServerError::Panicked(self.ctl.id)), None),
        }
    }
}

fn run_wrapper<W: Worker>(mut worker: W, ctl: WorkerCtl) -> (Result<(), ServerError>, W) {
    // The exited flag must flip even when the worker panics, or launch
    // and the supervisor would wait on it forever.
    struct ExitFlag<'a>(&'a WorkerCtl);
    impl Drop for ExitFlag<'_> {
        fn drop(&mut self) {
            self.0.exited.store(true, Ordering::Release);
        }
    }

    let flag = ExitFlag(&ctl);
    let outcome = run(&mut worker, &ctl);
    drop(flag);
    info!(worker = ctl.id, "worker terminating");
    (outcome, worker)
}

fn run<W: Worker>(worker: &mut W, ctl: &WorkerCtl) -> Result<(), ServerError> {
    if let Err(e) = worker.setup() {
        error!(worker = ctl.id, error = %e, "worker failed to initialize");
        return Err(e);
    }
    ctl.started.store(true, Ordering::Release);
    info!(worker = ctl.id, "worker started");
    while !ctl.terminate.load(Ordering::Acquire) {
        match worker.dequeue()? {
            None => thread::yield_now(),
            Some(completion) => worker.work(completion)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct IdleWorker {
        id: WorkerId,
        fail_setup: bool,
        turns: Arc<AtomicUsize>,
    }

    impl IdleWorker {
        fn new(id: WorkerId, fail_setup: bool) -> Self {
            Self {
                id,
                fail_setup,
                turns: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Worker for IdleWorker {
        fn id(&self) -> WorkerId {
            self.id
        }

        fn setup(&mut self) -> Result<(), ServerError> {
            if self.fail_setup {
                return Err(ServerError::LaunchFailed(self.id));
            }
            Ok(())
        }

        fn dequeue(&mut self) -> Result<Option<QResult<Envelope>>, ServerError> {
            self.turns.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }

        fn work(&mut self, _completion: QResult<Envelope>) -> Result<(), ServerError> {
            unreachable!("IdleWorker never dequeues a completion");
        }
    }

    #[test]
    fn launch_stop_join() {
        let worker = IdleWorker::new(7, false);
        let turns = worker.turns.clone();
        let handle = WorkerHandle::launch(worker).unwrap();
        assert!(!handle.has_exited());

        // The run loop is actually spinning.
        let before = turns.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(20));
        assert!(turns.load(Ordering::Relaxed) > before);

        handle.ctl().stop();
        let (outcome, worker) = handle.join();
        outcome.unwrap();
        assert!(worker.is_some());
    }

    #[test]
    fn launch_fails_when_setup_fails() {
        let worker = IdleWorker::new(3, true);
        let err = WorkerHandle::launch(worker)
            .err()
            .expect("launch should fail when setup fails");
        assert!(matches!(err, ServerError::LaunchFailed(3)));
    }

    #[test]
    fn peer_registry_is_bijective() {
        let mut a = WorkerCore::new(0);
        let mut b = WorkerCore::new(1);
        WorkerCore::register_peers(&mut a, &mut b).unwrap();

        let a_qd = a.peer_qd(1).unwrap();
        assert_eq!(a.peer_id(a_qd), Some(1));
        let b_qd = b.peer_qd(0).unwrap();
        assert_eq!(b.peer_id(b_qd), Some(0));
        assert_eq!(a.peer_ids(), &[1]);
        assert_eq!(b.peer_ids(), &[0]);

        assert!(matches!(
            WorkerCore::register_peers(&mut a, &mut b),
            Err(ServerError::DuplicatePeer(0, 1))
        ));
    }

    #[test]
    fn push_to_peer_and_pop() {
        let mut a = WorkerCore::new(0);
        let mut b = WorkerCore::new(1);
        WorkerCore::register_peers(&mut a, &mut b).unwrap();

        let conn = dummy_qd(&mut a);
        a.push_to_peer(
            1,
            Envelope::Response {
                conn,
                data: bytes::Bytes::from_static(b"hi"),
            },
        )
        .unwrap();

        let token = b.pop_from_peer(0).unwrap();
        let result = b.unit_mut().wait(token).unwrap();
        match result.op {
            weft::OpResult::Pop(weft::Popped::Message(Envelope::Response { data, .. })) => {
                assert_eq!(data.as_ref(), b"hi");
            }
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn push_to_unknown_peer_is_refused() {
        let mut a = WorkerCore::new(0);
        let qd = dummy_qd(&mut a);
        let result = a.push_to_peer(
            9,
            Envelope::Response {
                conn: qd,
                data: bytes::Bytes::new(),
            },
        );
        assert!(matches!(result, Err(ServerError::MissingPeer(0, 9))));
    }

    /// Any descriptor will do for envelopes that never reach a socket.
    fn dummy_qd(core: &mut WorkerCore) -> QDesc {
        core.unit_mut().socket()
    }
}

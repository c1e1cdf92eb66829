//! Store workers: evaluate requests against the shared KV map.

use std::sync::Arc;

use tracing::{debug, error, warn};
use weft::{OpResult, Popped, QDesc, QResult, QToken};

use crate::envelope::Envelope;
use crate::error::ServerError;
use crate::metrics;
use crate::store::KvStore;
use crate::worker::{NET_WORKER_ID, Worker, WorkerCore, WorkerId, pin_to_core};

/// One store worker: pops requests from the dispatcher channel, runs them
/// against the map, and pushes the reply back. It keeps exactly one pop
/// outstanding and re-arms it before touching the payload, so the
/// dispatcher can hand over the next request immediately.
pub struct StoreWorker {
    core: WorkerCore,
    store: Arc<KvStore>,
    /// Core to pin to, or `None` to run unpinned.
    pin: Option<usize>,
    net_qd: Option<QDesc>,
    pop_token: Option<QToken>,
}

impl StoreWorker {
    pub fn new(id: WorkerId, store: Arc<KvStore>, pin: Option<usize>) -> Self {
        debug_assert_ne!(id, NET_WORKER_ID, "store workers may not take the dispatcher id");
        Self {
            core: WorkerCore::new(id),
            store,
            pin,
            net_qd: None,
            pop_token: None,
        }
    }

    pub fn core_mut(&mut self) -> &mut WorkerCore {
        &mut self.core
    }
}

impl Worker for StoreWorker {
    fn id(&self) -> WorkerId {
        self.core.id()
    }

    fn setup(&mut self) -> Result<(), ServerError> {
        if let Some(core) = self.pin {
            if let Err(e) = pin_to_core(core) {
                warn!(worker = self.core.id(), core, error = %e, "could not pin store worker thread");
            }
        }
        let Some(net_qd) = self.core.peer_qd(NET_WORKER_ID) else {
            error!(
                worker = self.core.id(),
                "dispatcher must be registered before launching a store worker"
            );
            return Err(ServerError::MissingPeer(self.core.id(), NET_WORKER_ID));
        };
        self.pop_token = Some(self.core.unit_mut().pop(net_qd)?);
        self.net_qd = Some(net_qd);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Option<QResult<Envelope>>, ServerError> {
        let (token, net_qd) = match (self.pop_token, self.net_qd) {
            (Some(token), Some(net_qd)) => (token, net_qd),
            _ => return Err(ServerError::UnexpectedCompletion("dequeue before setup")),
        };
        match self.core.unit_mut().wait_try(token)? {
            None => Ok(None),
            Some(completion) => {
                self.pop_token = Some(self.core.unit_mut().pop(net_qd)?);
                Ok(Some(completion))
            }
        }
    }

    fn work(&mut self, completion: QResult<Envelope>) -> Result<(), ServerError> {
        let OpResult::Pop(Popped::Message(envelope)) = completion.op else {
            return Err(ServerError::UnexpectedCompletion(
                "store workers only arm channel pops",
            ));
        };
        let Envelope::Request { conn, payload } = envelope else {
            return Err(ServerError::UnexpectedEnvelope(
                "response envelope delivered to a store worker",
            ));
        };
        if payload.nsegs() != 1 {
            return Err(ServerError::UnexpectedEnvelope(
                "request payload must be a single segment",
            ));
        }

        let request = payload.seg(0);
        debug!(
            worker = self.core.id(),
            request = %String::from_utf8_lossy(request),
            "received request"
        );
        metrics::STORE_REQUESTS.increment();
        let reply = match self.store.evaluate(request) {
            Ok(reply) => reply,
            Err(e) => e.into_reply(),
        };

        self.core.push_to_peer(
            NET_WORKER_ID,
            Envelope::Response {
                conn,
                data: reply.into(),
            },
        )?;
        // `payload` drops here, releasing the raw request buffer.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use weft::Sga;

    use super::*;

    /// Drive one request through a store worker without threads: the test
    /// plays the dispatcher's side of the channel by hand.
    #[test]
    fn evaluates_a_request_and_replies() {
        let store = Arc::new(KvStore::new(None));
        let mut dispatcher = WorkerCore::new(NET_WORKER_ID);
        let mut worker = StoreWorker::new(1, store, None);
        WorkerCore::register_peers(&mut dispatcher, worker.core_mut()).unwrap();

        worker.setup().unwrap();

        let conn = dispatcher.unit_mut().socket();
        dispatcher
            .push_to_peer(
                1,
                Envelope::Request {
                    conn,
                    payload: Sga::single(&b"PUT greeting hello"[..]),
                },
            )
            .unwrap();

        let completion = worker.dequeue().unwrap().expect("request should be ready");
        worker.work(completion).unwrap();

        let token = dispatcher.pop_from_peer(1).unwrap();
        let reply = dispatcher.unit_mut().wait(token).unwrap();
        match reply.op {
            OpResult::Pop(Popped::Message(Envelope::Response { conn: back, data })) => {
                assert_eq!(back, conn);
                assert_eq!(data.as_ref(), b"SUCCESS");
            }
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn verb_errors_become_replies_not_failures() {
        let store = Arc::new(KvStore::new(None));
        let mut dispatcher = WorkerCore::new(NET_WORKER_ID);
        let mut worker = StoreWorker::new(1, store, None);
        WorkerCore::register_peers(&mut dispatcher, worker.core_mut()).unwrap();
        worker.setup().unwrap();

        let conn = dispatcher.unit_mut().socket();
        dispatcher
            .push_to_peer(
                1,
                Envelope::Request {
                    conn,
                    payload: Sga::single(&b"FOO bar"[..]),
                },
            )
            .unwrap();

        let completion = worker.dequeue().unwrap().expect("request should be ready");
        worker.work(completion).unwrap();

        let token = dispatcher.pop_from_peer(1).unwrap();
        let reply = dispatcher.unit_mut().wait(token).unwrap();
        match reply.op {
            OpResult::Pop(Popped::Message(Envelope::Response { data, .. })) => {
                assert_eq!(data.as_ref(), b"ERR: Unknown reqtype");
            }
            other => panic!("unexpected completion: {other:?}"),
        }
    }

    #[test]
    fn setup_requires_the_dispatcher_channel() {
        let store = Arc::new(KvStore::new(None));
        let mut worker = StoreWorker::new(2, store, None);
        assert!(matches!(
            worker.setup(),
            Err(ServerError::MissingPeer(2, NET_WORKER_ID))
        ));
    }
}

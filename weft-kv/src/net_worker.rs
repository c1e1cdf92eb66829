//! The dispatcher: owns the listening socket, routes each client request
//! to a store worker, and writes replies back to the originating socket.
//!
//! A single token set multiplexes the listener, every client socket, and
//! every peer channel through one `wait_any` scan, so one thread serves
//! all of them without ever blocking on a specific queue.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, info, warn};
use weft::{OpResult, Popped, QDesc, QResult, QToken, Sga, WaitAny};

use crate::envelope::Envelope;
use crate::error::ServerError;
use crate::latency::LatencyLog;
use crate::metrics;
use crate::worker::{NET_WORKER_ID, Worker, WorkerCore, WorkerId, pin_to_core};

const LISTEN_BACKLOG: i32 = 100;

/// How a new request is assigned to a store worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Rotate through the peers in registration order.
    RoundRobin,
    /// Route on the byte immediately after the first space of the request
    /// (the first byte of the key), read as an ASCII decimal digit.
    Key,
}

pub struct NetWorker {
    core: WorkerCore,
    bind_addr: SocketAddr,
    policy: Policy,
    /// Core to pin to, or `None` to run unpinned.
    pin: Option<usize>,
    lqd: Option<QDesc>,
    tokens: Vec<QToken>,
    start_offset: usize,
    /// Round-robin cursor. Pre-incremented, so the first pick is the
    /// second registered peer (wrapping when there is only one).
    worker_offset: usize,
    latency: Option<LatencyLog>,
}

impl NetWorker {
    pub fn new(
        bind_addr: SocketAddr,
        policy: Policy,
        record_latency: bool,
        pin: Option<usize>,
    ) -> Self {
        Self {
            core: WorkerCore::new(NET_WORKER_ID),
            bind_addr,
            policy,
            pin,
            lqd: None,
            tokens: Vec::new(),
            start_offset: 0,
            worker_offset: 0,
            latency: record_latency.then(LatencyLog::new),
        }
    }

    pub fn core_mut(&mut self) -> &mut WorkerCore {
        &mut self.core
    }

    /// Latency samples recorded this run, when recording is on.
    pub fn latency(&self) -> Option<&LatencyLog> {
        self.latency.as_ref()
    }

    fn choose_worker(&mut self, request: &Sga) -> Option<WorkerId> {
        let peers = self.core.peer_ids();
        if peers.is_empty() {
            return None;
        }
        let peer = match self.policy {
            Policy::RoundRobin => {
                self.worker_offset += 1;
                if self.worker_offset >= peers.len() {
                    self.worker_offset = 0;
                }
                peers[self.worker_offset]
            }
            Policy::Key => {
                let buf = request.seg(0);
                // No space (or nothing after it) routes like a '0' key.
                // Anything else is taken as a raw byte; no validation.
                let digit = match buf.iter().position(|&b| b == b' ') {
                    Some(i) if i + 1 < buf.len() => buf[i + 1],
                    _ => b'0',
                };
                let idx = (digit as i32 - '0' as i32).rem_euclid(peers.len() as i32) as usize;
                peers[idx]
            }
        };
        Some(peer)
    }
}

impl Worker for NetWorker {
    fn id(&self) -> WorkerId {
        self.core.id()
    }

    fn setup(&mut self) -> Result<(), ServerError> {
        if let Some(core) = self.pin {
            if let Err(e) = pin_to_core(core) {
                warn!(core, error = %e, "could not pin dispatcher thread");
            }
        }
        let lqd = self.core.unit_mut().socket();
        self.core.unit_mut().bind(lqd, self.bind_addr)?;
        self.core.unit_mut().listen(lqd, LISTEN_BACKLOG)?;
        let addr = self.core.unit_mut().local_addr(lqd)?;
        info!(%addr, "dispatcher listening");

        let token = self.core.unit_mut().accept(lqd)?;
        self.tokens.push(token);
        for peer in self.core.peer_ids().to_vec() {
            let token = self.core.pop_from_peer(peer)?;
            self.tokens.push(token);
        }
        self.lqd = Some(lqd);
        Ok(())
    }

    fn dequeue(&mut self) -> Result<Option<QResult<Envelope>>, ServerError> {
        match self
            .core
            .unit_mut()
            .wait_any(&self.tokens, &mut self.start_offset)?
        {
            WaitAny::NotReady => Ok(None),
            WaitAny::Aborted { idx, qd } => {
                // The client is gone; drop the token and do not re-arm.
                self.tokens.remove(idx);
                metrics::CONNECTIONS_ABORTED.increment();
                debug!(%qd, "client connection aborted");
                Ok(None)
            }
            WaitAny::Ready { idx, result } => {
                self.tokens.remove(idx);
                Ok(Some(result))
            }
        }
    }

    fn work(&mut self, completion: QResult<Envelope>) -> Result<(), ServerError> {
        let entry_time = Instant::now();
        match completion.op {
            OpResult::Accept(conn) => {
                let token = self.core.unit_mut().pop(conn)?;
                self.tokens.push(token);
                let lqd = self
                    .lqd
                    .ok_or(ServerError::UnexpectedCompletion("accept before setup"))?;
                let token = self.core.unit_mut().accept(lqd)?;
                self.tokens.push(token);
                metrics::CONNECTIONS_ACCEPTED.increment();
                debug!(%conn, "accepted a new connection");
            }
            OpResult::Push => {
                // The reply buffer was released with this completion.
                if let Some(latency) = self.latency.as_mut() {
                    latency.record_exit(Instant::now());
                }
                metrics::RESPONSES_SENT.increment();
            }
            OpResult::Pop(Popped::Bytes(payload)) => {
                // A fresh request from a client socket.
                if let Some(latency) = self.latency.as_mut() {
                    latency.record_entry(entry_time);
                }
                let conn = completion.qd;
                match self.choose_worker(&payload) {
                    None => warn!(%conn, "no store workers registered; dropping request"),
                    Some(chosen) => {
                        let envelope = Envelope::Request { conn, payload };
                        if let Err(e) = self.core.push_to_peer(chosen, envelope) {
                            warn!(peer = chosen, error = %e, "could not push request to store worker");
                        } else {
                            metrics::REQUESTS_DISPATCHED.increment();
                            debug!(peer = chosen, "dispatched request");
                        }
                    }
                }
                match self.core.unit_mut().pop(conn) {
                    Ok(token) => self.tokens.push(token),
                    // The socket died while we were dispatching.
                    Err(weft::Error::BadQueue(_)) => debug!(%conn, "client gone after request"),
                    Err(e) => return Err(e.into()),
                }
            }
            OpResult::Pop(Popped::Message(envelope)) => {
                // A reply coming back from a store worker.
                let Envelope::Response { conn, data } = envelope else {
                    return Err(ServerError::UnexpectedEnvelope(
                        "request envelope delivered to the dispatcher",
                    ));
                };
                match self.core.unit_mut().push(conn, Sga::single(data)) {
                    Ok(token) => self.tokens.push(token),
                    // The client vanished between request and reply; the
                    // buffer drops here.
                    Err(weft::Error::BadQueue(_)) => debug!(%conn, "client gone before reply"),
                    Err(e) => return Err(e.into()),
                }
                let token = self.core.unit_mut().pop(completion.qd)?;
                self.tokens.push(token);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn worker_with_peers(policy: Policy, n_peers: usize) -> (NetWorker, Vec<WorkerCore>) {
        let mut net = NetWorker::new("127.0.0.1:0".parse().unwrap(), policy, false, None);
        let mut stores = Vec::new();
        for id in 1..=n_peers {
            let mut store = WorkerCore::new(id);
            WorkerCore::register_peers(net.core_mut(), &mut store).unwrap();
            stores.push(store);
        }
        (net, stores)
    }

    fn request(bytes: &[u8]) -> Sga {
        Sga::single(bytes.to_vec())
    }

    #[test]
    fn round_robin_starts_at_the_second_peer() {
        let (mut net, _stores) = worker_with_peers(Policy::RoundRobin, 3);
        let picks: Vec<WorkerId> = (0..6)
            .map(|_| net.choose_worker(&request(b"GET x")).unwrap())
            .collect();
        assert_eq!(picks, vec![2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn round_robin_single_peer() {
        let (mut net, _stores) = worker_with_peers(Policy::RoundRobin, 1);
        for _ in 0..4 {
            assert_eq!(net.choose_worker(&request(b"GET x")).unwrap(), 1);
        }
    }

    #[test]
    fn round_robin_is_balanced() {
        let (mut net, _stores) = worker_with_peers(Policy::RoundRobin, 4);
        let mut counts: HashMap<WorkerId, usize> = HashMap::new();
        for _ in 0..42 {
            *counts
                .entry(net.choose_worker(&request(b"PUT k v")).unwrap())
                .or_default() += 1;
        }
        let max = counts.values().copied().max().unwrap();
        let min = counts.values().copied().min().unwrap();
        assert!(max - min <= 1, "unbalanced selection: {counts:?}");
    }

    #[test]
    fn key_policy_routes_on_the_first_key_digit() {
        let (mut net, _stores) = worker_with_peers(Policy::Key, 3);
        // peers are [1, 2, 3]; index is digit mod 3.
        assert_eq!(net.choose_worker(&request(b"GET 3xyz")).unwrap(), 1);
        assert_eq!(net.choose_worker(&request(b"GET 7abc")).unwrap(), 2);
        assert_eq!(net.choose_worker(&request(b"GET 0aaa")).unwrap(), 1);
        assert_eq!(net.choose_worker(&request(b"GET 5")).unwrap(), 3);
    }

    #[test]
    fn key_policy_without_space_routes_like_digit_zero() {
        let (mut net, _stores) = worker_with_peers(Policy::Key, 3);
        assert_eq!(net.choose_worker(&request(b"nospace")).unwrap(), 1);
        // A trailing space with nothing after it behaves the same.
        assert_eq!(net.choose_worker(&request(b"GET ")).unwrap(), 1);
    }

    #[test]
    fn key_policy_is_deterministic_for_non_digits() {
        let (mut net, _stores) = worker_with_peers(Policy::Key, 3);
        // 'a' is 49 past '0'; 49 mod 3 == 1.
        assert_eq!(net.choose_worker(&request(b"GET abc")).unwrap(), 2);
        // '!' is 15 below '0'; -15 rem_euclid 3 == 0.
        assert_eq!(net.choose_worker(&request(b"GET !bang")).unwrap(), 1);
    }

    #[test]
    fn no_peers_means_no_choice() {
        let mut net = NetWorker::new("127.0.0.1:0".parse().unwrap(), Policy::RoundRobin, false, None);
        assert_eq!(net.choose_worker(&request(b"GET x")), None);
    }
}

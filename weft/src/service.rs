//! Per-worker queue tables and the tokenized wait primitives.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use tracing::debug;

use crate::error::Error;
use crate::queue::{FlushOutcome, NetQueue, NetState, Queue, SharedQueue, create_listener};
use crate::sga::Sga;

/// Size of the buffer handed to each network pop. One pop delivers at most
/// one buffer's worth of bytes.
const RECV_BUF_SIZE: usize = 16 * 1024;

/// Queue descriptor: opaque handle to one queue in a [`ServiceUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QDesc(u32);

impl fmt::Display for QDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qd:{}", self.0)
    }
}

/// Token naming one outstanding operation on a [`ServiceUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QToken(u64);

impl fmt::Display for QToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "qt:{}", self.0)
    }
}

/// A completed operation and the queue it completed on.
#[derive(Debug)]
pub struct QResult<M> {
    pub qd: QDesc,
    pub op: OpResult<M>,
}

/// What a resolved token produced.
#[derive(Debug)]
pub enum OpResult<M> {
    /// A new connection, already installed as its own queue.
    Accept(QDesc),
    /// An inbound payload.
    Pop(Popped<M>),
    /// An outbound payload was fully handed to the transport; its buffers
    /// are released.
    Push,
}

/// Payload of a completed pop, discriminated by queue flavor.
#[derive(Debug)]
pub enum Popped<M> {
    /// Raw bytes from a network queue.
    Bytes(Sga),
    /// An owned message from a shared queue.
    Message(M),
}

/// Outcome of one [`ServiceUnit::wait_any`] pass over a token set.
#[derive(Debug)]
pub enum WaitAny<M> {
    /// The token at `idx` completed. The caller must remove that entry
    /// from its token set before the next call.
    Ready { idx: usize, result: QResult<M> },
    /// The connection behind the token at `idx` is gone. The token is
    /// consumed; the caller must remove the entry and must not re-arm.
    Aborted { idx: usize, qd: QDesc },
    /// Nothing completed this pass.
    NotReady,
}

/// An operation that has not yet completed.
enum Pending<M> {
    Accept { qd: QDesc },
    NetPop { qd: QDesc },
    NetPush { qd: QDesc },
    SharedPop { qd: QDesc },
    SharedPush { qd: QDesc, msg: M },
}

/// A completion recorded while servicing a different token (head-of-line
/// write flushes), waiting for its own token to be polled.
enum Done {
    Pushed(QDesc),
    Aborted(QDesc),
}

enum Polled<M> {
    Ready(QResult<M>),
    NotReady,
    Aborted(QDesc),
}

/// One worker's queue table: network endpoints and shared-queue ends
/// behind a single descriptor space, with tokenized completion.
///
/// `M` is the message type carried by shared queues. A `ServiceUnit` is
/// owned by exactly one worker thread and is not `Sync`; cross-worker
/// communication happens only through the channels installed with
/// [`shared_queue`](Self::shared_queue).
pub struct ServiceUnit<M> {
    queues: HashMap<QDesc, Queue<M>>,
    pending: HashMap<QToken, Pending<M>>,
    done: HashMap<QToken, Done>,
    next_qd: u32,
    next_token: u64,
}

impl<M> Default for ServiceUnit<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ServiceUnit<M> {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
            pending: HashMap::new(),
            done: HashMap::new(),
            next_qd: 0,
            next_token: 0,
        }
    }

    fn alloc_qd(&mut self) -> QDesc {
        let qd = QDesc(self.next_qd);
        self.next_qd += 1;
        qd
    }

    fn alloc_token(&mut self) -> QToken {
        let token = QToken(self.next_token);
        self.next_token += 1;
        token
    }

    // ── Queue setup ─────────────────────────────────────────────────

    /// Allocate an unbound network queue.
    pub fn socket(&mut self) -> QDesc {
        let qd = self.alloc_qd();
        self.queues.insert(qd, Queue::Net(NetQueue::unbound()));
        qd
    }

    /// Record the bind address for a network queue.
    pub fn bind(&mut self, qd: QDesc, addr: SocketAddr) -> Result<(), Error> {
        match self.queues.get_mut(&qd) {
            Some(Queue::Net(nq)) => match &mut nq.state {
                NetState::Unbound { addr: slot } => {
                    *slot = Some(addr);
                    Ok(())
                }
                _ => Err(Error::Unsupported(qd)),
            },
            Some(Queue::Shared(_)) => Err(Error::Unsupported(qd)),
            None => Err(Error::BadQueue(qd)),
        }
    }

    /// Start listening on a bound network queue.
    pub fn listen(&mut self, qd: QDesc, backlog: i32) -> Result<(), Error> {
        let nq = match self.queues.get_mut(&qd) {
            Some(Queue::Net(nq)) => nq,
            Some(Queue::Shared(_)) => return Err(Error::Unsupported(qd)),
            None => return Err(Error::BadQueue(qd)),
        };
        let addr = match &nq.state {
            NetState::Unbound { addr: Some(addr) } => *addr,
            NetState::Unbound { addr: None } => return Err(Error::NotBound(qd)),
            _ => return Err(Error::Unsupported(qd)),
        };
        let listener = create_listener(addr, backlog)?;
        debug!(%qd, %addr, "listening");
        nq.state = NetState::Listening(listener);
        Ok(())
    }

    /// The address a listening or connected queue is actually using.
    pub fn local_addr(&self, qd: QDesc) -> Result<SocketAddr, Error> {
        match self.queues.get(&qd) {
            Some(Queue::Net(nq)) => match &nq.state {
                NetState::Listening(listener) => Ok(listener.local_addr()?),
                NetState::Connected(stream) => Ok(stream.local_addr()?),
                NetState::Unbound { .. } => Err(Error::NotBound(qd)),
            },
            Some(Queue::Shared(_)) => Err(Error::Unsupported(qd)),
            None => Err(Error::BadQueue(qd)),
        }
    }

    /// Install one end of a peer channel: `tx` carries messages toward the
    /// peer, `rx` delivers messages from it.
    pub fn shared_queue(&mut self, tx: Sender<M>, rx: Receiver<M>) -> QDesc {
        let qd = self.alloc_qd();
        self.queues.insert(qd, Queue::Shared(SharedQueue { tx, rx }));
        qd
    }

    /// Drop a queue. Parked outbound writes are orphaned; their tokens
    /// resolve as aborted.
    pub fn close(&mut self, qd: QDesc) -> Result<(), Error> {
        match self.queues.remove(&qd) {
            Some(Queue::Net(nq)) => {
                for write in nq.outq {
                    self.done.insert(write.token, Done::Aborted(qd));
                }
                Ok(())
            }
            Some(Queue::Shared(_)) => Ok(()),
            None => Err(Error::BadQueue(qd)),
        }
    }

    // ── Tokenized operations ────────────────────────────────────────

    /// Arm an accept on a listening queue.
    pub fn accept(&mut self, qd: QDesc) -> Result<QToken, Error> {
        match self.queues.get(&qd) {
            Some(Queue::Net(nq)) if matches!(nq.state, NetState::Listening(_)) => {
                let token = self.alloc_token();
                self.pending.insert(token, Pending::Accept { qd });
                Ok(token)
            }
            Some(_) => Err(Error::Unsupported(qd)),
            None => Err(Error::BadQueue(qd)),
        }
    }

    /// Arm a pop on a connected network queue or a shared queue.
    pub fn pop(&mut self, qd: QDesc) -> Result<QToken, Error> {
        let pending = match self.queues.get(&qd) {
            Some(Queue::Net(nq)) => match nq.state {
                NetState::Connected(_) => Pending::NetPop { qd },
                _ => return Err(Error::Unsupported(qd)),
            },
            Some(Queue::Shared(_)) => Pending::SharedPop { qd },
            None => return Err(Error::BadQueue(qd)),
        };
        let token = self.alloc_token();
        self.pending.insert(token, pending);
        Ok(token)
    }

    /// Arm a push of `sga` on a connected network queue. The buffers stay
    /// owned by the queue until the push completes, then drop.
    pub fn push(&mut self, qd: QDesc, sga: Sga) -> Result<QToken, Error> {
        let token = self.alloc_token();
        match self.queues.get_mut(&qd) {
            Some(Queue::Net(nq)) if matches!(nq.state, NetState::Connected(_)) => {
                nq.enqueue_write(token, sga);
                self.pending.insert(token, Pending::NetPush { qd });
                Ok(token)
            }
            Some(_) => Err(Error::Unsupported(qd)),
            None => Err(Error::BadQueue(qd)),
        }
    }

    /// Arm a push of an owned message on a shared queue. Completes when
    /// the single slot accepts the message.
    pub fn push_msg(&mut self, qd: QDesc, msg: M) -> Result<QToken, Error> {
        match self.queues.get(&qd) {
            Some(Queue::Shared(_)) => {
                let token = self.alloc_token();
                self.pending.insert(token, Pending::SharedPush { qd, msg });
                Ok(token)
            }
            Some(Queue::Net(_)) => Err(Error::Unsupported(qd)),
            None => Err(Error::BadQueue(qd)),
        }
    }

    // ── Waiting ─────────────────────────────────────────────────────

    /// Block until `token` completes.
    ///
    /// An aborted connection surfaces as [`Error::ConnAborted`].
    pub fn wait(&mut self, token: QToken) -> Result<QResult<M>, Error> {
        loop {
            match self.poll(token)? {
                Polled::Ready(result) => return Ok(result),
                Polled::Aborted(qd) => return Err(Error::ConnAborted(qd)),
                Polled::NotReady => std::thread::yield_now(),
            }
        }
    }

    /// One completion attempt for `token`. `Ok(None)` means not ready.
    pub fn wait_try(&mut self, token: QToken) -> Result<Option<QResult<M>>, Error> {
        match self.poll(token)? {
            Polled::Ready(result) => Ok(Some(result)),
            Polled::Aborted(qd) => Err(Error::ConnAborted(qd)),
            Polled::NotReady => Ok(None),
        }
    }

    /// One fair pass over `tokens`.
    ///
    /// The scan starts at `*start_offset` and proceeds circularly, so
    /// completions are reported in scan order, not completion order. When
    /// an entry at position `i` is consumed, `*start_offset` is left at
    /// `i`; after the caller removes that entry the next scan begins with
    /// the token that followed it. A pass that finds nothing returns
    /// [`WaitAny::NotReady`] and leaves the offset unchanged.
    pub fn wait_any(
        &mut self,
        tokens: &[QToken],
        start_offset: &mut usize,
    ) -> Result<WaitAny<M>, Error> {
        let n = tokens.len();
        if n == 0 {
            return Ok(WaitAny::NotReady);
        }
        let start = *start_offset % n;
        for step in 0..n {
            let pos = (start + step) % n;
            match self.poll(tokens[pos])? {
                Polled::NotReady => continue,
                Polled::Ready(result) => {
                    *start_offset = pos;
                    return Ok(WaitAny::Ready { idx: pos, result });
                }
                Polled::Aborted(qd) => {
                    *start_offset = pos;
                    return Ok(WaitAny::Aborted { idx: pos, qd });
                }
            }
        }
        Ok(WaitAny::NotReady)
    }

    // ── Completion machinery ────────────────────────────────────────

    fn poll(&mut self, token: QToken) -> Result<Polled<M>, Error> {
        if let Some(done) = self.done.remove(&token) {
            return Ok(match done {
                Done::Pushed(qd) => Polled::Ready(QResult {
                    qd,
                    op: OpResult::Push,
                }),
                Done::Aborted(qd) => Polled::Aborted(qd),
            });
        }
        let pending = self
            .pending
            .remove(&token)
            .ok_or(Error::BadToken(token))?;
        match pending {
            Pending::Accept { qd } => self.poll_accept(token, qd),
            Pending::NetPop { qd } => self.poll_net_pop(token, qd),
            Pending::NetPush { qd } => self.poll_net_push(token, qd),
            Pending::SharedPop { qd } => self.poll_shared_pop(token, qd),
            Pending::SharedPush { qd, msg } => self.poll_shared_push(token, qd, msg),
        }
    }

    fn poll_accept(&mut self, token: QToken, qd: QDesc) -> Result<Polled<M>, Error> {
        let Some(Queue::Net(nq)) = self.queues.get(&qd) else {
            return Ok(Polled::Aborted(qd));
        };
        let NetState::Listening(listener) = &nq.state else {
            return Err(Error::Unsupported(qd));
        };
        match listener.accept() {
            Ok((stream, _peer)) => {
                stream.set_nonblocking(true)?;
                // Best effort; a failed NODELAY only costs latency.
                let _ = stream.set_nodelay(true);
                let new_qd = self.alloc_qd();
                self.queues.insert(
                    new_qd,
                    Queue::Net(NetQueue {
                        state: NetState::Connected(stream),
                        outq: Default::default(),
                    }),
                );
                Ok(Polled::Ready(QResult {
                    qd,
                    op: OpResult::Accept(new_qd),
                }))
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::Interrupted =>
            {
                self.pending.insert(token, Pending::Accept { qd });
                Ok(Polled::NotReady)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn poll_net_pop(&mut self, token: QToken, qd: QDesc) -> Result<Polled<M>, Error> {
        let Some(Queue::Net(nq)) = self.queues.get_mut(&qd) else {
            return Ok(Polled::Aborted(qd));
        };
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        match nq.try_read(&mut buf) {
            Ok(Some(0)) => {
                self.abort_net_queue(qd);
                Ok(Polled::Aborted(qd))
            }
            Ok(Some(n)) => {
                buf.truncate(n);
                Ok(Polled::Ready(QResult {
                    qd,
                    op: OpResult::Pop(Popped::Bytes(Sga::single(buf))),
                }))
            }
            Ok(None) => {
                self.pending.insert(token, Pending::NetPop { qd });
                Ok(Polled::NotReady)
            }
            Err(e) if crate::queue::is_peer_gone(&e) => {
                self.abort_net_queue(qd);
                Ok(Polled::Aborted(qd))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn poll_net_push(&mut self, token: QToken, qd: QDesc) -> Result<Polled<M>, Error> {
        let Some(Queue::Net(nq)) = self.queues.get_mut(&qd) else {
            return Ok(Polled::Aborted(qd));
        };
        match nq.flush()? {
            FlushOutcome::Progress { completed } => {
                for t in completed {
                    self.done.insert(t, Done::Pushed(qd));
                }
            }
            FlushOutcome::Aborted {
                completed,
                orphaned,
            } => {
                for t in completed {
                    self.done.insert(t, Done::Pushed(qd));
                }
                for t in orphaned {
                    self.done.insert(t, Done::Aborted(qd));
                }
                self.queues.remove(&qd);
            }
        }
        match self.done.remove(&token) {
            Some(Done::Pushed(qd)) => Ok(Polled::Ready(QResult {
                qd,
                op: OpResult::Push,
            })),
            Some(Done::Aborted(qd)) => Ok(Polled::Aborted(qd)),
            None => {
                self.pending.insert(token, Pending::NetPush { qd });
                Ok(Polled::NotReady)
            }
        }
    }

    fn poll_shared_pop(&mut self, token: QToken, qd: QDesc) -> Result<Polled<M>, Error> {
        let Some(Queue::Shared(sq)) = self.queues.get(&qd) else {
            return Err(Error::BadQueue(qd));
        };
        match sq.rx.try_recv() {
            Ok(msg) => Ok(Polled::Ready(QResult {
                qd,
                op: OpResult::Pop(Popped::Message(msg)),
            })),
            Err(TryRecvError::Empty) => {
                self.pending.insert(token, Pending::SharedPop { qd });
                Ok(Polled::NotReady)
            }
            Err(TryRecvError::Disconnected) => Err(Error::ChannelClosed(qd)),
        }
    }

    fn poll_shared_push(&mut self, token: QToken, qd: QDesc, msg: M) -> Result<Polled<M>, Error> {
        let Some(Queue::Shared(sq)) = self.queues.get(&qd) else {
            return Err(Error::BadQueue(qd));
        };
        match sq.tx.try_send(msg) {
            Ok(()) => Ok(Polled::Ready(QResult {
                qd,
                op: OpResult::Push,
            })),
            Err(TrySendError::Full(msg)) => {
                self.pending.insert(token, Pending::SharedPush { qd, msg });
                Ok(Polled::NotReady)
            }
            Err(TrySendError::Disconnected(_)) => Err(Error::ChannelClosed(qd)),
        }
    }

    /// Tear down a network queue whose peer is gone. Parked writes will
    /// never complete; mark their tokens aborted so later polls see it.
    fn abort_net_queue(&mut self, qd: QDesc) {
        debug!(%qd, "network queue aborted");
        if let Some(Queue::Net(nq)) = self.queues.remove(&qd) {
            for write in nq.outq {
                self.done.insert(write.token, Done::Aborted(qd));
            }
        }
    }
}

//! Queue internals: TCP-backed network queues and single-slot shared queues.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::FromRawFd;

use crossbeam_channel::{Receiver, Sender};

use crate::error::Error;
use crate::service::QToken;
use crate::sga::Sga;

/// One queue in a [`ServiceUnit`](crate::ServiceUnit) table.
pub(crate) enum Queue<M> {
    Net(NetQueue),
    Shared(SharedQueue<M>),
}

/// A TCP endpoint: unbound, listening, or an accepted/connected stream.
pub(crate) struct NetQueue {
    pub(crate) state: NetState,
    /// Outbound pushes drain strictly head-of-line so concurrent pushes on
    /// one queue never interleave their bytes.
    pub(crate) outq: VecDeque<PendingWrite>,
}

pub(crate) enum NetState {
    Unbound { addr: Option<SocketAddr> },
    Listening(TcpListener),
    Connected(TcpStream),
}

pub(crate) struct PendingWrite {
    pub(crate) token: QToken,
    pub(crate) sga: Sga,
    /// Segment currently being written.
    pub(crate) seg: usize,
    /// Byte offset within that segment.
    pub(crate) off: usize,
}

/// Outcome of draining one network queue's outbound writes.
pub(crate) enum FlushOutcome {
    /// Wrote as much as the socket allowed; tokens in `completed` finished.
    Progress { completed: Vec<QToken> },
    /// The peer is gone. Tokens in `completed` finished before the peer
    /// vanished; tokens in `orphaned` never will.
    Aborted {
        completed: Vec<QToken>,
        orphaned: Vec<QToken>,
    },
}

/// How far one head-of-line write got.
enum Advance {
    Done,
    Blocked,
    PeerGone,
}

impl NetQueue {
    pub(crate) fn unbound() -> Self {
        Self {
            state: NetState::Unbound { addr: None },
            outq: VecDeque::new(),
        }
    }

    pub(crate) fn stream(&mut self) -> Result<&mut TcpStream, io::Error> {
        match &mut self.state {
            NetState::Connected(stream) => Ok(stream),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "queue is not a connected stream",
            )),
        }
    }

    /// Park an outbound `Sga` behind any writes already in flight.
    pub(crate) fn enqueue_write(&mut self, token: QToken, sga: Sga) {
        self.outq.push_back(PendingWrite {
            token,
            sga,
            seg: 0,
            off: 0,
        });
    }

    /// Drain parked writes head-of-line until the socket would block.
    pub(crate) fn flush(&mut self) -> Result<FlushOutcome, Error> {
        let mut completed = Vec::new();
        loop {
            let step = {
                let Some(front) = self.outq.front_mut() else {
                    break;
                };
                let NetState::Connected(stream) = &mut self.state else {
                    break;
                };
                advance_write(front, stream)?
            };
            match step {
                Advance::Done => {
                    if let Some(done) = self.outq.pop_front() {
                        completed.push(done.token);
                    }
                }
                Advance::Blocked => break,
                Advance::PeerGone => {
                    let orphaned = self.outq.drain(..).map(|w| w.token).collect();
                    return Ok(FlushOutcome::Aborted {
                        completed,
                        orphaned,
                    });
                }
            }
        }
        Ok(FlushOutcome::Progress { completed })
    }

    /// One nonblocking read. `Ok(None)` means the socket would block.
    pub(crate) fn try_read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, io::Error> {
        let stream = self.stream()?;
        loop {
            match stream.read(buf) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Write the head-of-line entry until it completes or the socket blocks.
fn advance_write(front: &mut PendingWrite, stream: &mut TcpStream) -> Result<Advance, Error> {
    while front.seg < front.sga.nsegs() {
        let seg = front.sga.seg(front.seg);
        if front.off == seg.len() {
            front.seg += 1;
            front.off = 0;
            continue;
        }
        match stream.write(&seg[front.off..]) {
            Ok(0) => return Ok(Advance::PeerGone),
            Ok(n) => front.off += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Advance::Blocked),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_peer_gone(&e) => return Ok(Advance::PeerGone),
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(Advance::Done)
}

/// One end of a peer channel: a single-slot sender toward the peer and a
/// single-slot receiver from it. Strictly SPSC per direction.
pub(crate) struct SharedQueue<M> {
    pub(crate) tx: Sender<M>,
    pub(crate) rx: Receiver<M>,
}

pub(crate) fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Create a listening socket with SO_REUSEADDR, an explicit backlog, and
/// O_NONBLOCK, and hand it to the standard library.
pub(crate) fn create_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);

    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Io(err));
    }

    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Io(err));
    }

    // The fd is nonblocking; accept() surfaces WouldBlock to the poller.
    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

fn socket_addr_to_sockaddr(addr: SocketAddr, storage: &mut libc::sockaddr_storage) -> u32 {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as u32
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as u32
        }
    }
}

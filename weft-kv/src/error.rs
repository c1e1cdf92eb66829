use std::io;

use thiserror::Error;

use crate::worker::WorkerId;

/// Server-level failures. Verb-level failures live in
/// [`KvError`](crate::store::KvError) and are replied to clients instead
/// of terminating anything.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Queue fabric operation failed.
    #[error("fabric: {0}")]
    Fabric(#[from] weft::Error),
    /// Socket, file, or thread operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A worker asked for a peer it was never wired to.
    #[error("worker {0} has no channel to peer {1}")]
    MissingPeer(WorkerId, WorkerId),
    /// Two workers were wired twice.
    #[error("workers {0} and {1} are already wired")]
    DuplicatePeer(WorkerId, WorkerId),
    /// The worker thread came up without ever reporting started.
    #[error("worker {0} failed to start")]
    LaunchFailed(WorkerId),
    /// The worker thread panicked.
    #[error("worker {0} panicked")]
    Panicked(WorkerId),
    /// An envelope of the wrong flavor crossed a channel.
    #[error("unexpected envelope: {0}")]
    UnexpectedEnvelope(&'static str),
    /// A completion arrived that the worker never arms.
    #[error("unexpected completion: {0}")]
    UnexpectedCompletion(&'static str),
}

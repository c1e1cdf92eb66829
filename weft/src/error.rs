use std::io;

use thiserror::Error;

use crate::service::{QDesc, QToken};

/// Errors returned by the queue fabric.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying socket operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The descriptor does not name a live queue.
    #[error("unknown queue descriptor {0}")]
    BadQueue(QDesc),
    /// The token does not name an outstanding operation.
    #[error("unknown token {0}")]
    BadToken(QToken),
    /// The operation is not valid for this queue flavor or state.
    #[error("operation not supported on queue {0}")]
    Unsupported(QDesc),
    /// The queue has no bind address yet.
    #[error("queue {0} is not bound to an address")]
    NotBound(QDesc),
    /// The remote end of a network queue is gone.
    #[error("connection aborted on queue {0}")]
    ConnAborted(QDesc),
    /// The far end of a shared queue was dropped.
    #[error("peer channel closed on queue {0}")]
    ChannelClosed(QDesc),
    /// No segment slots left in a scatter/gather array.
    #[error("scatter/gather array is full")]
    SgaFull,
}

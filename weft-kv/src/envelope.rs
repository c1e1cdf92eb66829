//! Move-only carriers shuttled across peer channels.
//!
//! An [`Envelope`] owns the buffer it conveys, so handing one to a
//! channel push transfers the buffer to the receiving worker and the
//! last holder frees it by dropping it. There is no shared state and
//! no release flag; exactly-once free holds by construction.

use bytes::Bytes;
use weft::{QDesc, Sga};

/// The unit of work crossing a peer channel.
#[derive(Debug)]
pub enum Envelope {
    /// A client request traveling dispatcher → store worker. `payload`
    /// still owns the raw bytes popped from the client socket.
    Request {
        /// The client connection the eventual reply belongs to.
        conn: QDesc,
        payload: Sga,
    },
    /// A reply traveling store worker → dispatcher. `data` owns the
    /// reply bytes until the dispatcher moves them into an outbound push.
    Response { conn: QDesc, data: Bytes },
}

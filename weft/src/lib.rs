//! weft — tokenized I/O queue fabric for thread-pinned workers.
//!
//! weft gives each worker thread one [`ServiceUnit`]: a table of queues
//! addressed by integer descriptors ([`QDesc`]), where a queue is either a
//! TCP endpoint or one end of a pair of single-slot shared queues wiring
//! two workers together. Every operation (`accept`, `pop`, `push`) returns
//! immediately with a [`QToken`]; the caller resolves tokens with
//! [`ServiceUnit::wait`] (blocking), [`ServiceUnit::wait_try`] (one pass),
//! or [`ServiceUnit::wait_any`] (fair circular scan over a token set).
//!
//! # Quick Start
//!
//! ```no_run
//! use weft::{ServiceUnit, Sga, WaitAny};
//!
//! fn main() -> Result<(), weft::Error> {
//!     let mut unit: ServiceUnit<()> = ServiceUnit::new();
//!     let lqd = unit.socket();
//!     unit.bind(lqd, "127.0.0.1:7878".parse().unwrap())?;
//!     unit.listen(lqd, 100)?;
//!
//!     let mut tokens = vec![unit.accept(lqd)?];
//!     let mut start = 0;
//!     loop {
//!         match unit.wait_any(&tokens, &mut start)? {
//!             WaitAny::Ready { idx, result } => {
//!                 tokens.remove(idx);
//!                 match result.op {
//!                     weft::OpResult::Accept(qd) => {
//!                         tokens.push(unit.pop(qd)?);
//!                         tokens.push(unit.accept(lqd)?);
//!                     }
//!                     weft::OpResult::Pop(weft::Popped::Bytes(sga)) => {
//!                         tokens.push(unit.push(result.qd, sga)?); // echo
//!                         tokens.push(unit.pop(result.qd)?);
//!                     }
//!                     _ => {}
//!                 }
//!             }
//!             WaitAny::Aborted { idx, .. } => {
//!                 tokens.remove(idx);
//!             }
//!             WaitAny::NotReady => std::thread::yield_now(),
//!         }
//!     }
//! }
//! ```
//!
//! Shared queues carry an application-chosen message type `M` by value;
//! moving a message through a queue moves ownership to the receiving
//! worker. Network queues carry [`Sga`] scatter/gather buffers.

pub(crate) mod queue;

pub mod error;
pub mod service;
pub mod sga;

/// Fabric errors.
pub use error::Error;
/// Result of a completed operation.
pub use service::OpResult;
/// Payload of a completed pop.
pub use service::Popped;
/// Queue descriptor: handle to one queue in a [`ServiceUnit`].
pub use service::QDesc;
/// Completed operation together with its originating queue.
pub use service::QResult;
/// Token for one outstanding operation.
pub use service::QToken;
/// Per-worker queue table and readiness primitive.
pub use service::ServiceUnit;
/// Outcome of one [`ServiceUnit::wait_any`] pass.
pub use service::WaitAny;
/// Scatter/gather array of owned byte segments.
pub use sga::Sga;
/// Maximum number of segments in one [`Sga`].
pub use sga::SGA_MAX_SEGS;

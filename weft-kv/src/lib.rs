//! weft-kv — sharded in-memory key/value serving over the weft fabric.
//!
//! One dispatcher thread owns the listening socket and multiplexes every
//! client connection together with N store-worker channels under a single
//! readiness scan. Each request is routed to exactly one store worker
//! (round-robin or keyed on the first key digit), evaluated against a
//! shared in-memory map, and answered on the originating connection.
//!
//! ```text
//! client ─TCP─▶ dispatcher ─chan[w]─▶ store worker w ─chan─▶ dispatcher ─TCP─▶ client
//! ```
//!
//! Workers run on dedicated, optionally core-pinned threads wired by
//! pairs of single-slot channels; the [`Envelope`] moving across a
//! channel owns its payload buffer, so each buffer is freed exactly once
//! by whichever side holds it last.

pub mod config;
pub mod envelope;
pub mod error;
pub mod latency;
pub mod metrics;
pub mod net_worker;
pub mod store;
pub mod store_worker;
pub mod supervisor;
pub mod worker;

/// Server configuration.
pub use config::{PinConfig, ServerConfig};
/// Move-only carrier crossing peer channels.
pub use envelope::Envelope;
/// Server-level failures.
pub use error::ServerError;
/// Request latency capture.
pub use latency::LatencyLog;
/// The dispatcher.
pub use net_worker::{NetWorker, Policy};
/// The KV engine.
pub use store::{KvError, KvStore};
/// Store workers.
pub use store_worker::StoreWorker;
/// Launch + supervision entry points.
pub use supervisor::{Server, StopHandle, install_signal_handlers};
/// Worker lifecycle plumbing.
pub use worker::{NET_WORKER_ID, Worker, WorkerCore, WorkerCtl, WorkerHandle, WorkerId};

//! Server runtime metrics.
//!
//! In-process counters for the connection and request lifecycle. There is
//! no exposition endpoint; these exist for tests and ad-hoc inspection.

use metriken::{Counter, metric};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "weftkv/connections/accepted",
    description = "Total client connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "weftkv/connections/aborted",
    description = "Client connections that vanished mid-stream"
)]
pub static CONNECTIONS_ABORTED: Counter = Counter::new();

// ── Request lifecycle ────────────────────────────────────────────

#[metric(
    name = "weftkv/requests/dispatched",
    description = "Requests routed to a store worker"
)]
pub static REQUESTS_DISPATCHED: Counter = Counter::new();

#[metric(
    name = "weftkv/responses/sent",
    description = "Responses fully written back to clients"
)]
pub static RESPONSES_SENT: Counter = Counter::new();

#[metric(
    name = "weftkv/store/requests",
    description = "Requests evaluated against the KV map"
)]
pub static STORE_REQUESTS: Counter = Counter::new();

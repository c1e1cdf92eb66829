//! Server configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::net_worker::Policy;

/// Core pinning layout. The dispatcher takes `core_offset`; store worker
/// `i` takes `core_offset + i`.
#[derive(Debug, Clone)]
pub struct PinConfig {
    /// Whether to pin worker threads at all. Tests and small machines
    /// turn this off.
    pub enabled: bool,
    pub core_offset: usize,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            core_offset: 4,
        }
    }
}

/// Everything the supervisor needs to build and launch the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the dispatcher binds.
    pub bind: SocketAddr,
    /// Optional bootstrap command file; loading it flips the store to
    /// read-only service.
    pub cmd_file: Option<PathBuf>,
    /// Number of store workers.
    pub workers: usize,
    /// Dispatch policy for new requests.
    pub policy: Policy,
    /// Where to write the latency TSV, when recording is on.
    pub latency_log: Option<PathBuf>,
    pub pinning: PinConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 12345)),
            cmd_file: None,
            workers: 1,
            policy: Policy::RoundRobin,
            latency_log: None,
            pinning: PinConfig::default(),
        }
    }
}

//! Request latency capture and TSV dump.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

/// Samples are pre-reserved so steady-state recording never reallocates.
const RESERVED_SAMPLES: usize = 10_000_000;

/// Entry/exit timestamps for every request the dispatcher completes.
///
/// `record_entry` fires when a client request is popped, `record_exit`
/// when its reply push completes; rows pair up in dispatch order.
pub struct LatencyLog {
    entries: Vec<Instant>,
    exits: Vec<Instant>,
}

impl LatencyLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(RESERVED_SAMPLES),
            exits: Vec::with_capacity(RESERVED_SAMPLES),
        }
    }

    pub fn record_entry(&mut self, at: Instant) {
        self.entries.push(at);
    }

    pub fn record_exit(&mut self, at: Instant) {
        self.exits.push(at);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the samples as TSV: a `entry\texit` header, then one row per
    /// completed request with both timestamps in nanoseconds since the
    /// first recorded entry.
    pub fn dump(&self, path: &Path) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "entry\texit")?;
        if let Some(first) = self.entries.first().copied() {
            for (entry, exit) in self.entries.iter().zip(&self.exits) {
                writeln!(out, "{}\t{}", ns_since(first, *entry), ns_since(first, *exit))?;
            }
        }
        out.flush()
    }
}

impl Default for LatencyLog {
    fn default() -> Self {
        Self::new()
    }
}

fn ns_since(first: Instant, at: Instant) -> u128 {
    at.duration_since(first).as_nanos()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn dump_format() {
        let mut log = LatencyLog {
            entries: Vec::new(),
            exits: Vec::new(),
        };
        let t0 = Instant::now();
        log.record_entry(t0);
        log.record_exit(t0 + Duration::from_nanos(1500));
        log.record_entry(t0 + Duration::from_nanos(2000));
        log.record_exit(t0 + Duration::from_nanos(4000));

        let path = std::env::temp_dir().join(format!("weftkv-lat-{}", std::process::id()));
        log.dump(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "entry\texit");
        assert_eq!(lines[1], "0\t1500");
        assert_eq!(lines[2], "2000\t4000");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn dump_empty_log_writes_header_only() {
        let log = LatencyLog {
            entries: Vec::new(),
            exits: Vec::new(),
        };
        let path = std::env::temp_dir().join(format!("weftkv-lat-empty-{}", std::process::id()));
        log.dump(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(content, "entry\texit\n");
        assert!(log.is_empty());
    }
}

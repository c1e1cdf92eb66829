//! The KV engine: an in-memory map evaluated against the four-verb
//! line grammar.
//!
//! Requests and replies are raw bytes; keys and values are never
//! required to be UTF-8. Verbs are matched by case-sensitive prefix:
//!
//! | verb | syntax | reply |
//! |------|--------|-------|
//! | PUT  | `PUT <key> <value>` | `SUCCESS` |
//! | GET  | `GET <key>` | the stored value |
//! | SZOF | `SZOF <key>` | decimal value length up to the first NUL |
//! | NNZ  | `NNZ <key>` | decimal count of bytes not equal to `'0'` |
//!
//! Errors come back as `ERR: ...` strings; see [`KvError`].

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::warn;

const PUT_STR: &[u8] = b"PUT ";
const GET_STR: &[u8] = b"GET ";
const SZOF_STR: &[u8] = b"SZOF ";
const NNZ_STR: &[u8] = b"NNZ ";

/// Verb-level failures, rendered to clients as `ERR: ...` replies.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("ERR: Not writeable")]
    NotWriteable,
    #[error("ERR: Not readable")]
    NotReadable,
    /// PUT without a space after the key.
    #[error("ERR: No key")]
    NoKey,
    /// Read verb whose key contains an inner space.
    #[error("ERR: Key contains space")]
    KeyContainsSpace,
    /// Unknown key, echoed back (GET).
    #[error("ERR: Bad key {}", String::from_utf8_lossy(.0))]
    BadKey(Vec<u8>),
    /// Unknown key without the echo (SZOF, NNZ).
    #[error("ERR: Bad key")]
    UnknownKey,
    #[error("ERR: Unknown reqtype")]
    UnknownReqType,
}

impl KvError {
    /// The exact wire reply for this error. Key echoes are byte precise
    /// even when the key is not UTF-8.
    pub fn into_reply(self) -> Vec<u8> {
        match self {
            KvError::BadKey(key) => {
                let mut reply = b"ERR: Bad key ".to_vec();
                reply.extend_from_slice(&key);
                reply
            }
            other => other.to_string().into_bytes(),
        }
    }
}

/// In-memory key/value map with read/write gating.
///
/// Loading a bootstrap file flips the store to read-only service, so
/// steady-state reads share the lock without contention. Without a
/// bootstrap file the store stays writeable (and readable).
pub struct KvStore {
    writeable: bool,
    readable: bool,
    map: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl KvStore {
    /// Build the store, optionally replaying a bootstrap command file.
    /// Lines that fail to evaluate are logged and skipped. Replay runs
    /// with reads disabled, so only writes take effect.
    pub fn new(cmd_file: Option<&Path>) -> Self {
        let mut store = Self {
            writeable: true,
            readable: false,
            map: RwLock::new(HashMap::new()),
        };
        let file = cmd_file.and_then(|path| match File::open(path) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not open bootstrap file");
                None
            }
        });
        match file {
            Some(f) => {
                for line in BufReader::new(f).split(b'\n') {
                    let Ok(line) = line else { break };
                    if let Err(e) = store.evaluate(&line) {
                        warn!(
                            line = %String::from_utf8_lossy(&line),
                            error = %e,
                            "could not process bootstrap line"
                        );
                    }
                }
                store.writeable = false;
                store.readable = true;
            }
            None => {
                warn!("no bootstrap file loaded; kv store stays writeable");
                store.writeable = true;
                store.readable = true;
            }
        }
        store
    }

    /// True while the store accepts PUTs.
    pub fn writeable(&self) -> bool {
        self.writeable
    }

    /// True while the store serves read verbs.
    pub fn readable(&self) -> bool {
        self.readable
    }

    /// Evaluate one request, returning the reply bytes. Verb failures
    /// come back as `Err` so callers can log them; the wire reply for a
    /// failure is [`KvError::into_reply`].
    pub fn evaluate(&self, req: &[u8]) -> Result<Vec<u8>, KvError> {
        if req.starts_with(PUT_STR) {
            self.process_put(req)
        } else if req.starts_with(GET_STR) {
            self.process_get(req)
        } else if req.starts_with(SZOF_STR) {
            self.process_szof(req)
        } else if req.starts_with(NNZ_STR) {
            self.process_nnz(req)
        } else {
            Err(KvError::UnknownReqType)
        }
    }

    fn process_put(&self, req: &[u8]) -> Result<Vec<u8>, KvError> {
        if !self.writeable {
            return Err(KvError::NotWriteable);
        }
        // The key runs from the end of the verb to the next space, which
        // is searched from one past the first key byte; the value is
        // everything after that space.
        let key_end = find_space(req, PUT_STR.len() + 1).ok_or(KvError::NoKey)?;
        let key = req[PUT_STR.len()..key_end].to_vec();
        let value = req[key_end + 1..].to_vec();
        self.map.write().insert(key, value);
        Ok(b"SUCCESS".to_vec())
    }

    fn process_get(&self, req: &[u8]) -> Result<Vec<u8>, KvError> {
        if !self.readable {
            return Err(KvError::NotReadable);
        }
        if find_space(req, GET_STR.len() + 1).is_some() {
            return Err(KvError::KeyContainsSpace);
        }
        let key = &req[GET_STR.len()..];
        let map = self.map.read();
        let value = map
            .get(key)
            .ok_or_else(|| KvError::BadKey(key.to_vec()))?;
        Ok(value.clone())
    }

    fn process_szof(&self, req: &[u8]) -> Result<Vec<u8>, KvError> {
        if !self.readable {
            return Err(KvError::NotReadable);
        }
        if find_space(req, SZOF_STR.len() + 1).is_some() {
            return Err(KvError::KeyContainsSpace);
        }
        let key = &req[SZOF_STR.len()..];
        let map = self.map.read();
        let value = map.get(key).ok_or(KvError::UnknownKey)?;
        // Length up to the first NUL rather than the stored length, so
        // answering requires walking the value bytes.
        let len = value.iter().position(|&b| b == 0).unwrap_or(value.len());
        Ok(len.to_string().into_bytes())
    }

    fn process_nnz(&self, req: &[u8]) -> Result<Vec<u8>, KvError> {
        if !self.readable {
            return Err(KvError::NotReadable);
        }
        if find_space(req, NNZ_STR.len() + 1).is_some() {
            return Err(KvError::KeyContainsSpace);
        }
        let key = &req[NNZ_STR.len()..];
        let map = self.map.read();
        let value = map.get(key).ok_or(KvError::UnknownKey)?;
        let count = value.iter().filter(|&&b| b != b'0').count();
        Ok(count.to_string().into_bytes())
    }
}

/// First space at or after `from`, if any.
fn find_space(req: &[u8], from: usize) -> Option<usize> {
    req.get(from..)?
        .iter()
        .position(|&b| b == b' ')
        .map(|i| from + i)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn writable_store() -> KvStore {
        KvStore::new(None)
    }

    fn put_get_store(pairs: &[(&[u8], &[u8])]) -> KvStore {
        let store = writable_store();
        for (key, value) in pairs {
            let mut req = b"PUT ".to_vec();
            req.extend_from_slice(key);
            req.push(b' ');
            req.extend_from_slice(value);
            assert_eq!(store.evaluate(&req).unwrap(), b"SUCCESS");
        }
        store
    }

    fn temp_cmd_file(lines: &[u8]) -> std::path::PathBuf {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "weftkv-boot-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        let mut f = File::create(&path).unwrap();
        f.write_all(lines).unwrap();
        path
    }

    #[test]
    fn put_then_get() {
        let store = put_get_store(&[(b"a", b"hello")]);
        assert_eq!(store.evaluate(b"GET a").unwrap(), b"hello");
    }

    #[test]
    fn get_missing_key_echoes_it() {
        let store = writable_store();
        assert_eq!(
            store.evaluate(b"GET missing"),
            Err(KvError::BadKey(b"missing".to_vec()))
        );
        assert_eq!(
            KvError::BadKey(b"missing".to_vec()).into_reply(),
            b"ERR: Bad key missing"
        );
    }

    #[test]
    fn szof_and_nnz_do_not_echo_the_key() {
        let store = writable_store();
        assert_eq!(store.evaluate(b"SZOF nope"), Err(KvError::UnknownKey));
        assert_eq!(store.evaluate(b"NNZ nope"), Err(KvError::UnknownKey));
        assert_eq!(KvError::UnknownKey.into_reply(), b"ERR: Bad key");
    }

    #[test]
    fn nnz_counts_non_zero_bytes() {
        let store = put_get_store(&[(b"k", b"01020")]);
        assert_eq!(store.evaluate(b"NNZ k").unwrap(), b"2");
        assert_eq!(store.evaluate(b"SZOF k").unwrap(), b"5");
    }

    #[test]
    fn szof_stops_at_the_first_nul() {
        let store = put_get_store(&[(b"k", b"a\0bc")]);
        assert_eq!(store.evaluate(b"SZOF k").unwrap(), b"1");
        // The stored value keeps all four bytes.
        assert_eq!(store.evaluate(b"GET k").unwrap(), b"a\0bc");
    }

    #[test]
    fn unknown_verb() {
        let store = writable_store();
        assert_eq!(store.evaluate(b"FOO bar"), Err(KvError::UnknownReqType));
        // Prefix match is case sensitive and requires the trailing space.
        assert_eq!(store.evaluate(b"put a b"), Err(KvError::UnknownReqType));
        assert_eq!(store.evaluate(b"PUT"), Err(KvError::UnknownReqType));
        assert_eq!(store.evaluate(b""), Err(KvError::UnknownReqType));
    }

    #[test]
    fn put_value_is_everything_after_the_second_space() {
        let store = put_get_store(&[(b"k", b"a b c")]);
        assert_eq!(store.evaluate(b"GET k").unwrap(), b"a b c");
    }

    #[test]
    fn put_without_second_space_has_no_key() {
        let store = writable_store();
        assert_eq!(store.evaluate(b"PUT solo"), Err(KvError::NoKey));
        // The space search starts one past the first key byte, so a
        // space at the very start of the key is not found either.
        assert_eq!(store.evaluate(b"PUT  x"), Err(KvError::NoKey));
    }

    #[test]
    fn put_with_trailing_space_stores_empty_value() {
        let store = put_get_store(&[(b"ab", b"")]);
        assert_eq!(store.evaluate(b"GET ab").unwrap(), b"");
        assert_eq!(store.evaluate(b"SZOF ab").unwrap(), b"0");
        assert_eq!(store.evaluate(b"NNZ ab").unwrap(), b"0");
    }

    #[test]
    fn get_with_extra_token_reports_space() {
        let store = put_get_store(&[(b"k", b"v")]);
        assert_eq!(
            store.evaluate(b"GET k extra"),
            Err(KvError::KeyContainsSpace)
        );
        assert_eq!(
            store.evaluate(b"SZOF k extra"),
            Err(KvError::KeyContainsSpace)
        );
        assert_eq!(
            store.evaluate(b"NNZ k extra"),
            Err(KvError::KeyContainsSpace)
        );
    }

    #[test]
    fn last_writer_wins() {
        let store = put_get_store(&[(b"k", b"one"), (b"k", b"two")]);
        assert_eq!(store.evaluate(b"GET k").unwrap(), b"two");
    }

    #[test]
    fn bootstrap_flips_to_read_only() {
        let path = temp_cmd_file(b"PUT a 1\nPUT b 2\n");
        let store = KvStore::new(Some(&path));
        std::fs::remove_file(&path).unwrap();

        assert!(!store.writeable());
        assert!(store.readable());
        assert_eq!(store.evaluate(b"GET a").unwrap(), b"1");
        assert_eq!(store.evaluate(b"GET b").unwrap(), b"2");
        assert_eq!(store.evaluate(b"PUT c 3"), Err(KvError::NotWriteable));
    }

    #[test]
    fn bootstrap_replay_cannot_read() {
        // Reads are disabled during replay; the GET line is skipped.
        let path = temp_cmd_file(b"PUT a 1\nGET a\nPUT b 2\n");
        let store = KvStore::new(Some(&path));
        std::fs::remove_file(&path).unwrap();

        assert_eq!(store.evaluate(b"GET a").unwrap(), b"1");
        assert_eq!(store.evaluate(b"GET b").unwrap(), b"2");
    }

    #[test]
    fn missing_bootstrap_file_stays_writeable() {
        let store = KvStore::new(Some(Path::new("/nonexistent/weftkv-cmds")));
        assert!(store.writeable());
        assert!(store.readable());
        assert_eq!(store.evaluate(b"PUT k v").unwrap(), b"SUCCESS");
        assert_eq!(store.evaluate(b"GET k").unwrap(), b"v");
    }
}

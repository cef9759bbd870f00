//! Snapshot Persistence
//!
//! The tree loads once at startup and is written back by a single
//! background thread. Queries never touch the disk themselves; they set
//! the engine's dirty flag and the persister drains it on a fixed
//! one-second cadence. Snapshots are compact JSON compressed with zlib;
//! the loader also accepts plain JSON so hand-written files work.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::ServerDb;
use crate::error::DbError;
use crate::value::Value;

/// Load a tree snapshot. Decompression is attempted first with a plain
/// UTF-8 JSON fallback; a missing file is an empty tree; anything else
/// is fatal.
pub fn load(path: &Path) -> Result<Value, DbError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Value::root()),
        Err(err) => return Err(DbError::Storage(err.to_string())),
    };

    let text = match decompress(&bytes) {
        Ok(text) => text,
        Err(_) => String::from_utf8(bytes)
            .map_err(|_| DbError::Storage("snapshot is not utf-8".to_string()))?,
    };

    let json: serde_json::Value =
        serde_json::from_str(&text).map_err(|err| DbError::Storage(err.to_string()))?;
    match Value::from_json(json) {
        value @ Value::Map(_) => Ok(value),
        other => Err(DbError::Storage(format!(
            "top-level value must be a mapping, found {}",
            other.type_name()
        ))),
    }
}

/// Serialize a tree for disk: compact JSON, zlib-compressed. If the
/// encoder somehow fails we fall back to the plain JSON bytes, which
/// the loader accepts too.
pub fn encode(root: &Value) -> Vec<u8> {
    let json = root.compact();
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(json.as_bytes()).is_err() {
        return json.into_bytes();
    }
    encoder.finish().unwrap_or_else(|_| json.into_bytes())
}

/// One-shot snapshot write, used by the persister and by shutdown.
pub fn save(path: &Path, root: &Value) -> io::Result<()> {
    fs::write(path, encode(root))
}

fn decompress(bytes: &[u8]) -> io::Result<String> {
    let mut text = String::new();
    ZlibDecoder::new(bytes).read_to_string(&mut text)?;
    Ok(text)
}

const TICK: Duration = Duration::from_millis(250);
const TICKS_PER_FLUSH: u32 = 4;

/// Background writer draining the engine's dirty flag once a second.
/// Stateless servers simply never spawn one.
pub struct Persister {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Persister {
    pub fn spawn(db: Arc<Mutex<ServerDb>>) -> Persister {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::spawn(move || {
            while flag.load(Ordering::Relaxed) {
                // one-second cadence, checked in slices so stop() is prompt
                for _ in 0..TICKS_PER_FLUSH {
                    if !flag.load(Ordering::Relaxed) {
                        break;
                    }
                    thread::sleep(TICK);
                }
                flush_if_dirty(&db);
            }
            // a write queued right before shutdown still lands
            flush_if_dirty(&db);
        });
        Persister {
            running,
            handle: Some(handle),
        }
    }

    /// Clear the running flag and wait for the final flush.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        self.stop();
    }
}

fn flush_if_dirty(db: &Arc<Mutex<ServerDb>>) {
    // serialize under the engine lock, write the file outside it
    let snapshot = {
        let mut db = db.lock();
        if db.db_mut().take_dirty() {
            Some((db.db().path().to_path_buf(), db.db().snapshot()))
        } else {
            None
        }
    };

    if let Some((path, bytes)) = snapshot {
        match fs::write(&path, bytes) {
            Ok(()) => debug!(path = %path.display(), "snapshot written"),
            Err(err) => {
                warn!(path = %path.display(), %err, "snapshot write failed, will retry");
                db.lock().db_mut().mark_dirty();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Db, QueryFlags, ServerDb};

    fn temp_db_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("db.json")
    }

    #[test]
    fn missing_file_loads_as_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load(&temp_db_path(&dir)).unwrap(), Value::root());
    }

    #[test]
    fn compressed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db_path(&dir);
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a":"1","xs":["x","y"]}"#).unwrap();
        let tree = Value::from_json(json);
        save(&path, &tree).unwrap();
        assert_eq!(load(&path).unwrap(), tree);
    }

    #[test]
    fn plain_json_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db_path(&dir);
        fs::write(&path, r#"{"plain":"file"}"#).unwrap();
        let loaded = load(&path).unwrap();
        assert_eq!(
            loaded.as_map().and_then(|m| m.get("plain")),
            Some(&Value::String("file".to_string()))
        );
    }

    #[test]
    fn garbage_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db_path(&dir);
        fs::write(&path, b"\x00\x01 definitely not a snapshot").unwrap();
        assert!(matches!(load(&path), Err(DbError::Storage(_))));
    }

    #[test]
    fn non_mapping_root_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db_path(&dir);
        fs::write(&path, r#"["just","a","list"]"#).unwrap();
        assert!(matches!(load(&path), Err(DbError::Storage(_))));
    }

    #[test]
    fn persister_flushes_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db_path(&dir);
        let db = Arc::new(Mutex::new(ServerDb::from_db(Db::empty(&path))));

        let mut persister = Persister::spawn(db.clone());
        db.lock()
            .query_args(QueryFlags::default(), &["saved", "=", "yes"]);
        persister.stop();

        let reloaded = load(&path).unwrap();
        assert_eq!(
            reloaded.as_map().and_then(|m| m.get("saved")),
            Some(&Value::String("yes".to_string()))
        );
    }
}

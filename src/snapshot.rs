//! Local file-based snapshot cache for aggregate state.
//!
//! Snapshots are stored as JSON files at
//! `<base_dir>/snapshots/<origin>/<aggregate_id>/snapshot.json`.
//! Writes are atomic via a temp-rename pattern to prevent corruption
//! from crashes mid-write. The log stays the source of truth: a missing or
//! unreadable snapshot only means a longer replay.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::aggregate::Aggregate;

/// Aggregate state plus the last stream sequence folded into it.
///
/// Replay resumes after `last_applied_sequence`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "A: Serialize", deserialize = "A: DeserializeOwned"))]
pub struct Snapshot<A> {
    /// The aggregate state at the time of the snapshot.
    pub state: A,
    /// Sequence of the last event applied, `None` if nothing was.
    pub last_applied_sequence: Option<u64>,
}

/// Compute the filesystem path for a snapshot file.
///
/// # Arguments
///
/// * `base_dir` - Root directory for the snapshot cache.
/// * `origin` - The aggregate kind (e.g. `"rabbit"`).
/// * `aggregate_id` - The aggregate instance identifier (e.g. `"r1"`).
///
/// # Returns
///
/// `<base_dir>/snapshots/<origin>/<aggregate_id>/snapshot.json`
pub fn snapshot_path(base_dir: &Path, origin: &str, aggregate_id: &str) -> PathBuf {
    base_dir
        .join("snapshots")
        .join(origin)
        .join(aggregate_id)
        .join("snapshot.json")
}

/// Save an aggregate snapshot atomically to disk.
///
/// Writes to `snapshot.json.tmp` in the same directory, then renames it to
/// `snapshot.json`, so readers never see a partially-written file.
///
/// # Errors
///
/// Returns `io::Error` if directory creation, serialization, file writing,
/// or renaming fails.
pub fn save_snapshot<A: Aggregate + Serialize>(
    base_dir: &Path,
    aggregate_id: &str,
    snapshot: &Snapshot<A>,
) -> io::Result<()> {
    let path = snapshot_path(base_dir, A::ORIGIN, aggregate_id);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(snapshot)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    std::fs::write(&tmp_path, &json)?;
    std::fs::rename(&tmp_path, &path)?;
    tracing::debug!(
        origin = A::ORIGIN,
        aggregate_id,
        sequence = ?snapshot.last_applied_sequence,
        "snapshot saved"
    );
    Ok(())
}

/// Load an aggregate snapshot from disk.
///
/// # Returns
///
/// - `Ok(Some(snapshot))` if the file exists and deserializes successfully.
/// - `Ok(None)` if the file does not exist or contains invalid JSON.
///   Deserialization failures are logged via `tracing::warn!`.
///
/// # Errors
///
/// Returns `io::Error` only for unexpected I/O failures (e.g. permission denied).
pub fn load_snapshot<A: Aggregate + DeserializeOwned>(
    base_dir: &Path,
    aggregate_id: &str,
) -> io::Result<Option<Snapshot<A>>> {
    let path = snapshot_path(base_dir, A::ORIGIN, aggregate_id);
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    match serde_json::from_slice::<Snapshot<A>>(&bytes) {
        Ok(snap) => Ok(Some(snap)),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to deserialize snapshot; treating as cache miss"
            );
            Ok(None)
        }
    }
}

//! File-backed event log.
//!
//! The on-disk layout is a single JSON-lines journal:
//!
//! ```text
//! <dir>/
//!     journal.jsonl    -- one line per commit, each line a JSON array of
//!                         StoredEvent records
//! ```
//!
//! A batch is one line, so a commit is durable exactly when its trailing
//! newline is. On open the journal is replayed into the in-memory index.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::LogError;
use crate::event::{EncodedEvent, EventId, StoredEvent};
use crate::log::{CatchUp, EventLog, Journal, LogBuilder, LogCore, LogIndex, SubscriberFn};

/// Name of the journal file inside the log directory.
pub const JOURNAL_FILE: &str = "journal.jsonl";

/// Append handle to `journal.jsonl`.
struct FileJournal {
    file: File,
    /// Byte length of the journal after the last complete commit.
    len: u64,
    sync: bool,
}

impl Journal for FileJournal {
    fn persist(&mut self, batch: &[StoredEvent]) -> Result<(), LogError> {
        let mut line = serde_json::to_vec(batch)?;
        line.push(b'\n');

        let written = self
            .file
            .write_all(&line)
            .and_then(|()| if self.sync { self.file.sync_data() } else { Ok(()) });
        if let Err(e) = written {
            // Cut off whatever part of the line made it to disk so the next
            // commit does not land after a half-written record.
            if let Err(trunc) = self.file.set_len(self.len) {
                tracing::error!(error = %trunc, "failed to roll back partial journal write");
            }
            return Err(LogError::Io(e));
        }
        self.len += line.len() as u64;
        Ok(())
    }
}

/// Result of scanning an existing journal.
struct Recovered {
    index: LogIndex,
    /// Length of the valid prefix.
    valid_len: u64,
    /// Whether an unterminated final line was found.
    torn: bool,
}

fn recover(bytes: &[u8]) -> Result<Recovered, LogError> {
    let mut index = LogIndex::default();
    let mut offset = 0usize;
    let mut line_no = 0usize;

    while offset < bytes.len() {
        line_no += 1;
        let Some(end) = bytes[offset..].iter().position(|&b| b == b'\n') else {
            // No newline: the process died mid-write. The commit was never
            // acknowledged, so dropping it loses nothing.
            return Ok(Recovered {
                index,
                valid_len: offset as u64,
                torn: true,
            });
        };
        let line = &bytes[offset..offset + end];
        offset += end + 1;

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let batch: Vec<StoredEvent> =
            serde_json::from_slice(line).map_err(|e| LogError::Corrupt {
                line: line_no,
                reason: e.to_string(),
            })?;
        index
            .apply(&batch)
            .map_err(|reason| LogError::Corrupt {
                line: line_no,
                reason,
            })?;
    }

    Ok(Recovered {
        index,
        valid_len: offset as u64,
        torn: false,
    })
}

/// [`EventLog`] persisted to a JSON-lines journal.
///
/// Reads are served from memory; every commit is appended to the journal
/// (and optionally `fsync`ed) before it becomes visible.
///
/// # Examples
///
/// ```no_run
/// use eventpipe_es::{EventLog, FileEventLog};
///
/// let log = FileEventLog::open("/tmp/rabbits")?;
/// log.append("rabbit", "r1", "added", r#"{"name":"Bill"}"#.into())?;
/// # Ok::<(), eventpipe_es::LogError>(())
/// ```
pub struct FileEventLog {
    core: LogCore<FileJournal>,
    path: PathBuf,
}

impl FileEventLog {
    /// Open or create a log in `dir` with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] if the directory or journal cannot be
    /// accessed, and [`LogError::Corrupt`] if a complete journal line is
    /// unreadable.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, LogError> {
        Self::open_with(dir.as_ref(), &LogBuilder::new())
    }

    pub(crate) fn open_with(dir: &Path, builder: &LogBuilder) -> Result<Self, LogError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let recovered = recover(&bytes)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if recovered.torn {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = bytes.len() as u64 - recovered.valid_len,
                "dropping torn final journal line"
            );
            file.set_len(recovered.valid_len)?;
        }
        tracing::debug!(
            path = %path.display(),
            count = recovered.index.len(),
            "event journal opened"
        );

        let journal = FileJournal {
            file,
            len: recovered.valid_len,
            sync: builder.sync_writes,
        };
        Ok(Self {
            core: LogCore::new(recovered.index, journal, builder),
            path,
        })
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total number of committed events across all streams.
    pub fn len(&self) -> usize {
        self.core.len()
    }

    /// Returns `true` if nothing has been committed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for FileEventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileEventLog")
            .field("path", &self.path)
            .field("events", &self.len())
            .finish()
    }
}

impl EventLog for FileEventLog {
    fn read(
        &self,
        origin: &str,
        aggregate_id: &str,
        from_sequence: u64,
    ) -> Result<Vec<StoredEvent>, LogError> {
        Ok(self.core.read(origin, aggregate_id, from_sequence))
    }

    fn append(
        &self,
        origin: &str,
        aggregate_id: &str,
        event_type: &str,
        payload: String,
    ) -> Result<StoredEvent, LogError> {
        let event = EncodedEvent::new(origin, aggregate_id, event_type, payload);
        let mut committed = self.core.commit(None, None, vec![event])?;
        committed.pop().ok_or_else(|| LogError::Corrupt {
            line: 0,
            reason: "single-event commit returned nothing".to_owned(),
        })
    }

    fn append_batch(
        &self,
        cause_id: Option<EventId>,
        corr_id: Option<EventId>,
        events: Vec<EncodedEvent>,
    ) -> Result<usize, LogError> {
        Ok(self.core.commit(cause_id, corr_id, events)?.len())
    }

    fn subscribe_or_catch_up(
        &self,
        origin: &str,
        event_type: &str,
        since: u64,
        callback: SubscriberFn,
    ) -> Result<CatchUp, LogError> {
        Ok(self.core.subscribe_or_catch_up(origin, event_type, since, callback))
    }

    fn unsubscribe(&self, origin: &str, event_type: &str, callback: &SubscriberFn) -> bool {
        self.core.unsubscribe(origin, event_type, callback)
    }

    fn now(&self) -> u64 {
        self.core.now()
    }
}

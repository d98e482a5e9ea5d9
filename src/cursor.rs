//! The sync cursor: which peer this node replicates historical data from,
//! and until when. The in-memory copy is the source of truth while running
//! and is written through on every change; failing to persist an accepted
//! cursor is a data-loss risk on restart and is treated as process-fatal by
//! the caller.

use crate::errdata;
use crate::error::Result;

use std::fs;
use std::io::Write as _;
use std::path::PathBuf;

/// The durable replication cursor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncCursor {
    /// The peer to replicate historical data from. Empty means none.
    pub source_id: String,
    /// Replicate historical writes up to this source-clock time.
    pub until_timestamp: i64,
    /// Whether the historical catch-up has completed.
    pub old_data_sync_done: bool,
    /// The last known trunk file id, kept durable across restarts so a
    /// re-elected allocator never reuses an id.
    pub trunk_file_id: u32,
}

/// Persistence collaborator for the sync cursor.
pub trait CursorStore: Send + Sync {
    fn load(&self) -> Result<SyncCursor>;
    fn persist(&self, cursor: &SyncCursor) -> Result<()>;
}

/// File-backed store writing key=value lines, one per field. A missing file
/// loads as the default cursor (fresh node).
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CursorStore for FileCursorStore {
    fn load(&self) -> Result<SyncCursor> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SyncCursor::default())
            }
            Err(err) => return Err(err.into()),
        };
        let mut cursor = SyncCursor::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return errdata!("malformed cursor line {line:?}");
            };
            match key {
                "source_id" => cursor.source_id = value.to_owned(),
                "until_timestamp" => {
                    cursor.until_timestamp =
                        value.parse().map_err(|_| bad_value(key, value))?
                }
                "old_data_sync_done" => cursor.old_data_sync_done = value == "1",
                "trunk_file_id" => {
                    cursor.trunk_file_id = value.parse().map_err(|_| bad_value(key, value))?
                }
                key => return errdata!("unknown cursor key {key:?}"),
            }
        }
        Ok(cursor)
    }

    fn persist(&self, cursor: &SyncCursor) -> Result<()> {
        // Write to a sibling temp file, then rename over the old one, so a
        // crash mid-write never loses the previous cursor.
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        write!(
            file,
            "source_id={}\nuntil_timestamp={}\nold_data_sync_done={}\ntrunk_file_id={}\n",
            cursor.source_id,
            cursor.until_timestamp,
            cursor.old_data_sync_done as u8,
            cursor.trunk_file_id,
        )?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn bad_value(key: &str, value: &str) -> crate::error::Error {
    crate::error::Error::InvalidData(format!("bad cursor value {value:?} for key {key:?}"))
}

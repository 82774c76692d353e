//! Append-only change journal for file-backed stores.
//!
//! Each commit appends one frame: a little-endian `u32` body length
//! followed by the CBOR-encoded changes of that commit. On open the frames
//! are replayed over the last snapshot. A frame that is cut short or does
//! not decode ends the journal and is truncated away.

use crate::error::{SyncError, SyncResult};
use crate::outbox::OutboxEntry;
use fieldsync_protocol::EntityKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Frame header size: body length (4).
const HEADER_SIZE: usize = 4;

/// One change made by a commit.
///
/// Replaying a change that the snapshot already holds leaves the state as
/// it was, so a crash between writing a snapshot and resetting the journal
/// is harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum Change {
    /// A document was written (`Some`) or removed (`None`).
    Document {
        location_id: String,
        kind: EntityKind,
        id: String,
        document: Option<Value>,
    },
    /// An outbox entry was appended.
    Enqueue(OutboxEntry),
    /// Outbox entries were acknowledged.
    Acknowledge(Vec<u64>),
    /// A tenant's checkpoint moved.
    Checkpoint { location_id: String, at: i64 },
}

/// The open journal file.
pub(crate) struct Journal {
    path: PathBuf,
    file: File,
    len: u64,
}

impl Journal {
    /// Opens or creates the journal at `path` and returns it along with the
    /// frames it holds, oldest first.
    pub(crate) fn open(path: &Path) -> SyncResult<(Self, Vec<Vec<Change>>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut frames = Vec::new();
        let mut offset = 0;
        while let Some(header) = bytes.get(offset..offset + HEADER_SIZE) {
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let start = offset + HEADER_SIZE;
            let Some(body) = bytes.get(start..start + len) else {
                break;
            };
            match ciborium::from_reader::<Vec<Change>, _>(body) {
                Ok(changes) => frames.push(changes),
                Err(_) => break,
            }
            offset = start + len;
        }

        if offset < bytes.len() {
            warn!(
                path = %path.display(),
                dropped = bytes.len() - offset,
                "dropping torn journal tail"
            );
            file.set_len(offset as u64)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::Start(offset as u64))?;

        let journal = Self {
            path: path.to_path_buf(),
            file,
            len: offset as u64,
        };
        Ok((journal, frames))
    }

    /// Bytes of intact frames in the journal.
    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    /// Appends one frame and syncs it. On failure the file is cut back to
    /// its previous length.
    pub(crate) fn append(&mut self, changes: &[Change]) -> SyncResult<()> {
        let mut frame = vec![0; HEADER_SIZE];
        ciborium::into_writer(changes, &mut frame)
            .map_err(|e| SyncError::Storage(format!("{}: {e}", self.path.display())))?;
        let body_len = u32::try_from(frame.len() - HEADER_SIZE).map_err(|_| {
            SyncError::Storage(format!("{}: journal frame too large", self.path.display()))
        })?;
        frame[..HEADER_SIZE].copy_from_slice(&body_len.to_le_bytes());

        let written = self
            .file
            .write_all(&frame)
            .and_then(|()| self.file.sync_data());
        if let Err(err) = written {
            if let Err(cut) = self.truncate_to(self.len) {
                warn!(path = %self.path.display(), error = %cut, "could not cut journal back");
            }
            return Err(err.into());
        }
        self.len += frame.len() as u64;
        Ok(())
    }

    /// Empties the journal once its changes are in a snapshot.
    pub(crate) fn clear(&mut self) -> SyncResult<()> {
        self.truncate_to(0)?;
        self.file.sync_data()?;
        self.len = 0;
        Ok(())
    }

    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.file.set_len(len)?;
        self.file.seek(SeekFrom::Start(len))?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn replace_file(&mut self, file: File) {
        self.file = file;
    }
}

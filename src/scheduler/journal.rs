//! Durable record log behind the job queue.
//!
//! Every queue mutation is written to the journal before it becomes visible
//! in memory. A bulk enqueue is a single record, so a batch is either fully
//! present on replay or not at all.
//!
//! The file format is JSON lines. Only newline-terminated lines count as
//! written; a torn tail left by a crash is discarded and trimmed on open. A
//! record that fails to decode with valid records after it is not a torn
//! tail, and the journal refuses to open rather than drop what follows.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;
use crate::scheduler::job::{Job, JobState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    /// A whole submission, recorded atomically
    Enqueued { jobs: Vec<Job> },
    /// A worker claimed the job for the given attempt
    Claimed { job_id: Uuid, attempt: u32 },
    /// A failed attempt put the job back in line for `attempt`
    Requeued {
        job_id: Uuid,
        attempt: u32,
        error: Option<String>,
    },
    /// The job reached a terminal state
    Finished {
        job_id: Uuid,
        state: JobState,
        exit_code: Option<i32>,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    /// Finished jobs dropped by retention
    Purged { job_ids: Vec<Uuid> },
}

/// Storage backend for queue records.
pub trait Journal: Send {
    /// Durably record one mutation. The queue only applies the mutation in
    /// memory after this returns `Ok`.
    fn append(&mut self, record: &JournalRecord) -> Result<(), QueueError>;
}

/// Journal that keeps nothing. Queue contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryJournal;

impl Journal for MemoryJournal {
    fn append(&mut self, _record: &JournalRecord) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Append-only JSON-lines journal, synced to disk on every append.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: File,
    /// Length of the durable, newline-terminated prefix
    len: u64,
}

impl FileJournal {
    /// Open (or create) the journal and return the records it already holds.
    pub fn open(path: &Path) -> Result<(Self, Vec<JournalRecord>), QueueError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;

        let (records, valid_len) = parse_records(&contents)?;
        if valid_len < contents.len() {
            tracing::warn!(
                path = %path.display(),
                discarded_bytes = contents.len() - valid_len,
                "Discarding incomplete journal tail"
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        tracing::info!(
            path = %path.display(),
            records = records.len(),
            "Opened queue journal"
        );

        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                len: valid_len as u64,
            },
            records,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Journal for FileJournal {
    fn append(&mut self, record: &JournalRecord) -> Result<(), QueueError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let written = self
            .file
            .write_all(&line)
            .and_then(|()| self.file.sync_data());
        if let Err(e) = written {
            // Cut a partial line so later appends start on a clean boundary
            let _ = self.file.set_len(self.len);
            return Err(e.into());
        }

        self.len += line.len() as u64;
        Ok(())
    }
}

/// Parse newline-terminated records. Returns the records and the byte length
/// of the prefix worth keeping.
///
/// Undecodable lines are tolerated only at the end of the file, where a crash
/// mid-append leaves them. One followed by a valid record is an error.
fn parse_records(contents: &[u8]) -> Result<(Vec<JournalRecord>, usize), QueueError> {
    let mut records = Vec::new();
    let mut valid_len = 0;
    let mut offset = 0;
    let mut corrupt: Option<(usize, serde_json::Error)> = None;

    while let Some(newline) = contents[offset..].iter().position(|&b| b == b'\n') {
        let line = &contents[offset..offset + newline];
        let end = offset + newline + 1;
        if !line.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<JournalRecord>(line) {
                Ok(record) => {
                    if let Some((at, e)) = corrupt.take() {
                        return Err(QueueError::CorruptJournal {
                            offset: at,
                            reason: e.to_string(),
                        });
                    }
                    records.push(record);
                }
                Err(e) => {
                    corrupt.get_or_insert((offset, e));
                }
            }
        }
        if corrupt.is_none() {
            valid_len = end;
        }
        offset = end;
    }

    if let Some((at, e)) = corrupt {
        tracing::warn!(offset = at, error = %e, "Undecodable journal tail");
    }
    Ok((records, valid_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enqueued(host: &str) -> JournalRecord {
        JournalRecord::Enqueued {
            jobs: vec![Job::new(
                Uuid::new_v4(),
                host.to_string(),
                "uptime".to_string(),
                3,
            )],
        }
    }

    #[test]
    fn parse_stops_at_torn_tail() {
        let mut bytes = serde_json::to_vec(&enqueued("h1")).unwrap();
        bytes.push(b'\n');
        let good_len = bytes.len();
        bytes.extend_from_slice(br#"{"op":"enqueued","jobs":[{"id""#);

        let (records, valid_len) = parse_records(&bytes).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(valid_len, good_len);
    }

    #[test]
    fn parse_trims_garbage_lines_at_the_end() {
        let mut bytes = serde_json::to_vec(&enqueued("h1")).unwrap();
        bytes.push(b'\n');
        let good_len = bytes.len();
        bytes.extend_from_slice(b"{garbage}\n\n{more\n");

        let (records, valid_len) = parse_records(&bytes).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(valid_len, good_len);
    }

    #[test]
    fn parse_rejects_corrupt_record_before_valid_ones() {
        let mut bytes = serde_json::to_vec(&enqueued("h1")).unwrap();
        bytes.push(b'\n');
        let bad_at = bytes.len();
        bytes.extend_from_slice(b"{garbage}\n");
        bytes.extend_from_slice(&serde_json::to_vec(&enqueued("h2")).unwrap());
        bytes.push(b'\n');

        match parse_records(&bytes) {
            Err(QueueError::CorruptJournal { offset, .. }) => assert_eq!(offset, bad_at),
            other => panic!("expected corrupt journal, got {:?}", other.map(|(r, _)| r.len())),
        }
    }

    #[test]
    fn parse_ignores_unterminated_complete_record() {
        // Without the newline the write is not considered finished
        let bytes = serde_json::to_vec(&enqueued("h1")).unwrap();
        let (records, valid_len) = parse_records(&bytes).unwrap();
        assert!(records.is_empty());
        assert_eq!(valid_len, 0);
    }

    #[test]
    fn record_tagging() {
        let id = Uuid::nil();
        let record = JournalRecord::Claimed {
            job_id: id,
            attempt: 2,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["op"], "claimed");
        assert_eq!(value["attempt"], 2);
    }
}

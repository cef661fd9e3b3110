// src/recovery/journal.rs

//! Append-only per-job journal of graph mutations.
//!
//! Layout: `<journal_dir>/<job_id>/task_journal`. Each record is
//!
//! ```text
//! tag: u8 ('T' task descriptor | 'R' published reference)
//! len: u32, big endian, payload length
//! sum: [u8; 8], first bytes of the blake3 hash of the payload
//! payload: JSON
//! ```
//!
//! The first `T` record is the job's root task. Replaying the records in
//! order through `spawn` / `publish` rebuilds an equivalent graph.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::{Result, TaskweaveError};
use crate::reference::Reference;
use crate::task::{JobId, TaskDescriptor};

pub const JOURNAL_FILE_NAME: &str = "task_journal";

const TAG_TASK: u8 = b'T';
const TAG_REFERENCE: u8 = b'R';
const HEADER_LEN: usize = 1 + 4 + 8;

#[derive(Debug, Clone, PartialEq)]
pub enum JournalRecord {
    Task(TaskDescriptor),
    Reference(Reference),
}

impl JournalRecord {
    fn tag(&self) -> u8 {
        match self {
            JournalRecord::Task(_) => TAG_TASK,
            JournalRecord::Reference(_) => TAG_REFERENCE,
        }
    }

    fn payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            JournalRecord::Task(desc) => serde_json::to_vec(desc)?,
            JournalRecord::Reference(r) => serde_json::to_vec(r)?,
        };
        Ok(bytes)
    }
}

fn checksum(payload: &[u8]) -> [u8; 8] {
    let hash = blake3::hash(payload);
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash.as_bytes()[..8]);
    out
}

/// Encode one record into its framed byte form.
pub fn encode_record(record: &JournalRecord) -> Result<Vec<u8>> {
    let payload = record.payload()?;
    let len = u32::try_from(payload.len())
        .map_err(|_| TaskweaveError::Journal("record payload exceeds 4 GiB".to_string()))?;

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(record.tag());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&checksum(&payload));
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode all complete records in `bytes`.
///
/// A truncated trailing record (a write torn by a crash) ends the replay
/// without error. A checksum mismatch or unknown tag is an error.
pub fn decode_records(bytes: &[u8]) -> Result<Vec<JournalRecord>> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let rest = &bytes[pos..];
        if rest.len() < HEADER_LEN {
            warn!(offset = pos, "torn journal header; stopping replay");
            break;
        }

        let tag = rest[0];
        let len = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
        let sum = &rest[5..HEADER_LEN];

        let Some(payload) = rest.get(HEADER_LEN..HEADER_LEN + len) else {
            warn!(offset = pos, len, "torn journal record; stopping replay");
            break;
        };

        if checksum(payload) != sum {
            return Err(TaskweaveError::Journal(format!(
                "checksum mismatch in record at offset {pos}"
            )));
        }

        let record = match tag {
            TAG_TASK => JournalRecord::Task(serde_json::from_slice(payload)?),
            TAG_REFERENCE => JournalRecord::Reference(serde_json::from_slice(payload)?),
            other => {
                return Err(TaskweaveError::Journal(format!(
                    "unknown record tag {other:#04x} at offset {pos}"
                )));
            }
        };
        records.push(record);
        pos += HEADER_LEN + len;
    }

    Ok(records)
}

pub fn journal_path(dir: &Path, job: &JobId) -> PathBuf {
    dir.join(job.as_str()).join(JOURNAL_FILE_NAME)
}

/// Appends framed records to one job's journal file.
#[derive(Debug)]
pub struct JournalWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl JournalWriter {
    /// Open (creating if needed) the journal for `job` under `dir`.
    pub fn open(dir: &Path, job: &JobId) -> Result<Self> {
        let path = journal_path(dir, job);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "opened journal");
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append records and flush them to the OS.
    pub fn append(&mut self, records: &[JournalRecord]) -> Result<()> {
        for record in records {
            self.out.write_all(&encode_record(record)?)?;
        }
        self.out.flush()?;
        Ok(())
    }
}

/// Read one journal file.
pub fn read_journal(path: &Path) -> Result<Vec<JournalRecord>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    decode_records(&bytes)
}

/// Replay every job journal found under `dir`, in job-id order.
///
/// Directories without a journal file, or with an empty one, are skipped.
pub fn recover_all(dir: &Path) -> Result<Vec<(JobId, Vec<JournalRecord>)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut jobs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path().join(JOURNAL_FILE_NAME);
        if !path.is_file() {
            continue;
        }
        let job = JobId::new(entry.file_name().to_string_lossy().into_owned());
        let records = read_journal(&path)?;
        if records.is_empty() {
            continue;
        }
        jobs.push((job, records));
    }
    jobs.sort_by(|a, b| a.0.cmp(&b.0));

    info!(jobs = jobs.len(), dir = %dir.display(), "journals recovered");
    Ok(jobs)
}

//! Crash-durable state files.
//!
//! Two formats live here.
//!
//! [`Journal`] holds one small JSON document behind a header line carrying a
//! CRC32 of the body:
//!
//! ```text
//! ONTOSYNC-JOURNAL 1 <crc32 as 8 hex digits>
//! <json document>
//! ```
//!
//! [`RecordLog`] is an append-only log of framed records for state that
//! changes too often to rewrite whole:
//!
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [len: 4 bytes LE][record: len bytes JSON][crc32: 4 bytes LE]
//! ...
//! ```
//!
//! Full rewrites of either format go to a sibling temp file which is fsynced
//! and renamed over the target, so a crash leaves either the old or the new
//! file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ExecutionError, SyncError, SyncResult};

const MAGIC: &str = "ONTOSYNC-JOURNAL";
const VERSION: u32 = 1;

const LOG_MAGIC: [u8; 4] = *b"OSLG";
const LOG_VERSION: u8 = 1;
const LOG_HEADER_LEN: usize = 5;
/// Upper bound on a single framed record.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

fn journal_err(message: impl Into<String>) -> SyncError {
    SyncError::Execution(ExecutionError::Journal {
        message: message.into(),
    })
}

/// A typed journal file.
#[derive(Debug, Clone)]
pub struct Journal<T> {
    path: PathBuf,
    _doc: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Journal<T> {
    /// A journal stored at `path`. Nothing is read or written yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _doc: PhantomData,
        }
    }

    /// Location of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored document.
    ///
    /// Returns `Ok(None)` if the file does not exist.
    ///
    /// # Errors
    /// Fails on I/O errors, a bad header, a checksum mismatch or a body that
    /// does not decode.
    pub fn load(&self) -> SyncResult<Option<T>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(journal_err(format!("read {}: {e}", self.path.display()))),
        };

        let (header, body) = raw
            .split_once('\n')
            .ok_or_else(|| journal_err(format!("{}: missing header", self.path.display())))?;

        let mut parts = header.split_whitespace();
        if parts.next() != Some(MAGIC) {
            return Err(journal_err(format!("{}: not a journal file", self.path.display())));
        }
        let version: u32 = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| journal_err("missing journal version"))?;
        if version != VERSION {
            return Err(journal_err(format!("unsupported journal version {version}")));
        }
        let expected = parts
            .next()
            .and_then(|c| u32::from_str_radix(c, 16).ok())
            .ok_or_else(|| journal_err("missing journal checksum"))?;

        let actual = crc32fast::hash(body.as_bytes());
        if actual != expected {
            return Err(journal_err(format!(
                "{}: checksum mismatch (expected {expected:08x}, got {actual:08x})",
                self.path.display()
            )));
        }

        serde_json::from_str(body)
            .map(Some)
            .map_err(|e| journal_err(format!("{}: corrupt body: {e}", self.path.display())))
    }

    /// Atomically replaces the stored document.
    ///
    /// # Errors
    /// Fails on serialization or I/O errors.
    pub fn store(&self, doc: &T) -> SyncResult<()> {
        let body = serde_json::to_string(doc).map_err(|e| journal_err(format!("encode: {e}")))?;
        let crc = crc32fast::hash(body.as_bytes());

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| journal_err(format!("create {}: {e}", parent.display())))?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        {
            let mut file: File = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| journal_err(format!("open {}: {e}", tmp.display())))?;
            writeln!(file, "{MAGIC} {VERSION} {crc:08x}")
                .and_then(|()| file.write_all(body.as_bytes()))
                .and_then(|()| file.sync_all())
                .map_err(|e| journal_err(format!("write {}: {e}", tmp.display())))?;
        }
        fs::rename(&tmp, &self.path)
            .map_err(|e| journal_err(format!("rename to {}: {e}", self.path.display())))
    }
}

/// Records read back from a [`RecordLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replay<R> {
    /// Every intact record, in append order.
    pub records: Vec<R>,
    /// The file ended inside a record, as after a crash mid-append. The
    /// partial record is ignored.
    pub torn_tail: bool,
}

/// Append-only log of framed, checksummed records.
#[derive(Debug)]
pub struct RecordLog<R> {
    path: PathBuf,
    writer: BufWriter<File>,
    _record: PhantomData<fn(&R)>,
}

impl<R: Serialize + DeserializeOwned> RecordLog<R> {
    /// Reads every record stored at `path`.
    ///
    /// Returns `Ok(None)` if the file does not exist.
    ///
    /// # Errors
    /// Fails on I/O errors, a bad header, or a complete record whose checksum
    /// or body is invalid.
    pub fn read(path: &Path) -> SyncResult<Option<Replay<R>>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(journal_err(format!("read {}: {e}", path.display()))),
        };
        if raw.len() < LOG_HEADER_LEN || raw[..4] != LOG_MAGIC {
            return Err(journal_err(format!("{}: not a record log", path.display())));
        }
        if raw[4] != LOG_VERSION {
            return Err(journal_err(format!(
                "{}: unsupported record log version {}",
                path.display(),
                raw[4]
            )));
        }

        let mut records = Vec::new();
        let mut rest = &raw[LOG_HEADER_LEN..];
        while !rest.is_empty() {
            let Some(len) = rest.get(..4).map(le_u32) else {
                return Ok(Some(Replay { records, torn_tail: true }));
            };
            let len = len as usize;
            if len > MAX_RECORD_LEN {
                return Err(journal_err(format!(
                    "{}: record of {len} bytes exceeds the limit",
                    path.display()
                )));
            }
            let Some(frame) = rest.get(4..len + 8) else {
                return Ok(Some(Replay { records, torn_tail: true }));
            };
            let (body, crc) = frame.split_at(len);
            let expected = le_u32(crc);
            let actual = crc32fast::hash(body);
            if actual != expected {
                return Err(journal_err(format!(
                    "{}: record {} checksum mismatch (expected {expected:08x}, got {actual:08x})",
                    path.display(),
                    records.len()
                )));
            }
            let record = serde_json::from_slice(body).map_err(|e| {
                journal_err(format!("{}: corrupt record {}: {e}", path.display(), records.len()))
            })?;
            records.push(record);
            rest = &rest[len + 8..];
        }
        Ok(Some(Replay {
            records,
            torn_tail: false,
        }))
    }

    /// Atomically replaces the file at `path` with `records` and opens it for
    /// appending.
    ///
    /// # Errors
    /// Fails on serialization or I/O errors.
    pub fn create(path: impl Into<PathBuf>, records: &[R]) -> SyncResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| journal_err(format!("create {}: {e}", parent.display())))?;
            }
        }

        let tmp = path.with_extension("tmp");
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| journal_err(format!("open {}: {e}", tmp.display())))?;
            let mut writer = BufWriter::new(file);
            let write_err =
                |e: std::io::Error| journal_err(format!("write {}: {e}", tmp.display()));
            writer.write_all(&LOG_MAGIC).map_err(write_err)?;
            writer.write_all(&[LOG_VERSION]).map_err(write_err)?;
            for record in records {
                writer.write_all(&encode_record(record)?).map_err(write_err)?;
            }
            writer.flush().map_err(write_err)?;
            writer.get_ref().sync_all().map_err(write_err)?;
        }
        fs::rename(&tmp, &path)
            .map_err(|e| journal_err(format!("rename to {}: {e}", path.display())))?;

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| journal_err(format!("open {}: {e}", path.display())))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            _record: PhantomData,
        })
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffers one record. It is durable after the next [`sync`](Self::sync).
    ///
    /// # Errors
    /// Fails on serialization or I/O errors.
    pub fn append(&mut self, record: &R) -> SyncResult<()> {
        let frame = encode_record(record)?;
        self.writer
            .write_all(&frame)
            .map_err(|e| journal_err(format!("append {}: {e}", self.path.display())))
    }

    /// Flushes buffered records and fsyncs the file.
    ///
    /// # Errors
    /// Fails on I/O errors.
    pub fn sync(&mut self) -> SyncResult<()> {
        self.writer
            .flush()
            .and_then(|()| self.writer.get_ref().sync_data())
            .map_err(|e| journal_err(format!("sync {}: {e}", self.path.display())))
    }
}

fn encode_record<R: Serialize>(record: &R) -> SyncResult<Vec<u8>> {
    let body = serde_json::to_vec(record).map_err(|e| journal_err(format!("encode: {e}")))?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| (*len as usize) <= MAX_RECORD_LEN)
        .ok_or_else(|| journal_err(format!("record of {} bytes exceeds the limit", body.len())))?;
    let crc = crc32fast::hash(&body);

    let mut frame = Vec::with_capacity(body.len() + 8);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let journal: Journal<Vec<u32>> = Journal::new(dir.path().join("absent.journal"));
        assert!(journal.load().unwrap().is_none());
    }

    #[test]
    fn stored_document_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let journal: Journal<Vec<String>> = Journal::new(dir.path().join("nested/q.journal"));
        journal.store(&vec!["a".to_string(), "b".to_string()]).unwrap();
        journal.store(&vec!["c".to_string()]).unwrap();
        assert_eq!(journal.load().unwrap(), Some(vec!["c".to_string()]));
    }

    #[test]
    fn tampered_body_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.journal");
        let journal: Journal<Vec<u32>> = Journal::new(&path);
        journal.store(&vec![1, 2, 3]).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        fs::write(&path, raw.replace("[1,2,3]", "[1,2,4]")).unwrap();

        let err = journal.load().unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"), "{err}");
    }

    #[test]
    fn record_log_appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.log");
        {
            let mut log = RecordLog::create(&path, &["a".to_string()]).unwrap();
            log.append(&"b".to_string()).unwrap();
            log.sync().unwrap();
        }
        {
            let mut log: RecordLog<String> = RecordLog::create(&path, &[]).unwrap();
            log.append(&"c".to_string()).unwrap();
            log.sync().unwrap();
        }
        let replay = RecordLog::<String>::read(&path).unwrap().unwrap();
        assert_eq!(replay.records, vec!["c".to_string()]);
        assert!(!replay.torn_tail);
    }

    #[test]
    fn torn_tail_keeps_intact_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.log");
        let mut log = RecordLog::create(&path, &[1u32, 2]).unwrap();
        log.append(&3).unwrap();
        log.sync().unwrap();

        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..raw.len() - 3]).unwrap();

        let replay = RecordLog::<u32>::read(&path).unwrap().unwrap();
        assert_eq!(replay.records, vec![1, 2]);
        assert!(replay.torn_tail);
    }

    #[test]
    fn flipped_record_byte_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.log");
        RecordLog::create(&path, &["alpha".to_string(), "beta".to_string()]).unwrap();

        let mut raw = fs::read(&path).unwrap();
        let at = raw.windows(5).position(|w| w == b"alpha").unwrap();
        raw[at] = b'A';
        fs::write(&path, raw).unwrap();

        let err = RecordLog::<String>::read(&path).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"), "{err}");
    }
}

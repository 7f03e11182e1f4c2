//! Append-only record journal.
//!
//! One journal is one file of framed, checksummed records. Records are
//! appended in order and replayed front-to-back on open; a torn tail from a
//! crash is detected by signature/checksum mismatch and truncated at replay.

// Layer 1: Standard library imports
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

// Layer 2: Third-party crate imports
use bytes::Bytes;
use tracing::warn;

// Layer 3: Internal module imports
use super::error::StorageError;

/// UTF-8 'RELAYLOG' signature for journal file headers.
const JOURNAL_SIGNATURE: [u8; 8] = *b"RELAYLOG";

/// UTF-8 'RLRC' signature preceding each record.
const RECORD_SIGNATURE: [u8; 4] = *b"RLRC";

/// On-disk format version.
const JOURNAL_VERSION: u32 = 1;

/// A record replayed from a journal: discriminator byte plus payload.
#[derive(Debug, Clone)]
pub struct JournalRecord {
    /// Record kind discriminator, assigned by the caller
    pub kind: u8,
    /// Raw record payload
    pub payload: Bytes,
}

/// Append-only journal file with checksummed records.
///
/// All methods are synchronous; callers run them on a blocking thread. The
/// journal does not interpret payloads — adapters layer their record schema
/// on top of the `kind` byte.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Open a journal, creating it (with a fresh header) if missing.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Corrupted` if the file exists but does not
    /// carry a valid journal header.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let exists = path.exists() && fs::metadata(&path)?.len() > 0;
        let mut file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&path)?;

        if exists {
            Self::check_header(&mut file, &path)?;
        } else {
            file.write_all(&JOURNAL_SIGNATURE)?;
            file.write_all(&JOURNAL_VERSION.to_le_bytes())?;
            file.sync_data()?;
        }

        file.seek(SeekFrom::End(0))?;
        Ok(Self { path, file })
    }

    fn check_header(file: &mut File, path: &Path) -> Result<(), StorageError> {
        file.seek(SeekFrom::Start(0))?;
        let mut signature = [0u8; 8];
        file.read_exact(&mut signature)?;
        if signature != JOURNAL_SIGNATURE {
            return Err(StorageError::Corrupted {
                detail: format!("{} is not a relay journal", path.display()),
            });
        }
        let mut version = [0u8; 4];
        file.read_exact(&mut version)?;
        let version = u32::from_le_bytes(version);
        if version != JOURNAL_VERSION {
            return Err(StorageError::Corrupted {
                detail: format!("unsupported journal version {version}"),
            });
        }
        Ok(())
    }

    /// Append one record without syncing.
    ///
    /// Call [`Journal::sync`] to make a run of appends durable.
    pub fn append(&mut self, kind: u8, payload: &[u8]) -> Result<(), StorageError> {
        let crc = crc32fast::hash(payload);
        self.file.write_all(&RECORD_SIGNATURE)?;
        self.file.write_all(&[kind])?;
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(payload)?;
        Ok(())
    }

    /// Sync appended records to disk.
    pub fn sync(&mut self) -> Result<(), StorageError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Replay every intact record from the start of the file.
    ///
    /// A torn or corrupt tail ends the replay at the last intact record;
    /// the truncation is logged, not surfaced as an error, so a crash mid
    /// write never prevents startup.
    pub fn replay(&mut self) -> Result<Vec<JournalRecord>, StorageError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&self.file);

        let mut header = [0u8; 12];
        reader.read_exact(&mut header)?;

        let mut records = Vec::new();
        loop {
            let mut signature = [0u8; 4];
            match reader.read_exact(&mut signature) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            if signature != RECORD_SIGNATURE {
                warn!(
                    path = %self.path.display(),
                    records = records.len(),
                    "journal record signature mismatch, truncating replay"
                );
                break;
            }

            let mut kind = [0u8; 1];
            let mut len = [0u8; 4];
            let mut crc = [0u8; 4];
            if reader.read_exact(&mut kind).is_err()
                || reader.read_exact(&mut len).is_err()
                || reader.read_exact(&mut crc).is_err()
            {
                warn!(path = %self.path.display(), "torn journal record header, truncating replay");
                break;
            }

            let len = u32::from_le_bytes(len) as usize;
            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                warn!(path = %self.path.display(), "torn journal record body, truncating replay");
                break;
            }

            if crc32fast::hash(&payload) != u32::from_le_bytes(crc) {
                warn!(path = %self.path.display(), "journal record checksum mismatch, truncating replay");
                break;
            }

            records.push(JournalRecord {
                kind: kind[0],
                payload: Bytes::from(payload),
            });
        }

        self.file.seek(SeekFrom::End(0))?;
        Ok(records)
    }

    /// Replace the journal contents with `records`, atomically.
    ///
    /// Used by retention pruning: live records are rewritten to a sibling
    /// file which is then renamed over the journal.
    pub fn rewrite<'a, I>(&mut self, records: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = (u8, &'a [u8])>,
    {
        let tmp_path = self.path.with_extension("compact");
        {
            let tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            writer.write_all(&JOURNAL_SIGNATURE)?;
            writer.write_all(&JOURNAL_VERSION.to_le_bytes())?;
            for (kind, payload) in records {
                let crc = crc32fast::hash(payload);
                writer.write_all(&RECORD_SIGNATURE)?;
                writer.write_all(&[kind])?;
                writer.write_all(&(payload.len() as u32).to_le_bytes())?;
                writer.write_all(&crc.to_le_bytes())?;
                writer.write_all(payload)?;
            }
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Current journal size in bytes.
    pub fn len_bytes(&self) -> Result<u64, StorageError> {
        Ok(self.file.metadata()?.len())
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.db");

        let mut journal = Journal::open(&path).unwrap();
        journal.append(1, b"first").unwrap();
        journal.append(2, b"second").unwrap();
        journal.sync().unwrap();

        let records = journal.replay().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, 1);
        assert_eq!(&records[0].payload[..], b"first");
        assert_eq!(records[1].kind, 2);
        assert_eq!(&records[1].payload[..], b"second");
    }

    #[test]
    fn test_replay_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.db");

        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(1, b"persisted").unwrap();
            journal.sync().unwrap();
        }

        let mut journal = Journal::open(&path).unwrap();
        let records = journal.replay().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0].payload[..], b"persisted");
    }

    #[test]
    fn test_append_after_replay_keeps_earlier_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.db");

        let mut journal = Journal::open(&path).unwrap();
        journal.append(1, b"one").unwrap();
        journal.sync().unwrap();
        journal.replay().unwrap();
        journal.append(1, b"two").unwrap();
        journal.sync().unwrap();

        let records = journal.replay().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_torn_tail_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.db");

        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(1, b"intact").unwrap();
            journal.sync().unwrap();
        }

        // Simulate a crash mid-write: append garbage after the last record.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"RLRC\x01\xff\xff").unwrap();
        }

        let mut journal = Journal::open(&path).unwrap();
        let records = journal.replay().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0].payload[..], b"intact");
    }

    #[test]
    fn test_checksum_mismatch_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.db");

        {
            let mut journal = Journal::open(&path).unwrap();
            journal.append(1, b"good").unwrap();
            journal.append(1, b"bad!").unwrap();
            journal.sync().unwrap();
        }

        // Flip a payload byte of the second record (last byte of the file).
        {
            let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let len = file.metadata().unwrap().len();
            file.seek(SeekFrom::Start(len - 1)).unwrap();
            file.write_all(b"?").unwrap();
        }

        let mut journal = Journal::open(&path).unwrap();
        let records = journal.replay().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0].payload[..], b"good");
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.db");
        fs::write(&path, b"definitely not a journal").unwrap();

        let err = Journal::open(&path).unwrap_err();
        assert!(matches!(err, StorageError::Corrupted { .. }));
    }

    #[test]
    fn test_rewrite_compacts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.db");

        let mut journal = Journal::open(&path).unwrap();
        journal.append(1, b"keep").unwrap();
        journal.append(1, b"drop").unwrap();
        journal.sync().unwrap();

        journal.rewrite([(1u8, b"keep".as_slice())]).unwrap();

        let records = journal.replay().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0].payload[..], b"keep");

        // Journal stays appendable after the rename.
        journal.append(1, b"more").unwrap();
        journal.sync().unwrap();
        assert_eq!(journal.replay().unwrap().len(), 2);
    }

    #[test]
    fn test_empty_journal_replays_empty() {
        let dir = tempdir().unwrap();
        let mut journal = Journal::open(dir.path().join("messages.db")).unwrap();
        assert!(journal.replay().unwrap().is_empty());
    }
}

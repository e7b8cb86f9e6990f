//! Durable client-side commit log.
//!
//! A simplified sibling of the teacher's `crates/commitlog`: a single
//! append-only file of length-prefixed bincode frames. Where the
//! teacher's commitlog manages segment rotation, checksums and a
//! multi-writer commit protocol for a server-side table store, this one
//! only needs to let a scout recover which commits it had already shipped
//! to the surrogate before an unclean shutdown — so it is a flat,
//! single-segment file with no rotation.

use crate::error::{ScoutError, ScoutResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

const BINCODE_CONFIG: bincode::config::Configuration = bincode::config::standard();

pub struct CommitLog {
    file: File,
}

impl CommitLog {
    pub fn open(path: &Path) -> ScoutResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(CommitLog { file })
    }

    /// Append one record as a length-prefixed bincode frame.
    pub fn append<T: Serialize>(&mut self, record: &T) -> ScoutResult<()> {
        let bytes = bincode::serde::encode_to_vec(record, BINCODE_CONFIG)
            .map_err(|e| ScoutError::Codec(e.to_string()))?;
        let len = bytes.len() as u32;
        self.file.write_all(&len.to_le_bytes())?;
        self.file.write_all(&bytes)?;
        Ok(())
    }

    pub fn flush(&mut self) -> ScoutResult<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Flush and stop using this handle. Distinct from `flush` only in
    /// name, matching the append/flush/close/replay interface spec.md §6
    /// names; there is no segment to seal and no handle to hand back.
    pub fn close(&mut self) -> ScoutResult<()> {
        self.flush()
    }

    /// Read every frame in `path` in order. Used on scout startup to
    /// recover commits that may not have been acknowledged by the
    /// surrogate before the process last exited.
    pub fn replay<T: DeserializeOwned>(path: &Path) -> ScoutResult<Vec<T>> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        let mut len_buf = [0u8; 4];
        loop {
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf)?;
            let (record, _) =
                bincode::serde::decode_from_slice(&buf, BINCODE_CONFIG).map_err(|e| ScoutError::Codec(e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        id: u32,
        note: String,
    }

    #[test]
    fn append_then_replay_round_trips_records_in_order() {
        let dir = std::env::temp_dir().join(format!("scout-commitlog-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("commit.log");
        let _ = std::fs::remove_file(&path);

        {
            let mut log = CommitLog::open(&path).unwrap();
            log.append(&Record { id: 1, note: "a".to_string() }).unwrap();
            log.append(&Record { id: 2, note: "b".to_string() }).unwrap();
            log.flush().unwrap();
        }

        let records: Vec<Record> = CommitLog::replay(&path).unwrap();
        assert_eq!(
            records,
            vec![
                Record { id: 1, note: "a".to_string() },
                Record { id: 2, note: "b".to_string() },
            ]
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn close_flushes_pending_writes() {
        let dir = std::env::temp_dir().join(format!("scout-commitlog-close-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("commit.log");
        let _ = std::fs::remove_file(&path);

        let mut log = CommitLog::open(&path).unwrap();
        log.append(&Record { id: 1, note: "a".to_string() }).unwrap();
        log.close().unwrap();

        let records: Vec<Record> = CommitLog::replay(&path).unwrap();
        assert_eq!(records, vec![Record { id: 1, note: "a".to_string() }]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn replay_of_missing_file_is_empty() {
        let path = std::env::temp_dir().join("scout-commitlog-does-not-exist.log");
        let records: Vec<Record> = CommitLog::replay(&path).unwrap();
        assert!(records.is_empty());
    }
}

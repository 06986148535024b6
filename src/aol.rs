//! Durable append-only log (AOL).
//!
//! A sequence of newline-terminated text lines in the canonical grammar:
//! `SET db key value`, `DEL db key`, `EXPIREAT db key ts`, `PERSIST db key`.
//! No header, no checksums, no record framing beyond the newline. File
//! handling follows a plain buffered-writer-plus-explicit-fsync idiom.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::store::Item;

/// One parsed line of the canonical log grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Set { db: usize, key: Vec<u8>, value: Vec<u8> },
    Del { db: usize, key: Vec<u8> },
    ExpireAt { db: usize, key: Vec<u8>, ts: i64 },
    Persist { db: usize, key: Vec<u8> },
}

impl LogRecord {
    /// Render as one canonical, newline-terminated log line.
    fn to_line(&self) -> String {
        match self {
            LogRecord::Set { db, key, value } => format!(
                "SET {} {} {}\n",
                db,
                String::from_utf8_lossy(key),
                String::from_utf8_lossy(value)
            ),
            LogRecord::Del { db, key } => {
                format!("DEL {} {}\n", db, String::from_utf8_lossy(key))
            }
            LogRecord::ExpireAt { db, key, ts } => {
                format!("EXPIREAT {} {} {}\n", db, String::from_utf8_lossy(key), ts)
            }
            LogRecord::Persist { db, key } => {
                format!("PERSIST {} {}\n", db, String::from_utf8_lossy(key))
            }
        }
    }

    /// Parse one non-empty line. Returns `None` on anything malformed.
    /// Replay skips such lines rather than aborting, for forward
    /// compatibility with future record kinds.
    fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split(' ');
        let name = tokens.next()?.to_ascii_uppercase();
        match name.as_str() {
            "SET" => {
                let db = tokens.next()?.parse().ok()?;
                let key = tokens.next()?.as_bytes().to_vec();
                let value = tokens.next()?.as_bytes().to_vec();
                Some(LogRecord::Set { db, key, value })
            }
            "DEL" => {
                let db = tokens.next()?.parse().ok()?;
                let key = tokens.next()?.as_bytes().to_vec();
                Some(LogRecord::Del { db, key })
            }
            "EXPIREAT" => {
                let db = tokens.next()?.parse().ok()?;
                let key = tokens.next()?.as_bytes().to_vec();
                let ts = tokens.next()?.parse().ok()?;
                Some(LogRecord::ExpireAt { db, key, ts })
            }
            "PERSIST" => {
                let db = tokens.next()?.parse().ok()?;
                let key = tokens.next()?.as_bytes().to_vec();
                Some(LogRecord::Persist { db, key })
            }
            _ => None,
        }
    }
}

/// The durable write path: one open file handle appended to in canonical
/// grammar, plus an atomic rewrite (compaction) path.
pub struct Aol {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Aol {
    /// Open (creating if missing) the log at `path`. Ensures the parent
    /// directory exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Append one record. The caller (the engine) is responsible for
    /// serializing this with the store mutation it durably records.
    pub fn append(&mut self, record: &LogRecord) -> Result<()> {
        self.writer.write_all(record.to_line().as_bytes())?;
        Ok(())
    }

    /// Flush the buffered writer to the OS and `fsync` the file.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Close the log, syncing first.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }

    /// Iterate every record currently on disk, in file order. A trailing
    /// partial (non-newline-terminated) line is tolerated and discarded, since
    /// it may be a record a crash caught mid-write, regardless of whether it
    /// happens to parse; malformed complete lines are skipped.
    pub fn replay(&self) -> Result<impl Iterator<Item = LogRecord>> {
        let contents = fs::read_to_string(&self.path)?;
        let mut lines: Vec<String> = contents.split('\n').map(str::to_string).collect();

        // split('\n') always leaves a trailing fragment: an empty string
        // when the file ends with '\n', or the genuinely partial last line
        // when it doesn't. Either way it is not a complete record, so drop it.
        lines.pop();

        Ok(lines.into_iter().filter_map(|line| {
            if line.is_empty() {
                return None;
            }
            match LogRecord::parse(&line) {
                Some(record) => Some(record),
                None => {
                    log::warn!("skipping malformed AOL line: {line:?}");
                    None
                }
            }
        }))
    }

    /// Atomically rewrite the log from a consistent store snapshot
    /// (compaction). The caller must hold whatever write-serializing lock
    /// prevents new mutations from interleaving; this implementation quiesces
    /// writes for the duration of the rewrite (see DESIGN.md).
    pub fn rewrite(&mut self, snapshot: &[Vec<(Vec<u8>, Item)>]) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let tmp_file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut tmp = BufWriter::new(tmp_file);

            for (db, entries) in snapshot.iter().enumerate() {
                for (key, item) in entries {
                    let set = LogRecord::Set {
                        db,
                        key: key.clone(),
                        value: item.value.clone(),
                    };
                    tmp.write_all(set.to_line().as_bytes())?;

                    if let Some(ts) = item.expire_at {
                        let expire = LogRecord::ExpireAt {
                            db,
                            key: key.clone(),
                            ts,
                        };
                        tmp.write_all(expire.to_line().as_bytes())?;
                    }
                }
            }

            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }
}

impl LogRecord {
    /// Build the `EXPIREAT` record the engine logs for a relative `EXPIRE`
    /// (only absolute forms are ever written).
    pub fn expire_at(db: usize, key: &[u8], ts: i64) -> Self {
        LogRecord::ExpireAt {
            db,
            key: key.to_vec(),
            ts,
        }
    }
}

/// The database index a replayed record targets, used by the engine's
/// non-persisting replay path.
pub fn record_db(record: &LogRecord) -> usize {
    match record {
        LogRecord::Set { db, .. }
        | LogRecord::Del { db, .. }
        | LogRecord::ExpireAt { db, .. }
        | LogRecord::Persist { db, .. } => *db,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_replay_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.aol");

        {
            let mut aol = Aol::open(&path).unwrap();
            aol.append(&LogRecord::Set {
                db: 0,
                key: b"a".to_vec(),
                value: b"1".to_vec(),
            })
            .unwrap();
            aol.append(&LogRecord::Del {
                db: 0,
                key: b"b".to_vec(),
            })
            .unwrap();
            aol.sync().unwrap();
        }

        let aol = Aol::open(&path).unwrap();
        let records: Vec<_> = aol.replay().unwrap().collect();
        assert_eq!(
            records,
            vec![
                LogRecord::Set {
                    db: 0,
                    key: b"a".to_vec(),
                    value: b"1".to_vec(),
                },
                LogRecord::Del {
                    db: 0,
                    key: b"b".to_vec(),
                },
            ]
        );
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.aol");
        fs::write(&path, "SET 0 a 1\nGARBAGE\nDEL 0 a\n").unwrap();

        let aol = Aol::open(&path).unwrap();
        let records: Vec<_> = aol.replay().unwrap().collect();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn rewrite_produces_one_set_per_live_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.aol");
        let mut aol = Aol::open(&path).unwrap();

        aol.append(&LogRecord::Set {
            db: 0,
            key: b"k".to_vec(),
            value: b"v1".to_vec(),
        })
        .unwrap();
        aol.append(&LogRecord::Set {
            db: 0,
            key: b"k".to_vec(),
            value: b"v2".to_vec(),
        })
        .unwrap();
        aol.append(&LogRecord::Set {
            db: 0,
            key: b"k".to_vec(),
            value: b"v3".to_vec(),
        })
        .unwrap();
        aol.sync().unwrap();

        let snapshot = vec![vec![(
            b"k".to_vec(),
            Item {
                value: b"v3".to_vec(),
                expire_at: None,
            },
        )]];
        aol.rewrite(&snapshot).unwrap();

        let records: Vec<_> = aol.replay().unwrap().collect();
        assert_eq!(
            records,
            vec![LogRecord::Set {
                db: 0,
                key: b"k".to_vec(),
                value: b"v3".to_vec(),
            }]
        );
    }

    #[test]
    fn rewrite_includes_expireat_for_keys_with_ttl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.aol");
        let mut aol = Aol::open(&path).unwrap();

        let snapshot = vec![vec![(
            b"k".to_vec(),
            Item {
                value: b"v".to_vec(),
                expire_at: Some(99999999999),
            },
        )]];
        aol.rewrite(&snapshot).unwrap();

        let records: Vec<_> = aol.replay().unwrap().collect();
        assert_eq!(
            records,
            vec![
                LogRecord::Set {
                    db: 0,
                    key: b"k".to_vec(),
                    value: b"v".to_vec(),
                },
                LogRecord::ExpireAt {
                    db: 0,
                    key: b"k".to_vec(),
                    ts: 99999999999,
                },
            ]
        );
    }

    #[test]
    fn trailing_partial_line_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.aol");
        // The second line has no trailing newline. A crash may have cut
        // the write short, so it is discarded even though it happens to
        // parse cleanly.
        fs::write(&path, "SET 0 a 1\nDEL 0 a").unwrap();

        let aol = Aol::open(&path).unwrap();
        let records: Vec<_> = aol.replay().unwrap().collect();
        assert_eq!(
            records,
            vec![LogRecord::Set {
                db: 0,
                key: b"a".to_vec(),
                value: b"1".to_vec(),
            }]
        );
    }
}

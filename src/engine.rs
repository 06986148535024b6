//! Command execution engine.
//!
//! `Engine` atomically sequences store mutation with log append: for every
//! mutating command it takes a single writer lock, mutates the store,
//! appends the canonical log record, then releases. The writer lock is a
//! `tokio::sync::Mutex` so that a connection task waiting on it yields
//! rather than blocking its worker thread, and the very same lock is held
//! across `BGREWRITEAOF`'s snapshot+write+fsync+rename, quiescing writes
//! for the duration of a rewrite (see DESIGN.md).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;

use crate::acl::{User, UserTable};
use crate::aol::{record_db, Aol, LogRecord};
use crate::config::Config;
use crate::error::{FerroError, Result};
use crate::store::{now_secs, Store};

/// The typed category of a reply, driving wire-format encoding at the
/// connection layer. The engine never lets a connection infer kind from
/// string contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Simple,
    Error,
    Integer,
    Bulk,
    Null,
    Close,
}

/// A reply from the engine: a kind plus whatever payload that kind carries.
#[derive(Debug, Clone)]
pub struct Reply {
    pub kind: ReplyKind,
    pub text: String,
    pub bytes: Option<Vec<u8>>,
    pub integer: i64,
}

impl Reply {
    pub fn simple(s: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Simple,
            text: s.into(),
            bytes: None,
            integer: 0,
        }
    }

    pub fn error(s: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Error,
            text: s.into(),
            bytes: None,
            integer: 0,
        }
    }

    pub fn integer(n: i64) -> Self {
        Self {
            kind: ReplyKind::Integer,
            text: n.to_string(),
            bytes: None,
            integer: n,
        }
    }

    pub fn bulk(bytes: Vec<u8>) -> Self {
        Self {
            kind: ReplyKind::Bulk,
            text: String::from_utf8_lossy(&bytes).into_owned(),
            bytes: Some(bytes),
            integer: 0,
        }
    }

    pub fn bulk_str(s: impl Into<String>) -> Self {
        Reply::bulk(s.into().into_bytes())
    }

    pub fn null() -> Self {
        Self {
            kind: ReplyKind::Null,
            text: "(nil)".to_string(),
            bytes: None,
            integer: 0,
        }
    }

    pub fn close(s: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Close,
            text: s.into(),
            bytes: None,
            integer: 0,
        }
    }
}

impl From<FerroError> for Reply {
    fn from(e: FerroError) -> Self {
        Reply::error(e.to_string())
    }
}

const HELP_TEXT: &str = "\
SET key value
GET key
DEL key
EXPIRE key seconds
EXPIREAT key unix-seconds
PERSIST key
TTL key
KEYS *
INFO
HELP
BGREWRITEAOF
SELECT index
AUTH username password
LOGOUT
ACL WHOAMI
ACL CAT
QUIT / EXIT";

/// The command execution engine: memory store + durable log + user table.
pub struct Engine {
    store: Arc<Store>,
    aol: AsyncMutex<Aol>,
    users: UserTable,
    start_time: Instant,
    active_connections: Arc<AtomicUsize>,
}

impl Engine {
    /// Open the log, replay it into a fresh store, and build the immutable
    /// user table from `config`.
    pub fn new(config: &Config) -> Result<Self> {
        let aol = Aol::open(config.log_path())?;
        let store = Store::new(config.db_count);

        for record in aol.replay()? {
            Self::apply_replayed(&store, record);
        }

        let roles = config.parsed_roles()?;
        let users = UserTable::new(
            roles
                .into_iter()
                .map(|(u, role)| User {
                    username: u.username,
                    password_hash: u.password_hash,
                    role,
                })
                .collect(),
        );

        log::info!(
            "replayed {} live key(s) across {} database(s)",
            store.size(),
            store.db_count()
        );

        Ok(Self {
            store: Arc::new(store),
            aol: AsyncMutex::new(aol),
            users,
            start_time: Instant::now(),
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn users(&self) -> &UserTable {
        &self.users
    }

    pub fn db_count(&self) -> usize {
        self.store.db_count()
    }

    pub fn active_connections(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_connections)
    }

    pub fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Apply one replayed record directly to the store, without appending
    /// to the log. Unknown or malformed records never reach here; the AOL
    /// iterator already filtered them.
    fn apply_replayed(store: &Store, record: LogRecord) {
        let db = record_db(&record);
        let result = match &record {
            LogRecord::Set { key, value, .. } => store.set(db, key, value.clone()),
            LogRecord::Del { key, .. } => store.del(db, key).map(|_| ()),
            LogRecord::ExpireAt { key, ts, .. } => store.expire_at(db, key, *ts).map(|_| ()),
            LogRecord::Persist { key, .. } => store.persist(db, key).map(|_| ()),
        };
        if let Err(e) = result {
            log::warn!("skipping replayed record for out-of-range db {db}: {e}");
        }
    }

    /// Execute one already-tokenized command against `db`. `cmd` must
    /// already be upper-cased. This handles every command whose reply does
    /// not depend on per-connection session state (AUTH/SELECT/LOGOUT/ACL/
    /// QUIT/EXIT are handled by the connection layer, which owns the
    /// session).
    pub async fn execute(&self, db: usize, cmd: &str, args: &[Vec<u8>]) -> Reply {
        match self.execute_inner(db, cmd, args).await {
            Ok(reply) => reply,
            Err(e) => Reply::from(e),
        }
    }

    async fn execute_inner(&self, db: usize, cmd: &str, args: &[Vec<u8>]) -> Result<Reply> {
        match cmd {
            "SET" => {
                let (key, value) = two_args(args, "SET")?;
                self.with_writer_lock(|store| {
                    store.set(db, &key, value.clone())?;
                    Ok((
                        Reply::simple("OK"),
                        Some(LogRecord::Set { db, key: key.clone(), value }),
                    ))
                })
                .await
            }

            "GET" => {
                let key = one_arg(args, "GET")?;
                match self.store.get(db, &key)? {
                    Some(value) => Ok(Reply::bulk(value)),
                    None => Ok(Reply::null()),
                }
            }

            "DEL" => {
                let key = one_arg(args, "DEL")?;
                self.with_writer_lock(|store| {
                    let removed = store.del(db, &key)?;
                    let record = removed.then(|| LogRecord::Del { db, key: key.clone() });
                    Ok((Reply::integer(removed as i64), record))
                })
                .await
            }

            "EXPIRE" => {
                let (key, secs_raw) = two_args(args, "EXPIRE")?;
                let secs: i64 = parse_integer(&secs_raw, "seconds")?;
                if secs <= 0 {
                    return Err(FerroError::Range("ERR invalid seconds".to_string()));
                }
                let ts = now_secs() + secs;
                self.expire_at_and_log(db, &key, ts).await
            }

            "EXPIREAT" => {
                let (key, ts_raw) = two_args(args, "EXPIREAT")?;
                let ts: i64 = parse_integer(&ts_raw, "timestamp")?;
                self.expire_at_and_log(db, &key, ts).await
            }

            "PERSIST" => {
                let key = one_arg(args, "PERSIST")?;
                self.with_writer_lock(|store| {
                    let changed = store.persist(db, &key)?;
                    let record = changed.then(|| LogRecord::Persist { db, key: key.clone() });
                    Ok((Reply::integer(changed as i64), record))
                })
                .await
            }

            "TTL" => {
                let key = one_arg(args, "TTL")?;
                Ok(Reply::integer(self.store.ttl(db, &key)?))
            }

            "KEYS" => {
                require_pattern_star(args)?;
                let mut keys = self.store.keys(db)?;
                keys.sort();
                let rendered = keys
                    .iter()
                    .map(|k| String::from_utf8_lossy(k).into_owned())
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(Reply::bulk_str(rendered))
            }

            "INFO" => Ok(Reply::bulk_str(self.info_text())),

            "HELP" => Ok(Reply::bulk_str(HELP_TEXT)),

            "BGREWRITEAOF" => {
                self.bgrewriteaof().await?;
                Ok(Reply::simple("OK"))
            }

            _ => Err(FerroError::Syntax(format!("ERR unknown command '{cmd}'"))),
        }
    }

    /// `EXPIREAT ts=0` is the wire encoding for "clear expiration";
    /// everything else sets an absolute expiry.
    async fn expire_at_and_log(&self, db: usize, key: &[u8], ts: i64) -> Result<Reply> {
        if ts == 0 {
            return self
                .with_writer_lock(|store| {
                    let changed = store.persist(db, key)?;
                    let record = changed.then(|| LogRecord::Persist {
                        db,
                        key: key.to_vec(),
                    });
                    Ok((Reply::simple("OK"), record))
                })
                .await;
        }

        self.with_writer_lock(|store| {
            let ok = store.expire_at(db, key, ts)?;
            if !ok {
                return Ok((Reply::null(), None));
            }
            Ok((Reply::simple("OK"), Some(LogRecord::expire_at(db, key, ts))))
        })
        .await
    }

    /// Apply `replayed` record to the store without appending to the log.
    /// Exposed for callers that already have a parsed record, such as tests
    /// driving replay directly.
    pub fn execute_replayed(&self, record: LogRecord) {
        Self::apply_replayed(&self.store, record);
    }

    /// Acquire the single writer lock, run `f` against the store, and, if it
    /// returns a log record, append that record before releasing. This is
    /// the one place store mutation and log append happen together, so the
    /// log's record order always matches mutation order across every
    /// client.
    async fn with_writer_lock(
        &self,
        f: impl FnOnce(&Store) -> Result<(Reply, Option<LogRecord>)>,
    ) -> Result<Reply> {
        let mut aol = self.aol.lock().await;
        let (reply, record) = f(&self.store)?;
        if let Some(record) = record {
            aol.append(&record)
                .map_err(|e| FerroError::Storage(format!("ERR log write failed: {e}")))?;
        }
        Ok(reply)
    }

    fn info_text(&self) -> String {
        format!(
            "FerroDB v0.3.0\nuptime_seconds: {}\nkeys: {}\nactive_connections: {}",
            self.start_time.elapsed().as_secs(),
            self.store.size(),
            self.active_connections.load(Ordering::Relaxed),
        )
    }

    /// Perform `BGREWRITEAOF` (log compaction). The rewrite holds the same
    /// writer lock every mutating command takes, so no new mutation can
    /// interleave between the snapshot and the rename. The practical
    /// consequence is that the calling connection's task blocks until
    /// rewrite completes, while other connections merely queue behind the
    /// same lock they'd contend for anyway.
    pub async fn bgrewriteaof(&self) -> Result<()> {
        let mut aol = self.aol.lock().await;
        let snapshot = self.store.snapshot();
        aol.rewrite(&snapshot)
            .map_err(|e| FerroError::Storage(format!("ERR rewrite failed: {e}")))
    }

    /// Flush and close the log.
    pub async fn shutdown(&self) -> Result<()> {
        let mut aol = self.aol.lock().await;
        aol.sync()
    }
}

fn one_arg(args: &[Vec<u8>], cmd: &str) -> Result<Vec<u8>> {
    args.first()
        .cloned()
        .ok_or_else(|| FerroError::Syntax(format!("ERR {cmd} requires key")))
}

fn two_args(args: &[Vec<u8>], cmd: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    if args.len() < 2 {
        return Err(FerroError::Syntax(format!(
            "ERR {cmd} requires key and value"
        )));
    }
    Ok((args[0].clone(), args[1].clone()))
}

fn require_pattern_star(args: &[Vec<u8>]) -> Result<()> {
    match args.first() {
        Some(p) if p == b"*" => Ok(()),
        Some(_) => Err(FerroError::Syntax(
            "ERR KEYS only supports the '*' pattern".to_string(),
        )),
        None => Err(FerroError::Syntax("ERR KEYS requires a pattern".to_string())),
    }
}

fn parse_integer(raw: &[u8], field: &str) -> Result<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| FerroError::Syntax(format!("ERR invalid {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine() -> (Engine, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        (Engine::new(&config).unwrap(), dir)
    }

    #[tokio::test]
    async fn set_then_get() {
        let (e, _dir) = engine();
        let r = e.execute(0, "SET", &[b"a".to_vec(), b"1".to_vec()]).await;
        assert_eq!(r.kind, ReplyKind::Simple);
        assert_eq!(r.text, "OK");

        let r = e.execute(0, "GET", &[b"a".to_vec()]).await;
        assert_eq!(r.kind, ReplyKind::Bulk);
        assert_eq!(r.bytes, Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn get_missing_is_null() {
        let (e, _dir) = engine();
        let r = e.execute(0, "GET", &[b"missing".to_vec()]).await;
        assert_eq!(r.kind, ReplyKind::Null);
    }

    #[tokio::test]
    async fn del_returns_integer_count() {
        let (e, _dir) = engine();
        e.execute(0, "SET", &[b"a".to_vec(), b"1".to_vec()]).await;
        let r = e.execute(0, "DEL", &[b"a".to_vec()]).await;
        assert_eq!(r.integer, 1);
        let r = e.execute(0, "DEL", &[b"a".to_vec()]).await;
        assert_eq!(r.integer, 0);
    }

    #[tokio::test]
    async fn expire_zero_or_negative_is_an_error() {
        let (e, _dir) = engine();
        e.execute(0, "SET", &[b"a".to_vec(), b"1".to_vec()]).await;
        let r = e.execute(0, "EXPIRE", &[b"a".to_vec(), b"0".to_vec()]).await;
        assert_eq!(r.kind, ReplyKind::Error);
    }

    #[tokio::test]
    async fn expireat_zero_clears_expiration() {
        let (e, _dir) = engine();
        e.execute(0, "SET", &[b"a".to_vec(), b"1".to_vec()]).await;
        e.execute(0, "EXPIRE", &[b"a".to_vec(), b"100".to_vec()]).await;
        let r = e
            .execute(0, "EXPIREAT", &[b"a".to_vec(), b"0".to_vec()])
            .await;
        assert_eq!(r.text, "OK");
        let ttl = e.execute(0, "TTL", &[b"a".to_vec()]).await;
        assert_eq!(ttl.integer, -1);
    }

    #[tokio::test]
    async fn unknown_command_is_an_error() {
        let (e, _dir) = engine();
        let r = e.execute(0, "NOPE", &[]).await;
        assert_eq!(r.kind, ReplyKind::Error);
        assert!(r.text.contains("unknown command"));
    }

    #[tokio::test]
    async fn keys_only_supports_star() {
        let (e, _dir) = engine();
        let r = e.execute(0, "KEYS", &[b"a*".to_vec()]).await;
        assert_eq!(r.kind, ReplyKind::Error);
    }

    #[tokio::test]
    async fn replay_reconstructs_state_after_restart() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();

        {
            let e = Engine::new(&config).unwrap();
            e.execute(0, "SET", &[b"a".to_vec(), b"1".to_vec()]).await;
            e.execute(0, "SET", &[b"b".to_vec(), b"2".to_vec()]).await;
            e.execute(0, "DEL", &[b"a".to_vec()]).await;
            e.shutdown().await.unwrap();
        }

        let e2 = Engine::new(&config).unwrap();
        let a = e2.execute(0, "GET", &[b"a".to_vec()]).await;
        assert_eq!(a.kind, ReplyKind::Null);
        let b = e2.execute(0, "GET", &[b"b".to_vec()]).await;
        assert_eq!(b.bytes, Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn bgrewriteaof_compacts_to_one_set_per_key() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        let e = Engine::new(&config).unwrap();

        e.execute(0, "SET", &[b"k".to_vec(), b"v1".to_vec()]).await;
        e.execute(0, "SET", &[b"k".to_vec(), b"v2".to_vec()]).await;
        e.execute(0, "SET", &[b"k".to_vec(), b"v3".to_vec()]).await;
        e.bgrewriteaof().await.unwrap();
        e.shutdown().await.unwrap();

        let e2 = Engine::new(&config).unwrap();
        let v = e2.execute(0, "GET", &[b"k".to_vec()]).await;
        assert_eq!(v.bytes, Some(b"v3".to_vec()));
    }

    #[tokio::test]
    async fn multi_db_isolation() {
        let (e, _dir) = engine();
        e.execute(0, "SET", &[b"k".to_vec(), b"a".to_vec()]).await;
        e.execute(1, "SET", &[b"k".to_vec(), b"b".to_vec()]).await;
        assert_eq!(
            e.execute(0, "GET", &[b"k".to_vec()]).await.bytes,
            Some(b"a".to_vec())
        );
        assert_eq!(
            e.execute(1, "GET", &[b"k".to_vec()]).await.bytes,
            Some(b"b".to_vec())
        );
    }
}

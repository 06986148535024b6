//! Per-connection session state and command dispatch.
//!
//! One `ConnectionHandler` runs per accepted socket, reading frames in
//! whichever format the client used and routing each to either the engine
//! (for everything key/value related) or directly to session state for the
//! connection-scoped commands AUTH/SELECT/LOGOUT/ACL/QUIT/EXIT, which the
//! engine itself knows nothing about.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{info, warn};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::acl::Role;
use crate::engine::{Engine, Reply, ReplyKind};
use crate::error::{FerroError, Result};
use crate::protocol::codec::{self, FormatMode};

/// What an authenticated (or not yet authenticated) connection remembers
/// about itself between commands.
struct Session {
    authenticated: bool,
    username: Option<String>,
    role: Option<Role>,
    selected_db: usize,
}

impl Session {
    fn new() -> Self {
        Self {
            authenticated: false,
            username: None,
            role: None,
            selected_db: 0,
        }
    }

    /// Enforce authentication and permission, then route to either
    /// session-local handling or the engine.
    async fn dispatch(&mut self, engine: &Engine, cmd: &str, args: &[Vec<u8>]) -> Reply {
        if cmd == "AUTH" {
            return self.handle_auth(engine, args).await;
        }

        if !self.authenticated && !Role::always_public(cmd) {
            return Reply::from(FerroError::Auth(
                "NOAUTH Authentication required".to_string(),
            ));
        }

        if let Some(role) = self.role {
            if !role.permits(cmd) {
                return Reply::from(FerroError::Auth("NOPERM permission denied".to_string()));
            }
        }

        match cmd {
            "SELECT" => self.handle_select(engine, args),
            "LOGOUT" => self.handle_logout(),
            "ACL" => self.handle_acl(args),
            "QUIT" | "EXIT" => Reply::close("BYE"),
            _ => engine.execute(self.selected_db, cmd, args).await,
        }
    }

    async fn handle_auth(&mut self, engine: &Engine, args: &[Vec<u8>]) -> Reply {
        if args.len() < 2 {
            return Reply::from(FerroError::Syntax(
                "ERR AUTH requires username and password".to_string(),
            ));
        }
        let username = String::from_utf8_lossy(&args[0]).into_owned();
        let password = String::from_utf8_lossy(&args[1]).into_owned();

        match engine.users().verify(&username, &password) {
            Ok(user) => {
                self.authenticated = true;
                self.role = Some(user.role);
                self.username = Some(user.username.clone());
                Reply::simple("OK")
            }
            Err(e) => Reply::from(e),
        }
    }

    fn handle_select(&mut self, engine: &Engine, args: &[Vec<u8>]) -> Reply {
        let raw = match args.first() {
            Some(raw) => raw,
            None => {
                return Reply::from(FerroError::Syntax(
                    "ERR SELECT requires a database index".to_string(),
                ))
            }
        };
        let index: usize = match std::str::from_utf8(raw).ok().and_then(|s| s.parse().ok()) {
            Some(index) => index,
            None => {
                return Reply::from(FerroError::Syntax(
                    "ERR invalid database index".to_string(),
                ))
            }
        };
        if index >= engine.db_count() {
            return Reply::from(FerroError::Range("ERR invalid DB index".to_string()));
        }
        self.selected_db = index;
        Reply::simple("OK")
    }

    fn handle_logout(&mut self) -> Reply {
        self.authenticated = false;
        self.username = None;
        self.role = None;
        Reply::simple("OK")
    }

    fn handle_acl(&self, args: &[Vec<u8>]) -> Reply {
        let sub = args
            .first()
            .map(|a| String::from_utf8_lossy(a).to_ascii_uppercase())
            .unwrap_or_default();
        match sub.as_str() {
            "WHOAMI" => match &self.username {
                Some(username) => Reply::bulk_str(username.clone()),
                None => Reply::bulk_str("(anonymous)"),
            },
            "CAT" => {
                let commands = self.role.map(|role| role.permitted_commands()).unwrap_or_else(|| {
                    const PUBLIC: &[&str] =
                        &["AUTH", "LOGOUT", "HELP", "INFO", "ACL", "QUIT", "EXIT"];
                    PUBLIC.to_vec()
                });
                Reply::bulk_str(commands.join("\n"))
            }
            _ => Reply::from(FerroError::Syntax(format!(
                "ERR unknown ACL subcommand '{sub}'"
            ))),
        }
    }
}

/// Drives one client connection to completion.
pub struct ConnectionHandler {
    stream: TcpStream,
    engine: Arc<Engine>,
    peer_addr: SocketAddr,
}

impl ConnectionHandler {
    pub fn new(stream: TcpStream, engine: Arc<Engine>, peer_addr: SocketAddr) -> Self {
        Self {
            stream,
            engine,
            peer_addr,
        }
    }

    /// Read and dispatch frames until the client disconnects, sends a
    /// closing command, or a protocol error makes the stream unrecoverable.
    pub async fn run(self) -> Result<()> {
        let _ = self.stream.set_nodelay(true);
        let peer = self.peer_addr;
        let engine = self.engine;
        let mut session = Session::new();

        let (read_half, mut write_half) = self.stream.into_split();
        let mut reader = BufReader::new(read_half);

        loop {
            let frame = match codec::read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!("protocol error from {peer}: {e}");
                    let reply = Reply::from(e);
                    let _ = codec::write_reply(&mut write_half, FormatMode::Array, &reply).await;
                    break;
                }
            };

            if frame.args.is_empty() {
                continue;
            }

            let cmd = String::from_utf8_lossy(&frame.args[0]).to_ascii_uppercase();
            let rest = &frame.args[1..];

            let reply = session.dispatch(&engine, &cmd, rest).await;
            let should_close = reply.kind == ReplyKind::Close;

            codec::write_reply(&mut write_half, frame.mode, &reply).await?;
            if frame.mode == FormatMode::Inline && !should_close {
                codec::write_prompt(&mut write_half, session.selected_db).await?;
            }
            write_half.flush().await?;

            if should_close {
                break;
            }
        }

        info!("connection closed: {peer}");
        Ok(())
    }
}

/// Bump and eventually release the shared active-connection counter the
/// engine reports through `INFO`.
pub struct ConnectionGuard {
    counter: Arc<std::sync::atomic::AtomicUsize>,
}

impl ConnectionGuard {
    pub fn enter(counter: Arc<std::sync::atomic::AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

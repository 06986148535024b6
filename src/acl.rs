//! Role-based access control
//!
//! Users are loaded once at startup from the validated [`crate::config::Config`]
//! and never mutated afterward. Each connection's [`crate::server::session::Session`]
//! tracks which user (if any) authenticated and what role that grants.

use std::collections::HashMap;

use crate::error::{FerroError, Result};

/// A role grants a fixed set of permitted commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Every command.
    Admin,
    /// Mutating commands plus the always-public set.
    Writer,
    /// Read-only commands plus the always-public set.
    Reader,
}

impl Role {
    /// Parse a role name from a config file (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "writer" => Some(Role::Writer),
            "reader" => Some(Role::Reader),
            _ => None,
        }
    }

    /// Commands usable by any role, authenticated or not. Also consulted
    /// by the connection layer before a session has authenticated at all.
    pub fn always_public(cmd: &str) -> bool {
        matches!(
            cmd,
            "AUTH" | "LOGOUT" | "HELP" | "INFO" | "ACL" | "QUIT" | "EXIT"
        )
    }

    /// Whether this role is permitted to run `cmd` (already upper-cased).
    pub fn permits(&self, cmd: &str) -> bool {
        if Role::always_public(cmd) {
            return true;
        }
        match self {
            Role::Admin => true,
            // EXPIREAT, KEYS, and BGREWRITEAOF are deliberately admin-only:
            // an arbitrary absolute expiry, a full-database scan, and log
            // compaction stay out of writer's and reader's hands.
            Role::Writer => matches!(cmd, "SET" | "DEL" | "EXPIRE" | "PERSIST" | "SELECT"),
            Role::Reader => matches!(cmd, "GET" | "TTL"),
        }
    }

    /// All commands this role may run, for `ACL CAT`.
    pub fn permitted_commands(&self) -> Vec<&'static str> {
        const ALL: &[&str] = &[
            "SET", "GET", "DEL", "EXPIRE", "EXPIREAT", "PERSIST", "TTL", "KEYS", "INFO", "HELP",
            "BGREWRITEAOF", "SELECT", "AUTH", "LOGOUT", "ACL", "QUIT", "EXIT",
        ];
        ALL.iter().copied().filter(|c| self.permits(c)).collect()
    }
}

/// One authenticatable account.
#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub password_hash: String,
    pub role: Role,
}

/// Immutable table of all known users, keyed by username.
#[derive(Debug, Clone, Default)]
pub struct UserTable {
    users: HashMap<String, User>,
}

impl UserTable {
    pub fn new(users: Vec<User>) -> Self {
        let mut map = HashMap::with_capacity(users.len());
        for user in users {
            map.insert(user.username.clone(), user);
        }
        Self { users: map }
    }

    pub fn get(&self, username: &str) -> Option<&User> {
        self.users.get(username)
    }

    /// Verify a plaintext password against the stored bcrypt hash for `username`.
    ///
    /// Returns the matching [`User`] on success. Unknown users and bad
    /// passwords are indistinguishable to the caller (both `NOAUTH`/`ERR`),
    /// matching typical auth-failure hygiene.
    pub fn verify(&self, username: &str, password: &str) -> Result<&User> {
        let user = self
            .users
            .get(username)
            .ok_or_else(|| FerroError::Auth("ERR invalid username or password".to_string()))?;

        let ok = bcrypt::verify(password, &user.password_hash)
            .map_err(|_| FerroError::Auth("ERR invalid username or password".to_string()))?;

        if ok {
            Ok(user)
        } else {
            Err(FerroError::Auth(
                "ERR invalid username or password".to_string(),
            ))
        }
    }
}

/// Hash a plaintext password for storage in the user config (used by the
/// `ferrodb-hash` CLI and by tests that build a `UserTable` in memory).
pub fn hash_password(password: &str) -> Result<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(FerroError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_from_name_is_case_insensitive() {
        assert_eq!(Role::from_name("Admin"), Some(Role::Admin));
        assert_eq!(Role::from_name("WRITER"), Some(Role::Writer));
        assert_eq!(Role::from_name("reader"), Some(Role::Reader));
        assert_eq!(Role::from_name("bogus"), None);
    }

    #[test]
    fn always_public_commands_permitted_for_every_role() {
        for role in [Role::Admin, Role::Writer, Role::Reader] {
            assert!(role.permits("AUTH"));
            assert!(role.permits("HELP"));
            assert!(role.permits("QUIT"));
        }
    }

    #[test]
    fn writer_cannot_get_reader_cannot_set() {
        assert!(!Role::Writer.permits("GET"));
        assert!(Role::Writer.permits("SET"));
        assert!(!Role::Reader.permits("SET"));
        assert!(Role::Reader.permits("GET"));
    }

    #[test]
    fn admin_permits_everything_in_the_table() {
        for cmd in Role::Admin.permitted_commands() {
            assert!(Role::Admin.permits(cmd));
        }
        assert_eq!(Role::Admin.permitted_commands().len(), 17);
    }

    #[test]
    fn verify_round_trips_through_bcrypt() {
        let hash = hash_password("hunter2").unwrap();
        let table = UserTable::new(vec![User {
            username: "alice".to_string(),
            password_hash: hash,
            role: Role::Admin,
        }]);

        assert!(table.verify("alice", "hunter2").is_ok());
        assert!(table.verify("alice", "wrong").is_err());
        assert!(table.verify("bob", "hunter2").is_err());
    }
}

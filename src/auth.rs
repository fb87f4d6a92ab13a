use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};
use serde::Deserialize;
use ulid::Ulid;

use crate::limits::MAX_NAME_LEN;
use crate::model::{Role, User};

/// Login name of the built-in client used when no users file is configured.
pub const DEFAULT_USER: &str = "slotbook";

#[derive(Debug)]
pub enum AuthError {
    /// Unknown user or wrong password. Does not say which.
    InvalidCredentials,
    DuplicateUser(String),
    Config(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidCredentials => write!(f, "invalid user name or password"),
            AuthError::DuplicateUser(name) => write!(f, "duplicate user: {name}"),
            AuthError::Config(msg) => write!(f, "users file: {msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// One entry of the users file.
///
/// ```toml
/// [[users]]
/// id = "01J0000000000000000000000A"
/// name = "dr-smith"
/// password = "secret"
/// role = "provider"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    pub id: Ulid,
    pub name: String,
    pub password: String,
    pub role: Role,
}

impl UserRecord {
    pub fn user(&self) -> User {
        User {
            id: self.id,
            name: self.name.clone(),
            role: self.role,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: Vec<UserRecord>,
}

/// Known users, keyed by login name.
#[derive(Debug, Default)]
pub struct Directory {
    users: HashMap<String, UserRecord>,
}

impl Directory {
    pub fn new(records: Vec<UserRecord>) -> Result<Self, AuthError> {
        let mut users = HashMap::with_capacity(records.len());
        for record in records {
            if record.name.is_empty() || record.name.len() > MAX_NAME_LEN {
                return Err(AuthError::Config(format!("bad user name {:?}", record.name)));
            }
            if users.contains_key(&record.name) {
                return Err(AuthError::DuplicateUser(record.name));
            }
            users.insert(record.name.clone(), record);
        }
        Ok(Self { users })
    }

    /// A directory holding only the built-in client account.
    pub fn single_client(password: String) -> Self {
        let record = UserRecord {
            id: Ulid::from_parts(0, 1),
            name: DEFAULT_USER.to_string(),
            password,
            role: Role::Client,
        };
        Self {
            users: HashMap::from([(record.name.clone(), record)]),
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, AuthError> {
        let file: UsersFile =
            toml::from_str(contents).map_err(|e| AuthError::Config(e.to_string()))?;
        Self::new(file.users)
    }

    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AuthError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&contents)
    }

    pub fn login(&self, name: &str, password: &str) -> Result<User, AuthError> {
        match self.users.get(name) {
            Some(record) if record.password == password => Ok(record.user()),
            _ => {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                Err(AuthError::InvalidCredentials)
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<User> {
        self.users.get(name).map(UserRecord::user)
    }

    /// Provider accounts, ascending by name.
    pub fn providers(&self) -> Vec<&UserRecord> {
        let mut out: Vec<_> = self
            .users
            .values()
            .filter(|r| r.role == Role::Provider)
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

// ── pgwire startup ────────────────────────────────────────────────

/// Password source for pgwire's cleartext startup handler, which does the
/// comparison.
#[derive(Debug, Clone)]
pub struct DirectoryAuth(pub Arc<Directory>);

#[async_trait]
impl AuthSource for DirectoryAuth {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let name = login.user().map(|u| u.to_string()).unwrap_or_default();
        match self.0.users.get(&name) {
            Some(record) => Ok(Password::new(None, record.password.as_bytes().to_vec())),
            None => {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                Err(PgWireError::InvalidPassword(name))
            }
        }
    }
}

//! ftpost-auth: per-account password records and login verification
//!
//! Accounts are loaded once from `accounts.users` at startup and never
//! mutated afterwards, so a `CredentialStore` is shared between sessions
//! behind an `Arc` without locking.

pub mod record;

pub use record::{HashAlgorithm, PasswordRecord, RecordFormat};

use std::collections::HashMap;

use ftpost_core::config::AccountsConfig;
use ftpost_core::{FtpostError, FtpostResult, Permissions};

/// Reserved login name that is never granted access.
pub const ANONYMOUS_USER: &str = "anonymous";

const AUTH_FAILED: &str = "Authentication failed.";
const ANONYMOUS_DENIED: &str = "Anonymous access not allowed.";

/// A configured login
#[derive(Debug, Clone)]
pub struct Account {
    pub username: String,
    pub record: PasswordRecord,
    pub permissions: Permissions,
    /// Namespace uploads are filed under (defaults to the username)
    pub home: String,
}

/// The authentication callback the protocol engine holds.
pub trait Authenticator: Send + Sync {
    /// Returns the account on success, `AuthenticationFailed` for bad
    /// credentials and `MisconfiguredCredential` for an unusable record.
    fn verify(&self, username: &str, password: &str) -> FtpostResult<&Account>;
}

#[derive(Debug, Default)]
pub struct CredentialStore {
    accounts: HashMap<String, Account>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the store from `name:record` entries. Malformed entries and
    /// duplicate names are fatal.
    pub fn load(config: &AccountsConfig) -> FtpostResult<Self> {
        let mut store = Self::new();
        for entry in &config.users {
            let (name, record) = entry.split_once(':').ok_or_else(|| {
                let entry = redact(entry);
                FtpostError::Config(format!("account entry is not name:record: {entry:?}"))
            })?;
            store.add_account(name.trim(), PasswordRecord::new(record))?;
        }
        Ok(store)
    }

    pub fn add_account(&mut self, username: &str, record: PasswordRecord) -> FtpostResult<()> {
        validate_account_name(username)?;
        if self.accounts.contains_key(username) {
            return Err(FtpostError::DuplicateAccount(username.to_string()));
        }
        if username == ANONYMOUS_USER {
            tracing::warn!("account {ANONYMOUS_USER:?} is configured but can never log in");
        }
        if let Err(e) = record.format() {
            tracing::warn!(user = %username, "stored password record is unusable: {e}");
        }
        self.accounts.insert(
            username.to_string(),
            Account {
                username: username.to_string(),
                record,
                permissions: Permissions::default(),
                home: username.to_string(),
            },
        );
        Ok(())
    }

    pub fn account(&self, username: &str) -> Option<&Account> {
        self.accounts.get(username)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl Authenticator for CredentialStore {
    fn verify(&self, username: &str, password: &str) -> FtpostResult<&Account> {
        if username == ANONYMOUS_USER {
            return Err(FtpostError::AuthenticationFailed(ANONYMOUS_DENIED.into()));
        }
        let account = self
            .accounts
            .get(username)
            .ok_or_else(|| FtpostError::AuthenticationFailed(AUTH_FAILED.into()))?;
        if account.record.matches(password)? {
            Ok(account)
        } else {
            Err(FtpostError::AuthenticationFailed(AUTH_FAILED.into()))
        }
    }
}

/// An account name is also its upload namespace, so it must be a single
/// plain path segment.
fn validate_account_name(name: &str) -> FtpostResult<()> {
    if name.is_empty() {
        return Err(FtpostError::Config("account entry has an empty name".into()));
    }
    let reserved = |c: char| matches!(c, '/' | '\\' | ':') || c.is_control();
    if name.starts_with('.') || name.contains(reserved) {
        return Err(FtpostError::Config(format!(
            "account name {name:?} must not start with '.' or contain '/', '\\', ':' \
             or control characters"
        )));
    }
    Ok(())
}

/// Keep the account name, hide the record.
fn redact(entry: &str) -> String {
    match entry.split_once(':') {
        Some((name, _)) => format!("{name}:***"),
        None => "***".into(),
    }
}

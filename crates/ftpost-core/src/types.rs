use std::fmt;

use crate::error::{FtpostError, FtpostResult};

/// A single-line FTP reply: three-digit code plus human-readable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Reply {
            code,
            text: text.into(),
        }
    }

    /// 1xx, 2xx and 3xx replies
    pub fn is_positive(&self) -> bool {
        self.code < 400
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Per-account permission flags.
///
/// Parsed from the classic letter form: `e` change directory, `l` list,
/// `r` retrieve, `a` append, `d` delete, `f` rename, `m` make directory,
/// `w` store, `M` chmod, `T` set mtime. Only `e`, `l` and `w` ever grant
/// anything on this server; the rest are accepted for compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permissions {
    letters: String,
}

const VALID_PERMS: &str = "elradfmwMT";

impl Permissions {
    pub fn parse(letters: &str) -> FtpostResult<Self> {
        if let Some(bad) = letters.chars().find(|c| !VALID_PERMS.contains(*c)) {
            return Err(FtpostError::Config(format!(
                "no such permission {bad:?} in {letters:?}"
            )));
        }
        Ok(Permissions {
            letters: letters.to_string(),
        })
    }

    pub fn can_change_dir(&self) -> bool {
        self.letters.contains('e')
    }

    pub fn can_list(&self) -> bool {
        self.letters.contains('l')
    }

    pub fn can_store(&self) -> bool {
        self.letters.contains('w')
    }

    pub fn as_str(&self) -> &str {
        &self.letters
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions {
            letters: "elw".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_display() {
        let reply = Reply::new(226, "Transfer complete.");
        assert_eq!(reply.to_string(), "226 Transfer complete.");
        assert!(reply.is_positive());
        assert!(!Reply::new(550, "nope").is_positive());
    }

    #[test]
    fn test_default_permissions() {
        let perms = Permissions::default();
        assert!(perms.can_change_dir());
        assert!(perms.can_list());
        assert!(perms.can_store());
        assert_eq!(perms.as_str(), "elw");
    }

    #[test]
    fn test_parse_rejects_unknown_letter() {
        assert!(Permissions::parse("elwz").is_err());
        let read_only = Permissions::parse("elr").unwrap();
        assert!(!read_only.can_store());
    }
}

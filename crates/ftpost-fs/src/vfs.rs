//! `PostFs`: the write-only, per-account filesystem the FTP engine sees.
//!
//! Exactly one directory exists, the account's home root, and it is always
//! empty. Opening a file beneath it for writing yields an `UploadSink`;
//! every other filesystem operation is refused with `OperationDisabled`.

use std::str::FromStr;
use std::time::SystemTime;

use ftpost_core::{FtpostError, FtpostResult};
use ftpost_upload::{Relay, UploadSink};
use tracing::debug;

use crate::path;

/// How the engine wants a file opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
}

impl OpenMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OpenMode::Read => "rb",
            OpenMode::Write => "wb",
            OpenMode::Append => "ab",
        }
    }
}

impl FromStr for OpenMode {
    type Err = FtpostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "r" | "rb" => Ok(OpenMode::Read),
            "w" | "wb" => Ok(OpenMode::Write),
            "a" | "ab" => Ok(OpenMode::Append),
            other => Err(FtpostError::disabled(format!("open mode {other}"))),
        }
    }
}

/// Metadata an adapter backed by real storage would report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modified: SystemTime,
    pub is_dir: bool,
}

/// The filesystem surface the protocol engine drives. Paths passed in are
/// filesystem paths (see `ftp_to_fs`) unless the parameter says otherwise.
pub trait FilesystemAdapter: Send + Sync {
    /// Filesystem path of the account's home directory.
    fn root(&self) -> &str;
    /// Current working directory, as an FTP path.
    fn cwd(&self) -> &str;

    fn ftp_to_fs(&self, ftp_path: &str) -> String;
    fn fs_to_ftp(&self, fs_path: &str) -> String;
    fn path_is_valid(&self, path: &str) -> bool;

    fn open(&self, path: &str, mode: OpenMode) -> FtpostResult<UploadSink>;
    fn create_temp_file(&self) -> FtpostResult<UploadSink>;

    fn chdir(&mut self, path: &str) -> FtpostResult<()>;
    fn mkdir(&self, path: &str) -> FtpostResult<()>;
    fn list_directory(&self, path: &str) -> FtpostResult<Vec<String>>;
    fn rmdir(&self, path: &str) -> FtpostResult<()>;
    fn remove(&self, path: &str) -> FtpostResult<()>;
    fn rename(&self, src: &str, dst: &str) -> FtpostResult<()>;
    fn chmod(&self, path: &str, mode: u32) -> FtpostResult<()>;
    fn stat(&self, path: &str) -> FtpostResult<FileStat>;
    fn lstat(&self, path: &str) -> FtpostResult<FileStat>;
    fn read_link(&self, path: &str) -> FtpostResult<String>;
    fn get_size(&self, path: &str) -> FtpostResult<u64>;
    fn get_modified_time(&self, path: &str) -> FtpostResult<SystemTime>;

    fn is_file(&self, path: &str) -> bool;
    fn is_directory(&self, path: &str) -> bool;
    fn link_exists(&self, path: &str) -> bool;
    fn resolve(&self, path: &str) -> String;
}

/// Hands each authenticated session its own adapter.
pub trait FilesystemProvider: Send + Sync {
    fn for_account(&self, home: &str) -> Box<dyn FilesystemAdapter>;
}

impl FilesystemProvider for Relay {
    fn for_account(&self, home: &str) -> Box<dyn FilesystemAdapter> {
        Box::new(PostFs::new(home, self.clone()))
    }
}

pub struct PostFs {
    account: String,
    root: String,
    cwd: String,
    relay: Relay,
}

impl PostFs {
    /// A filesystem rooted at `/<home>`. Uploads are filed under `home`
    /// verbatim.
    pub fn new(home: &str, relay: Relay) -> Self {
        PostFs {
            account: home.to_string(),
            root: path::normalize(&format!("/{home}")),
            cwd: "/".into(),
            relay,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }
}

impl FilesystemAdapter for PostFs {
    fn root(&self) -> &str {
        &self.root
    }

    fn cwd(&self) -> &str {
        &self.cwd
    }

    fn ftp_to_fs(&self, ftp_path: &str) -> String {
        let ftp_path = path::normalize(&path::join(&self.cwd, ftp_path));
        if ftp_path == "/" {
            self.root.clone()
        } else if self.root == "/" {
            ftp_path
        } else {
            format!("{}{ftp_path}", self.root)
        }
    }

    fn fs_to_ftp(&self, fs_path: &str) -> String {
        let fs_path = path::normalize(&path::join(&self.root, fs_path));
        if !path::is_contained(&self.root, &fs_path) {
            return "/".into();
        }
        let rest = if self.root == "/" {
            fs_path.as_str()
        } else {
            &fs_path[self.root.len()..]
        };
        if rest.is_empty() {
            "/".into()
        } else {
            rest.to_string()
        }
    }

    fn path_is_valid(&self, path: &str) -> bool {
        path::is_contained(&self.root, path)
    }

    fn open(&self, path: &str, mode: OpenMode) -> FtpostResult<UploadSink> {
        if mode != OpenMode::Write {
            return Err(FtpostError::disabled(format!("open mode {}", mode.as_str())));
        }
        let normalized = path::normalize(path);
        let (parent, filename) = path::split(&normalized);
        // Only the home root exists, so a file can only live directly in it.
        if parent != self.root || filename.is_empty() || filename == ".." {
            return Err(FtpostError::disabled(format!("open {normalized}")));
        }
        debug!(account = %self.account(), file = %filename, "upload sink opened");
        Ok(self.relay.sink(self.account(), filename))
    }

    fn create_temp_file(&self) -> FtpostResult<UploadSink> {
        Err(FtpostError::disabled("mkstemp"))
    }

    fn chdir(&mut self, path: &str) -> FtpostResult<()> {
        self.cwd = self.fs_to_ftp(path);
        Ok(())
    }

    fn mkdir(&self, _path: &str) -> FtpostResult<()> {
        Err(FtpostError::disabled("mkdir"))
    }

    fn list_directory(&self, _path: &str) -> FtpostResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn rmdir(&self, _path: &str) -> FtpostResult<()> {
        Err(FtpostError::disabled("rmdir"))
    }

    fn remove(&self, _path: &str) -> FtpostResult<()> {
        Err(FtpostError::disabled("remove"))
    }

    fn rename(&self, _src: &str, _dst: &str) -> FtpostResult<()> {
        Err(FtpostError::disabled("rename"))
    }

    fn chmod(&self, _path: &str, _mode: u32) -> FtpostResult<()> {
        Err(FtpostError::disabled("chmod"))
    }

    fn stat(&self, _path: &str) -> FtpostResult<FileStat> {
        Err(FtpostError::disabled("stat"))
    }

    fn lstat(&self, _path: &str) -> FtpostResult<FileStat> {
        Err(FtpostError::disabled("lstat"))
    }

    fn read_link(&self, _path: &str) -> FtpostResult<String> {
        Err(FtpostError::disabled("readlink"))
    }

    fn get_size(&self, _path: &str) -> FtpostResult<u64> {
        Err(FtpostError::disabled("getsize"))
    }

    fn get_modified_time(&self, _path: &str) -> FtpostResult<SystemTime> {
        Err(FtpostError::disabled("getmtime"))
    }

    fn is_file(&self, _path: &str) -> bool {
        false
    }

    fn is_directory(&self, path: &str) -> bool {
        path == self.root
    }

    fn link_exists(&self, _path: &str) -> bool {
        false
    }

    fn resolve(&self, path: &str) -> String {
        path.to_string()
    }
}

//! ftpost-fs: the write-only virtual filesystem and transfer completion hook
//!
//! The FTP engine sees a normal filesystem adapter. Behind it, the only
//! thing that can happen is an upload into the account's home root, which
//! becomes an `UploadSink` and, once the transfer finishes, an HTTP POST.

pub mod completion;
pub mod path;
pub mod vfs;

pub use completion::{TransferCompletionHook, TransferState};
pub use vfs::{FileStat, FilesystemAdapter, FilesystemProvider, OpenMode, PostFs};

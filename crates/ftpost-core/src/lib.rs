pub mod config;
pub mod error;
pub mod types;

pub use error::{FtpostError, FtpostResult};
pub use types::{Permissions, Reply};

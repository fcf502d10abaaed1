//! ftpost-upload: upload sinks that relay each finished file as one HTTP POST

pub mod health;
pub mod multipart;
pub mod sink;
pub mod staging;
pub mod upstream;

pub use health::check_reachable;
pub use sink::{Relay, UploadSink};
pub use staging::{StagedBody, StagingBuffer};
pub use upstream::{Endpoint, HttpUpstream, RelayRequest, RelayResponse, Upstream};

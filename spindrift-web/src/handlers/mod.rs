//! HTTP handlers for the streaming gateway.

pub mod hls;
pub mod range;
pub mod streams;

pub use hls::serve_hls_file;
pub use streams::{create_stream, health, stream_playlist, stream_status};

//! Spindrift Web - the gateway's HTTP surface
//!
//! Routes, JSON payloads and Range-aware file serving over the stream
//! coordinator. The HTTP layer never sees internal error kinds; it reads
//! the registry's `(status, error_message)` pair and the files on disk.

#![deny(missing_docs)]
#![deny(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::too_many_lines)]

pub mod handlers;
pub mod server;

pub use server::{AppState, build_router, run_server};

//! Arbor Server
//!
//! Wraps the engine behind the length-prefixed TCP protocol: one
//! handler thread per connection, one process-wide engine lock, and a
//! background persister draining queued writes to disk.

pub mod config;
pub mod handler;
pub mod server;
pub mod stats;

pub use config::{ServerOptions, DEFAULT_EXTERNAL_PORT, DEFAULT_INTERNAL_PORT};
pub use handler::parse_query;
pub use server::Server;
pub use stats::{ServerStats, StatsHandle};

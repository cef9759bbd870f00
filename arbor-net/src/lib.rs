//! Arbor Net
//!
//! The wire protocol shared by every component (4-byte big-endian
//! length-prefixed UTF-8 frames) and the client library that speaks it.
//!
//! # Example
//!
//! ```rust,ignore
//! use arbor_net::Client;
//!
//! let client = Client::new("localhost", 9999);
//! client.set(&["devbot", "events"], &serde_json::json!({"kind": "wake"}))?;
//! let events = client.get(&["devbot", "events"])?;
//! client.append(&["devbot", "log"], &["woke up"])?;
//! ```

pub mod client;
pub mod wire;

pub use client::{Client, ClientError};
pub use wire::{read_frame, read_frame_timeout, write_frame, NetError, MID_FRAME_TIMEOUT};

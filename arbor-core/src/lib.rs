//! Arbor Core
//!
//! A schema-less, JSON-shaped hierarchical key/value store:
//! - strings, sequences and nested mappings
//! - references to other keys and symbolic links at any level
//! - arbitrary depth indexing and assignment
//! - a memo of rendered replies for side-effect-free reads
//! - deferred, compressed snapshot persistence
//!
//! The engine is single-threaded from its own point of view; callers
//! (the server, the node's internal server) serialize every query
//! behind one `parking_lot::Mutex<ServerDb>`.
//!
//! # Example
//!
//! ```rust
//! use arbor_core::{Db, QueryFlags, ServerDb};
//!
//! let mut db = ServerDb::from_db(Db::empty("/tmp/example-db.json"));
//! db.query_args(QueryFlags::default(), &["apple", "=", "sauce"]);
//! assert_eq!(db.query_args(QueryFlags::default(), &["apple"]), "sauce\n");
//!
//! // stored references are followed transparently
//! db.query_args(QueryFlags::default(), &["favorite", "=", "!apple"]);
//! assert_eq!(db.query_args(QueryFlags::default(), &["favorite"]), "sauce\n");
//! ```

pub mod engine;
pub mod error;
pub mod interpret;
pub mod persist;
pub mod value;

// Re-export main types at crate root
pub use engine::{Db, QueryFlags, ServerDb};
pub use error::DbError;
pub use interpret::{contains_write_op, QueryCtx, MAX_REFERENCE_DEPTH, OPERATORS, READ_OPS, WRITE_OPS};
pub use persist::Persister;
pub use value::Value;

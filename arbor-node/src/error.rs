//! Node-layer errors. These stay inside the node's background threads
//! and logs; external clients never see them.

use arbor_core::DbError;
use arbor_net::ClientError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("could not load database: {0}")]
    Db(#[from] DbError),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("local server unavailable: {0}")]
    Local(ClientError),

    /// The initial connection to a peer failed; the peer returns to the
    /// pending set.
    #[error("peer connection failed: {0}")]
    PeerCreateFailed(String),

    /// A query against a previously connected peer failed; recovery
    /// takes over.
    #[error("query against connected peer {0} failed")]
    FailedQuery(String),
}

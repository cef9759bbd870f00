//! Write Forwarder
//!
//! A single background thread drains the bounded forward queue and
//! re-sends each write-bearing argument vector to every currently known
//! peer, prefixed with `--node` so recipients execute without
//! forwarding further. Best-effort: a failed send schedules the peer
//! for recovery and is otherwise swallowed.

use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use arbor_net::Client;
use tracing::{debug, warn};

use crate::error::NodeError;
use crate::node::Shared;
use crate::peers;

/// The queue is bounded; overflow drops the vector with a warning
/// rather than growing without limit.
pub(crate) const QUEUE_CAPACITY: usize = 256;

const IDLE_WAIT: Duration = Duration::from_millis(250);

pub(crate) fn run(shared: Arc<Shared>, queue: Receiver<Vec<String>>) {
    while shared.running.load(Ordering::Relaxed) {
        let vector = match queue.recv_timeout(IDLE_WAIT) {
            Ok(vector) => vector,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let targets: Vec<(String, Arc<Client>)> = shared
            .state
            .lock()
            .peers
            .iter()
            .map(|(identity, peer)| (identity.clone(), peer.client.clone()))
            .collect();
        if targets.is_empty() {
            continue;
        }

        let mut message = Vec::with_capacity(vector.len() + 1);
        message.push("--node".to_string());
        message.extend(vector);

        for (identity, client) in targets {
            match client.query_raw(&message) {
                Ok(_) => debug!(peer = %identity, "write forwarded"),
                Err(err) => {
                    let failure = NodeError::FailedQuery(identity.clone());
                    warn!(%failure, cause = %err, "forward failed");
                    peers::recover(&shared, &identity);
                }
            }
        }
    }
}

//! Peer Lifecycle
//!
//! A peer's state is where it lives: an address in the pending set is
//! waiting for a connection attempt, an entry in the peers map holds a
//! live connection, and any failure moves the address back from the
//! map to the pending set so the next monitor tick retries. The
//! monitor thread does two things per tick: pull every connected
//! peer's own peer map (transitive discovery) and attempt a connection
//! to every pending address.
//!
//! On first contact with a peer whose startup stamp is older, the local
//! node adopts the peer's entire tree (preserving its own `internal`
//! subtree) and takes over the peer's startup stamp. Winner selection
//! is that single scalar: re-merging partitioned clusters can silently
//! lose writes.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arbor_net::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::NodeError;
use crate::node::{Shared, PEER_REPLY_TIMEOUT};

/// A connected peer: its recorded address plus the client that talks
/// to it.
pub struct Peer {
    pub identity: String,
    pub host: String,
    pub port: u16,
    pub client: Arc<Client>,
}

const MONITOR_TICK_SLICE: Duration = Duration::from_millis(250);
const MONITOR_SLICES: u32 = 8;

/// Discovery and recovery loop, ticking every couple of seconds.
pub(crate) fn monitor(shared: Arc<Shared>) {
    while shared.running.load(Ordering::Relaxed) {
        for _ in 0..MONITOR_SLICES {
            if !shared.running.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(MONITOR_TICK_SLICE);
        }
        pull_peer_maps(&shared);
        connect_pending(&shared);
    }
}

/// Ask every connected peer for its peer map and schedule any unknown
/// entries.
fn pull_peer_maps(shared: &Shared) {
    let snapshot: Vec<(String, Arc<Client>)> = shared
        .state
        .lock()
        .peers
        .iter()
        .map(|(identity, peer)| (identity.clone(), peer.client.clone()))
        .collect();

    for (identity, client) in snapshot {
        match client.get(&["internal", "peers"]) {
            Ok(Some(serde_json::Value::Object(records))) => {
                let mut state = shared.state.lock();
                for (peer_id, record) in records {
                    if peer_id == shared.identity || state.peers.contains_key(&peer_id) {
                        continue;
                    }
                    let host = record.get("host").and_then(|v| v.as_str());
                    let port = record
                        .get("port")
                        .and_then(|v| v.as_str())
                        .and_then(|p| p.parse::<u16>().ok());
                    if let (Some(host), Some(port)) = (host, port) {
                        if state.pending.insert((host.to_string(), port)) {
                            debug!(peer = %peer_id, %host, port, "peer discovered via gossip");
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                let failure = NodeError::FailedQuery(identity.clone());
                warn!(%failure, cause = %err, "peer map pull failed");
                recover(shared, &identity);
            }
        }
    }
}

/// Try to connect every pending address once. Failures go back in the
/// set for the next tick.
fn connect_pending(shared: &Shared) {
    let pending: Vec<(String, u16)> = {
        let mut state = shared.state.lock();
        state.pending.drain().collect()
    };

    for (host, port) in pending {
        match connect_peer(shared, &host, port) {
            Ok(()) => {}
            Err(err) => {
                debug!(%host, port, %err, "peer connection failed, will retry");
                shared.state.lock().pending.insert((host, port));
            }
        }
    }
}

/// One connection attempt: handshake on the peer's identity, merge when
/// joining an older cluster member, record the peer, and introduce
/// ourselves so the peer connects back.
fn connect_peer(shared: &Shared, host: &str, port: u16) -> Result<(), NodeError> {
    debug!(%host, port, "contacting peer");
    let client = Arc::new(Client::new(host, port).with_reply_timeout(PEER_REPLY_TIMEOUT));

    let identity = client
        .get_string(&["internal", "local", "identity"])
        .map_err(|err| NodeError::PeerCreateFailed(err.to_string()))?
        .ok_or_else(|| NodeError::PeerCreateFailed("peer has no identity".to_string()))?;

    if identity == shared.identity {
        // an address from --connect or gossip that points back at us
        return Ok(());
    }
    if shared.state.lock().peers.contains_key(&identity) {
        return Ok(());
    }

    merge_if_older(shared, &client)?;

    let peer = Peer {
        identity: identity.clone(),
        host: host.to_string(),
        port,
        client: client.clone(),
    };
    shared.state.lock().peers.insert(identity.clone(), peer);

    if let Err(err) = shared.local.set(
        &["internal", "peers", identity.as_str()],
        &json!({
            "identity": identity.as_str(),
            "host": host,
            "port": port.to_string(),
        }),
    ) {
        warn!(peer = %identity, %err, "could not record peer");
    }

    // mutual introduction: the peer schedules us and connects back
    let introduction = vec![
        "--connect".to_string(),
        shared.host.clone(),
        shared.external_port.to_string(),
    ];
    if let Err(err) = client.query_raw(&introduction) {
        warn!(peer = %identity, %err, "introduction failed");
    }

    info!(peer = %identity, %host, port, "peer connected");
    Ok(())
}

/// Merge-on-join: adopt the tree of a peer whose startup stamp is
/// strictly older, preserving only the local `internal` subtree, then
/// take over the peer's startup stamp. Adopting makes the stamps equal,
/// so reconnects do not merge again.
fn merge_if_older(shared: &Shared, peer: &Client) -> Result<(), NodeError> {
    let peer_startup = peer
        .get_string(&["internal", "local", "startup"])
        .map_err(|err| NodeError::PeerCreateFailed(err.to_string()))?;
    let local_startup = shared
        .local
        .get_string(&["internal", "local", "startup"])
        .map_err(NodeError::Local)?;

    let (Some(peer_startup), Some(local_startup)) = (peer_startup, local_startup) else {
        return Ok(());
    };
    let (Ok(theirs), Ok(ours)) = (peer_startup.parse::<i64>(), local_startup.parse::<i64>())
    else {
        return Ok(());
    };
    if theirs >= ours {
        return Ok(());
    }

    let tree = peer
        .get(&[])
        .map_err(|err| NodeError::PeerCreateFailed(err.to_string()))?;
    let Some(serde_json::Value::Object(mut tree)) = tree else {
        return Ok(());
    };

    tree.remove("internal");
    let local_internal = shared
        .local
        .get(&["internal"])
        .map_err(NodeError::Local)?
        .unwrap_or_else(|| json!({}));
    tree.insert("internal".to_string(), local_internal);

    shared
        .local
        .set(&[], &serde_json::Value::Object(tree))
        .map_err(NodeError::Local)?;
    shared
        .local
        .set(
            &["internal", "local", "startup"],
            &json!(peer_startup.as_str()),
        )
        .map_err(NodeError::Local)?;

    info!(startup = %peer_startup, "adopted state from older cluster member");
    Ok(())
}

/// A failed peer drops out of the active map, loses its stored record
/// and re-enters the pending set for the next tick.
pub(crate) fn recover(shared: &Shared, identity: &str) {
    let removed = {
        let mut state = shared.state.lock();
        let peer = state.peers.remove(identity);
        peer.map(|peer| {
            state.pending.insert((peer.host.clone(), peer.port));
            (peer.host, peer.port)
        })
    };

    if let Some((host, port)) = removed {
        let record = vec![
            "internal".to_string(),
            "peers".to_string(),
            identity.to_string(),
            "--del".to_string(),
        ];
        if let Err(err) = shared.local.query_raw(&record) {
            warn!(%err, "could not drop peer record");
        }
        warn!(peer = %identity, %host, port, "peer lost, scheduled for recovery");
    }
}

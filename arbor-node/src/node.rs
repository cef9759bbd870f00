//! Cluster Node
//!
//! A node embeds a loopback-only [`Server`] for the actual engine work
//! and listens externally with its own handler. Write-bearing queries
//! answered locally are enqueued for best-effort forwarding to every
//! known peer; a monitor thread discovers peers transitively and
//! reconnects the failed ones.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arbor_core::{Persister, ServerDb};
use arbor_net::Client;
use arbor_server::{Server, ServerOptions};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::NodeError;
use crate::peers::Peer;
use crate::{forwarder, handler, peers};

/// How long a peer query may wait on a reply before the peer is treated
/// as dead.
pub(crate) const PEER_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Peer map, pending addresses and the external socket registry, all
/// guarded by the node mutex (distinct from the engine mutex).
#[derive(Default)]
pub(crate) struct NodeState {
    pub peers: HashMap<String, Peer>,
    pub pending: HashSet<(String, u16)>,
    pub sockets: HashMap<u64, TcpStream>,
}

/// Everything the node's threads share.
pub(crate) struct Shared {
    /// Externally advertised address, sent to peers with `--connect`.
    pub host: String,
    pub external_port: u16,
    /// Stable UUID identity, persisted under `internal/local`.
    pub identity: String,
    /// Management client to the internal server.
    pub local: Client,
    pub state: Mutex<NodeState>,
    pub forward_tx: SyncSender<Vec<String>>,
    pub running: AtomicBool,
}

pub struct Node {
    shared: Arc<Shared>,
    internal: Server,
    persister: Option<Persister>,
    external_addr: SocketAddr,
    accept_handle: Option<JoinHandle<()>>,
    forwarder_handle: Option<JoinHandle<()>>,
    monitor_handle: Option<JoinHandle<()>>,
}

impl Node {
    /// Boot the whole stack: internal server, persister, identity
    /// bootstrap, forwarder, monitor and the external listener.
    pub fn start(options: &ServerOptions) -> Result<Node, NodeError> {
        let db = ServerDb::open(&options.config)?;
        let db = Arc::new(Mutex::new(db));

        let internal = Server::start("127.0.0.1", options.local_port, db, false)?;
        let persister = if options.stateless {
            None
        } else {
            Some(Persister::spawn(internal.db()))
        };
        let local = Client::localhost(internal.port());

        let listener = TcpListener::bind((options.host.as_str(), options.port))?;
        let external_addr = listener.local_addr()?;

        let identity = bootstrap_identity(&local, &options.host, external_addr.port())?;
        info!(%identity, addr = %external_addr, "node starting");

        let (forward_tx, forward_rx) = mpsc::sync_channel(forwarder::QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            host: options.host.clone(),
            external_port: external_addr.port(),
            identity,
            local,
            state: Mutex::new(NodeState::default()),
            forward_tx,
            running: AtomicBool::new(true),
        });

        schedule_stored_peers(&shared)?;

        let forwarder_handle = {
            let shared = shared.clone();
            thread::spawn(move || forwarder::run(shared, forward_rx))
        };
        let monitor_handle = {
            let shared = shared.clone();
            thread::spawn(move || peers::monitor(shared))
        };
        let accept_handle = {
            let shared = shared.clone();
            thread::spawn(move || accept_loop(listener, shared))
        };

        Ok(Node {
            shared,
            internal,
            persister,
            external_addr,
            accept_handle: Some(accept_handle),
            forwarder_handle: Some(forwarder_handle),
            monitor_handle: Some(monitor_handle),
        })
    }

    /// The externally reachable address.
    pub fn local_addr(&self) -> SocketAddr {
        self.external_addr
    }

    pub fn port(&self) -> u16 {
        self.external_addr.port()
    }

    pub fn identity(&self) -> &str {
        &self.shared.identity
    }

    /// Identities of the currently connected peers.
    pub fn connected_peers(&self) -> Vec<String> {
        self.shared.state.lock().peers.keys().cloned().collect()
    }

    /// Block until the external accept loop exits.
    pub fn join(&mut self) {
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
    }

    /// Cooperative shutdown: clear the running flag, force-close
    /// external client sockets, wake the accept loop and stop every
    /// background thread and the embedded server.
    pub fn teardown(&mut self) {
        if !self.shared.running.swap(false, Ordering::Relaxed) {
            return;
        }

        for (_, sock) in self.shared.state.lock().sockets.drain() {
            let _ = sock.shutdown(Shutdown::Both);
        }
        let wake = SocketAddr::from((Ipv4Addr::LOCALHOST, self.external_addr.port()));
        let _ = TcpStream::connect(wake);

        self.join();
        if let Some(handle) = self.forwarder_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.monitor_handle.take() {
            let _ = handle.join();
        }

        if let Some(mut persister) = self.persister.take() {
            persister.stop();
        }
        self.internal.teardown();
        debug!(addr = %self.external_addr, "node torn down");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Ensure `internal/local` holds a stable identity, the advertised
/// address and a fresh startup stamp (seconds since epoch).
fn bootstrap_identity(local: &Client, host: &str, port: u16) -> Result<String, NodeError> {
    let identity = local
        .get_string(&["internal", "local", "identity"])
        .map_err(NodeError::Local)?
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let startup = chrono::Utc::now().timestamp().to_string();
    local
        .set(
            &["internal", "local"],
            &json!({
                "identity": identity.as_str(),
                "host": host,
                "port": port.to_string(),
                "startup": startup,
            }),
        )
        .map_err(NodeError::Local)?;
    Ok(identity)
}

/// Peers remembered on disk from an earlier run re-enter the pending
/// set; the monitor reconnects them.
fn schedule_stored_peers(shared: &Shared) -> Result<(), NodeError> {
    let stored = shared
        .local
        .get(&["internal", "peers"])
        .map_err(NodeError::Local)?;
    let Some(serde_json::Value::Object(records)) = stored else {
        return Ok(());
    };

    let mut state = shared.state.lock();
    for (identity, record) in records {
        if identity == shared.identity {
            continue;
        }
        let host = record.get("host").and_then(|v| v.as_str());
        let port = record
            .get("port")
            .and_then(|v| v.as_str())
            .and_then(|p| p.parse::<u16>().ok());
        if let (Some(host), Some(port)) = (host, port) {
            debug!(peer = %identity, %host, port, "stored peer scheduled");
            state.pending.insert((host.to_string(), port));
        }
    }
    Ok(())
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut next_id: u64 = 0;
    for stream in listener.incoming() {
        if !shared.running.load(Ordering::Relaxed) {
            break;
        }
        match stream {
            Ok(stream) => {
                next_id += 1;
                let id = next_id;
                if let Ok(registered) = stream.try_clone() {
                    shared.state.lock().sockets.insert(id, registered);
                }

                let shared = shared.clone();
                thread::spawn(move || {
                    handler::handle_connection(stream, &shared);
                    shared.state.lock().sockets.remove(&id);
                });
            }
            Err(err) => warn!(%err, "failed to accept connection"),
        }
    }
}

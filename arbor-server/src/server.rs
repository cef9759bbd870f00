//! TCP Server
//!
//! An accept loop spawning one handler thread per connection. The
//! server keeps a registry of live client sockets so `teardown()` can
//! force-close them, unblocking handlers stuck in a frame read, then
//! wake the accept loop and join it.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use arbor_core::ServerDb;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::handler;
use crate::stats::{self, StatsHandle};

type SocketRegistry = Arc<Mutex<HashMap<u64, TcpStream>>>;

pub struct Server {
    addr: SocketAddr,
    db: Arc<Mutex<ServerDb>>,
    running: Arc<AtomicBool>,
    clients: SocketRegistry,
    stats: StatsHandle,
    accept_handle: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind and start accepting. Port 0 binds an ephemeral port; read
    /// it back with [`Server::local_addr`].
    pub fn start(
        host: &str,
        port: u16,
        db: Arc<Mutex<ServerDb>>,
        quiet: bool,
    ) -> io::Result<Server> {
        let listener = TcpListener::bind((host, port))?;
        let addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let clients: SocketRegistry = Arc::new(Mutex::new(HashMap::new()));
        let stats = stats::create_stats();

        let accept_handle = {
            let db = db.clone();
            let running = running.clone();
            let clients = clients.clone();
            let stats = stats.clone();
            thread::spawn(move || accept_loop(listener, db, running, clients, stats, quiet))
        };

        info!(%addr, "server listening");
        Ok(Server {
            addr,
            db,
            running,
            clients,
            stats,
            accept_handle: Some(accept_handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn db(&self) -> Arc<Mutex<ServerDb>> {
        self.db.clone()
    }

    pub fn stats(&self) -> StatsHandle {
        self.stats.clone()
    }

    /// Block until the accept loop exits (it only does on teardown).
    pub fn join(&mut self) {
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
    }

    /// Cooperative shutdown: clear the running flag, force-close every
    /// registered client socket and wake the accept loop.
    pub fn teardown(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        for (_, sock) in self.clients.lock().drain() {
            let _ = sock.shutdown(Shutdown::Both);
        }
        let wake = SocketAddr::from((Ipv4Addr::LOCALHOST, self.addr.port()));
        let _ = TcpStream::connect(wake);
        self.join();

        let stats = self.stats.lock();
        info!(
            connections = stats.connections_total(),
            queries = stats.queries_total(),
            errors = stats.errors_total(),
            uptime_ms = stats.uptime_ms(),
            "server torn down"
        );
        debug!(addr = %self.addr, "accept loop joined");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn accept_loop(
    listener: TcpListener,
    db: Arc<Mutex<ServerDb>>,
    running: Arc<AtomicBool>,
    clients: SocketRegistry,
    stats: StatsHandle,
    quiet: bool,
) {
    let mut next_id: u64 = 0;
    for stream in listener.incoming() {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        match stream {
            Ok(stream) => {
                next_id += 1;
                let id = next_id;
                if let Ok(registered) = stream.try_clone() {
                    clients.lock().insert(id, registered);
                }
                stats.lock().record_connection();

                let db = db.clone();
                let running = running.clone();
                let clients = clients.clone();
                let stats = stats.clone();
                thread::spawn(move || {
                    handler::handle(stream, db, running, stats, quiet);
                    clients.lock().remove(&id);
                });
            }
            Err(err) => warn!(%err, "failed to accept connection"),
        }
    }
}

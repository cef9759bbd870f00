//! Server binary: load the snapshot, start the persister and serve
//! queries until interrupted. Ctrl+C drives the cooperative teardown
//! path so the last queued snapshot write is flushed.

use std::env;
use std::process::ExitCode;
use std::sync::{mpsc, Arc};

use arbor_core::{Persister, ServerDb};
use arbor_server::{Server, ServerOptions};
use parking_lot::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let options = match ServerOptions::from_args(env::args().skip(1)) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let db = match ServerDb::open(&options.config) {
        Ok(db) => db,
        Err(err) => {
            error!(config = %options.config.display(), %err, "could not load database");
            return ExitCode::FAILURE;
        }
    };
    let db = Arc::new(Mutex::new(db));

    let mut persister = if options.stateless {
        info!("stateless mode, snapshot writes disabled");
        None
    } else {
        Some(Persister::spawn(db.clone()))
    };

    let mut server = match Server::start(&options.host, options.port, db, false) {
        Ok(server) => server,
        Err(err) => {
            error!(%err, "could not bind server");
            return ExitCode::FAILURE;
        }
    };

    info!(
        config = %options.config.display(),
        "serving on {}:{}", options.host, options.port
    );

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    }) {
        warn!(%err, "could not install the interrupt handler");
        server.join();
        return ExitCode::SUCCESS;
    }

    let _ = stop_rx.recv();
    info!("interrupt received, shutting down");
    server.teardown();
    if let Some(persister) = persister.as_mut() {
        persister.stop();
    }
    ExitCode::SUCCESS
}

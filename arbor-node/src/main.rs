//! Node binary: an external listener on `--port`, the internal engine
//! server on `--local-port`, and the peer machinery in between.
//! Ctrl+C drives the node's cooperative teardown.

use std::env;
use std::process::ExitCode;
use std::sync::mpsc;

use arbor_node::Node;
use arbor_server::ServerOptions;
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

    let mut node = match Node::start(&options) {
        Ok(node) => node,
        Err(err) => {
            error!(%err, "could not start node");
            return ExitCode::FAILURE;
        }
    };

    info!(
        identity = %node.identity(),
        "node serving on {}:{} (internal {})",
        options.host, node.port(), options.local_port
    );

    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    }) {
        warn!(%err, "could not install the interrupt handler");
        node.join();
        return ExitCode::SUCCESS;
    }

    let _ = stop_rx.recv();
    info!("interrupt received, shutting down");
    node.teardown();
    ExitCode::SUCCESS
}

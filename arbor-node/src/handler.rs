//! External Connection Handler
//!
//! Routes each request by its first token:
//! - `--node <rest…>`: a forwarded peer message; execute locally, reply,
//!   never forward again (this is what keeps the mesh cycle-free)
//! - `--connect <host> <port>`: schedule a peer, acknowledge, execute
//!   nothing
//! - anything else: execute locally, reply, and enqueue for forwarding
//!   when the vector contains a write operator

use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::mpsc::TrySendError;

use arbor_core::contains_write_op;
use arbor_net::wire;
use tracing::{debug, info, warn};

use crate::node::Shared;

pub(crate) fn handle_connection(mut stream: TcpStream, shared: &Shared) {
    loop {
        let frame = match wire::read_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => break,
        };
        if !shared.running.load(Ordering::Relaxed) {
            break;
        }

        let tokens: Vec<String> = frame
            .split('\n')
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect();
        let reply = route(shared, tokens);

        if wire::write_frame(&mut stream, &reply).is_err() {
            break;
        }
    }
}

fn route(shared: &Shared, mut tokens: Vec<String>) -> String {
    match tokens.first().map(String::as_str) {
        Some("--node") => {
            tokens.remove(0);
            debug!("executing forwarded peer message");
            execute_local(shared, &tokens)
        }
        Some("--connect") => {
            let host = tokens.get(1).cloned();
            let port = tokens.get(2).and_then(|raw| raw.parse::<u16>().ok());
            match (host, port) {
                (Some(host), Some(port)) => {
                    info!(%host, port, "peer scheduled via --connect");
                    shared.state.lock().pending.insert((host, port));
                    "\n".to_string()
                }
                _ => "error: --connect requires a host and a port\n".to_string(),
            }
        }
        _ => {
            let reply = execute_local(shared, &tokens);
            if contains_write_op(&tokens) {
                match shared.forward_tx.try_send(tokens) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("forward queue full, write not forwarded");
                    }
                    Err(TrySendError::Disconnected(_)) => {}
                }
            }
            reply
        }
    }
}

fn execute_local(shared: &Shared, tokens: &[String]) -> String {
    match shared.local.query_raw(tokens) {
        Ok(reply) => reply,
        Err(err) => {
            warn!(%err, "internal server query failed");
            "error: internal server unavailable\n".to_string()
        }
    }
}

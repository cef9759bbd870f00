//! Connection Handler
//!
//! One handler per accepted connection. Each loop iteration reads a
//! frame, takes the engine-wide lock, runs the query and sends the
//! rendered reply (results and errors travel the same way). Any framing
//! or write failure ends the handler and closes the socket.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_core::{QueryFlags, ServerDb};
use arbor_net::wire;
use parking_lot::Mutex;
use tracing::info;

use crate::stats::StatsHandle;

pub fn handle(
    mut stream: TcpStream,
    db: Arc<Mutex<ServerDb>>,
    running: Arc<AtomicBool>,
    stats: StatsHandle,
    quiet: bool,
) {
    loop {
        let frame = match wire::read_frame(&mut stream) {
            Ok(Some(frame)) => frame,
            Ok(None) | Err(_) => break,
        };
        if !running.load(Ordering::Relaxed) {
            break;
        }

        let (flags, args) = parse_query(&frame);
        let reply = {
            let mut db = db.lock();
            let start = Instant::now();
            let reply = db.query(flags, &args);
            if !quiet {
                log_query(&db, start.elapsed(), &args);
            }
            reply
        };

        {
            let mut stats = stats.lock();
            stats.record_query();
            if reply.starts_with("error: ") {
                stats.record_error();
            }
        }

        if wire::write_frame(&mut stream, &reply).is_err() {
            break;
        }
    }
}

/// Split the frame payload into tokens and consume the leading
/// per-query flags: `-c`/`--context` and `-s`/`--strict`.
pub fn parse_query(payload: &str) -> (QueryFlags, Vec<String>) {
    let mut args: Vec<String> = payload
        .split('\n')
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect();

    let mut flags = QueryFlags::default();
    loop {
        match args.first().map(String::as_str) {
            Some("-c") | Some("--context") => {
                flags.add_context = true;
                args.remove(0);
            }
            Some("-s") | Some("--strict") => {
                flags.strict = true;
                args.remove(0);
            }
            _ => break,
        }
    }
    (flags, args)
}

/// Per-query log line: duration, cache size, a 70-character view of the
/// argument vector and the first four characters of the node identity
/// when one is stored.
fn log_query(db: &ServerDb, elapsed: Duration, args: &[String]) {
    let mut shown = args.join(" ");
    if shown.len() > 70 {
        shown = shown.chars().take(70).collect();
    }
    let identity: String = db.identity().unwrap_or_default().chars().take(4).collect();
    info!(
        "{:.5} {:2} {:4} {}",
        elapsed.as_secs_f64(),
        db.cache_len(),
        identity,
        shown
    );
}

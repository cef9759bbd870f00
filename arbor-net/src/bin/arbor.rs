//! Thin command-line shell around the client library.
//!
//! Usage:
//!   arbor server events --keys          query the default server
//!   arbor -h remote.host server ...     query another host
//!   arbor some key --edit               round-trip the value through $EDITOR

use std::env;
use std::fs;
use std::io::{self, IsTerminal, Read, Write};
use std::process::{Command, ExitCode};

use arbor_net::{Client, ClientError};

fn main() -> ExitCode {
    let mut args: Vec<String> = env::args().skip(1).collect();

    let mut host = env::var("AP_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port: u16 = env::var("AP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(9999);

    if args.len() >= 2 && (args[0] == "-h" || args[0] == "--host") {
        host = args[1].clone();
        args.drain(..2);
    }

    // piped input becomes the final token
    if !io::stdin().is_terminal() {
        let mut piped = String::new();
        if io::stdin().read_to_string(&mut piped).is_ok() && !piped.is_empty() {
            args.push(piped);
        }
    }

    let edit_mode = matches!(args.last().map(String::as_str), Some("-e") | Some("--edit"));

    let client = Client::new(host, port);
    let result = match client.query(&args) {
        Ok(lines) => lines.join("\n"),
        Err(ClientError::Db(line)) => {
            eprintln!("{line}");
            return ExitCode::FAILURE;
        }
        Err(_) => {
            eprintln!("error: could not connect to server");
            return ExitCode::FAILURE;
        }
    };

    if edit_mode {
        match edit_round_trip(&client, &args, &result) {
            Ok(()) => ExitCode::SUCCESS,
            Err(message) => {
                eprintln!("{message}");
                ExitCode::FAILURE
            }
        }
    } else {
        println!("{result}");
        ExitCode::SUCCESS
    }
}

/// Write the queried JSON to a temp file, let the user edit it, then
/// store the result back with `--set`. Re-opens the editor until the
/// file parses.
fn edit_round_trip(client: &Client, args: &[String], current: &str) -> Result<(), String> {
    let file = tempfile::Builder::new()
        .prefix("arbor-")
        .suffix(".json")
        .tempfile()
        .map_err(|err| format!("error: could not create temp file: {err}"))?;
    fs::write(file.path(), current).map_err(|err| format!("error: {err}"))?;

    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let edited = loop {
        let status = Command::new(&editor)
            .arg(file.path())
            .status()
            .map_err(|err| format!("error: could not launch {editor}: {err}"))?;
        if !status.success() {
            return Err("error: editor exited with a failure".to_string());
        }

        let text = fs::read_to_string(file.path()).map_err(|err| format!("error: {err}"))?;
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) => break value,
            Err(_) => {
                println!("error: file has JSON formatting errors");
                let _ = io::stdout().flush();
            }
        }
    };

    let mut store: Vec<String> = args[..args.len() - 1].to_vec();
    store.push("--set".to_string());
    store.push(edited.to_string());
    client
        .query(&store)
        .map(|_| ())
        .map_err(|err| format!("error: {err}"))
}

//! Client Library
//!
//! A `Client` keeps one optional persistent socket to a server, guarded
//! by a mutex so multiple application threads can share it without
//! interleaving frames. Queries are argument vectors joined by newlines
//! into a single frame; replies come back as rendered lines, or as JSON
//! when `--edit` is appended in interpret mode.

use std::net::TcpStream;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::wire::{self, NetError};

#[derive(Error, Debug)]
pub enum ClientError {
    /// The server replied with an `error: …` line.
    #[error("{0}")]
    Db(String),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error("unable to decode query result: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct Client {
    host: String,
    port: u16,
    reply_timeout: Option<Duration>,
    sock: Mutex<Option<TcpStream>>,
}

impl Client {
    pub fn new(host: impl Into<String>, port: u16) -> Client {
        Client {
            host: host.into(),
            port,
            reply_timeout: None,
            sock: Mutex::new(None),
        }
    }

    pub fn localhost(port: u16) -> Client {
        Client::new("127.0.0.1", port)
    }

    /// Bound the wait for a reply. Peer-to-peer callers use this so a
    /// dead node cannot stall a background thread.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Client {
        self.reply_timeout = Some(timeout);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Drop the cached session; the next query reconnects.
    pub fn close(&self) {
        *self.sock.lock() = None;
    }

    fn connect(&self) -> Result<TcpStream, NetError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn round_trip(&self, stream: &mut TcpStream, args: &[String]) -> Result<String, NetError> {
        wire::write_frame(stream, &args.join("\n"))?;
        match wire::read_frame_timeout(stream, self.reply_timeout)? {
            Some(reply) => Ok(reply),
            None => Err(NetError::Closed),
        }
    }

    /// One frame out, one frame back. A session that went stale under
    /// us gets a single fresh-connection retry.
    pub fn query_raw(&self, args: &[String]) -> Result<String, NetError> {
        let mut guard = self.sock.lock();

        // a cached session may have gone stale underneath us; fall
        // through to one attempt on a fresh socket
        if let Some(stream) = guard.as_mut() {
            if let Ok(reply) = self.round_trip(stream, args) {
                return Ok(reply);
            }
            *guard = None;
        }

        let mut stream = self.connect()?;
        let reply = self.round_trip(&mut stream, args);
        if reply.is_ok() {
            *guard = Some(stream);
        }
        reply
    }

    /// Query returning the reply's non-empty lines; an `error:` first
    /// line is surfaced as [`ClientError::Db`].
    pub fn query(&self, args: &[String]) -> Result<Vec<String>, ClientError> {
        let reply = self.query_raw(args)?;
        let lines: Vec<String> = reply
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if let Some(first) = lines.first() {
            if first.starts_with("error:") {
                return Err(ClientError::Db(first.clone()));
            }
        }
        Ok(lines)
    }

    /// Interpret mode: append `--edit` (unless the query already ends
    /// with it) and parse the reply as JSON. `None` for an empty reply.
    pub fn query_json(&self, args: &[String]) -> Result<Option<serde_json::Value>, ClientError> {
        let mut args = args.to_vec();
        match args.last().map(String::as_str) {
            Some("-e") | Some("--edit") => {}
            _ => args.push("--edit".to_string()),
        }
        let lines = self.query(&args)?;
        if lines.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&lines.join(""))?))
    }

    // ------------------------------------------------------------------
    // Convenience wrappers
    // ------------------------------------------------------------------

    /// Fetch a value; empty values (absent keys render as `{}`) come
    /// back as `None`.
    pub fn get(&self, keys: &[&str]) -> Result<Option<serde_json::Value>, ClientError> {
        Ok(self
            .query_json(&to_args(keys))?
            .filter(|value| !json_is_empty(value)))
    }

    /// `get` for callers that expect a string leaf.
    pub fn get_string(&self, keys: &[&str]) -> Result<Option<String>, ClientError> {
        Ok(self
            .get(keys)?
            .and_then(|value| value.as_str().map(str::to_string)))
    }

    pub fn keys(&self, keys: &[&str]) -> Result<Vec<String>, ClientError> {
        let mut args = to_args(keys);
        args.push("--keys".to_string());
        self.query(&args)
    }

    pub fn set(&self, keys: &[&str], value: &serde_json::Value) -> Result<(), ClientError> {
        let mut args = to_args(keys);
        args.push("--set".to_string());
        args.push(serde_json::to_string(value)?);
        self.query(&args)?;
        Ok(())
    }

    /// Append one or more elements; appending to a string promotes it
    /// to a sequence server-side.
    pub fn append(&self, keys: &[&str], values: &[&str]) -> Result<(), ClientError> {
        let mut args = to_args(keys);
        args.push("+".to_string());
        args.extend(values.iter().map(|v| v.to_string()));
        self.query(&args)?;
        Ok(())
    }

    /// Remove one occurrence of each value from a sequence.
    pub fn remove(&self, keys: &[&str], values: &[&str]) -> Result<(), ClientError> {
        let mut args = to_args(keys);
        args.push("-".to_string());
        args.extend(values.iter().map(|v| v.to_string()));
        self.query(&args)?;
        Ok(())
    }

    pub fn delete(&self, keys: &[&str]) -> Result<(), ClientError> {
        let mut args = to_args(keys);
        args.push("--del".to_string());
        self.query(&args)?;
        Ok(())
    }

    /// Emit and remove: the tail of a sequence, or the whole value.
    pub fn pop(&self, keys: &[&str]) -> Result<Option<String>, ClientError> {
        let mut args = to_args(keys);
        args.push("--pop".to_string());
        Ok(self.query(&args)?.into_iter().next())
    }

    /// Read a value, transform it, write it back.
    pub fn apply<F>(&self, keys: &[&str], transform: F) -> Result<(), ClientError>
    where
        F: FnOnce(Option<serde_json::Value>) -> serde_json::Value,
    {
        let current = self.get(keys)?;
        self.set(keys, &transform(current))
    }
}

fn to_args(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

/// The store treats `""`, `[]` and `{}` as absent.
fn json_is_empty(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

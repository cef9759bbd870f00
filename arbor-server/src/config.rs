//! Binary configuration: command-line flags with environment defaults.
//!
//! `AP_HOST`, `AP_PORT`, `AP_CNFG` and `AP_LORT` provide defaults for
//! `--host`, `--port`, `--config` and `--local-port`.

use std::env;
use std::path::PathBuf;

pub const DEFAULT_EXTERNAL_PORT: u16 = 9999;
pub const DEFAULT_INTERNAL_PORT: u16 = 9998;

/// `~/.db.json`, the conventional snapshot location.
pub fn default_db_path() -> PathBuf {
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".db.json")
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    /// Loopback port of a node's internal server; unused by the plain
    /// server binary.
    pub local_port: u16,
    pub config: PathBuf,
    pub stateless: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            host: env::var("AP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_port("AP_PORT", DEFAULT_EXTERNAL_PORT),
            local_port: env_port("AP_LORT", DEFAULT_INTERNAL_PORT),
            config: env::var("AP_CNFG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_db_path()),
            stateless: false,
        }
    }
}

impl ServerOptions {
    pub fn from_args(args: impl Iterator<Item = String>) -> Result<ServerOptions, String> {
        let mut options = ServerOptions::default();
        let mut args = args;
        while let Some(flag) = args.next() {
            match flag.as_str() {
                "--host" => options.host = required(&mut args, "--host")?,
                "--port" => {
                    options.port = parse_port(&required(&mut args, "--port")?)?;
                }
                "--local-port" => {
                    options.local_port = parse_port(&required(&mut args, "--local-port")?)?;
                }
                "--config" => options.config = PathBuf::from(required(&mut args, "--config")?),
                "--stateless" => options.stateless = true,
                other => {
                    return Err(format!(
                        "unknown argument {other}\n\
                         usage: [--host HOST] [--port PORT] [--local-port PORT] \
                         [--config PATH] [--stateless]"
                    ))
                }
            }
        }
        Ok(options)
    }
}

fn required(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next().ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_port(raw: &str) -> Result<u16, String> {
    raw.parse().map_err(|_| format!("invalid port {raw}"))
}

fn env_port(name: &str, fallback: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(fallback)
}

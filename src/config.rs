// src/config.rs

//! Manages client configuration: defaults, TOML files, connection strings, and validation.

use crate::core::ClientError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

/// The highest logical database index accepted by `SELECT`.
pub const MAX_DATABASE_INDEX: u8 = 15;

/// The RESP version negotiated during the handshake.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RespProtocol {
    /// Plain RESP2 with `AUTH` and `CLIENT SETNAME`.
    #[default]
    Resp2,
    /// RESP3 negotiated through `HELLO 3`.
    Resp3,
}

/// A `host:port` pair.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = ClientError;

    /// Parses `host`, `host:port` or `[v6addr]:port`. A missing port means 6379.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ClientError::InvalidConfig("empty endpoint".into()));
        }
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ClientError::InvalidConfig(format!("invalid endpoint '{s}'")))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p)?,
                None if tail.is_empty() => default_port(),
                None => return Err(ClientError::InvalidConfig(format!("invalid endpoint '{s}'"))),
            };
            return Ok(Endpoint::new(host, port));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => Ok(Endpoint::new(host, parse_port(port)?)),
            // A bare IPv6 address without brackets.
            Some(_) => Ok(Endpoint::new(s, default_port())),
            None => Ok(Endpoint::new(s, default_port())),
        }
    }
}

fn parse_port(s: &str) -> Result<u16, ClientError> {
    s.trim()
        .parse()
        .map_err(|_| ClientError::InvalidConfig(format!("invalid port '{s}'")))
}

/// All options that control how the client connects, pools, and times out.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    #[serde(default)]
    pub protocol: RespProtocol,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Logical database selected after the handshake (0-15).
    #[serde(default)]
    pub database: u8,
    /// Name given to every connection through `CLIENT SETNAME`.
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: usize,
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
    /// Per-command deadline, also used as the pool acquisition deadline.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Idle connections beyond `min_pool_size` are closed after this long.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Maximum number of channels and patterns per subscription connection.
    #[serde(default = "default_subscription_concurrency")]
    pub subscription_concurrency: usize,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
    /// Prepended to every key argument on the wire.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Read replicas as `host:port`; read-only commands are spread across them.
    #[serde(default)]
    pub replicas: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6379
}
fn default_min_pool_size() -> usize {
    1
}
fn default_max_pool_size() -> usize {
    100
}
fn default_command_timeout_ms() -> u64 {
    10_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_idle_timeout_ms() -> u64 {
    20_000
}
fn default_subscription_concurrency() -> usize {
    100
}
fn default_encoding() -> String {
    "utf-8".to_string()
}
fn default_receive_buffer_size() -> usize {
    16 * 1024
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            protocol: RespProtocol::default(),
            host: default_host(),
            port: default_port(),
            user: None,
            password: None,
            database: 0,
            client_name: None,
            min_pool_size: default_min_pool_size(),
            max_pool_size: default_max_pool_size(),
            command_timeout_ms: default_command_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            subscription_concurrency: default_subscription_concurrency(),
            encoding: default_encoding(),
            receive_buffer_size: default_receive_buffer_size(),
            prefix: None,
            replicas: Vec::new(),
        }
    }
}

impl ConnectionOptions {
    /// Loads options from a TOML file and validates them.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let options: ConnectionOptions = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        options
            .validate()
            .with_context(|| format!("Invalid configuration in '{path}'"))?;
        Ok(options)
    }

    /// Validates the options to ensure logical consistency.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.port == 0 {
            return Err(invalid("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(invalid("host cannot be empty"));
        }
        if self.database > MAX_DATABASE_INDEX {
            return Err(invalid(format!(
                "database must be between 0 and {MAX_DATABASE_INDEX}"
            )));
        }
        if self.max_pool_size == 0 {
            return Err(invalid("max_pool_size cannot be 0"));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(invalid("min_pool_size cannot exceed max_pool_size"));
        }
        if self.subscription_concurrency == 0 {
            return Err(invalid("subscription_concurrency cannot be 0"));
        }
        if self.receive_buffer_size == 0 {
            return Err(invalid("receive_buffer_size cannot be 0"));
        }
        if !matches!(
            self.encoding.to_ascii_lowercase().as_str(),
            "utf-8" | "utf8"
        ) {
            return Err(invalid(format!(
                "unsupported encoding '{}'",
                self.encoding
            )));
        }
        for replica in &self.replicas {
            replica.parse::<Endpoint>()?;
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    pub fn replica_endpoints(&self) -> Result<Vec<Endpoint>, ClientError> {
        self.replicas.iter().map(|r| r.parse()).collect()
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// The key prefix as bytes, or `None` when unset or empty.
    pub fn key_prefix(&self) -> Option<bytes::Bytes> {
        self.prefix
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| bytes::Bytes::copy_from_slice(p.as_bytes()))
    }
}

fn invalid(message: impl Into<String>) -> ClientError {
    ClientError::InvalidConfig(message.into())
}

impl FromStr for ConnectionOptions {
    type Err = ClientError;

    /// Parses a connection string such as
    /// `127.0.0.1:6379,password=secret,defaultDatabase=2,poolsize=50`.
    ///
    /// Pairs are separated by `,` or `;`. Keys are case-insensitive. The first
    /// token may be a bare `host[:port]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = ConnectionOptions::default();

        for (i, token) in s.split([',', ';']).map(str::trim).enumerate() {
            if token.is_empty() {
                continue;
            }
            let Some((key, value)) = token.split_once('=') else {
                if i == 0 {
                    let endpoint: Endpoint = token.parse()?;
                    options.host = endpoint.host;
                    options.port = endpoint.port;
                    continue;
                }
                return Err(invalid(format!("expected key=value, got '{token}'")));
            };

            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "host" => {
                    let endpoint: Endpoint = value.parse()?;
                    options.host = endpoint.host;
                    if value.contains(':') {
                        options.port = endpoint.port;
                    }
                }
                "port" => options.port = parse_port(value)?,
                "password" => options.password = non_empty(value),
                "user" => options.user = non_empty(value),
                "encoding" => options.encoding = value.to_string(),
                "connectname" | "name" => options.client_name = non_empty(value),
                "prefix" => options.prefix = non_empty(value),
                "defaultdatabase" | "database" => options.database = parse_num(key, value)?,
                "maxpoolsize" | "poolsize" => options.max_pool_size = parse_num(key, value)?,
                "minpoolsize" => options.min_pool_size = parse_num(key, value)?,
                "commandtimeout" => options.command_timeout_ms = parse_num(key, value)?,
                "connecttimeout" => options.connect_timeout_ms = parse_num(key, value)?,
                "idletimeout" => options.idle_timeout_ms = parse_num(key, value)?,
                "subconcurrency" => options.subscription_concurrency = parse_num(key, value)?,
                "buffer" => options.receive_buffer_size = parse_num(key, value)?,
                "resp" | "protocol" => {
                    options.protocol = match value.to_ascii_lowercase().as_str() {
                        "2" | "resp2" => RespProtocol::Resp2,
                        "3" | "resp3" => RespProtocol::Resp3,
                        other => return Err(invalid(format!("unsupported RESP version '{other}'"))),
                    }
                }
                other => return Err(invalid(format!("unknown connection string key '{other}'"))),
            }
        }

        options.validate()?;
        Ok(options)
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, ClientError> {
    value
        .parse()
        .map_err(|_| invalid(format!("invalid value '{value}' for '{}'", key.trim())))
}

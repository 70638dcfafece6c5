// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-memory configuration model
//!
//! Two surface syntaxes produce this model: the line-oriented `.cfg` form
//! (see [`crate::cfgfile`]) and a YAML document deserialized directly into
//! these types. The runtime only ever consumes the validated [`Config`].

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default hard cap on concurrently proxied connections.
pub const DEFAULT_MAXCONN: u32 = 100_000;
/// Default connect timeout towards a backend, in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
/// Default client-side idle timeout, in milliseconds.
pub const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 30_000;
/// Default backend-side idle timeout, in milliseconds.
pub const DEFAULT_SERVER_TIMEOUT_MS: u64 = 30_000;
/// Default probe timeout, in milliseconds.
pub const DEFAULT_CHECK_TIMEOUT_MS: u64 = 5_000;
/// Default forwarding scratch-read size, in bytes.
pub const DEFAULT_BUFSIZE: usize = 16 * 1024;
/// Default per-direction spill cap, in bytes.
pub const DEFAULT_MAXSPILL: usize = 1024 * 1024;

/// Configuration load / validation failure. Startup-only; the data plane
/// never sees these.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Read(PathBuf, std::io::Error),
    /// A syntax error in one of the two surface formats.
    Syntax { line: usize, msg: String },
    /// A structurally valid document that violates a semantic rule.
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(path, err) => write!(f, "cannot read {}: {}", path.display(), err),
            ConfigError::Syntax { line: 0, msg } => write!(f, "parse error: {msg}"),
            ConfigError::Syntax { line, msg } => write!(f, "parse error at line {line}: {msg}"),
            ConfigError::Invalid(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Frontend operating mode. In `http` mode the selector may peek at the
/// request head for uri / url-param / header hashing; in `tcp` mode payloads
/// are never inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Tcp,
    Http,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Tcp
    }
}

/// Balancing algorithm for a backend pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Weight-aware rotation over eligible backends.
    RoundRobin,
    /// Weight-blind rotation in registration order.
    StaticRr,
    /// Minimize `active_connections / effective_weight`; ties go to the
    /// lower id.
    LeastConn,
    /// Cumulative-weight random draw.
    WeightedRandom,
    /// Consistent hash of the client address.
    Source,
    /// Consistent hash of the request path (up to `?`).
    Uri,
    /// Consistent hash of the named URL parameter's value.
    UrlParam(String),
    /// Consistent hash of the named request header's value.
    Header(String),
    /// `argmin(response_time × (active + 1))`.
    ResponseTime,
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::RoundRobin
    }
}

/// Health-probe dialogue type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Tcp,
    Http,
    Https,
    Mysql,
    Pgsql,
    Redis,
    Smtp,
    Ldap,
    Agent,
    External,
}

/// Health-probe specification for a pool. Per-server overrides for the
/// intervals live on [`ServerConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    pub kind: CheckKind,
    /// Probe interval while the backend is up, in milliseconds.
    pub inter_ms: u64,
    /// Probe interval while the backend is transitioning (counters armed).
    pub fastinter_ms: u64,
    /// Probe interval while the backend is down.
    pub downinter_ms: u64,
    /// Dialogue timeout, in milliseconds.
    pub timeout_ms: u64,
    /// Consecutive passes required to flip up.
    pub rise: u32,
    /// Consecutive failures required to flip down.
    pub fall: u32,
    /// Optional payload sent after connect (tcp dialogue).
    pub send: Option<String>,
    /// Literal substring expected in the response (tcp dialogue).
    pub expect: Option<String>,
    /// Regular expression expected to match the response (tcp dialogue).
    pub expect_regex: Option<String>,
    /// Exact HTTP status expected; unset accepts 2xx/3xx.
    pub expect_status: Option<u16>,
    pub http_method: String,
    pub http_uri: String,
    pub http_host: String,
    /// Demote a replica whose reported replication lag exceeds this.
    pub max_lag_ms: Option<u64>,
    /// Command for the external dialogue; run with HOST/PORT in the
    /// environment, exit 0 is a pass.
    pub external_command: Option<String>,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            kind: CheckKind::Tcp,
            inter_ms: 2_000,
            fastinter_ms: 1_000,
            downinter_ms: 5_000,
            timeout_ms: DEFAULT_CHECK_TIMEOUT_MS,
            rise: 3,
            fall: 3,
            send: None,
            expect: None,
            expect_regex: None,
            expect_status: None,
            http_method: "OPTIONS".to_string(),
            http_uri: "/".to_string(),
            http_host: "localhost".to_string(),
            max_lag_ms: None,
            external_command: None,
        }
    }
}

/// Key type of a stick table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StickKeyType {
    Ip,
    Ipv6,
    Integer,
    String,
    Binary,
}

/// Stick-table specification for a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickTableConfig {
    #[serde(rename = "type")]
    pub key_type: StickKeyType,
    /// Entry capacity; LRU eviction keeps the table at or under this.
    pub size: u64,
    /// Entry lifetime, refreshed on every hit, in milliseconds.
    pub expire_ms: u64,
}

/// What attribute of the client a sticky key is derived from. Only the
/// source address is derivable without a payload collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StickOn {
    Src,
}

/// One upstream server inside a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Per-server concurrent-connection cap; 0 means unlimited.
    #[serde(default)]
    pub maxconn: u32,
    /// Backup servers are eligible only while no non-backup server is up.
    #[serde(default)]
    pub backup: bool,
    /// Whether this server participates in health probing.
    #[serde(default)]
    pub check: bool,
    /// Dedicated probe port (agent checks, alternate admin ports).
    #[serde(default)]
    pub check_port: Option<u16>,
    #[serde(default)]
    pub inter_ms: Option<u64>,
    #[serde(default)]
    pub fastinter_ms: Option<u64>,
    #[serde(default)]
    pub downinter_ms: Option<u64>,
    #[serde(default)]
    pub rise: Option<u32>,
    #[serde(default)]
    pub fall: Option<u32>,
}

fn default_weight() -> u32 {
    1
}

/// A named pool of backends plus its balancing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    #[serde(default)]
    pub balance: Algorithm,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub redispatch: Option<bool>,
    #[serde(default)]
    pub check: Option<CheckConfig>,
    #[serde(default)]
    pub stick_table: Option<StickTableConfig>,
    #[serde(default)]
    pub stick_on: Option<StickOn>,
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

/// One bound socket of a frontend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    pub addr: SocketAddr,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_true")]
    pub defer_accept: bool,
    /// TLS termination is delegated to an external collaborator; a bind
    /// carrying this flag fails validation.
    #[serde(default)]
    pub ssl: bool,
}

fn default_backlog() -> u32 {
    1024
}

fn default_true() -> bool {
    true
}

/// A named accept surface routing to a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendConfig {
    pub name: String,
    #[serde(default)]
    pub binds: Vec<BindConfig>,
    #[serde(default)]
    pub mode: Option<Mode>,
    pub default_backend: String,
    /// Per-frontend concurrent-connection cap; 0 means unlimited.
    #[serde(default)]
    pub maxconn: u32,
}

/// Reactor and buffer tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tune {
    /// Scratch read size per pump pass.
    pub bufsize: usize,
    /// Per-direction spill growth cap (the backpressure threshold).
    pub maxspill: usize,
}

impl Default for Tune {
    fn default() -> Self {
        Self {
            bufsize: DEFAULT_BUFSIZE,
            maxspill: DEFAULT_MAXSPILL,
        }
    }
}

/// Process-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Global {
    /// Hard cap on concurrently proxied connections.
    pub maxconn: u32,
    /// Worker thread count; 0 selects 2 × logical cores.
    pub nbthread: u32,
    /// UNIX-domain control socket path.
    pub stats_socket: Option<PathBuf>,
    pub pidfile: Option<PathBuf>,
    pub tune: Tune,
}

impl Default for Global {
    fn default() -> Self {
        Self {
            maxconn: DEFAULT_MAXCONN,
            nbthread: 0,
            stats_socket: None,
            pidfile: None,
            tune: Tune::default(),
        }
    }
}

/// Settings inherited by every frontend and pool unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub mode: Mode,
    pub timeout_connect_ms: u64,
    pub timeout_client_ms: u64,
    pub timeout_server_ms: u64,
    pub timeout_check_ms: u64,
    pub retries: u32,
    pub redispatch: bool,
    pub maxconn: u32,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            mode: Mode::Tcp,
            timeout_connect_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            timeout_client_ms: DEFAULT_CLIENT_TIMEOUT_MS,
            timeout_server_ms: DEFAULT_SERVER_TIMEOUT_MS,
            timeout_check_ms: DEFAULT_CHECK_TIMEOUT_MS,
            retries: 3,
            redispatch: false,
            maxconn: 0,
        }
    }
}

/// The complete validated configuration consumed by the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: Global,
    pub defaults: Defaults,
    pub frontends: Vec<FrontendConfig>,
    pub backends: Vec<PoolConfig>,
}

impl Config {
    /// Loads a configuration file, dispatching on extension: `.yaml`/`.yml`
    /// for the structured form, anything else for the line-oriented form.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;

        let cfg = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str::<Config>(&text).map_err(|e| ConfigError::Syntax {
                    line: e.location().map(|l| l.line()).unwrap_or(0),
                    msg: e.to_string(),
                })?
            }
            _ => crate::cfgfile::parse(&text)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic validation; returns the first violation as a single line.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.frontends.is_empty() {
            return invalid("no frontend defined; at least one listener is required".into());
        }

        for fe in &self.frontends {
            if fe.binds.is_empty() {
                return invalid(format!("frontend '{}' has no bind address", fe.name));
            }
            for bind in &fe.binds {
                if bind.ssl {
                    return invalid(format!(
                        "frontend '{}' bind {}: ssl requires the TLS collaborator, which is not linked in",
                        fe.name, bind.addr
                    ));
                }
            }
            if !self.backends.iter().any(|p| p.name == fe.default_backend) {
                return invalid(format!(
                    "frontend '{}' routes to unknown backend '{}'",
                    fe.name, fe.default_backend
                ));
            }
        }

        for pool in &self.backends {
            if pool.servers.is_empty() {
                return invalid(format!("backend '{}' has no servers", pool.name));
            }
            for srv in &pool.servers {
                if srv.weight == 0 {
                    return invalid(format!(
                        "backend '{}' server '{}': weight must be positive",
                        pool.name, srv.name
                    ));
                }
                if srv.host.is_empty() {
                    return invalid(format!(
                        "backend '{}' server '{}': empty host",
                        pool.name, srv.name
                    ));
                }
            }
            match &pool.balance {
                Algorithm::UrlParam(arg) | Algorithm::Header(arg) if arg.is_empty() => {
                    return invalid(format!(
                        "backend '{}': balance algorithm requires an argument",
                        pool.name
                    ));
                }
                _ => {}
            }
            if pool.stick_on.is_some() && pool.stick_table.is_none() {
                return invalid(format!(
                    "backend '{}': 'stick on' requires a stick-table",
                    pool.name
                ));
            }
            if let Some(st) = &pool.stick_table {
                if st.size == 0 {
                    return invalid(format!("backend '{}': stick-table size must be positive", pool.name));
                }
            }
            if let Some(check) = &pool.check {
                if let Some(re) = &check.expect_regex {
                    if regex::Regex::new(re).is_err() {
                        return invalid(format!(
                            "backend '{}': invalid expect regex '{}'",
                            pool.name, re
                        ));
                    }
                }
                if check.kind == CheckKind::External && check.external_command.is_none() {
                    return invalid(format!(
                        "backend '{}': external check requires a command",
                        pool.name
                    ));
                }
            }
        }

        Ok(())
    }

    /// Builds a single-frontend configuration from bare CLI flags, the
    /// file-less startup mode.
    pub fn from_cli(
        port: u16,
        backends: &[(String, u16, u32)],
        balance: Algorithm,
        workers: u32,
        health: Option<CheckConfig>,
    ) -> Result<Config, ConfigError> {
        if backends.is_empty() {
            return Err(ConfigError::Invalid(
                "no backend given; use --backend HOST:PORT[@WEIGHT] or --config".into(),
            ));
        }

        let servers = backends
            .iter()
            .enumerate()
            .map(|(i, (host, port, weight))| ServerConfig {
                name: format!("srv{}", i + 1),
                host: host.clone(),
                port: *port,
                weight: *weight,
                maxconn: 0,
                backup: false,
                check: health.is_some(),
                check_port: None,
                inter_ms: None,
                fastinter_ms: None,
                downinter_ms: None,
                rise: None,
                fall: None,
            })
            .collect();

        let cfg = Config {
            global: Global {
                nbthread: workers,
                ..Global::default()
            },
            defaults: Defaults::default(),
            frontends: vec![FrontendConfig {
                name: "main".to_string(),
                binds: vec![BindConfig {
                    addr: SocketAddr::from(([0, 0, 0, 0], port)),
                    backlog: default_backlog(),
                    defer_accept: true,
                    ssl: false,
                }],
                mode: None,
                default_backend: "default".to_string(),
                maxconn: 0,
            }],
            backends: vec![PoolConfig {
                name: "default".to_string(),
                balance,
                servers,
                retries: None,
                redispatch: None,
                check: health,
                stick_table: None,
                stick_on: None,
                connect_timeout_ms: None,
            }],
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Effective mode of a frontend.
    pub fn frontend_mode(&self, fe: &FrontendConfig) -> Mode {
        fe.mode.unwrap_or(self.defaults.mode)
    }
}

/// Parses `HOST:PORT[@WEIGHT]` as accepted by `--backend`.
pub fn parse_backend_flag(s: &str) -> Result<(String, u16, u32), String> {
    let (addr, weight) = match s.rsplit_once('@') {
        Some((addr, w)) => {
            let weight: u32 = w.parse().map_err(|_| format!("invalid weight in '{s}'"))?;
            if weight == 0 {
                return Err(format!("weight must be positive in '{s}'"));
            }
            (addr, weight)
        }
        None => (s, 1),
    };

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("invalid backend '{s}' (expected HOST:PORT[@WEIGHT])"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid port in '{s}'"))?;
    if host.is_empty() {
        return Err(format!("invalid backend '{s}' (empty host)"));
    }

    Ok((host.to_string(), port, weight))
}

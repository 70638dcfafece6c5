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

//! Active health probing
//!
//! One dedicated thread walks every checked backend, runs the configured
//! dialogue with blocking I/O (never touching the data plane), and drives
//! the up/down transitions through the rise/fall counters. A backend has at
//! most one in-flight probe because the walk is sequential.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::backend::{epoch_ms, Backend, HealthState};
use crate::config::{CheckConfig, CheckKind};
use crate::runtime::Shared;

/// Rise/fall bookkeeping for one backend.
#[derive(Debug)]
pub(crate) struct ProbeState {
    pub(crate) passes: u32,
    pub(crate) fails: u32,
    next_due: Instant,
}

/// Directive reported by an agent check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AgentDirective {
    Up,
    Down,
    Drain,
    Maint,
}

/// A successful dialogue, possibly carrying agent metadata.
#[derive(Debug, Default)]
pub(crate) struct ProbeReport {
    pub(crate) lag_ms: Option<u64>,
    pub(crate) directive: Option<AgentDirective>,
    pub(crate) weight_pct: Option<u32>,
}

pub(crate) type ProbeOutcome = Result<ProbeReport, String>;

/// The probe loop. Spawned on its own thread by the runtime when health
/// checking is enabled.
pub struct Prober {
    ctx: Arc<Shared>,
    regex_cache: HashMap<String, Regex>,
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober").finish_non_exhaustive()
    }
}

impl Prober {
    pub fn new(ctx: Arc<Shared>) -> Self {
        Self {
            ctx,
            regex_cache: HashMap::new(),
        }
    }

    pub fn run(mut self) {
        let mut states: HashMap<(String, String), ProbeState> = HashMap::new();

        while self.ctx.running.load(Ordering::Acquire) {
            let registry = self.ctx.registry.load_full();
            let now = Instant::now();

            for pool in &registry.pools {
                for backend in &pool.backends {
                    let check = match &backend.check {
                        Some(check) => check,
                        None => continue,
                    };

                    let state = states
                        .entry((pool.name.clone(), backend.name.clone()))
                        .or_insert(ProbeState {
                            passes: 0,
                            fails: 0,
                            next_due: now,
                        });
                    if state.next_due > now {
                        continue;
                    }

                    let outcome = self.run_dialogue(backend, check);
                    apply_outcome(pool.name.as_str(), backend, check, state, outcome);
                    state.next_due = Instant::now()
                        + Duration::from_millis(next_interval(backend.state(), state, check));
                }
            }

            std::thread::sleep(Duration::from_millis(50));
        }
    }

    fn run_dialogue(&mut self, backend: &Backend, check: &CheckConfig) -> ProbeOutcome {
        let addr = probe_addr(backend);
        let timeout = Duration::from_millis(check.timeout_ms.max(1));

        match check.kind {
            CheckKind::Tcp => self.probe_tcp(addr, check, timeout),
            // The TLS collaborator owns handshakes; an https probe verifies
            // reachability at L4 only.
            CheckKind::Https => probe_connect(addr, timeout).map(|_| ProbeReport::default()),
            CheckKind::Http => probe_http(addr, check, timeout),
            CheckKind::Mysql => probe_mysql(addr, timeout),
            CheckKind::Pgsql => probe_pgsql(addr, timeout),
            CheckKind::Redis => probe_redis(addr, timeout),
            CheckKind::Smtp => probe_smtp(addr, timeout),
            CheckKind::Ldap => probe_ldap(addr, timeout),
            CheckKind::Agent => probe_agent(addr, timeout),
            CheckKind::External => probe_external(addr, check, timeout),
        }
    }

    fn probe_tcp(&mut self, addr: SocketAddr, check: &CheckConfig, timeout: Duration) -> ProbeOutcome {
        let mut stream = probe_connect(addr, timeout)?;

        if let Some(send) = &check.send {
            stream
                .write_all(send.as_bytes())
                .map_err(|e| format!("send failed: {e}"))?;
        }

        if check.expect.is_some() || check.expect_regex.is_some() {
            let response = read_some(&mut stream)?;
            let text = String::from_utf8_lossy(&response);

            if let Some(expect) = &check.expect {
                if !text.contains(expect.as_str()) {
                    return Err("unexpected response".into());
                }
            }
            if let Some(pattern) = &check.expect_regex {
                if !self.regex_cache.contains_key(pattern) {
                    let compiled = Regex::new(pattern).map_err(|e| format!("bad regex: {e}"))?;
                    self.regex_cache.insert(pattern.clone(), compiled);
                }
                if !self.regex_cache[pattern].is_match(&text) {
                    return Err("regex mismatch".into());
                }
            }
        }

        Ok(ProbeReport::default())
    }
}

fn probe_addr(backend: &Backend) -> SocketAddr {
    match backend.check_port {
        Some(port) => SocketAddr::new(backend.addr.ip(), port),
        None => backend.addr,
    }
}

fn probe_connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, String> {
    let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| format!("connect: {e}"))?;
    stream.set_nodelay(true).ok();
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| format!("timeout setup: {e}"))?;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(|e| format!("timeout setup: {e}"))?;
    Ok(stream)
}

fn read_some(stream: &mut TcpStream) -> Result<Vec<u8>, String> {
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).map_err(|e| format!("read: {e}"))?;
    if n == 0 {
        return Err("no response".into());
    }
    buf.truncate(n);
    Ok(buf)
}

fn probe_http(addr: SocketAddr, check: &CheckConfig, timeout: Duration) -> ProbeOutcome {
    let mut stream = probe_connect(addr, timeout)?;
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: UltraBalancer/0.1\r\nConnection: close\r\n\r\n",
        check.http_method, check.http_uri, check.http_host
    );
    stream
        .write_all(request.as_bytes())
        .map_err(|e| format!("send: {e}"))?;

    let response = read_some(&mut stream)?;
    let status = parse_http_status(&response).ok_or("invalid HTTP response")?;

    match check.expect_status {
        Some(expected) if status != expected => Err(format!("status {status} != {expected}")),
        None if !(200..400).contains(&status) => Err(format!("HTTP status {status}")),
        _ => Ok(ProbeReport::default()),
    }
}

fn parse_http_status(response: &[u8]) -> Option<u16> {
    let line = response.split(|&b| b == b'\n').next()?;
    let mut parts = line.split(|&b| b == b' ');
    let version = parts.next()?;
    if !version.starts_with(b"HTTP/") {
        return None;
    }
    std::str::from_utf8(parts.next()?).ok()?.trim().parse().ok()
}

fn probe_mysql(addr: SocketAddr, timeout: Duration) -> ProbeOutcome {
    let mut stream = probe_connect(addr, timeout)?;
    let packet = read_some(&mut stream)?;
    if packet.len() < 5 {
        return Err("short MySQL handshake".into());
    }

    let packet_len = packet[0] as u32 | (packet[1] as u32) << 8 | (packet[2] as u32) << 16;
    let sequence = packet[3];
    if packet_len < 4 || sequence != 0 {
        return Err("invalid MySQL packet".into());
    }
    if packet[4] != 10 && packet[4] != 9 {
        return Err("unsupported MySQL protocol".into());
    }
    Ok(ProbeReport::default())
}

/// SSLRequest probe: any server speaking the protocol answers a single
/// `S` or `N`.
fn probe_pgsql(addr: SocketAddr, timeout: Duration) -> ProbeOutcome {
    let mut stream = probe_connect(addr, timeout)?;
    stream
        .write_all(&[0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f])
        .map_err(|e| format!("send: {e}"))?;

    let mut answer = [0u8; 1];
    stream
        .read_exact(&mut answer)
        .map_err(|e| format!("read: {e}"))?;
    match answer[0] {
        b'S' | b'N' => Ok(ProbeReport::default()),
        other => Err(format!("unexpected SSLRequest answer 0x{other:02x}")),
    }
}

fn probe_redis(addr: SocketAddr, timeout: Duration) -> ProbeOutcome {
    let mut stream = probe_connect(addr, timeout)?;
    stream
        .write_all(b"*1\r\n$4\r\nPING\r\n")
        .map_err(|e| format!("send: {e}"))?;

    let response = read_some(&mut stream)?;
    if response.starts_with(b"+PONG\r\n") {
        Ok(ProbeReport::default())
    } else {
        Err("invalid PONG response".into())
    }
}

fn probe_smtp(addr: SocketAddr, timeout: Duration) -> ProbeOutcome {
    let mut stream = probe_connect(addr, timeout)?;
    let banner = read_some(&mut stream)?;
    if banner.starts_with(b"220") {
        let _ = stream.write_all(b"QUIT\r\n");
        Ok(ProbeReport::default())
    } else {
        Err("no SMTP greeting".into())
    }
}

/// Anonymous simple bind (version 3, empty DN); a pass is a bindResponse
/// with resultCode success.
fn probe_ldap(addr: SocketAddr, timeout: Duration) -> ProbeOutcome {
    const BIND_REQUEST: &[u8] = &[
        0x30, 0x0c, // LDAPMessage
        0x02, 0x01, 0x01, // messageID 1
        0x60, 0x07, // bindRequest
        0x02, 0x01, 0x03, // version 3
        0x04, 0x00, // name ""
        0x80, 0x00, // simple ""
    ];

    let mut stream = probe_connect(addr, timeout)?;
    stream
        .write_all(BIND_REQUEST)
        .map_err(|e| format!("send: {e}"))?;

    let response = read_some(&mut stream)?;
    let is_bind_response = response.contains(&0x61);
    let success = response.windows(3).any(|w| w == [0x0a, 0x01, 0x00]);
    if is_bind_response && success {
        Ok(ProbeReport::default())
    } else {
        Err("bind rejected".into())
    }
}

fn probe_agent(addr: SocketAddr, timeout: Duration) -> ProbeOutcome {
    let mut stream = probe_connect(addr, timeout)?;
    let line = read_some(&mut stream)?;
    parse_agent_line(&String::from_utf8_lossy(&line))
}

/// Agent lines are word-per-directive: `up`, `down`, `drain`, `maint`, a
/// `NN%` weight rescale, and `lag=NNms` for replication lag.
pub(crate) fn parse_agent_line(line: &str) -> ProbeOutcome {
    let mut report = ProbeReport::default();
    let mut seen = false;

    for word in line.split([' ', '\t', ',']).map(str::trim) {
        let word = word.trim_end_matches(['\r', '\n']);
        if word.is_empty() {
            continue;
        }
        seen = true;
        match word.to_ascii_lowercase().as_str() {
            "up" | "ready" => report.directive = Some(AgentDirective::Up),
            "down" | "failed" | "stopped" => report.directive = Some(AgentDirective::Down),
            "drain" => report.directive = Some(AgentDirective::Drain),
            "maint" => report.directive = Some(AgentDirective::Maint),
            w if w.ends_with('%') => {
                let pct: u32 = w[..w.len() - 1]
                    .parse()
                    .map_err(|_| format!("bad agent weight '{w}'"))?;
                report.weight_pct = Some(pct);
            }
            w if w.starts_with("lag=") => {
                let raw = w[4..].trim_end_matches("ms");
                let lag: u64 = raw.parse().map_err(|_| format!("bad agent lag '{w}'"))?;
                report.lag_ms = Some(lag);
            }
            other => return Err(format!("unparseable agent word '{other}'")),
        }
    }

    if seen {
        Ok(report)
    } else {
        Err("empty agent response".into())
    }
}

fn probe_external(addr: SocketAddr, check: &CheckConfig, timeout: Duration) -> ProbeOutcome {
    let command = check
        .external_command
        .as_ref()
        .ok_or("external check without a command")?;

    let mut child = std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .env("HOST", addr.ip().to_string())
        .env("PORT", addr.port().to_string())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| format!("spawn: {e}"))?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return if status.success() {
                    Ok(ProbeReport::default())
                } else {
                    Err(format!("external check exited {status}"))
                };
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err("external check timed out".into());
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(format!("wait: {e}")),
        }
    }
}

/// Folds one probe outcome into the backend's health state.
pub(crate) fn apply_outcome(
    pool: &str,
    backend: &Backend,
    check: &CheckConfig,
    state: &mut ProbeState,
    outcome: ProbeOutcome,
) {
    backend.last_check_ms.store(epoch_ms(), Ordering::Relaxed);

    let outcome = match outcome {
        Ok(report) => {
            if let Some(pct) = report.weight_pct {
                backend.set_weight(backend.base_weight.saturating_mul(pct) / 100);
            }
            match report.directive {
                Some(AgentDirective::Down) => Err("agent reported down".to_string()),
                Some(AgentDirective::Maint) => {
                    backend.set_state(HealthState::Maintenance);
                    state.passes = 0;
                    state.fails = 0;
                    return;
                }
                Some(AgentDirective::Drain) => {
                    backend.set_state(HealthState::Draining);
                    state.passes = 0;
                    state.fails = 0;
                    return;
                }
                _ => match (report.lag_ms, check.max_lag_ms) {
                    (Some(lag), Some(max)) if lag > max => {
                        Err(format!("replication lag {lag}ms over {max}ms"))
                    }
                    _ => Ok(()),
                },
            }
        }
        Err(reason) => Err(reason),
    };

    match outcome {
        Ok(()) => {
            state.passes += 1;
            state.fails = 0;
            if state.passes >= check.rise {
                match backend.state() {
                    HealthState::Down | HealthState::Draining => {
                        backend.set_state(HealthState::Up);
                        info!(pool, server = %backend.name, addr = %backend.addr, "server is UP");
                    }
                    _ => {}
                }
            }
        }
        Err(reason) => {
            state.fails += 1;
            state.passes = 0;
            debug!(pool, server = %backend.name, %reason, "probe failed");
            if state.fails >= check.fall && backend.state() == HealthState::Up {
                backend.set_state(HealthState::Down);
                warn!(pool, server = %backend.name, addr = %backend.addr, %reason, "server is DOWN");
            }
        }
    }
}

/// `inter` while settled up, `downinter` while settled down, `fastinter`
/// while the counters are mid-transition.
pub(crate) fn next_interval(state: HealthState, probe: &ProbeState, check: &CheckConfig) -> u64 {
    match state {
        HealthState::Up if probe.fails > 0 => check.fastinter_ms,
        HealthState::Up => check.inter_ms,
        HealthState::Down if probe.passes > 0 => check.fastinter_ms,
        HealthState::Down => check.downinter_ms,
        HealthState::Draining | HealthState::Maintenance => check.inter_ms,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::Registry;
    use crate::config::{Algorithm, CheckConfig, Config};
    use std::io::Write;
    use std::net::TcpListener;

    fn checked_backend() -> (Registry, CheckConfig) {
        let check = CheckConfig {
            rise: 2,
            fall: 2,
            ..CheckConfig::default()
        };
        let cfg = Config::from_cli(
            8080,
            &[("127.0.0.1".to_string(), 9001, 1)],
            Algorithm::RoundRobin,
            1,
            Some(check.clone()),
        )
        .unwrap();
        (Registry::from_config(&cfg, 1).unwrap(), check)
    }

    fn fresh_state() -> ProbeState {
        ProbeState {
            passes: 0,
            fails: 0,
            next_due: Instant::now(),
        }
    }

    #[test]
    fn fall_failures_demote_then_rise_passes_promote() {
        let (reg, check) = checked_backend();
        let b = &reg.pools[0].backends[0];
        let mut st = fresh_state();

        apply_outcome("p", b, &check, &mut st, Err("refused".into()));
        assert_eq!(HealthState::Up, b.state());
        apply_outcome("p", b, &check, &mut st, Err("refused".into()));
        assert_eq!(HealthState::Down, b.state());

        apply_outcome("p", b, &check, &mut st, Ok(ProbeReport::default()));
        assert_eq!(HealthState::Down, b.state());
        apply_outcome("p", b, &check, &mut st, Ok(ProbeReport::default()));
        assert_eq!(HealthState::Up, b.state());
    }

    #[test]
    fn a_pass_resets_the_fail_streak() {
        let (reg, check) = checked_backend();
        let b = &reg.pools[0].backends[0];
        let mut st = fresh_state();

        apply_outcome("p", b, &check, &mut st, Err("x".into()));
        apply_outcome("p", b, &check, &mut st, Ok(ProbeReport::default()));
        apply_outcome("p", b, &check, &mut st, Err("x".into()));
        assert_eq!(HealthState::Up, b.state());
        assert_eq!(1, st.fails);
    }

    #[test]
    fn maintenance_is_never_auto_promoted() {
        let (reg, check) = checked_backend();
        let b = &reg.pools[0].backends[0];
        let mut st = fresh_state();
        b.set_state(HealthState::Maintenance);

        for _ in 0..5 {
            apply_outcome("p", b, &check, &mut st, Ok(ProbeReport::default()));
        }
        assert_eq!(HealthState::Maintenance, b.state());
    }

    #[test]
    fn excessive_lag_counts_as_failure() {
        let (reg, _) = checked_backend();
        let b = &reg.pools[0].backends[0];
        let check = CheckConfig {
            rise: 2,
            fall: 2,
            max_lag_ms: Some(500),
            ..CheckConfig::default()
        };
        let mut st = fresh_state();

        let lagging = || {
            Ok(ProbeReport {
                lag_ms: Some(2_000),
                ..ProbeReport::default()
            })
        };
        apply_outcome("p", b, &check, &mut st, lagging());
        apply_outcome("p", b, &check, &mut st, lagging());
        assert_eq!(HealthState::Down, b.state());
    }

    #[test]
    fn agent_directives_apply_immediately() {
        let (reg, check) = checked_backend();
        let b = &reg.pools[0].backends[0];
        let mut st = fresh_state();

        let report = parse_agent_line("drain\n").unwrap();
        apply_outcome("p", b, &check, &mut st, Ok(report));
        assert_eq!(HealthState::Draining, b.state());

        let report = parse_agent_line("up 50%\n").unwrap();
        apply_outcome("p", b, &check, &mut st, Ok(report));
        // weight rescaled from base 1: 1*50/100 clamps to minimum 1
        assert_eq!(1, b.weight());
    }

    #[test]
    fn agent_line_parsing() {
        let r = parse_agent_line("up 75% lag=120ms\n").unwrap();
        assert_eq!(Some(AgentDirective::Up), r.directive);
        assert_eq!(Some(75), r.weight_pct);
        assert_eq!(Some(120), r.lag_ms);

        assert!(parse_agent_line("\r\n").is_err());
        assert!(parse_agent_line("gibberish").is_err());
    }

    #[test]
    fn interval_tracks_state_and_streaks() {
        let check = CheckConfig::default();
        let mut st = fresh_state();

        assert_eq!(check.inter_ms, next_interval(HealthState::Up, &st, &check));
        st.fails = 1;
        assert_eq!(check.fastinter_ms, next_interval(HealthState::Up, &st, &check));
        st.fails = 0;
        assert_eq!(check.downinter_ms, next_interval(HealthState::Down, &st, &check));
        st.passes = 1;
        assert_eq!(check.fastinter_ms, next_interval(HealthState::Down, &st, &check));
    }

    #[test]
    fn redis_dialogue_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).unwrap();
            assert_eq!(b"*1\r\n$4\r\nPING\r\n", &buf[..n]);
            sock.write_all(b"+PONG\r\n").unwrap();
        });

        let outcome = probe_redis(addr, Duration::from_secs(2));
        server.join().unwrap();
        assert!(outcome.is_ok());
    }

    #[test]
    fn smtp_dialogue_requires_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"220 mail.example ESMTP\r\n").unwrap();
            let mut buf = [0u8; 16];
            let _ = sock.read(&mut buf);
        });

        assert!(probe_smtp(addr, Duration::from_secs(2)).is_ok());
        server.join().unwrap();
    }

    #[test]
    fn refused_connect_is_a_failure() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(probe_connect(addr, Duration::from_millis(500)).is_err());
    }
}

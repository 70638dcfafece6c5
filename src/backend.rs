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

//! Upstream registry
//!
//! Read-mostly: the registry is immutable after construction and shared via
//! an atomic pointer swap on reload. Live connection pairs hold
//! `Arc<Backend>` clones, so a superseded generation stays alive until the
//! last pair referencing it terminates. All runtime backend state is atomic;
//! nothing on the data plane takes a lock here.

use std::hash::Hasher;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fnv::FnvHasher;

use crate::config::{
    Algorithm, BindConfig, CheckConfig, Config, ConfigError, Mode, StickOn, StickTableConfig,
};
use crate::stats::Histogram;
use crate::sticky::StickyTable;

/// Stable backend identifier within its pool (registration index).
pub type BackendId = u32;

/// Virtual ring positions per unit of weight.
const RING_POINTS_PER_WEIGHT: u32 = 16;

/// Health of a backend as observed by the selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HealthState {
    Up = 0,
    Down = 1,
    Draining = 2,
    Maintenance = 3,
}

impl HealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Up => "UP",
            HealthState::Down => "DOWN",
            HealthState::Draining => "DRAIN",
            HealthState::Maintenance => "MAINT",
        }
    }

    fn from_u8(raw: u8) -> HealthState {
        match raw {
            0 => HealthState::Up,
            1 => HealthState::Down,
            2 => HealthState::Draining,
            _ => HealthState::Maintenance,
        }
    }
}

/// One upstream server. Counters are mutated by workers and the prober;
/// everything else is fixed at registry build.
#[derive(Debug)]
pub struct Backend {
    pub id: BackendId,
    pub name: String,
    pub addr: SocketAddr,
    pub backup: bool,
    /// Per-server concurrent-connection cap; 0 means unlimited.
    pub max_conns: u32,
    /// Weight as configured; the effective weight can be rescaled by an
    /// agent check or the control socket.
    pub base_weight: u32,
    /// Fully merged probe spec; `None` when this server is unchecked.
    pub check: Option<CheckConfig>,
    /// Dedicated probe port, when it differs from the traffic port.
    pub check_port: Option<u16>,

    weight: AtomicU32,
    state: AtomicU8,
    pub active_conns: AtomicU32,
    pub total_conns: AtomicU64,
    pub failed_conns: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    response_time_us: AtomicU64,
    pub rt_histogram: Histogram,
    pub last_check_ms: AtomicU64,
    last_change_ms: AtomicU64,
    /// Bumped by `shutdown sessions`; pairs bound before the bump are torn
    /// down on the next sweep.
    pub kill_epoch: AtomicU64,
}

impl Backend {
    fn new(
        id: BackendId,
        name: String,
        addr: SocketAddr,
        weight: u32,
        backup: bool,
        max_conns: u32,
        check: Option<CheckConfig>,
        check_port: Option<u16>,
    ) -> Self {
        Self {
            id,
            name,
            addr,
            backup,
            max_conns,
            base_weight: weight,
            check,
            check_port,
            weight: AtomicU32::new(weight),
            state: AtomicU8::new(HealthState::Up as u8),
            active_conns: AtomicU32::new(0),
            total_conns: AtomicU64::new(0),
            failed_conns: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            response_time_us: AtomicU64::new(0),
            rt_histogram: Histogram::new(),
            last_check_ms: AtomicU64::new(0),
            last_change_ms: AtomicU64::new(epoch_ms()),
            kill_epoch: AtomicU64::new(0),
        }
    }

    /// Relaxed is enough on the selection path; the prober publishes with
    /// release.
    #[inline]
    pub fn state(&self) -> HealthState {
        HealthState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: HealthState) {
        let prev = self.state.swap(state as u8, Ordering::Release);
        if prev != state as u8 {
            self.last_change_ms.store(epoch_ms(), Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed).max(1)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight.max(1), Ordering::Relaxed);
    }

    /// Selector eligibility. Draining servers only remain reachable through
    /// an existing sticky reference.
    #[inline]
    pub fn is_eligible(&self, sticky_bound: bool) -> bool {
        let state_ok = match self.state() {
            HealthState::Up => true,
            HealthState::Draining => sticky_bound,
            HealthState::Down | HealthState::Maintenance => false,
        };
        state_ok
            && (self.max_conns == 0 || self.active_conns.load(Ordering::Relaxed) < self.max_conns)
    }

    /// Counter entry for a new connection attempt. Every call has exactly
    /// one matching [`Backend::leave`].
    #[inline]
    pub fn enter(&self) {
        self.total_conns.fetch_add(1, Ordering::Relaxed);
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn leave(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn observe_response_time(&self, sample: Duration) {
        let us = sample.as_micros().min(u64::MAX as u128) as u64;
        self.rt_histogram.observe_us(us);
        let old = self.response_time_us.load(Ordering::Relaxed);
        let next = if old == 0 { us } else { (old * 7 + us) / 8 };
        self.response_time_us.store(next, Ordering::Relaxed);
    }

    #[inline]
    pub fn response_time_us(&self) -> u64 {
        self.response_time_us.load(Ordering::Relaxed)
    }

    pub fn secs_since_change(&self) -> u64 {
        let then = self.last_change_ms.load(Ordering::Relaxed);
        epoch_ms().saturating_sub(then) / 1000
    }
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Consistent-hash ring. Rebuilt whenever the backend set changes (which,
/// with an immutable registry, means at registry build).
#[derive(Debug)]
pub struct Ring {
    points: Vec<(u64, BackendId)>,
}

impl Ring {
    fn build(backends: &[Arc<Backend>]) -> Self {
        let mut points = Vec::new();
        for b in backends {
            let replicas = b.base_weight.saturating_mul(RING_POINTS_PER_WEIGHT).min(4096);
            for replica in 0..replicas {
                let mut hasher = FnvHasher::default();
                hasher.write(b.name.as_bytes());
                hasher.write(b.addr.to_string().as_bytes());
                hasher.write(&replica.to_be_bytes());
                points.push((hasher.finish(), b.id));
            }
        }
        points.sort_unstable();
        Ring { points }
    }

    /// Walks clockwise from the key's position to the first backend the
    /// predicate accepts.
    pub fn lookup<F>(&self, hash: u64, accept: F) -> Option<BackendId>
    where
        F: Fn(BackendId) -> bool,
    {
        if self.points.is_empty() {
            return None;
        }
        let start = self.points.partition_point(|&(h, _)| h < hash);
        for step in 0..self.points.len() {
            let (_, id) = self.points[(start + step) % self.points.len()];
            if accept(id) {
                return Some(id);
            }
        }
        None
    }
}

/// A named pool: the servers plus the policy for choosing among them.
#[derive(Debug)]
pub struct Pool {
    pub name: String,
    pub algorithm: Algorithm,
    pub retries: u32,
    pub redispatch: bool,
    pub connect_timeout: Duration,
    pub backends: Vec<Arc<Backend>>,
    pub sticky: Option<Arc<StickyTable>>,
    pub stick_on_src: bool,
    pub ring: Ring,
    cursor: AtomicUsize,
}

impl Pool {
    #[inline]
    pub fn next_cursor(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }

    pub fn backend(&self, id: BackendId) -> Option<&Arc<Backend>> {
        self.backends.get(id as usize)
    }

    pub fn backend_by_name(&self, name: &str) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.name == name)
    }
}

/// Accept-side runtime view of a frontend.
#[derive(Debug)]
pub struct FrontendRt {
    pub name: String,
    pub mode: Mode,
    pub pool: usize,
    /// Per-frontend concurrent-connection cap; 0 means unlimited.
    pub maxconn: u32,
    pub binds: Vec<BindConfig>,
}

/// The immutable generation the data plane routes against.
#[derive(Debug)]
pub struct Registry {
    pub generation: u64,
    pub frontends: Vec<FrontendRt>,
    pub pools: Vec<Pool>,
}

impl Registry {
    /// Builds a registry generation from validated configuration; resolves
    /// server hostnames, merges probe overrides, and constructs rings and
    /// stick tables.
    pub fn from_config(cfg: &Config, generation: u64) -> Result<Registry, ConfigError> {
        let mut pools = Vec::with_capacity(cfg.backends.len());

        for pool_cfg in &cfg.backends {
            let mut backends = Vec::with_capacity(pool_cfg.servers.len());
            for (idx, srv) in pool_cfg.servers.iter().enumerate() {
                let addr = resolve(&srv.host, srv.port).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "backend '{}' server '{}': {}",
                        pool_cfg.name, srv.name, e
                    ))
                })?;

                let check = match (&pool_cfg.check, srv.check) {
                    (Some(base), true) => {
                        let mut merged = base.clone();
                        if let Some(v) = srv.inter_ms {
                            merged.inter_ms = v;
                        }
                        if let Some(v) = srv.fastinter_ms {
                            merged.fastinter_ms = v;
                        }
                        if let Some(v) = srv.downinter_ms {
                            merged.downinter_ms = v;
                        }
                        if let Some(v) = srv.rise {
                            merged.rise = v;
                        }
                        if let Some(v) = srv.fall {
                            merged.fall = v;
                        }
                        Some(merged)
                    }
                    _ => None,
                };

                backends.push(Arc::new(Backend::new(
                    idx as BackendId,
                    srv.name.clone(),
                    addr,
                    srv.weight,
                    srv.backup,
                    srv.maxconn,
                    check,
                    srv.check_port,
                )));
            }

            let ring = Ring::build(&backends);
            let sticky = pool_cfg.stick_table.as_ref().map(|st| Arc::new(build_table(st)));

            pools.push(Pool {
                name: pool_cfg.name.clone(),
                algorithm: pool_cfg.balance.clone(),
                retries: pool_cfg.retries.unwrap_or(cfg.defaults.retries),
                redispatch: pool_cfg.redispatch.unwrap_or(cfg.defaults.redispatch),
                connect_timeout: Duration::from_millis(
                    pool_cfg
                        .connect_timeout_ms
                        .unwrap_or(cfg.defaults.timeout_connect_ms),
                ),
                backends,
                sticky,
                stick_on_src: matches!(pool_cfg.stick_on, Some(StickOn::Src)),
                ring,
                cursor: AtomicUsize::new(0),
            });
        }

        let mut frontends = Vec::with_capacity(cfg.frontends.len());
        for fe in &cfg.frontends {
            let pool = pools
                .iter()
                .position(|p| p.name == fe.default_backend)
                .ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "frontend '{}' routes to unknown backend '{}'",
                        fe.name, fe.default_backend
                    ))
                })?;
            frontends.push(FrontendRt {
                name: fe.name.clone(),
                mode: cfg.frontend_mode(fe),
                pool,
                maxconn: if fe.maxconn != 0 { fe.maxconn } else { cfg.defaults.maxconn },
                binds: fe.binds.clone(),
            });
        }

        Ok(Registry {
            generation,
            frontends,
            pools,
        })
    }

    pub fn pool_by_name(&self, name: &str) -> Option<&Pool> {
        self.pools.iter().find(|p| p.name == name)
    }
}

fn build_table(cfg: &StickTableConfig) -> StickyTable {
    StickyTable::new(
        cfg.size.min(usize::MAX as u64) as usize,
        Duration::from_millis(cfg.expire_ms),
    )
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, String> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve '{host}': {e}"))?
        .next()
        .ok_or_else(|| format!("'{host}' resolved to no address"))
}

/// Hashes arbitrary key material for ring placement.
#[inline]
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

/// Hashes a client address for source hashing.
#[inline]
pub fn hash_addr(addr: IpAddr) -> u64 {
    match addr {
        IpAddr::V4(v4) => hash_bytes(&v4.octets()),
        IpAddr::V6(v6) => hash_bytes(&v6.octets()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Algorithm;

    fn test_config(n: usize) -> Config {
        let backends: Vec<(String, u16, u32)> = (0..n)
            .map(|i| ("127.0.0.1".to_string(), 9000 + i as u16, 1))
            .collect();
        Config::from_cli(8080, &backends, Algorithm::RoundRobin, 1, None).unwrap()
    }

    #[test]
    fn registry_builds_from_cli_config() {
        let reg = Registry::from_config(&test_config(3), 1).unwrap();
        assert_eq!(1, reg.pools.len());
        assert_eq!(3, reg.pools[0].backends.len());
        assert_eq!(0, reg.frontends[0].pool);
        for (i, b) in reg.pools[0].backends.iter().enumerate() {
            assert_eq!(i as BackendId, b.id);
            assert_eq!(HealthState::Up, b.state());
        }
    }

    #[test]
    fn enter_leave_balance_active_counter() {
        let reg = Registry::from_config(&test_config(1), 1).unwrap();
        let b = &reg.pools[0].backends[0];
        b.enter();
        b.enter();
        assert_eq!(2, b.active_conns.load(Ordering::Relaxed));
        assert_eq!(2, b.total_conns.load(Ordering::Relaxed));
        b.leave();
        b.leave();
        assert_eq!(0, b.active_conns.load(Ordering::Relaxed));
        assert_eq!(2, b.total_conns.load(Ordering::Relaxed));
    }

    #[test]
    fn eligibility_follows_state_and_cap() {
        let reg = Registry::from_config(&test_config(1), 1).unwrap();
        let b = &reg.pools[0].backends[0];
        assert!(b.is_eligible(false));

        b.set_state(HealthState::Down);
        assert!(!b.is_eligible(false));

        b.set_state(HealthState::Draining);
        assert!(!b.is_eligible(false));
        assert!(b.is_eligible(true));

        b.set_state(HealthState::Maintenance);
        assert!(!b.is_eligible(true));
    }

    #[test]
    fn ring_moves_bounded_fraction_on_removal() {
        let reg = Registry::from_config(&test_config(4), 1).unwrap();
        let pool = &reg.pools[0];

        let keys: Vec<u64> = (0..1000u64).map(|i| hash_bytes(&i.to_be_bytes())).collect();
        let before: Vec<BackendId> = keys
            .iter()
            .map(|&k| pool.ring.lookup(k, |_| true).unwrap())
            .collect();

        // Take backend 2 out of rotation; only its keys should move.
        let after: Vec<BackendId> = keys
            .iter()
            .map(|&k| pool.ring.lookup(k, |id| id != 2).unwrap())
            .collect();

        let moved = before
            .iter()
            .zip(&after)
            .filter(|(b, a)| b != a)
            .count();
        let owned_by_removed = before.iter().filter(|&&b| b == 2).count();
        assert_eq!(moved, owned_by_removed);
        // With equal weights the removed backend owned roughly a quarter.
        assert!(owned_by_removed < 1000 / 2, "owned {owned_by_removed}");
    }

    #[test]
    fn ring_lookup_is_deterministic() {
        let reg = Registry::from_config(&test_config(3), 1).unwrap();
        let pool = &reg.pools[0];
        let k = hash_bytes(b"10.1.2.3");
        let a = pool.ring.lookup(k, |_| true);
        let b = pool.ring.lookup(k, |_| true);
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn hostname_resolution_failure_is_a_config_error() {
        let mut cfg = test_config(1);
        cfg.backends[0].servers[0].host = "definitely-not-a-real-host.invalid".to_string();
        assert!(Registry::from_config(&cfg, 1).is_err());
    }

    #[test]
    fn response_time_ewma_converges() {
        let reg = Registry::from_config(&test_config(1), 1).unwrap();
        let b = &reg.pools[0].backends[0];
        b.observe_response_time(Duration::from_micros(800));
        assert_eq!(800, b.response_time_us());
        for _ in 0..64 {
            b.observe_response_time(Duration::from_micros(100));
        }
        assert!(b.response_time_us() < 200, "{}", b.response_time_us());
    }
}

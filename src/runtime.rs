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

//! Process wiring
//!
//! Builds the shared context, spawns the worker reactors, the health
//! prober, and the control socket, and owns reload and shutdown. There is no
//! hidden global state: everything the data plane shares travels through
//! one [`Shared`] handle created here.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{error, info, warn};

use crate::admin;
use crate::backend::Registry;
use crate::config::{Config, ConfigError};
use crate::health::Prober;
use crate::listener::{self, ListenerShared};
use crate::stats::GlobalStats;
use crate::worker::Worker;

/// How long a draining worker waits for inflight pairs before force-closing.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Immutable tunables shared by every thread.
#[derive(Debug)]
pub struct RuntimeCfg {
    pub workers: usize,
    pub maxconn: u32,
    pub idle_timeout: Duration,
    pub drain_timeout: Duration,
    pub bufsize: usize,
    pub maxspill: usize,
}

/// The explicit context object handed to workers, the prober, and the
/// control socket.
#[derive(Debug)]
pub struct Shared {
    pub cfg: RuntimeCfg,
    pub registry: ArcSwap<Registry>,
    pub stats: GlobalStats,
    pub running: AtomicBool,
    pub serial: AtomicU64,
}

/// A started proxy instance.
#[derive(Debug)]
pub struct Runtime {
    ctx: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    prober: Option<JoinHandle<()>>,
    admin: Option<JoinHandle<()>>,
    listener_shared: Vec<Arc<ListenerShared>>,
    config: Config,
    config_path: Option<PathBuf>,
    generation: u64,
    pidfile: Option<PathBuf>,
    stats_socket: Option<PathBuf>,
}

impl Runtime {
    /// Binds listeners, spawns all threads, and returns the running
    /// instance. Every failure here is a startup error.
    pub fn start(mut config: Config) -> Result<Runtime, ConfigError> {
        materialize_ephemeral_ports(&mut config)?;

        let registry = Registry::from_config(&config, 1)?;

        let workers = if config.global.nbthread != 0 {
            config.global.nbthread as usize
        } else {
            2 * std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        };

        let ctx = Arc::new(Shared {
            cfg: RuntimeCfg {
                workers,
                maxconn: config.global.maxconn,
                idle_timeout: Duration::from_millis(
                    config.defaults.timeout_client_ms.max(config.defaults.timeout_server_ms),
                ),
                drain_timeout: DRAIN_TIMEOUT,
                bufsize: config.global.tune.bufsize,
                maxspill: config.global.tune.maxspill,
            },
            registry: ArcSwap::from_pointee(registry),
            stats: GlobalStats::new(),
            running: AtomicBool::new(true),
            serial: AtomicU64::new(1),
        });

        let listener_shared = listener::shared_for_registry(&ctx.registry.load());

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let registry = ctx.registry.load_full();
            let listeners = listener::bind_worker_set(&registry, &listener_shared)
                .map_err(|e| ConfigError::Invalid(format!("cannot bind listeners: {e}")))?;
            let mut worker = Worker::new(id, ctx.clone(), listeners)
                .map_err(|e| ConfigError::Invalid(format!("cannot start worker {id}: {e}")))?;
            let handle = std::thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker.run())
                .map_err(|e| ConfigError::Invalid(format!("cannot spawn worker {id}: {e}")))?;
            handles.push(handle);
        }

        let has_checks = ctx
            .registry
            .load()
            .pools
            .iter()
            .any(|p| p.backends.iter().any(|b| b.check.is_some()));
        let prober = if has_checks {
            let prober = Prober::new(ctx.clone());
            Some(
                std::thread::Builder::new()
                    .name("health".to_string())
                    .spawn(move || prober.run())
                    .map_err(|e| ConfigError::Invalid(format!("cannot spawn prober: {e}")))?,
            )
        } else {
            None
        };

        let stats_socket = config.global.stats_socket.clone();
        let admin = match &stats_socket {
            Some(path) => Some(
                admin::spawn(path.clone(), ctx.clone())
                    .map_err(|e| ConfigError::Invalid(format!("cannot open control socket: {e}")))?,
            ),
            None => None,
        };

        let pidfile = config.global.pidfile.clone();
        if let Some(path) = &pidfile {
            std::fs::write(path, format!("{}\n", std::process::id()))
                .map_err(|e| ConfigError::Read(path.clone(), e))?;
        }

        info!(
            workers,
            maxconn = config.global.maxconn,
            frontends = config.frontends.len(),
            pools = config.backends.len(),
            "ultrabalancer started"
        );

        Ok(Runtime {
            ctx,
            workers: handles,
            prober,
            admin,
            listener_shared,
            config,
            config_path: None,
            generation: 1,
            pidfile,
            stats_socket,
        })
    }

    /// Remembers the file to re-read on SIGHUP.
    pub fn set_config_path(&mut self, path: PathBuf) {
        self.config_path = Some(path);
    }

    pub fn ctx(&self) -> &Arc<Shared> {
        &self.ctx
    }

    /// Bound addresses, flattened in frontend declaration order.
    pub fn listen_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.listener_shared.iter().map(|l| l.addr).collect()
    }

    /// Swaps in a fresh registry generation. New pairs route against it
    /// immediately; existing pairs finish against the generation they hold.
    /// Listener topology is fixed for the process lifetime, so a reload that
    /// changes binds is refused.
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        let config = match &self.config_path {
            Some(path) => Config::load(path)?,
            None => return Err(ConfigError::Invalid("no config file to reload from".into())),
        };

        let same_listeners = config.frontends.len() == self.config.frontends.len()
            && config.frontends.iter().zip(&self.config.frontends).all(|(a, b)| {
                a.name == b.name
                    && a.binds.len() == b.binds.len()
                    && a.binds.iter().zip(&b.binds).all(|(x, y)| x.addr == y.addr)
            });
        if !same_listeners {
            return Err(ConfigError::Invalid(
                "reload cannot change frontends or bind addresses; restart instead".into(),
            ));
        }

        self.generation += 1;
        let registry = Registry::from_config(&config, self.generation)?;
        self.ctx.registry.store(Arc::new(registry));
        self.config = config;
        info!(generation = self.generation, "configuration reloaded");
        Ok(())
    }

    /// Flags shutdown and joins every thread. Workers drain inflight pairs
    /// up to the drain timeout.
    pub fn shutdown(&mut self) {
        info!("shutting down");
        self.ctx.running.store(false, Ordering::Release);

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        if let Some(handle) = self.prober.take() {
            if handle.join().is_err() {
                error!("health prober panicked");
            }
        }
        if let Some(handle) = self.admin.take() {
            if handle.join().is_err() {
                error!("control socket thread panicked");
            }
        }

        if let Some(path) = &self.pidfile {
            std::fs::remove_file(path).ok();
        }
        if let Some(path) = &self.stats_socket {
            std::fs::remove_file(path).ok();
        }
    }

    /// Blocks until SIGINT/SIGTERM, reloading on SIGHUP, then shuts down.
    pub fn run_until_signal(&mut self) -> std::io::Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGINT, stop.clone())?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, stop.clone())?;
        let reload = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGHUP, reload.clone())?;

        while !stop.load(Ordering::Relaxed) {
            if reload.swap(false, Ordering::Relaxed) {
                if let Err(e) = self.reload() {
                    warn!(error = %e, "reload failed; keeping previous configuration");
                }
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        self.shutdown();
        Ok(())
    }
}

/// Resolves port-zero binds to concrete ports before the workers each bind
/// the address with `SO_REUSEPORT`; every worker must land on the same port.
fn materialize_ephemeral_ports(config: &mut Config) -> Result<(), ConfigError> {
    for fe in &mut config.frontends {
        for bind in &mut fe.binds {
            if bind.addr.port() == 0 {
                let probe = listener::bind_socket(bind)
                    .map_err(|e| ConfigError::Invalid(format!("cannot bind {}: {e}", bind.addr)))?;
                let addr = probe
                    .local_addr()
                    .map_err(|e| ConfigError::Invalid(format!("cannot bind {}: {e}", bind.addr)))?;
                bind.addr = addr;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::HealthState;
    use crate::config::{Algorithm, Config, PoolConfig, ServerConfig, StickTableConfig, StickOn};
    use crate::config::{BindConfig, FrontendConfig, StickKeyType};
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Echo backend that answers the first read with its tag byte, then
    /// drains until EOF.
    fn spawn_tagged_backend(tag: u8) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let conns = Arc::new(AtomicUsize::new(0));
        let counter = conns.clone();

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let mut stream = match stream {
                    Ok(s) => s,
                    Err(_) => break,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::spawn(move || {
                    let mut buf = [0u8; 256];
                    if let Ok(n) = stream.read(&mut buf) {
                        if n > 0 {
                            let _ = stream.write_all(&[tag]);
                        }
                    }
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                });
            }
        });

        (addr, conns)
    }

    fn proxy_config(backends: &[SocketAddr], balance: Algorithm) -> Config {
        let servers = backends
            .iter()
            .enumerate()
            .map(|(i, addr)| ServerConfig {
                name: format!("b{}", i + 1),
                host: addr.ip().to_string(),
                port: addr.port(),
                weight: 1,
                maxconn: 0,
                backup: false,
                check: false,
                check_port: None,
                inter_ms: None,
                fastinter_ms: None,
                downinter_ms: None,
                rise: None,
                fall: None,
            })
            .collect();

        Config {
            global: crate::config::Global {
                nbthread: 1,
                ..Default::default()
            },
            defaults: Default::default(),
            frontends: vec![FrontendConfig {
                name: "test".to_string(),
                binds: vec![BindConfig {
                    addr: "127.0.0.1:0".parse().unwrap(),
                    backlog: 128,
                    defer_accept: false,
                    ssl: false,
                }],
                mode: None,
                default_backend: "pool".to_string(),
                maxconn: 0,
            }],
            backends: vec![PoolConfig {
                name: "pool".to_string(),
                balance,
                servers,
                retries: Some(1),
                redispatch: None,
                check: None,
                stick_table: None,
                stick_on: None,
                connect_timeout_ms: Some(1_000),
            }],
        }
    }

    fn roundtrip(proxy: SocketAddr) -> std::io::Result<u8> {
        let mut stream = TcpStream::connect(proxy)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        stream.write_all(b"A\n")?;
        let mut tag = [0u8; 1];
        stream.read_exact(&mut tag)?;
        Ok(tag[0])
    }

    #[test]
    fn round_robin_cycles_across_three_backends() {
        let (a1, _) = spawn_tagged_backend(b'1');
        let (a2, _) = spawn_tagged_backend(b'2');
        let (a3, _) = spawn_tagged_backend(b'3');

        let mut rt = Runtime::start(proxy_config(&[a1, a2, a3], Algorithm::RoundRobin)).unwrap();
        let proxy = rt.listen_addrs()[0];

        let tags: Vec<u8> = (0..6).map(|_| roundtrip(proxy).unwrap()).collect();

        // Any starting point, then cycling: position i and i+3 agree, and
        // each cycle covers all three backends.
        assert_eq!(tags[0], tags[3]);
        assert_eq!(tags[1], tags[4]);
        assert_eq!(tags[2], tags[5]);
        let mut cycle = tags[..3].to_vec();
        cycle.sort_unstable();
        assert_eq!(vec![b'1', b'2', b'3'], cycle);

        rt.shutdown();
    }

    #[test]
    fn sticky_sessions_pin_a_client_to_one_backend() {
        let (a1, c1) = spawn_tagged_backend(b'1');
        let (a2, c2) = spawn_tagged_backend(b'2');

        let mut cfg = proxy_config(&[a1, a2], Algorithm::RoundRobin);
        cfg.backends[0].stick_table = Some(StickTableConfig {
            key_type: StickKeyType::Ip,
            size: 1024,
            expire_ms: 60_000,
        });
        cfg.backends[0].stick_on = Some(StickOn::Src);

        let mut rt = Runtime::start(cfg).unwrap();
        let proxy = rt.listen_addrs()[0];

        let first = roundtrip(proxy).unwrap();
        for _ in 0..4 {
            assert_eq!(first, roundtrip(proxy).unwrap());
        }

        // All five connections landed on a single backend.
        let (hit, missed) = if first == b'1' { (&c1, &c2) } else { (&c2, &c1) };
        assert_eq!(5, hit.load(Ordering::SeqCst));
        assert_eq!(0, missed.load(Ordering::SeqCst));

        rt.shutdown();
    }

    #[test]
    fn connect_failure_redispatches_to_a_live_backend() {
        // A port with nothing listening refuses immediately.
        let dead = TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);
        let (live, _) = spawn_tagged_backend(b'2');

        let mut cfg = proxy_config(&[dead_addr, live], Algorithm::RoundRobin);
        cfg.backends[0].retries = Some(1);
        cfg.backends[0].redispatch = Some(true);

        let mut rt = Runtime::start(cfg).unwrap();
        let proxy = rt.listen_addrs()[0];

        assert_eq!(b'2', roundtrip(proxy).unwrap());

        let registry = rt.ctx().registry.load();
        let refused = &registry.pools[0].backends[0];
        // One initial attempt plus one retry against the dead backend.
        assert_eq!(2, refused.failed_conns.load(Ordering::Relaxed));
        assert_eq!(0, refused.active_conns.load(Ordering::Relaxed));

        rt.shutdown();
    }

    #[test]
    fn no_available_backend_means_immediate_close() {
        let (a1, _) = spawn_tagged_backend(b'1');
        let mut rt = Runtime::start(proxy_config(&[a1], Algorithm::RoundRobin)).unwrap();
        let proxy = rt.listen_addrs()[0];

        rt.ctx().registry.load().pools[0].backends[0].set_state(HealthState::Down);

        let mut stream = TcpStream::connect(proxy).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.write_all(b"A\n").unwrap();
        let mut buf = [0u8; 8];
        // Either a clean EOF or a reset, never a payload.
        match stream.read(&mut buf) {
            Ok(n) => assert_eq!(0, n),
            Err(_) => {}
        }
        assert!(rt.ctx().stats.rejected_conns.load(Ordering::Relaxed) >= 1);

        rt.shutdown();
    }

    #[test]
    fn backend_counters_return_to_zero_after_clients_leave() {
        let (a1, _) = spawn_tagged_backend(b'1');
        let mut rt = Runtime::start(proxy_config(&[a1], Algorithm::LeastConn)).unwrap();
        let proxy = rt.listen_addrs()[0];

        for _ in 0..3 {
            roundtrip(proxy).unwrap();
        }

        // Give the reactor a beat to reap the closed pairs.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let active = rt.ctx().registry.load().pools[0].backends[0]
                .active_conns
                .load(Ordering::Relaxed);
            if active == 0 || std::time::Instant::now() > deadline {
                assert_eq!(0, active);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        let b = &rt.ctx().registry.load().pools[0].backends[0];
        assert_eq!(3, b.total_conns.load(Ordering::Relaxed));

        rt.shutdown();
    }

    #[test]
    fn graceful_shutdown_drains_and_refuses_new_connections() {
        let (a1, _) = spawn_tagged_backend(b'1');
        let mut rt = Runtime::start(proxy_config(&[a1], Algorithm::RoundRobin)).unwrap();
        let proxy = rt.listen_addrs()[0];

        for _ in 0..2 {
            roundtrip(proxy).unwrap();
        }

        rt.shutdown();
        assert_eq!(0, rt.ctx().stats.active_conns.load(Ordering::Relaxed));
        assert!(TcpStream::connect(proxy).is_err());
    }

    #[test]
    fn reload_requires_a_config_path() {
        let (a1, _) = spawn_tagged_backend(b'1');
        let mut rt = Runtime::start(proxy_config(&[a1], Algorithm::RoundRobin)).unwrap();
        assert!(rt.reload().is_err());
        rt.shutdown();
    }
}

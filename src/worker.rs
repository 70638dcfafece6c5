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

//! The per-worker reactor
//!
//! Each worker owns a poll set, its slab of connection pairs, and its own
//! `SO_REUSEPORT` listener sockets; workers never share pairs or steal work.
//! Tokens carry a kind tag in the low two bits and the slab key above, so a
//! batch event always resolves to {listener, client-side, backend-side}
//! without fd aliasing.
//!
//! Reclamation is strictly deferred: closing a pair deregisters and closes
//! both sockets, marks the slot Terminating, and queues the key; the slot
//! itself is only removed at the top of the next loop iteration. An event
//! for the dead pair later in the same batch finds a Terminating slot and is
//! dropped, and the slot cannot be reused mid-batch because it is still
//! occupied.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, Registry};
use crate::balance::{self, SelectKey};
use crate::config::{Algorithm, Mode};
use crate::inspect;
use crate::listener::{BoundListener, ListenerState};
use crate::pair::{Pair, PairState};
use crate::runtime::Shared;
use crate::sticky::StickyKey;

const TAG_LISTENER: usize = 0;
const TAG_CLIENT: usize = 1;
const TAG_BACKEND: usize = 2;
const TAG_BITS: usize = 2;
const TAG_MASK: usize = (1 << TAG_BITS) - 1;

const EVENTS_CAPACITY: usize = 1024;
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[inline]
fn token(tag: usize, index: usize) -> Token {
    Token(index << TAG_BITS | tag)
}

/// What to do with a pair after routing was attempted.
enum RouteDecision {
    /// Not enough bytes to derive the routing key yet.
    Wait,
    /// Client disappeared before anything routable arrived.
    Gone,
    /// No backend available; close the client and count the rejection.
    Abort,
    Connect(Arc<Backend>, Duration),
}

/// One reactor thread.
#[derive(Debug)]
pub struct Worker {
    id: usize,
    poll: Poll,
    pairs: Slab<Pair>,
    /// Deferred-reclamation queue; drained at the top of each iteration.
    reclaim: Vec<usize>,
    listeners: Vec<BoundListener>,
    ctx: Arc<Shared>,
    scratch: Vec<u8>,
    next_sweep: Instant,
    drain_deadline: Option<Instant>,
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<Shared>, listeners: Vec<BoundListener>) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let mut worker = Self {
            id,
            poll,
            pairs: Slab::new(),
            reclaim: Vec::new(),
            listeners,
            ctx,
            scratch: Vec::new(),
            next_sweep: Instant::now(),
            drain_deadline: None,
        };
        worker.scratch = vec![0u8; worker.ctx.cfg.bufsize];

        for idx in 0..worker.listeners.len() {
            let li = &mut worker.listeners[idx];
            worker
                .poll
                .registry()
                .register(&mut li.io, token(TAG_LISTENER, idx), Interest::READABLE)?;
            li.registered = true;
            li.shared.set_state(ListenerState::Ready);
        }

        Ok(worker)
    }

    /// The reactor loop. Returns once shutdown has been observed and every
    /// pair is reclaimed.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        info!(worker = self.id, listeners = self.listeners.len(), "worker started");

        loop {
            self.drain_reclaim();

            if !self.ctx.running.load(Ordering::Acquire) {
                if self.drain_deadline.is_none() {
                    self.begin_drain();
                }
                if self.pairs.is_empty() {
                    break;
                }
                if self.drain_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    warn!(worker = self.id, leftover = self.pairs.len(), "drain deadline hit");
                    self.force_close_all();
                    self.drain_reclaim();
                    break;
                }
            }

            // The poll timeout doubles as the deadline check cadence and the
            // shutdown-flag observation bound.
            match self.poll.poll(&mut events, Some(SWEEP_INTERVAL)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(worker = self.id, error = %e, "poll failed");
                    break;
                }
            }

            for event in events.iter() {
                let raw = event.token().0;
                match raw & TAG_MASK {
                    TAG_LISTENER => self.on_listener(raw >> TAG_BITS),
                    TAG_CLIENT => self.on_client(raw >> TAG_BITS, event),
                    TAG_BACKEND => self.on_backend(raw >> TAG_BITS, event),
                    _ => {}
                }
            }

            self.sweep(Instant::now());
        }

        info!(worker = self.id, "worker stopped");
    }

    fn drain_reclaim(&mut self) {
        for key in std::mem::take(&mut self.reclaim) {
            let _ = self.pairs.try_remove(key);
        }
    }

    /// First phase of shutdown: stop accepting. Listener sockets are
    /// deregistered here and closed when the worker drops.
    fn begin_drain(&mut self) {
        self.drain_deadline = Some(Instant::now() + self.ctx.cfg.drain_timeout);
        for li in &mut self.listeners {
            if li.registered {
                self.poll.registry().deregister(&mut li.io).ok();
                li.registered = false;
            }
            li.shared.set_state(ListenerState::Paused);
        }
        info!(worker = self.id, live = self.pairs.len(), "draining");
    }

    fn force_close_all(&mut self) {
        let keys: Vec<usize> = self.pairs.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.terminate(key);
        }
    }

    // ------------------------------------------------------------------
    // Accept path
    // ------------------------------------------------------------------

    fn on_listener(&mut self, idx: usize) {
        loop {
            match self.listeners[idx].io.accept() {
                Ok((stream, peer)) => self.admit(idx, stream, peer),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EMFILE/ENFILE and friends: count it, leave the rest of
                    // the backlog for the next wakeup as a brief backoff.
                    self.ctx.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(worker = self.id, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, listener: usize, stream: TcpStream, peer: SocketAddr) {
        let shared = self.listeners[listener].shared.clone();

        let active = self.ctx.stats.active_conns.load(Ordering::Relaxed);
        if active >= self.ctx.cfg.maxconn as u64 || !shared.admits() {
            // Admission control: accept then close immediately.
            self.ctx.stats.rejected_conns.fetch_add(1, Ordering::Relaxed);
            if !shared.admits() {
                shared.set_state(ListenerState::Full);
            }
            drop(stream);
            return;
        }

        let mut stream = stream;
        stream.set_nodelay(true).ok();

        let entry = self.pairs.vacant_entry();
        let key = entry.key();
        if self
            .poll
            .registry()
            .register(&mut stream, token(TAG_CLIENT, key), Interest::READABLE)
            .is_err()
        {
            // Out of reactor resources: drop the accepted fd on the floor.
            self.ctx.stats.rejected_conns.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let now = Instant::now();
        let serial = self.ctx.serial.fetch_add(1, Ordering::Relaxed);
        let spill_initial = self.ctx.cfg.bufsize.min(4096);
        let mut pair = Pair::new(
            serial,
            stream,
            peer,
            shared.frontend,
            listener,
            spill_initial,
            self.ctx.cfg.maxspill,
            now,
        );
        pair.client_armed = Some(Interest::READABLE);
        entry.insert(pair);

        shared.conns.fetch_add(1, Ordering::Relaxed);
        self.ctx.stats.total_conns.fetch_add(1, Ordering::Relaxed);
        self.ctx.stats.active_conns.fetch_add(1, Ordering::Relaxed);
        debug!(worker = self.id, %peer, serial, "accepted");
    }

    // ------------------------------------------------------------------
    // Client-side events
    // ------------------------------------------------------------------

    fn on_client(&mut self, key: usize, event: &Event) {
        let now = Instant::now();
        let scratch = &mut self.scratch;
        let Some(pair) = self.pairs.get_mut(key) else { return };
        if pair.state == PairState::Terminating {
            return;
        }

        if event.is_writable() && !pair.down.is_empty() {
            if let Err(e) = pair.drain_to_client() {
                debug!(serial = pair.serial, error = %e, "client write failed");
                self.terminate(key);
                return;
            }
        }

        let mut route = false;
        if event.is_readable() || event.is_read_closed() {
            match pair.pump_client(scratch, now) {
                Ok(result) => {
                    if result.read > 0 {
                        self.ctx.stats.bytes_in.fetch_add(result.read, Ordering::Relaxed);
                    }
                    route = pair.state == PairState::AwaitingClient;
                }
                Err(e) => {
                    // Resets mid-stream are normal termination.
                    debug!(serial = pair.serial, error = %e, "client read failed");
                    self.terminate(key);
                    return;
                }
            }
        }

        if route {
            self.try_route(key, now);
        }
        self.settle(key, now);
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    fn try_route(&mut self, key: usize, now: Instant) {
        let registry = self.ctx.registry.load_full();

        let decision = {
            let Some(pair) = self.pairs.get_mut(key) else { return };
            if pair.state != PairState::AwaitingClient {
                return;
            }

            if pair.client_eof && pair.up.is_empty() {
                RouteDecision::Gone
            } else if pair.up.is_empty() && !pair.client_eof {
                RouteDecision::Wait
            } else {
                route_pair(&registry, pair, now)
            }
        };

        match decision {
            RouteDecision::Wait => {}
            RouteDecision::Gone => self.terminate(key),
            RouteDecision::Abort => {
                self.ctx.stats.rejected_conns.fetch_add(1, Ordering::Relaxed);
                self.terminate(key);
            }
            RouteDecision::Connect(backend, timeout) => {
                self.start_connect(key, backend, timeout, now);
            }
        }
    }

    fn start_connect(&mut self, key: usize, backend: Arc<Backend>, timeout: Duration, now: Instant) {
        let connect = TcpStream::connect(backend.addr);
        let registry = self.poll.registry();

        let failed = {
            let Some(pair) = self.pairs.get_mut(key) else { return };
            pair.attempts += 1;
            backend.enter();
            pair.bound_epoch = backend.kill_epoch.load(Ordering::Relaxed);
            pair.backend_ref = Some(backend.clone());
            pair.state = PairState::Connecting;
            pair.connect_started = Some(now);
            pair.connect_deadline = Some(now + timeout);

            match connect {
                Ok(mut stream) => {
                    stream.set_nodelay(true).ok();
                    match registry.register(&mut stream, token(TAG_BACKEND, key), Interest::WRITABLE)
                    {
                        Ok(()) => {
                            pair.backend = Some(stream);
                            pair.backend_armed = Some(Interest::WRITABLE);
                            false
                        }
                        Err(_) => true,
                    }
                }
                Err(_) => true,
            }
        };

        if failed {
            self.connect_failed(key, now);
        }
    }

    /// A connect attempt died (refused, unreachable, registration failure,
    /// or timeout). Retries the same backend up to the pool's budget, then
    /// redispatches once if allowed, then gives up on the client.
    fn connect_failed(&mut self, key: usize, now: Instant) {
        self.ctx.stats.connect_errors.fetch_add(1, Ordering::Relaxed);
        let registry = self.ctx.registry.load_full();

        enum Next {
            Retry(Arc<Backend>, Duration),
            Redispatch(Duration),
            Abort,
        }

        let next = {
            let Some(pair) = self.pairs.get_mut(key) else { return };
            let failed_backend = match pair.backend_ref.take() {
                Some(b) => {
                    b.failed_conns.fetch_add(1, Ordering::Relaxed);
                    b.leave();
                    b
                }
                None => {
                    // Nothing bound; nothing to retry against.
                    self.reclaim_backend_stream(key);
                    return;
                }
            };
            if let Some(mut stream) = pair.backend.take() {
                self.poll.registry().deregister(&mut stream).ok();
            }
            pair.backend_armed = None;
            pair.connect_deadline = None;
            pair.connect_started = None;

            let pool = &registry.pools[registry.frontends[pair.frontend].pool];
            let budget = 1 + pool.retries;
            if pair.attempts < budget {
                Next::Retry(failed_backend, pool.connect_timeout)
            } else if pool.redispatch && !pair.redispatched {
                pair.redispatched = true;
                pair.attempts = 0;
                pair.tried.push(failed_backend.id);
                Next::Redispatch(pool.connect_timeout)
            } else {
                Next::Abort
            }
        };

        match next {
            Next::Retry(backend, timeout) => {
                debug!(worker = self.id, backend = %backend.name, "retrying connect");
                self.start_connect(key, backend, timeout, now);
            }
            Next::Redispatch(timeout) => {
                let choice = {
                    let Some(pair) = self.pairs.get_mut(key) else { return };
                    let pool = &registry.pools[registry.frontends[pair.frontend].pool];
                    let choice =
                        balance::select(pool, SelectKey::Addr(pair.peer.ip()), &pair.tried);
                    if let (Some(b), Some((table, sref))) = (&choice, &pair.sticky) {
                        // The sticky mapping followed the dead backend; repoint it.
                        table.rebind(sref, b.id);
                    }
                    choice
                };
                match choice {
                    Some(backend) => {
                        debug!(worker = self.id, backend = %backend.name, "redispatching");
                        self.start_connect(key, backend, timeout, now);
                    }
                    None => {
                        self.terminate(key);
                    }
                }
            }
            Next::Abort => {
                self.terminate(key);
            }
        }
    }

    /// Deregisters and drops a half-set-up backend stream.
    fn reclaim_backend_stream(&mut self, key: usize) {
        let registry = self.poll.registry();
        if let Some(pair) = self.pairs.get_mut(key) {
            if let Some(mut stream) = pair.backend.take() {
                registry.deregister(&mut stream).ok();
            }
            pair.backend_armed = None;
        }
    }

    // ------------------------------------------------------------------
    // Backend-side events
    // ------------------------------------------------------------------

    fn on_backend(&mut self, key: usize, event: &Event) {
        let now = Instant::now();

        let state = match self.pairs.get(key) {
            Some(pair) if pair.state != PairState::Terminating => pair.state,
            _ => return,
        };

        if state == PairState::Connecting {
            match self.finish_connect(key, event) {
                ConnectProgress::Pending => {}
                ConnectProgress::Established => self.established(key, now),
                ConnectProgress::Failed => self.connect_failed(key, now),
            }
            return;
        }

        let scratch = &mut self.scratch;
        let Some(pair) = self.pairs.get_mut(key) else { return };

        if event.is_writable() && !pair.up.is_empty() {
            if let Err(e) = pair.drain_to_backend() {
                debug!(serial = pair.serial, error = %e, "backend write failed");
                self.terminate(key);
                return;
            }
        }

        if event.is_readable() || event.is_read_closed() {
            match pair.pump_backend(scratch, now) {
                Ok(result) => {
                    if result.read > 0 {
                        self.ctx.stats.bytes_out.fetch_add(result.read, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    debug!(serial = pair.serial, error = %e, "backend read failed");
                    self.terminate(key);
                    return;
                }
            }
        }

        self.settle(key, now);
    }

    fn finish_connect(&mut self, key: usize, event: &Event) -> ConnectProgress {
        let Some(pair) = self.pairs.get_mut(key) else {
            return ConnectProgress::Pending;
        };
        let Some(stream) = pair.backend.as_ref() else {
            return ConnectProgress::Failed;
        };

        if event.is_error() {
            return ConnectProgress::Failed;
        }
        if !event.is_writable() {
            return ConnectProgress::Pending;
        }

        // Writable after a non-blocking connect: either it succeeded or the
        // socket carries the error.
        match stream.take_error() {
            Ok(Some(_)) | Err(_) => ConnectProgress::Failed,
            Ok(None) => match stream.peer_addr() {
                Ok(_) => ConnectProgress::Established,
                Err(ref e) if e.kind() == ErrorKind::NotConnected => ConnectProgress::Pending,
                Err(_) => ConnectProgress::Failed,
            },
        }
    }

    fn established(&mut self, key: usize, now: Instant) {
        let flush_failed = {
            let Some(pair) = self.pairs.get_mut(key) else { return };
            pair.state = PairState::Streaming;
            pair.connect_deadline = None;
            if let (Some(started), Some(backend)) = (pair.connect_started.take(), &pair.backend_ref)
            {
                backend.observe_response_time(now.duration_since(started));
            }
            debug!(serial = pair.serial, "backend established");
            // First flush of the bytes that triggered routing.
            pair.drain_to_backend().is_err()
        };

        if flush_failed {
            self.terminate(key);
            return;
        }
        self.settle(key, now);
    }

    // ------------------------------------------------------------------
    // State upkeep
    // ------------------------------------------------------------------

    /// Applies pending half-closes, decides termination, and reconciles the
    /// registered interest of both fds with what the pair now needs.
    fn settle(&mut self, key: usize, _now: Instant) {
        let terminate = {
            let Some(pair) = self.pairs.get_mut(key) else { return };
            if pair.state == PairState::Terminating {
                return;
            }

            match pair.state {
                PairState::AwaitingClient => pair.client_eof && pair.up.is_empty(),
                PairState::Connecting => false,
                _ => {
                    if pair.client_eof && pair.up.is_empty() && !pair.backend_shut {
                        if let Some(backend) = &pair.backend {
                            backend.shutdown(std::net::Shutdown::Write).ok();
                        }
                        pair.backend_shut = true;
                        if pair.state == PairState::Streaming {
                            pair.state = PairState::HalfClosedFromClient;
                        }
                    }
                    if pair.backend_eof && pair.down.is_empty() && !pair.client_shut {
                        if let Some(client) = &pair.client {
                            client.shutdown(std::net::Shutdown::Write).ok();
                        }
                        pair.client_shut = true;
                        if pair.state == PairState::Streaming {
                            pair.state = PairState::HalfClosedFromBackend;
                        }
                    }
                    pair.fully_drained()
                }
            }
        };

        if terminate {
            self.terminate(key);
            return;
        }
        self.rearm(key);
    }

    /// Reregisters an fd only when its desired interest changed.
    fn rearm(&mut self, key: usize) {
        let registry = self.poll.registry();
        let Some(pair) = self.pairs.get_mut(key) else { return };

        let want = pair.desired_client_interest();
        if want != pair.client_armed {
            if let Some(stream) = pair.client.as_mut() {
                let tok = token(TAG_CLIENT, key);
                let result = match (pair.client_armed, want) {
                    (Some(_), Some(interest)) => registry.reregister(stream, tok, interest),
                    (None, Some(interest)) => registry.register(stream, tok, interest),
                    (Some(_), None) => registry.deregister(stream),
                    (None, None) => Ok(()),
                };
                if result.is_ok() {
                    pair.client_armed = want;
                }
            }
        }

        let want = pair.desired_backend_interest();
        if want != pair.backend_armed {
            if let Some(stream) = pair.backend.as_mut() {
                let tok = token(TAG_BACKEND, key);
                let result = match (pair.backend_armed, want) {
                    (Some(_), Some(interest)) => registry.reregister(stream, tok, interest),
                    (None, Some(interest)) => registry.register(stream, tok, interest),
                    (Some(_), None) => registry.deregister(stream),
                    (None, None) => Ok(()),
                };
                if result.is_ok() {
                    pair.backend_armed = want;
                }
            }
        }
    }

    /// Decision-to-close: deregister both fds, close them, neutralize the
    /// slot, settle every counter exactly once, and queue the key for the
    /// deferred reclamation drain.
    fn terminate(&mut self, key: usize) {
        let registry = self.poll.registry();
        let Some(pair) = self.pairs.get_mut(key) else { return };
        if pair.state == PairState::Terminating {
            return;
        }
        pair.state = PairState::Terminating;

        if let Some(mut stream) = pair.client.take() {
            registry.deregister(&mut stream).ok();
            drop(stream);
        }
        if let Some(mut stream) = pair.backend.take() {
            registry.deregister(&mut stream).ok();
            drop(stream);
        }
        pair.client_armed = None;
        pair.backend_armed = None;

        if let Some(backend) = pair.backend_ref.take() {
            backend.leave();
            backend.bytes_in.fetch_add(pair.bytes_up, Ordering::Relaxed);
            backend.bytes_out.fetch_add(pair.bytes_down, Ordering::Relaxed);
        }
        if let Some((table, sref)) = pair.sticky.take() {
            table.release(sref, pair.bytes_up, pair.bytes_down);
        }

        let listener = pair.listener;
        let serial = pair.serial;
        debug!(worker = self.id, serial, "pair terminated");

        self.ctx.stats.active_conns.fetch_sub(1, Ordering::Relaxed);
        let shared = &self.listeners[listener].shared;
        shared.conns.fetch_sub(1, Ordering::Relaxed);
        if shared.state() == ListenerState::Full && shared.admits() {
            shared.set_state(ListenerState::Ready);
        }

        self.reclaim.push(key);
    }

    // ------------------------------------------------------------------
    // Periodic sweep
    // ------------------------------------------------------------------

    fn sweep(&mut self, now: Instant) {
        if now < self.next_sweep {
            return;
        }
        self.next_sweep = now + SWEEP_INTERVAL;

        let idle_timeout = self.ctx.cfg.idle_timeout;
        let mut timed_out_connects = Vec::new();
        let mut expired = Vec::new();

        for (key, pair) in self.pairs.iter() {
            if pair.state == PairState::Terminating {
                continue;
            }
            if let Some(deadline) = pair.connect_deadline {
                if now >= deadline {
                    timed_out_connects.push(key);
                    continue;
                }
            }
            if pair.state != PairState::Connecting
                && now.duration_since(pair.last_activity) > idle_timeout
            {
                expired.push(key);
                continue;
            }
            if let Some(backend) = &pair.backend_ref {
                if backend.kill_epoch.load(Ordering::Relaxed) > pair.bound_epoch {
                    expired.push(key);
                }
            }
        }

        for key in timed_out_connects {
            self.connect_failed(key, now);
        }
        for key in expired {
            self.terminate(key);
        }

        let registry = self.ctx.registry.load_full();
        for pool in &registry.pools {
            if let Some(table) = &pool.sticky {
                table.maybe_expire(now);
            }
        }

        self.sync_listeners();
    }

    /// Applies admin pause/resume to this worker's sockets.
    fn sync_listeners(&mut self) {
        if !self.ctx.running.load(Ordering::Acquire) {
            return;
        }
        for idx in 0..self.listeners.len() {
            let desired = self.listeners[idx].shared.state();
            let registered = self.listeners[idx].registered;
            match desired {
                ListenerState::Paused if registered => {
                    let li = &mut self.listeners[idx];
                    self.poll.registry().deregister(&mut li.io).ok();
                    li.registered = false;
                }
                ListenerState::Ready | ListenerState::Full if !registered => {
                    let li = &mut self.listeners[idx];
                    if self
                        .poll
                        .registry()
                        .register(&mut li.io, token(TAG_LISTENER, idx), Interest::READABLE)
                        .is_ok()
                    {
                        li.registered = true;
                    }
                }
                _ => {}
            }
        }
    }
}

enum ConnectProgress {
    Pending,
    Established,
    Failed,
}

/// Derives the routing key and consults sticky state, then the base
/// algorithm. Runs with the pair borrowed; performs no I/O.
fn route_pair(registry: &Registry, pair: &mut Pair, now: Instant) -> RouteDecision {
    let fe = &registry.frontends[pair.frontend];
    let pool = &registry.pools[fe.pool];

    let peeks_payload = fe.mode == Mode::Http
        && matches!(
            pool.algorithm,
            Algorithm::Uri | Algorithm::UrlParam(_) | Algorithm::Header(_)
        );
    if peeks_payload
        && !inspect::head_complete(pair.up.pending())
        && !pair.client_eof
        && !pair.up.is_saturated()
    {
        return RouteDecision::Wait;
    }

    // Sticky consultation comes before the base algorithm.
    let sticky_key = if pool.sticky.is_some() && pool.stick_on_src {
        Some(StickyKey::from_addr(pair.peer.ip()))
    } else {
        None
    };

    if let (Some(table), Some(skey)) = (&pool.sticky, &sticky_key) {
        if let Some((id, sref)) = table.acquire(skey, now) {
            match pool.backend(id) {
                Some(backend) if backend.is_eligible(true) => {
                    pair.sticky = Some((table.clone(), sref));
                    return RouteDecision::Connect(backend.clone(), pool.connect_timeout);
                }
                _ => table.release(sref, 0, 0),
            }
        }
    }

    let head = pair.up.pending();
    let select_key = match &pool.algorithm {
        Algorithm::Source => SelectKey::Addr(pair.peer.ip()),
        Algorithm::Uri if peeks_payload => match inspect::request_path(head) {
            Some(path) => SelectKey::Bytes(path),
            None => SelectKey::Addr(pair.peer.ip()),
        },
        Algorithm::UrlParam(name) if peeks_payload => match inspect::query_param(head, name) {
            Some(value) => SelectKey::Bytes(value),
            None => SelectKey::Addr(pair.peer.ip()),
        },
        Algorithm::Header(name) if peeks_payload => match inspect::header_value(head, name) {
            Some(value) => SelectKey::Bytes(value),
            None => SelectKey::Addr(pair.peer.ip()),
        },
        Algorithm::Uri | Algorithm::UrlParam(_) | Algorithm::Header(_) => {
            SelectKey::Addr(pair.peer.ip())
        }
        _ => SelectKey::None,
    };

    let chosen = match balance::select(pool, select_key, &[]) {
        Some(backend) => backend,
        None => return RouteDecision::Abort,
    };

    // Record the fresh decision; a concurrent inserter's mapping wins if it
    // is still usable.
    if let (Some(table), Some(skey)) = (&pool.sticky, &sticky_key) {
        if let Some((winner, sref)) = table.acquire_insert(skey, chosen.id, now) {
            if winner != chosen.id {
                match pool.backend(winner) {
                    Some(other) if other.is_eligible(true) => {
                        pair.sticky = Some((table.clone(), sref));
                        return RouteDecision::Connect(other.clone(), pool.connect_timeout);
                    }
                    _ => table.rebind(&sref, chosen.id),
                }
            }
            pair.sticky = Some((table.clone(), sref));
        }
    }

    RouteDecision::Connect(chosen, pool.connect_timeout)
}

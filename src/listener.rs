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

//! Listener pool
//!
//! Every worker binds its own socket per configured address with
//! `SO_REUSEPORT`, letting the kernel fan accepts out across workers.
//! Cross-worker listener state (connection count, pause/resume) lives in a
//! shared record per bind address; registration with each worker's poll set
//! follows that state. Closing is two-phase: deregister from the reactor,
//! then drop the socket.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};

use crate::backend::Registry;
use crate::config::BindConfig;

/// Lifecycle of a bound address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListenerState {
    /// Configured but not yet bound.
    Assigned = 0,
    /// Bound and accepting.
    Ready = 1,
    /// Accepting suspended; inflight connections continue.
    Paused = 2,
    /// At its connection cap.
    Full = 3,
}

impl ListenerState {
    fn from_u8(raw: u8) -> ListenerState {
        match raw {
            0 => ListenerState::Assigned,
            1 => ListenerState::Ready,
            2 => ListenerState::Paused,
            _ => ListenerState::Full,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ListenerState::Assigned => "ASSIGNED",
            ListenerState::Ready => "READY",
            ListenerState::Paused => "PAUSED",
            ListenerState::Full => "FULL",
        }
    }
}

/// State shared by all workers' sockets for one bind address.
#[derive(Debug)]
pub struct ListenerShared {
    pub addr: SocketAddr,
    /// Index into the registry's frontend list.
    pub frontend: usize,
    /// Per-frontend connection cap; 0 means unlimited.
    pub maxconn: u32,
    pub conns: AtomicU32,
    state: AtomicU8,
}

impl ListenerShared {
    pub fn new(addr: SocketAddr, frontend: usize, maxconn: u32) -> Self {
        Self {
            addr,
            frontend,
            maxconn,
            conns: AtomicU32::new(0),
            state: AtomicU8::new(ListenerState::Assigned as u8),
        }
    }

    #[inline]
    pub fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: ListenerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// True when a new connection fits under the cap.
    #[inline]
    pub fn admits(&self) -> bool {
        self.maxconn == 0 || self.conns.load(Ordering::Relaxed) < self.maxconn
    }
}

/// One worker's socket for one bind address.
#[derive(Debug)]
pub struct BoundListener {
    pub io: TcpListener,
    pub shared: Arc<ListenerShared>,
    pub registered: bool,
}

/// Creates the shared listener records for every bind of every frontend, in
/// flattened declaration order.
pub fn shared_for_registry(registry: &Registry) -> Vec<Arc<ListenerShared>> {
    let mut out = Vec::new();
    for (fe_idx, fe) in registry.frontends.iter().enumerate() {
        for bind in &fe.binds {
            out.push(Arc::new(ListenerShared::new(bind.addr, fe_idx, fe.maxconn)));
        }
    }
    out
}

/// Binds this worker's own socket set, one per shared record.
pub fn bind_worker_set(
    registry: &Registry,
    shared: &[Arc<ListenerShared>],
) -> io::Result<Vec<BoundListener>> {
    let mut out = Vec::with_capacity(shared.len());
    let mut cursor = 0;
    for fe in &registry.frontends {
        for bind in &fe.binds {
            let std_listener = bind_socket(bind)?;
            out.push(BoundListener {
                io: TcpListener::from_std(std_listener),
                shared: shared[cursor].clone(),
                registered: false,
            });
            cursor += 1;
        }
    }
    Ok(out)
}

/// Binds one non-blocking listening socket with the full option set:
/// `SO_REUSEADDR`, `SO_REUSEPORT`, linger 0, generous socket buffers, and
/// `TCP_DEFER_ACCEPT` when requested.
pub fn bind_socket(bind: &BindConfig) -> io::Result<std::net::TcpListener> {
    let domain = Domain::for_address(bind.addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_linger(Some(Duration::ZERO))?;
    socket.set_recv_buffer_size(1 << 20).ok();
    socket.set_send_buffer_size(1 << 20).ok();
    socket.set_nonblocking(true)?;

    socket.bind(&bind.addr.into())?;
    socket.listen(bind.backlog.min(i32::MAX as u32) as i32)?;

    #[cfg(target_os = "linux")]
    if bind.defer_accept {
        set_defer_accept(&socket)?;
    }

    Ok(socket.into())
}

#[cfg(target_os = "linux")]
fn set_defer_accept(socket: &Socket) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let secs: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_DEFER_ACCEPT,
            &secs as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn any_bind() -> BindConfig {
        BindConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            backlog: 128,
            defer_accept: true,
            ssl: false,
        }
    }

    #[test]
    fn binds_a_nonblocking_listener() {
        let listener = bind_socket(&any_bind()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(0, addr.port());

        // Non-blocking accept on an idle socket must not hang.
        let err = listener.accept().unwrap_err();
        assert_eq!(std::io::ErrorKind::WouldBlock, err.kind());
    }

    #[cfg(unix)]
    #[test]
    fn reuseport_allows_parallel_binds() {
        let first = bind_socket(&any_bind()).unwrap();
        let addr = first.local_addr().unwrap();
        let again = BindConfig { addr, ..any_bind() };
        // A second worker binding the same address must succeed.
        let second = bind_socket(&again);
        assert!(second.is_ok(), "{second:?}");
    }

    #[test]
    fn shared_state_transitions() {
        let shared = ListenerShared::new("127.0.0.1:80".parse().unwrap(), 0, 2);
        assert_eq!(ListenerState::Assigned, shared.state());
        shared.set_state(ListenerState::Ready);
        assert_eq!(ListenerState::Ready, shared.state());

        assert!(shared.admits());
        shared.conns.store(2, Ordering::Relaxed);
        assert!(!shared.admits());
    }
}

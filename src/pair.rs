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

//! The connection pair
//!
//! One proxied flow: the client socket, the backend socket once selected,
//! and a spill buffer per direction. The pair owns no syscalls of its own
//! scheduling — the worker drives it off readiness events — but the byte
//! movement (read-until-EAGAIN, forward, spill on short write) lives here.

use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use mio::net::TcpStream;
use mio::Interest;

use crate::backend::{Backend, BackendId};
use crate::buffer::Spill;
use crate::sticky::{StickyRef, StickyTable};

/// Lifecycle of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    /// Client accepted; waiting for the first bytes to route on.
    AwaitingClient,
    /// Non-blocking connect to the chosen backend is in flight.
    Connecting,
    Streaming,
    HalfClosedFromClient,
    HalfClosedFromBackend,
    /// Both fds closed and deregistered; the slot is awaiting deferred
    /// reclamation and ignores any event still in the batch.
    Terminating,
}

/// Result of one pump pass over a direction.
#[derive(Debug, Default, Clone, Copy)]
pub struct PumpResult {
    /// Bytes read from the source this pass.
    pub read: u64,
    pub eof: bool,
}

#[derive(Debug)]
pub struct Pair {
    pub serial: u64,
    pub client: Option<TcpStream>,
    pub backend: Option<TcpStream>,
    pub state: PairState,
    pub peer: SocketAddr,
    /// Index into the registry's frontend list; fixed at accept.
    pub frontend: usize,
    /// Index of the accepting listener in the owning worker's set.
    pub listener: usize,

    /// client → backend spill.
    pub up: Spill,
    /// backend → client spill.
    pub down: Spill,

    pub backend_ref: Option<Arc<Backend>>,
    pub sticky: Option<(Arc<StickyTable>, StickyRef)>,
    /// Connect attempts against the current backend.
    pub attempts: u32,
    pub redispatched: bool,
    pub tried: Vec<BackendId>,
    /// Kill-epoch of the backend at bind time; a later epoch on the backend
    /// means an operator asked for these sessions to be shut down.
    pub bound_epoch: u64,

    pub created: Instant,
    /// Stamped whenever bytes move in either direction; the idle timeout
    /// compares against this.
    pub last_activity: Instant,
    pub connect_deadline: Option<Instant>,
    pub connect_started: Option<Instant>,

    pub client_eof: bool,
    pub backend_eof: bool,
    /// Write-halves we have shut down after draining.
    pub client_shut: bool,
    pub backend_shut: bool,

    /// Interest currently registered for each fd; `None` = deregistered.
    pub client_armed: Option<Interest>,
    pub backend_armed: Option<Interest>,

    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl Pair {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        serial: u64,
        client: TcpStream,
        peer: SocketAddr,
        frontend: usize,
        listener: usize,
        spill_initial: usize,
        spill_cap: usize,
        now: Instant,
    ) -> Self {
        Self {
            serial,
            client: Some(client),
            backend: None,
            state: PairState::AwaitingClient,
            peer,
            frontend,
            listener,
            up: Spill::new(spill_initial, spill_cap),
            down: Spill::new(spill_initial, spill_cap),
            backend_ref: None,
            sticky: None,
            attempts: 0,
            redispatched: false,
            tried: Vec::new(),
            bound_epoch: 0,
            created: now,
            last_activity: now,
            connect_deadline: None,
            connect_started: None,
            client_eof: false,
            backend_eof: false,
            client_shut: false,
            backend_shut: false,
            client_armed: None,
            backend_armed: None,
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    /// Reads the client until EAGAIN, forwarding towards the backend (or
    /// accumulating in the up spill while none is connected).
    pub fn pump_client(&mut self, scratch: &mut [u8], now: Instant) -> std::io::Result<PumpResult> {
        let src = match self.client.as_mut() {
            Some(src) => src,
            None => return Ok(PumpResult::default()),
        };
        let result = pump(src, self.backend.as_mut(), &mut self.up, scratch)?;
        if result.read > 0 {
            self.last_activity = now;
            self.bytes_up += result.read;
        }
        if result.eof {
            self.client_eof = true;
        }
        Ok(result)
    }

    /// Reads the backend until EAGAIN, forwarding towards the client.
    pub fn pump_backend(&mut self, scratch: &mut [u8], now: Instant) -> std::io::Result<PumpResult> {
        let src = match self.backend.as_mut() {
            Some(src) => src,
            None => return Ok(PumpResult::default()),
        };
        let result = pump(src, self.client.as_mut(), &mut self.down, scratch)?;
        if result.read > 0 {
            self.last_activity = now;
            self.bytes_down += result.read;
        }
        if result.eof {
            self.backend_eof = true;
        }
        Ok(result)
    }

    /// Drains the up spill into the backend; true when empty afterwards.
    pub fn drain_to_backend(&mut self) -> std::io::Result<bool> {
        let dst = match self.backend.as_mut() {
            Some(dst) => dst,
            None => return Ok(self.up.is_empty()),
        };
        let n = write_some(dst, self.up.pending())?;
        self.up.consume(n);
        Ok(self.up.is_empty())
    }

    /// Drains the down spill into the client; true when empty afterwards.
    pub fn drain_to_client(&mut self) -> std::io::Result<bool> {
        let dst = match self.client.as_mut() {
            Some(dst) => dst,
            None => return Ok(self.down.is_empty()),
        };
        let n = write_some(dst, self.down.pending())?;
        self.down.consume(n);
        Ok(self.down.is_empty())
    }

    /// Interest the client fd should be registered with right now.
    pub fn desired_client_interest(&self) -> Option<Interest> {
        if self.state == PairState::Terminating || self.client.is_none() {
            return None;
        }
        let read = !self.client_eof && !self.up.is_saturated();
        let write = !self.down.is_empty();
        interest_of(read, write)
    }

    /// Interest the backend fd should be registered with right now.
    pub fn desired_backend_interest(&self) -> Option<Interest> {
        if self.state == PairState::Terminating || self.backend.is_none() {
            return None;
        }
        if self.state == PairState::Connecting {
            return Some(Interest::WRITABLE);
        }
        let read = !self.backend_eof && !self.down.is_saturated();
        let write = !self.up.is_empty();
        interest_of(read, write)
    }

    /// Both directions have seen EOF and every spilled byte was delivered.
    pub fn fully_drained(&self) -> bool {
        self.client_eof && self.backend_eof && self.up.is_empty() && self.down.is_empty()
    }
}

fn interest_of(read: bool, write: bool) -> Option<Interest> {
    match (read, write) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// One read-until-EAGAIN pass: bytes go straight to `dst` when the spill is
/// empty, otherwise behind the spill so ordering holds. Reading stops at the
/// spill cap — backpressure — and resumes once the spill drains.
fn pump<S, D>(
    src: &mut S,
    mut dst: Option<&mut D>,
    spill: &mut Spill,
    scratch: &mut [u8],
) -> std::io::Result<PumpResult>
where
    S: Read,
    D: Write,
{
    let mut result = PumpResult::default();

    loop {
        if spill.is_saturated() {
            break;
        }
        match src.read(scratch) {
            Ok(0) => {
                result.eof = true;
                break;
            }
            Ok(n) => {
                result.read += n as u64;
                let chunk = &scratch[..n];
                if spill.is_empty() {
                    match dst.as_deref_mut() {
                        Some(d) => {
                            let written = write_some(d, chunk)?;
                            if written < n {
                                spill.push(&chunk[written..]);
                            }
                        }
                        None => spill.push(chunk),
                    }
                } else {
                    spill.push(chunk);
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(result)
}

/// Writes as much as the socket will take; EAGAIN ends the pass without
/// error.
fn write_some<D: Write>(dst: &mut D, mut buf: &[u8]) -> std::io::Result<usize> {
    let mut written = 0;
    while !buf.is_empty() {
        match dst.write(buf) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    ErrorKind::WriteZero,
                    "peer refused bytes",
                ))
            }
            Ok(n) => {
                written += n;
                buf = &buf[n..];
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

#[cfg(test)]
mod test {
    use super::{pump, write_some, PumpResult};
    use crate::buffer::Spill;
    use std::collections::VecDeque;
    use std::io::{Error, ErrorKind, Read, Result, Write};

    /// Read source yielding queued chunks, then EAGAIN (or EOF).
    struct ChunkSource {
        chunks: VecDeque<Vec<u8>>,
        eof_at_end: bool,
    }

    impl Read for ChunkSource {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None if self.eof_at_end => Ok(0),
                None => Err(Error::from(ErrorKind::WouldBlock)),
            }
        }
    }

    /// Write sink accepting a limited number of bytes before EAGAIN.
    struct ThrottledSink {
        accept: usize,
        taken: Vec<u8>,
    }

    impl Write for ThrottledSink {
        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            if self.accept == 0 {
                return Err(Error::from(ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.accept);
            self.accept -= n;
            self.taken.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn source(chunks: &[&[u8]], eof: bool) -> ChunkSource {
        ChunkSource {
            chunks: chunks.iter().map(|c| c.to_vec()).collect(),
            eof_at_end: eof,
        }
    }

    #[test]
    fn forwards_directly_when_sink_keeps_up() {
        let mut src = source(&[b"hello ", b"world"], false);
        let mut dst = ThrottledSink {
            accept: 1024,
            taken: Vec::new(),
        };
        let mut spill = Spill::new(64, 4096);
        let mut scratch = [0u8; 64];

        let r = pump(&mut src, Some(&mut dst), &mut spill, &mut scratch).unwrap();
        assert_eq!(11, r.read);
        assert!(!r.eof);
        assert_eq!(b"hello world", dst.taken.as_slice());
        assert!(spill.is_empty());
    }

    #[test]
    fn short_write_spills_remainder_in_order() {
        let mut src = source(&[b"abcdefgh"], false);
        let mut dst = ThrottledSink {
            accept: 3,
            taken: Vec::new(),
        };
        let mut spill = Spill::new(64, 4096);
        let mut scratch = [0u8; 64];

        pump(&mut src, Some(&mut dst), &mut spill, &mut scratch).unwrap();
        assert_eq!(b"abc", dst.taken.as_slice());
        assert_eq!(b"defgh", spill.pending());
    }

    #[test]
    fn spilled_bytes_stay_ahead_of_new_reads() {
        let mut spill = Spill::new(64, 4096);
        spill.push(b"queued-");

        let mut src = source(&[b"fresh"], false);
        let mut dst = ThrottledSink {
            accept: 1024,
            taken: Vec::new(),
        };
        let mut scratch = [0u8; 64];

        // Sink is writable but the spill is non-empty: new bytes must queue
        // behind it, not overtake.
        pump(&mut src, Some(&mut dst), &mut spill, &mut scratch).unwrap();
        assert!(dst.taken.is_empty());
        assert_eq!(b"queued-fresh", spill.pending());

        let n = write_some(&mut dst, spill.pending()).unwrap();
        spill.consume(n);
        assert_eq!(b"queued-fresh", dst.taken.as_slice());
        assert!(spill.is_empty());
    }

    #[test]
    fn saturation_stops_reading() {
        let mut src = source(&[&[b'x'; 32], &[b'y'; 32], &[b'z'; 32]], false);
        let mut dst = ThrottledSink {
            accept: 0,
            taken: Vec::new(),
        };
        // Cap of 64: the third chunk must stay unread in the source.
        let mut spill = Spill::new(16, 64);
        let mut scratch = [0u8; 32];

        let r = pump(&mut src, Some(&mut dst), &mut spill, &mut scratch).unwrap();
        assert_eq!(64, r.read);
        assert!(spill.is_saturated());
        assert_eq!(1, src.chunks.len());
    }

    #[test]
    fn eof_is_reported_after_final_bytes() {
        let mut src = source(&[b"tail"], true);
        let mut dst = ThrottledSink {
            accept: 1024,
            taken: Vec::new(),
        };
        let mut spill = Spill::new(64, 4096);
        let mut scratch = [0u8; 64];

        let r: PumpResult = pump(&mut src, Some(&mut dst), &mut spill, &mut scratch).unwrap();
        assert!(r.eof);
        assert_eq!(b"tail", dst.taken.as_slice());
    }

    #[test]
    fn no_destination_accumulates_in_spill() {
        let mut src = source(&[b"first-bytes"], false);
        let mut spill = Spill::new(64, 4096);
        let mut scratch = [0u8; 64];

        let r = pump::<_, ThrottledSink>(&mut src, None, &mut spill, &mut scratch).unwrap();
        assert_eq!(11, r.read);
        assert_eq!(b"first-bytes", spill.pending());
    }
}

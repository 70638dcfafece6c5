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

//! Sticky-session table
//!
//! Fixed-capacity map from client attribute to chosen backend with TTL
//! refresh on hit and LRU eviction when full. Sharded: each shard owns its
//! bucket map plus an intrusive LRU list behind one mutex, trading a small
//! hit-rate penalty for much simpler locking than per-bucket spinlocks.
//! Entries referenced by a live connection pair carry a positive ref count
//! and are never evicted or expired.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use fnv::{FnvHashMap, FnvHasher};
use parking_lot::Mutex;
use slab::Slab;
use std::hash::Hasher;

use crate::backend::BackendId;

const NIL: usize = usize::MAX;
const MAX_SHARDS: usize = 16;

/// Client attribute a session is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StickyKey {
    V4([u8; 4]),
    V6([u8; 16]),
    Int(u64),
    Bytes(Box<[u8]>),
}

impl StickyKey {
    pub fn from_addr(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => StickyKey::V4(v4.octets()),
            IpAddr::V6(v6) => StickyKey::V6(v6.octets()),
        }
    }

    fn hash(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        match self {
            StickyKey::V4(o) => hasher.write(o),
            StickyKey::V6(o) => hasher.write(o),
            StickyKey::Int(v) => hasher.write(&v.to_be_bytes()),
            StickyKey::Bytes(b) => hasher.write(b),
        }
        hasher.finish()
    }
}

/// Per-entry counter kinds.
#[derive(Debug, Clone, Copy)]
#[repr(usize)]
pub enum Counter {
    ConnCnt = 0,
    SessCnt = 1,
    BytesIn = 2,
    BytesOut = 3,
    Gp0 = 4,
    Gp1 = 5,
}

#[derive(Debug)]
struct Entry {
    key: StickyKey,
    backend: BackendId,
    created: Instant,
    expires: Instant,
    prev: usize,
    next: usize,
    ref_count: u32,
    generation: u64,
    counters: [u64; 6],
}

#[derive(Debug)]
struct Shard {
    map: FnvHashMap<StickyKey, usize>,
    entries: Slab<Entry>,
    head: usize,
    tail: usize,
    cap: usize,
}

impl Shard {
    fn new(cap: usize) -> Self {
        Self {
            map: FnvHashMap::default(),
            entries: Slab::new(),
            head: NIL,
            tail: NIL,
            cap,
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let e = &self.entries[slot];
            (e.prev, e.next)
        };
        match prev {
            NIL => self.head = next,
            p => self.entries[p].next = next,
        }
        match next {
            NIL => self.tail = prev,
            n => self.entries[n].prev = prev,
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let e = &mut self.entries[slot];
            e.prev = NIL;
            e.next = old_head;
        }
        match old_head {
            NIL => self.tail = slot,
            h => self.entries[h].prev = slot,
        }
        self.head = slot;
    }

    fn touch(&mut self, slot: usize) {
        if self.head != slot {
            self.unlink(slot);
            self.push_front(slot);
        }
    }

    fn remove(&mut self, slot: usize) -> Entry {
        self.unlink(slot);
        let entry = self.entries.remove(slot);
        self.map.remove(&entry.key);
        entry
    }

    /// Evicts the least-recently-used unreferenced entry. False when every
    /// entry is pinned by a live pair.
    fn evict_one(&mut self) -> bool {
        let mut slot = self.tail;
        while slot != NIL {
            if self.entries[slot].ref_count == 0 {
                self.remove(slot);
                return true;
            }
            slot = self.entries[slot].prev;
        }
        false
    }
}

/// Read-only view of one entry, for diagnostics.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub backend: BackendId,
    pub age: Duration,
    pub expires_in: Duration,
    pub ref_count: u32,
    pub counters: [u64; 6],
}

/// Handle held by a connection pair while it is bound to an entry. Must be
/// given back via [`StickyTable::release`].
#[derive(Debug)]
pub struct StickyRef {
    shard: usize,
    slot: usize,
    generation: u64,
}

/// The table itself. Interior mutability only; shared as `Arc<StickyTable>`
/// inside its pool.
#[derive(Debug)]
pub struct StickyTable {
    shards: Box<[Mutex<Shard>]>,
    capacity: usize,
    ttl: Duration,
    generation: AtomicU64,
    last_expire_ms: AtomicU64,
    born: Instant,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub inserts: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
}

impl StickyTable {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        let n = capacity.min(MAX_SHARDS);
        let base = capacity / n;
        let rem = capacity % n;
        let shards = (0..n)
            .map(|i| Mutex::new(Shard::new(base + usize::from(i < rem))))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            capacity,
            ttl,
            generation: AtomicU64::new(0),
            last_expire_ms: AtomicU64::new(0),
            born: Instant::now(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_idx(&self, key: &StickyKey) -> usize {
        (key.hash() % self.shards.len() as u64) as usize
    }

    /// Looks the key up; on a live hit, refreshes the TTL, touches the LRU,
    /// takes a reference, and bumps the connection counters. Expired or
    /// absent keys are misses.
    pub fn acquire(&self, key: &StickyKey, now: Instant) -> Option<(BackendId, StickyRef)> {
        let shard_idx = self.shard_idx(key);
        let mut shard = self.shards[shard_idx].lock();

        let slot = match shard.map.get(key) {
            Some(&slot) => slot,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if shard.entries[slot].expires <= now {
            if shard.entries[slot].ref_count == 0 {
                shard.remove(slot);
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        shard.touch(slot);
        let ttl = self.ttl;
        let entry = &mut shard.entries[slot];
        entry.expires = now + ttl;
        entry.ref_count += 1;
        entry.counters[Counter::ConnCnt as usize] += 1;
        entry.counters[Counter::SessCnt as usize] += 1;
        self.hits.fetch_add(1, Ordering::Relaxed);

        Some((
            entry.backend,
            StickyRef {
                shard: shard_idx,
                slot,
                generation: entry.generation,
            },
        ))
    }

    /// Records a fresh selection for the key, evicting the LRU tail if the
    /// shard is at capacity. Returns the winning mapping — which may be a
    /// concurrent inserter's — or `None` when every entry is referenced and
    /// nothing can be evicted.
    pub fn acquire_insert(
        &self,
        key: &StickyKey,
        backend: BackendId,
        now: Instant,
    ) -> Option<(BackendId, StickyRef)> {
        let shard_idx = self.shard_idx(key);
        let mut shard = self.shards[shard_idx].lock();
        let ttl = self.ttl;
        let generation = self.generation.load(Ordering::Relaxed);

        if let Some(&slot) = shard.map.get(key) {
            shard.touch(slot);
            let entry = &mut shard.entries[slot];
            if entry.expires <= now {
                // Stale mapping: this selection supersedes it.
                entry.backend = backend;
                entry.created = now;
            }
            entry.expires = now + ttl;
            entry.ref_count += 1;
            entry.counters[Counter::ConnCnt as usize] += 1;
            entry.counters[Counter::SessCnt as usize] += 1;
            return Some((
                entry.backend,
                StickyRef {
                    shard: shard_idx,
                    slot,
                    generation: entry.generation,
                },
            ));
        }

        if shard.entries.len() >= shard.cap {
            if !shard.evict_one() {
                return None;
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let mut counters = [0u64; 6];
        counters[Counter::ConnCnt as usize] = 1;
        counters[Counter::SessCnt as usize] = 1;
        let slot = shard.entries.insert(Entry {
            key: key.clone(),
            backend,
            created: now,
            expires: now + ttl,
            prev: NIL,
            next: NIL,
            ref_count: 1,
            generation,
            counters,
        });
        shard.map.insert(key.clone(), slot);
        shard.push_front(slot);
        self.inserts.fetch_add(1, Ordering::Relaxed);

        Some((
            backend,
            StickyRef {
                shard: shard_idx,
                slot,
                generation,
            },
        ))
    }

    /// Returns a pair's reference, folding its byte totals into the entry.
    /// Safe against purge: a stale generation is a no-op.
    pub fn release(&self, r: StickyRef, bytes_in: u64, bytes_out: u64) {
        let mut shard = self.shards[r.shard].lock();
        if let Some(entry) = shard.entries.get_mut(r.slot) {
            if entry.generation == r.generation {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                entry.counters[Counter::BytesIn as usize] += bytes_in;
                entry.counters[Counter::BytesOut as usize] += bytes_out;
            }
        }
    }

    /// Repoints a held entry at a different backend; used when a connect
    /// failure redispatches the session.
    pub fn rebind(&self, r: &StickyRef, backend: BackendId) {
        let mut shard = self.shards[r.shard].lock();
        if let Some(entry) = shard.entries.get_mut(r.slot) {
            if entry.generation == r.generation {
                entry.backend = backend;
            }
        }
    }

    /// Adds to one counter of a held entry.
    pub fn add(&self, r: &StickyRef, counter: Counter, delta: u64) {
        let mut shard = self.shards[r.shard].lock();
        if let Some(entry) = shard.entries.get_mut(r.slot) {
            if entry.generation == r.generation {
                entry.counters[counter as usize] += delta;
            }
        }
    }

    /// Read-only lookup for diagnostics; no LRU touch, no TTL refresh.
    pub fn lookup(&self, key: &StickyKey, now: Instant) -> Option<EntrySnapshot> {
        let shard = self.shards[self.shard_idx(key)].lock();
        let &slot = shard.map.get(key)?;
        let entry = &shard.entries[slot];
        Some(EntrySnapshot {
            backend: entry.backend,
            age: now.duration_since(entry.created),
            expires_in: entry.expires.saturating_duration_since(now),
            ref_count: entry.ref_count,
            counters: entry.counters,
        })
    }

    /// Removes every expired, unreferenced entry.
    pub fn expire(&self, now: Instant) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let mut slot = shard.tail;
            while slot != NIL {
                let prev = shard.entries[slot].prev;
                let entry = &shard.entries[slot];
                if entry.expires <= now && entry.ref_count == 0 {
                    shard.remove(slot);
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                }
                slot = prev;
            }
        }
    }

    /// Rate-limited [`StickyTable::expire`] for the reactor's sweep path.
    pub fn maybe_expire(&self, now: Instant) {
        let now_ms = now.duration_since(self.born).as_millis() as u64;
        let last = self.last_expire_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < 1_000 {
            return;
        }
        if self
            .last_expire_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.expire(now);
        }
    }

    /// Wipes the table. Held references become inert (generation bump);
    /// their release is a no-op.
    pub fn purge(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            shard.map.clear();
            shard.entries.clear();
            shard.head = NIL;
            shard.tail = NIL;
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::{Duration, Instant};

    fn key(n: u64) -> StickyKey {
        StickyKey::Int(n)
    }

    #[test]
    fn hit_returns_inserted_backend() {
        let t = StickyTable::new(64, Duration::from_secs(30));
        let now = Instant::now();

        assert!(t.acquire(&key(1), now).is_none());
        let (b, r) = t.acquire_insert(&key(1), 7, now).unwrap();
        assert_eq!(7, b);
        t.release(r, 0, 0);

        let (b, r) = t.acquire(&key(1), now + Duration::from_secs(1)).unwrap();
        assert_eq!(7, b);
        t.release(r, 10, 20);

        let snap = t.lookup(&key(1), now + Duration::from_secs(1)).unwrap();
        assert_eq!(0, snap.ref_count);
        assert_eq!(10, snap.counters[Counter::BytesIn as usize]);
        assert_eq!(20, snap.counters[Counter::BytesOut as usize]);
    }

    #[test]
    fn hits_refresh_the_ttl() {
        let t = StickyTable::new(16, Duration::from_secs(10));
        let now = Instant::now();
        let (_, r) = t.acquire_insert(&key(1), 1, now).unwrap();
        t.release(r, 0, 0);

        // Touch at t+8; entry must survive to t+17.
        let (_, r) = t.acquire(&key(1), now + Duration::from_secs(8)).unwrap();
        t.release(r, 0, 0);
        let hit = t.acquire(&key(1), now + Duration::from_secs(17));
        assert!(hit.is_some());
        t.release(hit.unwrap().1, 0, 0);
    }

    #[test]
    fn expired_entries_miss_and_get_reselected() {
        let t = StickyTable::new(16, Duration::from_secs(5));
        let now = Instant::now();
        let (_, r) = t.acquire_insert(&key(1), 1, now).unwrap();
        t.release(r, 0, 0);

        let later = now + Duration::from_secs(6);
        assert!(t.acquire(&key(1), later).is_none());

        let (b, r) = t.acquire_insert(&key(1), 2, later).unwrap();
        assert_eq!(2, b);
        t.release(r, 0, 0);
    }

    #[test]
    fn capacity_is_never_exceeded_and_lru_is_evicted() {
        // Single shard so the LRU order is total.
        let t = StickyTable::new(1, Duration::from_secs(60));
        let now = Instant::now();

        let (_, r) = t.acquire_insert(&key(1), 1, now).unwrap();
        t.release(r, 0, 0);
        let (_, r) = t.acquire_insert(&key(2), 2, now).unwrap();
        t.release(r, 0, 0);

        assert_eq!(1, t.len());
        assert!(t.acquire(&key(1), now).is_none());
        let hit = t.acquire(&key(2), now);
        assert!(hit.is_some());
        t.release(hit.unwrap().1, 0, 0);
        assert_eq!(1, t.evictions.load(Ordering::Relaxed));
    }

    #[test]
    fn referenced_entries_are_not_evicted() {
        let t = StickyTable::new(1, Duration::from_secs(60));
        let now = Instant::now();

        let (_, held) = t.acquire_insert(&key(1), 1, now).unwrap();
        // Table full of referenced entries: insertion must fail, not evict.
        assert!(t.acquire_insert(&key(2), 2, now).is_none());

        t.release(held, 0, 0);
        assert!(t.acquire_insert(&key(2), 2, now).is_some());
    }

    #[test]
    fn expire_removes_only_expired_unreferenced() {
        let t = StickyTable::new(16, Duration::from_secs(5));
        let now = Instant::now();

        let (_, held) = t.acquire_insert(&key(1), 1, now).unwrap();
        let (_, r) = t.acquire_insert(&key(2), 2, now).unwrap();
        t.release(r, 0, 0);

        t.expire(now + Duration::from_secs(10));
        // key(1) is referenced and survives; key(2) is gone.
        assert_eq!(1, t.len());
        assert!(t.lookup(&key(1), now).is_some());
        t.release(held, 0, 0);
    }

    #[test]
    fn purge_clears_and_makes_refs_inert() {
        let t = StickyTable::new(16, Duration::from_secs(60));
        let now = Instant::now();
        let (_, held) = t.acquire_insert(&key(1), 1, now).unwrap();

        t.purge();
        assert_eq!(0, t.len());
        // Releasing a pre-purge ref must not corrupt post-purge entries.
        let (_, r) = t.acquire_insert(&key(9), 9, now).unwrap();
        t.release(held, 5, 5);
        let snap = t.lookup(&key(9), now).unwrap();
        assert_eq!(1, snap.ref_count);
        assert_eq!(0, snap.counters[Counter::BytesIn as usize]);
        t.release(r, 0, 0);
    }

    #[test]
    fn keys_from_addresses_are_distinct() {
        let t = StickyTable::new(64, Duration::from_secs(60));
        let now = Instant::now();
        let k4 = StickyKey::from_addr("10.0.0.1".parse().unwrap());
        let k6 = StickyKey::from_addr("::1".parse().unwrap());
        let (_, a) = t.acquire_insert(&k4, 1, now).unwrap();
        let (_, b) = t.acquire_insert(&k6, 2, now).unwrap();
        t.release(a, 0, 0);
        t.release(b, 0, 0);
        assert_eq!(1, t.lookup(&k4, now).unwrap().backend);
        assert_eq!(2, t.lookup(&k6, now).unwrap().backend);
    }
}

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

//! Backend selection
//!
//! Pure policy over an immutable registry snapshot: given a pool, a client
//! key, and an exclusion list (for redispatch), pick an eligible backend or
//! report that none is available. Sticky-session consultation happens in the
//! reactor before falling through to the base algorithm here.

use std::net::IpAddr;
use std::sync::Arc;

use rand::Rng;

use crate::backend::{hash_addr, hash_bytes, Backend, BackendId, Pool};
use crate::config::Algorithm;

/// Key material extracted from the client for hash-based algorithms.
#[derive(Debug, Clone, Copy)]
pub enum SelectKey<'a> {
    /// Nothing usable; hash algorithms degrade to round-robin.
    None,
    Addr(IpAddr),
    Bytes(&'a [u8]),
}

impl SelectKey<'_> {
    fn hash(&self) -> Option<u64> {
        match self {
            SelectKey::None => None,
            SelectKey::Addr(addr) => Some(hash_addr(*addr)),
            SelectKey::Bytes(bytes) => Some(hash_bytes(bytes)),
        }
    }
}

/// Picks a backend for the pool, or `None` when no eligible backend exists
/// (the caller terminates the client).
pub fn select(pool: &Pool, key: SelectKey<'_>, exclude: &[BackendId]) -> Option<Arc<Backend>> {
    let eligible = eligible_set(pool, exclude);
    if eligible.is_empty() {
        return None;
    }

    let chosen = match &pool.algorithm {
        Algorithm::RoundRobin => round_robin(pool, &eligible),
        Algorithm::StaticRr => static_rr(pool, &eligible),
        Algorithm::LeastConn => least_conn(&eligible),
        Algorithm::WeightedRandom => weighted_random(&eligible),
        Algorithm::Source | Algorithm::Uri | Algorithm::UrlParam(_) | Algorithm::Header(_) => {
            match key.hash() {
                Some(hash) => ring_pick(pool, &eligible, hash),
                None => round_robin(pool, &eligible),
            }
        }
        Algorithm::ResponseTime => response_time(&eligible),
    };

    chosen.cloned()
}

/// Eligible backends in registration order. Backup servers only come into
/// play when no non-backup server is available.
fn eligible_set<'p>(pool: &'p Pool, exclude: &[BackendId]) -> Vec<&'p Arc<Backend>> {
    let usable = |b: &&Arc<Backend>| !exclude.contains(&b.id) && b.is_eligible(false);

    let primary: Vec<_> = pool
        .backends
        .iter()
        .filter(|b| !b.backup)
        .filter(|b| usable(b))
        .collect();
    if !primary.is_empty() {
        return primary;
    }
    pool.backends
        .iter()
        .filter(|b| b.backup)
        .filter(|b| usable(b))
        .collect()
}

/// Weight-aware rotation: the shared cursor walks cumulative weights, so a
/// weight-4 server is visited four times per cycle.
fn round_robin<'e>(pool: &Pool, eligible: &[&'e Arc<Backend>]) -> Option<&'e Arc<Backend>> {
    let total: u64 = eligible.iter().map(|b| b.weight() as u64).sum();
    if total == 0 {
        return None;
    }
    let mut tick = pool.next_cursor() as u64 % total;
    for b in eligible.iter().copied() {
        let w = b.weight() as u64;
        if tick < w {
            return Some(b);
        }
        tick -= w;
    }
    None
}

/// Weight-blind rotation in registration order.
fn static_rr<'e>(pool: &Pool, eligible: &[&'e Arc<Backend>]) -> Option<&'e Arc<Backend>> {
    Some(eligible[pool.next_cursor() % eligible.len()])
}

/// Minimizes `active / weight`; compared by cross-multiplication so no
/// floats are involved. Registration order breaks ties toward the lower id.
fn least_conn<'e>(eligible: &[&'e Arc<Backend>]) -> Option<&'e Arc<Backend>> {
    eligible
        .iter()
        .copied()
        .reduce(|best, b| {
            let best_load = best.active_conns.load(std::sync::atomic::Ordering::Relaxed) as u64;
            let b_load = b.active_conns.load(std::sync::atomic::Ordering::Relaxed) as u64;
            if b_load * (best.weight() as u64) < best_load * (b.weight() as u64) {
                b
            } else {
                best
            }
        })
}

fn weighted_random<'e>(eligible: &[&'e Arc<Backend>]) -> Option<&'e Arc<Backend>> {
    let total: u64 = eligible.iter().map(|b| b.weight() as u64).sum();
    if total == 0 {
        return None;
    }
    let mut pick = rand::thread_rng().gen_range(1..=total);
    for b in eligible.iter().copied() {
        let w = b.weight() as u64;
        if pick <= w {
            return Some(b);
        }
        pick -= w;
    }
    None
}

fn ring_pick<'e>(
    pool: &Pool,
    eligible: &[&'e Arc<Backend>],
    hash: u64,
) -> Option<&'e Arc<Backend>> {
    let mut allowed = vec![false; pool.backends.len()];
    for b in eligible {
        allowed[b.id as usize] = true;
    }
    let id = pool.ring.lookup(hash, |id| allowed[id as usize])?;
    eligible.iter().copied().find(|b| b.id == id)
}

/// `argmin(response_time × (active + 1))`; a cold backend (no samples yet)
/// wins immediately.
fn response_time<'e>(eligible: &[&'e Arc<Backend>]) -> Option<&'e Arc<Backend>> {
    eligible.iter().copied().reduce(|best, b| {
        let score = |x: &Arc<Backend>| {
            let active = x.active_conns.load(std::sync::atomic::Ordering::Relaxed) as u128;
            x.response_time_us() as u128 * (active + 1)
        };
        if score(b) < score(best) {
            b
        } else {
            best
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::{HealthState, Registry};
    use crate::config::{Algorithm, Config};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn pool_with(n: usize, algorithm: Algorithm) -> Registry {
        let backends: Vec<(String, u16, u32)> = (0..n)
            .map(|i| ("127.0.0.1".to_string(), 9000 + i as u16, 1))
            .collect();
        let cfg = Config::from_cli(8080, &backends, algorithm, 1, None).unwrap();
        Registry::from_config(&cfg, 1).unwrap()
    }

    #[test]
    fn round_robin_cycles_fairly() {
        let reg = pool_with(3, Algorithm::RoundRobin);
        let pool = &reg.pools[0];

        let mut counts = [0usize; 3];
        let mut order = Vec::new();
        for _ in 0..300 {
            let b = select(pool, SelectKey::None, &[]).unwrap();
            counts[b.id as usize] += 1;
            order.push(b.id);
        }
        assert_eq!([100, 100, 100], counts);
        // Cycles: any starting point, then repeating.
        for window in order.windows(3).step_by(3) {
            let mut sorted = window.to_vec();
            sorted.sort_unstable();
            assert_eq!(vec![0, 1, 2], sorted);
        }
    }

    #[test]
    fn round_robin_skips_down_backends() {
        let reg = pool_with(3, Algorithm::RoundRobin);
        let pool = &reg.pools[0];
        pool.backends[1].set_state(HealthState::Down);

        for _ in 0..10 {
            let b = select(pool, SelectKey::None, &[]).unwrap();
            assert_ne!(1, b.id);
        }
    }

    #[test]
    fn all_down_is_not_available() {
        let reg = pool_with(2, Algorithm::RoundRobin);
        let pool = &reg.pools[0];
        for b in &pool.backends {
            b.set_state(HealthState::Down);
        }
        assert!(select(pool, SelectKey::None, &[]).is_none());
    }

    #[test]
    fn least_conn_picks_minimum_and_low_id_on_tie() {
        let reg = pool_with(3, Algorithm::LeastConn);
        let pool = &reg.pools[0];
        pool.backends[0].active_conns.store(5, Ordering::Relaxed);
        pool.backends[1].active_conns.store(2, Ordering::Relaxed);
        pool.backends[2].active_conns.store(7, Ordering::Relaxed);

        let b = select(pool, SelectKey::None, &[]).unwrap();
        assert_eq!(1, b.id);

        // Tie between 0 and 1: lower id wins.
        pool.backends[0].active_conns.store(2, Ordering::Relaxed);
        let b = select(pool, SelectKey::None, &[]).unwrap();
        assert_eq!(0, b.id);
    }

    #[test]
    fn least_conn_respects_weight() {
        let reg = pool_with(2, Algorithm::LeastConn);
        let pool = &reg.pools[0];
        pool.backends[0].set_weight(4);
        pool.backends[0].active_conns.store(4, Ordering::Relaxed);
        pool.backends[1].active_conns.store(2, Ordering::Relaxed);
        // 4/4 = 1 beats 2/1 = 2.
        let b = select(pool, SelectKey::None, &[]).unwrap();
        assert_eq!(0, b.id);
    }

    #[test]
    fn source_hash_is_idempotent() {
        let reg = pool_with(5, Algorithm::Source);
        let pool = &reg.pools[0];
        let key = SelectKey::Addr("203.0.113.7".parse().unwrap());
        let a = select(pool, key, &[]).unwrap();
        let b = select(pool, key, &[]).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn source_hash_moves_few_keys_when_a_backend_drops() {
        let reg = pool_with(4, Algorithm::Source);
        let pool = &reg.pools[0];

        let addrs: Vec<IpAddr> = (0..1000u32)
            .map(|i| IpAddr::from([10, (i >> 8) as u8, (i & 0xff) as u8, 1]))
            .collect();

        let before: Vec<BackendId> = addrs
            .iter()
            .map(|&a| select(pool, SelectKey::Addr(a), &[]).unwrap().id)
            .collect();

        let down = before[0];
        pool.backends[down as usize].set_state(HealthState::Down);

        let after: Vec<BackendId> = addrs
            .iter()
            .map(|&a| select(pool, SelectKey::Addr(a), &[]).unwrap().id)
            .collect();

        let unchanged = before
            .iter()
            .zip(&after)
            .filter(|(b, a)| b == a)
            .count();
        let owned_by_down = before.iter().filter(|&&b| b == down).count();
        assert_eq!(1000 - owned_by_down, unchanged);
    }

    #[test]
    fn weighted_random_tracks_weights() {
        let reg = pool_with(2, Algorithm::WeightedRandom);
        let pool = &reg.pools[0];
        pool.backends[0].set_weight(3);
        pool.backends[1].set_weight(1);

        let mut first = 0usize;
        for _ in 0..4000 {
            if select(pool, SelectKey::None, &[]).unwrap().id == 0 {
                first += 1;
            }
        }
        // Expect ~3000; allow generous slack for the draw.
        assert!((2600..=3400).contains(&first), "{first}");
    }

    #[test]
    fn response_time_prefers_fast_idle_backends() {
        let reg = pool_with(2, Algorithm::ResponseTime);
        let pool = &reg.pools[0];
        pool.backends[0].observe_response_time(Duration::from_micros(5_000));
        pool.backends[1].observe_response_time(Duration::from_micros(1_000));
        pool.backends[1].active_conns.store(1, Ordering::Relaxed);
        // 5000×1 vs 1000×2: backend 1 still wins.
        assert_eq!(1, select(pool, SelectKey::None, &[]).unwrap().id);

        pool.backends[1].active_conns.store(9, Ordering::Relaxed);
        assert_eq!(0, select(pool, SelectKey::None, &[]).unwrap().id);
    }

    #[test]
    fn exclusion_redirects_to_another_backend() {
        let reg = pool_with(3, Algorithm::RoundRobin);
        let pool = &reg.pools[0];
        for _ in 0..10 {
            let b = select(pool, SelectKey::None, &[0, 2]).unwrap();
            assert_eq!(1, b.id);
        }
        assert!(select(pool, SelectKey::None, &[0, 1, 2]).is_none());
    }

    #[test]
    fn backups_serve_only_when_primaries_are_down() {
        let mut cfg = Config::from_cli(
            8080,
            &[
                ("127.0.0.1".to_string(), 9000, 1),
                ("127.0.0.1".to_string(), 9001, 1),
            ],
            Algorithm::RoundRobin,
            1,
            None,
        )
        .unwrap();
        cfg.backends[0].servers[1].backup = true;
        let reg = Registry::from_config(&cfg, 1).unwrap();
        let pool = &reg.pools[0];

        for _ in 0..5 {
            assert_eq!(0, select(pool, SelectKey::None, &[]).unwrap().id);
        }
        pool.backends[0].set_state(HealthState::Down);
        for _ in 0..5 {
            assert_eq!(1, select(pool, SelectKey::None, &[]).unwrap().id);
        }
    }
}

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

//! Hot-path counters and read-only snapshots
//!
//! Counters are relaxed atomics; external renderers (CSV/JSON/HTML/
//! Prometheus) consume the serializable snapshot types rather than the live
//! structures. The CSV and JSON renderings used by the control socket live
//! here too.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::backend::Registry;

/// Process-wide data-plane counters.
#[derive(Debug)]
pub struct GlobalStats {
    pub total_conns: AtomicU64,
    pub active_conns: AtomicU64,
    /// Accepts closed immediately: admission cap, allocation failure, or no
    /// backend available.
    pub rejected_conns: AtomicU64,
    pub accept_errors: AtomicU64,
    pub connect_errors: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    started: Instant,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self {
            total_conns: AtomicU64::new(0),
            active_conns: AtomicU64::new(0),
            rejected_conns: AtomicU64::new(0),
            accept_errors: AtomicU64::new(0),
            connect_errors: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    #[inline]
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self::new()
    }
}

const BUCKETS: usize = 32;

/// Log₂-bucketed latency histogram (microseconds). Writes are relaxed
/// increments; quantiles are computed on snapshot and return the upper bound
/// of the containing bucket.
#[derive(Debug)]
pub struct Histogram {
    buckets: [AtomicU64; BUCKETS],
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn observe_us(&self, us: u64) {
        let idx = (64 - us.leading_zeros() as usize).min(BUCKETS - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Approximate quantile in microseconds; 0 when empty.
    pub fn quantile_us(&self, q: f64) -> u64 {
        let counts: Vec<u64> = self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect();
        let total: u64 = counts.iter().sum();
        if total == 0 {
            return 0;
        }

        let rank = ((total as f64) * q).ceil() as u64;
        let mut seen = 0u64;
        for (idx, count) in counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                // Bucket idx holds values in [2^(idx-1), 2^idx).
                return 1u64 << idx;
            }
        }
        1u64 << (BUCKETS - 1)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub name: String,
    pub addr: String,
    pub status: &'static str,
    pub weight: u32,
    pub active_conns: u32,
    pub total_conns: u64,
    pub failed_conns: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub response_time_us: u64,
    pub rt_p50_us: u64,
    pub rt_p95_us: u64,
    pub rt_p99_us: u64,
    pub last_change_s: u64,
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub name: String,
    pub algorithm: String,
    pub backends: Vec<BackendSnapshot>,
}

/// The complete export consumed by renderers.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_s: u64,
    pub total_conns: u64,
    pub active_conns: u64,
    pub rejected_conns: u64,
    pub accept_errors: u64,
    pub connect_errors: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub pools: Vec<PoolSnapshot>,
}

/// Assembles a snapshot of everything the exporters need.
pub fn snapshot(registry: &Registry, stats: &GlobalStats) -> StatsSnapshot {
    let pools = registry
        .pools
        .iter()
        .map(|pool| PoolSnapshot {
            name: pool.name.clone(),
            algorithm: format!("{:?}", pool.algorithm),
            backends: pool
                .backends
                .iter()
                .map(|b| BackendSnapshot {
                    name: b.name.clone(),
                    addr: b.addr.to_string(),
                    status: b.state().as_str(),
                    weight: b.weight(),
                    active_conns: b.active_conns.load(Ordering::Relaxed),
                    total_conns: b.total_conns.load(Ordering::Relaxed),
                    failed_conns: b.failed_conns.load(Ordering::Relaxed),
                    bytes_in: b.bytes_in.load(Ordering::Relaxed),
                    bytes_out: b.bytes_out.load(Ordering::Relaxed),
                    response_time_us: b.response_time_us(),
                    rt_p50_us: b.rt_histogram.quantile_us(0.50),
                    rt_p95_us: b.rt_histogram.quantile_us(0.95),
                    rt_p99_us: b.rt_histogram.quantile_us(0.99),
                    last_change_s: b.secs_since_change(),
                })
                .collect(),
        })
        .collect();

    StatsSnapshot {
        uptime_s: stats.uptime_secs(),
        total_conns: stats.total_conns.load(Ordering::Relaxed),
        active_conns: stats.active_conns.load(Ordering::Relaxed),
        rejected_conns: stats.rejected_conns.load(Ordering::Relaxed),
        accept_errors: stats.accept_errors.load(Ordering::Relaxed),
        connect_errors: stats.connect_errors.load(Ordering::Relaxed),
        bytes_in: stats.bytes_in.load(Ordering::Relaxed),
        bytes_out: stats.bytes_out.load(Ordering::Relaxed),
        pools,
    }
}

/// CSV rendering in the spirit of the classic stats page: one header line,
/// one row per backend.
pub fn render_csv(snap: &StatsSnapshot) -> String {
    let mut out = String::from(
        "# pxname,svname,status,weight,scur,stot,failed,bin,bout,rtime_us,rt_p50_us,rt_p95_us,rt_p99_us,lastchg\n",
    );
    for pool in &snap.pools {
        for b in &pool.backends {
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{}\n",
                pool.name,
                b.name,
                b.status,
                b.weight,
                b.active_conns,
                b.total_conns,
                b.failed_conns,
                b.bytes_in,
                b.bytes_out,
                b.response_time_us,
                b.rt_p50_us,
                b.rt_p95_us,
                b.rt_p99_us,
                b.last_change_s,
            ));
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn histogram_is_empty_at_start() {
        let h = Histogram::new();
        assert_eq!(0, h.quantile_us(0.5));
    }

    #[test]
    fn histogram_quantiles_bracket_observations() {
        let h = Histogram::new();
        for _ in 0..90 {
            h.observe_us(100); // bucket upper bound 128
        }
        for _ in 0..10 {
            h.observe_us(10_000); // bucket upper bound 16384
        }
        assert_eq!(128, h.quantile_us(0.50));
        assert_eq!(128, h.quantile_us(0.90));
        assert_eq!(16_384, h.quantile_us(0.99));
    }

    #[test]
    fn histogram_handles_zero_and_huge_samples() {
        let h = Histogram::new();
        h.observe_us(0);
        h.observe_us(u64::MAX);
        assert!(h.quantile_us(0.5) >= 1);
    }
}

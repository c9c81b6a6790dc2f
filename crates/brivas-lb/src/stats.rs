//! Per-service traffic accounting
//!
//! The kernel exposes cumulative counters; each pass turns them into deltas
//! against the previous sample and accumulates the deltas.

use brivas_core::ServiceKey;
use brivas_telemetry::MetricsRegistry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;

use crate::modules::ServiceStats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficCounters {
    pub connections: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Difference of two samples of a monotonic counter; a smaller new value
/// means the counter was reset and everything since counts
pub fn counter_delta(old: u64, new: u64) -> u64 {
    if new < old {
        new
    } else {
        new - old
    }
}

impl TrafficCounters {
    pub fn delta_since(&self, previous: &Self) -> Self {
        Self {
            connections: counter_delta(previous.connections, self.connections),
            packets_in: counter_delta(previous.packets_in, self.packets_in),
            packets_out: counter_delta(previous.packets_out, self.packets_out),
            bytes_in: counter_delta(previous.bytes_in, self.bytes_in),
            bytes_out: counter_delta(previous.bytes_out, self.bytes_out),
        }
    }

    pub fn accumulate(&mut self, delta: &Self) {
        self.connections = self.connections.saturating_add(delta.connections);
        self.packets_in = self.packets_in.saturating_add(delta.packets_in);
        self.packets_out = self.packets_out.saturating_add(delta.packets_out);
        self.bytes_in = self.bytes_in.saturating_add(delta.bytes_in);
        self.bytes_out = self.bytes_out.saturating_add(delta.bytes_out);
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Accumulated traffic of one service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceTraffic {
    pub service: String,
    pub totals: TrafficCounters,
    pub reals: BTreeMap<String, TrafficCounters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SampleKey {
    Service(ServiceKey),
    Real(ServiceKey, SocketAddr),
}

#[derive(Default)]
struct Inner {
    last: HashMap<SampleKey, TrafficCounters>,
    totals: BTreeMap<ServiceKey, ServiceTraffic>,
}

/// Turns successive raw samples into accumulated totals
pub struct StatsCollector {
    inner: Mutex<Inner>,
    metrics: MetricsRegistry,
}

const SERVICE_BYTES_IN: &str = "lb_service_bytes_in_total";
const SERVICE_PACKETS_IN: &str = "lb_service_packets_in_total";
const SERVICE_CONNECTIONS: &str = "lb_service_connections_total";

fn metric_name(family: &str, service: &str) -> String {
    format!("{}.{}", family, service)
}

impl StatsCollector {
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            metrics,
        }
    }

    fn delta(last: &mut HashMap<SampleKey, TrafficCounters>, key: SampleKey, sample: TrafficCounters) -> TrafficCounters {
        let previous = last.insert(key, sample).unwrap_or_default();
        sample.delta_since(&previous)
    }

    /// Fold one sample of every service; services missing from the sample
    /// start over from zero if they come back
    pub fn record(&self, samples: &[ServiceStats]) {
        let mut inner = self.inner.lock();
        let mut seen = HashSet::with_capacity(inner.last.len());

        for sample in samples {
            let key = sample.key;
            let delta = Self::delta(&mut inner.last, SampleKey::Service(key), sample.counters);
            seen.insert(SampleKey::Service(key));

            let mut real_deltas = Vec::with_capacity(sample.reals.len());
            for (addr, counters) in &sample.reals {
                let real_key = SampleKey::Real(key, *addr);
                real_deltas.push((*addr, Self::delta(&mut inner.last, real_key, *counters)));
                seen.insert(real_key);
            }

            let service = key.to_string();
            let entry = inner.totals.entry(key).or_insert_with(|| ServiceTraffic {
                service: service.clone(),
                totals: TrafficCounters::default(),
                reals: BTreeMap::new(),
            });
            entry.totals.accumulate(&delta);
            for (addr, real_delta) in real_deltas {
                entry.reals.entry(addr.to_string()).or_default().accumulate(&real_delta);
            }

            if !delta.is_zero() {
                self.metrics
                    .counter(&metric_name(SERVICE_BYTES_IN, &service))
                    .add(delta.bytes_in);
                self.metrics
                    .counter(&metric_name(SERVICE_PACKETS_IN, &service))
                    .add(delta.packets_in);
                self.metrics
                    .counter(&metric_name(SERVICE_CONNECTIONS, &service))
                    .add(delta.connections);
            }
        }

        // Per-service counters go with their service
        for key in inner.last.keys() {
            if let SampleKey::Service(service) = key {
                if !seen.contains(key) {
                    let service = service.to_string();
                    for family in [SERVICE_BYTES_IN, SERVICE_PACKETS_IN, SERVICE_CONNECTIONS] {
                        self.metrics.remove_counter(&metric_name(family, &service));
                    }
                }
            }
        }
        inner.last.retain(|k, _| seen.contains(k));
    }

    pub fn snapshot(&self) -> Vec<ServiceTraffic> {
        self.inner.lock().totals.values().cloned().collect()
    }
}

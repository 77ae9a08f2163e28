use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use ironswarm_core::NodeId;
use parking_lot::{Mutex, RwLock};

use crate::{
    labels::SeriesKey,
    snapshot::{
        CounterSnapshot, EventBufferSnapshot, EventSample, HistogramSnapshot, Snapshot, epoch_ms,
    },
};

/// Fixed exponential bucket bounds suitable for HTTP request latencies, in
/// seconds. The implicit last bucket is +inf.
pub const DEFAULT_LATENCY_BOUNDS_SECONDS: &[f64] =
    &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

pub(crate) struct HistogramInner {
    pub(crate) bounds: Vec<f64>,
    // bounds.len() + 1 buckets, the last one is +inf. The count is derived
    // from the buckets at snapshot time so the two cannot diverge.
    pub(crate) buckets: Vec<AtomicU64>,
    pub(crate) sum_micros: AtomicU64,
}

impl HistogramInner {
    fn new(bounds: &[f64]) -> Self {
        Self {
            bounds: bounds.to_vec(),
            buckets: (0..bounds.len() + 1).map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
        }
    }

    fn observe(&self, seconds: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|b| seconds <= *b)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1_000_000.) as u64, Ordering::Relaxed);
    }
}

pub(crate) struct EventRing {
    pub(crate) capacity: usize,
    pub(crate) samples: Mutex<VecDeque<EventSample>>,
}

impl EventRing {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn record(&self, ts_epoch_ms: u64, value: f64) {
        let mut g = self.samples.lock();
        if g.len() == self.capacity {
            g.pop_front();
        }
        g.push_back(EventSample { ts_epoch_ms, value });
    }
}

/// A cloneable handle to one counter series. Increments are a single atomic
/// add; cache the handle on hot paths.
#[derive(Clone)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn inc(&self) {
        self.add(1)
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct Histogram(Arc<HistogramInner>);

impl Histogram {
    pub fn observe(&self, seconds: f64) {
        self.0.observe(seconds)
    }
}

#[derive(Clone)]
pub struct EventBuffer(Arc<EventRing>);

impl EventBuffer {
    pub fn record(&self, value: f64) {
        self.0.record(epoch_ms(), value)
    }
}

/// The per-node metrics registry. Three maps keyed by `(name, labels)`;
/// the maps are only locked to create a series, all subsequent writes go
/// through per-series atomics.
pub struct MetricsCore {
    counters: RwLock<HashMap<SeriesKey, Arc<AtomicU64>>>,
    histograms: RwLock<HashMap<SeriesKey, Arc<HistogramInner>>>,
    events: RwLock<HashMap<SeriesKey, Arc<EventRing>>>,
    event_capacity: usize,
}

impl Default for MetricsCore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCore {
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(event_capacity: usize) -> Self {
        Self {
            counters: Default::default(),
            histograms: Default::default(),
            events: Default::default(),
            event_capacity,
        }
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> Counter {
        let key = SeriesKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            return Counter(c.clone());
        }
        let c = self
            .counters
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        Counter(c)
    }

    /// One-shot increment for cold paths.
    pub fn increment(&self, name: &str, labels: &[(&str, &str)]) {
        self.counter(name, labels).inc()
    }

    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Histogram {
        let key = SeriesKey::new(name, labels);
        if let Some(h) = self.histograms.read().get(&key) {
            return Histogram(h.clone());
        }
        let h = self
            .histograms
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(HistogramInner::new(DEFAULT_LATENCY_BOUNDS_SECONDS)))
            .clone();
        Histogram(h)
    }

    pub fn observe_duration(&self, name: &str, labels: &[(&str, &str)], seconds: f64) {
        self.histogram(name, labels).observe(seconds)
    }

    pub fn event_buffer(&self, name: &str, labels: &[(&str, &str)]) -> EventBuffer {
        let key = SeriesKey::new(name, labels);
        if let Some(e) = self.events.read().get(&key) {
            return EventBuffer(e.clone());
        }
        let e = self
            .events
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(EventRing::new(self.event_capacity)))
            .clone();
        EventBuffer(e)
    }

    /// Produces a consistent per-node image. Writers are never blocked
    /// globally: the registry locks are held only while cloning the series
    /// handles, each series is then copied from its atomics.
    pub fn snapshot(&self, node_id: NodeId) -> Snapshot {
        let counters: Vec<(SeriesKey, Arc<AtomicU64>)> = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let histograms: Vec<(SeriesKey, Arc<HistogramInner>)> = self
            .histograms
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let events: Vec<(SeriesKey, Arc<EventRing>)> = self
            .events
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut snapshot = Snapshot {
            node_id,
            captured_at_epoch_ms: epoch_ms(),
            counters: counters
                .into_iter()
                .map(|(key, v)| CounterSnapshot {
                    key,
                    value: v.load(Ordering::Relaxed),
                })
                .collect(),
            histograms: histograms
                .into_iter()
                .map(|(key, h)| {
                    let buckets: Vec<u64> =
                        h.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect();
                    let count = buckets.iter().sum();
                    HistogramSnapshot {
                        key,
                        bounds: h.bounds.clone(),
                        buckets,
                        count,
                        sum_micros: h.sum_micros.load(Ordering::Relaxed),
                    }
                })
                .collect(),
            events: events
                .into_iter()
                .map(|(key, e)| {
                    let samples: Vec<EventSample> = e.samples.lock().iter().copied().collect();
                    EventBufferSnapshot {
                        key,
                        capacity: e.capacity,
                        samples,
                    }
                })
                .collect(),
        };
        snapshot.sort_series();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironswarm_core::generate_node_id;

    #[test]
    fn test_counter_is_shared_per_key() {
        let m = MetricsCore::new();
        m.counter("c", &[("a", "1")]).add(2);
        m.counter("c", &[("a", "1")]).inc();
        m.counter("c", &[("a", "2")]).inc();
        let snap = m.snapshot(generate_node_id());
        assert_eq!(snap.counter_value("c", &[("a", "1")]), 3);
        assert_eq!(snap.counter_value("c", &[("a", "2")]), 1);
    }

    #[test]
    fn test_histogram_buckets() {
        let m = MetricsCore::new();
        let h = m.histogram("lat", &[]);
        h.observe(0.004); // first bucket (<= 0.005)
        h.observe(0.02); // <= 0.025
        h.observe(100.); // +inf
        let snap = m.snapshot(generate_node_id());
        let hs = &snap.histograms[0];
        assert_eq!(hs.count, 3);
        assert_eq!(hs.buckets[0], 1);
        assert_eq!(hs.buckets[2], 1);
        assert_eq!(*hs.buckets.last().unwrap(), 1);
        assert_eq!(hs.buckets.len(), hs.bounds.len() + 1);
        snap.validate().unwrap();
    }

    #[test]
    fn test_event_ring_drops_oldest() {
        let m = MetricsCore::with_event_capacity(3);
        let e = m.event_buffer("ev", &[]);
        for i in 0..5 {
            e.record(i as f64);
        }
        let snap = m.snapshot(generate_node_id());
        let samples: Vec<f64> = snap.events[0].samples.iter().map(|s| s.value).collect();
        assert_eq!(samples, vec![2., 3., 4.]);
    }

    #[test]
    fn test_concurrent_counter_writes() {
        let m = Arc::new(MetricsCore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = m.clone();
            handles.push(std::thread::spawn(move || {
                let c = m.counter("n", &[]);
                for _ in 0..10_000 {
                    c.inc();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.counter("n", &[]).get(), 80_000);
    }
}

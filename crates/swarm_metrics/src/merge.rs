use std::collections::BTreeMap;

use tracing::warn;

use crate::{
    labels::SeriesKey,
    snapshot::{CounterSnapshot, EventBufferSnapshot, HistogramSnapshot, Snapshot},
};

/// Merges two snapshots into one. Counters add, histograms add bucket-wise,
/// event buffers concatenate in timestamp order and truncate to capacity
/// (oldest samples dropped). Associative and commutative; the merged image
/// keeps `a`'s node id and the later capture timestamp.
pub fn merge(a: Snapshot, b: &Snapshot) -> Snapshot {
    let mut counters: BTreeMap<SeriesKey, u64> = BTreeMap::new();
    for c in a.counters.into_iter().chain(b.counters.iter().cloned()) {
        *counters.entry(c.key).or_default() += c.value;
    }

    let mut histograms: BTreeMap<SeriesKey, HistogramSnapshot> = BTreeMap::new();
    for h in a.histograms.into_iter().chain(b.histograms.iter().cloned()) {
        match histograms.entry(h.key.clone()) {
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(h);
            }
            std::collections::btree_map::Entry::Occupied(mut o) => {
                let acc = o.get_mut();
                if acc.bounds != h.bounds {
                    // Differing schemas cannot be summed; keep the larger
                    // series so the total stays closest to truth.
                    warn!(key = %h.key, "histogram bounds mismatch during merge");
                    if h.count > acc.count {
                        *acc = h;
                    }
                    continue;
                }
                for (dst, src) in acc.buckets.iter_mut().zip(h.buckets.iter()) {
                    *dst += src;
                }
                acc.count += h.count;
                acc.sum_micros += h.sum_micros;
            }
        }
    }

    let mut events: BTreeMap<SeriesKey, EventBufferSnapshot> = BTreeMap::new();
    for e in a.events.into_iter().chain(b.events.iter().cloned()) {
        match events.entry(e.key.clone()) {
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(e);
            }
            std::collections::btree_map::Entry::Occupied(mut o) => {
                let acc = o.get_mut();
                acc.capacity = acc.capacity.min(e.capacity);
                acc.samples.extend(e.samples.iter().copied());
            }
        }
    }
    for e in events.values_mut() {
        e.samples
            .sort_by(|x, y| (x.ts_epoch_ms, x.value.to_bits()).cmp(&(y.ts_epoch_ms, y.value.to_bits())));
        if e.samples.len() > e.capacity {
            let excess = e.samples.len() - e.capacity;
            e.samples.drain(..excess);
        }
    }

    Snapshot {
        node_id: a.node_id,
        captured_at_epoch_ms: a.captured_at_epoch_ms.max(b.captured_at_epoch_ms),
        counters: counters
            .into_iter()
            .map(|(key, value)| CounterSnapshot { key, value })
            .collect(),
        histograms: histograms.into_values().collect(),
        events: events.into_values().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::EventSample;
    use ironswarm_core::generate_node_id;

    fn counter(name: &str, value: u64) -> CounterSnapshot {
        CounterSnapshot {
            key: SeriesKey::no_labels(name),
            value,
        }
    }

    fn histogram(name: &str, buckets: Vec<u64>, sum_micros: u64) -> HistogramSnapshot {
        let count = buckets.iter().sum();
        HistogramSnapshot {
            key: SeriesKey::no_labels(name),
            bounds: vec![0.1, 1.0],
            buckets,
            count,
            sum_micros,
        }
    }

    fn events(name: &str, capacity: usize, ts: &[u64]) -> EventBufferSnapshot {
        EventBufferSnapshot {
            key: SeriesKey::no_labels(name),
            capacity,
            samples: ts
                .iter()
                .map(|t| EventSample {
                    ts_epoch_ms: *t,
                    value: *t as f64,
                })
                .collect(),
        }
    }

    fn snap(
        counters: Vec<CounterSnapshot>,
        histograms: Vec<HistogramSnapshot>,
        events: Vec<EventBufferSnapshot>,
    ) -> Snapshot {
        let mut s = Snapshot::empty(generate_node_id());
        s.counters = counters;
        s.histograms = histograms;
        s.events = events;
        s
    }

    // Series content comparison ignoring node identity and capture time.
    fn same_series(a: &Snapshot, b: &Snapshot) -> bool {
        a.counters == b.counters && a.histograms == b.histograms && a.events == b.events
    }

    #[test]
    fn test_counters_add() {
        let a = snap(vec![counter("x", 2), counter("y", 1)], vec![], vec![]);
        let b = snap(vec![counter("x", 3)], vec![], vec![]);
        let m = merge(a, &b);
        assert_eq!(m.counter_value("x", &[]), 5);
        assert_eq!(m.counter_value("y", &[]), 1);
    }

    #[test]
    fn test_histograms_add_bucketwise() {
        let a = snap(vec![], vec![histogram("h", vec![1, 2, 0], 100)], vec![]);
        let b = snap(vec![], vec![histogram("h", vec![0, 1, 4], 50)], vec![]);
        let m = merge(a, &b);
        let h = &m.histograms[0];
        assert_eq!(h.buckets, vec![1, 3, 4]);
        assert_eq!(h.count, 8);
        assert_eq!(h.sum_micros, 150);
        m.validate().unwrap();
    }

    #[test]
    fn test_events_sorted_and_truncated() {
        let a = snap(vec![], vec![], vec![events("e", 4, &[5, 1])]);
        let b = snap(vec![], vec![], vec![events("e", 4, &[3, 2, 4])]);
        let m = merge(a, &b);
        let ts: Vec<u64> = m.events[0].samples.iter().map(|s| s.ts_epoch_ms).collect();
        assert_eq!(ts, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_merge_associative_and_commutative() {
        let a = snap(
            vec![counter("x", 1)],
            vec![histogram("h", vec![1, 0, 0], 5)],
            vec![events("e", 3, &[1, 9])],
        );
        let b = snap(
            vec![counter("x", 2), counter("z", 7)],
            vec![histogram("h", vec![0, 2, 0], 6)],
            vec![events("e", 3, &[4])],
        );
        let c = snap(
            vec![counter("z", 1)],
            vec![histogram("h", vec![0, 0, 3], 7)],
            vec![events("e", 3, &[6, 2])],
        );

        let left = merge(merge(a.clone(), &b), &c);
        let right = merge(a.clone(), &merge(b.clone(), &c));
        assert!(same_series(&left, &right));

        let ab = merge(a.clone(), &b);
        let ba = merge(b, &a);
        assert!(same_series(&ab, &ba));
    }
}

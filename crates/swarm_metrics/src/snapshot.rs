use ironswarm_core::NodeId;
use serde::{Deserialize, Serialize};

use crate::labels::SeriesKey;

pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub key: SeriesKey,
    pub value: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub key: SeriesKey,
    pub bounds: Vec<f64>,
    // bounds.len() + 1 entries, the last one is +inf.
    pub buckets: Vec<u64>,
    pub count: u64,
    pub sum_micros: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventSample {
    pub ts_epoch_ms: u64,
    pub value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventBufferSnapshot {
    pub key: SeriesKey,
    pub capacity: usize,
    pub samples: Vec<EventSample>,
}

/// A consistent per-node image of all series. Serializable, so it doubles as
/// the wire and on-disk format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub node_id: NodeId,
    pub captured_at_epoch_ms: u64,
    pub counters: Vec<CounterSnapshot>,
    pub histograms: Vec<HistogramSnapshot>,
    pub events: Vec<EventBufferSnapshot>,
}

#[derive(thiserror::Error, Debug)]
pub enum CorruptionError {
    #[error("histogram {key}: bucket count {buckets} does not match bounds {bounds}")]
    BucketArity {
        key: SeriesKey,
        buckets: usize,
        bounds: usize,
    },
    #[error("histogram {key}: count {count} != bucket total {bucket_total}")]
    CountMismatch {
        key: SeriesKey,
        count: u64,
        bucket_total: u64,
    },
    #[error("event buffer {key}: {len} samples exceed capacity {capacity}")]
    EventOverflow {
        key: SeriesKey,
        len: usize,
        capacity: usize,
    },
}

impl Snapshot {
    pub fn empty(node_id: NodeId) -> Self {
        Self {
            node_id,
            captured_at_epoch_ms: epoch_ms(),
            counters: Vec::new(),
            histograms: Vec::new(),
            events: Vec::new(),
        }
    }

    pub(crate) fn sort_series(&mut self) {
        self.counters.sort_by(|a, b| a.key.cmp(&b.key));
        self.histograms.sort_by(|a, b| a.key.cmp(&b.key));
        self.events.sort_by(|a, b| a.key.cmp(&b.key));
    }

    /// Invariant check run before a snapshot leaves the node. A failure here
    /// means the registry is corrupt and is treated as fatal by the caller.
    pub fn validate(&self) -> Result<(), CorruptionError> {
        for h in &self.histograms {
            if h.buckets.len() != h.bounds.len() + 1 {
                return Err(CorruptionError::BucketArity {
                    key: h.key.clone(),
                    buckets: h.buckets.len(),
                    bounds: h.bounds.len(),
                });
            }
            let bucket_total: u64 = h.buckets.iter().sum();
            if h.count != bucket_total {
                return Err(CorruptionError::CountMismatch {
                    key: h.key.clone(),
                    count: h.count,
                    bucket_total,
                });
            }
        }
        for e in &self.events {
            if e.samples.len() > e.capacity {
                return Err(CorruptionError::EventOverflow {
                    key: e.key.clone(),
                    len: e.samples.len(),
                    capacity: e.capacity,
                });
            }
        }
        Ok(())
    }

    /// Test and aggregation helper: the value of one counter series, 0 if
    /// absent.
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = SeriesKey::new(name, labels);
        self.counters
            .iter()
            .find(|c| c.key == key)
            .map(|c| c.value)
            .unwrap_or(0)
    }

    /// Sum of all counter series sharing `name`, across label sets.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|c| c.key.name == name)
            .map(|c| c.value)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironswarm_core::generate_node_id;

    #[test]
    fn test_validate_catches_count_mismatch() {
        let mut s = Snapshot::empty(generate_node_id());
        s.histograms.push(HistogramSnapshot {
            key: SeriesKey::no_labels("h"),
            bounds: vec![1.0],
            buckets: vec![2, 0],
            count: 3,
            sum_micros: 0,
        });
        assert!(matches!(
            s.validate(),
            Err(CorruptionError::CountMismatch { .. })
        ));
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let mut s = Snapshot::empty(generate_node_id());
        s.counters.push(CounterSnapshot {
            key: SeriesKey::new("c", &[("a", "b")]),
            value: 7,
        });
        let j = serde_json::to_string(&s).unwrap();
        let back: Snapshot = serde_json::from_str(&j).unwrap();
        assert_eq!(back, s);
    }
}

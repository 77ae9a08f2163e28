//! Labeled counters, histograms and bounded event buffers with consistent,
//! mergeable snapshots.
//!
//! Every node keeps one [`MetricsCore`]. Writers get cheap cloneable handles
//! ([`Counter`], [`Histogram`], [`EventBuffer`]) that update atomics; the
//! registry lock is only taken when a series is first created. A
//! [`Snapshot`] is a per-node consistent image that can be merged with
//! snapshots from other nodes; the merge operator is associative and
//! commutative.

mod labels;
mod merge;
mod registry;
mod snapshot;

pub use labels::SeriesKey;
pub use merge::merge;
pub use registry::{
    Counter, DEFAULT_EVENT_CAPACITY, DEFAULT_LATENCY_BOUNDS_SECONDS, EventBuffer, Histogram,
    MetricsCore,
};
pub use snapshot::{
    CorruptionError, CounterSnapshot, EventBufferSnapshot, EventSample, HistogramSnapshot,
    Snapshot, epoch_ms,
};

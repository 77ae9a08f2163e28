use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use ironswarm_core::{NodeId, spawn_utils::spawn_with_cancel};
use ironswarm_metrics::epoch_ms;
use ironswarm_proto::{
    ControlEnvelope, ControlMsgId, ControlPayload, FrameKind, GossipPayload, PeerEntry,
};
use lru::LruCache;
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace};

use crate::{
    config::NodeOptions,
    peer_registry::{AliveEntry, PeerRegistry},
    transport::Transport,
};

/// Hop budget for a control message entering a cluster of `n_alive` nodes.
pub(crate) fn initial_hops(n_alive: usize) -> u32 {
    (n_alive.max(1) as f64).log2().ceil() as u32 + 2
}

pub(crate) struct Gossip {
    registry: Arc<PeerRegistry>,
    transport: Arc<Transport>,
    opts: NodeOptions,
    seq: AtomicU64,
    // Recently seen control message ids; entries older than the retention
    // window count as unseen again.
    recent: Mutex<LruCache<ControlMsgId, Instant>>,
    cancel: CancellationToken,
}

impl Gossip {
    pub fn new(
        registry: Arc<PeerRegistry>,
        transport: Arc<Transport>,
        opts: NodeOptions,
        cancel: CancellationToken,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(opts.recent_control_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            registry,
            transport,
            opts,
            seq: AtomicU64::new(0),
            recent: Mutex::new(LruCache::new(capacity)),
            cancel,
        }
    }

    /// Periodic peer-list exchange with full jitter in [0.5x, 1.5x] of the
    /// configured interval.
    pub async fn run_exchange_loop(self: Arc<Self>) -> anyhow::Result<()> {
        loop {
            let jittered = self
                .opts
                .gossip_interval
                .mul_f64(0.5 + rand::random::<f64>());
            tokio::time::sleep(jittered).await;
            self.exchange_once();
        }
    }

    fn exchange_once(&self) {
        let alive = self.registry.alive_snapshot();
        if alive.is_empty() {
            return;
        }
        let payload = self.local_peer_list(&alive);
        for target in pick_fanout(&alive, self.opts.gossip_fanout, None) {
            trace!(peer = ?target.id, "gossiping peer list");
            let _ = self
                .transport
                .send_frame(&target.tx, FrameKind::Gossip, &payload);
        }
    }

    fn local_peer_list(&self, alive: &[AliveEntry]) -> GossipPayload {
        let mut entries = Vec::with_capacity(alive.len() + 1);
        entries.push(PeerEntry {
            id: self.registry.self_id(),
            addr: self.transport.advertised_addr(),
            last_seen_epoch_ms: epoch_ms(),
        });
        entries.extend(alive.iter().map(|e| PeerEntry {
            id: e.id,
            addr: e.addr,
            last_seen_epoch_ms: e.last_seen_epoch_ms,
        }));
        GossipPayload { entries }
    }

    /// Merges a received peer list: unknown entries trigger a passive
    /// connection attempt, known entries only refresh within the freshness
    /// window. State never regresses from gossip.
    pub fn on_gossip(&self, from: NodeId, payload: GossipPayload) {
        trace!(peer = ?from, entries = payload.entries.len(), "received peer list");
        for entry in payload.entries {
            if entry.id == self.registry.self_id() {
                continue;
            }
            let known = self.registry.merge_gossip_entry(
                entry.id,
                entry.addr,
                entry.last_seen_epoch_ms,
                self.opts.gossip_freshness_window,
            );
            if !known {
                debug!(peer = ?entry.id, addr = %entry.addr, "learned new peer from gossip");
                self.transport.spawn_connect(entry.addr, Some(entry.id));
            }
        }
    }

    /// Originates a control message from this node and fans it out.
    pub fn broadcast(&self, payload: ControlPayload) {
        let envelope = ControlEnvelope {
            msg_id: ControlMsgId {
                origin: self.registry.self_id(),
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            },
            hops_remaining: initial_hops(self.registry.n_alive()),
            payload,
        };
        self.note_seen(envelope.msg_id);
        self.forward(envelope, None);
    }

    /// Dedups and forwards an incoming control message. Returns the payload
    /// to apply locally, or None for a duplicate.
    pub fn accept(&self, from: NodeId, envelope: ControlEnvelope) -> Option<ControlPayload> {
        if self.seen_recently(envelope.msg_id) {
            trace!(msg_id = ?envelope.msg_id, "duplicate control message");
            return None;
        }
        self.note_seen(envelope.msg_id);
        if envelope.hops_remaining > 0 {
            let mut fwd = envelope.clone();
            fwd.hops_remaining -= 1;
            self.forward(fwd, Some(from));
        }
        Some(envelope.payload)
    }

    fn seen_recently(&self, msg_id: ControlMsgId) -> bool {
        let mut g = self.recent.lock();
        match g.get(&msg_id) {
            Some(at) => at.elapsed() < self.opts.recent_control_retention,
            None => false,
        }
    }

    fn note_seen(&self, msg_id: ControlMsgId) {
        self.recent.lock().put(msg_id, Instant::now());
    }

    fn forward(&self, envelope: ControlEnvelope, exclude: Option<NodeId>) {
        let alive = self.registry.alive_snapshot();
        for target in pick_fanout(&alive, self.opts.gossip_fanout, exclude) {
            let transport = self.transport.clone();
            let tx = target.tx.clone();
            let id = target.id;
            let envelope = envelope.clone();
            spawn_with_cancel(
                debug_span!("control_fwd", peer = ?id),
                self.cancel.clone(),
                async move { transport.send_control(id, &tx, &envelope).await },
            );
        }
    }
}

fn pick_fanout(alive: &[AliveEntry], fanout: usize, exclude: Option<NodeId>) -> Vec<AliveEntry> {
    let candidates: Vec<&AliveEntry> = alive
        .iter()
        .filter(|e| exclude.is_none_or(|x| e.id != x))
        .collect();
    candidates
        .choose_multiple(&mut rand::rng(), fanout)
        .map(|e| (*e).clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_hops() {
        assert_eq!(initial_hops(1), 2);
        assert_eq!(initial_hops(2), 3);
        assert_eq!(initial_hops(8), 5);
        assert_eq!(initial_hops(9), 6);
    }
}

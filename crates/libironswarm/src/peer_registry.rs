use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use ironswarm_core::NodeId;
use ironswarm_metrics::epoch_ms;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::transport::SessionTx;

#[derive(Debug, Default, Serialize)]
pub struct AggregatePeerStatsAtomic {
    pub connecting: AtomicU32,
    pub alive: AtomicU32,
    pub suspect: AtomicU32,
    pub dead: AtomicU32,
}

fn atomic_inc(c: &AtomicU32) -> u32 {
    c.fetch_add(1, Ordering::Relaxed)
}

fn atomic_dec(c: &AtomicU32) -> u32 {
    c.fetch_sub(1, Ordering::Relaxed)
}

impl AggregatePeerStatsAtomic {
    fn counter(&self, state: &PeerState) -> &AtomicU32 {
        match state {
            PeerState::Connecting(_) => &self.connecting,
            PeerState::Alive(_) => &self.alive,
            PeerState::Suspect { .. } => &self.suspect,
            PeerState::Dead => &self.dead,
        }
    }

    fn inc(&self, state: &PeerState) {
        atomic_inc(self.counter(state));
    }

    fn dec(&self, state: &PeerState) {
        atomic_dec(self.counter(state));
    }

    fn incdec(&self, old: &PeerState, new: &PeerState) {
        self.dec(old);
        self.inc(new);
    }
}

#[derive(Debug)]
pub enum PeerState {
    // An outbound dial is in flight; writes queue into the session channel.
    Connecting(SessionTx),
    Alive(SessionTx),
    // Missed heartbeats or transport failure. The session may still exist
    // (missed PONG) or be gone (I/O error).
    Suspect {
        tx: Option<SessionTx>,
        since: Instant,
    },
    // Retained but ineligible as a gossip target until quarantine passes.
    Dead,
}

impl PeerState {
    pub fn name(&self) -> &'static str {
        match self {
            PeerState::Connecting(_) => "connecting",
            PeerState::Alive(_) => "alive",
            PeerState::Suspect { .. } => "suspect",
            PeerState::Dead => "dead",
        }
    }

    fn tx(&self) -> Option<&SessionTx> {
        match self {
            PeerState::Connecting(tx) | PeerState::Alive(tx) => Some(tx),
            PeerState::Suspect { tx, .. } => tx.as_ref(),
            PeerState::Dead => None,
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Wrapper that forces every state change through [`Self::set`], keeping the
/// aggregate per-state counters in sync.
#[derive(Debug)]
pub struct PeerStateNoMut(PeerState);

impl PeerStateNoMut {
    pub fn get(&self) -> &PeerState {
        &self.0
    }

    fn set(&mut self, new: PeerState, counters: &AggregatePeerStatsAtomic) -> PeerState {
        counters.incdec(&self.0, &new);
        std::mem::replace(&mut self.0, new)
    }
}

#[derive(Debug)]
pub struct Peer {
    pub addr: SocketAddr,
    pub first_seen_epoch_ms: u64,
    pub last_seen_epoch_ms: u64,
    pub state: PeerStateNoMut,
    quarantined_until: Option<Instant>,
    last_ping_sent: Option<Instant>,
    pending_ping: Option<(u64, Instant)>,
    consecutive_pongs: u32,
}

impl Peer {
    fn new(addr: SocketAddr, state: PeerState, counters: &AggregatePeerStatsAtomic) -> Self {
        counters.inc(&state);
        let now = epoch_ms();
        Self {
            addr,
            first_seen_epoch_ms: now,
            last_seen_epoch_ms: now,
            state: PeerStateNoMut(state),
            quarantined_until: None,
            last_ping_sent: None,
            pending_ping: None,
            consecutive_pongs: 0,
        }
    }

    fn quarantined(&self, now: Instant) -> bool {
        self.quarantined_until.is_some_and(|until| now < until)
    }
}

/// One entry of the copy-on-write alive-set snapshot. Carries the session
/// sender so readers (gossip, aggregator) never touch the peer map.
#[derive(Clone)]
pub struct AliveEntry {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen_epoch_ms: u64,
    pub tx: SessionTx,
}

/// A ping the liveness tick wants sent; actual I/O happens outside the
/// registry lock.
pub struct PingOrder {
    pub id: NodeId,
    pub nonce: u64,
    pub tx: SessionTx,
}

/// Serializable view of one peer for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct PeerView {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub state: &'static str,
    pub first_seen_epoch_ms: u64,
    pub last_seen_epoch_ms: u64,
}

pub struct PeerRegistry {
    self_id: NodeId,
    peers: RwLock<HashMap<NodeId, Peer>>,
    // Sorted by id; rebuilt on every membership change, wait-free to read.
    alive: ArcSwap<Vec<AliveEntry>>,
    pub stats: AggregatePeerStatsAtomic,
    max_peers: usize,
}

impl PeerRegistry {
    pub fn new(self_id: NodeId, max_peers: usize) -> Self {
        Self {
            self_id,
            peers: Default::default(),
            alive: ArcSwap::from_pointee(Vec::new()),
            stats: Default::default(),
            max_peers,
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// The current alive-set snapshot (remote peers only, sorted by id).
    pub fn alive_snapshot(&self) -> Arc<Vec<AliveEntry>> {
        self.alive.load_full()
    }

    /// Size of the alive-set including self. Never zero.
    pub fn n_alive(&self) -> usize {
        self.alive.load().len() + 1
    }

    fn rebuild_alive(&self, peers: &HashMap<NodeId, Peer>) {
        let mut entries: Vec<AliveEntry> = peers
            .iter()
            .filter_map(|(id, p)| match p.state.get() {
                PeerState::Alive(tx) => Some(AliveEntry {
                    id: *id,
                    addr: p.addr,
                    last_seen_epoch_ms: p.last_seen_epoch_ms,
                    tx: tx.clone(),
                }),
                _ => None,
            })
            .collect();
        entries.sort_by_key(|e| e.id);
        self.alive.store(Arc::new(entries));
    }

    /// Registers an outbound connection attempt. Returns false if the peer
    /// already has a session, is quarantined, or the registry is full.
    pub fn begin_connecting(&self, id: NodeId, addr: SocketAddr, tx: SessionTx) -> bool {
        if id == self.self_id {
            return false;
        }
        let now = Instant::now();
        let mut g = self.peers.write();
        match g.get_mut(&id) {
            None => {
                if g.len() >= self.max_peers {
                    warn!(peer = ?id, max = self.max_peers, "peer limit reached, not connecting");
                    return false;
                }
                g.insert(id, Peer::new(addr, PeerState::Connecting(tx), &self.stats));
                true
            }
            Some(p) => {
                if p.quarantined(now) {
                    return false;
                }
                match p.state.get() {
                    PeerState::Dead | PeerState::Suspect { tx: None, .. } => {
                        p.state.set(PeerState::Connecting(tx), &self.stats);
                        p.addr = addr;
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    /// A HELLO/HELLO_ACK exchange completed over a session whose writes go
    /// through `tx`. Moves the peer to Alive.
    pub fn session_established(&self, id: NodeId, addr: SocketAddr, tx: SessionTx) {
        let mut g = self.peers.write();
        match g.get_mut(&id) {
            None => {
                if g.len() >= self.max_peers {
                    warn!(peer = ?id, max = self.max_peers, "peer limit reached, dropping session");
                    return;
                }
                g.insert(id, Peer::new(addr, PeerState::Alive(tx), &self.stats));
            }
            Some(p) => {
                p.state.set(PeerState::Alive(tx), &self.stats);
                p.addr = addr;
                p.last_seen_epoch_ms = p.last_seen_epoch_ms.max(epoch_ms());
                p.pending_ping = None;
                p.consecutive_pongs = 0;
            }
        }
        debug!(peer = ?id, %addr, "session established");
        self.rebuild_alive(&g);
    }

    /// The session's reader or writer side failed. Transport failure moves
    /// the peer to Suspect; reconnection is the transport's concern.
    pub fn session_closed(&self, id: NodeId) {
        let mut g = self.peers.write();
        if let Some(p) = g.get_mut(&id) {
            match p.state.get() {
                PeerState::Connecting(_) | PeerState::Alive(_) => {
                    p.state.set(
                        PeerState::Suspect {
                            tx: None,
                            since: Instant::now(),
                        },
                        &self.stats,
                    );
                    p.pending_ping = None;
                    p.consecutive_pongs = 0;
                    debug!(peer = ?id, "session closed, peer suspect");
                }
                _ => return,
            }
            self.rebuild_alive(&g);
        }
    }

    /// Handshake mismatch: the peer is dead and quarantined.
    pub fn mark_dead_quarantined(&self, id: NodeId, quarantine: Duration) {
        let mut g = self.peers.write();
        if let Some(p) = g.get_mut(&id) {
            p.state.set(PeerState::Dead, &self.stats);
            p.quarantined_until = Some(Instant::now() + quarantine);
            self.rebuild_alive(&g);
        }
    }

    /// The peer said BYE: it is leaving the cluster on purpose, no
    /// quarantine and no reconnection.
    pub fn mark_departed(&self, id: NodeId) {
        let mut g = self.peers.write();
        if let Some(p) = g.get_mut(&id) {
            p.state.set(PeerState::Dead, &self.stats);
            self.rebuild_alive(&g);
        }
    }

    /// Whether a reconnect loop should keep trying: known, not dead, not
    /// quarantined.
    pub fn is_reconnect_worthy(&self, id: &NodeId) -> bool {
        let g = self.peers.read();
        match g.get(id) {
            None => false,
            Some(p) => {
                !p.quarantined(Instant::now()) && !matches!(p.state.get(), PeerState::Dead)
            }
        }
    }

    /// Refreshes `last_seen` from an observed timestamp; monotone.
    pub fn refresh_last_seen(&self, id: NodeId, observed_epoch_ms: u64) {
        let mut g = self.peers.write();
        if let Some(p) = g.get_mut(&id) {
            p.last_seen_epoch_ms = p.last_seen_epoch_ms.max(observed_epoch_ms);
        }
    }

    pub fn addr_of(&self, id: &NodeId) -> Option<SocketAddr> {
        self.peers.read().get(id).map(|p| p.addr)
    }

    pub fn is_known(&self, id: &NodeId) -> bool {
        self.peers.read().contains_key(id)
    }

    /// The session sender for a peer, in any state that still has one.
    pub fn session_tx(&self, id: &NodeId) -> Option<SessionTx> {
        self.peers.read().get(id).and_then(|p| p.state.get().tx().cloned())
    }

    /// Records an observed gossip entry for a known peer: take the maximum
    /// of `last_seen` only when the sender saw the peer recently enough.
    /// State never regresses from gossip. Returns false when the id is
    /// unknown (caller starts a passive connection attempt).
    pub fn merge_gossip_entry(
        &self,
        id: NodeId,
        addr: SocketAddr,
        last_seen_epoch_ms: u64,
        freshness_window: Duration,
    ) -> bool {
        let now_ms = epoch_ms();
        let mut g = self.peers.write();
        match g.get_mut(&id) {
            None => false,
            Some(p) => {
                let fresh = now_ms.saturating_sub(last_seen_epoch_ms)
                    <= freshness_window.as_millis() as u64;
                if fresh {
                    p.last_seen_epoch_ms = p.last_seen_epoch_ms.max(last_seen_epoch_ms);
                    if p.addr != addr {
                        trace!(peer = ?id, old = %p.addr, new = %addr, "gossip moved peer address");
                        p.addr = addr;
                    }
                }
                true
            }
        }
    }

    /// One liveness pass: emits pings that are due, times out pending pings
    /// and expires suspects into Dead. Returns the pings to send; callers
    /// perform the sends outside the lock.
    pub fn liveness_tick(
        &self,
        ping_interval: Duration,
        ping_timeout: Duration,
        suspect_to_dead: Duration,
    ) -> Vec<PingOrder> {
        let now = Instant::now();
        let mut orders = Vec::new();
        let mut membership_changed = false;
        let mut g = self.peers.write();
        for (id, p) in g.iter_mut() {
            // Ping timeouts first so a due ping can be issued this pass.
            if let Some((_, sent_at)) = p.pending_ping {
                if now.duration_since(sent_at) >= ping_timeout {
                    p.pending_ping = None;
                    p.consecutive_pongs = 0;
                    if let PeerState::Alive(tx) = p.state.get() {
                        let tx = tx.clone();
                        p.state.set(
                            PeerState::Suspect {
                                tx: Some(tx),
                                since: now,
                            },
                            &self.stats,
                        );
                        membership_changed = true;
                        debug!(peer = ?id, "missed pong, peer suspect");
                    }
                }
            }

            let suspect_expired = matches!(
                p.state.get(),
                PeerState::Suspect { since, .. } if now.duration_since(*since) >= suspect_to_dead
            );
            if suspect_expired {
                // Replacing the state drops the session sender, which closes
                // the writer loop if one is still attached.
                p.state.set(PeerState::Dead, &self.stats);
                membership_changed = true;
                debug!(peer = ?id, "suspect expired, peer dead");
                continue;
            }

            // Connecting peers are not pinged; the handshake itself is the
            // liveness proof there.
            let pingable = match p.state.get() {
                PeerState::Alive(tx) => Some(tx.clone()),
                PeerState::Suspect { tx: Some(tx), .. } => Some(tx.clone()),
                _ => None,
            };
            let due = p
                .last_ping_sent
                .is_none_or(|sent| now.duration_since(sent) >= ping_interval);
            if due && p.pending_ping.is_none() {
                if let Some(tx) = pingable {
                    let nonce = rand::random();
                    p.last_ping_sent = Some(now);
                    p.pending_ping = Some((nonce, now));
                    orders.push(PingOrder {
                        id: *id,
                        nonce,
                        tx,
                    });
                }
            }
        }
        if membership_changed {
            self.rebuild_alive(&g);
        }
        orders
    }

    /// A PONG arrived. Three consecutive successes restore a suspect to
    /// Alive.
    pub fn on_pong(&self, id: NodeId, nonce: u64) {
        let mut g = self.peers.write();
        let Some(p) = g.get_mut(&id) else { return };
        match p.pending_ping {
            Some((expected, _)) if expected == nonce => p.pending_ping = None,
            _ => return,
        }
        p.last_seen_epoch_ms = p.last_seen_epoch_ms.max(epoch_ms());
        p.consecutive_pongs = p.consecutive_pongs.saturating_add(1);
        let recovered = match p.state.get() {
            PeerState::Suspect { tx: Some(tx), .. } if p.consecutive_pongs >= 3 => {
                Some(tx.clone())
            }
            _ => None,
        };
        if let Some(tx) = recovered {
            p.state.set(PeerState::Alive(tx), &self.stats);
            debug!(peer = ?id, "suspect recovered");
            self.rebuild_alive(&g);
        }
    }

    pub fn peer_views(&self) -> Vec<PeerView> {
        let mut views: Vec<PeerView> = self
            .peers
            .read()
            .iter()
            .map(|(id, p)| PeerView {
                id: *id,
                addr: p.addr,
                state: p.state.get().name(),
                first_seen_epoch_ms: p.first_seen_epoch_ms,
                last_seen_epoch_ms: p.last_seen_epoch_ms,
            })
            .collect();
        views.sort_by_key(|v| v.id);
        views
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::WriterRequest;
    use ironswarm_core::generate_node_id;
    use tokio::sync::mpsc;

    fn tx() -> SessionTx {
        mpsc::channel::<WriterRequest>(16).0
    }

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    fn registry() -> PeerRegistry {
        PeerRegistry::new(generate_node_id(), 16)
    }

    #[test]
    fn test_alive_snapshot_sorted_and_counted() {
        let r = registry();
        let mut ids: Vec<NodeId> = (0..4).map(|_| generate_node_id()).collect();
        for (i, id) in ids.iter().enumerate() {
            r.session_established(*id, addr(9000 + i as u16), tx());
        }
        ids.sort();
        let snap = r.alive_snapshot();
        let got: Vec<NodeId> = snap.iter().map(|e| e.id).collect();
        assert_eq!(got, ids);
        assert_eq!(r.n_alive(), 5);
        assert_eq!(r.stats.alive.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_session_closed_moves_to_suspect() {
        let r = registry();
        let id = generate_node_id();
        r.session_established(id, addr(9000), tx());
        r.session_closed(id);
        assert_eq!(r.n_alive(), 1);
        assert_eq!(r.stats.suspect.load(Ordering::Relaxed), 1);
        assert_eq!(r.stats.alive.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_last_seen_is_monotone() {
        let r = registry();
        let id = generate_node_id();
        r.session_established(id, addr(9000), tx());
        let before = r.peer_views()[0].last_seen_epoch_ms;
        r.refresh_last_seen(id, before.saturating_sub(10_000));
        assert_eq!(r.peer_views()[0].last_seen_epoch_ms, before);
        r.refresh_last_seen(id, before + 5);
        assert_eq!(r.peer_views()[0].last_seen_epoch_ms, before + 5);
    }

    #[test]
    fn test_quarantined_peer_refuses_connect() {
        let r = registry();
        let id = generate_node_id();
        r.session_established(id, addr(9000), tx());
        r.mark_dead_quarantined(id, Duration::from_secs(300));
        assert!(!r.begin_connecting(id, addr(9000), tx()));
        assert_eq!(r.stats.dead.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_suspect_recovers_after_three_pongs() {
        let r = registry();
        let id = generate_node_id();
        r.session_established(id, addr(9000), tx());

        // Force suspect with a live tx by timing out a ping.
        let orders = r.liveness_tick(
            Duration::from_secs(0),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        assert_eq!(orders.len(), 1);
        {
            let mut g = r.peers.write();
            let p = g.get_mut(&id).unwrap();
            p.pending_ping = Some((orders[0].nonce, Instant::now() - Duration::from_secs(10)));
        }
        let _ = r.liveness_tick(
            Duration::from_secs(3600),
            Duration::from_secs(2),
            Duration::from_secs(3600),
        );
        assert_eq!(r.stats.suspect.load(Ordering::Relaxed), 1);

        for i in 0..3u64 {
            {
                let mut g = r.peers.write();
                g.get_mut(&id).unwrap().pending_ping = Some((i, Instant::now()));
            }
            r.on_pong(id, i);
        }
        assert_eq!(r.stats.alive.load(Ordering::Relaxed), 1);
        assert_eq!(r.n_alive(), 2);
    }

    #[test]
    fn test_suspect_expires_to_dead() {
        let r = registry();
        let id = generate_node_id();
        r.session_established(id, addr(9000), tx());
        r.session_closed(id);
        {
            let mut g = r.peers.write();
            if let PeerState::Suspect { since, .. } = &mut g.get_mut(&id).unwrap().state.0 {
                *since = Instant::now() - Duration::from_secs(60);
            }
        }
        let _ = r.liveness_tick(
            Duration::from_secs(3600),
            Duration::from_secs(2),
            Duration::from_secs(30),
        );
        assert_eq!(r.stats.dead.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_gossip_merge_respects_freshness() {
        let r = registry();
        let id = generate_node_id();
        r.session_established(id, addr(9000), tx());
        let now = epoch_ms();
        // Stale observation: outside the freshness window, ignored.
        r.merge_gossip_entry(id, addr(9001), now.saturating_sub(60_000), Duration::from_secs(30));
        assert_eq!(r.peer_views()[0].addr, addr(9000));
        // Fresh observation: taken.
        r.merge_gossip_entry(id, addr(9001), now, Duration::from_secs(30));
        assert_eq!(r.peer_views()[0].addr, addr(9001));
    }
}

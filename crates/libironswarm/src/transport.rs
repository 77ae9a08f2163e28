use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{Arc, OnceLock, Weak},
    time::Duration,
};

use anyhow::{Context, bail};
use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use ironswarm_core::{NodeId, spawn_utils::spawn_with_cancel};
use ironswarm_metrics::{Counter, MetricsCore, Snapshot, epoch_ms};
use ironswarm_proto::{
    ByePayload, ControlEnvelope, FrameKind, GossipPayload, Hello, PROTOCOL_VERSION, PREAMBLE_LEN,
    PingPayload, PongPayload, RawFrame, SnapshotRequest, SnapshotResponse, parse_frame_body,
    parse_length_prefix, serialize_frame,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn};

use crate::{config::NodeOptions, peer_registry::PeerRegistry};

/// What the writer side of a session consumes.
#[derive(Debug)]
pub enum WriterRequest {
    Frame(Bytes),
    Disconnect,
}

pub type SessionTx = mpsc::Sender<WriterRequest>;
pub type SessionRx = mpsc::Receiver<WriterRequest>;

/// Frames advertised in HELLO. Two peers disagreeing on this set refuse the
/// session at HELLO_ACK.
pub const FRAME_FEATURE: &str = "frames:v1";

pub(crate) async fn with_timeout<T, E>(
    name: &'static str,
    timeout_value: Duration,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> anyhow::Result<T>
where
    E: Into<anyhow::Error>,
{
    match timeout(timeout_value, fut).await {
        Ok(v) => v.map_err(Into::into),
        Err(_) => anyhow::bail!("timeout {name} at {timeout_value:?}"),
    }
}

pub(crate) fn encode_frame<T: Serialize>(kind: FrameKind, payload: &T) -> anyhow::Result<Bytes> {
    let mut buf = Vec::with_capacity(PREAMBLE_LEN + 128);
    serialize_frame(kind, payload, &mut buf).context("error encoding frame")?;
    Ok(buf.into())
}

/// Inbound frames that are not handled inside the transport itself are
/// routed through this seam; the node implements it.
#[async_trait]
pub(crate) trait FrameHandler: Send + Sync {
    async fn on_gossip(&self, from: NodeId, payload: GossipPayload);
    async fn on_control(&self, from: NodeId, envelope: ControlEnvelope);
    fn local_snapshot(&self) -> anyhow::Result<Snapshot>;
    fn on_snapshot_response(&self, response: SnapshotResponse);
}

enum Dispatch {
    Continue,
    Closed,
}

pub(crate) struct Transport {
    hello: Hello,
    opts: NodeOptions,
    registry: Arc<PeerRegistry>,
    handler: OnceLock<Weak<dyn FrameHandler>>,
    cancel: CancellationToken,
    // Suppress concurrent dials to the same target.
    dialing_ids: Mutex<HashSet<NodeId>>,
    dialing_addrs: Mutex<HashSet<SocketAddr>>,
    dropped_frames: Counter,
    malformed_frames: Counter,
}

impl Transport {
    pub fn new(
        self_id: NodeId,
        opts: NodeOptions,
        registry: Arc<PeerRegistry>,
        metrics: &MetricsCore,
        cancel: CancellationToken,
    ) -> Self {
        let hello = Hello {
            id: self_id,
            listen_addr: opts.advertised(),
            version: PROTOCOL_VERSION,
            features: vec![FRAME_FEATURE.to_owned()],
            started_at_epoch_ms: epoch_ms(),
        };
        Self {
            hello,
            opts,
            registry,
            handler: OnceLock::new(),
            cancel,
            dialing_ids: Default::default(),
            dialing_addrs: Default::default(),
            dropped_frames: metrics.counter("transport_dropped_frames_total", &[]),
            malformed_frames: metrics.counter("gossip_malformed_total", &[]),
        }
    }

    pub fn set_handler(&self, handler: Weak<dyn FrameHandler>) {
        let _ = self.handler.set(handler);
    }

    /// The address this node tells peers to dial it on.
    pub fn advertised_addr(&self) -> SocketAddr {
        self.hello.listen_addr
    }

    fn handler(&self) -> anyhow::Result<Arc<dyn FrameHandler>> {
        self.handler
            .get()
            .and_then(|w| w.upgrade())
            .context("node is shutting down")
    }

    /// Queues a frame on a session. Non-CONTROL writes never block: a full
    /// queue drops the frame and bumps a counter.
    pub fn send_frame<T: Serialize>(
        &self,
        tx: &SessionTx,
        kind: FrameKind,
        payload: &T,
    ) -> anyhow::Result<bool> {
        let bytes = encode_frame(kind, payload)?;
        match tx.try_send(WriterRequest::Frame(bytes)) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped_frames.inc();
                trace!(kind = %kind, "outbound queue full, frame dropped");
                Ok(false)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(false),
        }
    }

    /// CONTROL frames may block up to `control_send_timeout`; expiry fails
    /// the session.
    pub async fn send_control(
        &self,
        to: NodeId,
        tx: &SessionTx,
        envelope: &ControlEnvelope,
    ) -> anyhow::Result<()> {
        let bytes = encode_frame(FrameKind::Control, envelope)?;
        match timeout(
            self.opts.control_send_timeout,
            tx.send(WriterRequest::Frame(bytes)),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => bail!("session closed"),
            Err(_) => {
                warn!(peer = ?to, "control send timed out, failing session");
                self.registry.session_closed(to);
                let _ = tx.try_send(WriterRequest::Disconnect);
                bail!("control send timed out")
            }
        }
    }

    /// Sends a frame to a peer by identity, dialing a session first if none
    /// exists and the address is known.
    pub fn send_to_peer<T: Serialize>(
        self: &Arc<Self>,
        id: NodeId,
        addr_hint: Option<SocketAddr>,
        kind: FrameKind,
        payload: &T,
    ) -> anyhow::Result<bool> {
        if let Some(tx) = self.registry.session_tx(&id) {
            return self.send_frame(&tx, kind, payload);
        }
        let addr = addr_hint
            .or_else(|| self.registry.addr_of(&id))
            .context("no address for peer")?;
        self.spawn_connect(addr, Some(id));
        match self.registry.session_tx(&id) {
            Some(tx) => self.send_frame(&tx, kind, payload),
            None => Ok(false),
        }
    }

    /// Accept loop over the bound listener; one task per incoming session.
    pub async fn accept_loop(
        self: Arc<Self>,
        listener: tokio::net::TcpListener,
    ) -> anyhow::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await.context("error accepting")?;
            let this = self.clone();
            spawn_with_cancel(
                debug_span!("incoming", %addr),
                self.cancel.clone(),
                async move {
                    if let Err(e) = this.run_incoming(stream, addr).await {
                        debug!("session ended: {e:#}");
                    }
                    Ok(())
                },
            );
        }
    }

    async fn run_incoming(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) -> anyhow::Result<()> {
        let rwtimeout = self.opts.read_write_timeout;
        let (mut read, mut write) = stream.into_split();

        let frame = read_frame(&mut read, rwtimeout).await?;
        if frame.kind != FrameKind::Hello {
            bail!("expected HELLO, got {}", frame.kind);
        }
        let hello: Hello = frame.decode_payload()?;
        debug!(%addr, peer = ?hello.id, "incoming session");
        self.validate_handshake(&hello)?;

        // Duplicate sessions: the one initiated by the lower identity wins.
        // This session was initiated by the remote.
        if self.registry.session_tx(&hello.id).is_some() && self.hello.id < hello.id {
            debug!(peer = ?hello.id, "duplicate session, keeping ours");
            let bytes = encode_frame(FrameKind::Bye, &ByePayload::default())?;
            let _ = with_timeout("writing", rwtimeout, write.write_all(&bytes)).await;
            return Ok(());
        }

        let bytes = encode_frame(FrameKind::HelloAck, &self.hello)?;
        with_timeout("writing", rwtimeout, write.write_all(&bytes))
            .await
            .context("error writing HELLO_ACK")?;

        let (tx, mut rx) = mpsc::channel(self.opts.outbound_queue_capacity);
        self.registry
            .session_established(hello.id, hello.listen_addr, tx.clone());

        let res = self.manage_session(hello.id, &mut read, &mut write, &mut rx, &tx).await;
        self.close_if_current(hello.id, &tx);
        // The remote owned this session; unless it left on purpose we take
        // over reconnection from our side too.
        if self.registry.is_reconnect_worthy(&hello.id) {
            self.spawn_connect(hello.listen_addr, Some(hello.id));
        }
        res
    }

    fn validate_handshake(&self, hello: &Hello) -> anyhow::Result<()> {
        if hello.id == self.hello.id {
            bail!("peer has our identity, rejecting");
        }
        if !hello.version.compatible_with(&PROTOCOL_VERSION) {
            self.registry
                .mark_dead_quarantined(hello.id, self.opts.handshake_quarantine);
            bail!(
                "protocol version mismatch: ours {:?}, theirs {:?}",
                PROTOCOL_VERSION,
                hello.version
            );
        }
        if !hello.features.iter().any(|f| f == FRAME_FEATURE) {
            self.registry
                .mark_dead_quarantined(hello.id, self.opts.handshake_quarantine);
            bail!("peer does not speak {FRAME_FEATURE}");
        }
        Ok(())
    }

    /// Dials a peer and keeps the session alive with exponential backoff
    /// until the node shuts down or the peer goes dead. For a known
    /// identity the peer moves to Connecting immediately and outbound
    /// frames start queueing on the session channel before the dial
    /// completes.
    pub fn spawn_connect(self: &Arc<Self>, addr: SocketAddr, expect_id: Option<NodeId>) {
        let mut chan: Option<(SessionTx, SessionRx)> = None;
        match expect_id {
            Some(id) => {
                if !self.dialing_ids.lock().insert(id) {
                    return;
                }
                let (tx, rx) = mpsc::channel(self.opts.outbound_queue_capacity);
                if !self.registry.begin_connecting(id, addr, tx.clone()) {
                    self.dialing_ids.lock().remove(&id);
                    return;
                }
                chan = Some((tx, rx));
            }
            None => {
                if !self.dialing_addrs.lock().insert(addr) {
                    return;
                }
            }
        }
        let this = self.clone();
        spawn_with_cancel(
            debug_span!("outgoing", %addr),
            self.cancel.clone(),
            async move {
                let res = this.clone().run_outgoing(addr, expect_id, chan).await;
                match expect_id {
                    Some(id) => {
                        this.dialing_ids.lock().remove(&id);
                    }
                    None => {
                        this.dialing_addrs.lock().remove(&addr);
                    }
                }
                res
            },
        );
    }

    async fn run_outgoing(
        self: Arc<Self>,
        addr: SocketAddr,
        mut expect_id: Option<NodeId>,
        mut chan: Option<(SessionTx, SessionRx)>,
    ) -> anyhow::Result<()> {
        // Reconnection policy: exponential backoff base 500ms, cap 30s,
        // full jitter, no attempt cap. The channel outlives individual
        // connections so queued frames survive a reconnect.
        let mut backoff = reconnect_backoff();
        loop {
            let mut established = false;
            match self
                .connect_once(addr, &mut expect_id, &mut chan, &mut established)
                .await
            {
                Ok(()) => {
                    // Session ended cleanly (BYE or disconnect request).
                    return Ok(());
                }
                Err(e) => {
                    debug!("session attempt failed: {e:#}");
                }
            }
            if established {
                backoff = reconnect_backoff();
            }
            if let Some(id) = expect_id {
                self.registry.session_closed(id);
                if self.registry.session_tx(&id).is_some() {
                    // Another session (incoming) took over.
                    return Ok(());
                }
                if !self.registry.is_reconnect_worthy(&id) {
                    debug!(peer = ?id, "peer dead or quarantined, giving up reconnects");
                    return Ok(());
                }
            }
            let delay = backoff.next().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_once(
        &self,
        addr: SocketAddr,
        expect_id: &mut Option<NodeId>,
        chan: &mut Option<(SessionTx, SessionRx)>,
        established: &mut bool,
    ) -> anyhow::Result<()> {
        let rwtimeout = self.opts.read_write_timeout;
        let stream = with_timeout(
            "connecting",
            self.opts.connect_timeout,
            TcpStream::connect(addr),
        )
        .await?;
        let (mut read, mut write) = stream.into_split();

        let bytes = encode_frame(FrameKind::Hello, &self.hello)?;
        with_timeout("writing", rwtimeout, write.write_all(&bytes))
            .await
            .context("error writing HELLO")?;

        let frame = read_frame(&mut read, rwtimeout).await?;
        let ack: Hello = match frame.kind {
            FrameKind::HelloAck => frame.decode_payload()?,
            FrameKind::Bye => {
                // The peer kept its own session to us.
                debug!("peer refused duplicate session");
                return Ok(());
            }
            other => bail!("expected HELLO_ACK, got {other}"),
        };
        self.validate_handshake(&ack)?;
        if let Some(expected) = *expect_id {
            if ack.id != expected {
                debug!(expected = ?expected, actual = ?ack.id, "peer identity changed at address");
            }
        }
        *expect_id = Some(ack.id);

        let (tx, rx) = chan.get_or_insert_with(|| {
            mpsc::channel(self.opts.outbound_queue_capacity)
        });
        self.registry
            .session_established(ack.id, ack.listen_addr, tx.clone());
        *established = true;
        let tx = tx.clone();

        let res = self.manage_session(ack.id, &mut read, &mut write, rx, &tx).await;
        self.close_if_current(ack.id, &tx);
        res
    }

    fn close_if_current(&self, id: NodeId, tx: &SessionTx) {
        if let Some(cur) = self.registry.session_tx(&id) {
            if cur.same_channel(tx) {
                self.registry.session_closed(id);
            }
        }
    }

    async fn manage_session(
        &self,
        id: NodeId,
        read: &mut OwnedReadHalf,
        write: &mut OwnedWriteHalf,
        rx: &mut SessionRx,
        tx: &SessionTx,
    ) -> anyhow::Result<()> {
        let rwtimeout = self.opts.read_write_timeout;

        let writer = async {
            loop {
                let req = match rx.recv().await {
                    Some(req) => req,
                    None => bail!("closing writer, channel closed"),
                };
                match req {
                    WriterRequest::Frame(bytes) => {
                        with_timeout("writing", rwtimeout, write.write_all(&bytes))
                            .await
                            .context("error writing frame")?;
                    }
                    WriterRequest::Disconnect => {
                        trace!("disconnect requested, closing writer");
                        return Ok(());
                    }
                }
            }

            #[allow(unreachable_code)]
            Ok::<_, anyhow::Error>(())
        };

        let reader = async {
            loop {
                let frame = read_frame(read, rwtimeout).await?;
                trace!(kind = %frame.kind, "received");
                match self.dispatch(id, frame, tx).await? {
                    Dispatch::Continue => {}
                    Dispatch::Closed => return Ok(()),
                }
            }

            #[allow(unreachable_code)]
            Ok::<_, anyhow::Error>(())
        };

        tokio::select! {
            r = reader => {
                if let Err(e) = r.as_ref() {
                    trace!("reader finished with error: {e:#}");
                }
                r
            }
            r = writer => {
                if let Err(e) = r.as_ref() {
                    trace!("writer finished with error: {e:#}");
                }
                r
            }
        }
    }

    async fn dispatch(&self, from: NodeId, frame: RawFrame, tx: &SessionTx) -> anyhow::Result<Dispatch> {
        self.registry.refresh_last_seen(from, epoch_ms());
        match frame.kind {
            FrameKind::Ping => {
                let ping: PingPayload = frame.decode_payload()?;
                self.send_frame(tx, FrameKind::Pong, &PongPayload { nonce: ping.nonce })?;
            }
            FrameKind::Pong => {
                let pong: PongPayload = frame.decode_payload()?;
                self.registry.on_pong(from, pong.nonce);
            }
            FrameKind::Gossip => match frame.decode_payload::<GossipPayload>() {
                Ok(payload) => self.handler()?.on_gossip(from, payload).await,
                Err(e) => {
                    // A malformed gossip frame does not kill the session.
                    self.malformed_frames.inc();
                    warn!(peer = ?from, "dropping malformed gossip frame: {e:#}");
                }
            },
            FrameKind::Control => match frame.decode_payload::<ControlEnvelope>() {
                Ok(envelope) => self.handler()?.on_control(from, envelope).await,
                Err(e) => {
                    self.malformed_frames.inc();
                    warn!(peer = ?from, "dropping malformed control frame: {e:#}");
                }
            },
            FrameKind::SnapshotReq => {
                let req: SnapshotRequest = frame.decode_payload()?;
                let snapshot = self.handler()?.local_snapshot()?;
                self.send_frame(
                    tx,
                    FrameKind::SnapshotResp,
                    &SnapshotResponse {
                        request_id: req.request_id,
                        snapshot,
                    },
                )?;
            }
            FrameKind::SnapshotResp => {
                let resp: SnapshotResponse = frame.decode_payload()?;
                self.handler()?.on_snapshot_response(resp);
            }
            FrameKind::Bye => {
                debug!(peer = ?from, "peer said goodbye");
                self.registry.mark_departed(from);
                return Ok(Dispatch::Closed);
            }
            FrameKind::Hello | FrameKind::HelloAck => {
                bail!("unexpected {} mid-session", frame.kind);
            }
        }
        Ok(Dispatch::Continue)
    }

    /// Best-effort BYE to every alive peer; used during graceful shutdown.
    pub fn broadcast_bye(&self) {
        let bye = ByePayload { reason: None };
        for entry in self.registry.alive_snapshot().iter() {
            let _ = self.send_frame(&entry.tx, FrameKind::Bye, &bye);
        }
    }
}

fn reconnect_backoff() -> impl Iterator<Item = Duration> {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(30))
        .with_jitter()
        .without_max_times()
        .build()
}

async fn read_frame(read: &mut OwnedReadHalf, rwtimeout: Duration) -> anyhow::Result<RawFrame> {
    let mut header = [0u8; 4];
    with_timeout("reading header", rwtimeout, read.read_exact(&mut header))
        .await
        .context("error reading frame header")?;
    let body_len = parse_length_prefix(&header)?;
    let mut body = vec![0u8; body_len];
    with_timeout("reading body", rwtimeout, read.read_exact(&mut body))
        .await
        .context("error reading frame body")?;
    Ok(parse_frame_body(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame_roundtrips_through_parse() {
        let bytes = encode_frame(FrameKind::Ping, &PingPayload { nonce: 7 }).unwrap();
        let body_len = parse_length_prefix(&bytes[..4]).unwrap();
        assert_eq!(body_len, bytes.len() - 4);
        let frame = parse_frame_body(&bytes[4..]).unwrap();
        assert_eq!(frame.kind, FrameKind::Ping);
        let ping: PingPayload = frame.decode_payload().unwrap();
        assert_eq!(ping.nonce, 7);
    }

    #[test]
    fn test_backoff_is_bounded() {
        let delays: Vec<Duration> = reconnect_backoff().take(20).collect();
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(60)));
    }
}

// IronSwarm peer wire protocol: framing, payload schemas, serialization.
//
// Every frame on the wire is `u32 BE length | u8 kind | payload`, where
// length covers the kind byte plus the payload. Payloads are JSON-encoded
// serde structs: self-describing, and stable across versions as long as
// fields are only added.

use std::net::SocketAddr;

use byteorder::{BE, ByteOrder};
use serde::{Deserialize, Serialize};

use ironswarm_core::{Id16, NodeId, ScenarioId};
use ironswarm_metrics::Snapshot;

pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

const LENGTH_LEN: usize = 4;
const KIND_LEN: usize = 1;
pub const PREAMBLE_LEN: usize = LENGTH_LEN + KIND_LEN;

// Snapshots dominate frame sizes; anything beyond this is a broken or
// hostile peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

type KindId = u8;

const KIND_HELLO: KindId = 1;
const KIND_HELLO_ACK: KindId = 2;
const KIND_PING: KindId = 3;
const KIND_PONG: KindId = 4;
const KIND_GOSSIP: KindId = 5;
const KIND_CONTROL: KindId = 6;
const KIND_SNAPSHOT_REQ: KindId = 7;
const KIND_SNAPSHOT_RESP: KindId = 8;
const KIND_BYE: KindId = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Hello,
    HelloAck,
    Ping,
    Pong,
    Gossip,
    Control,
    SnapshotReq,
    SnapshotResp,
    Bye,
}

impl FrameKind {
    pub const fn id(&self) -> KindId {
        match self {
            FrameKind::Hello => KIND_HELLO,
            FrameKind::HelloAck => KIND_HELLO_ACK,
            FrameKind::Ping => KIND_PING,
            FrameKind::Pong => KIND_PONG,
            FrameKind::Gossip => KIND_GOSSIP,
            FrameKind::Control => KIND_CONTROL,
            FrameKind::SnapshotReq => KIND_SNAPSHOT_REQ,
            FrameKind::SnapshotResp => KIND_SNAPSHOT_RESP,
            FrameKind::Bye => KIND_BYE,
        }
    }

    pub const fn from_id(id: KindId) -> Option<FrameKind> {
        Some(match id {
            KIND_HELLO => FrameKind::Hello,
            KIND_HELLO_ACK => FrameKind::HelloAck,
            KIND_PING => FrameKind::Ping,
            KIND_PONG => FrameKind::Pong,
            KIND_GOSSIP => FrameKind::Gossip,
            KIND_CONTROL => FrameKind::Control,
            KIND_SNAPSHOT_REQ => FrameKind::SnapshotReq,
            KIND_SNAPSHOT_RESP => FrameKind::SnapshotResp,
            KIND_BYE => FrameKind::Bye,
            _ => return None,
        })
    }

    pub const fn name(&self) -> &'static str {
        match self {
            FrameKind::Hello => "hello",
            FrameKind::HelloAck => "hello_ack",
            FrameKind::Ping => "ping",
            FrameKind::Pong => "pong",
            FrameKind::Gossip => "gossip",
            FrameKind::Control => "control",
            FrameKind::SnapshotReq => "snapshot_req",
            FrameKind::SnapshotResp => "snapshot_resp",
            FrameKind::Bye => "bye",
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("not enough data: expected at least {0} more bytes")]
    NotEnoughData(usize),
    #[error("unsupported frame kind {0}")]
    UnsupportedFrameKind(u8),
    #[error("frame length {len} exceeds maximum {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("frame length {0} is shorter than the kind byte")]
    FrameTooShort(usize),
    #[error("error decoding {kind} payload: {source}")]
    Payload {
        kind: FrameKind,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(thiserror::Error, Debug)]
#[error("error encoding {kind} payload: {source}")]
pub struct EncodeError {
    pub kind: FrameKind,
    #[source]
    pub source: serde_json::Error,
}

/// A parsed frame header plus its raw payload bytes. Payload decoding is a
/// separate step so transport can route on kind without touching the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl RawFrame {
    pub fn decode_payload<'a, T: Deserialize<'a>>(&'a self) -> Result<T, DecodeError> {
        serde_json::from_slice(&self.payload).map_err(|source| DecodeError::Payload {
            kind: self.kind,
            source,
        })
    }
}

/// Serializes one frame into `buf` (cleared first). Returns the number of
/// bytes written.
pub fn serialize_frame<T: Serialize>(
    kind: FrameKind,
    payload: &T,
    buf: &mut Vec<u8>,
) -> Result<usize, EncodeError> {
    buf.clear();
    buf.resize(PREAMBLE_LEN, 0);
    serde_json::to_writer(&mut *buf, payload).map_err(|source| EncodeError { kind, source })?;
    let len = buf.len() - LENGTH_LEN;
    BE::write_u32(&mut buf[..LENGTH_LEN], len as u32);
    buf[LENGTH_LEN] = kind.id();
    Ok(buf.len())
}

/// Parses the 4-byte length prefix, validating it against [`MAX_FRAME_LEN`].
/// Returns the number of bytes (kind + payload) that follow the prefix.
pub fn parse_length_prefix(header: &[u8]) -> Result<usize, DecodeError> {
    if header.len() < LENGTH_LEN {
        return Err(DecodeError::NotEnoughData(LENGTH_LEN - header.len()));
    }
    let len = BE::read_u32(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DecodeError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    if len < KIND_LEN {
        return Err(DecodeError::FrameTooShort(len));
    }
    Ok(len)
}

/// Parses the body that followed a length prefix (kind byte + payload).
pub fn parse_frame_body(body: &[u8]) -> Result<RawFrame, DecodeError> {
    let (kind, payload) = match body.split_first() {
        Some(v) => v,
        None => return Err(DecodeError::NotEnoughData(KIND_LEN)),
    };
    let kind = FrameKind::from_id(*kind).ok_or(DecodeError::UnsupportedFrameKind(*kind))?;
    Ok(RawFrame {
        kind,
        payload: payload.to_vec(),
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Peers must agree on the major version; minor additions are
    /// backwards-compatible.
    pub fn compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }
}

/// Sent both ways when a session is established. The same schema serves
/// HELLO and HELLO_ACK.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub id: NodeId,
    /// The address other peers can dial this node on (not the ephemeral
    /// source address of the connection).
    pub listen_addr: SocketAddr,
    pub version: ProtocolVersion,
    pub features: Vec<String>,
    pub started_at_epoch_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub nonce: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    pub nonce: u64,
}

/// One alive-set entry carried in a GOSSIP frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen_epoch_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipPayload {
    pub entries: Vec<PeerEntry>,
}

/// Identity of a control message: origin node plus its monotonically
/// increasing sequence number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControlMsgId {
    pub origin: NodeId,
    pub seq: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlEnvelope {
    pub msg_id: ControlMsgId,
    pub hops_remaining: u32,
    pub payload: ControlPayload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlPayload {
    ScenarioStart {
        scenario: ScenarioSpec,
    },
    ScenarioStop {
        scenario_id: ScenarioId,
    },
    /// Aggregator fan-out: every receiver snapshots locally and replies with
    /// SNAPSHOT_RESP directly to `requester_addr`.
    SnapshotPing {
        request_id: Id16,
        requester: NodeId,
        requester_addr: SocketAddr,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub request_id: Id16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub request_id: Id16,
    pub snapshot: Snapshot,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ByePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Cluster-wide declarative rate for one journey. Each node consumes
/// `target_rps / N_alive`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeModel {
    pub target_rps: f64,
    pub duration_s: f64,
    #[serde(default)]
    pub ramp_s: f64,
}

impl VolumeModel {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.target_rps > 0.) {
            anyhow::bail!("target_rps must be positive, got {}", self.target_rps);
        }
        if !(self.duration_s > 0.) {
            anyhow::bail!("duration_s must be positive, got {}", self.duration_s);
        }
        if self.ramp_s < 0. || !self.ramp_s.is_finite() {
            anyhow::bail!("ramp_s must be non-negative, got {}", self.ramp_s);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatapoolSpec {
    InMemoryOnce { rows: Vec<String> },
    InMemoryRecycle { rows: Vec<String> },
    FileOnce { path: String },
    FileRecycle { path: String },
}

/// One declarative HTTP request within a journey. `{row}` in the url or
/// body is substituted with the datapool row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HttpStep {
    pub label: String,
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JourneySpec {
    pub name: String,
    pub volume: VolumeModel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datapool: Option<DatapoolSpec>,
    pub steps: Vec<HttpStep>,
}

/// The full scenario descriptor as carried by `ScenarioStart` and accepted
/// from the CLI and the dashboard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub scenario_id: ScenarioId,
    #[serde(default)]
    pub start_delay_s: f64,
    pub journeys: Vec<JourneySpec>,
}

impl ScenarioSpec {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.journeys.is_empty() {
            anyhow::bail!("scenario {:?} has no journeys", self.scenario_id);
        }
        if self.start_delay_s < 0. || !self.start_delay_s.is_finite() {
            anyhow::bail!("start_delay_s must be non-negative");
        }
        for j in &self.journeys {
            if j.name.is_empty() {
                anyhow::bail!("journey with empty name");
            }
            j.volume.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironswarm_core::generate_node_id;

    fn hello() -> Hello {
        Hello {
            id: generate_node_id(),
            listen_addr: "127.0.0.1:42042".parse().unwrap(),
            version: PROTOCOL_VERSION,
            features: vec!["frames:v1".into()],
            started_at_epoch_ms: 123,
        }
    }

    #[test]
    fn test_frame_roundtrip() {
        let h = hello();
        let mut buf = Vec::new();
        let written = serialize_frame(FrameKind::Hello, &h, &mut buf).unwrap();
        assert_eq!(written, buf.len());

        let body_len = parse_length_prefix(&buf[..4]).unwrap();
        assert_eq!(body_len, buf.len() - 4);
        let frame = parse_frame_body(&buf[4..]).unwrap();
        assert_eq!(frame.kind, FrameKind::Hello);
        let back: Hello = frame.decode_payload().unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let body = [0xEEu8, b'{', b'}'];
        assert!(matches!(
            parse_frame_body(&body),
            Err(DecodeError::UnsupportedFrameKind(0xEE))
        ));
    }

    #[test]
    fn test_oversize_frame_is_rejected() {
        let mut header = [0u8; 4];
        BE::write_u32(&mut header, (MAX_FRAME_LEN + 1) as u32);
        assert!(matches!(
            parse_length_prefix(&header),
            Err(DecodeError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_truncated_header() {
        assert!(matches!(
            parse_length_prefix(&[0, 0]),
            Err(DecodeError::NotEnoughData(2))
        ));
    }

    #[test]
    fn test_zero_length_frame_has_no_kind() {
        let header = [0u8; 4];
        assert!(matches!(
            parse_length_prefix(&header),
            Err(DecodeError::FrameTooShort(0))
        ));
    }

    #[test]
    fn test_malformed_payload_names_kind() {
        let body = [KIND_GOSSIP, b'n', b'o', b'p', b'e'];
        let frame = parse_frame_body(&body).unwrap();
        let err = frame.decode_payload::<GossipPayload>().unwrap_err();
        assert!(err.to_string().contains("gossip"));
    }

    #[test]
    fn test_control_payload_roundtrip() {
        let env = ControlEnvelope {
            msg_id: ControlMsgId {
                origin: generate_node_id(),
                seq: 42,
            },
            hops_remaining: 3,
            payload: ControlPayload::ScenarioStop {
                scenario_id: generate_node_id(),
            },
        };
        let mut buf = Vec::new();
        serialize_frame(FrameKind::Control, &env, &mut buf).unwrap();
        let frame = parse_frame_body(&buf[4..]).unwrap();
        let back: ControlEnvelope = frame.decode_payload().unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_version_compatibility() {
        let v1 = ProtocolVersion { major: 1, minor: 0 };
        let v1_5 = ProtocolVersion { major: 1, minor: 5 };
        let v2 = ProtocolVersion { major: 2, minor: 0 };
        assert!(v1.compatible_with(&v1_5));
        assert!(!v1.compatible_with(&v2));
    }

    #[test]
    fn test_volume_model_validation() {
        assert!(
            VolumeModel {
                target_rps: 0.,
                duration_s: 1.,
                ramp_s: 0.
            }
            .validate()
            .is_err()
        );
        assert!(
            VolumeModel {
                target_rps: 10.,
                duration_s: 10.,
                ramp_s: 2.
            }
            .validate()
            .is_ok()
        );
    }
}

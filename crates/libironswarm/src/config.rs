use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

pub const DEFAULT_PORT: u16 = 42042;

/// All tunables of one node. Durations serialize as seconds.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOptions {
    /// Where to bind the peer listener.
    pub listen_addr: SocketAddr,
    /// The address advertised to peers in HELLO and gossip. Defaults to
    /// `listen_addr`; must differ when binding a wildcard address.
    pub advertise_addr: Option<SocketAddr>,
    /// Initial peers to dial at startup.
    pub bootstrap: Vec<SocketAddr>,

    #[serde_as(as = "serde_with::DurationSecondsWithFrac")]
    pub ping_interval: Duration,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac")]
    pub ping_timeout: Duration,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac")]
    pub suspect_to_dead: Duration,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac")]
    pub handshake_quarantine: Duration,

    #[serde_as(as = "serde_with::DurationSecondsWithFrac")]
    pub gossip_interval: Duration,
    pub gossip_fanout: usize,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac")]
    pub gossip_freshness_window: Duration,
    pub recent_control_capacity: usize,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac")]
    pub recent_control_retention: Duration,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac")]
    pub tombstone_window: Duration,

    #[serde_as(as = "serde_with::DurationSecondsWithFrac")]
    pub connect_timeout: Duration,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac")]
    pub read_write_timeout: Duration,
    /// How long a CONTROL write may block on a full outbound queue before
    /// the session is failed. Other frame kinds are dropped immediately.
    #[serde_as(as = "serde_with::DurationSecondsWithFrac")]
    pub control_send_timeout: Duration,
    pub outbound_queue_capacity: usize,

    #[serde_as(as = "serde_with::DurationSecondsWithFrac")]
    pub pacer_tick: Duration,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac")]
    pub drain_timeout: Duration,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac")]
    pub request_timeout: Duration,

    #[serde_as(as = "serde_with::DurationSecondsWithFrac")]
    pub snapshot_timeout: Duration,

    pub max_peers: usize,
    pub max_scenarios: usize,
    pub max_pacers_per_scenario: usize,
    pub max_in_flight_journeys: usize,
    pub event_buffer_capacity: usize,
    pub datapool_channel_capacity: usize,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            listen_addr: (Ipv4Addr::LOCALHOST, DEFAULT_PORT).into(),
            advertise_addr: None,
            bootstrap: Vec::new(),

            ping_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(2),
            suspect_to_dead: Duration::from_secs(30),
            handshake_quarantine: Duration::from_secs(300),

            gossip_interval: Duration::from_secs(3),
            gossip_fanout: 3,
            gossip_freshness_window: Duration::from_secs(30),
            recent_control_capacity: 4096,
            recent_control_retention: Duration::from_secs(120),
            tombstone_window: Duration::from_secs(5),

            connect_timeout: Duration::from_secs(5),
            read_write_timeout: Duration::from_secs(10),
            control_send_timeout: Duration::from_secs(1),
            outbound_queue_capacity: 256,

            pacer_tick: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),

            snapshot_timeout: Duration::from_secs(2),

            max_peers: 1024,
            max_scenarios: 16,
            max_pacers_per_scenario: 64,
            max_in_flight_journeys: 1024,
            event_buffer_capacity: 4096,
            datapool_channel_capacity: 1024,
        }
    }
}

impl NodeOptions {
    pub fn advertised(&self) -> SocketAddr {
        self.advertise_addr.unwrap_or(self.listen_addr)
    }
}

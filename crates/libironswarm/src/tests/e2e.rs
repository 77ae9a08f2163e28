use std::time::Duration;

use anyhow::{Context, bail};
use ironswarm_core::{NodeId, generate_node_id, generate_scenario_id};
use ironswarm_metrics::epoch_ms;
use ironswarm_proto::{
    DatapoolSpec, FrameKind, Hello, JourneySpec, PROTOCOL_VERSION, RawFrame, ScenarioSpec,
    VolumeModel, parse_frame_body, parse_length_prefix,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

use crate::{
    Node,
    tests::test_util::{setup_test_logging, start_local_node, wait_until},
    transport::{FRAME_FEATURE, encode_frame},
};

fn peer_count(node: &Node) -> usize {
    node.cluster_view()
        .peers
        .iter()
        .filter(|p| p.state == "alive")
        .count()
}

fn nop_scenario(id: ironswarm_core::ScenarioId, duration_s: f64) -> ScenarioSpec {
    ScenarioSpec {
        scenario_id: id,
        start_delay_s: 0.,
        journeys: vec![JourneySpec {
            name: "browse".into(),
            volume: VolumeModel {
                target_rps: 10.,
                duration_s,
                ramp_s: 0.,
            },
            datapool: None,
            steps: vec![],
        }],
    }
}

#[tokio::test]
async fn test_two_node_rendezvous() -> anyhow::Result<()> {
    setup_test_logging();
    let a = start_local_node(vec![]).await?;
    let b = start_local_node(vec![a.advertised_addr()]).await?;

    wait_until(
        || {
            if peer_count(&a) == 1 && peer_count(&b) == 1 {
                Ok(())
            } else {
                bail!(
                    "a sees {} peers, b sees {} peers",
                    peer_count(&a),
                    peer_count(&b)
                )
            }
        },
        Duration::from_secs(10),
    )
    .await?;

    let a_view = a.cluster_view();
    let b_view = b.cluster_view();
    assert_eq!(a_view.peers[0].id, b.id());
    assert_eq!(b_view.peers[0].id, a.id());
    Ok(())
}

#[tokio::test]
async fn test_three_node_gossip_convergence() -> anyhow::Result<()> {
    setup_test_logging();
    let a = start_local_node(vec![]).await?;
    let b = start_local_node(vec![a.advertised_addr()]).await?;
    // C only knows A; it must learn B through gossip.
    let c = start_local_node(vec![a.advertised_addr()]).await?;

    for (name, node) in [("a", &a), ("b", &b), ("c", &c)] {
        wait_until(
            || {
                if peer_count(node) == 2 {
                    Ok(())
                } else {
                    bail!("{name} sees {} peers", peer_count(node))
                }
            },
            Duration::from_secs(20),
        )
        .await?;
    }
    Ok(())
}

#[tokio::test]
async fn test_duplicate_scenario_start_is_idempotent_across_cluster() -> anyhow::Result<()> {
    setup_test_logging();
    let a = start_local_node(vec![]).await?;
    let b = start_local_node(vec![a.advertised_addr()]).await?;
    wait_until(
        || {
            if peer_count(&a) == 1 { Ok(()) } else { bail!("not connected") }
        },
        Duration::from_secs(10),
    )
    .await?;

    let id = generate_scenario_id();
    a.start_scenario(nop_scenario(id, 3600.))?;
    // The gossiped start reaches B exactly once regardless of repeats.
    a.start_scenario(nop_scenario(id, 3600.))?;

    wait_until(
        || {
            if b.scenario_count() == 1 { Ok(()) } else { bail!("b has {} scenarios", b.scenario_count()) }
        },
        Duration::from_secs(10),
    )
    .await?;
    assert_eq!(a.scenario_count(), 1);

    a.stop_scenario(id);
    wait_until(
        || {
            if a.scenario_count() == 0 && b.scenario_count() == 0 {
                Ok(())
            } else {
                bail!("scenarios still active")
            }
        },
        Duration::from_secs(15),
    )
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_cluster_snapshot_merges_peer_counters() -> anyhow::Result<()> {
    setup_test_logging();
    let a = start_local_node(vec![]).await?;
    let b = start_local_node(vec![a.advertised_addr()]).await?;
    wait_until(
        || {
            if peer_count(&a) == 1 { Ok(()) } else { bail!("not connected") }
        },
        Duration::from_secs(10),
    )
    .await?;

    a.metrics().counter("demo_total", &[]).add(2);
    b.metrics().counter("demo_total", &[]).add(5);

    let result = a.cluster_snapshot().await?;
    assert!(!result.partial, "missing: {:?}", result.missing);
    assert_eq!(result.snapshot.counter_value("demo_total", &[]), 7);
    Ok(())
}

/// A peer that completes the handshake and then never answers anything.
async fn spawn_mute_peer(target: std::net::SocketAddr) -> anyhow::Result<NodeId> {
    let id = generate_node_id();
    let mut stream = tokio::net::TcpStream::connect(target)
        .await
        .context("mute peer connect")?;
    let hello = Hello {
        id,
        // Nobody will manage to dial this back within the test.
        listen_addr: "127.0.0.1:1".parse().unwrap(),
        version: PROTOCOL_VERSION,
        features: vec![FRAME_FEATURE.to_owned()],
        started_at_epoch_ms: epoch_ms(),
    };
    let bytes = encode_frame(FrameKind::Hello, &hello)?;
    stream.write_all(&bytes).await?;
    let ack = read_raw_frame(&mut stream).await?;
    if ack.kind != FrameKind::HelloAck {
        bail!("expected HELLO_ACK, got {}", ack.kind);
    }
    tokio::spawn(async move {
        // Swallow everything, reply to nothing.
        let mut sink = vec![0u8; 4096];
        while stream.read(&mut sink).await.map(|n| n > 0).unwrap_or(false) {}
    });
    Ok(id)
}

async fn read_raw_frame(stream: &mut tokio::net::TcpStream) -> anyhow::Result<RawFrame> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let body_len = parse_length_prefix(&header)?;
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await?;
    Ok(parse_frame_body(&body)?)
}

#[tokio::test]
async fn test_partial_snapshot_reports_unresponsive_peer() -> anyhow::Result<()> {
    setup_test_logging();
    let a = start_local_node(vec![]).await?;
    let b = start_local_node(vec![a.advertised_addr()]).await?;
    let mute_id = spawn_mute_peer(a.advertised_addr()).await?;

    wait_until(
        || {
            if peer_count(&a) == 2 { Ok(()) } else { bail!("a sees {} peers", peer_count(&a)) }
        },
        Duration::from_secs(10),
    )
    .await?;

    b.metrics().counter("demo_total", &[]).add(3);
    let started = std::time::Instant::now();
    let result = a.cluster_snapshot().await?;
    assert!(started.elapsed() < Duration::from_millis(2500));
    assert!(result.partial);
    assert_eq!(result.missing, vec![mute_id]);
    assert_eq!(result.snapshot.counter_value("demo_total", &[]), 3);
    Ok(())
}

#[tokio::test]
async fn test_datapool_exhaustion_counts_lost_starts() -> anyhow::Result<()> {
    setup_test_logging();
    let node = start_local_node(vec![]).await?;
    let id = generate_scenario_id();
    let spec = ScenarioSpec {
        scenario_id: id,
        start_delay_s: 0.,
        journeys: vec![JourneySpec {
            name: "rows".into(),
            volume: VolumeModel {
                target_rps: 10.,
                duration_s: 2.,
                ramp_s: 0.,
            },
            datapool: Some(DatapoolSpec::InMemoryOnce {
                rows: vec!["r1".into(), "r2".into(), "r3".into()],
            }),
            steps: vec![],
        }],
    };
    node.start_scenario(spec)?;
    wait_until(
        || {
            if node.scenario_count() == 0 { Ok(()) } else { bail!("still running") }
        },
        Duration::from_secs(30),
    )
    .await?;

    let snapshot = node.local_snapshot()?;
    let executed = snapshot.counter_value("journey_executions_total", &[("name", "rows")]);
    let exhausted = snapshot.counter_value("datapool_exhausted_total", &[("journey", "rows")]);
    info!(executed, exhausted, "scenario done");
    assert_eq!(executed, 3);
    // All remaining scheduled starts hit the empty pool. ~20 starts are
    // scheduled over 2s at 10 rps; allow timing slack on the last ticks.
    assert!((14..=18).contains(&exhausted), "exhausted = {exhausted}");
    Ok(())
}

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::bail;

use crate::{Node, NodeOptions};

pub fn setup_test_logging() {
    if std::env::var("RUST_LOG").is_err() {
        unsafe { std::env::set_var("RUST_LOG", "debug,libironswarm=trace") };
    }
    let _ = tracing_subscriber::fmt::try_init();
}

/// A node on an ephemeral loopback port.
pub async fn start_local_node(bootstrap: Vec<SocketAddr>) -> anyhow::Result<Arc<Node>> {
    let opts = NodeOptions {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        bootstrap,
        ..Default::default()
    };
    Node::new(opts).await
}

pub async fn wait_until(
    mut cond: impl FnMut() -> anyhow::Result<()>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let mut interval = tokio::time::interval(Duration::from_millis(10));
    let mut last_err: Option<anyhow::Error> = None;
    let res = tokio::time::timeout(timeout, async {
        loop {
            interval.tick().await;
            match cond() {
                Ok(()) => return Ok::<_, anyhow::Error>(()),
                Err(e) => last_err = Some(e),
            }
        }
    })
    .await;
    if res.is_err() {
        bail!("wait_until timeout: last result = {last_err:?}")
    }
    Ok(())
}

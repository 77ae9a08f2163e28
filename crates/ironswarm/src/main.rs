use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, bail};
use clap::Parser;
use libironswarm::{
    Api, BindMode, Node, NodeOptions, ScenarioSpec, generate_scenario_id, http_api,
    logging::{InitLoggingOptions, init_logging},
};
use tracing::{error, info, warn};

const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;
const EXIT_SIGNAL: i32 = 130;

#[derive(Parser)]
#[command(version, author, about)]
struct Opts {
    /// Bootstrap address(es) to join the cluster through. Comma separated
    /// host:port entries, may repeat. A tcp:// prefix is accepted.
    #[arg(short = 'b', long = "bootstrap", env = "IRONSWARM_BOOTSTRAP")]
    bootstrap: Vec<String>,

    /// Bind mode for the peer listener: "local", "public" or an explicit
    /// IP.
    #[arg(
        short = 'H',
        long = "host",
        default_value = "local",
        env = "IRONSWARM_HOST"
    )]
    host: String,

    /// The port to listen on for peer connections.
    #[arg(
        short = 'p',
        long = "port",
        default_value = "42042",
        env = "IRONSWARM_PORT"
    )]
    port: u16,

    /// Path to a scenario spec file (JSON) to start once the node is up.
    #[arg(short = 'j', long = "scenario", env = "IRONSWARM_SCENARIO")]
    scenario: Option<PathBuf>,

    /// Print aggregate stats once per second.
    #[arg(short = 's', long = "stats", env = "IRONSWARM_STATS")]
    stats: bool,

    /// The log filename to also write to in addition to the console.
    #[arg(long = "log-file", env = "IRONSWARM_LOG_FILE")]
    log_file: Option<String>,

    /// The value for RUST_LOG in the log file.
    #[arg(
        long = "log-file-rust-log",
        default_value = "libironswarm=debug,info",
        env = "IRONSWARM_LOG_FILE_RUST_LOG"
    )]
    log_file_rust_log: String,

    /// On graceful shutdown, write the local metrics snapshot (JSON) to
    /// this path.
    #[arg(long = "metrics-snapshot", env = "IRONSWARM_METRICS_SNAPSHOT")]
    metrics_snapshot: Option<PathBuf>,

    /// Enable the dashboard HTTP listener on this port.
    #[arg(long = "web-port", env = "IRONSWARM_WEB_PORT")]
    web_port: Option<u16>,

    /// How many threads to spawn for the executor.
    #[arg(short = 't', long, env = "IRONSWARM_RUNTIME_WORKER_THREADS")]
    worker_threads: Option<usize>,
}

fn main() {
    let opts = Opts::parse();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = opts.worker_threads {
        builder.worker_threads(threads);
    }
    let rt = match builder.build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error building tokio runtime: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let code = match rt.block_on(async_main(opts)) {
        Ok(code) => code,
        Err(e) => {
            error!("fatal: {e:#}");
            classify_exit(&e)
        }
    };
    // Make sure session writers and the log file flush before we go.
    rt.shutdown_timeout(Duration::from_secs(1));
    std::process::exit(code);
}

fn classify_exit(e: &anyhow::Error) -> i32 {
    for cause in e.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::AddrInUse {
                return EXIT_BIND;
            }
        }
    }
    EXIT_CONFIG
}

async fn async_main(opts: Opts) -> anyhow::Result<i32> {
    let _logging = init_logging(InitLoggingOptions {
        default_rust_log_value: Some("info"),
        log_file: opts.log_file.as_deref(),
        log_file_rust_log: Some(&opts.log_file_rust_log),
    })?;

    let bind_mode: BindMode = opts.host.parse()?;
    let (listen_addr, advertise_addr) = bind_mode.resolve(opts.port)?;
    let bootstrap = resolve_bootstrap(&opts.bootstrap).await?;

    let node = Node::new(NodeOptions {
        listen_addr,
        advertise_addr: Some(advertise_addr),
        bootstrap,
        ..Default::default()
    })
    .await?;

    if let Some(web_port) = opts.web_port {
        let web_addr = SocketAddr::new(listen_addr.ip(), web_port);
        let listener = tokio::net::TcpListener::bind(web_addr)
            .await
            .with_context(|| format!("error binding HTTP API to {web_addr}"))?;
        let api = Api::new(node.clone());
        tokio::spawn(async move {
            if let Err(e) = http_api::serve(api, listener).await {
                error!("HTTP API died: {e:#}");
            }
        });
    }

    if let Some(path) = &opts.scenario {
        let spec = load_scenario_file(path)?;
        info!(scenario = ?spec.scenario_id, journeys = spec.journeys.len(), "starting scenario");
        node.start_scenario(spec)?;
    }

    if opts.stats {
        let node = node.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let cluster = node.cluster_view();
                info!(
                    peers = cluster.peers.len(),
                    scenarios = node.scenario_count(),
                    journeys_per_s = format!("{:.1}", node.journeys_per_second()),
                    "stats"
                );
            }
        });
    }

    wait_for_shutdown_signal().await;
    node.shutdown().await;

    if let Some(path) = &opts.metrics_snapshot {
        let snapshot = node.local_snapshot()?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("error creating snapshot file {path:?}"))?;
        serde_json::to_writer_pretty(file, &snapshot).context("error writing snapshot")?;
        info!(?path, "wrote metrics snapshot");
    }

    Ok(EXIT_SIGNAL)
}

async fn resolve_bootstrap(args: &[String]) -> anyhow::Result<Vec<SocketAddr>> {
    let mut out = Vec::new();
    for arg in args {
        for part in arg.split(',') {
            let part = part.trim().trim_start_matches("tcp://");
            if part.is_empty() {
                continue;
            }
            let mut resolved = tokio::net::lookup_host(part)
                .await
                .with_context(|| format!("cannot resolve bootstrap address {part:?}"))?;
            match resolved.next() {
                Some(addr) => out.push(addr),
                None => bail!("bootstrap address {part:?} resolved to nothing"),
            }
        }
    }
    Ok(out)
}

fn load_scenario_file(path: &PathBuf) -> anyhow::Result<ScenarioSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("error reading scenario file {path:?}"))?;
    // The id is optional in the file; a missing one gets generated so each
    // invocation is a fresh scenario.
    let mut value: serde_json::Value =
        serde_json::from_str(&content).context("scenario file is not valid JSON")?;
    if let Some(obj) = value.as_object_mut() {
        if !obj.contains_key("scenario_id") {
            obj.insert(
                "scenario_id".to_owned(),
                serde_json::Value::String(generate_scenario_id().as_string()),
            );
        }
    }
    let spec: ScenarioSpec =
        serde_json::from_value(value).context("scenario file does not match the expected schema")?;
    Ok(spec)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e:#}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = term.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}

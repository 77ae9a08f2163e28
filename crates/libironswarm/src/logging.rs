//! Logging setup for the ironswarm binary: console plus optional file
//! output, a filter that can be adjusted while the node runs, and a line
//! broadcast the dashboard tails.

use std::io::LineWriter;

use anyhow::Context;
use bytes::Bytes;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter},
    prelude::*,
    reload,
};

/// Formatted log lines fanned out to dashboard subscribers. Lines are only
/// copied while someone is listening.
pub type LineBroadcast = tokio::sync::broadcast::Sender<Bytes>;

#[derive(Clone)]
struct BroadcastWriter {
    tx: LineBroadcast,
}

impl std::io::Write for BroadcastWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.tx.receiver_count() > 0 {
            let _ = self.tx.send(Bytes::copy_from_slice(buf));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for BroadcastWriter {
    type Writer = LineWriter<BroadcastWriter>;

    fn make_writer(&'a self) -> Self::Writer {
        // LineWriter keeps partial writes from splitting a log line across
        // two broadcast messages.
        LineWriter::new(self.clone())
    }
}

/// Swaps the console log filter at runtime, e.g. from the dashboard.
pub struct LogFilterReload {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogFilterReload {
    pub fn set(&self, directives: &str) -> anyhow::Result<()> {
        let filter = EnvFilter::builder()
            .parse(directives)
            .with_context(|| format!("invalid log directives {directives:?}"))?;
        self.handle
            .reload(filter)
            .context("error swapping log filter")
    }
}

pub struct InitLoggingOptions<'a> {
    pub default_rust_log_value: Option<&'a str>,
    pub log_file: Option<&'a str>,
    pub log_file_rust_log: Option<&'a str>,
}

pub struct InitLoggingResult {
    pub filter_reload: LogFilterReload,
    pub line_broadcast: LineBroadcast,
}

pub fn init_logging(opts: InitLoggingOptions) -> anyhow::Result<InitLoggingResult> {
    let console_filter = EnvFilter::builder()
        .with_default_directive(
            opts.default_rust_log_value
                .unwrap_or("info")
                .parse()
                .context("can't parse provided rust_log value")?,
        )
        .from_env()
        .context("invalid RUST_LOG value")?;
    let (console_filter, reload_handle) = reload::Layer::new(console_filter);

    // Dashboard log tail: json-formatted lines into the broadcast channel.
    let (line_tx, _) = tokio::sync::broadcast::channel(100);
    let broadcast_layer = fmt::layer()
        .with_ansi(false)
        .fmt_fields(fmt::format::JsonFields::new())
        .event_format(fmt::format().with_ansi(false).json())
        .with_writer(BroadcastWriter {
            tx: line_tx.clone(),
        })
        .with_filter(
            EnvFilter::builder()
                .parse("info,libironswarm=debug")
                .unwrap(),
        );

    let file_layer = match opts.log_file {
        None => None,
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("error opening log file {path:?}"))?;
            let filter = EnvFilter::builder()
                .parse(opts.log_file_rust_log.unwrap_or("info,libironswarm=debug"))
                .context("can't parse log-file-rust-log")?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(LineWriter::new(file)))
                    .with_filter(filter),
            )
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(console_filter))
        .with(broadcast_layer)
        .with(file_layer)
        .try_init()
        .context("can't init logging")?;

    Ok(InitLoggingResult {
        filter_reload: LogFilterReload {
            handle: reload_handle,
        },
        line_broadcast: line_tx,
    })
}

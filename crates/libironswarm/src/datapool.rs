use std::collections::VecDeque;

use anyhow::Context;
use ironswarm_core::spawn_utils::spawn_with_cancel;
use ironswarm_proto::DatapoolSpec;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::debug_span;

enum Inner {
    Memory {
        rows: Mutex<VecDeque<String>>,
        recycle: bool,
    },
    // A single reader task owns the file handle and publishes rows into a
    // bounded channel; backpressure propagates to the reader.
    File {
        rx: tokio::sync::Mutex<mpsc::Receiver<String>>,
    },
}

/// Thread-safe row vendor shared by all concurrent runners of one journey
/// on one node. Handouts are atomic: each row reaches at most one runner.
pub struct Datapool {
    inner: Inner,
    closed: CancellationToken,
}

impl Datapool {
    /// Builds a pool from its descriptor. File variants spawn the reader
    /// task immediately.
    pub fn build(spec: &DatapoolSpec, channel_capacity: usize) -> Datapool {
        let closed = CancellationToken::new();
        let inner = match spec {
            DatapoolSpec::InMemoryOnce { rows } => Inner::Memory {
                rows: Mutex::new(rows.iter().cloned().collect()),
                recycle: false,
            },
            DatapoolSpec::InMemoryRecycle { rows } => Inner::Memory {
                rows: Mutex::new(rows.iter().cloned().collect()),
                recycle: true,
            },
            DatapoolSpec::FileOnce { path } | DatapoolSpec::FileRecycle { path } => {
                let recycle = matches!(spec, DatapoolSpec::FileRecycle { .. });
                let (tx, rx) = mpsc::channel(channel_capacity);
                let path = path.clone();
                spawn_with_cancel(
                    debug_span!("datapool_reader", path = %path),
                    closed.clone(),
                    run_file_reader(path, recycle, tx),
                );
                Inner::File {
                    rx: tokio::sync::Mutex::new(rx),
                }
            }
        };
        Datapool { inner, closed }
    }

    /// The next row, or None when the pool is exhausted or closed.
    pub async fn next_row(&self) -> Option<String> {
        if self.closed.is_cancelled() {
            return None;
        }
        match &self.inner {
            Inner::Memory { rows, recycle } => {
                let mut g = rows.lock();
                let row = g.pop_front()?;
                if *recycle {
                    g.push_back(row.clone());
                }
                Some(row)
            }
            Inner::File { rx } => {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = self.closed.cancelled() => None,
                    row = rx.recv() => row,
                }
            }
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}

async fn run_file_reader(
    path: String,
    recycle: bool,
    tx: mpsc::Sender<String>,
) -> anyhow::Result<()> {
    loop {
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("error opening datapool file {path:?}"))?;
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .with_context(|| format!("error reading datapool file {path:?}"))?
        {
            if line.is_empty() {
                continue;
            }
            if tx.send(line).await.is_err() {
                // All consumers are gone.
                return Ok(());
            }
        }
        if !recycle {
            // Dropping the sender signals exhaustion to consumers.
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn rows(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_owned()).collect()
    }

    #[tokio::test]
    async fn test_in_memory_once_exhausts() {
        let p = Datapool::build(
            &DatapoolSpec::InMemoryOnce {
                rows: rows(&["a", "b"]),
            },
            16,
        );
        assert_eq!(p.next_row().await.as_deref(), Some("a"));
        assert_eq!(p.next_row().await.as_deref(), Some("b"));
        assert_eq!(p.next_row().await, None);
        assert_eq!(p.next_row().await, None);
    }

    #[tokio::test]
    async fn test_in_memory_recycle_loops_fifo() {
        let p = Datapool::build(
            &DatapoolSpec::InMemoryRecycle {
                rows: rows(&["a", "b"]),
            },
            16,
        );
        for expected in ["a", "b", "a", "b", "a"] {
            assert_eq!(p.next_row().await.as_deref(), Some(expected));
        }
        p.close();
        assert_eq!(p.next_row().await, None);
    }

    #[tokio::test]
    async fn test_file_once_exhausts() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "one\ntwo\n\nthree").unwrap();
        f.flush().unwrap();
        let p = Datapool::build(
            &DatapoolSpec::FileOnce {
                path: f.path().to_str().unwrap().to_owned(),
            },
            16,
        );
        assert_eq!(p.next_row().await.as_deref(), Some("one"));
        assert_eq!(p.next_row().await.as_deref(), Some("two"));
        assert_eq!(p.next_row().await.as_deref(), Some("three"));
        assert_eq!(p.next_row().await, None);
    }

    #[tokio::test]
    async fn test_file_recycle_rewinds() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "x\ny").unwrap();
        f.flush().unwrap();
        let p = Datapool::build(
            &DatapoolSpec::FileRecycle {
                path: f.path().to_str().unwrap().to_owned(),
            },
            4,
        );
        for expected in ["x", "y", "x", "y", "x"] {
            assert_eq!(p.next_row().await.as_deref(), Some(expected));
        }
        p.close();
        assert_eq!(p.next_row().await, None);
    }

    #[tokio::test]
    async fn test_concurrent_handout_is_atomic() {
        let p = std::sync::Arc::new(Datapool::build(
            &DatapoolSpec::InMemoryOnce {
                rows: (0..100).map(|i| i.to_string()).collect(),
            },
            16,
        ));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let p = p.clone();
            tasks.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(row) = p.next_row().await {
                    got.push(row);
                }
                got
            }));
        }
        let mut all = Vec::new();
        for t in tasks {
            all.extend(t.await.unwrap());
        }
        all.sort_by_key(|s| s.parse::<u32>().unwrap());
        let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        assert_eq!(all, expected);
    }
}

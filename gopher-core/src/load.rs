//! Load generation: many workers driving one shared [`Client`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::client::Client;
use crate::error::GopherError;
use crate::response::Response;
use crate::url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTest {
    pub requests: u64,
    pub workers: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Sum of every request's duration.
    pub elapsed_total: Duration,
    /// Wall-clock time for the whole run.
    pub wall: Duration,
}

impl LoadReport {
    pub fn mean(&self) -> Duration {
        if self.attempts == 0 {
            Duration::ZERO
        } else {
            let nanos = self.elapsed_total.as_nanos() / u128::from(self.attempts);
            Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64)
        }
    }
}

#[derive(Default)]
struct Tally {
    remaining: AtomicU64,
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    elapsed_nanos: AtomicU64,
}

impl Tally {
    /// Claim one request. Never drives the counter below zero.
    fn claim(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl LoadTest {
    pub fn new(requests: u64, workers: usize) -> Self {
        LoadTest { requests, workers }
    }

    /// Fetch `url` `requests` times, spread over `workers` tasks, reading
    /// each response to the end.
    pub async fn run(&self, client: &Client, url: &Url) -> LoadReport {
        let tally = Arc::new(Tally {
            remaining: AtomicU64::new(self.requests),
            ..Tally::default()
        });
        let start = Instant::now();

        let mut workers = JoinSet::new();
        for _ in 0..self.workers.max(1) {
            let tally = Arc::clone(&tally);
            let client = client.clone();
            let url = url.clone();
            workers.spawn(async move {
                while tally.claim() {
                    let began = Instant::now();
                    let res = fetch_all(&client, &url).await;
                    let nanos = began.elapsed().as_nanos().min(u64::MAX as u128) as u64;
                    tally.elapsed_nanos.fetch_add(nanos, Ordering::Relaxed);
                    tally.attempts.fetch_add(1, Ordering::Relaxed);
                    match res {
                        Ok(bytes) => {
                            tally.successes.fetch_add(1, Ordering::Relaxed);
                            debug!(bytes, "load request done");
                        }
                        Err(e) => {
                            tally.failures.fetch_add(1, Ordering::Relaxed);
                            debug!(error = %e, "load request failed");
                        }
                    }
                }
            });
        }
        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                warn!(error = %e, "load worker stopped");
            }
        }

        LoadReport {
            attempts: tally.attempts.load(Ordering::Acquire),
            successes: tally.successes.load(Ordering::Acquire),
            failures: tally.failures.load(Ordering::Acquire),
            elapsed_total: Duration::from_nanos(tally.elapsed_nanos.load(Ordering::Acquire)),
            wall: start.elapsed(),
        }
    }
}

async fn fetch_all(client: &Client, url: &Url) -> Result<u64, GopherError> {
    let mut resp = client.fetch_url(url).await?;
    let read = match &mut resp {
        Response::Dir(dir) => {
            let mut n = 0;
            while dir.next().await.is_some() {
                n += 1;
            }
            Ok(n)
        }
        other => match other.reader() {
            Some(r) => tokio::io::copy(r, &mut tokio::io::sink())
                .await
                .map_err(GopherError::read),
            None => Ok(0),
        },
    };
    let closed = resp.close().await;
    let n = read?;
    closed?;
    Ok(n)
}

//! Concurrent HTTP health prober.
//!
//! Polls every endpoint on a fixed interval, counting consecutive 2xx
//! responses per endpoint. The poll succeeds once every endpoint has reached
//! the required consecutive-success threshold; a single failed request only
//! resets that endpoint's counter.

use crate::errors::HealthError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Probe outcome for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    /// Reached the consecutive-success threshold.
    Healthy,
    /// Responding but below threshold (non-2xx or not yet consecutive).
    Unhealthy,
    /// Connection-level failure on the last attempt.
    Error,
}

/// Per-endpoint status record returned from a poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub status: ProbeStatus,
    pub response_time_ms: u64,
    pub consecutive_ok: u32,
}

/// Poll all endpoints until each has `required_consecutive` consecutive 2xx
/// responses, or the deadline expires.
///
/// Requests within one tick run concurrently. An individual request failure
/// (connection refused, per-request timeout, non-2xx) resets that endpoint's
/// counter to zero but does not fail the poll; only the overall deadline
/// does.
pub async fn poll_until_healthy(
    urls: &BTreeMap<String, String>,
    timeout: Duration,
    interval: Duration,
    required_consecutive: u32,
) -> Result<BTreeMap<String, EndpointStatus>, HealthError> {
    let mut statuses: BTreeMap<String, EndpointStatus> = urls
        .keys()
        .map(|name| {
            (
                name.clone(),
                EndpointStatus {
                    status: ProbeStatus::Unhealthy,
                    response_time_ms: 0,
                    consecutive_ok: 0,
                },
            )
        })
        .collect();

    if urls.is_empty() {
        return Ok(statuses);
    }

    let client = reqwest::Client::builder()
        .timeout(per_request_timeout(interval))
        .build()
        .unwrap_or_default();

    let deadline = Instant::now() + timeout;

    loop {
        let probes = urls.iter().map(|(name, url)| {
            let client = client.clone();
            async move { (name.clone(), probe_once(&client, url).await) }
        });
        let results = futures::future::join_all(probes).await;

        for (name, outcome) in results {
            let entry = statuses.get_mut(&name).expect("probed endpoint tracked");
            match outcome {
                ProbeOutcome::Ok { elapsed_ms } => {
                    entry.consecutive_ok += 1;
                    entry.response_time_ms = elapsed_ms;
                    entry.status = if entry.consecutive_ok >= required_consecutive {
                        ProbeStatus::Healthy
                    } else {
                        ProbeStatus::Unhealthy
                    };
                }
                ProbeOutcome::BadStatus { elapsed_ms } => {
                    entry.consecutive_ok = 0;
                    entry.response_time_ms = elapsed_ms;
                    entry.status = ProbeStatus::Unhealthy;
                }
                ProbeOutcome::Unreachable => {
                    entry.consecutive_ok = 0;
                    entry.status = ProbeStatus::Error;
                }
            }
        }

        if statuses
            .values()
            .all(|s| s.consecutive_ok >= required_consecutive)
        {
            return Ok(statuses);
        }

        if Instant::now() + interval > deadline {
            let laggards = statuses
                .iter()
                .filter(|(_, s)| s.consecutive_ok < required_consecutive)
                .map(|(name, _)| name.clone())
                .collect();
            return Err(HealthError::DeadlineExpired { laggards });
        }

        tokio::time::sleep(interval).await;
    }
}

/// Per-request timeout: bounded by the poll interval so a hung endpoint
/// cannot stall the tick, with a floor so very short intervals still allow a
/// round trip.
fn per_request_timeout(interval: Duration) -> Duration {
    interval.max(Duration::from_millis(500)).min(Duration::from_secs(5))
}

enum ProbeOutcome {
    Ok { elapsed_ms: u64 },
    BadStatus { elapsed_ms: u64 },
    Unreachable,
}

async fn probe_once(client: &reqwest::Client, url: &str) -> ProbeOutcome {
    let start = Instant::now();
    match client.get(url).send().await {
        Ok(response) => {
            let elapsed_ms = start.elapsed().as_millis() as u64;
            if response.status().is_success() {
                ProbeOutcome::Ok { elapsed_ms }
            } else {
                ProbeOutcome::BadStatus { elapsed_ms }
            }
        }
        Err(_) => ProbeOutcome::Unreachable,
    }
}

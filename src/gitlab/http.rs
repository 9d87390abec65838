//! Retrying HTTP transport over the platform's REST API.
//!
//! One [`Transport`] is shared by every project loop. It owns:
//! - bearer authentication,
//! - retry with exponential backoff and jitter for transient failures,
//!   bounded by a wall-clock budget per logical call,
//! - `Retry-After` handling for rate limits (observed as latency, never as
//!   an error, until the budget runs out),
//! - pagination via the `x-next-page` response header,
//! - a cap on concurrently in-flight requests across all threads.
//!
//! Authorization failures are never retried. Non-success statuses outside
//! the retry classes surface as [`ApiError::Status`] so the typed client
//! can classify them (notably merge refusals).

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::{debug, warn};

use super::error::ApiError;

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(10);
const PER_PAGE: usize = 100;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Base URL of the platform, e.g. `https://gitlab.example.com`.
    pub base_url: String,
    /// Bearer token for the API.
    pub token: String,
    /// Wall-clock budget per logical call, retries included.
    pub call_budget: Duration,
    /// Maximum requests in flight across all threads.
    pub max_in_flight: usize,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            call_budget: Duration::from_secs(60),
            max_in_flight: 8,
        }
    }
}

/// Counting gate bounding in-flight requests.
struct RequestGate {
    limit: usize,
    in_flight: Mutex<usize>,
    freed: Condvar,
}

impl RequestGate {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            in_flight: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut count = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        while *count >= self.limit {
            count = self.freed.wait(count).unwrap_or_else(|e| e.into_inner());
        }
        *count += 1;
    }

    fn release(&self) {
        let mut count = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        *count = count.saturating_sub(1);
        self.freed.notify_one();
    }
}

pub struct Transport {
    agent: ureq::Agent,
    config: TransportConfig,
    gate: RequestGate,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(30))
            .build();
        let gate = RequestGate::new(config.max_in_flight);
        Self {
            agent,
            config,
            gate,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// GET a single JSON document.
    pub fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, ApiError> {
        let response = self.call_with_retry("GET", path, query, None)?;
        read_json(path, response)
    }

    /// GET a paginated collection, following `x-next-page` to the end.
    pub fn get_paged(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<Value>, ApiError> {
        let per_page = PER_PAGE.to_string();
        let mut items = Vec::new();
        let mut page = 1usize;
        loop {
            let page_string = page.to_string();
            let mut page_query: Vec<(&str, &str)> = query.to_vec();
            page_query.push(("per_page", per_page.as_str()));
            page_query.push(("page", page_string.as_str()));

            let response = self.call_with_retry("GET", path, &page_query, None)?;
            let next_page = response
                .header("x-next-page")
                .and_then(|raw| raw.trim().parse::<usize>().ok());
            let body: Value = read_json(path, response)?;
            let Value::Array(chunk) = body else {
                return Err(ApiError::Malformed {
                    path: path.to_string(),
                    detail: "expected a JSON array".to_string(),
                });
            };
            items.extend(chunk);

            match next_page {
                Some(next) => page = next,
                None => return Ok(items),
            }
        }
    }

    pub fn post(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        let response = self.call_with_retry("POST", path, &[], Some(&body))?;
        read_json(path, response)
    }

    pub fn put(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        let response = self.call_with_retry("PUT", path, &[], Some(&body))?;
        read_json(path, response)
    }

    pub fn delete(&self, path: &str) -> Result<(), ApiError> {
        let response = self.call_with_retry("DELETE", path, &[], None)?;
        // Drain the body so the connection can be reused.
        let _ = response.into_string();
        Ok(())
    }

    /// Run one logical call, retrying transient failures until the budget
    /// is spent.
    fn call_with_retry(
        &self,
        method: &str,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<ureq::Response, ApiError> {
        let started = Instant::now();
        let mut backoff = BACKOFF_INITIAL;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(method, path, attempt, "platform request");

            self.gate.acquire();
            let outcome = self.send_once(method, path, query, body);
            self.gate.release();

            let retry_in = match outcome {
                Ok(response) => return Ok(response),
                Err(SendFailure::Fatal(error)) => return Err(error),
                Err(SendFailure::RateLimited { retry_after }) => {
                    // Rate limiting is latency, not an error, while the
                    // budget lasts.
                    retry_after.unwrap_or(backoff)
                }
                Err(SendFailure::Transient(detail)) => {
                    let next = with_jitter(backoff);
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    warn!(method, path, attempt, detail = %detail, "transient platform failure");
                    next
                }
            };

            let spent = started.elapsed();
            if spent + retry_in >= self.config.call_budget {
                return Err(ApiError::TransientUpstream(format!(
                    "{method} {path} still failing after {attempt} attempts over {}s",
                    spent.as_secs()
                )));
            }
            std::thread::sleep(retry_in);
        }
    }

    fn send_once(
        &self,
        method: &str,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<ureq::Response, SendFailure> {
        let url = format!("{}/api/v4{}", self.config.base_url, path);
        let mut request = self
            .agent
            .request(method, &url)
            .set("Authorization", &format!("Bearer {}", self.config.token));
        for (key, value) in query {
            request = request.query(key, value);
        }

        let result = match body {
            Some(value) => request.send_json(value.clone()),
            None => request.call(),
        };

        match result {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(status, response)) => {
                Err(classify_status(path, status, response))
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(SendFailure::Transient(transport.to_string()))
            }
        }
    }
}

enum SendFailure {
    /// Surface to the caller unchanged.
    Fatal(ApiError),
    /// Worth another attempt inside the budget.
    Transient(String),
    /// 429; the platform told us (or didn't) how long to wait.
    RateLimited { retry_after: Option<Duration> },
}

fn classify_status(path: &str, status: u16, response: ureq::Response) -> SendFailure {
    match status {
        401 | 403 => SendFailure::Fatal(ApiError::Unauthorized(path.to_string())),
        404 => SendFailure::Fatal(ApiError::NotFound(path.to_string())),
        429 => {
            let retry_after = response
                .header("Retry-After")
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            SendFailure::RateLimited { retry_after }
        }
        500..=599 => SendFailure::Transient(format!("status {status}")),
        _ => {
            let detail = response
                .into_string()
                .unwrap_or_default()
                .trim()
                .to_string();
            SendFailure::Fatal(ApiError::Status {
                path: path.to_string(),
                status,
                detail,
            })
        }
    }
}

fn read_json(path: &str, response: ureq::Response) -> Result<Value, ApiError> {
    response.into_json().map_err(|error| ApiError::Malformed {
        path: path.to_string(),
        detail: error.to_string(),
    })
}

/// Add up to 50% random slack so parallel loops don't retry in lockstep.
///
/// Seeded from the clock; cryptographic quality is irrelevant here.
fn with_jitter(base: Duration) -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let fraction = f64::from(nanos % 1_000) / 1_000.0;
    base + base.mul_f64(fraction * 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_half_of_base() {
        let base = Duration::from_millis(400);
        for _ in 0..64 {
            let jittered = with_jitter(base);
            assert!(jittered >= base);
            assert!(jittered <= base + base.mul_f64(0.5));
        }
    }

    #[test]
    fn gate_serializes_beyond_limit() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let gate = Arc::new(RequestGate::new(2));
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let peak = Arc::clone(&peak);
                let current = Arc::clone(&current);
                std::thread::spawn(move || {
                    gate.acquire();
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                    current.fetch_sub(1, Ordering::SeqCst);
                    gate.release();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn transport_config_defaults() {
        let config = TransportConfig::new("https://gitlab.example.com", "tok");
        assert_eq!(config.call_budget, Duration::from_secs(60));
        assert_eq!(config.max_in_flight, 8);
    }
}

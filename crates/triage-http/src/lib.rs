//! Retrying JSON-over-HTTP client shared by the sentiment scorer and the alert webhook.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "triage-http";

/// 408, 429 and every 5xx are worth another attempt.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

/// How many times a transient failure is repeated and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub initial_delay: Duration,
    pub delay_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_millis(250),
            delay_cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn single_attempt() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Doubles per retry, starting at `initial_delay`, never above `delay_cap`.
    pub fn delay_before(&self, retry: u32) -> Duration {
        self.initial_delay
            .checked_mul(2u32.saturating_pow(retry))
            .unwrap_or(self.delay_cap)
            .min(self.delay_cap)
    }
}

/// At most `burst` requests back to back, then one more per elapsed `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub period: Duration,
}

impl RateLimit {
    pub fn per_second(requests: u32) -> Self {
        let requests = requests.max(1);
        Self {
            burst: requests,
            period: Duration::from_secs(1) / requests,
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    limit: RateLimit,
    allowance: Mutex<Allowance>,
}

#[derive(Debug)]
struct Allowance {
    available: u32,
    refilled_at: Instant,
}

impl Allowance {
    fn refill(&mut self, limit: RateLimit, now: Instant) {
        if limit.period.is_zero() {
            self.available = limit.burst;
            self.refilled_at = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.refilled_at);
        let periods = elapsed.as_nanos() / limit.period.as_nanos();
        if periods == 0 {
            return;
        }
        let periods = u32::try_from(periods).unwrap_or(u32::MAX);
        self.available = self.available.saturating_add(periods);
        if self.available >= limit.burst {
            self.available = limit.burst;
            self.refilled_at = now;
        } else {
            self.refilled_at += limit.period * periods;
        }
    }
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        let limit = RateLimit {
            burst: limit.burst.max(1),
            ..limit
        };
        Self {
            limit,
            allowance: Mutex::new(Allowance {
                available: limit.burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Waits until a request may go out.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut allowance = self.allowance.lock().await;
                allowance.refill(self.limit, Instant::now());
                if allowance.available > 0 {
                    allowance.available -= 1;
                    return;
                }
                self.limit
                    .period
                    .saturating_sub(allowance.refilled_at.elapsed())
                    .max(Duration::from_millis(1))
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            max_concurrency: 4,
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl PostedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpError {
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::HttpStatus { status, .. } => Some(*status),
            HttpError::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::HttpStatus { status, .. } => is_transient_status(*status),
            HttpError::Request(err) => err.is_timeout() || err.is_connect(),
        }
    }
}

/// JSON POST client with a concurrency cap, optional rate limiting and retry with backoff.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    rate_limiter: Option<RateLimiter>,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            rate_limiter: config.rate_limit.map(RateLimiter::new),
            retry: config.retry,
        })
    }

    /// POSTs `body` as JSON, retrying transient failures. Any 2xx is a success.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        url: &str,
        body: &B,
        bearer_token: Option<&str>,
    ) -> Result<PostedResponse, HttpError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire().await;
        }

        let span = info_span!("http_post", endpoint, url);
        self.post_with_retries(url, body, bearer_token)
            .instrument(span)
            .await
    }

    async fn post_with_retries<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        bearer_token: Option<&str>,
    ) -> Result<PostedResponse, HttpError> {
        let mut retry = 0u32;
        loop {
            let mut request = self.client.post(url).json(body);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }

            let error = match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(PostedResponse { status, body });
                }
                Ok(resp) => HttpError::HttpStatus {
                    status: resp.status().as_u16(),
                    url: resp.url().to_string(),
                },
                Err(err) => HttpError::Request(err),
            };

            if retry >= self.retry.retries || !error.is_transient() {
                return Err(error);
            }
            let delay = self.retry.delay_before(retry);
            debug!(error = %error, retry, ?delay, "transient failure, retrying");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_client(retries: u32) -> HttpClient {
        HttpClient::new(HttpClientConfig {
            retry: RetryPolicy {
                retries,
                initial_delay: Duration::from_millis(1),
                delay_cap: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .expect("client")
    }

    #[test]
    fn retry_delays_double_up_to_the_cap() {
        let policy = RetryPolicy {
            retries: 5,
            initial_delay: Duration::from_millis(100),
            delay_cap: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_before(0), Duration::from_millis(100));
        assert_eq!(policy.delay_before(1), Duration::from_millis(200));
        assert_eq!(policy.delay_before(2), Duration::from_millis(350));
        assert_eq!(policy.delay_before(40), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_timeouts_and_throttling_are_transient() {
        assert!(is_transient_status(502));
        assert!(is_transient_status(429));
        assert!(is_transient_status(408));
        assert!(!is_transient_status(404));
        assert!(!is_transient_status(400));
    }

    #[tokio::test]
    async fn post_json_retries_transient_status_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(json!({"text": "hello"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client(2);
        let url = format!("{}/hook", server.uri());
        let resp = client
            .post_json("test", &url, &json!({"text": "hello"}), None)
            .await
            .expect("post succeeds");
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, b"ok".to_vec());
    }

    #[tokio::test]
    async fn post_json_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client(3);
        let err = client
            .post_json("test", &server.uri(), &json!({}), None)
            .await
            .expect_err("400 is fatal");
        assert_eq!(err.status(), Some(400));
    }

    #[tokio::test]
    async fn bearer_token_is_sent_when_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"label": "POSITIVE"}])))
            .expect(1)
            .mount(&server)
            .await;

        let client = fast_client(0);
        let resp = client
            .post_json("test", &server.uri(), &json!({"inputs": "x"}), Some("secret"))
            .await
            .expect("authorized");
        let value: serde_json::Value = resp.json().expect("json body");
        assert_eq!(value[0]["label"], "POSITIVE");
    }

    #[test]
    fn per_second_limits_spread_requests_evenly() {
        assert_eq!(
            RateLimit::per_second(4),
            RateLimit {
                burst: 4,
                period: Duration::from_millis(250)
            }
        );
        assert_eq!(RateLimit::per_second(0).burst, 1);
    }

    #[tokio::test]
    async fn rate_limiter_allows_a_burst_then_waits_a_period() {
        let started = Instant::now();
        let limiter = RateLimiter::new(RateLimit {
            burst: 2,
            period: Duration::from_millis(50),
        });
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(50));
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn rate_limited_client_spaces_out_posts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let started = Instant::now();
        let client = HttpClient::new(HttpClientConfig {
            rate_limit: Some(RateLimit {
                burst: 1,
                period: Duration::from_millis(40),
            }),
            ..Default::default()
        })
        .expect("client");
        for _ in 0..2 {
            client
                .post_json("test", &server.uri(), &json!({}), None)
                .await
                .expect("post succeeds");
        }
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}

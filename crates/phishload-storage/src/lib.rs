//! Feed fetching over HTTP and the keyed record store used by the loader.

use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::TryStreamExt;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{info, info_span, warn, Instrument};

mod store;

pub use store::{MemoryRecordStore, PgRecordStore, RecordStore, StoreError};

pub const CRATE_NAME: &str = "phishload-storage";

/// Incrementally readable feed body.
pub type FeedBody = Pin<Box<dyn AsyncRead + Send>>;

/// Anything that can hand the loader a readable feed.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn open(&self) -> Result<FeedBody, FetchError>;
}

/// Linear backoff: the wait after failed attempt `n` is `n * step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: usize,
    pub step: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            step: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// `attempt` is 1-indexed.
    pub fn delay_after_attempt(&self, attempt: usize) -> Duration {
        let factor = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.step.saturating_mul(factor)
    }

    pub fn attempts(&self) -> usize {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to fetch feed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: usize,
        #[source]
        last: AttemptError,
    },
}

#[derive(Debug)]
pub struct HttpFeedFetcher {
    client: reqwest::Client,
    url: String,
    backoff: BackoffPolicy,
}

impl HttpFeedFetcher {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        // No overall request timeout: it would also cap reading a large body.
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            url: url.into(),
            backoff: config.backoff,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn attempt(&self) -> Result<reqwest::Response, AttemptError> {
        let resp = self.client.get(&self.url).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        Err(AttemptError::HttpStatus {
            status: status.as_u16(),
            url: resp.url().to_string(),
        })
    }

    /// GET the feed, retrying every failure until the policy runs out.
    pub async fn fetch_response(&self) -> Result<reqwest::Response, FetchError> {
        let span = info_span!("feed_fetch", url = %self.url);
        async {
            let attempts = self.backoff.attempts();
            let mut attempt = 1;
            loop {
                match self.attempt().await {
                    Ok(resp) => {
                        if attempt > 1 {
                            info!(attempt, "feed fetch succeeded after retry");
                        }
                        return Ok(resp);
                    }
                    Err(err) => {
                        warn!(attempt, max_attempts = attempts, error = %err, "feed fetch attempt failed");
                        if attempt >= attempts {
                            return Err(FetchError::Exhausted {
                                attempts,
                                last: err,
                            });
                        }
                        let delay = self.backoff.delay_after_attempt(attempt);
                        info!(delay_secs = delay.as_secs_f64(), "retrying feed fetch");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn response_body(resp: reqwest::Response) -> FeedBody {
    let stream = resp.bytes_stream().map_err(std::io::Error::other);
    Box::pin(StreamReader::new(stream))
}

#[async_trait]
impl FeedSource for HttpFeedFetcher {
    async fn open(&self) -> Result<FeedBody, FetchError> {
        let resp = self.fetch_response().await?;
        Ok(response_body(resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::AsyncReadExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config(max_attempts: usize) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("phishload-test".into()),
            backoff: BackoffPolicy {
                max_attempts,
                step: Duration::from_millis(1),
            },
        }
    }

    async fn read_all(mut body: FeedBody) -> String {
        let mut text = String::new();
        body.read_to_string(&mut text).await.expect("read body");
        text
    }

    /// Formatted log output shared with a test subscriber.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn backoff_is_linear_in_attempt_number() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(10));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(15));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = BackoffPolicy {
            max_attempts: 0,
            step: Duration::from_secs(1),
        };
        assert_eq!(policy.attempts(), 1);
    }

    #[tokio::test]
    async fn streams_body_on_first_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("phish_id,url\n1,http://a\n"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFeedFetcher::new(format!("{}/feed.csv", server.uri()), fast_config(3)).unwrap();
        let body = fetcher.open().await.expect("open feed");
        assert_eq!(read_all(body).await, "phish_id,url\n1,http://a\n");
    }

    #[tokio::test]
    async fn retries_until_third_attempt_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.csv"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("phish_id,url\n"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFeedFetcher::new(format!("{}/feed.csv", server.uri()), fast_config(3)).unwrap();
        let body = fetcher.open().await.expect("third attempt succeeds");
        assert_eq!(read_all(body).await, "phish_id,url\n");
    }

    #[tokio::test]
    async fn each_failed_attempt_is_logged_before_retrying() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.csv"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("phish_id,url\n"))
            .mount(&server)
            .await;

        let fetcher = HttpFeedFetcher::new(format!("{}/feed.csv", server.uri()), fast_config(3)).unwrap();
        fetcher.open().await.expect("third attempt succeeds");

        let text = logs.text();
        assert_eq!(text.matches("feed fetch attempt failed").count(), 2);
        assert_eq!(text.matches("retrying feed fetch").count(), 2);
        assert!(text.contains("attempt=1 max_attempts=3"));
        assert!(text.contains("attempt=2 max_attempts=3"));
        assert!(text.contains("http status 503"));
        assert!(text.contains("feed fetch succeeded after retry"));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.csv"))
            .respond_with(ResponseTemplate::new(404))
            .expect(3)
            .mount(&server)
            .await;

        let fetcher = HttpFeedFetcher::new(format!("{}/feed.csv", server.uri()), fast_config(3)).unwrap();
        let err = fetcher.fetch_response().await.expect_err("all attempts fail");
        match err {
            FetchError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(last, AttemptError::HttpStatus { status: 404, .. }));
            }
        }
    }

    #[tokio::test]
    async fn connection_errors_are_retried_then_reported() {
        // Nothing listens on the discard port.
        let fetcher = HttpFeedFetcher::new("http://127.0.0.1:9/feed.csv", fast_config(2)).unwrap();
        let err = fetcher.fetch_response().await.expect_err("connection refused");
        let FetchError::Exhausted { attempts, last } = err;
        assert_eq!(attempts, 2);
        assert!(matches!(last, AttemptError::Request(_)));
    }
}

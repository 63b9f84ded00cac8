//! The client side of the protocol: a remote-write client that classifies
//! receiver responses, and a small conforming sender built on it.

use std::time::Duration;

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ComplianceError;
use crate::exposition::{Exposition, ExpositionFormat};
use crate::message::WireMessage;
use crate::retry;
use crate::scenario::{LaunchContext, Launcher, RunningTarget};
use crate::transport::{self, EncodedRequest, ProtocolVersion, WrittenCounts};
use crate::util;
use crate::Result;

pub const DEFAULT_USER_AGENT: &str = concat!("remote-write-compliance/", env!("CARGO_PKG_VERSION"));

/// How a receiver answered one write.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriteOutcome {
    /// 2xx. `written` holds the counts the receiver reported, if any.
    Accepted {
        status: u16,
        written: Option<WrittenCounts>,
    },
    /// A non-2xx that still reports some items as written.
    PartialWrite { status: u16, written: WrittenCounts },
    Rejected {
        status: u16,
        retryable: bool,
        body: String,
    },
}

impl WriteOutcome {
    pub fn classify(status: u16, headers: &HeaderMap, body: &str) -> Self {
        let written = WrittenCounts::from_headers(headers);
        if (200..300).contains(&status) {
            return WriteOutcome::Accepted { status, written };
        }

        match written.filter(|w| !w.is_zero()) {
            Some(written) => WriteOutcome::PartialWrite { status, written },
            None => WriteOutcome::Rejected {
                status,
                retryable: retry::is_retryable(status),
                body: body.trim().to_string(),
            },
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            WriteOutcome::Accepted { status, .. }
            | WriteOutcome::PartialWrite { status, .. }
            | WriteOutcome::Rejected { status, .. } => *status,
        }
    }

    /// Only outright rejections are retried; a partial write already landed
    /// some of the batch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WriteOutcome::Rejected { retryable: true, .. })
    }
}

/// POSTs remote-write requests to one URL.
#[derive(Clone, Debug)]
pub struct RemoteWriteClient {
    http: reqwest::Client,
    url: String,
    user_agent: String,
}

impl RemoteWriteClient {
    pub fn new(url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Encode and send `message`.
    pub async fn write(&self, message: &WireMessage) -> Result<WriteOutcome> {
        let encoded = transport::encode(message, &self.user_agent)?;
        self.send(&encoded).await
    }

    /// Send an already encoded request. Retries reuse the same bytes.
    pub async fn send(&self, encoded: &EncodedRequest) -> Result<WriteOutcome> {
        let response = self
            .http
            .post(&self.url)
            .headers(encoded.headers.clone())
            .body(encoded.body.clone())
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await?;

        let outcome = WriteOutcome::classify(status, &headers, &body);
        debug!(url = %self.url, bytes = encoded.body.len(), ?outcome, "write sent");
        Ok(outcome)
    }
}

/// Exponential backoff between retries of one batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(with = "crate::config::millis")]
    pub initial: Duration,
    #[serde(with = "crate::config::millis")]
    pub max: Duration,
    pub max_retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
            max_retries: 5,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt`, counting from 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max)
    }
}

/// A conforming sender that runs in-process: scrape, convert, send, retry
/// with backoff on retryable statuses, repeat every `scrape_interval`.
#[derive(Clone, Debug)]
pub struct ReferenceSender {
    backoff: Backoff,
    scrape_interval: Duration,
    user_agent: String,
}

impl Default for ReferenceSender {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceSender {
    pub const NAME: &'static str = "reference";

    pub fn new() -> Self {
        Self {
            backoff: Backoff::default(),
            scrape_interval: Duration::from_millis(500),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_scrape_interval(mut self, interval: Duration) -> Self {
        self.scrape_interval = interval;
        self
    }
}

#[async_trait]
impl Launcher for ReferenceSender {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn launch(&self, ctx: &LaunchContext) -> Result<Box<dyn RunningTarget>> {
        let (stop, stopped) = watch::channel(false);
        let worker = Worker {
            http: reqwest::Client::new(),
            scrape_url: ctx.scrape_url.clone(),
            client: RemoteWriteClient::new(&ctx.remote_write_url).with_user_agent(&self.user_agent),
            version: ctx.protocol_version,
            backoff: self.backoff.clone(),
            scrape_interval: self.scrape_interval,
        };

        info!(remote_write_url = %ctx.remote_write_url, version = %ctx.protocol_version, "reference sender started");
        let task = tokio::spawn(worker.run(stopped));
        Ok(Box::new(ReferenceSenderHandle { stop, task }))
    }
}

struct Worker {
    http: reqwest::Client,
    scrape_url: String,
    client: RemoteWriteClient,
    version: ProtocolVersion,
    backoff: Backoff,
    scrape_interval: Duration,
}

impl Worker {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            if let Err(err) = self.cycle(&mut stop).await {
                warn!(%err, "reference sender cycle failed");
            }
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(self.scrape_interval) => {}
            }
        }
        debug!("reference sender stopped");
    }

    async fn scrape(&self) -> Result<(String, ExpositionFormat)> {
        let response = self.http.get(&self.scrape_url).send().await?.error_for_status()?;
        let format = match response.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
            Some(ct) if ct.starts_with("application/openmetrics-text") => ExpositionFormat::OpenMetrics,
            _ => ExpositionFormat::Text,
        };
        Ok((response.text().await?, format))
    }

    /// One scrape and the write of its batch, retries included.
    async fn cycle(&self, stop: &mut watch::Receiver<bool>) -> Result<()> {
        let (text, format) = self.scrape().await?;
        let message = Exposition::parse(&text, format)?.to_message(self.version, util::now_millis())?;
        if message.is_empty() {
            debug!("scrape returned no samples");
            return Ok(());
        }
        let encoded = transport::encode(&message, &self.client.user_agent)?;

        let mut attempt = 0;
        loop {
            let retry = match self.client.send(&encoded).await {
                Ok(outcome) => outcome.is_retryable(),
                Err(err) => {
                    warn!(%err, attempt, "write failed");
                    true
                }
            };
            if !retry {
                return Ok(());
            }
            if attempt >= self.backoff.max_retries {
                return Err(ComplianceError::Other(format!(
                    "batch dropped after {attempt} retries"
                )));
            }

            let delay = self.backoff.delay(attempt);
            debug!(attempt, ?delay, "retrying batch");
            tokio::select! {
                _ = stop.changed() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

struct ReferenceSenderHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[async_trait]
impl RunningTarget for ReferenceSenderHandle {
    async fn stop(self: Box<Self>, grace: Duration) -> Result<()> {
        let ReferenceSenderHandle { stop, mut task } = *self;
        stop.send_replace(true);

        match tokio::time::timeout(grace, &mut task).await {
            Ok(joined) => joined
                .map_err(|e| ComplianceError::Launch(format!("reference sender task failed: {e}"))),
            Err(_) => {
                warn!(?grace, "reference sender did not stop in time, aborting");
                task.abort();
                Ok(())
            }
        }
    }
}

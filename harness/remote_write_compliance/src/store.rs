use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, Method};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::error::ComplianceError;
use crate::message::WireMessage;
use crate::transport::WrittenCounts;

/// Default interval `wait_for_count` re-checks the store at.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One inbound HTTP call, exactly as it arrived, plus the result of decoding it.
#[derive(Clone, Debug)]
pub struct CapturedRequest {
    /// Arrival position, assigned by the store.
    pub index: usize,
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub decoded: std::result::Result<WireMessage, ComplianceError>,
    pub received_at: SystemTime,
    /// Monotonic arrival time, used to measure gaps between requests.
    pub received: Instant,
}

impl CapturedRequest {
    pub fn new(
        method: Method,
        path: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
        decoded: std::result::Result<WireMessage, ComplianceError>,
    ) -> Self {
        Self {
            index: 0,
            method,
            path: path.into(),
            headers,
            body,
            decoded,
            received_at: SystemTime::now(),
            received: Instant::now(),
        }
    }

    pub fn message(&self) -> Option<&WireMessage> {
        self.decoded.as_ref().ok()
    }

    pub fn decode_error(&self) -> Option<&ComplianceError> {
        self.decoded.as_ref().err()
    }

    /// A header's value, if present and valid ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Timestamp of the first sample, or native histogram, of the first
    /// series that carries one.
    pub fn first_timestamp(&self) -> Option<i64> {
        self.message()?.time_series_list().iter().find_map(|s| {
            s.samples()
                .first()
                .map(|x| x.timestamp)
                .or_else(|| s.histograms().first().map(|h| h.timestamp))
        })
    }

    /// Items decoded from the body, zero when it didn't decode.
    pub fn counts(&self) -> WrittenCounts {
        self.message().map(WireMessage::counts).unwrap_or_default()
    }

    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            index: self.index,
            method: self.method.to_string(),
            path: self.path.clone(),
            headers: self
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
                .collect(),
            body_len: self.body.len(),
            series: self.message().map(WireMessage::len),
            counts: self.counts(),
            error: self.decode_error().map(ToString::to_string),
        }
    }
}

/// A serializable digest of a `CapturedRequest`, for reports and debugging.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestSummary {
    pub index: usize,
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body_len: usize,
    pub series: Option<usize>,
    pub counts: WrittenCounts,
    pub error: Option<String>,
}

/// Append-only, thread-safe log of captured requests in arrival order.
///
/// Entries are shared behind `Arc` and never mutated after `append`, so a
/// snapshot stays valid while further requests arrive.
#[derive(Clone, Debug)]
pub struct RequestStore {
    entries: Arc<Mutex<Vec<Arc<CapturedRequest>>>>,
    poll_interval: Duration,
}

impl Default for RequestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestStore {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            poll_interval,
        }
    }

    /// Record a request, returning its arrival index.
    pub fn append(&self, mut request: CapturedRequest) -> usize {
        let mut entries = self.entries.lock();
        let index = entries.len();
        request.index = index;
        entries.push(Arc::new(request));
        drop(entries);

        debug!(index, "captured request");
        index
    }

    /// A copy of the log as it stands now.
    pub fn snapshot(&self) -> Vec<Arc<CapturedRequest>> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `n` requests are present or `timeout` elapses, then
    /// return whatever is there. Never fails: too few requests is for the
    /// caller to judge.
    pub async fn wait_for_count(&self, n: usize, timeout: Duration) -> Vec<Arc<CapturedRequest>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.len() >= n {
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
        self.snapshot()
    }

    /// Blocking form of `wait_for_count`, for callers outside a runtime.
    pub fn wait_for_count_blocking(&self, n: usize, timeout: Duration) -> Vec<Arc<CapturedRequest>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.len() >= n {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
        self.snapshot()
    }
}

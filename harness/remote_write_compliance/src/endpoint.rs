//! The scripted mock receiver.
//!
//! Every inbound call is decoded, recorded, and answered with the next entry
//! of a fixed response script. The script is consumed strictly in arrival
//! order; once its last entry has been served the endpoint closes and every
//! further call gets `ENDPOINT_FINISHED_STATUS`.
//!
//! The state machine is global, not per connection, so the endpoint supports
//! exactly one sender driving the conversation. Sharded senders hitting it as
//! independent streams will see their responses interleaved.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use http::header::HeaderName;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ComplianceError;
use crate::store::{CapturedRequest, RequestStore};
use crate::transport::{self, ProtocolVersion, WrittenCounts};
use crate::Result;

/// Status every call gets once the script is exhausted.
pub const ENDPOINT_FINISHED_STATUS: StatusCode = StatusCode::GONE;

const ENDPOINT_FINISHED_BODY: &str = "endpoint finished: response script exhausted";

/// One canned answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScriptedResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
    /// Explicit written counts. Unset or zero on a 2xx means "count what was
    /// decoded". On a non-2xx they are sent as given, which is how a partial
    /// write is scripted.
    #[serde(default)]
    pub written: Option<WrittenCounts>,
}

impl ScriptedResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
            written: None,
        }
    }

    /// `204 No Content`, the usual answer of a healthy receiver.
    pub fn success() -> Self {
        Self::status(204)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn with_written(mut self, written: WrittenCounts) -> Self {
        self.written = Some(written);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Ordered responses, one per inbound request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseScript(Vec<ScriptedResponse>);

impl ResponseScript {
    pub fn new(entries: Vec<ScriptedResponse>) -> Self {
        Self(entries)
    }

    /// A script of `n` successes.
    pub fn successes(n: usize) -> Self {
        Self(vec![ScriptedResponse::success(); n])
    }

    pub fn get(&self, i: usize) -> Option<&ScriptedResponse> {
        self.0.get(i)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> &[ScriptedResponse] {
        &self.0
    }
}

impl From<Vec<ScriptedResponse>> for ResponseScript {
    fn from(entries: Vec<ScriptedResponse>) -> Self {
        Self(entries)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointState {
    /// Waiting for the request that will get script entry `i`.
    AwaitingRequest(usize),
    /// The script has been served in full.
    Closed,
}

#[derive(Debug)]
struct Inner {
    script: ResponseScript,
    version: ProtocolVersion,
    store: RequestStore,
    state: Mutex<EndpointState>,
    done: watch::Sender<bool>,
    late: AtomicUsize,
}

/// The scripted mock receiver. Cheap to clone, clones share state.
#[derive(Clone, Debug)]
pub struct MockEndpoint {
    inner: Arc<Inner>,
}

impl MockEndpoint {
    pub fn new(script: ResponseScript, version: ProtocolVersion, store: RequestStore) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                script,
                version,
                store,
                state: Mutex::new(EndpointState::AwaitingRequest(0)),
                done,
                late: AtomicUsize::new(0),
            }),
        }
    }

    pub fn store(&self) -> &RequestStore {
        &self.inner.store
    }

    pub fn version(&self) -> ProtocolVersion {
        self.inner.version
    }

    pub fn state(&self) -> EndpointState {
        *self.inner.state.lock()
    }

    pub fn is_done(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Calls answered after the endpoint closed.
    pub fn late_requests(&self) -> usize {
        self.inner.late.load(Ordering::Relaxed)
    }

    /// Resolve once the last script entry has been served. Never resolves for
    /// an empty script.
    pub async fn done(&self) {
        let mut rx = self.inner.done.subscribe();
        // The sender lives as long as `self`, so this only returns on `true`.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// An axum router answering every method and path.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle)
            // Oversized bodies still reach the script and the store; the
            // transport decoder records them as errors.
            .layer(DefaultBodyLimit::disable())
            .with_state(self.clone())
    }

    /// Run one request through the state machine.
    pub fn respond(&self, method: Method, path: &str, headers: HeaderMap, body: Bytes) -> Response {
        if self.state() == EndpointState::Closed {
            return self.finished(&method, path, body.len());
        }

        // Decode before taking the lock; it's pure and the slow part.
        let decoded = transport::decode(&headers, &body, self.inner.version);
        if let Err(err) = &decoded {
            warn!(%method, path, %err, "request could not be decoded");
        }
        let counts = decoded.as_ref().map(|m| m.counts()).unwrap_or_default();
        let request = CapturedRequest::new(method.clone(), path, headers, body, decoded);

        let (index, entry) = {
            let mut state = self.inner.state.lock();
            let i = match *state {
                EndpointState::AwaitingRequest(i) => i,
                EndpointState::Closed => {
                    drop(state);
                    return self.finished(&method, path, request.body.len());
                }
            };

            let index = self.inner.store.append(request);
            debug_assert_eq!(i, index, "store and script out of step");

            let entry = self.inner.script.get(i).cloned();
            *state = if !self.inner.script.is_empty() && i + 1 == self.inner.script.len() {
                EndpointState::Closed
            } else {
                EndpointState::AwaitingRequest(i + 1)
            };

            if *state == EndpointState::Closed {
                // `send_replace` never fails, even with no receivers.
                self.inner.done.send_replace(true);
                info!(requests = i + 1, "response script exhausted, endpoint closed");
            }

            (i, entry)
        };

        let entry = entry.unwrap_or_else(ScriptedResponse::success);
        debug!(index, status = entry.status, "answering from script");
        self.build_response(&entry, counts)
    }

    fn finished(&self, method: &Method, path: &str, drained: usize) -> Response {
        let late = self.inner.late.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(%method, path, drained, late, "request after endpoint closed");
        (ENDPOINT_FINISHED_STATUS, ENDPOINT_FINISHED_BODY).into_response()
    }

    fn build_response(&self, entry: &ScriptedResponse, decoded: WrittenCounts) -> Response {
        let status = match StatusCode::from_u16(entry.status) {
            Ok(status) => status,
            Err(_) => {
                warn!(status = entry.status, "invalid scripted status, answering 500");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &entry.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!(name, value, "skipping invalid scripted header"),
            }
        }

        let explicit = entry.written.filter(|w| !w.is_zero());
        if self.inner.version == ProtocolVersion::V2 {
            if status.is_success() {
                explicit.unwrap_or(decoded).apply_to(&mut headers);
            } else if let Some(partial) = explicit {
                partial.apply_to(&mut headers);
            }
        }

        (status, headers, entry.body.clone()).into_response()
    }
}

async fn handle(
    State(endpoint): State<MockEndpoint>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    endpoint.respond(method, uri.path(), headers, body)
}

/// An HTTP server running on a background task.
#[derive(Debug)]
pub struct RunningServer {
    pub addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    /// Bind `bind` and serve `router` until `stop`.
    pub async fn start(bind: &str, router: Router) -> Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| ComplianceError::io(&format!("bind {bind}"), e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ComplianceError::io("read local address", e))?;

        let (shutdown, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
        });

        debug!(%addr, "server started");
        Ok(Self {
            addr,
            shutdown,
            task,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Stop accepting connections and wait for in-flight ones to finish.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(served) => served.map_err(|e| ComplianceError::io("serve", e)),
            Err(e) => Err(ComplianceError::Other(format!("server task failed: {e}"))),
        }
    }

    /// Like `stop`, but abort the server after `grace` and log instead of
    /// failing.
    pub async fn stop_within(self, grace: Duration) {
        let addr = self.addr;
        let _ = self.shutdown.send(());
        let mut task = self.task;

        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(Ok(()))) => debug!(%addr, "server stopped"),
            Ok(Ok(Err(err))) => warn!(%addr, %err, "server failed"),
            Ok(Err(err)) => warn!(%addr, %err, "server task failed"),
            Err(_) => {
                warn!(%addr, ?grace, "server did not drain in time, aborting");
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use axum::body::Body;
    use http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::testhelper;
    use crate::transport::{SAMPLES_WRITTEN_HEADER, VERSION_HEADER};

    fn post(message_value: f64, version: ProtocolVersion) -> Request<Body> {
        let message = testhelper::single_sample(version, "test_metric", message_value);
        let encoded = transport::encode(&message, testhelper::USER_AGENT).unwrap();

        let mut builder = Request::builder().method(Method::POST).uri("/api/v1/write");
        for (name, value) in &encoded.headers {
            builder = builder.header(name, value);
        }
        builder.body(Body::from(encoded.body)).unwrap()
    }

    #[tokio::test]
    async fn test_script_exhaustion() {
        let endpoint = MockEndpoint::new(
            ResponseScript::successes(1),
            ProtocolVersion::V2,
            RequestStore::new(),
        );
        let router = endpoint.router();

        let first = router
            .clone()
            .oneshot(post(1.0, ProtocolVersion::V2))
            .await
            .unwrap();
        assert_eq!(StatusCode::NO_CONTENT, first.status());
        assert!(endpoint.is_done());
        assert_eq!(EndpointState::Closed, endpoint.state());

        let second = router.oneshot(post(2.0, ProtocolVersion::V2)).await.unwrap();
        assert_eq!(ENDPOINT_FINISHED_STATUS, second.status());
        assert!(!second.status().is_success());

        assert_eq!(1, endpoint.store().len(), "late request not recorded");
        assert_eq!(1, endpoint.late_requests());
    }

    #[tokio::test]
    async fn test_script_order_and_written_headers() {
        struct TestCase {
            name: &'static str,
            version: ProtocolVersion,
            script: Vec<ScriptedResponse>,
            expected_status: &'static [u16],
            expected_samples_written: &'static [Option<&'static str>],
        }

        let tc = vec![
            TestCase {
                name: "auto counts on v2",
                version: ProtocolVersion::V2,
                script: vec![ScriptedResponse::status(500), ScriptedResponse::success()],
                expected_status: &[500, 204],
                expected_samples_written: &[None, Some("1")],
            },
            TestCase {
                name: "explicit counts win",
                version: ProtocolVersion::V2,
                script: vec![ScriptedResponse::status(200).with_written(WrittenCounts::new(5, 0, 0))],
                expected_status: &[200],
                expected_samples_written: &[Some("5")],
            },
            TestCase {
                name: "partial write keeps explicit counts",
                version: ProtocolVersion::V2,
                script: vec![ScriptedResponse::status(400).with_written(WrittenCounts::new(1, 0, 0))],
                expected_status: &[400],
                expected_samples_written: &[Some("1")],
            },
            TestCase {
                name: "no counts on v1",
                version: ProtocolVersion::V1,
                script: vec![ScriptedResponse::success()],
                expected_status: &[204],
                expected_samples_written: &[None],
            },
        ];

        for case in tc {
            let name = case.name;
            let endpoint = MockEndpoint::new(case.script.into(), case.version, RequestStore::new());

            for (i, (&status, &written)) in case
                .expected_status
                .iter()
                .zip(case.expected_samples_written)
                .enumerate()
            {
                let response = endpoint
                    .router()
                    .oneshot(post(i as f64, case.version))
                    .await
                    .unwrap();

                assert_eq!(status, response.status().as_u16(), "test case: {name} - status {i}");
                assert_eq!(
                    written,
                    response
                        .headers()
                        .get(SAMPLES_WRITTEN_HEADER)
                        .map(|v| v.to_str().unwrap()),
                    "test case: {name} - written {i}"
                );
            }

            assert!(endpoint.is_done(), "test case: {name} - done");
        }
    }

    #[tokio::test]
    async fn test_decode_failure_is_recorded() {
        let endpoint = MockEndpoint::new(
            ResponseScript::successes(2),
            ProtocolVersion::V2,
            RequestStore::new(),
        );

        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_ENCODING, HeaderValue::from_static("snappy"));
        headers.insert(VERSION_HEADER, HeaderValue::from_static("2.0.0"));
        let response = endpoint.respond(
            Method::POST,
            "/api/v1/write",
            headers,
            Bytes::from_static(b"\xff\x06\x00\x00sNaPpY\x00"),
        );

        assert_eq!(StatusCode::NO_CONTENT, response.status());
        let snapshot = endpoint.store().snapshot();
        assert_eq!(1, snapshot.len());
        assert_eq!(Some(&ComplianceError::FramedSnappy), snapshot[0].decode_error());
        assert!(!endpoint.is_done());
    }

    #[tokio::test]
    async fn test_oversized_body_is_recorded() {
        let endpoint = MockEndpoint::new(
            ResponseScript::successes(1),
            ProtocolVersion::V2,
            RequestStore::new(),
        );
        let oversized = || {
            Request::builder()
                .method(Method::POST)
                .uri("/api/v1/write")
                .header(http::header::CONTENT_ENCODING, "snappy")
                .body(Body::from(vec![0u8; transport::MAX_DECOMPRESSED_BYTES + 1]))
                .unwrap()
        };

        let first = endpoint.router().oneshot(oversized()).await.unwrap();
        assert_eq!(StatusCode::NO_CONTENT, first.status());
        let snapshot = endpoint.store().snapshot();
        assert_eq!(1, snapshot.len());
        assert!(
            matches!(snapshot[0].decode_error(), Some(ComplianceError::Compression(_))),
            "{:?}",
            snapshot[0].decode_error()
        );
        assert!(endpoint.is_done(), "the oversized request used the script entry");

        let second = endpoint.router().oneshot(oversized()).await.unwrap();
        assert_eq!(ENDPOINT_FINISHED_STATUS, second.status());
        assert_eq!(1, endpoint.late_requests());
    }

    #[tokio::test]
    async fn test_empty_script_answers_success_forever() {
        let endpoint = MockEndpoint::new(
            ResponseScript::default(),
            ProtocolVersion::V2,
            RequestStore::new(),
        );

        for i in 0..3 {
            let response = endpoint
                .router()
                .oneshot(post(i as f64, ProtocolVersion::V2))
                .await
                .unwrap();
            assert_eq!(StatusCode::NO_CONTENT, response.status());
        }
        assert!(!endpoint.is_done());
        assert_eq!(EndpointState::AwaitingRequest(3), endpoint.state());
    }

    #[tokio::test]
    async fn test_done_signal_fires_once() {
        let endpoint = MockEndpoint::new(
            ResponseScript::successes(2),
            ProtocolVersion::V1,
            RequestStore::new(),
        );

        let waiter = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.done().await })
        };

        for i in 0..2 {
            endpoint
                .router()
                .oneshot(post(i as f64, ProtocolVersion::V1))
                .await
                .unwrap();
        }

        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("done signalled")
            .unwrap();
        // Resolves immediately once done.
        endpoint.done().await;
    }

    #[tokio::test]
    async fn test_running_server_stop() {
        let endpoint = MockEndpoint::new(
            ResponseScript::successes(1),
            ProtocolVersion::V2,
            RequestStore::new(),
        );
        let server = RunningServer::start("127.0.0.1:0", endpoint.router())
            .await
            .unwrap();
        assert!(server.url("/api/v1/write").starts_with("http://127.0.0.1:"));
        server.stop().await.unwrap();
    }

    #[test]
    fn test_script_deserializes() {
        let script: ResponseScript = serde_json::from_str(
            r#"[{"status": 503, "headers": [["Retry-After", "1"]]}, {"status": 204}]"#,
        )
        .unwrap();

        assert_eq!(2, script.len());
        assert_eq!(
            vec![("Retry-After".to_string(), "1".to_string())],
            script.get(0).unwrap().headers
        );
        assert!(script.get(1).unwrap().is_success());
    }
}

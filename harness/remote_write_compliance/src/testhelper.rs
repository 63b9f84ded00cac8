use bytes::Bytes;
use http::Method;

use crate::message::{MessageBuilder, WireMessage};
use crate::proto::v2;
use crate::store::CapturedRequest;
use crate::transport::{self, ProtocolVersion};

/// A fixed millisecond timestamp, 2023-11-14T22:13:20Z.
pub const TS: i64 = 1_700_000_000_000;

pub const USER_AGENT: &str = "remote-write-compliance-test/0.1";

pub const WRITE_PATH: &str = "/api/v1/write";

/// A message with one series `name{job="test"}` holding one sample at `TS`.
pub fn single_sample(version: ProtocolVersion, name: &str, value: f64) -> WireMessage {
    let mut builder = MessageBuilder::new(version);
    builder
        .series(&[("__name__", name), ("job", "test")])
        .sample(value, TS);
    builder.build().unwrap()
}

/// An integer-count native histogram with three positive buckets.
pub fn native_histogram(ts: i64) -> v2::Histogram {
    v2::Histogram {
        count: Some(v2::histogram::Count::CountInt(6)),
        sum: 12.5,
        schema: 0,
        zero_threshold: 1e-128,
        zero_count: Some(v2::histogram::ZeroCount::ZeroCountInt(1)),
        positive_spans: vec![v2::BucketSpan {
            offset: 0,
            length: 3,
        }],
        positive_deltas: vec![1, 1, 0],
        timestamp: ts,
        ..Default::default()
    }
}

/// A well-formed symbol-table message with two series.
pub fn indexed_message() -> WireMessage {
    let mut builder = MessageBuilder::new(ProtocolVersion::V2);
    builder
        .series(&[("__name__", "http_requests_total"), ("code", "200")])
        .sample(10.0, TS);
    builder
        .series(&[("__name__", "http_requests_total"), ("code", "500")])
        .sample(1.0, TS);
    builder.build().unwrap()
}

/// A POST that went through the real encoder and decoder.
pub fn captured(version: ProtocolVersion, value: f64) -> CapturedRequest {
    let message = single_sample(version, "test_metric", value);
    let encoded = transport::encode(&message, USER_AGENT).unwrap();
    let decoded = transport::decode(&encoded.headers, &encoded.body, version);

    CapturedRequest::new(Method::POST, WRITE_PATH, encoded.headers, encoded.body, decoded)
}

/// A captured request built from an already assembled message.
pub fn captured_message(message: &WireMessage) -> CapturedRequest {
    let encoded = transport::encode(message, USER_AGENT).unwrap();
    CapturedRequest::new(
        Method::POST,
        WRITE_PATH,
        encoded.headers,
        encoded.body,
        Ok(message.clone()),
    )
}

/// A captured request whose body never decoded.
pub fn captured_garbage() -> CapturedRequest {
    CapturedRequest::new(
        Method::POST,
        WRITE_PATH,
        http::HeaderMap::new(),
        Bytes::from_static(b"not snappy"),
        Err(crate::error::ComplianceError::Compression("corrupt input".to_string())),
    )
}

/// Route `tracing` output through the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

//! The HTTP envelope around a remote-write message: compression, content
//! type, protocol version and written-count headers.
//!
//! Everything here is a pure transformation. Reading bodies and talking to
//! sockets happens in the callers.

use std::fmt;

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderValue};
use prost::Message;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ComplianceError;
use crate::message::WireMessage;
use crate::proto::{v1, v2, V1_SCHEMA, V2_SCHEMA};
use crate::Result;

// Header names are lowercase so they can be inserted from static strings.
pub const VERSION_HEADER: &str = "x-prometheus-remote-write-version";
pub const SAMPLES_WRITTEN_HEADER: &str = "x-prometheus-remote-write-samples-written";
pub const HISTOGRAMS_WRITTEN_HEADER: &str = "x-prometheus-remote-write-histograms-written";
pub const EXEMPLARS_WRITTEN_HEADER: &str = "x-prometheus-remote-write-exemplars-written";

pub const SNAPPY_ENCODING: &str = "snappy";
pub const PROTOBUF_MEDIA_TYPE: &str = "application/x-protobuf";

/// Upper bound on a body, as received and once decompressed. Checked before
/// allocating.
pub const MAX_DECOMPRESSED_BYTES: usize = 64 * 1024 * 1024;

/// Stream identifier chunk that opens every framed-format snappy stream.
pub const SNAPPY_FRAME_MAGIC: &[u8; 10] = b"\xff\x06\x00\x00sNaPpY";

const V1_CONTENT_TYPE: &str = "application/x-protobuf";
const V2_CONTENT_TYPE: &str = "application/x-protobuf;proto=io.prometheus.write.v2.Request";

/// The two wire shapes a request can take.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Labels inline on every series, `prometheus.WriteRequest`.
    #[serde(rename = "v1")]
    V1,
    /// Symbol table plus label references, `io.prometheus.write.v2.Request`.
    #[serde(rename = "v2")]
    V2,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V1 => f.write_str("v1"),
            ProtocolVersion::V2 => f.write_str("v2"),
        }
    }
}

impl ProtocolVersion {
    /// Value of the `X-Prometheus-Remote-Write-Version` header.
    pub fn header_value(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => "0.1.0",
            ProtocolVersion::V2 => "2.0.0",
        }
    }

    pub fn schema(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => V1_SCHEMA,
            ProtocolVersion::V2 => V2_SCHEMA,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ProtocolVersion::V1 => V1_CONTENT_TYPE,
            ProtocolVersion::V2 => V2_CONTENT_TYPE,
        }
    }

    pub fn from_header_value(value: &str) -> Option<Self> {
        let major = value.trim().split('.').next()?;
        match major {
            "0" | "1" => Some(ProtocolVersion::V1),
            "2" => Some(ProtocolVersion::V2),
            _ => None,
        }
    }

    /// The version a `Content-Type` claims. A protobuf media type without a
    /// `proto=` parameter means the legacy schema.
    pub fn from_content_type(value: &str) -> Option<Self> {
        let mut parts = value.split(';').map(str::trim);
        let media_type = parts.next()?;
        if !media_type.eq_ignore_ascii_case(PROTOBUF_MEDIA_TYPE) {
            return None;
        }

        let proto = parts
            .filter_map(|p| p.split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("proto"))
            .map(|(_, v)| v.trim().trim_matches('"'));

        match proto {
            None | Some(V1_SCHEMA) => Some(ProtocolVersion::V1),
            Some(V2_SCHEMA) => Some(ProtocolVersion::V2),
            Some(_) => None,
        }
    }
}

/// Per-kind counts a receiver reports back on success.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrittenCounts {
    pub samples: u64,
    pub histograms: u64,
    pub exemplars: u64,
}

impl WrittenCounts {
    pub fn new(samples: u64, histograms: u64, exemplars: u64) -> Self {
        Self {
            samples,
            histograms,
            exemplars,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.samples == 0 && self.histograms == 0 && self.exemplars == 0
    }

    pub fn total(&self) -> u64 {
        self.samples + self.histograms + self.exemplars
    }

    /// Set the three written-count headers.
    pub fn apply_to(&self, headers: &mut HeaderMap) {
        for (name, value) in [
            (SAMPLES_WRITTEN_HEADER, self.samples),
            (HISTOGRAMS_WRITTEN_HEADER, self.histograms),
            (EXEMPLARS_WRITTEN_HEADER, self.exemplars),
        ] {
            headers.insert(name, HeaderValue::from(value));
        }
    }

    /// Read the written-count headers back. `None` when none of them are set.
    /// Headers that are present but not integers count as 0.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let read = |name: &str| {
            headers
                .get(name)
                .map(|v| v.to_str().ok().and_then(|s| s.trim().parse::<u64>().ok()).unwrap_or(0))
        };

        let samples = read(SAMPLES_WRITTEN_HEADER);
        let histograms = read(HISTOGRAMS_WRITTEN_HEADER);
        let exemplars = read(EXEMPLARS_WRITTEN_HEADER);

        if samples.is_none() && histograms.is_none() && exemplars.is_none() {
            return None;
        }

        Some(Self {
            samples: samples.unwrap_or(0),
            histograms: histograms.unwrap_or(0),
            exemplars: exemplars.unwrap_or(0),
        })
    }
}

/// Undo the body's content encoding.
///
/// A missing `Content-Encoding` leaves the body untouched, header validation
/// reports it. Framed snappy is refused outright.
pub fn decompress(headers: &HeaderMap, body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > MAX_DECOMPRESSED_BYTES {
        return Err(ComplianceError::Compression(format!(
            "body of {} bytes exceeds {MAX_DECOMPRESSED_BYTES}",
            body.len()
        )));
    }

    let encoding = headers
        .get(CONTENT_ENCODING)
        .map(|v| v.to_str().unwrap_or_default().trim().to_ascii_lowercase());

    match encoding.as_deref() {
        None | Some("") | Some("identity") => Ok(body.to_vec()),
        Some(SNAPPY_ENCODING) => {
            if body.starts_with(SNAPPY_FRAME_MAGIC) {
                return Err(ComplianceError::FramedSnappy);
            }
            let len = snap::raw::decompress_len(body)?;
            if len > MAX_DECOMPRESSED_BYTES {
                return Err(ComplianceError::Compression(format!(
                    "decompressed length {len} exceeds {MAX_DECOMPRESSED_BYTES}"
                )));
            }
            Ok(snap::raw::Decoder::new().decompress_vec(body)?)
        }
        Some(other) => Err(ComplianceError::UnsupportedEncoding(other.to_string())),
    }
}

/// Decode an inbound body into a message of the configured version.
pub fn decode(headers: &HeaderMap, body: &[u8], version: ProtocolVersion) -> Result<WireMessage> {
    let raw = decompress(headers, body)?;

    let message = match version {
        ProtocolVersion::V1 => v1::WriteRequest::decode(raw.as_slice())
            .map(WireMessage::from)
            .map_err(|e| ComplianceError::malformed(V1_SCHEMA, e))?,
        ProtocolVersion::V2 => v2::Request::decode(raw.as_slice())
            .map(WireMessage::from)
            .map_err(|e| ComplianceError::malformed(V2_SCHEMA, e))?,
    };

    debug!(
        compressed = body.len(),
        decompressed = raw.len(),
        series = message.len(),
        %version,
        "decoded remote-write body"
    );

    Ok(message)
}

/// Headers and compressed body ready to POST.
#[derive(Clone, Debug)]
pub struct EncodedRequest {
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Serialize, compress and wrap a message the way a conforming sender does.
pub fn encode(message: &WireMessage, user_agent: &str) -> Result<EncodedRequest> {
    let version = message.version();
    let raw = match message {
        WireMessage::Legacy(m) => m.request.encode_to_vec(),
        WireMessage::Indexed(m) => m.to_request().encode_to_vec(),
    };
    let body = snap::raw::Encoder::new().compress_vec(&raw)?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_ENCODING, HeaderValue::from_static(SNAPPY_ENCODING));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(version.content_type()));
    headers.insert(VERSION_HEADER, HeaderValue::from_static(version.header_value()));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(user_agent)
            .map_err(|e| ComplianceError::Http(format!("invalid user agent: {e}")))?,
    );

    Ok(EncodedRequest {
        headers,
        body: Bytes::from(body),
    })
}

//! Serving scrape text, and reading it back for the reference sender.
//!
//! The reader understands just enough of the text and OpenMetrics formats to
//! turn a test fixture into samples: `# HELP`, `# TYPE`, `# UNIT`, `# EOF`,
//! sample lines with optional labels and timestamp. Exemplars and anything
//! after a trailing `#` on a sample line are ignored.

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use hashbrown::HashMap;
use http::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ComplianceError;
use crate::message::{MessageBuilder, MetricType, WireMessage, METRIC_NAME_LABEL};
use crate::transport::ProtocolVersion;
use crate::util;
use crate::Result;

pub const EOF_MARKER: &str = "# EOF";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpositionFormat {
    /// The classic Prometheus text format, no end marker.
    #[default]
    Text,
    /// OpenMetrics, terminated by `# EOF`.
    OpenMetrics,
}

impl ExpositionFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            ExpositionFormat::Text => "text/plain; version=0.0.4; charset=utf-8",
            ExpositionFormat::OpenMetrics => "application/openmetrics-text; version=1.0.0; charset=utf-8",
        }
    }

    pub fn requires_eof(self) -> bool {
        self == ExpositionFormat::OpenMetrics
    }
}

/// Scrape text with the end marker added where the format needs one.
pub fn with_eof(text: &str, format: ExpositionFormat) -> String {
    let mut body = text.trim_end().to_string();
    let terminated = body.lines().last().map(str::trim) == Some(EOF_MARKER);
    if format.requires_eof() && !terminated {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(EOF_MARKER);
    }
    body.push('\n');
    body
}

/// A fixed document served on every GET.
#[derive(Clone, Debug)]
pub struct ScrapeTarget {
    body: Arc<str>,
    format: ExpositionFormat,
}

impl ScrapeTarget {
    pub fn new(text: &str, format: ExpositionFormat) -> Self {
        Self {
            body: with_eof(text, format).into(),
            format,
        }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn format(&self) -> ExpositionFormat {
        self.format
    }

    pub fn router(&self, path: &str) -> Router {
        Router::new()
            .route(path, get(serve_scrape))
            .with_state(self.clone())
    }
}

async fn serve_scrape(State(target): State<ScrapeTarget>) -> Response {
    debug!(bytes = target.body.len(), "serving scrape");
    (
        [(CONTENT_TYPE, target.format.content_type())],
        target.body.to_string(),
    )
        .into_response()
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExpositionSample {
    pub name: String,
    /// Labels as written, without `__name__`.
    pub labels: Vec<(String, String)>,
    pub value: f64,
    /// Milliseconds since the epoch.
    pub timestamp: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FamilyMetadata {
    pub metric_type: MetricType,
    pub help: Option<String>,
    pub unit: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Exposition {
    pub families: HashMap<String, FamilyMetadata>,
    pub samples: Vec<ExpositionSample>,
}

impl Exposition {
    pub fn parse(text: &str, format: ExpositionFormat) -> Result<Self> {
        let mut exposition = Exposition::default();

        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == EOF_MARKER {
                break;
            }

            let mut cursor = Cursor::new(line, i + 1);
            if line.starts_with('#') {
                exposition.parse_comment(&mut cursor)?;
            } else {
                let sample = cursor.sample(format)?;
                exposition.samples.push(sample);
            }
        }

        Ok(exposition)
    }

    fn parse_comment(&mut self, cursor: &mut Cursor<'_>) -> Result<()> {
        cursor.bump();
        cursor.skip_ws();
        let keyword = cursor.take_while(|c| !c.is_whitespace());
        if !matches!(keyword, "HELP" | "TYPE" | "UNIT") {
            return Ok(());
        }

        cursor.skip_ws();
        let name = cursor.take_while(is_metric_char);
        if name.is_empty() {
            return Err(cursor.err(&format!("{keyword} without a metric name")));
        }
        cursor.skip_ws();
        let rest = cursor.rest();

        let family = self.families.entry(name.to_string()).or_default();
        match keyword {
            "HELP" => family.help = Some(unescape(rest)),
            "TYPE" => family.metric_type = MetricType::from_exposition(rest),
            _ => family.unit = (!rest.is_empty()).then(|| rest.to_string()),
        }
        Ok(())
    }

    /// Metadata for a sample name, looked up by exact name first, then by
    /// family.
    pub fn metadata_for(&self, name: &str) -> Option<&FamilyMetadata> {
        [name, util::strip_classic_suffix(name), util::family_name(name)]
            .into_iter()
            .find_map(|candidate| self.families.get(candidate))
    }

    /// Build a request out of the samples. Consecutive lines of the same
    /// series become one series; samples without a timestamp get
    /// `default_timestamp`.
    pub fn to_message(&self, version: ProtocolVersion, default_timestamp: i64) -> Result<WireMessage> {
        let mut builder = MessageBuilder::new(version);
        let mut previous: Option<&ExpositionSample> = None;

        for sample in &self.samples {
            let same_series = previous
                .map_or(false, |p| p.name == sample.name && p.labels == sample.labels);

            if !same_series {
                let mut labels: Vec<(&str, &str)> = vec![(METRIC_NAME_LABEL, sample.name.as_str())];
                labels.extend(sample.labels.iter().map(|(n, v)| (n.as_str(), v.as_str())));

                let series = builder.series(&labels);
                if let Some(meta) = self.metadata_for(&sample.name) {
                    series.metadata(meta.metric_type, meta.help.as_deref(), meta.unit.as_deref());
                }
            }

            if let Some(series) = builder.last_series() {
                series.sample(sample.value, sample.timestamp.unwrap_or(default_timestamp));
            }
            previous = Some(sample);
        }

        builder.build()
    }
}

fn is_metric_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == ':'
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn parse_value(token: &str) -> Option<f64> {
    match token {
        "NaN" => Some(f64::NAN),
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

/// A position within one line of scrape text.
struct Cursor<'a> {
    line: &'a str,
    pos: usize,
    number: usize,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str, number: usize) -> Self {
        Self {
            line,
            pos: 0,
            number,
        }
    }

    fn err(&self, msg: &str) -> ComplianceError {
        ComplianceError::Exposition {
            line: self.number,
            err: msg.to_string(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.line[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.bump();
        }
    }

    fn take_while(&mut self, f: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().map_or(false, &f) {
            self.bump();
        }
        &self.line[start..self.pos]
    }

    fn rest(&self) -> &'a str {
        self.line[self.pos..].trim_end()
    }

    fn expect(&mut self, want: char) -> Result<()> {
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(self.err(&format!("expected '{want}', found '{c}'"))),
            None => Err(self.err(&format!("expected '{want}', found end of line"))),
        }
    }

    fn quoted(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some(c @ ('\\' | '"')) => out.push(c),
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                    None => break,
                },
                Some(c) => out.push(c),
                None => break,
            }
        }
        Err(self.err("unterminated label value"))
    }

    fn labels(&mut self) -> Result<Vec<(String, String)>> {
        self.expect('{')?;
        let mut labels = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.bump();
                return Ok(labels);
            }

            let name = self.take_while(is_label_char);
            if name.is_empty() {
                return Err(self.err("expected a label name"));
            }
            self.skip_ws();
            self.expect('=')?;
            self.skip_ws();
            let value = self.quoted()?;
            labels.push((name.to_string(), value));

            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(labels),
                _ => return Err(self.err("expected ',' or '}' after label value")),
            }
        }
    }

    fn sample(&mut self, format: ExpositionFormat) -> Result<ExpositionSample> {
        let name = self.take_while(is_metric_char);
        if name.is_empty() {
            return Err(self.err("expected a metric name"));
        }

        let labels = if self.peek() == Some('{') {
            self.labels()?
        } else {
            Vec::new()
        };

        self.skip_ws();
        let value_token = self.take_while(|c| !c.is_whitespace());
        let value = parse_value(value_token)
            .ok_or_else(|| self.err(&format!("invalid sample value '{value_token}'")))?;

        self.skip_ws();
        let ts_token = self.take_while(|c| !c.is_whitespace() && c != '#');
        let timestamp = match ts_token {
            "" => None,
            token => Some(parse_timestamp(token, format).ok_or_else(|| {
                self.err(&format!("invalid timestamp '{token}'"))
            })?),
        };

        Ok(ExpositionSample {
            name: name.to_string(),
            labels,
            value,
            timestamp,
        })
    }
}

/// Text format timestamps are milliseconds, OpenMetrics ones are seconds.
fn parse_timestamp(token: &str, format: ExpositionFormat) -> Option<i64> {
    match format {
        ExpositionFormat::Text => token.parse().ok(),
        ExpositionFormat::OpenMetrics => {
            let seconds: f64 = token.parse().ok()?;
            // CAST: finite and in range for any realistic scrape.
            seconds
                .is_finite()
                .then(|| (seconds * 1000.0).round() as i64)
        }
    }
}

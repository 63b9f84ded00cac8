//! Graded protocol checks over decoded messages and captured requests.
//!
//! Decoding is permissive. Everything a sender can get wrong short of an
//! unparseable body is caught here instead, and every check that runs is
//! recorded so a single pass reports all violations at once.

use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::check;
use crate::error::ComplianceError;
use crate::exemplars::EXEMPLAR_MAX_LABEL_RUNES;
use crate::message::{LabelSet, MetricType, Sample, Series, WireMessage};
use crate::proto::v2;
use crate::store::CapturedRequest;
use crate::symbols::SymbolTable;
use crate::transport::{ProtocolVersion, SNAPPY_ENCODING, VERSION_HEADER};
use crate::util;
use crate::Result;

/// Requirement strength of a check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Must,
    Should,
    May,
    Recommended,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Must => "MUST",
            Level::Should => "SHOULD",
            Level::May => "MAY",
            Level::Recommended => "RECOMMENDED",
        };
        f.write_str(s)
    }
}

/// Where in a conversation a finding applies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Location {
    pub request: Option<usize>,
    pub series: Option<usize>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.request, self.series) {
            (Some(r), Some(s)) => write!(f, "request {r} series {s}"),
            (Some(r), None) => write!(f, "request {r}"),
            (None, Some(s)) => write!(f, "series {s}"),
            (None, None) => f.write_str("scenario"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Finding {
    pub level: Level,
    pub check: &'static str,
    pub passed: bool,
    pub location: Location,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Every check that ran, passed or not.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Report {
    findings: Vec<Finding>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope for checks not tied to one request.
    pub fn scope(&mut self) -> Scope<'_> {
        Scope {
            report: self,
            location: Location::default(),
        }
    }

    pub fn request(&mut self, index: usize) -> Scope<'_> {
        Scope {
            report: self,
            location: Location {
                request: Some(index),
                series: None,
            },
        }
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    /// Failed `MUST` checks.
    pub fn failures(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| !f.passed && f.level == Level::Must)
    }

    /// Failed checks of every other level.
    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| !f.passed && f.level != Level::Must)
    }

    /// True when no `MUST` check failed.
    pub fn passed(&self) -> bool {
        self.failures().next().is_none()
    }

    /// True when `check` failed anywhere, at any level.
    pub fn failed(&self, check: &str) -> bool {
        self.findings.iter().any(|f| !f.passed && f.check == check)
    }

    pub fn extend(&mut self, other: Report) {
        self.findings.extend(other.findings);
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ComplianceError::Other(format!("failed to serialize report: {e}")))
    }

    /// Emit failures at `error`, other misses at `warn`, and a summary line.
    pub fn log(&self) {
        for f in self.findings.iter().filter(|f| !f.passed) {
            if f.level == Level::Must {
                error!(check = f.check, location = %f.location, "{}", f.message);
            } else {
                warn!(level = %f.level, check = f.check, location = %f.location, "{}", f.message);
            }
        }
        info!(
            checks = self.findings.len(),
            failures = self.failures().count(),
            warnings = self.warnings().count(),
            "validation finished"
        );
    }
}

/// A `Report` borrowed at a location. Findings recorded through it carry
/// that location.
#[derive(Debug)]
pub struct Scope<'r> {
    report: &'r mut Report,
    location: Location,
}

impl<'r> Scope<'r> {
    pub fn record(&mut self, level: Level, check: &'static str, passed: bool, message: String) -> bool {
        self.report.findings.push(Finding {
            level,
            check,
            passed,
            location: self.location,
            message,
        });
        passed
    }

    pub fn series(&mut self, index: usize) -> Scope<'_> {
        Scope {
            report: &mut *self.report,
            location: Location {
                series: Some(index),
                ..self.location
            },
        }
    }

    pub fn location(&self) -> Location {
        self.location
    }
}

/// What a scenario expects the sender to produce.
#[derive(Clone, Debug, PartialEq)]
pub struct Expectations {
    pub version: ProtocolVersion,
    pub write_path: Option<String>,
    pub min_requests: usize,
}

impl Expectations {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            write_path: None,
            min_requests: 1,
        }
    }

    pub fn with_write_path(mut self, path: &str) -> Self {
        self.write_path = Some(path.to_string());
        self
    }

    pub fn with_min_requests(mut self, n: usize) -> Self {
        self.min_requests = n;
        self
    }
}

/// Table-level symbol checks. `series` is how many series reference the
/// table; a request without series may leave it empty.
pub fn validate_symbols(symbols: &SymbolTable, series: usize, scope: &mut Scope<'_>) {
    match symbols.as_slice().first() {
        Some(first) => check!(
            scope,
            Must,
            "symbols-empty-first",
            first.is_empty(),
            "symbol 0 must be the empty string, got {first:?}"
        ),
        None => check!(
            scope,
            Must,
            "symbols-empty-first",
            series == 0,
            "symbol table is empty but {series} series reference it"
        ),
    };

    let dups = symbols.duplicates();
    check!(
        scope,
        Must,
        "symbols-unique",
        dups.is_empty(),
        "duplicate symbols (string, positions): {dups:?}"
    );
}

/// Parity and bounds of a symbol-table label reference list.
pub fn validate_label_refs(refs: &[u32], symbols_len: usize, scope: &mut Scope<'_>) {
    check!(
        scope,
        Must,
        "label-refs-even",
        refs.len() % 2 == 0,
        "{}",
        ComplianceError::OddLength(refs.len())
    );

    // CAST: u32 to usize is lossless on supported targets.
    let bad = refs
        .iter()
        .enumerate()
        .find(|(_, r)| **r as usize >= symbols_len);
    check!(scope, Must, "label-refs-valid", bad.is_none(), "{}", {
        let (position, reference) = bad.map(|(p, r)| (p, *r)).unwrap_or_default();
        ComplianceError::InvalidReference {
            position,
            reference,
            len: symbols_len,
        }
    });
}

pub fn validate_labels(labels: &LabelSet<'_>, scope: &mut Scope<'_>) {
    let names: Vec<&str> = labels.names().collect();
    let sorted = names.windows(2).all(|w| w[0].as_bytes() <= w[1].as_bytes());
    check!(
        scope,
        Must,
        "labels-sorted",
        sorted,
        "label names not in ascending byte order: {names:?}"
    );

    let dups = labels.duplicate_names();
    check!(
        scope,
        Must,
        "labels-unique",
        dups.is_empty(),
        "duplicate label names: {dups:?}"
    );

    let name = labels.metric_name().unwrap_or_default();
    check!(
        scope,
        Must,
        "metric-name",
        !name.is_empty(),
        "__name__ label missing or empty"
    );
}

pub fn validate_samples(samples: &[Sample], scope: &mut Scope<'_>) {
    let bad_unit = samples
        .iter()
        .find(|s| !util::is_millisecond_timestamp(s.timestamp));
    check!(
        scope,
        Must,
        "sample-timestamp-millis",
        bad_unit.is_none(),
        "sample timestamp {} is not in milliseconds",
        bad_unit.map(|s| s.timestamp).unwrap_or_default()
    );

    let regression = samples
        .iter()
        .tuple_windows()
        .position(|(a, b)| b.timestamp < a.timestamp);
    check!(
        scope,
        Must,
        "sample-timestamps-ordered",
        regression.is_none(),
        "sample {} goes back in time",
        regression.map_or(0, |i| i + 1)
    );

    // Any NaN is taken as a possible stale marker; a series can't be stale
    // and hold a value at the same instant.
    let markers: Vec<&Sample> = samples
        .iter()
        .filter(|s| util::is_stale_marker(s.value))
        .collect();
    if !markers.is_empty() {
        let clash = markers.iter().find(|m| {
            samples
                .iter()
                .any(|s| !util::is_stale_marker(s.value) && s.timestamp == m.timestamp)
        });
        check!(
            scope,
            Should,
            "sample-stale-marker",
            clash.is_none(),
            "stale marker at {} shares its timestamp with a sample",
            clash.map(|m| m.timestamp).unwrap_or_default()
        );
    }

    if let Some(first) = samples.first() {
        if let Some(created) = first.created_timestamp {
            check!(
                scope,
                Should,
                "created-timestamp",
                created <= first.timestamp,
                "created timestamp {created} is after first sample at {}",
                first.timestamp
            );
        }
    }
}

fn span_len(spans: &[v2::BucketSpan]) -> usize {
    // CAST: u32 to usize is lossless on supported targets.
    spans.iter().map(|s| s.length as usize).sum()
}

pub fn validate_histograms(histograms: &[v2::Histogram], scope: &mut Scope<'_>) {
    if histograms.is_empty() {
        return;
    }

    let bad_unit = histograms
        .iter()
        .find(|h| !util::is_millisecond_timestamp(h.timestamp));
    check!(
        scope,
        Must,
        "histogram-timestamp-millis",
        bad_unit.is_none(),
        "histogram timestamp {} is not in milliseconds",
        bad_unit.map(|h| h.timestamp).unwrap_or_default()
    );

    let regression = histograms
        .iter()
        .tuple_windows()
        .position(|(a, b)| b.timestamp < a.timestamp);
    check!(
        scope,
        Must,
        "histogram-timestamps-ordered",
        regression.is_none(),
        "histogram {} goes back in time",
        regression.map_or(0, |i| i + 1)
    );

    for (i, h) in histograms.iter().enumerate() {
        check!(
            scope,
            Should,
            "histogram-count-set",
            h.count.is_some(),
            "histogram {i} has no count"
        );

        let zero_is_float = matches!(h.zero_count, Some(v2::histogram::ZeroCount::ZeroCountFloat(_)));
        let zero_is_int = matches!(h.zero_count, Some(v2::histogram::ZeroCount::ZeroCountInt(_)));
        check!(
            scope,
            Must,
            "histogram-kind-consistent",
            !(h.is_float() && zero_is_int) && !(!h.is_float() && h.count.is_some() && zero_is_float),
            "histogram {i} mixes integer and float counts"
        );

        let (positive, negative) = if h.is_float() {
            (h.positive_counts.len(), h.negative_counts.len())
        } else {
            (h.positive_deltas.len(), h.negative_deltas.len())
        };
        let want_positive = span_len(&h.positive_spans);
        let want_negative = span_len(&h.negative_spans);
        check!(
            scope,
            Must,
            "histogram-spans",
            positive == want_positive && negative == want_negative,
            "histogram {i} spans cover {want_positive}/{want_negative} buckets but {positive}/{negative} are present"
        );
    }
}

pub fn validate_exemplars(series: &Series<'_>, scope: &mut Scope<'_>) {
    let exemplars = match series.exemplars() {
        Ok(exemplars) => exemplars,
        Err(err) => {
            check!(scope, Must, "exemplar-refs", false, "exemplar labels don't resolve: {err}");
            return;
        }
    };

    for (i, e) in exemplars.iter().enumerate() {
        let runes = e.label_runes();
        check!(
            scope,
            Must,
            "exemplar-labels-length",
            runes <= EXEMPLAR_MAX_LABEL_RUNES,
            "exemplar {i} labels are {runes} characters, limit is {EXEMPLAR_MAX_LABEL_RUNES}"
        );
        check!(
            scope,
            Must,
            "exemplar-timestamp",
            util::is_millisecond_timestamp(e.timestamp),
            "exemplar {i} timestamp {} is not in milliseconds",
            e.timestamp
        );
    }
}

pub fn validate_metadata(series: &Series<'_>, scope: &mut Scope<'_>) {
    match series.metadata() {
        Ok(Some(_)) => {}
        Ok(None) => {
            if let Series::Indexed { .. } = series {
                check!(scope, Recommended, "metadata-present", false, "series carries no metadata");
            }
        }
        Err(err) => {
            check!(scope, Must, "metadata-refs", false, "metadata references don't resolve: {err}");
        }
    }
}

pub fn validate_series(series: Series<'_>, scope: &mut Scope<'_>) {
    if let Series::Indexed { message, series: ts } = series {
        validate_label_refs(&ts.labels_refs, message.symbols.len(), scope);
    }
    if let Ok(labels) = series.labels() {
        validate_labels(&labels, scope);
    }

    check!(
        scope,
        Must,
        "series-has-data",
        series.sample_count() > 0 || !series.histograms().is_empty(),
        "series has neither samples nor histograms"
    );
    check!(
        scope,
        Must,
        "samples-histograms-exclusive",
        !series.mixes_samples_and_histograms(),
        "series holds {} samples and {} histograms",
        series.sample_count(),
        series.histograms().len()
    );

    validate_samples(&series.samples(), scope);
    validate_histograms(series.histograms(), scope);
    validate_exemplars(&series, scope);
    validate_metadata(&series, scope);
}

/// Series of one family should agree on their metric type.
pub fn validate_family_metadata(message: &WireMessage, scope: &mut Scope<'_>) {
    let families = message
        .time_series_list()
        .into_iter()
        .filter_map(|s| {
            let name = s.metric_name()?;
            let meta = s.metadata().ok()??;
            (meta.metric_type != MetricType::Unspecified)
                .then(|| (util::family_name(name), meta.metric_type))
        })
        .into_group_map();

    for (family, types) in families.into_iter().sorted_by_key(|(f, _)| *f) {
        let distinct: Vec<MetricType> = types.into_iter().unique().collect();
        check!(
            scope,
            Should,
            "metadata-family-consistent",
            distinct.len() == 1,
            "family {family} has conflicting types {distinct:?}"
        );
    }
}

pub fn validate_message(message: &WireMessage, scope: &mut Scope<'_>) {
    if let WireMessage::Indexed(m) = message {
        validate_symbols(&m.symbols, m.timeseries.len(), scope);
    }
    for (i, series) in message.time_series_list().into_iter().enumerate() {
        validate_series(series, &mut scope.series(i));
    }
    validate_family_metadata(message, scope);
}

pub fn validate_headers(request: &CapturedRequest, expect: &Expectations, scope: &mut Scope<'_>) {
    check!(
        scope,
        Must,
        "method",
        request.method == http::Method::POST,
        "method is {}, want POST",
        request.method
    );

    let encoding = request.header("content-encoding").unwrap_or_default();
    check!(
        scope,
        Must,
        "content-encoding",
        encoding.trim().eq_ignore_ascii_case(SNAPPY_ENCODING),
        "Content-Encoding is {encoding:?}, want {SNAPPY_ENCODING:?}"
    );

    let content_type = request.header("content-type").unwrap_or_default();
    check!(
        scope,
        Must,
        "content-type",
        ProtocolVersion::from_content_type(content_type) == Some(expect.version),
        "Content-Type {content_type:?} doesn't match protocol {}",
        expect.version
    );

    let version = request.header(VERSION_HEADER).unwrap_or_default();
    check!(
        scope,
        Must,
        "version-header",
        ProtocolVersion::from_header_value(version) == Some(expect.version),
        "{VERSION_HEADER} is {version:?}, want {:?}",
        expect.version.header_value()
    );

    let user_agent = request.header("user-agent").unwrap_or_default();
    check!(
        scope,
        Must,
        "user-agent",
        !user_agent.trim().is_empty(),
        "User-Agent is missing"
    );

    if let Some(path) = &expect.write_path {
        check!(
            scope,
            Should,
            "write-path",
            request.path == *path,
            "request sent to {}, want {path}",
            request.path
        );
    }
}

pub fn validate_request(request: &CapturedRequest, expect: &Expectations, report: &mut Report) {
    let mut scope = report.request(request.index);
    validate_headers(request, expect, &mut scope);

    match &request.decoded {
        Ok(message) => {
            scope.record(Level::Must, "request-decoded", true, String::new());
            validate_message(message, &mut scope);
        }
        Err(err) => {
            check!(
                scope,
                Must,
                "request-decoded",
                false,
                "request {} could not be parsed: {err}",
                request.index
            );
        }
    }
}

pub fn expect_min_requests(requests: &[Arc<CapturedRequest>], n: usize, report: &mut Report) -> bool {
    check!(
        report.scope(),
        Must,
        "request-count",
        requests.len() >= n,
        "insufficient requests captured: got {}, want at least {n}",
        requests.len()
    )
}

/// Run every check over a captured conversation.
pub fn validate_requests(requests: &[Arc<CapturedRequest>], expect: &Expectations) -> Report {
    let mut report = Report::new();
    expect_min_requests(requests, expect.min_requests, &mut report);
    for request in requests {
        validate_request(request, expect, &mut report);
    }
    report
}

/// First series named `name` across all decoded requests.
pub fn find_series<'a>(requests: &'a [Arc<CapturedRequest>], name: &str) -> Option<Series<'a>> {
    requests
        .iter()
        .filter_map(|r| r.message())
        .find_map(|m| m.find(name))
}

/// True when `base` arrived either as a native histogram series or as a
/// classic histogram. A classic histogram needs a `_bucket` series, so a
/// summary's `_count`/`_sum` alone don't count.
pub fn has_histogram_data(requests: &[Arc<CapturedRequest>], base: &str) -> bool {
    let bucket = format!("{base}_bucket");
    requests
        .iter()
        .filter_map(|r| r.message())
        .flat_map(|m| m.time_series_list())
        .any(|s| match s.metric_name() {
            Some(name) if name == base => !s.histograms().is_empty(),
            Some(name) => name == bucket,
            None => false,
        })
}

pub fn total_samples(requests: &[Arc<CapturedRequest>]) -> u64 {
    requests.iter().map(|r| r.counts().samples).sum()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{IndexedMessage, MessageBuilder};
    use crate::proto::v1;
    use crate::testhelper::{self, TS};

    fn report_for(message: &WireMessage) -> Report {
        let mut report = Report::new();
        validate_message(message, &mut report.request(0));
        report
    }

    #[test]
    fn test_conforming_messages_pass() {
        for version in [ProtocolVersion::V1, ProtocolVersion::V2] {
            let mut builder = MessageBuilder::new(version);
            builder
                .series(&[("__name__", "test_metric"), ("b", "2"), ("a", "1")])
                .sample(1.0, TS)
                .sample(f64::NAN, TS + 1000)
                .exemplar(&[("trace_id", "abc")], 1.0, TS)
                .metadata(MetricType::Gauge, Some("A test metric."), None);
            let report = report_for(&builder.build().unwrap());

            assert!(report.passed(), "version {version}: {:?}", report.failures().collect::<Vec<_>>());
            assert_eq!(0, report.warnings().count(), "version {version}");
        }
    }

    #[test]
    fn test_stale_markers() {
        struct TestCase {
            name: &'static str,
            samples: Vec<(f64, i64)>,
            expected: Option<bool>,
        }

        let stale = f64::from_bits(util::STALE_NAN_BITS);
        let tc = vec![
            TestCase {
                name: "no NaN, no check",
                samples: vec![(1.0, TS), (2.0, TS + 1000)],
                expected: None,
            },
            TestCase {
                name: "ends with the exact stale bits",
                samples: vec![(1.0, TS), (stale, TS + 1000)],
                expected: Some(true),
            },
            TestCase {
                name: "ends with a plain NaN",
                samples: vec![(1.0, TS), (f64::NAN, TS + 1000)],
                expected: Some(true),
            },
            TestCase {
                name: "marker shares a timestamp with a value",
                samples: vec![(1.0, TS), (stale, TS)],
                expected: Some(false),
            },
        ];

        for case in tc {
            let name = case.name;
            let mut builder = MessageBuilder::new(ProtocolVersion::V2);
            let series = builder.series(&[("__name__", "stale_metric")]);
            for (value, ts) in case.samples {
                series.sample(value, ts);
            }
            let report = report_for(&builder.build().unwrap());

            let finding = report
                .findings()
                .iter()
                .find(|f| f.check == "sample-stale-marker");
            assert_eq!(case.expected, finding.map(|f| f.passed), "test case: {name}");
            if let Some(f) = finding {
                assert_eq!(Level::Should, f.level, "test case: {name}");
            }
            assert!(report.passed(), "test case: {name} - only a SHOULD");
        }
    }

    #[test]
    fn test_indexed_violations() {
        struct TestCase {
            name: &'static str,
            mutate: fn(&mut IndexedMessage),
            expected: &'static str,
        }

        // Series 0 of `indexed_message` is [1, 2, 3, 4] over
        // ["", "__name__", "http_requests_total", "code", "200", "500"].
        let tc = vec![
            TestCase {
                name: "unsorted labels",
                mutate: |m| m.timeseries[0].labels_refs = vec![3, 4, 1, 2],
                expected: "labels-sorted",
            },
            TestCase {
                name: "duplicate label name",
                mutate: |m| m.timeseries[0].labels_refs = vec![1, 2, 3, 4, 3, 5],
                expected: "labels-unique",
            },
            TestCase {
                name: "missing name",
                mutate: |m| m.timeseries[0].labels_refs = vec![3, 4],
                expected: "metric-name",
            },
            TestCase {
                name: "odd length refs",
                mutate: |m| m.timeseries[0].labels_refs.push(1),
                expected: "label-refs-even",
            },
            TestCase {
                name: "ref equal to table len",
                mutate: |m| {
                    let len = m.symbols.len() as u32;
                    m.timeseries[0].labels_refs.extend([len, 1]);
                },
                expected: "label-refs-valid",
            },
            TestCase {
                name: "duplicate symbol",
                mutate: |m| {
                    let mut symbols = m.symbols.as_slice().to_vec();
                    symbols.push("code".to_string());
                    m.symbols = SymbolTable::from_wire(symbols);
                },
                expected: "symbols-unique",
            },
            TestCase {
                name: "first symbol not empty",
                mutate: |m| {
                    let mut symbols = m.symbols.as_slice().to_vec();
                    symbols[0] = "oops".to_string();
                    m.symbols = SymbolTable::from_wire(symbols);
                },
                expected: "symbols-empty-first",
            },
            TestCase {
                name: "series without a symbol table",
                mutate: |m| m.symbols = SymbolTable::from_wire(Vec::new()),
                expected: "symbols-empty-first",
            },
            TestCase {
                name: "samples and histograms",
                mutate: |m| m.timeseries[0].histograms.push(testhelper::native_histogram(TS)),
                expected: "samples-histograms-exclusive",
            },
            TestCase {
                name: "no data",
                mutate: |m| m.timeseries[0].samples.clear(),
                expected: "series-has-data",
            },
            TestCase {
                name: "timestamp in seconds",
                mutate: |m| m.timeseries[0].samples[0].timestamp = TS / 1000,
                expected: "sample-timestamp-millis",
            },
            TestCase {
                name: "timestamps go backwards",
                mutate: |m| {
                    m.timeseries[0].samples.push(v2::Sample {
                        value: 1.0,
                        timestamp: TS - 1000,
                    })
                },
                expected: "sample-timestamps-ordered",
            },
            TestCase {
                name: "bad help ref",
                mutate: |m| {
                    m.timeseries[0].metadata = Some(v2::Metadata {
                        r#type: v2::metadata::MetricType::Counter as i32,
                        help_ref: 99,
                        unit_ref: 0,
                    })
                },
                expected: "metadata-refs",
            },
            TestCase {
                name: "odd exemplar refs",
                mutate: |m| {
                    m.timeseries[0].exemplars.push(v2::Exemplar {
                        labels_refs: vec![3],
                        value: 1.0,
                        timestamp: TS,
                    })
                },
                expected: "exemplar-refs",
            },
        ];

        for case in tc {
            let name = case.name;
            let mut message = testhelper::indexed_message();
            let WireMessage::Indexed(m) = &mut message else {
                unreachable!()
            };
            (case.mutate)(m);

            let report = report_for(&message);
            assert!(report.failed(case.expected), "test case: {name} - {:?}", report.findings());
            assert!(!report.passed(), "test case: {name} - is a MUST");
        }
    }

    #[test]
    fn test_empty_symbol_table() {
        let mut message = testhelper::indexed_message();
        if let WireMessage::Indexed(m) = &mut message {
            m.symbols = SymbolTable::from_wire(Vec::new());
        }

        let report = report_for(&message);
        let finding = report
            .findings()
            .iter()
            .find(|f| f.check == "symbols-empty-first")
            .unwrap();
        assert!(!finding.passed);
        assert_eq!("symbol table is empty but 2 series reference it", finding.message);

        if let WireMessage::Indexed(m) = &mut message {
            m.timeseries.clear();
        }
        let report = report_for(&message);
        assert!(!report.failed("symbols-empty-first"), "no series, nothing to reference");
    }

    #[test]
    fn test_failure_names_location() {
        let mut message = testhelper::indexed_message();
        if let WireMessage::Indexed(m) = &mut message {
            m.timeseries[1].labels_refs.push(1);
        }

        let report = report_for(&message);
        let failure = report.failures().next().expect("a failure");
        assert_eq!("label-refs-even", failure.check);
        assert_eq!(Some(1), failure.location.series);
        assert_eq!("label reference list has odd length 5", failure.message);
        assert_eq!("request 0 series 1", failure.location.to_string());
    }

    #[test]
    fn test_legacy_duplicate_labels() {
        let mut message = testhelper::single_sample(ProtocolVersion::V1, "up", 1.0);
        if let WireMessage::Legacy(m) = &mut message {
            m.request.timeseries[0].labels.push(v1::Label::new("job", "again"));
        }

        let report = report_for(&message);
        assert!(report.failed("labels-unique"));
        assert!(!report.failed("labels-sorted"), "equal names are not out of order");
    }

    #[test]
    fn test_histogram_checks() {
        let mut bad_spans = testhelper::native_histogram(TS);
        bad_spans.positive_deltas.pop();

        let mut mixed_kind = testhelper::native_histogram(TS);
        mixed_kind.count = Some(v2::histogram::Count::CountFloat(6.0));
        mixed_kind.positive_counts = vec![1.0, 2.0, 2.0];
        mixed_kind.positive_deltas.clear();

        let mut builder = MessageBuilder::new(ProtocolVersion::V2);
        builder
            .series(&[("__name__", "good")])
            .histogram(testhelper::native_histogram(TS));
        builder.series(&[("__name__", "bad_spans")]).histogram(bad_spans);
        builder.series(&[("__name__", "mixed_kind")]).histogram(mixed_kind);
        let report = report_for(&builder.build().unwrap());

        let failed: Vec<(Option<usize>, &str)> = report
            .failures()
            .map(|f| (f.location.series, f.check))
            .collect();
        assert_eq!(
            vec![
                (Some(1), "histogram-spans"),
                (Some(2), "histogram-kind-consistent"),
            ],
            failed
        );
    }

    #[test]
    fn test_family_metadata_consistency() {
        let mut builder = MessageBuilder::new(ProtocolVersion::V2);
        builder
            .series(&[("__name__", "jobs_total"), ("job", "a")])
            .sample(1.0, TS)
            .metadata(MetricType::Counter, None, None);
        builder
            .series(&[("__name__", "jobs_total"), ("job", "b")])
            .sample(2.0, TS)
            .metadata(MetricType::Gauge, None, None);
        let report = report_for(&builder.build().unwrap());

        assert!(report.passed(), "only a SHOULD");
        assert!(report.failed("metadata-family-consistent"));
        assert_eq!(1, report.warnings().count());
    }

    #[test]
    fn test_request_checks() {
        struct TestCase {
            name: &'static str,
            request: CapturedRequest,
            expect: Expectations,
            expected_failures: Vec<&'static str>,
        }

        let tc = vec![
            TestCase {
                name: "conforming",
                request: testhelper::captured(ProtocolVersion::V2, 1.0),
                expect: Expectations::new(ProtocolVersion::V2).with_write_path(testhelper::WRITE_PATH),
                expected_failures: vec![],
            },
            TestCase {
                name: "wrong version",
                request: testhelper::captured(ProtocolVersion::V2, 1.0),
                expect: Expectations::new(ProtocolVersion::V1),
                expected_failures: vec!["content-type", "version-header"],
            },
            TestCase {
                name: "garbage body",
                request: testhelper::captured_garbage(),
                expect: Expectations::new(ProtocolVersion::V2),
                expected_failures: vec![
                    "content-encoding",
                    "content-type",
                    "version-header",
                    "user-agent",
                    "request-decoded",
                ],
            },
        ];

        for case in tc {
            let name = case.name;
            let mut report = Report::new();
            validate_request(&case.request, &case.expect, &mut report);

            let failed: Vec<&str> = report.failures().map(|f| f.check).collect();
            assert_eq!(case.expected_failures, failed, "test case: {name}");
        }
    }

    #[test]
    fn test_unparseable_request_message() {
        let mut request = testhelper::captured_garbage();
        request.index = 3;
        let mut report = Report::new();
        validate_request(&request, &Expectations::new(ProtocolVersion::V2), &mut report);

        let finding = report
            .failures()
            .find(|f| f.check == "request-decoded")
            .unwrap();
        assert!(finding.message.starts_with("request 3 could not be parsed"), "{}", finding.message);
    }

    #[test]
    fn test_insufficient_requests() {
        let report = validate_requests(&[], &Expectations::new(ProtocolVersion::V2));

        assert!(!report.passed());
        let finding = report.failures().next().unwrap();
        assert_eq!("request-count", finding.check);
        assert_eq!(
            "insufficient requests captured: got 0, want at least 1",
            finding.message
        );
    }

    #[test]
    fn test_query_helpers() {
        let mut classic = MessageBuilder::new(ProtocolVersion::V1);
        for (name, value) in [
            ("rpc_seconds_bucket", 3.0),
            ("rpc_seconds_count", 3.0),
            ("rpc_seconds_sum", 0.9),
        ] {
            classic.series(&[("__name__", name)]).sample(value, TS);
        }

        let mut native = MessageBuilder::new(ProtocolVersion::V2);
        native
            .series(&[("__name__", "latency")])
            .histogram(testhelper::native_histogram(TS));

        let mut summary = MessageBuilder::new(ProtocolVersion::V1);
        for (name, value) in [("gc_seconds_count", 4.0), ("gc_seconds_sum", 0.2)] {
            summary.series(&[("__name__", name)]).sample(value, TS);
        }

        let requests = vec![
            Arc::new(testhelper::captured_message(&classic.build().unwrap())),
            Arc::new(testhelper::captured_message(&native.build().unwrap())),
            Arc::new(testhelper::captured_message(&summary.build().unwrap())),
        ];

        assert!(has_histogram_data(&requests, "rpc_seconds"));
        assert!(has_histogram_data(&requests, "latency"));
        assert!(!has_histogram_data(&requests, "rpc"));
        assert!(!has_histogram_data(&requests, "missing"));
        assert!(!has_histogram_data(&requests, "gc_seconds"), "a summary is not a histogram");

        assert_eq!(5, total_samples(&requests));
        let found = find_series(&requests, "rpc_seconds_sum").unwrap();
        assert_eq!(0.9, found.samples()[0].value);
        assert!(find_series(&requests, "nope").is_none());
    }

    #[test]
    fn test_report_json() {
        let report = validate_requests(&[], &Expectations::new(ProtocolVersion::V1));
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

        assert_eq!("MUST", json["findings"][0]["level"]);
        assert_eq!("request-count", json["findings"][0]["check"]);
        assert_eq!(false, json["findings"][0]["passed"]);
    }
}

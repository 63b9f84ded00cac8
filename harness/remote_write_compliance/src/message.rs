//! The decoded form of a remote-write request, for both protocol versions.
//!
//! `WireMessage` is a tagged union. The uniform read API lives on `Series`,
//! which lets validation treat both versions alike. Symbol tables, native
//! histograms and created timestamps only exist in `IndexedMessage`; callers
//! that need them match on `WireMessage::Indexed` explicitly.

use serde::Serialize;
use smallvec::SmallVec;

use crate::error::ComplianceError;
use crate::exemplars::Exemplar;
use crate::proto::{v1, v2};
use crate::symbols::{LabelPairs, SymbolTable, SymbolTableBuilder};
use crate::transport::{ProtocolVersion, WrittenCounts};
use crate::util;
use crate::Result;

/// Label carrying the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A request in the legacy format, labels inline on every series.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LegacyMessage {
    pub request: v1::WriteRequest,
}

/// A request in the symbol-table format.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexedMessage {
    pub symbols: SymbolTable,
    pub timeseries: Vec<v2::TimeSeries>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WireMessage {
    Legacy(LegacyMessage),
    Indexed(IndexedMessage),
}

impl From<v1::WriteRequest> for WireMessage {
    fn from(request: v1::WriteRequest) -> Self {
        WireMessage::Legacy(LegacyMessage { request })
    }
}

impl From<v2::Request> for WireMessage {
    fn from(request: v2::Request) -> Self {
        WireMessage::Indexed(IndexedMessage {
            symbols: SymbolTable::from_wire(request.symbols),
            timeseries: request.timeseries,
        })
    }
}

impl IndexedMessage {
    pub fn to_request(&self) -> v2::Request {
        v2::Request {
            symbols: self.symbols.as_slice().to_vec(),
            timeseries: self.timeseries.clone(),
        }
    }
}

impl WireMessage {
    pub fn version(&self) -> ProtocolVersion {
        match self {
            WireMessage::Legacy(_) => ProtocolVersion::V1,
            WireMessage::Indexed(_) => ProtocolVersion::V2,
        }
    }

    /// Every series of the request, in wire order.
    pub fn time_series_list(&self) -> Vec<Series<'_>> {
        match self {
            WireMessage::Legacy(message) => message
                .request
                .timeseries
                .iter()
                .map(|series| Series::Legacy { message, series })
                .collect(),
            WireMessage::Indexed(message) => message
                .timeseries
                .iter()
                .map(|series| Series::Indexed { message, series })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            WireMessage::Legacy(m) => m.request.timeseries.len(),
            WireMessage::Indexed(m) => m.timeseries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The first series whose `__name__` is `name`.
    pub fn find(&self, name: &str) -> Option<Series<'_>> {
        self.time_series_list()
            .into_iter()
            .find(|s| s.metric_name() == Some(name))
    }

    /// Number of samples, histograms and exemplars the request carries.
    pub fn counts(&self) -> WrittenCounts {
        let mut counts = WrittenCounts::default();
        for series in self.time_series_list() {
            // CAST: no-op on 64-bit.
            counts.samples += series.sample_count() as u64;
            counts.histograms += series.histograms().len() as u64;
            counts.exemplars += series.exemplar_count() as u64;
        }
        counts
    }
}

/// Label pairs of one series, in wire order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSet<'a>(LabelPairs<'a>);

impl<'a> LabelSet<'a> {
    pub fn new(pairs: LabelPairs<'a>) -> Self {
        Self(pairs)
    }

    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.0.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }

    pub fn metric_name(&self) -> Option<&'a str> {
        self.get(METRIC_NAME_LABEL)
    }

    pub fn names(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.0.iter().map(|(n, _)| *n)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a str)> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when names are strictly ascending in byte order, which also rules
    /// out duplicates.
    pub fn is_sorted(&self) -> bool {
        self.0.windows(2).all(|w| w[0].0.as_bytes() < w[1].0.as_bytes())
    }

    /// Names that occur more than once.
    pub fn duplicate_names(&self) -> Vec<&'a str> {
        let mut names: SmallVec<[&str; 8]> = self.names().collect();
        names.sort_unstable();
        let mut dups: Vec<&str> = names
            .windows(2)
            .filter(|w| w[0] == w[1])
            .map(|w| w[0])
            .collect();
        dups.dedup();
        dups
    }
}

/// One float sample, normalized across versions.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Sample {
    pub value: f64,
    pub timestamp: i64,
    pub created_timestamp: Option<i64>,
}

impl Sample {
    pub fn new(value: f64, timestamp: i64) -> Self {
        Self {
            value,
            timestamp,
            created_timestamp: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    #[default]
    Unspecified,
    Counter,
    Gauge,
    Histogram,
    GaugeHistogram,
    Summary,
    Info,
    StateSet,
}

impl MetricType {
    pub fn from_v1(raw: i32) -> Self {
        use v1::metric_metadata::MetricType as T;
        match T::try_from(raw) {
            Ok(T::Counter) => MetricType::Counter,
            Ok(T::Gauge) => MetricType::Gauge,
            Ok(T::Histogram) => MetricType::Histogram,
            Ok(T::Gaugehistogram) => MetricType::GaugeHistogram,
            Ok(T::Summary) => MetricType::Summary,
            Ok(T::Info) => MetricType::Info,
            Ok(T::Stateset) => MetricType::StateSet,
            Ok(T::Unknown) | Err(_) => MetricType::Unspecified,
        }
    }

    pub fn from_v2(raw: i32) -> Self {
        use v2::metadata::MetricType as T;
        match T::try_from(raw) {
            Ok(T::Counter) => MetricType::Counter,
            Ok(T::Gauge) => MetricType::Gauge,
            Ok(T::Histogram) => MetricType::Histogram,
            Ok(T::Gaugehistogram) => MetricType::GaugeHistogram,
            Ok(T::Summary) => MetricType::Summary,
            Ok(T::Info) => MetricType::Info,
            Ok(T::Stateset) => MetricType::StateSet,
            Ok(T::Unspecified) | Err(_) => MetricType::Unspecified,
        }
    }

    pub fn to_v1(self) -> v1::metric_metadata::MetricType {
        use v1::metric_metadata::MetricType as T;
        match self {
            MetricType::Unspecified => T::Unknown,
            MetricType::Counter => T::Counter,
            MetricType::Gauge => T::Gauge,
            MetricType::Histogram => T::Histogram,
            MetricType::GaugeHistogram => T::Gaugehistogram,
            MetricType::Summary => T::Summary,
            MetricType::Info => T::Info,
            MetricType::StateSet => T::Stateset,
        }
    }

    pub fn to_v2(self) -> v2::metadata::MetricType {
        use v2::metadata::MetricType as T;
        match self {
            MetricType::Unspecified => T::Unspecified,
            MetricType::Counter => T::Counter,
            MetricType::Gauge => T::Gauge,
            MetricType::Histogram => T::Histogram,
            MetricType::GaugeHistogram => T::Gaugehistogram,
            MetricType::Summary => T::Summary,
            MetricType::Info => T::Info,
            MetricType::StateSet => T::Stateset,
        }
    }

    /// Parse the type word of a `# TYPE` exposition line.
    pub fn from_exposition(word: &str) -> Self {
        match word {
            "counter" => MetricType::Counter,
            "gauge" => MetricType::Gauge,
            "histogram" => MetricType::Histogram,
            "gaugehistogram" => MetricType::GaugeHistogram,
            "summary" => MetricType::Summary,
            "info" => MetricType::Info,
            "stateset" => MetricType::StateSet,
            _ => MetricType::Unspecified,
        }
    }
}

/// Metadata of a series with its text already resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata<'a> {
    pub metric_type: MetricType,
    pub help: Option<&'a str>,
    pub unit: Option<&'a str>,
}

/// A read-only view of one series of a `WireMessage`.
#[derive(Clone, Copy, Debug)]
pub enum Series<'a> {
    Legacy {
        message: &'a LegacyMessage,
        series: &'a v1::TimeSeries,
    },
    Indexed {
        message: &'a IndexedMessage,
        series: &'a v2::TimeSeries,
    },
}

impl<'a> Series<'a> {
    /// The label set in wire order. Fails only for symbol-table requests whose
    /// references don't resolve.
    pub fn labels(&self) -> Result<LabelSet<'a>> {
        match *self {
            Series::Legacy { series, .. } => Ok(LabelSet(
                series
                    .labels
                    .iter()
                    .map(|l| (l.name.as_str(), l.value.as_str()))
                    .collect(),
            )),
            Series::Indexed { message, series } => message
                .symbols
                .resolve_pairs(&series.labels_refs)
                .map(LabelSet),
        }
    }

    /// The `__name__` label, if present and resolvable.
    pub fn metric_name(&self) -> Option<&'a str> {
        self.labels().ok().and_then(|l| l.metric_name())
    }

    pub fn samples(&self) -> Vec<Sample> {
        match *self {
            Series::Legacy { series, .. } => series
                .samples
                .iter()
                .map(|s| Sample::new(s.value, s.timestamp))
                .collect(),
            Series::Indexed { series, .. } => {
                let created = (series.created_timestamp != 0).then_some(series.created_timestamp);
                series
                    .samples
                    .iter()
                    .map(|s| Sample {
                        value: s.value,
                        timestamp: s.timestamp,
                        created_timestamp: created,
                    })
                    .collect()
            }
        }
    }

    pub fn sample_count(&self) -> usize {
        match *self {
            Series::Legacy { series, .. } => series.samples.len(),
            Series::Indexed { series, .. } => series.samples.len(),
        }
    }

    /// Native histograms. Always empty for the legacy format.
    pub fn histograms(&self) -> &'a [v2::Histogram] {
        match *self {
            Series::Legacy { .. } => &[],
            Series::Indexed { series, .. } => &series.histograms,
        }
    }

    pub fn exemplars(&self) -> Result<Vec<Exemplar<'a>>> {
        match *self {
            Series::Legacy { series, .. } => {
                Ok(series.exemplars.iter().map(Exemplar::from_v1).collect())
            }
            Series::Indexed { message, series } => series
                .exemplars
                .iter()
                .map(|e| Exemplar::from_v2(e, &message.symbols))
                .collect(),
        }
    }

    pub fn exemplar_count(&self) -> usize {
        match *self {
            Series::Legacy { series, .. } => series.exemplars.len(),
            Series::Indexed { series, .. } => series.exemplars.len(),
        }
    }

    /// Metadata for the series. Legacy requests carry it per family, so it is
    /// looked up by family name.
    pub fn metadata(&self) -> Result<Option<Metadata<'a>>> {
        match *self {
            Series::Legacy { message, .. } => {
                let Some(name) = self.metric_name() else {
                    return Ok(None);
                };
                let family = util::family_name(name);
                let found = message.request.metadata.iter().find(|m| {
                    m.metric_family_name == family
                        || m.metric_family_name == name
                        || m.metric_family_name == util::strip_classic_suffix(name)
                });
                Ok(found.map(|m| Metadata {
                    metric_type: MetricType::from_v1(m.r#type),
                    help: (!m.help.is_empty()).then_some(m.help.as_str()),
                    unit: (!m.unit.is_empty()).then_some(m.unit.as_str()),
                }))
            }
            Series::Indexed { message, series } => {
                let Some(meta) = series.metadata.as_ref() else {
                    return Ok(None);
                };
                Ok(Some(Metadata {
                    metric_type: MetricType::from_v2(meta.r#type),
                    help: message.symbols.decode_optional(meta.help_ref)?,
                    unit: message.symbols.decode_optional(meta.unit_ref)?,
                }))
            }
        }
    }

    /// True when the series carries both float samples and native histograms.
    pub fn mixes_samples_and_histograms(&self) -> bool {
        self.sample_count() > 0 && !self.histograms().is_empty()
    }
}

/// Assembles a `WireMessage` for either version from plain label sets.
///
/// Labels are sorted by name and symbols interned on `build`, the way a
/// conforming sender would. Malformed fixtures are built by editing the
/// resulting message's proto fields directly.
#[derive(Debug)]
pub struct MessageBuilder {
    version: ProtocolVersion,
    series: Vec<SeriesBuilder>,
}

#[derive(Clone, Debug, Default)]
pub struct SeriesBuilder {
    labels: Vec<(String, String)>,
    samples: Vec<Sample>,
    histograms: Vec<v2::Histogram>,
    exemplars: Vec<(Vec<(String, String)>, f64, i64)>,
    metadata: Option<(MetricType, Option<String>, Option<String>)>,
    created_timestamp: i64,
}

impl SeriesBuilder {
    pub fn sample(&mut self, value: f64, timestamp: i64) -> &mut Self {
        self.samples.push(Sample::new(value, timestamp));
        self
    }

    pub fn histogram(&mut self, histogram: v2::Histogram) -> &mut Self {
        self.histograms.push(histogram);
        self
    }

    pub fn exemplar(&mut self, labels: &[(&str, &str)], value: f64, timestamp: i64) -> &mut Self {
        self.exemplars.push((owned_pairs(labels), value, timestamp));
        self
    }

    pub fn metadata(&mut self, metric_type: MetricType, help: Option<&str>, unit: Option<&str>) -> &mut Self {
        self.metadata = Some((
            metric_type,
            help.map(str::to_string),
            unit.map(str::to_string),
        ));
        self
    }

    pub fn created_timestamp(&mut self, ts: i64) -> &mut Self {
        self.created_timestamp = ts;
        self
    }

    fn sorted_labels(&self) -> Vec<(&str, &str)> {
        let mut labels: Vec<(&str, &str)> = self
            .labels
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_str()))
            .collect();
        labels.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
        labels
    }
}

fn owned_pairs(labels: &[(&str, &str)]) -> Vec<(String, String)> {
    labels
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect()
}

impl MessageBuilder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            series: Vec::new(),
        }
    }

    /// Start a new series with the given labels, `__name__` included.
    pub fn series(&mut self, labels: &[(&str, &str)]) -> &mut SeriesBuilder {
        self.series.push(SeriesBuilder {
            labels: owned_pairs(labels),
            ..Default::default()
        });
        let last = self.series.len() - 1;
        &mut self.series[last]
    }

    /// The series most recently started with `series`.
    pub fn last_series(&mut self) -> Option<&mut SeriesBuilder> {
        self.series.last_mut()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn build(self) -> Result<WireMessage> {
        match self.version {
            ProtocolVersion::V1 => self.build_legacy(),
            ProtocolVersion::V2 => self.build_indexed(),
        }
    }

    fn build_legacy(self) -> Result<WireMessage> {
        let mut request = v1::WriteRequest::default();

        for s in &self.series {
            if !s.histograms.is_empty() {
                return Err(ComplianceError::Other(
                    "native histograms need the symbol-table format".to_string(),
                ));
            }

            request.timeseries.push(v1::TimeSeries {
                labels: s
                    .sorted_labels()
                    .into_iter()
                    .map(|(n, v)| v1::Label::new(n, v))
                    .collect(),
                samples: s
                    .samples
                    .iter()
                    .map(|x| v1::Sample {
                        value: x.value,
                        timestamp: x.timestamp,
                    })
                    .collect(),
                exemplars: s
                    .exemplars
                    .iter()
                    .map(|(labels, value, timestamp)| v1::Exemplar {
                        labels: labels.iter().map(|(n, v)| v1::Label::new(n, v)).collect(),
                        value: *value,
                        timestamp: *timestamp,
                    })
                    .collect(),
            });

            if let Some((metric_type, help, unit)) = &s.metadata {
                let name = s
                    .labels
                    .iter()
                    .find(|(n, _)| n == METRIC_NAME_LABEL)
                    .map(|(_, v)| v.as_str())
                    .unwrap_or_default();
                let family = util::family_name(name).to_string();
                if request
                    .metadata
                    .iter()
                    .all(|m| m.metric_family_name != family)
                {
                    request.metadata.push(v1::MetricMetadata {
                        r#type: metric_type.to_v1() as i32,
                        metric_family_name: family,
                        help: help.clone().unwrap_or_default(),
                        unit: unit.clone().unwrap_or_default(),
                    });
                }
            }
        }

        Ok(WireMessage::from(request))
    }

    fn build_indexed(self) -> Result<WireMessage> {
        let mut symbols = SymbolTableBuilder::new();
        let mut timeseries = Vec::with_capacity(self.series.len());

        for s in &self.series {
            let labels_refs = symbols.intern_pairs(s.sorted_labels())?;

            let mut exemplars = Vec::with_capacity(s.exemplars.len());
            for (labels, value, timestamp) in &s.exemplars {
                exemplars.push(v2::Exemplar {
                    labels_refs: symbols
                        .intern_pairs(labels.iter().map(|(n, v)| (n.as_str(), v.as_str())))?,
                    value: *value,
                    timestamp: *timestamp,
                });
            }

            let metadata = match &s.metadata {
                Some((metric_type, help, unit)) => Some(v2::Metadata {
                    r#type: metric_type.to_v2() as i32,
                    help_ref: symbols.intern_optional(help.as_deref())?,
                    unit_ref: symbols.intern_optional(unit.as_deref())?,
                }),
                None => None,
            };

            timeseries.push(v2::TimeSeries {
                labels_refs,
                samples: s
                    .samples
                    .iter()
                    .map(|x| v2::Sample {
                        value: x.value,
                        timestamp: x.timestamp,
                    })
                    .collect(),
                histograms: s.histograms.clone(),
                exemplars,
                metadata,
                created_timestamp: s.created_timestamp,
            });
        }

        Ok(WireMessage::Indexed(IndexedMessage {
            symbols: symbols.build(),
            timeseries,
        }))
    }
}

use crate::message::LabelSet;
use crate::proto::{v1, v2};
use crate::symbols::SymbolTable;
use crate::Result;

/// The combined length of an exemplar's label names and values must not
/// exceed this many UTF-8 code points.
pub const EXEMPLAR_MAX_LABEL_RUNES: usize = 128;

/// An exemplar with its labels resolved, normalized across versions.
#[derive(Clone, Debug, PartialEq)]
pub struct Exemplar<'a> {
    pub labels: LabelSet<'a>,
    pub value: f64,
    pub timestamp: i64,
}

impl<'a> Exemplar<'a> {
    pub fn from_v1(exemplar: &'a v1::Exemplar) -> Self {
        Self {
            labels: LabelSet::new(
                exemplar
                    .labels
                    .iter()
                    .map(|l| (l.name.as_str(), l.value.as_str()))
                    .collect(),
            ),
            value: exemplar.value,
            timestamp: exemplar.timestamp,
        }
    }

    /// Resolve an exemplar of a symbol-table request. Fails on odd-length or
    /// out-of-range references.
    pub fn from_v2(exemplar: &'a v2::Exemplar, symbols: &'a SymbolTable) -> Result<Self> {
        Ok(Self {
            labels: LabelSet::new(symbols.resolve_pairs(&exemplar.labels_refs)?),
            value: exemplar.value,
            timestamp: exemplar.timestamp,
        })
    }

    /// Code points across all label names and values.
    pub fn label_runes(&self) -> usize {
        self.labels
            .iter()
            .map(|(n, v)| n.chars().count() + v.chars().count())
            .sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ComplianceError;

    #[test]
    fn test_from_v2() {
        let symbols = SymbolTable::encode(["trace_id", "0af7651916cd43dd8448eb211c80319c"]);
        let exemplar = v2::Exemplar {
            labels_refs: vec![1, 2],
            value: 0.25,
            timestamp: 1_700_000_000_000,
        };

        let resolved = Exemplar::from_v2(&exemplar, &symbols).unwrap();
        assert_eq!(
            Some("0af7651916cd43dd8448eb211c80319c"),
            resolved.labels.get("trace_id")
        );
        assert_eq!(40, resolved.label_runes());
    }

    #[test]
    fn test_from_v2_bad_refs() {
        let symbols = SymbolTable::encode(["trace_id"]);

        let odd = v2::Exemplar {
            labels_refs: vec![1],
            ..Default::default()
        };
        assert_eq!(
            Err(ComplianceError::OddLength(1)),
            Exemplar::from_v2(&odd, &symbols)
        );

        let out_of_range = v2::Exemplar {
            labels_refs: vec![1, 2],
            ..Default::default()
        };
        assert!(Exemplar::from_v2(&out_of_range, &symbols).is_err());
    }

    #[test]
    fn test_from_v1() {
        let exemplar = v1::Exemplar {
            labels: vec![v1::Label::new("span_id", "b7ad6b7169203331")],
            value: 2.0,
            timestamp: 1_700_000_000_000,
        };

        let resolved = Exemplar::from_v1(&exemplar);
        assert_eq!(Some("b7ad6b7169203331"), resolved.labels.get("span_id"));
        assert_eq!(2.0, resolved.value);
    }
}

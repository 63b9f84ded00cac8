use hashbrown::hash_map::RawEntryMut;
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::error::ComplianceError;
use crate::util;
use crate::Result;

/// Resolved `(name, value)` pairs, in the order the references listed them.
pub type LabelPairs<'a> = SmallVec<[(&'a str, &'a str); 8]>;

/// The string-interning table of a symbol-table request.
///
/// Index 0 is the empty string. A table built with `encode` or
/// `SymbolTableBuilder` never holds the same non-empty string twice. A table
/// taken off the wire with `from_wire` is kept exactly as sent, duplicates and
/// all, so that validation can report on it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SymbolTable(Vec<String>);

impl SymbolTable {
    /// Build a table holding `""` at index 0 followed by every distinct string
    /// of `strings` in first-seen order.
    pub fn encode<I, S>(strings: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = SymbolTableBuilder::new();
        for s in strings {
            // Tables beyond u32::MAX entries can't be referenced anyway.
            if builder.intern(s.as_ref()).is_err() {
                break;
            }
        }
        builder.build()
    }

    /// Wrap the symbols of a decoded request without normalizing them.
    pub fn from_wire(symbols: Vec<String>) -> Self {
        Self(symbols)
    }

    /// Look up the string at `index`.
    pub fn decode(&self, index: u32) -> Result<&str> {
        // CAST: no-op on 32-bit, widening on 64-bit.
        self.0
            .get(index as usize)
            .map(String::as_str)
            .ok_or_else(|| ComplianceError::out_of_range(index, self.0.len()))
    }

    /// Resolve a flat reference list into `(name, value)` pairs.
    ///
    /// Pairs come back in reference order. Nothing is sorted or deduplicated,
    /// that is for validation to judge.
    pub fn resolve_pairs(&self, refs: &[u32]) -> Result<LabelPairs<'_>> {
        if refs.len() % 2 != 0 {
            return Err(ComplianceError::OddLength(refs.len()));
        }

        let resolve = |position: usize| {
            let reference = refs[position];
            self.decode(reference)
                .map_err(|_| ComplianceError::InvalidReference {
                    position,
                    reference,
                    len: self.0.len(),
                })
        };

        let mut pairs = LabelPairs::with_capacity(refs.len() / 2);
        for position in (0..refs.len()).step_by(2) {
            pairs.push((resolve(position)?, resolve(position + 1)?));
        }
        Ok(pairs)
    }

    /// Resolve an optional reference where 0 means absent.
    pub fn decode_optional(&self, index: u32) -> Result<Option<&str>> {
        match index {
            0 => Ok(None),
            i => self.decode(i).map(Some),
        }
    }

    /// Non-empty strings that appear more than once, with every index they occupy.
    pub fn duplicates(&self) -> Vec<(&str, Vec<usize>)> {
        let mut seen: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, s) in self.0.iter().enumerate() {
            if s.is_empty() {
                continue;
            }
            seen.entry(s.as_str()).or_default().push(i);
        }

        let mut dups: Vec<_> = seen
            .into_iter()
            .filter(|(_, positions)| positions.len() > 1)
            .collect();
        dups.sort_unstable_by_key(|(_, positions)| positions[0]);
        dups
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<String> {
        self.0
    }
}

/// Interns strings one at a time, handing back their index.
#[derive(Debug)]
pub struct SymbolTableBuilder {
    symbols: Vec<String>,
    index: HashMap<String, u32>,
}

impl Default for SymbolTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTableBuilder {
    pub fn new() -> Self {
        let mut index = HashMap::new();
        index.insert(String::new(), 0);

        Self {
            symbols: vec![String::new()],
            index,
        }
    }

    /// Return the index of `s`, adding it to the table if it's new.
    pub fn intern(&mut self, s: &str) -> Result<u32> {
        // Look up by `&str` first so a hit doesn't allocate.
        match self.index.raw_entry_mut().from_key(s) {
            RawEntryMut::Occupied(entry) => Ok(*entry.get()),
            RawEntryMut::Vacant(entry) => {
                let next = util::cast_chk::<_, u32>(self.symbols.len(), "symbol index")?;
                entry.insert(s.to_owned(), next);
                self.symbols.push(s.to_owned());
                Ok(next)
            }
        }
    }

    /// Intern a label set, returning its flat reference list.
    pub fn intern_pairs<'a, I>(&mut self, pairs: I) -> Result<Vec<u32>>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut refs = Vec::new();
        for (name, value) in pairs {
            refs.push(self.intern(name)?);
            refs.push(self.intern(value)?);
        }
        Ok(refs)
    }

    /// Like `intern`, but 0 for an absent or empty string.
    pub fn intern_optional(&mut self, s: Option<&str>) -> Result<u32> {
        match s {
            None => Ok(0),
            Some(s) => self.intern(s),
        }
    }

    pub fn build(self) -> SymbolTable {
        SymbolTable(self.symbols)
    }
}

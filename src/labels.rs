//! Label sets: the identity of a series.
//!
//! A [`Labels`] value is an immutable list of `(name, value)` pairs sorted by name with
//! unique names. Two label sets are equal iff their sorted sequences are equal, and
//! [`Labels::fingerprint`] is a stable hash over that sequence.

use crate::error::HeadError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use xxhash_rust::xxh3::Xxh3;

const SEP: u8 = 0xff;

/// A single label pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Canonical, sorted label set. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<Label>", into = "Vec<Label>")]
pub struct Labels(Arc<[Label]>);

impl Labels {
    /// Builds a label set from unordered pairs. Fails if a name appears twice.
    pub fn new<I, N, V>(pairs: I) -> Result<Self, HeadError>
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        let labels: Vec<Label> = pairs
            .into_iter()
            .map(|(n, v)| Label::new(n, v))
            .collect();
        Self::try_from(labels)
    }

    /// Builds a label set from alternating names and values: `["a", "1", "b", "2"]`.
    pub fn from_strings(ss: &[&str]) -> Result<Self, HeadError> {
        if ss.len() % 2 != 0 {
            return Err(HeadError::InvalidLabels(format!(
                "odd number of strings: {}",
                ss.len()
            )));
        }
        Self::new(ss.chunks_exact(2).map(|kv| (kv[0], kv[1])))
    }

    /// The empty label set. Never accepted by an appender, but useful as a placeholder.
    pub fn empty() -> Self {
        Labels(Arc::from(Vec::new()))
    }

    /// Stable 64-bit hash over the sorted pairs.
    pub fn fingerprint(&self) -> u64 {
        let mut h = Xxh3::new();
        for l in self.0.iter() {
            h.update(l.name.as_bytes());
            h.update(&[SEP]);
            h.update(l.value.as_bytes());
            h.update(&[SEP]);
        }
        h.digest()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Label] {
        &self.0
    }
}

impl TryFrom<Vec<Label>> for Labels {
    type Error = HeadError;

    fn try_from(mut labels: Vec<Label>) -> Result<Self, Self::Error> {
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        if let Some(w) = labels.windows(2).find(|w| w[0].name == w[1].name) {
            return Err(HeadError::InvalidLabels(format!(
                "duplicate label name {:?}",
                w[0].name
            )));
        }
        Ok(Labels(Arc::from(labels)))
    }
}

impl From<Labels> for Vec<Label> {
    fn from(labels: Labels) -> Self {
        labels.0.to_vec()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, l) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={:?}", l.name, l.value)?;
        }
        f.write_str("}")
    }
}

mod label_key;
mod matchers;

use crate::common::types::Label;
use crate::common::METRIC_NAME_LABEL;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

pub use label_key::*;
pub use matchers::*;

cfg_if::cfg_if! {
    if #[cfg(test)] {
    }
}

/// Hash of a label subset. Two label sets with equal signatures agree on every label the
/// signature was computed over.
pub type Signature = u64;

const SEP: u8 = 0xff;

/// Immutable set of labels ordered by name with unique names. The metric name, when
/// present, is stored as the `__name__` label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        // last write wins on duplicate names
        let mut deduped: Vec<Label> = Vec::with_capacity(labels.len());
        for label in labels {
            match deduped.last_mut() {
                Some(last) if last.name == label.name => *last = label,
                _ => deduped.push(label),
            }
        }
        Labels(deduped)
    }

    pub fn empty() -> Self {
        Labels(Vec::new())
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Labels::new(pairs.iter().map(|(n, v)| Label::new(*n, *v)).collect())
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

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|idx| self.0[idx].value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    pub fn with(&self, name: &str, value: &str) -> Labels {
        let mut labels = self.0.clone();
        match labels.binary_search_by(|l| l.name.as_str().cmp(name)) {
            Ok(idx) => labels[idx].value = value.to_string(),
            Err(idx) => labels.insert(idx, Label::new(name, value)),
        }
        Labels(labels)
    }

    pub fn without(&self, name: &str) -> Labels {
        Labels(self.0.iter().filter(|l| l.name != name).cloned().collect())
    }

    pub fn without_metric_name(&self) -> Labels {
        self.without(METRIC_NAME_LABEL)
    }

    /// Keeps only the named labels (`by` grouping).
    pub fn keep_only(&self, names: &[String]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| names.iter().any(|n| n == &l.name))
                .cloned()
                .collect(),
        )
    }

    /// Drops the named labels and the metric name (`without` grouping).
    pub fn drop_names(&self, names: &[String]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| l.name != METRIC_NAME_LABEL && !names.iter().any(|n| n == &l.name))
                .cloned()
                .collect(),
        )
    }

    /// Hash over every label, metric name included.
    pub fn hash_all(&self) -> Signature {
        let mut hasher = Xxh3::new();
        for label in self.0.iter() {
            write_label(&mut hasher, label);
        }
        hasher.digest()
    }

    /// Signature over the named labels (`exclude == false`) or over every label except the
    /// named ones and the metric name (`exclude == true`).
    pub fn signature(&self, names: &[String], exclude: bool) -> Signature {
        let mut hasher = Xxh3::new();
        for label in self.0.iter() {
            let listed = names.iter().any(|n| n == &label.name);
            let include = if exclude {
                !listed && label.name != METRIC_NAME_LABEL
            } else {
                listed
            };
            if include {
                write_label(&mut hasher, label);
            }
        }
        hasher.digest()
    }

    pub fn into_vec(self) -> Vec<Label> {
        self.0
    }
}

fn write_label(hasher: &mut Xxh3, label: &Label) {
    hasher.update(label.name.as_bytes());
    hasher.update(&[SEP]);
    hasher.update(label.value.as_bytes());
    hasher.update(&[SEP]);
}

impl From<Vec<Label>> for Labels {
    fn from(labels: Vec<Label>) -> Self {
        Labels::new(labels)
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.metric_name().unwrap_or_default();
        let rest: Vec<Label> = self
            .0
            .iter()
            .filter(|l| l.name != METRIC_NAME_LABEL)
            .cloned()
            .collect();
        let formatted = crate::series::format_prometheus_metric_name(name, &rest);
        if formatted.is_empty() {
            write!(f, "{{}}")
        } else {
            write!(f, "{formatted}")
        }
    }
}

/// Serializes as the Prometheus `metric` object.
impl Serialize for Labels {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for label in self.0.iter() {
            map.serialize_entry(&label.name, &label.value)?;
        }
        map.end()
    }
}

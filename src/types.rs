//! Runtime value types shared by the resolvers, the realigner and the store.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Reserved label holding the metric name.
pub const NAME_LABEL: &str = "__name__";

/// Label name/value pairs identifying one series.
///
/// Ordered so tag-sets can be used directly as grouping and join keys.
pub type TagSet = BTreeMap<String, String>;

/// One value for one series at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Labels, including `__name__` when the sample came from a selector.
    pub labels: TagSet,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    /// Labels without the metric name, i.e. the sample's tag-set.
    pub fn tag_set(&self) -> TagSet {
        self.labels
            .iter()
            .filter(|(k, _)| k.as_str() != NAME_LABEL)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn metric_name(&self) -> Option<&str> {
        self.labels.get(NAME_LABEL).map(|s| s.as_str())
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} => {} @ {}",
            format_labels(&self.labels),
            self.value,
            self.timestamp
        )
    }
}

/// One value per distinct tag-set at a single instant.
pub type InstantVector = Vec<Sample>;

/// Time-ascending points for one tag-set; no duplicate timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub labels: TagSet,
    pub points: Vec<(i64, f64)>,
}

impl fmt::Display for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} =>", format_labels(&self.labels))?;
        for (t, v) in &self.points {
            write!(f, " {v}@{t}")?;
        }
        Ok(())
    }
}

/// An ordered sequence of values per distinct tag-set over a time window.
pub type RangeVector = Vec<Series>;

/// A raw row returned by the relational store, already renamed into the
/// canonical `timestamp`/`value` shape; every remaining column is a tag.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRow {
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    pub value: f64,
    pub tags: TagSet,
}

/// Inclusive evaluation window, unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

/// Render a label set the way selectors are written: `{a="1", b="2"}`.
pub fn format_labels(labels: &TagSet) -> String {
    let inner = labels
        .iter()
        .map(|(k, v)| format!("{k}={v:?}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{inner}}}")
}

//! Event filters and the predicate compiler.
//!
//! A filter is a conjunction across dimensions (ids, authors, kinds, tags,
//! time bounds) and a disjunction within each dimension's value set. An
//! empty value set places no constraint on its dimension.
//!
//! Filters arrive in the nostr wire shape:
//!
//! ```json
//! {"ids": ["..."], "authors": ["..."], "kinds": [30302], "#sid": ["0x..."],
//!  "since": 1700000000, "until": 1800000000, "limit": 50}
//! ```

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use crate::error::FormatError;
use crate::event::ActivityEvent;

/// Selection criteria for stored events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Accepted event ids.
    pub ids: Vec<String>,
    /// Accepted author keys.
    pub authors: Vec<String>,
    /// Accepted kinds.
    pub kinds: Vec<u32>,
    /// Tag name (without `#`) to accepted values.
    pub tags: BTreeMap<String, Vec<String>>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<i64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<i64>,
    /// Maximum number of events a query yields.
    pub limit: Option<usize>,
}

impl EventFilter {
    /// Parse a filter from its JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::InvalidFilter`] if the text is not JSON or
    /// does not have the filter shape.
    pub fn from_json(text: &str) -> Result<Self, FormatError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| FormatError::InvalidFilter(format!("not valid JSON: {e}")))?;
        Self::from_value(&value)
    }

    /// Parse a filter from an already-decoded JSON value.
    ///
    /// Unknown plain fields are ignored; `null` counts as absent.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::InvalidFilter`] if a known field has the
    /// wrong type.
    pub fn from_value(value: &Value) -> Result<Self, FormatError> {
        let Value::Object(fields) = value else {
            return Err(FormatError::InvalidFilter(
                "filter must be a JSON object".to_owned(),
            ));
        };

        let mut filter = Self::default();
        for (field, raw) in fields {
            if raw.is_null() {
                continue;
            }
            match field.as_str() {
                "ids" => filter.ids = string_list(field, raw)?,
                "authors" => filter.authors = string_list(field, raw)?,
                "kinds" => filter.kinds = kind_list(raw)?,
                "since" => filter.since = Some(timestamp(field, raw)?),
                "until" => filter.until = Some(timestamp(field, raw)?),
                "limit" => filter.limit = Some(limit(raw)?),
                other => {
                    if let Some(tag) = other.strip_prefix('#') {
                        if tag.is_empty() {
                            return Err(FormatError::InvalidFilter(
                                "tag filter needs a name after '#'".to_owned(),
                            ));
                        }
                        filter.tags.insert(tag.to_owned(), string_list(field, raw)?);
                    }
                }
            }
        }
        Ok(filter)
    }

    /// Add accepted values for a tag dimension.
    #[must_use]
    pub fn with_tag<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(name.to_owned())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Compile this filter into a reusable predicate.
    pub fn compile(&self) -> FilterPredicate {
        FilterPredicate::compile(self)
    }
}

fn string_list(field: &str, raw: &Value) -> Result<Vec<String>, FormatError> {
    let Value::Array(items) = raw else {
        return Err(FormatError::InvalidFilter(format!(
            "{field} must be an array of strings"
        )));
    };
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_owned).ok_or_else(|| {
                FormatError::InvalidFilter(format!("{field} must contain only strings"))
            })
        })
        .collect()
}

fn kind_list(raw: &Value) -> Result<Vec<u32>, FormatError> {
    let Value::Array(items) = raw else {
        return Err(FormatError::InvalidFilter(
            "kinds must be an array of integers".to_owned(),
        ));
    };
    items
        .iter()
        .map(|item| {
            item.as_u64()
                .and_then(|k| u32::try_from(k).ok())
                .ok_or_else(|| FormatError::InvalidFilter(format!("invalid kind: {item}")))
        })
        .collect()
}

fn timestamp(field: &str, raw: &Value) -> Result<i64, FormatError> {
    raw.as_i64()
        .ok_or_else(|| FormatError::InvalidFilter(format!("{field} must be an integer")))
}

fn limit(raw: &Value) -> Result<usize, FormatError> {
    raw.as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| {
            FormatError::InvalidFilter("limit must be a non-negative integer".to_owned())
        })
}

/// A compiled [`EventFilter`], ready to test many events.
#[derive(Debug, Clone, Default)]
pub struct FilterPredicate {
    ids: HashSet<String>,
    authors: HashSet<String>,
    kinds: HashSet<u32>,
    tags: Vec<(String, HashSet<String>)>,
    since: Option<i64>,
    until: Option<i64>,
}

impl FilterPredicate {
    /// Compile `filter`. Tag dimensions with no values are dropped.
    pub fn compile(filter: &EventFilter) -> Self {
        Self {
            ids: filter.ids.iter().cloned().collect(),
            authors: filter.authors.iter().cloned().collect(),
            kinds: filter.kinds.iter().copied().collect(),
            tags: filter
                .tags
                .iter()
                .filter(|(_, values)| !values.is_empty())
                .map(|(name, values)| (name.clone(), values.iter().cloned().collect()))
                .collect(),
            since: filter.since,
            until: filter.until,
        }
    }

    /// Return whether `event` satisfies every dimension.
    pub fn matches(&self, event: &ActivityEvent) -> bool {
        (self.ids.is_empty() || self.ids.contains(&event.id))
            && (self.authors.is_empty() || self.authors.contains(&event.pubkey))
            && (self.kinds.is_empty() || self.kinds.contains(&event.kind))
            && self.since.is_none_or(|since| event.created_at >= since)
            && self.until.is_none_or(|until| event.created_at <= until)
            && self.tags.iter().all(|(name, values)| has_tag(event, name, values))
    }
}

/// At least one `(name, value)` pair on the event, name compared
/// case-insensitively, with the value in `values`.
fn has_tag(event: &ActivityEvent, name: &str, values: &HashSet<String>) -> bool {
    event.tags.iter().any(|tag| {
        tag.name().is_some_and(|n| n.eq_ignore_ascii_case(name))
            && tag.value().is_some_and(|v| values.contains(v))
    })
}

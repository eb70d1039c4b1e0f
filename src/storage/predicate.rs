//! Label and field selectors.
//!
//! A [`SelectionPredicate`] combines a label selector and a field selector.
//! Field selectors may reference fields that are not stored on the object at
//! all; the union store computes the virtual [`TENANT_FIELD`] from the key
//! layout and its UID side table.

use crate::core::error::{StorageError, StorageResult};
use crate::storage::object::Resource;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Virtual field carrying the owning tenant.
pub const TENANT_FIELD: &str = "tenant";

/// Field name of the object name.
pub const NAME_FIELD: &str = "metadata.name";

/// Field name of the object namespace.
pub const NAMESPACE_FIELD: &str = "metadata.namespace";

/// Label set of an object.
pub type Labels = BTreeMap<String, String>;

/// Field set of an object.
pub type Fields = BTreeMap<String, String>;

/// Attribute extraction function used for predicate evaluation.
pub type AttrFunc = fn(&Resource) -> (Labels, Fields);

/// Default attributes: labels, `metadata.name`, `metadata.namespace` if set.
pub fn default_attrs(obj: &Resource) -> (Labels, Fields) {
    let mut fields = Fields::new();
    fields.insert(NAME_FIELD.to_string(), obj.metadata.name.clone());
    if let Some(ns) = obj.metadata.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        fields.insert(NAMESPACE_FIELD.to_string(), ns.to_string());
    }
    (obj.metadata.labels.clone(), fields)
}

// ============================================================================
// Label selectors
// ============================================================================

/// Label requirement operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelOp {
    Equals(String),
    NotEquals(String),
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    Exists,
    DoesNotExist,
}

/// A single label requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRequirement {
    pub key: String,
    pub op: LabelOp,
}

impl LabelRequirement {
    fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.key);
        match &self.op {
            LabelOp::Equals(v) => value == Some(v),
            LabelOp::NotEquals(v) => value != Some(v),
            LabelOp::In(set) => value.is_some_and(|v| set.contains(v)),
            LabelOp::NotIn(set) => value.map_or(true, |v| !set.contains(v)),
            LabelOp::Exists => value.is_some(),
            LabelOp::DoesNotExist => value.is_none(),
        }
    }
}

impl fmt::Display for LabelRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(",");
        match &self.op {
            LabelOp::Equals(v) => write!(f, "{}={}", self.key, v),
            LabelOp::NotEquals(v) => write!(f, "{}!={}", self.key, v),
            LabelOp::In(set) => write!(f, "{} in ({})", self.key, join(set)),
            LabelOp::NotIn(set) => write!(f, "{} notin ({})", self.key, join(set)),
            LabelOp::Exists => write!(f, "{}", self.key),
            LabelOp::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// Conjunction of label requirements. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<LabelRequirement>,
}

impl LabelSelector {
    /// Selector matching everything.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Parse `a=b,c!=d,e in (x,y),f notin (z),g,!h`.
    pub fn parse(input: &str) -> StorageResult<Self> {
        let mut requirements = Vec::new();
        for term in split_terms(input) {
            requirements.push(parse_label_term(&term)?);
        }
        Ok(Self { requirements })
    }

    /// Add a requirement.
    pub fn with(mut self, key: impl Into<String>, op: LabelOp) -> Self {
        self.requirements.push(LabelRequirement {
            key: key.into(),
            op,
        });
        self
    }

    /// Whether this selector has no requirements.
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Evaluate against a label set.
    pub fn matches(&self, labels: &Labels) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

fn parse_label_term(term: &str) -> StorageResult<LabelRequirement> {
    let invalid = || StorageError::invalid(format!("invalid label selector term {:?}", term));

    if let Some(key) = term.strip_prefix('!') {
        let key = key.trim();
        if key.is_empty() {
            return Err(invalid());
        }
        return Ok(LabelRequirement {
            key: key.to_string(),
            op: LabelOp::DoesNotExist,
        });
    }

    for (keyword, negate) in [(" notin ", true), (" in ", false)] {
        if let Some(idx) = term.find(keyword) {
            let key = term[..idx].trim();
            let values = term[idx + keyword.len()..].trim();
            let values = values
                .strip_prefix('(')
                .and_then(|v| v.strip_suffix(')'))
                .ok_or_else(invalid)?;
            let set: BTreeSet<String> = values
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
            if key.is_empty() || set.is_empty() {
                return Err(invalid());
            }
            let op = if negate {
                LabelOp::NotIn(set)
            } else {
                LabelOp::In(set)
            };
            return Ok(LabelRequirement {
                key: key.to_string(),
                op,
            });
        }
    }

    if let Some((key, value)) = term.split_once("!=") {
        return equality_term(key, value, false).ok_or_else(invalid);
    }
    if let Some((key, value)) = term.split_once("==") {
        return equality_term(key, value, true).ok_or_else(invalid);
    }
    if let Some((key, value)) = term.split_once('=') {
        return equality_term(key, value, true).ok_or_else(invalid);
    }

    let key = term.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(invalid());
    }
    Ok(LabelRequirement {
        key: key.to_string(),
        op: LabelOp::Exists,
    })
}

fn equality_term(key: &str, value: &str, equals: bool) -> Option<LabelRequirement> {
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = value.trim().to_string();
    let op = if equals {
        LabelOp::Equals(value)
    } else {
        LabelOp::NotEquals(value)
    };
    Some(LabelRequirement {
        key: key.to_string(),
        op,
    })
}

/// Split on commas that are not inside parentheses.
fn split_terms(input: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in input.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                if !current.trim().is_empty() {
                    terms.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        terms.push(current.trim().to_string());
    }
    terms
}

// ============================================================================
// Field selectors
// ============================================================================

/// A single field requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRequirement {
    pub field: String,
    pub value: String,
    /// `true` for `!=`.
    pub negated: bool,
}

impl FieldRequirement {
    fn matches(&self, fields: &Fields) -> bool {
        // A missing field compares as the empty string, so `tenant=acme`
        // excludes objects whose tenant has not been observed yet.
        let value = fields.get(&self.field).map(String::as_str).unwrap_or("");
        (value == self.value) != self.negated
    }
}

impl fmt::Display for FieldRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.negated { "!=" } else { "=" };
        write!(f, "{}{}{}", self.field, op, self.value)
    }
}

/// Conjunction of field requirements. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    requirements: Vec<FieldRequirement>,
}

impl FieldSelector {
    /// Selector matching everything.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selector requiring `field == value`.
    pub fn one_term_equal(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            requirements: vec![FieldRequirement {
                field: field.into(),
                value: value.into(),
                negated: false,
            }],
        }
    }

    /// Parse `f=v,g!=w`.
    pub fn parse(input: &str) -> StorageResult<Self> {
        let mut requirements = Vec::new();
        for term in split_terms(input) {
            let invalid = || StorageError::invalid(format!("invalid field selector term {:?}", term));
            let (field, value, negated) = if let Some((f, v)) = term.split_once("!=") {
                (f, v, true)
            } else if let Some((f, v)) = term.split_once("==") {
                (f, v, false)
            } else if let Some((f, v)) = term.split_once('=') {
                (f, v, false)
            } else {
                return Err(invalid());
            };
            let field = field.trim();
            if field.is_empty() {
                return Err(invalid());
            }
            requirements.push(FieldRequirement {
                field: field.to_string(),
                value: value.trim().to_string(),
                negated,
            });
        }
        Ok(Self { requirements })
    }

    /// Whether this selector has no requirements.
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Evaluate against a field set.
    pub fn matches(&self, fields: &Fields) -> bool {
        self.requirements.iter().all(|r| r.matches(fields))
    }

    /// Logical AND of two selectors.
    pub fn and(mut self, other: FieldSelector) -> Self {
        self.requirements.extend(other.requirements);
        self
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

/// AND two field selectors, short-circuiting on empty ones.
pub fn and_predicate(a: FieldSelector, b: FieldSelector) -> FieldSelector {
    if a.is_empty() {
        return b;
    }
    if b.is_empty() {
        return a;
    }
    a.and(b)
}

// ============================================================================
// Selection predicate
// ============================================================================

/// Label + field selector pair used to filter list and watch results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionPredicate {
    pub label: LabelSelector,
    pub field: FieldSelector,
}

impl SelectionPredicate {
    /// Predicate matching everything.
    pub fn everything() -> Self {
        Self::default()
    }

    /// Whether both selectors are empty.
    pub fn is_empty(&self) -> bool {
        self.label.is_empty() && self.field.is_empty()
    }

    /// Evaluate against precomputed attributes.
    pub fn matches_attrs(&self, labels: &Labels, fields: &Fields) -> bool {
        (self.label.is_empty() || self.label.matches(labels))
            && (self.field.is_empty() || self.field.matches(fields))
    }

    /// Evaluate against an object using `attrs` to extract attributes.
    pub fn matches(&self, obj: &Resource, attrs: AttrFunc) -> bool {
        if self.is_empty() {
            return true;
        }
        let (labels, fields) = attrs(obj);
        self.matches_attrs(&labels, &fields)
    }

    /// Return this predicate with `tenant == tenant` ANDed onto the field selector.
    pub fn with_tenant(self, tenant: &str) -> Self {
        Self {
            label: self.label,
            field: and_predicate(self.field, FieldSelector::one_term_equal(TENANT_FIELD, tenant)),
        }
    }
}

// src/parameters.rs
//! Named, typed report inputs.
//!
//! A [`ParameterList`] is what the client posts when it starts a report and
//! what the calculators read their filters from. Lookups never fail: a name
//! that was not supplied reads as [`Variant::Empty`] and every typed accessor
//! has a documented default.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{ReportError, Result};

/// Parameter naming the calculator to run; also used for export file names
/// and the email subject.
pub const CURRENT_REPORT: &str = "currentReport";

static EMPTY: Variant = Variant::Empty;

/// A discriminated parameter value.
///
/// Deserialisation is untagged, so the order of the variants decides how
/// ambiguous JSON is read: `"2017-01-01"` becomes a [`Variant::Date`], any
/// other string a [`Variant::Str`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Variant {
    #[default]
    Empty,
    Bool(bool),
    Number(f64),
    Date(NaiveDate),
    Str(String),
    List(Vec<Variant>),
}

impl Variant {
    pub fn is_empty(&self) -> bool {
        matches!(self, Variant::Empty)
    }

    /// `false` unless the value is a true boolean or the text `"true"`.
    pub fn as_bool(&self) -> bool {
        match self {
            Variant::Bool(b) => *b,
            Variant::Str(s) => s.eq_ignore_ascii_case("true"),
            Variant::Number(n) => *n != 0.0,
            _ => false,
        }
    }

    /// `0.0` for anything that is not numeric.
    pub fn as_number(&self) -> f64 {
        match self {
            Variant::Number(n) => *n,
            Variant::Str(s) => s.trim().parse().unwrap_or(0.0),
            Variant::Bool(true) => 1.0,
            _ => 0.0,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Variant::Date(d) => Some(*d),
            Variant::Str(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok(),
            _ => None,
        }
    }

    /// Comma separated text is split into its trimmed, non-empty parts.
    pub fn as_list(&self) -> Vec<String> {
        match self {
            Variant::Empty => Vec::new(),
            Variant::List(items) => items.iter().map(|v| v.to_string()).collect(),
            Variant::Str(s) => s
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            other => vec![other.to_string()],
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Empty => Ok(()),
            Variant::Bool(b) => write!(f, "{}", b),
            Variant::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Variant::Number(n) => write!(f, "{}", n),
            Variant::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Variant::Str(s) => f.write_str(s),
            Variant::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        Variant::Bool(value)
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Self {
        Variant::Number(value)
    }
}

impl From<i64> for Variant {
    fn from(value: i64) -> Self {
        Variant::Number(value as f64)
    }
}

impl From<NaiveDate> for Variant {
    fn from(value: NaiveDate) -> Self {
        Variant::Date(value)
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Variant::Str(value.to_string())
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Variant::Str(value)
    }
}

/// The parameter store for one report calculation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterList {
    entries: BTreeMap<String, Variant>,
}

impl ParameterList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the flat key/value object posted by the client.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        if !value.is_object() {
            return Err(ReportError::Validation(
                "report parameters must be a JSON object".to_string(),
            ));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Adds a parameter, replacing any value already stored under `name`.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<Variant>) {
        self.entries.insert(name.into(), value.into());
    }

    /// Returns the value for `name`, or [`Variant::Empty`] if it was never set.
    pub fn get(&self, name: &str) -> &Variant {
        self.entries.get(name).unwrap_or(&EMPTY)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name).as_bool()
    }

    pub fn get_string(&self, name: &str) -> String {
        self.get(name).to_string()
    }

    pub fn get_date(&self, name: &str) -> Option<NaiveDate> {
        self.get(name).as_date()
    }

    pub fn get_number(&self, name: &str) -> f64 {
        self.get(name).as_number()
    }

    pub fn get_list(&self, name: &str) -> Vec<String> {
        self.get(name).as_list()
    }

    /// Name of the report to calculate; empty when the client did not say.
    pub fn current_report(&self) -> String {
        self.get_string(CURRENT_REPORT)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Variant)> {
        self.entries.iter()
    }
}

// src/verification.rs
//! Structured validation results.
//!
//! Configuration and input problems are collected here and handed back to the
//! client as a list, so every problem can be shown at once instead of the
//! first one aborting the request.

use serde::Serialize;

/// Error code reported when the SMTP server or sender settings are missing.
pub const ERR_MISSING_EMAIL_CONFIGURATION: &str = "ERR_MISSINGEMAILCONFIGURATION";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Critical,
    NonCritical,
    Info,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub context: String,
    pub text: String,
    pub code: String,
    pub severity: Severity,
}

impl VerificationResult {
    pub fn critical(context: &str, text: impl Into<String>, code: &str) -> Self {
        Self {
            context: context.to_string(),
            text: text.into(),
            code: code.to_string(),
            severity: Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VerificationResultCollection {
    results: Vec<VerificationResult>,
}

impl VerificationResultCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, result: VerificationResult) {
        self.results.push(result);
    }

    pub fn has_critical_errors(&self) -> bool {
        self.results.iter().any(|r| r.severity == Severity::Critical)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VerificationResult> {
        self.results.iter()
    }

    pub fn contains_code(&self, code: &str) -> bool {
        self.results.iter().any(|r| r.code == code)
    }
}

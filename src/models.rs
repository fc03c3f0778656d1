// src/models.rs
use serde::Serialize;
use std::sync::Arc;

use crate::errors::ReportError;

/// Tabular form of a report, the input of the PDF and Excel exports.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportTable {
    pub title: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// What a calculator hands back: the rendered document and its table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalculationResult {
    pub html: String,
    pub table: ReportTable,
}

/// Final state of a report job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded(Arc<CalculationResult>),
    Failed {
        message: String,
        /// Kept for unexpected faults; rewritten database faults drop it.
        fault: Option<Arc<ReportError>>,
    },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded(_))
    }
}

/// Reply of `GetErrorMessage` once a job has finished.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub message: String,
    pub fault: Option<String>,
}

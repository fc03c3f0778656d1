// src/reports/mod.rs
//! Report calculators and what they need to run: the calculation context
//! handed to them by the job runner, the template lookup and the registry the
//! server is wired with at startup.

use async_trait::async_trait;
use rust_embed::RustEmbed;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::errors::{ReportError, Result};
use crate::models::{CalculationResult, ReportTable};
use crate::parameters::ParameterList;
use crate::progress::ProgressTracker;
use crate::template::{ROW_PLACEHOLDER, escape_html, get_table_row, replace_tokens};

pub mod partner_by_city;
pub mod partner_by_special_types;

pub use partner_by_city::PartnerByCity;
pub use partner_by_special_types::PartnerBySpecialTypes;

/// Rows between two progress updates.
const STATUS_INTERVAL: usize = 25;

/// A report that can be calculated from a parameter list.
///
/// Implementations run inside a read-only transaction and must call
/// [`CalculationContext::checkpoint`] regularly so that a cancelled job stops
/// at the next safe point.
#[async_trait]
pub trait ReportCalculator: Send + Sync {
    /// The `currentReport` value this calculator answers to.
    fn name(&self) -> &'static str;

    async fn calculate(
        &self,
        params: &ParameterList,
        conn: &mut SqliteConnection,
        ctx: &CalculationContext,
    ) -> Result<CalculationResult>;
}

/// Per-job handle a calculator uses to publish progress and observe
/// cancellation.
#[derive(Clone)]
pub struct CalculationContext {
    job_id: String,
    progress: ProgressTracker,
    cancel: CancellationToken,
}

impl CalculationContext {
    pub fn new(job_id: &str, progress: ProgressTracker, cancel: CancellationToken) -> Self {
        Self {
            job_id: job_id.to_string(),
            progress,
            cancel,
        }
    }

    /// Fails with [`ReportError::Cancelled`] once cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ReportError::Cancelled);
        }
        Ok(())
    }

    pub async fn report_status(&self, message: &str, percent: Option<f64>) {
        if let Err(e) = self.progress.set_status(&self.job_id, message, percent).await {
            log::warn!("Could not publish progress of {}: {}", self.job_id, e);
        }
    }
}

#[derive(RustEmbed)]
#[folder = "templates/"]
struct BuiltinTemplates;

/// Finds `<report>.html`: custom reports first, then standard reports, then
/// the templates compiled into the binary.
#[derive(Debug, Clone, Default)]
pub struct ReportTemplates {
    custom_dir: Option<PathBuf>,
    standard_dir: Option<PathBuf>,
}

impl ReportTemplates {
    pub fn new(custom_dir: Option<PathBuf>, standard_dir: Option<PathBuf>) -> Self {
        Self {
            custom_dir,
            standard_dir,
        }
    }

    pub fn load(&self, report: &str) -> Result<String> {
        let file_name = format!("{}.html", report);

        for dir in [&self.custom_dir, &self.standard_dir].into_iter().flatten() {
            let path = dir.join(&file_name);
            if path.is_file() {
                log::debug!("Using report template {}", path.display());
                return Ok(std::fs::read_to_string(path)?);
            }
        }

        BuiltinTemplates::get(&file_name)
            .map(|file| String::from_utf8_lossy(&file.data).into_owned())
            .ok_or_else(|| ReportError::TemplateNotFound(report.to_string()))
    }
}

/// Explicit name → calculator registration.
#[derive(Clone, Default)]
pub struct ReportRegistry {
    calculators: HashMap<String, Arc<dyn ReportCalculator>>,
}

impl ReportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The reports shipped with the server.
    pub fn with_standard_reports(templates: Arc<ReportTemplates>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PartnerByCity::new(templates.clone())));
        registry.register(Arc::new(PartnerBySpecialTypes::new(templates)));
        registry
    }

    pub fn register(&mut self, calculator: Arc<dyn ReportCalculator>) {
        self.calculators.insert(calculator.name().to_string(), calculator);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ReportCalculator>> {
        self.calculators.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.calculators.keys().cloned().collect();
        names.sort();
        names
    }
}

/// One output column: the row token in the template and the column caption.
pub(crate) struct Column {
    pub token: &'static str,
    pub caption: &'static str,
}

/// Fills a report template: header tokens first, then one copy of the row
/// marked by `sentinel` per data row. Checks for cancellation at every row.
pub(crate) async fn render_table(
    template: &str,
    title: &str,
    sentinel: &str,
    header: &HashMap<&str, String>,
    columns: &[Column],
    rows: Vec<Vec<String>>,
    ctx: &CalculationContext,
) -> Result<CalculationResult> {
    let header: HashMap<&str, String> = header
        .iter()
        .map(|(token, value)| (*token, escape_html(value)))
        .collect();
    let (document, row_template) = get_table_row(&replace_tokens(template, &header), sentinel);

    let total = rows.len();
    let mut rendered_rows = String::new();
    for (index, row) in rows.iter().enumerate() {
        ctx.checkpoint()?;
        if index % STATUS_INTERVAL == 0 {
            let percent = index as f64 * 100.0 / total as f64;
            ctx.report_status(&format!("Calculating row {} of {}", index + 1, total), Some(percent))
                .await;
        }

        let values: HashMap<&str, String> = columns
            .iter()
            .zip(row.iter())
            .map(|(column, value)| (column.token, escape_html(value)))
            .collect();
        rendered_rows.push_str(&replace_tokens(&row_template, &values));
    }

    Ok(CalculationResult {
        html: document.replace(ROW_PLACEHOLDER, &rendered_rows),
        table: ReportTable {
            title: title.to_string(),
            columns: columns.iter().map(|c| c.caption.to_string()).collect(),
            rows,
        },
    })
}

/// Partner keys are shown zero padded to ten digits.
pub(crate) fn format_partner_key(key: i64) -> String {
    format!("{:010}", key)
}

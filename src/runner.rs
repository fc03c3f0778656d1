// src/runner.rs
//! The asynchronous report job coordinator.
//!
//! `start` admits a job and returns its id right away; the calculation runs
//! on a background task once one of the worker permits is free. Callers poll
//! progress with the id, may cancel cooperatively, and fetch the outcome or an
//! export once the job has finished.

use chrono::Utc;
use futures::FutureExt;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::database::{self, DbFault};
use crate::errors::{ReportError, Result};
use crate::export::{self, excel, pdf};
use crate::mail::{self, MailAttachment, MailSender, MailSettings, OutgoingMail};
use crate::models::{CalculationResult, ErrorReport, JobOutcome};
use crate::parameters::{CURRENT_REPORT, ParameterList};
use crate::progress::{JobState, ProgressState, ProgressTracker};
use crate::reports::{CalculationContext, ReportCalculator, ReportRegistry};
use crate::verification::{VerificationResult, VerificationResultCollection};

pub const TIMEOUT_MESSAGE: &str =
    "Error - Database took too long to respond. Try different parameters to return fewer results.";

const JOB_ID_PREFIX: &str = "ReportCalculation";

struct JobRecord {
    params: Arc<ParameterList>,
    cancel: CancellationToken,
    outcome: Option<JobOutcome>,
}

/// Limits and locations the coordinator works with.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub max_concurrent_jobs: usize,
    pub max_queued_jobs: usize,
    pub report_timeout: Duration,
    pub retention: Duration,
    pub temp_dir: PathBuf,
}

impl From<&AppConfig> for JobSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs,
            max_queued_jobs: config.max_queued_jobs,
            report_timeout: config.report_timeout(),
            retention: config.job_retention(),
            temp_dir: config.temp_dir.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ReportJobs {
    pool: SqlitePool,
    registry: Arc<ReportRegistry>,
    progress: ProgressTracker,
    jobs: Arc<RwLock<HashMap<String, JobRecord>>>,
    workers: Arc<Semaphore>,
    admission: Arc<Semaphore>,
    settings: JobSettings,
    mailer: Option<Arc<dyn MailSender>>,
}

impl ReportJobs {
    pub fn new(pool: SqlitePool, registry: ReportRegistry, settings: JobSettings) -> Self {
        Self {
            pool,
            registry: Arc::new(registry),
            progress: ProgressTracker::new(),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            workers: Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1))),
            admission: Arc::new(Semaphore::new(
                settings.max_queued_jobs.max(settings.max_concurrent_jobs).max(1),
            )),
            settings,
            mailer: None,
        }
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn MailSender>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn report_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Admits a calculation and returns its job id without waiting for it.
    pub async fn start(&self, params: ParameterList) -> Result<String> {
        if !params.exists(CURRENT_REPORT) {
            return Err(ReportError::Validation(format!("{} is required", CURRENT_REPORT)));
        }
        let report = params.current_report();
        let calculator = self
            .registry
            .get(&report)
            .ok_or_else(|| ReportError::UnknownReport(report.clone()))?;

        // held until the run task ends, so queued plus running jobs are bounded
        let admission = self
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| ReportError::Busy)?;

        let job_id = format!("{}{}", JOB_ID_PREFIX, Uuid::new_v4());
        let params = Arc::new(params);
        let cancel = CancellationToken::new();

        self.progress.init(&job_id, &report).await;
        self.jobs.write().await.insert(
            job_id.clone(),
            JobRecord {
                params: params.clone(),
                cancel: cancel.clone(),
                outcome: None,
            },
        );

        log::info!("Starting {} for report {}", job_id, report);

        let jobs = self.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            let _admission = admission;
            jobs.run(&id, calculator, params, cancel).await;
        });

        Ok(job_id)
    }

    async fn run(
        &self,
        job_id: &str,
        calculator: Arc<dyn ReportCalculator>,
        params: Arc<ParameterList>,
        cancel: CancellationToken,
    ) {
        let permit = tokio::select! {
            permit = self.workers.clone().acquire_owned() => permit.ok(),
            _ = cancel.cancelled() => None,
        };

        let outcome = match permit {
            None if cancel.is_cancelled() => failure(job_id, ReportError::Cancelled),
            None => failure(job_id, ReportError::Busy),
            Some(_permit) => {
                if let Err(e) = self.progress.mark_running(job_id).await {
                    log::warn!("{}: {}", job_id, e);
                }
                let calculation = self.calculate(job_id, calculator, params, cancel);
                match AssertUnwindSafe(calculation).catch_unwind().await {
                    Ok(Ok(result)) => JobOutcome::Succeeded(Arc::new(result)),
                    Ok(Err(e)) => failure(job_id, e),
                    Err(panic) => failure(job_id, ReportError::Panicked(panic_message(panic.as_ref()))),
                }
            }
        };

        self.record(job_id, outcome).await;
    }

    async fn calculate(
        &self,
        job_id: &str,
        calculator: Arc<dyn ReportCalculator>,
        params: Arc<ParameterList>,
        cancel: CancellationToken,
    ) -> Result<CalculationResult> {
        let ctx = CalculationContext::new(job_id, self.progress.clone(), cancel.clone());
        ctx.checkpoint()?;

        database::with_read_transaction(&self.pool, self.settings.report_timeout, &cancel, move |conn| {
            Box::pin(async move {
                calculator
                    .calculate(&params, conn, &ctx)
                    .await
                    .map_err(|e| ReportError::Calculation {
                        report: calculator.name().to_string(),
                        source: Box::new(e),
                    })
            })
        })
        .await
    }

    async fn record(&self, job_id: &str, outcome: JobOutcome) {
        let (state, message) = match &outcome {
            JobOutcome::Succeeded(_) => (JobState::Succeeded, "Report calculation finished".to_string()),
            JobOutcome::Failed { message, .. } => (JobState::Failed, message.clone()),
        };

        match self.jobs.write().await.get_mut(job_id) {
            Some(record) => record.outcome = Some(outcome),
            None => log::debug!("{} was released before it finished", job_id),
        }
        if let Err(e) = self.progress.finish(job_id, state, &message).await {
            log::warn!("Could not finish {}: {}", job_id, e);
        }
        log::info!("{} finished: {}", job_id, state);
    }

    /// Requests cooperative cancellation. Unknown or finished jobs are left
    /// alone and yield `false`.
    pub async fn cancel(&self, job_id: &str) -> bool {
        {
            let jobs = self.jobs.read().await;
            match jobs.get(job_id) {
                Some(record) if record.outcome.is_none() => record.cancel.cancel(),
                _ => return false,
            }
        }
        log::info!("Cancellation requested for {}", job_id);
        self.progress.request_cancel(job_id).await
    }

    pub async fn progress(&self, job_id: &str) -> Result<ProgressState> {
        self.progress
            .get(job_id)
            .await
            .ok_or_else(|| ReportError::JobNotFound(job_id.to_string()))
    }

    /// `None` until the job has finished.
    pub async fn success(&self, job_id: &str) -> Result<Option<bool>> {
        self.with_outcome(job_id, |outcome| Ok(outcome.is_success())).await
    }

    /// `None` until the job has finished; an empty message after success.
    pub async fn error_message(&self, job_id: &str) -> Result<Option<ErrorReport>> {
        self.with_outcome(job_id, |outcome| {
            Ok(match outcome {
                JobOutcome::Succeeded(_) => ErrorReport {
                    message: String::new(),
                    fault: None,
                },
                JobOutcome::Failed { message, fault } => ErrorReport {
                    message: message.clone(),
                    fault: fault.as_ref().map(|f| error_chain(f)),
                },
            })
        })
        .await
    }

    async fn with_outcome<T, F>(&self, job_id: &str, read: F) -> Result<Option<T>>
    where
        F: FnOnce(&JobOutcome) -> Result<T>,
    {
        let jobs = self.jobs.read().await;
        let record = jobs
            .get(job_id)
            .ok_or_else(|| ReportError::JobNotFound(job_id.to_string()))?;
        let Some(outcome) = &record.outcome else {
            return Ok(None);
        };
        if let JobOutcome::Failed {
            message,
            fault: Some(fault),
        } = outcome
        {
            if is_serialization_conflict(fault) {
                return Err(ReportError::SerializationConflict(message.clone()));
            }
        }
        read(outcome).map(Some)
    }

    async fn finished_result(&self, job_id: &str) -> Result<(Arc<CalculationResult>, Arc<ParameterList>)> {
        let jobs = self.jobs.read().await;
        let record = jobs
            .get(job_id)
            .ok_or_else(|| ReportError::JobNotFound(job_id.to_string()))?;
        match &record.outcome {
            Some(JobOutcome::Succeeded(result)) => Ok((result.clone(), record.params.clone())),
            _ => Err(ReportError::NoResult(job_id.to_string())),
        }
    }

    pub async fn download_html(&self, job_id: &str) -> Result<String> {
        let (result, _) = self.finished_result(job_id).await?;
        Ok(result.html.clone())
    }

    /// The result as a base64 encoded PDF.
    pub async fn download_pdf(&self, job_id: &str) -> Result<String> {
        let (result, params) = self.finished_result(job_id).await?;
        export::to_base64_artifact(&self.settings.temp_dir, &params.current_report(), ".pdf", |path| {
            write_pdf(&result, path)
        })
    }

    /// The result as a base64 encoded Excel workbook.
    pub async fn download_excel(&self, job_id: &str) -> Result<String> {
        let (result, params) = self.finished_result(job_id).await?;
        export::to_base64_artifact(&self.settings.temp_dir, &params.current_report(), ".xlsx", |path| {
            excel::write_workbook(&result.table, path)
        })
    }

    /// Mails the result to `addresses`. Problems are reported in the
    /// collection rather than as errors so the client can show all of them.
    pub async fn send_email(
        &self,
        job_id: &str,
        addresses: &str,
        attach_excel: bool,
        attach_pdf: bool,
        user_id: &str,
    ) -> Result<(bool, VerificationResultCollection)> {
        let mut verification = VerificationResultCollection::new();
        if !attach_excel && !attach_pdf {
            verification.add(VerificationResult::critical(
                mail::CONTEXT,
                "Missing any attachments, not sending the email",
                "Missing Attachments",
            ));
            return Ok((false, verification));
        }

        let (result, params) = self.finished_result(job_id).await?;
        let user_defaults = database::get_user_defaults(&self.pool, user_id).await?;
        let settings = MailSettings::resolve(&user_defaults, self.mailer.is_some(), &mut verification);
        let (Some(settings), Some(mailer)) = (settings, &self.mailer) else {
            return Ok((false, verification));
        };

        let report = params.current_report();
        let temp_dir = &self.settings.temp_dir;
        let mut attachments = Vec::new();
        if attach_excel {
            let data = export::render_artifact(temp_dir, &report, ".xlsx", |path| {
                excel::write_workbook(&result.table, path)
            })?;
            attachments.push(MailAttachment::new(&format!("{}.xlsx", report), data));
        }
        if attach_pdf {
            let data = export::render_artifact(temp_dir, &report, ".pdf", |path| write_pdf(&result, path))?;
            attachments.push(MailAttachment::new(&format!("{}.pdf", report), data));
        }

        let outgoing = OutgoingMail {
            from: settings.from,
            display_name: settings.display_name,
            to: mail::split_addresses(addresses),
            cc: settings.cc,
            reply_to: settings.reply_to,
            subject: report,
            body: settings.body,
            attachments,
        };

        match mailer.send(outgoing).await {
            Ok(()) => Ok((true, verification)),
            Err(e) => {
                log::error!("Email of {} failed: {}", job_id, e);
                verification.add(VerificationResult::critical(
                    mail::CONTEXT,
                    "Problem sending email",
                    "Server problems",
                ));
                Ok((false, verification))
            }
        }
    }

    /// Forgets a job. A job that is still queued or running is cancelled.
    pub async fn release(&self, job_id: &str) -> Result<()> {
        let record = self
            .jobs
            .write()
            .await
            .remove(job_id)
            .ok_or_else(|| ReportError::JobNotFound(job_id.to_string()))?;
        if record.outcome.is_none() {
            record.cancel.cancel();
        }
        self.progress.remove(job_id).await;
        log::debug!("Released {}", job_id);
        Ok(())
    }

    /// Drops finished jobs whose retention window has passed.
    pub async fn evict_expired(&self) -> Vec<String> {
        let evicted = self
            .progress
            .evict_finished_before(Utc::now(), self.settings.retention)
            .await;
        if !evicted.is_empty() {
            let mut jobs = self.jobs.write().await;
            for id in &evicted {
                jobs.remove(id);
            }
            log::info!("Evicted {} expired report job(s)", evicted.len());
        }
        evicted
    }

    /// Runs [`evict_expired`](Self::evict_expired) every `interval`.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let jobs = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                jobs.evict_expired().await;
            }
        })
    }
}

fn write_pdf(result: &CalculationResult, path: &std::path::Path) -> Result<()> {
    let mut document = pdf::PdfDocument::new();
    document.add_section(&pdf::table_lines(&result.table));
    document.save(path)
}

/// Turns a calculation error into the recorded failure. Data-access faults
/// get a user-facing message and lose the fault, except serialisation
/// conflicts which keep it so they re-surface to whoever asks.
fn failure(job_id: &str, err: ReportError) -> JobOutcome {
    let err = match err {
        ReportError::Calculation { source, .. } => *source,
        other => other,
    };

    let (message, keep_fault) = match &err {
        ReportError::Cancelled => (err.to_string(), false),
        ReportError::StatementTimeout => (TIMEOUT_MESSAGE.to_string(), false),
        ReportError::Database(db) => match database::classify(db) {
            DbFault::SerializationConflict => {
                log::warn!("{}: serialisation conflict: {}", job_id, db);
                (database::fault_message(db), true)
            }
            DbFault::StatementTimeout => (TIMEOUT_MESSAGE.to_string(), false),
            DbFault::Other => (database::fault_message(db), false),
        },
        other => {
            log::error!("Problem calculating report {}: {}", job_id, error_chain(other));
            (other.to_string(), true)
        }
    };

    JobOutcome::Failed {
        message,
        fault: keep_fault.then(|| Arc::new(err)),
    }
}

fn is_serialization_conflict(fault: &ReportError) -> bool {
    matches!(fault, ReportError::Database(db) if database::classify(db) == DbFault::SerializationConflict)
}

fn error_chain(err: &ReportError) -> String {
    let mut text = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_drops_the_fault() {
        let outcome = failure(
            "job",
            ReportError::Calculation {
                report: "PartnerByCity".to_string(),
                source: Box::new(ReportError::Cancelled),
            },
        );
        match outcome {
            JobOutcome::Failed { message, fault } => {
                assert_eq!(message, "Report calculation was cancelled.");
                assert!(fault.is_none());
            }
            JobOutcome::Succeeded(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn test_timeout_is_rewritten() {
        match failure("job", ReportError::StatementTimeout) {
            JobOutcome::Failed { message, fault } => {
                assert_eq!(message, TIMEOUT_MESSAGE);
                assert!(fault.is_none());
            }
            JobOutcome::Succeeded(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn test_other_database_faults_surface_their_own_message() {
        let err = ReportError::Calculation {
            report: "PartnerByCity".to_string(),
            source: Box::new(ReportError::Database(sqlx::Error::RowNotFound)),
        };
        match failure("job", err) {
            JobOutcome::Failed { message, fault } => {
                assert_eq!(message, sqlx::Error::RowNotFound.to_string());
                assert!(fault.is_none());
            }
            JobOutcome::Succeeded(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn test_unexpected_faults_are_kept() {
        let err = ReportError::Calculation {
            report: "PartnerByCity".to_string(),
            source: Box::new(ReportError::Validation("param_city is required".to_string())),
        };
        match failure("job", err) {
            JobOutcome::Failed { message, fault } => {
                assert_eq!(message, "Invalid request: param_city is required");
                assert!(matches!(fault.as_deref(), Some(ReportError::Validation(_))));
            }
            JobOutcome::Succeeded(_) => panic!("expected failure"),
        }
    }

    #[test]
    fn test_error_chain_follows_sources() {
        let err = ReportError::Calculation {
            report: "PartnerByCity".to_string(),
            source: Box::new(ReportError::Cancelled),
        };
        assert_eq!(
            error_chain(&err),
            "Report 'PartnerByCity' failed: Report calculation was cancelled."
        );
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }
}

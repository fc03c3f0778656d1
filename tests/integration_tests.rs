// tests/integration_tests.rs
use actix_web::{App, test, web};
use async_trait::async_trait;
use chrono::NaiveDate;
use petra_reports::api::{AppState, configure_routes};
use petra_reports::config::AppConfig;
use petra_reports::database;
use petra_reports::errors::{ReportError, Result};
use petra_reports::mail::{MailSender, OutgoingMail, SMTP_FROM_ACCOUNT};
use petra_reports::models::CalculationResult;
use petra_reports::parameters::{CURRENT_REPORT, ParameterList};
use petra_reports::progress::JobState;
use petra_reports::receipts::{AnnualReceiptRequest, create_annual_gift_receipts};
use petra_reports::reports::{CalculationContext, ReportCalculator, ReportRegistry, ReportTemplates};
use petra_reports::runner::{JobSettings, ReportJobs};
use serde_json::{Value, json};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const LEDGER: i64 = 43;

struct TestEnv {
    dir: TempDir,
    pool: SqlitePool,
}

impl TestEnv {
    fn temp_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("tmp")
    }

    fn settings(&self, max_concurrent_jobs: usize, max_queued_jobs: usize) -> JobSettings {
        JobSettings {
            max_concurrent_jobs,
            max_queued_jobs,
            report_timeout: Duration::from_secs(10),
            retention: Duration::from_secs(600),
            temp_dir: self.temp_dir(),
        }
    }

    fn jobs(&self, registry: ReportRegistry, max_concurrent_jobs: usize, max_queued_jobs: usize) -> ReportJobs {
        ReportJobs::new(self.pool.clone(), registry, self.settings(max_concurrent_jobs, max_queued_jobs))
    }

    fn standard_jobs(&self) -> ReportJobs {
        self.jobs(standard_registry(), 2, 8)
    }

    fn temp_file_count(&self) -> usize {
        std::fs::read_dir(self.temp_dir()).map(|d| d.count()).unwrap_or(0)
    }
}

async fn setup() -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("tmp")).unwrap();
    let url = format!("sqlite:{}", dir.path().join("petra.db").display());
    let pool = database::init_db(&url).await.unwrap();
    seed(&pool).await;
    TestEnv { dir, pool }
}

async fn exec(pool: &SqlitePool, sql: &str) {
    sqlx::query(sql).execute(pool).await.unwrap();
}

async fn seed(pool: &SqlitePool) {
    exec(pool, "INSERT INTO a_ledger VALUES (43, 'Germany', 'DE', 'EUR')").await;
    exec(pool, "INSERT INTO p_country VALUES ('DE', 'Germany', 'Deutschland')").await;
    exec(pool, "INSERT INTO p_country VALUES ('AT', 'Austria', 'Österreich')").await;

    exec(pool, "INSERT INTO p_partner VALUES (43005001, 'Mustermann, Max, Herr', 'PERSON', 'ACTIVE')").await;
    exec(pool, "INSERT INTO p_partner VALUES (43005002, 'Beispiel, Berta, Frau', 'PERSON', 'ACTIVE')").await;
    exec(pool, "INSERT INTO p_partner VALUES (43005003, 'Huber, Hans, Herr', 'PERSON', 'ACTIVE')").await;
    exec(pool, "INSERT INTO p_partner VALUES (43005004, 'Alt, Anna', 'PERSON', 'INACTIVE')").await;
    exec(pool, "INSERT INTO p_partner_type VALUES (43005001, 'VOLUNTEER')").await;

    exec(pool, "INSERT INTO p_location VALUES (0, 1, '', '', 'Hauptstr. 1', '', '', 'Berlin', '10115', 'DE')").await;
    exec(pool, "INSERT INTO p_location VALUES (0, 3, '', '', 'Ringstr. 9', '', '', 'Wien', '1010', 'AT')").await;
    exec(pool, "INSERT INTO p_location VALUES (0, 4, '', '', 'Nebenweg 4', '', '', 'Berlin', '10117', 'DE')").await;
    exec(pool, "INSERT INTO p_partner_location VALUES (43005001, 0, 1, '2010-01-01', NULL, 'HOME', 1)").await;
    exec(pool, "INSERT INTO p_partner_location VALUES (43005003, 0, 3, '2010-01-01', NULL, 'HOME', 1)").await;
    exec(pool, "INSERT INTO p_partner_location VALUES (43005004, 0, 4, '2010-01-01', NULL, 'HOME', 1)").await;

    // ledger partners: two valid addresses, inactive, only an expired address
    exec(pool, "INSERT INTO p_partner VALUES (43000000, 'Germany Ledger', 'UNIT', 'ACTIVE')").await;
    exec(pool, "INSERT INTO p_partner VALUES (43000001, 'Closed Ledger', 'UNIT', 'INACTIVE')").await;
    exec(pool, "INSERT INTO p_partner VALUES (43000002, 'Moved Ledger', 'UNIT', 'ACTIVE')").await;
    exec(pool, "INSERT INTO p_partner_type VALUES (43000000, 'LEDGER')").await;
    exec(pool, "INSERT INTO p_partner_type VALUES (43000000, 'CHURCH')").await;
    exec(pool, "INSERT INTO p_partner_type VALUES (43000001, 'LEDGER')").await;
    exec(pool, "INSERT INTO p_partner_type VALUES (43000002, 'LEDGER')").await;
    exec(pool, "INSERT INTO p_location VALUES (0, 10, '', '', 'Alte Gasse 7', '', '', 'Hamburg', '20095', 'DE')").await;
    exec(pool, "INSERT INTO p_location VALUES (0, 11, '', '', 'Neue Str. 2', '', '', 'Hamburg', '20097', 'DE')").await;
    exec(pool, "INSERT INTO p_location VALUES (0, 12, '', '', 'Ehemalige Allee 3', '', '', 'Bonn', '53111', 'DE')").await;
    exec(pool, "INSERT INTO p_location VALUES (0, 13, '', '', 'Amtsweg 1', '', '', 'Kiel', '24103', 'DE')").await;
    exec(pool, "INSERT INTO p_partner_location VALUES (43000000, 0, 10, '2010-01-01', NULL, 'BUSINESS', 1)").await;
    exec(pool, "INSERT INTO p_partner_location VALUES (43000000, 0, 11, '2015-05-01', NULL, 'BUSINESS', 1)").await;
    exec(pool, "INSERT INTO p_partner_location VALUES (43000002, 0, 12, '2005-01-01', '2012-12-31', 'BUSINESS', 1)").await;
    exec(pool, "INSERT INTO p_partner_location VALUES (43000001, 0, 13, '2010-01-01', NULL, 'BUSINESS', 1)").await;

    exec(pool, "INSERT INTO a_account VALUES (43, '0100', 'Donations')").await;
    exec(pool, "INSERT INTO a_cost_centre VALUES (43, '4300', 'General Fund')").await;

    exec(pool, "INSERT INTO a_gift_batch VALUES (43, 1, '2017-03-01', 'Posted')").await;
    exec(pool, "INSERT INTO a_gift_batch VALUES (43, 2, '2017-06-15', 'Posted')").await;
    exec(pool, "INSERT INTO a_gift_batch VALUES (43, 3, '2017-07-01', 'Unposted')").await;
    exec(pool, "INSERT INTO a_gift_batch VALUES (43, 4, '2017-08-01', 'Posted')").await;

    exec(pool, "INSERT INTO a_gift VALUES (43, 1, 1, 43005001, '2017-03-01')").await;
    exec(pool, "INSERT INTO a_gift VALUES (43, 2, 1, 43005001, '2017-06-15')").await;
    exec(pool, "INSERT INTO a_gift VALUES (43, 1, 2, 43005002, '2017-03-01')").await;
    exec(pool, "INSERT INTO a_gift VALUES (43, 3, 1, 43005001, '2017-07-01')").await;
    exec(pool, "INSERT INTO a_gift VALUES (43, 4, 1, 43005003, '2017-08-01')").await;

    exec(pool, "INSERT INTO a_gift_detail VALUES (43, 1, 1, 1, 0, 50.0, 'Spring', '0100', '4300')").await;
    exec(pool, "INSERT INTO a_gift_detail VALUES (43, 2, 1, 1, 0, 1234.5, '', '0100', '4300')").await;
    exec(pool, "INSERT INTO a_gift_detail VALUES (43, 1, 2, 1, 0, 20.0, '', '0100', '4300')").await;
    exec(pool, "INSERT INTO a_gift_detail VALUES (43, 3, 1, 1, 0, 99.0, 'Unposted', '0100', '4300')").await;
    exec(pool, "INSERT INTO a_gift_detail VALUES (43, 4, 1, 1, 0, 10.0, '', '0100', '4300')").await;
}

fn standard_registry() -> ReportRegistry {
    ReportRegistry::with_standard_reports(Arc::new(ReportTemplates::new(None, None)))
}

fn city_params(city: &str) -> ParameterList {
    let mut params = ParameterList::new();
    params.add(CURRENT_REPORT, "PartnerByCity");
    params.add("param_city", city);
    params.add("param_today", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    params.add("param_active", true);
    params.add("param_only_addresses_valid_on", true);
    params
}

async fn wait_finished(jobs: &ReportJobs, job_id: &str) -> JobState {
    for _ in 0..500 {
        let progress = jobs.progress(job_id).await.unwrap();
        if progress.state.is_terminal() {
            return progress.state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} did not finish", job_id);
}

/// Runs until it is cancelled.
struct UntilCancelled;

#[async_trait]
impl ReportCalculator for UntilCancelled {
    fn name(&self) -> &'static str {
        "UntilCancelled"
    }

    async fn calculate(
        &self,
        _params: &ParameterList,
        _conn: &mut SqliteConnection,
        ctx: &CalculationContext,
    ) -> Result<CalculationResult> {
        loop {
            ctx.checkpoint()?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

struct Exploding;

#[async_trait]
impl ReportCalculator for Exploding {
    fn name(&self) -> &'static str {
        "Exploding"
    }

    async fn calculate(
        &self,
        _params: &ParameterList,
        _conn: &mut SqliteConnection,
        _ctx: &CalculationContext,
    ) -> Result<CalculationResult> {
        panic!("layout engine exploded");
    }
}

fn report_params(report: &str) -> ParameterList {
    let mut params = ParameterList::new();
    params.add(CURRENT_REPORT, report);
    params
}

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<OutgoingMail>>,
    fail: bool,
}

#[async_trait]
impl MailSender for RecordingMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<()> {
        if self.fail {
            return Err(ReportError::Mail("connection refused".to_string()));
        }
        self.sent.lock().unwrap().push(mail);
        Ok(())
    }
}

#[tokio::test]
async fn test_partner_by_city_runs_to_completion() {
    let env = setup().await;
    let jobs = env.standard_jobs();

    let job_id = jobs.start(city_params("Berlin")).await.unwrap();
    assert!(job_id.starts_with("ReportCalculation"));

    assert_eq!(wait_finished(&jobs, &job_id).await, JobState::Succeeded);
    assert_eq!(jobs.success(&job_id).await.unwrap(), Some(true));

    let report = jobs.error_message(&job_id).await.unwrap().unwrap();
    assert!(report.message.is_empty());
    assert!(report.fault.is_none());

    let html = jobs.download_html(&job_id).await.unwrap();
    assert!(html.contains("0043005001"));
    assert!(html.contains("Hauptstr. 1"));
    // inactive partner filtered out
    assert!(!html.contains("0043005004"));
    assert!(!html.contains("#PARTNERKEY"));
}

#[tokio::test]
async fn test_partner_by_special_types_lists_each_partner_once() {
    let env = setup().await;
    let jobs = env.standard_jobs();

    let mut params = report_params("PartnerBySpecialTypes");
    params.add("param_explicit_specialtypes", "LEDGER");
    params.add("param_active", true);
    params.add("param_today", NaiveDate::from_ymd_opt(2017, 1, 1).unwrap());
    params.add("param_only_addresses_valid_on", true);

    let job_id = jobs.start(params).await.unwrap();
    assert_eq!(wait_finished(&jobs, &job_id).await, JobState::Succeeded);
    let html = jobs.download_html(&job_id).await.unwrap();

    assert_eq!(html.matches("0043000000").count(), 1);
    // the most recently effective address wins
    assert!(html.contains("Neue Str. 2"));
    assert!(!html.contains("Alte Gasse 7"));
    assert!(html.contains("CHURCH, LEDGER") || html.contains("LEDGER, CHURCH"));

    // listed, but its only address expired before the report date
    assert_eq!(html.matches("0043000002").count(), 1);
    assert!(!html.contains("Ehemalige Allee 3"));

    assert!(!html.contains("0043000001"));
    assert!(!html.contains("0043005001"));
}

#[tokio::test]
async fn test_start_requires_current_report() {
    let env = setup().await;
    let jobs = env.standard_jobs();

    let err = jobs.start(ParameterList::new()).await.unwrap_err();
    assert!(matches!(err, ReportError::Validation(_)));
}

#[tokio::test]
async fn test_unknown_report_is_rejected() {
    let env = setup().await;
    let jobs = env.standard_jobs();

    let err = jobs.start(report_params("NoSuchReport")).await.unwrap_err();
    assert!(matches!(err, ReportError::UnknownReport(name) if name == "NoSuchReport"));
}

#[tokio::test]
async fn test_cancel_unknown_job_is_noop() {
    let env = setup().await;
    let jobs = env.standard_jobs();

    assert!(!jobs.cancel("ReportCalculation-unknown").await);
    assert!(matches!(
        jobs.success("ReportCalculation-unknown").await,
        Err(ReportError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn test_cancel_running_job() {
    let env = setup().await;
    let mut registry = standard_registry();
    registry.register(Arc::new(UntilCancelled));
    let jobs = env.jobs(registry, 1, 4);

    let job_id = jobs.start(report_params("UntilCancelled")).await.unwrap();
    assert_eq!(jobs.success(&job_id).await.unwrap(), None);
    assert!(jobs.error_message(&job_id).await.unwrap().is_none());

    assert!(jobs.cancel(&job_id).await);
    assert_eq!(wait_finished(&jobs, &job_id).await, JobState::Failed);
    assert_eq!(jobs.success(&job_id).await.unwrap(), Some(false));

    let report = jobs.error_message(&job_id).await.unwrap().unwrap();
    assert_eq!(report.message, "Report calculation was cancelled.");

    // cancelling a finished job changes nothing
    assert!(!jobs.cancel(&job_id).await);
    assert!(matches!(jobs.download_html(&job_id).await, Err(ReportError::NoResult(_))));
}

#[tokio::test]
async fn test_queued_job_cancelled_before_it_starts() {
    let env = setup().await;
    let mut registry = standard_registry();
    registry.register(Arc::new(UntilCancelled));
    let jobs = env.jobs(registry, 1, 4);

    let running = jobs.start(report_params("UntilCancelled")).await.unwrap();
    let queued = jobs.start(report_params("UntilCancelled")).await.unwrap();

    assert!(jobs.cancel(&queued).await);
    assert_eq!(wait_finished(&jobs, &queued).await, JobState::Failed);
    assert_eq!(jobs.progress(&running).await.unwrap().state, JobState::Running);

    jobs.cancel(&running).await;
    wait_finished(&jobs, &running).await;
}

#[tokio::test]
async fn test_admission_limit_reports_busy() {
    let env = setup().await;
    let mut registry = standard_registry();
    registry.register(Arc::new(UntilCancelled));
    let jobs = env.jobs(registry, 1, 1);

    let first = jobs.start(report_params("UntilCancelled")).await.unwrap();
    let err = jobs.start(report_params("UntilCancelled")).await.unwrap_err();
    assert!(matches!(err, ReportError::Busy));

    jobs.cancel(&first).await;
    wait_finished(&jobs, &first).await;
    // the admission permit is returned once the run task ends
    for _ in 0..100 {
        if jobs.start(report_params("PartnerByCity")).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("admission permit was never released");
}

#[tokio::test]
async fn test_panicking_calculator_is_recorded_as_failure() {
    let env = setup().await;
    let mut registry = standard_registry();
    registry.register(Arc::new(Exploding));
    let jobs = env.jobs(registry, 1, 4);

    let job_id = jobs.start(report_params("Exploding")).await.unwrap();
    assert_eq!(wait_finished(&jobs, &job_id).await, JobState::Failed);

    let report = jobs.error_message(&job_id).await.unwrap().unwrap();
    assert!(report.message.contains("layout engine exploded"));
    assert!(report.fault.is_some());
}

#[tokio::test]
async fn test_missing_city_fails_the_job() {
    let env = setup().await;
    let jobs = env.standard_jobs();

    let job_id = jobs.start(city_params("  ")).await.unwrap();
    assert_eq!(wait_finished(&jobs, &job_id).await, JobState::Failed);
    let report = jobs.error_message(&job_id).await.unwrap().unwrap();
    assert!(report.message.contains("param_city"));
}

#[tokio::test]
async fn test_exports_leave_no_temp_files() {
    let env = setup().await;
    let jobs = env.standard_jobs();

    let job_id = jobs.start(city_params("Berlin")).await.unwrap();
    wait_finished(&jobs, &job_id).await;

    let pdf = jobs.download_pdf(&job_id).await.unwrap();
    let excel = jobs.download_excel(&job_id).await.unwrap();
    assert!(pdf.starts_with("JVBERi0")); // "%PDF-"
    assert!(excel.starts_with("UEsDB")); // zip header
    assert_eq!(env.temp_file_count(), 0);
}

#[tokio::test]
async fn test_email_without_attachments_is_refused() {
    let env = setup().await;
    let mailer = Arc::new(RecordingMailer::default());
    let jobs = env.standard_jobs().with_mailer(mailer.clone());

    let job_id = jobs.start(city_params("Berlin")).await.unwrap();
    wait_finished(&jobs, &job_id).await;

    let (sent, verification) = jobs
        .send_email(&job_id, "office@example.org", false, false, "demo")
        .await
        .unwrap();
    assert!(!sent);
    assert!(verification.has_critical_errors());
    assert_eq!(verification.len(), 1);
    assert!(verification.contains_code("Missing Attachments"));
    assert!(mailer.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_email_reports_missing_configuration() {
    let env = setup().await;
    let jobs = env.standard_jobs();

    let job_id = jobs.start(city_params("Berlin")).await.unwrap();
    wait_finished(&jobs, &job_id).await;

    let (sent, verification) = jobs
        .send_email(&job_id, "office@example.org", true, false, "demo")
        .await
        .unwrap();
    assert!(!sent);
    // neither a server nor a sender address
    assert_eq!(verification.len(), 2);
    assert!(verification.contains_code("ERR_MISSINGEMAILCONFIGURATION"));
}

#[tokio::test]
async fn test_email_sends_attachments() {
    let env = setup().await;
    database::set_user_default(&env.pool, "demo", SMTP_FROM_ACCOUNT, "reports@example.org")
        .await
        .unwrap();
    let mailer = Arc::new(RecordingMailer::default());
    let jobs = env.standard_jobs().with_mailer(mailer.clone());

    let job_id = jobs.start(city_params("Berlin")).await.unwrap();
    wait_finished(&jobs, &job_id).await;

    let (sent, verification) = jobs
        .send_email(&job_id, "a@example.org; b@example.org", true, true, "demo")
        .await
        .unwrap();
    assert!(sent);
    assert!(verification.is_empty());

    let mails = mailer.sent.lock().unwrap();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].from, "reports@example.org");
    assert_eq!(mails[0].to, vec!["a@example.org", "b@example.org"]);
    assert_eq!(mails[0].subject, "PartnerByCity");
    let names: Vec<&str> = mails[0].attachments.iter().map(|a| a.file_name.as_str()).collect();
    assert_eq!(names, vec!["PartnerByCity.xlsx", "PartnerByCity.pdf"]);
    assert_eq!(env.temp_file_count(), 0);
}

#[tokio::test]
async fn test_email_server_failure_is_reported() {
    let env = setup().await;
    database::set_user_default(&env.pool, "demo", SMTP_FROM_ACCOUNT, "reports@example.org")
        .await
        .unwrap();
    let mailer = Arc::new(RecordingMailer {
        fail: true,
        ..Default::default()
    });
    let jobs = env.standard_jobs().with_mailer(mailer);

    let job_id = jobs.start(city_params("Berlin")).await.unwrap();
    wait_finished(&jobs, &job_id).await;

    let (sent, verification) = jobs
        .send_email(&job_id, "a@example.org", false, true, "demo")
        .await
        .unwrap();
    assert!(!sent);
    assert!(verification.contains_code("Server problems"));
}

#[tokio::test]
async fn test_release_forgets_job() {
    let env = setup().await;
    let jobs = env.standard_jobs();

    let job_id = jobs.start(city_params("Berlin")).await.unwrap();
    wait_finished(&jobs, &job_id).await;

    jobs.release(&job_id).await.unwrap();
    assert!(matches!(jobs.progress(&job_id).await, Err(ReportError::JobNotFound(_))));
    assert!(matches!(jobs.release(&job_id).await, Err(ReportError::JobNotFound(_))));
}

fn receipt_request(template: &str) -> AnnualReceiptRequest {
    AnnualReceiptRequest {
        ledger_number: LEDGER,
        start_date: NaiveDate::from_ymd_opt(2017, 1, 1).unwrap(),
        end_date: NaiveDate::from_ymd_opt(2017, 12, 31).unwrap(),
        html_template: template.to_string(),
        donor_key: 0,
        logo: None,
        signature: None,
        printed_on: NaiveDate::from_ymd_opt(2018, 1, 15).unwrap(),
    }
}

const RECEIPT_TEMPLATE: &str = "<html><body><p>#DONORTITLE #DONORNAME</p>\
<p>#STREETNAME, #POSTALCODE #CITY #COUNTRYNAME</p><p>#DATE</p>\
<table><tr><td>#DONATIONDATE</td><td>#AMOUNT</td><td>#COMMENTONE</td></tr></table>\
</body></html>";

#[tokio::test]
async fn test_annual_receipts_skip_donors_without_address() {
    let env = setup().await;
    let request = AnnualReceiptRequest {
        donor_key: 43005001,
        ..receipt_request(RECEIPT_TEMPLATE)
    };

    let receipts = create_annual_gift_receipts(&env.pool, &request, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(receipts.letters, 1);
    assert_eq!(receipts.html.matches("<body").count(), 1);
    assert_eq!(receipts.html.matches("<tr>").count(), 2);
    assert!(receipts.html.contains("Herr Max Mustermann"));
    assert!(receipts.html.contains("1,234.50 EUR"));
    assert!(receipts.html.contains("01.03.2017"));
    assert!(!receipts.html.contains("Unposted"));
    assert!(!receipts.html.contains("Deutschland"));
    assert!(receipts.html.contains("15. January 2018"));
    assert!(!receipts.pdf.is_empty());

    // Berta gave in 2017 but has no address
    let all = create_annual_gift_receipts(&env.pool, &receipt_request(RECEIPT_TEMPLATE), Duration::from_secs(10))
        .await
        .unwrap();
    assert!(!all.html.contains("Beispiel"));
}

#[tokio::test]
async fn test_annual_receipts_one_letter_when_second_donor_has_no_address() {
    let env = setup().await;
    // Max: address and two posted gifts; Berta: one gift and no address
    let request = AnnualReceiptRequest {
        end_date: NaiveDate::from_ymd_opt(2017, 6, 30).unwrap(),
        ..receipt_request(RECEIPT_TEMPLATE)
    };

    let receipts = create_annual_gift_receipts(&env.pool, &request, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(receipts.letters, 1);
    assert_eq!(receipts.html.matches("<body").count(), 1);
    assert_eq!(receipts.html.matches("<tr>").count(), 2);
    assert!(receipts.html.contains("Max Mustermann"));
    assert!(!receipts.html.contains("Berta"));
}

#[tokio::test]
async fn test_annual_receipts_print_foreign_country() {
    let env = setup().await;
    let request = AnnualReceiptRequest {
        donor_key: 43005003,
        ..receipt_request(RECEIPT_TEMPLATE)
    };

    let receipts = create_annual_gift_receipts(&env.pool, &request, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(receipts.letters, 1);
    assert!(receipts.html.contains("Österreich"));
}

#[tokio::test]
async fn test_annual_receipts_reject_reversed_dates() {
    let env = setup().await;
    let mut request = receipt_request(RECEIPT_TEMPLATE);
    std::mem::swap(&mut request.start_date, &mut request.end_date);

    let err = create_annual_gift_receipts(&env.pool, &request, Duration::from_secs(10))
        .await
        .unwrap_err();
    assert!(matches!(err, ReportError::Validation(_)));
}

fn unwrap_envelope(body: &Value) -> Value {
    serde_json::from_str(body["d"].as_str().unwrap()).unwrap()
}

#[actix_web::test]
async fn test_http_start_and_poll_report() {
    let env = setup().await;
    let state = AppState::new(AppConfig::default(), env.standard_jobs());
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(configure_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/reports")
        .set_json(json!({ "AParameters": {
            "currentReport": "PartnerByCity",
            "param_city": "Berlin",
            "param_active": true
        }}))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let started = unwrap_envelope(&body);
    assert_eq!(started["result"], true);
    let job_id = started["AJobID"].as_str().unwrap().to_string();

    wait_finished(&state.jobs, &job_id).await;

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/reports/{}/success", job_id))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(unwrap_envelope(&body), json!({ "finished": true, "result": true }));
}

#[actix_web::test]
async fn test_http_errors_use_envelope() {
    let env = setup().await;
    let state = AppState::new(AppConfig::default(), env.standard_jobs());
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(configure_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/v1/reports")
        .set_json(json!({ "AParameters": { "currentReport": "NoSuchReport" } }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(unwrap_envelope(&body)["result"], false);

    let req = test::TestRequest::get()
        .uri("/api/v1/reports/ReportCalculation-missing/progress")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}

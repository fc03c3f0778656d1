// src/api/handlers/reports.rs
use actix_web::{HttpRequest, HttpResponse, Result, web};
use serde::Deserialize;
use serde_json::json;

use crate::api::AppState;
use crate::api::envelope;
use crate::parameters::ParameterList;

#[derive(Deserialize)]
pub struct StartRequest {
    #[serde(rename = "AParameters")]
    pub parameters: serde_json::Value,
}

#[derive(Deserialize)]
pub struct EmailRequest {
    #[serde(rename = "AEmailAddresses")]
    pub addresses: String,
    #[serde(rename = "AAttachExcelFile", default)]
    pub attach_excel: bool,
    #[serde(rename = "AAttachPDF", default)]
    pub attach_pdf: bool,
}

pub async fn list_reports(state: web::Data<AppState>) -> Result<HttpResponse> {
    envelope::ok(&json!({ "result": state.jobs.report_names() }))
}

pub async fn start_report(
    state: web::Data<AppState>,
    req: web::Json<StartRequest>,
) -> Result<HttpResponse> {
    let params = ParameterList::from_json(req.into_inner().parameters)?;
    let job_id = state.jobs.start(params).await?;
    envelope::ok(&json!({ "result": true, "AJobID": job_id }))
}

pub async fn get_progress(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let progress = state.jobs.progress(&path).await?;
    envelope::ok(&progress)
}

pub async fn cancel_report(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let cancelled = state.jobs.cancel(&path).await;
    envelope::ok(&json!({ "result": cancelled }))
}

pub async fn get_success(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let success = state.jobs.success(&path).await?;
    envelope::ok(&json!({
        "finished": success.is_some(),
        "result": success.unwrap_or(false),
    }))
}

pub async fn get_error_message(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let report = state.jobs.error_message(&path).await?;
    envelope::ok(&json!({
        "finished": report.is_some(),
        "result": report.as_ref().map(|r| r.message.clone()).unwrap_or_default(),
        "AException": report.and_then(|r| r.fault),
    }))
}

pub async fn download_html(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let html = state.jobs.download_html(&path).await?;
    envelope::ok(&json!({ "result": html }))
}

pub async fn download_pdf(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let pdf = state.jobs.download_pdf(&path).await?;
    envelope::ok(&json!({ "result": pdf }))
}

pub async fn download_excel(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let excel = state.jobs.download_excel(&path).await?;
    envelope::ok(&json!({ "result": excel }))
}

pub async fn send_email(
    state: web::Data<AppState>,
    http: HttpRequest,
    path: web::Path<String>,
    req: web::Json<EmailRequest>,
) -> Result<HttpResponse> {
    let user_id = state.user_id(&http);
    let req = req.into_inner();
    let (sent, verification) = state
        .jobs
        .send_email(&path, &req.addresses, req.attach_excel, req.attach_pdf, &user_id)
        .await?;
    envelope::ok(&json!({ "result": sent, "AVerificationResult": verification }))
}

pub async fn release_report(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    state.jobs.release(&path).await?;
    envelope::ok(&json!({ "result": true }))
}

// src/api/handlers/health.rs
use actix_web::{HttpResponse, Result, web};
use serde_json::json;

use crate::api::AppState;
use crate::api::envelope;

pub async fn health_check(state: web::Data<AppState>) -> Result<HttpResponse> {
    let database = match sqlx::query("SELECT 1").execute(state.jobs.pool()).await {
        Ok(_) => "ok".to_string(),
        Err(e) => {
            log::warn!("Health check could not reach the database: {}", e);
            format!("error: {}", e)
        }
    };

    envelope::ok(&json!({
        "status": "healthy",
        "service": "petra-reports",
        "version": env!("CARGO_PKG_VERSION"),
        "database": database,
        "jobs": state.jobs.tracker().len().await,
    }))
}

// src/api/state.rs
use crate::config::AppConfig;
use crate::runner::ReportJobs;
use actix_web::HttpRequest;
use std::sync::Arc;

/// Header naming the user whose preferences (e.g. mail sender) apply.
pub const USER_HEADER: &str = "X-Petra-User";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub jobs: ReportJobs,
}

impl AppState {
    pub fn new(config: AppConfig, jobs: ReportJobs) -> Self {
        Self {
            config: Arc::new(config),
            jobs,
        }
    }

    pub fn user_id(&self, req: &HttpRequest) -> String {
        req.headers()
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.config.default_user.clone())
    }
}

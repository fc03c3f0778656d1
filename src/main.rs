use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use std::sync::Arc;
use std::time::Duration;

use petra_reports::api::handlers::WsBroker;
use petra_reports::api::{AppState, configure_routes};
use petra_reports::banner;
use petra_reports::config::AppConfig;
use petra_reports::database;
use petra_reports::mail::SmtpMailer;
use petra_reports::reports::{ReportRegistry, ReportTemplates};
use petra_reports::runner::{JobSettings, ReportJobs};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn startup_error(context: &str, err: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::other(format!("{}: {}", context, err))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    banner::print_banner();

    if let Err(e) = dotenvy::dotenv() {
        eprintln!("⚠️  No .env file loaded ({}), using the process environment", e);
    }

    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::load().map_err(|e| startup_error("Failed to load configuration", e))?;
    std::fs::create_dir_all(&config.temp_dir)?;

    let pool = database::init_db(&config.database_url)
        .await
        .map_err(|e| startup_error("Failed to open the database", e))?;

    let templates = Arc::new(ReportTemplates::new(
        config.path_custom_reports.clone(),
        config.path_standard_reports.clone(),
    ));
    let registry = ReportRegistry::with_standard_reports(templates);

    let mut jobs = ReportJobs::new(pool, registry, JobSettings::from(&config));
    match &config.smtp {
        Some(smtp) => {
            log::info!("Sending report emails through {}:{}", smtp.host, smtp.port);
            jobs = jobs.with_mailer(Arc::new(SmtpMailer::new(smtp.clone())));
        }
        None => log::warn!("No SMTP server configured, report emails are disabled"),
    }

    let sweeper = jobs.spawn_sweeper(SWEEP_INTERVAL);
    let broker = WsBroker::new();
    let forwarder = broker.forward_progress(jobs.tracker());

    let bind = (config.bind_address.clone(), config.port);
    let state = AppState::new(config, jobs);

    log::info!("🚀 Serving reports on http://{}:{}", bind.0, bind.1);

    let result = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .app_data(web::Data::new(broker.clone()))
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .configure(configure_routes)
    })
    .bind(bind)?
    .run()
    .await;

    sweeper.abort();
    forwarder.abort();
    result
}

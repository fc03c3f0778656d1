// src/api/routes.rs
use actix_web::web;
use super::handlers;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(handlers::health_check))
            .service(
                web::scope("/reports")
                    .route("", web::get().to(handlers::list_reports))
                    .route("", web::post().to(handlers::start_report))
                    .route("/{id}", web::delete().to(handlers::release_report))
                    .route("/{id}/progress", web::get().to(handlers::get_progress))
                    .route("/{id}/cancel", web::post().to(handlers::cancel_report))
                    .route("/{id}/success", web::get().to(handlers::get_success))
                    .route("/{id}/error", web::get().to(handlers::get_error_message))
                    .route("/{id}/html", web::get().to(handlers::download_html))
                    .route("/{id}/pdf", web::get().to(handlers::download_pdf))
                    .route("/{id}/excel", web::get().to(handlers::download_excel))
                    .route("/{id}/email", web::post().to(handlers::send_email))
            )
            .service(
                web::scope("/receipts")
                    .route("/annual", web::post().to(handlers::create_annual_receipts))
            )
    )
    .route("/ws", web::get().to(handlers::ws_handler));
}

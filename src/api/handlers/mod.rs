// src/api/handlers/mod.rs
mod health;
mod receipts;
mod reports;
pub mod ws;

pub use health::health_check;
pub use receipts::create_annual_receipts;
pub use reports::{
    cancel_report, download_excel, download_html, download_pdf, get_error_message, get_progress,
    get_success, list_reports, release_report, send_email, start_report,
};
pub use ws::{JobUpdate, WsBroker, ws_handler};

// src/errors.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to read or write file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to write spreadsheet: {0}")]
    Spreadsheet(#[from] rust_xlsxwriter::XlsxError),

    #[error("Invalid base64 data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Report '{0}' is not registered")]
    UnknownReport(String),

    #[error("Report job '{0}' not found")]
    JobNotFound(String),

    #[error("Report job '{0}' has already finished")]
    AlreadyFinished(String),

    #[error("Report job '{0}' has no result to export")]
    NoResult(String),

    #[error("Too many report calculations queued, try again later")]
    Busy,

    #[error("Report calculation was cancelled.")]
    Cancelled,

    #[error("Statement timed out")]
    StatementTimeout,

    #[error("Transaction serialisation conflict: {0}")]
    SerializationConflict(String),

    #[error("Report template '{0}' not found")]
    TemplateNotFound(String),

    #[error("Sending email failed: {0}")]
    Mail(String),

    #[error("Report '{report}' failed")]
    Calculation {
        report: String,
        #[source]
        source: Box<ReportError>,
    },

    #[error("Report calculation panicked: {0}")]
    Panicked(String),
}

pub type Result<T> = std::result::Result<T, ReportError>;

// src/database.rs
use chrono::NaiveDate;
use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::errors::{ReportError, Result};

const MAX_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
/// SQLite VM instructions between two deadline checks of a running statement.
const PROGRESS_INTERVAL_OPS: i32 = 1_000;

/// Opens (creating if needed) the SQLite database and applies the migrations.
pub async fn init_db(database_url: &str) -> Result<SqlitePool> {
    let db_path = db_path_from_url(database_url)?;

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    log::info!("Opening database {}", db_path.display());

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    log::info!("Database migrations completed");

    Ok(pool)
}

fn db_path_from_url(database_url: &str) -> Result<PathBuf> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .ok_or_else(|| ReportError::Config("DATABASE_URL must start with 'sqlite:'".to_string()))?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ReportError::Config("DATABASE_URL names no database file".to_string()));
    }
    Ok(PathBuf::from(path))
}

/// How a database fault should be treated by the report jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbFault {
    /// Concurrent transactions collided; retrying is up to the caller.
    SerializationConflict,
    /// The statement was cancelled for running too long.
    StatementTimeout,
    Other,
}

pub fn classify(err: &sqlx::Error) -> DbFault {
    match err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // postgres serialization_failure, sqlite BUSY and BUSY_SNAPSHOT
            Some("40001") | Some("5") | Some("517") => DbFault::SerializationConflict,
            // postgres query_canceled, sqlite INTERRUPT
            Some("57014") | Some("9") => DbFault::StatementTimeout,
            _ => DbFault::Other,
        },
        _ => DbFault::Other,
    }
}

/// The driver's own message, without the wrapping text of `sqlx::Error`.
pub fn fault_message(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    }
}

/// Runs `work` inside a read-only transaction that is always rolled back.
///
/// The unit of work is bounded by `timeout`: a statement still running at the
/// deadline is interrupted inside SQLite and the call yields
/// [`ReportError::StatementTimeout`]. Firing `cancel` interrupts it the same
/// way and yields [`ReportError::Cancelled`]. Other errors from `work` are
/// returned as they are so the caller can classify them.
pub async fn with_read_transaction<T, F>(
    pool: &SqlitePool,
    timeout: Duration,
    cancel: &CancellationToken,
    work: F,
) -> Result<T>
where
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>>,
{
    let mut conn = pool.acquire().await?;

    let caught = AssertUnwindSafe(run_read_only(&mut *conn, timeout, cancel, work))
        .catch_unwind()
        .await;
    let outcome = match caught {
        Ok(outcome) => outcome,
        Err(panic) => {
            // still read-only and mid-transaction, keep it out of the pool
            drop(conn.detach());
            std::panic::resume_unwind(panic);
        }
    };

    // the connection goes back to the pool, so it must accept writes again
    // and must not carry the interrupt handler
    if let Err(e) = reset_connection(&mut conn).await {
        log::warn!("Could not reset read-only connection, discarding it: {}", e);
        drop(conn.detach());
    }

    outcome
}

async fn reset_connection(conn: &mut SqliteConnection) -> Result<()> {
    conn.lock_handle().await?.remove_progress_handler();
    sqlx::query("PRAGMA query_only = OFF").execute(&mut *conn).await?;
    Ok(())
}

async fn run_read_only<T, F>(
    conn: &mut SqliteConnection,
    timeout: Duration,
    cancel: &CancellationToken,
    work: F,
) -> Result<T>
where
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>>,
{
    let deadline = Instant::now() + timeout;
    let interrupt = cancel.clone();
    conn.lock_handle()
        .await?
        .set_progress_handler(PROGRESS_INTERVAL_OPS, move || {
            Instant::now() < deadline && !interrupt.is_cancelled()
        });

    sqlx::query("PRAGMA query_only = ON").execute(&mut *conn).await?;

    let mut tx = sqlx::Connection::begin(&mut *conn).await?;
    let outcome = match tokio::time::timeout(timeout, work(&mut *tx)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) if cancel.is_cancelled() => Err(ReportError::Cancelled),
        Ok(Err(e)) if Instant::now() >= deadline && is_interrupted(&e) => Err(ReportError::StatementTimeout),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ReportError::StatementTimeout),
    };

    // waits for an interrupted statement to stop, then lets the rollback run unchecked
    match tx.lock_handle().await {
        Ok(mut handle) => handle.remove_progress_handler(),
        Err(e) => log::warn!("Could not remove the statement deadline: {}", e),
    }
    if let Err(e) = tx.rollback().await {
        log::warn!("Rolling back read transaction failed: {}", e);
    }

    outcome
}

/// Whether `err` comes from a statement SQLite interrupted, possibly wrapped
/// by a report calculator.
fn is_interrupted(err: &ReportError) -> bool {
    match err {
        ReportError::Database(db) => classify(db) == DbFault::StatementTimeout,
        ReportError::Calculation { source, .. } => is_interrupted(source),
        _ => false,
    }
}

/// Preferences stored for `user_id` (e.g. `SmtpFromAccount`).
pub async fn get_user_defaults(pool: &SqlitePool, user_id: &str) -> Result<HashMap<String, String>> {
    let rows = sqlx::query(
        r#"
        SELECT default_code, default_value
        FROM s_user_defaults
        WHERE user_id = ?
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| (row.get::<String, _>(0), row.get::<String, _>(1)))
        .collect())
}

pub async fn set_user_default(pool: &SqlitePool, user_id: &str, code: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO s_user_defaults (user_id, default_code, default_value)
        VALUES (?, ?, ?)
        ON CONFLICT (user_id, default_code) DO UPDATE SET default_value = excluded.default_value
        "#,
    )
    .bind(user_id)
    .bind(code)
    .bind(value)
    .execute(pool)
    .await?;

    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ledger {
    pub ledger_number: i64,
    pub name: String,
    pub country_code: String,
    pub base_currency: String,
}

pub async fn get_ledger(conn: &mut SqliteConnection, ledger_number: i64) -> Result<Ledger> {
    let row = sqlx::query(
        r#"
        SELECT ledger_number, ledger_name, country_code, base_currency
        FROM a_ledger
        WHERE ledger_number = ?
        "#,
    )
    .bind(ledger_number)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| ReportError::Validation(format!("Ledger {} does not exist", ledger_number)))?;

    Ok(Ledger {
        ledger_number: row.get(0),
        name: row.get(1),
        country_code: row.get(2),
        base_currency: row.get(3),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Donor {
    pub partner_key: i64,
    pub short_name: String,
}

/// Donors with posted gifts in the ledger between `start` and `end`
/// (inclusive), ordered by name. `donor_key` 0 means all donors.
pub async fn get_donors(
    conn: &mut SqliteConnection,
    ledger_number: i64,
    start: NaiveDate,
    end: NaiveDate,
    donor_key: i64,
) -> Result<Vec<Donor>> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT p.partner_key, p.short_name
        FROM a_gift g
        JOIN a_gift_batch b
          ON b.ledger_number = g.ledger_number AND b.batch_number = g.batch_number
        JOIN p_partner p ON p.partner_key = g.donor_key
        WHERE g.ledger_number = ?
          AND b.batch_status = 'Posted'
          AND b.gl_effective_date BETWEEN ? AND ?
          AND (? = 0 OR g.donor_key = ?)
        ORDER BY p.short_name, p.partner_key
        "#,
    )
    .bind(ledger_number)
    .bind(date_to_db(start))
    .bind(date_to_db(end))
    .bind(donor_key)
    .bind(donor_key)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| Donor {
            partner_key: row.get(0),
            short_name: row.get(1),
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Donation {
    pub date_effective: NaiveDate,
    pub amount: f64,
    pub comment_one: String,
    pub account_desc: String,
    pub cost_centre_desc: String,
}

pub async fn get_donations(
    conn: &mut SqliteConnection,
    ledger_number: i64,
    start: NaiveDate,
    end: NaiveDate,
    donor_key: i64,
) -> Result<Vec<Donation>> {
    let rows = sqlx::query(
        r#"
        SELECT b.gl_effective_date,
               d.gift_transaction_amount,
               COALESCE(d.comment_one, ''),
               COALESCE(a.account_code_short_desc, ''),
               COALESCE(c.cost_centre_name, '')
        FROM a_gift_detail d
        JOIN a_gift g
          ON g.ledger_number = d.ledger_number
         AND g.batch_number = d.batch_number
         AND g.gift_transaction_number = d.gift_transaction_number
        JOIN a_gift_batch b
          ON b.ledger_number = g.ledger_number AND b.batch_number = g.batch_number
        LEFT JOIN a_account a
          ON a.ledger_number = d.ledger_number AND a.account_code = d.account_code
        LEFT JOIN a_cost_centre c
          ON c.ledger_number = d.ledger_number AND c.cost_centre_code = d.cost_centre_code
        WHERE g.ledger_number = ?
          AND b.batch_status = 'Posted'
          AND b.gl_effective_date BETWEEN ? AND ?
          AND g.donor_key = ?
        ORDER BY b.gl_effective_date, g.batch_number, g.gift_transaction_number, d.detail_number
        "#,
    )
    .bind(ledger_number)
    .bind(date_to_db(start))
    .bind(date_to_db(end))
    .bind(donor_key)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(Donation {
                date_effective: date_from_db(&row.get::<String, _>(0))?,
                amount: row.get(1),
                comment_one: row.get(2),
                account_desc: row.get(3),
                cost_centre_desc: row.get(4),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Location {
    pub site_key: i64,
    pub location_key: i64,
    pub building1: String,
    pub building2: String,
    pub street_name: String,
    pub locality: String,
    pub address3: String,
    pub city: String,
    pub postal_code: String,
    pub country_code: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartnerLocation {
    pub date_effective: Option<NaiveDate>,
    pub date_good_until: Option<NaiveDate>,
    pub send_mail: bool,
    pub location: Location,
}

impl PartnerLocation {
    /// Open-ended bounds count as valid.
    pub fn is_valid_on(&self, day: NaiveDate) -> bool {
        self.date_effective.is_none_or(|start| start <= day)
            && self.date_good_until.is_none_or(|end| end >= day)
    }
}

pub async fn get_partner_locations(
    conn: &mut SqliteConnection,
    partner_key: i64,
) -> Result<Vec<PartnerLocation>> {
    let rows = sqlx::query(
        r#"
        SELECT pl.date_effective, pl.date_good_until, pl.send_mail,
               l.site_key, l.location_key,
               COALESCE(l.building1, ''), COALESCE(l.building2, ''),
               COALESCE(l.street_name, ''), COALESCE(l.locality, ''),
               COALESCE(l.address3, ''), COALESCE(l.city, ''),
               COALESCE(l.postal_code, ''), COALESCE(l.country_code, '')
        FROM p_partner_location pl
        JOIN p_location l
          ON l.site_key = pl.site_key AND l.location_key = pl.location_key
        WHERE pl.partner_key = ?
        ORDER BY l.site_key, l.location_key
        "#,
    )
    .bind(partner_key)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(PartnerLocation {
                date_effective: optional_date(row.get::<Option<String>, _>(0))?,
                date_good_until: optional_date(row.get::<Option<String>, _>(1))?,
                send_mail: row.get::<i64, _>(2) != 0,
                location: Location {
                    site_key: row.get(3),
                    location_key: row.get(4),
                    building1: row.get(5),
                    building2: row.get(6),
                    street_name: row.get(7),
                    locality: row.get(8),
                    address3: row.get(9),
                    city: row.get(10),
                    postal_code: row.get(11),
                    country_code: row.get(12),
                },
            })
        })
        .collect()
}

pub async fn get_country_name_local(conn: &mut SqliteConnection, country_code: &str) -> Result<Option<String>> {
    let name = sqlx::query_scalar::<_, String>(
        "SELECT country_name_local FROM p_country WHERE country_code = ?",
    )
    .bind(country_code)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(name)
}

pub fn date_to_db(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn date_from_db(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| ReportError::Database(sqlx::Error::Decode(Box::new(e))))
}

fn optional_date(value: Option<String>) -> Result<Option<NaiveDate>> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => date_from_db(text).map(Some),
    }
}

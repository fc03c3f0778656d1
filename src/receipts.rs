// src/receipts.rs
//! Annual gift receipts.
//!
//! For every donor with posted gifts in the date range the HTML letter
//! template is filled with the donor's name, best postal address and one
//! table row per donation. All letters are merged into one HTML document
//! (one `<body>` per letter) and rendered to PDF as well.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{Datelike, NaiveDate};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::database::{self, Donation, Donor, Location, PartnerLocation};
use crate::errors::{ReportError, Result};
use crate::export::pdf::PdfDocument;
use crate::template::{ROW_PLACEHOLDER, escape_html, get_table_row, html_to_text, replace_tokens};

/// Token marking the repeating donation row in the letter template.
const ROW_SENTINEL: &str = "#AMOUNT";

/// An image uploaded with the template, referenced there by file name.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedImage {
    pub file_name: String,
    /// `data:` URL with the image content.
    pub data_url: String,
}

#[derive(Debug, Clone)]
pub struct AnnualReceiptRequest {
    pub ledger_number: i64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// The letter template, either plain HTML or a base64 `data:` URL.
    pub html_template: String,
    /// 0 selects all donors.
    pub donor_key: i64,
    pub logo: Option<EmbeddedImage>,
    pub signature: Option<EmbeddedImage>,
    /// Date printed on the letters; also the day addresses must be valid on.
    pub printed_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnualReceipts {
    pub html: String,
    /// Base64 encoded PDF rendering of `html`.
    pub pdf: String,
    pub letters: usize,
}

pub async fn create_annual_gift_receipts(
    pool: &SqlitePool,
    request: &AnnualReceiptRequest,
    timeout: Duration,
) -> Result<AnnualReceipts> {
    if request.end_date < request.start_date {
        return Err(ReportError::Validation(format!(
            "End date {} is before start date {}",
            request.end_date, request.start_date
        )));
    }
    let template = prepare_template(request)?;

    let request = request.clone();
    let letters = database::with_read_transaction(pool, timeout, &CancellationToken::new(), move |conn| {
        Box::pin(async move { format_letters(conn, &request, &template).await })
    })
    .await?;

    let mut document = PdfDocument::new();
    for letter in &letters {
        document.add_section(&html_to_text(letter));
    }

    log::info!("Formatted {} annual receipt letter(s)", letters.len());
    Ok(AnnualReceipts {
        html: combine_letters(&letters),
        pdf: STANDARD.encode(document.to_bytes()),
        letters: letters.len(),
    })
}

async fn format_letters(
    conn: &mut SqliteConnection,
    request: &AnnualReceiptRequest,
    template: &str,
) -> Result<Vec<String>> {
    let ledger = database::get_ledger(conn, request.ledger_number).await?;
    let donors = database::get_donors(
        conn,
        request.ledger_number,
        request.start_date,
        request.end_date,
        request.donor_key,
    )
    .await?;

    let mut letters = Vec::new();
    for donor in donors {
        let donations = database::get_donations(
            conn,
            request.ledger_number,
            request.start_date,
            request.end_date,
            donor.partner_key,
        )
        .await?;
        if donations.is_empty() {
            continue;
        }

        let locations = database::get_partner_locations(conn, donor.partner_key).await?;
        let Some(address) = best_address(&locations, request.printed_on) else {
            log::info!(
                "Skipping donor {} ({}): no postal address",
                donor.partner_key,
                donor.short_name
            );
            continue;
        };

        let country_name = if address.location.country_code == ledger.country_code {
            String::new()
        } else {
            database::get_country_name_local(conn, &address.location.country_code)
                .await?
                .unwrap_or_else(|| address.location.country_code.clone())
        };

        letters.push(format_letter(
            template,
            &donor,
            &address.location,
            &country_name,
            &donations,
            &ledger.base_currency,
            request.printed_on,
        ));
    }
    Ok(letters)
}

/// Decodes a `data:` URL template and points the image references at the
/// uploaded images.
fn prepare_template(request: &AnnualReceiptRequest) -> Result<String> {
    let mut template = decode_data_url(&request.html_template)?;
    for image in [&request.logo, &request.signature].into_iter().flatten() {
        if image.file_name.is_empty() || image.data_url.is_empty() {
            continue;
        }
        for quote in ['"', '\''] {
            template = template.replace(
                &format!("{q}{}{q}", image.file_name, q = quote),
                &format!("{q}{}{q}", image.data_url, q = quote),
            );
        }
    }
    Ok(template)
}

fn decode_data_url(value: &str) -> Result<String> {
    if !value.starts_with("data:") {
        return Ok(value.to_string());
    }
    let Some((_, payload)) = value.split_once(";base64,") else {
        return Err(ReportError::Validation(
            "Template data URL is not base64 encoded".to_string(),
        ));
    };
    let bytes = STANDARD.decode(payload.trim())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn format_letter(
    template: &str,
    donor: &Donor,
    location: &Location,
    country_name: &str,
    donations: &[Donation],
    currency: &str,
    printed_on: NaiveDate,
) -> String {
    let (title, name) = format_short_name(&donor.short_name);

    let mut values: HashMap<&str, String> = HashMap::new();
    values.insert("#DONORTITLE", title);
    values.insert("#DONORNAME", name);
    values.insert("#STREETNAME", location.street_name.clone());
    values.insert("#LOCATION", location.locality.clone());
    values.insert("#ADDRESS3", location.address3.clone());
    values.insert("#BUILDING1", location.building1.clone());
    values.insert("#BUILDING2", location.building2.clone());
    values.insert("#CITY", location.city.clone());
    values.insert("#POSTALCODE", location.postal_code.clone());
    values.insert("#DATE", printed_on.format("%-d. %B %Y").to_string());
    values.insert("#COUNTRYNAME", country_name.to_string());
    let values: HashMap<&str, String> = values
        .into_iter()
        .map(|(token, value)| (token, escape_html(&value)))
        .collect();

    let (letter, row_template) = get_table_row(&replace_tokens(template, &values), ROW_SENTINEL);

    let mut rows = String::new();
    for donation in donations {
        let mut row: HashMap<&str, String> = HashMap::new();
        row.insert("#DONATIONDATE", donation.date_effective.format("%d.%m.%Y").to_string());
        row.insert("#AMOUNT", format_amount(donation.amount, currency));
        row.insert("#COMMENTONE", escape_html(&donation.comment_one));
        row.insert("#ACCOUNTDESC", escape_html(&donation.account_desc));
        row.insert("#COSTCENTREDESC", escape_html(&donation.cost_centre_desc));
        rows.push_str(&replace_tokens(&row_template, &row));
    }

    letter.replace(ROW_PLACEHOLDER, &rows)
}

/// Splits a partner short name of the form `Family, Given, Title` into the
/// title and the name in reading order (`Given Family`).
pub fn format_short_name(short_name: &str) -> (String, String) {
    let parts: Vec<&str> = short_name.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [family, given, title, ..] => (title.to_string(), join_name(given, family)),
        [family, given] => (String::new(), join_name(given, family)),
        _ => (String::new(), short_name.trim().to_string()),
    }
}

fn join_name(given: &str, family: &str) -> String {
    [given, family]
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `1234.5` → `1,234.50 EUR`.
pub fn format_amount(amount: f64, currency: &str) -> String {
    let cents = (amount.abs() * 100.0).round() as u64;
    let whole = (cents / 100).to_string();

    let mut grouped = String::new();
    for (index, digit) in whole.chars().enumerate() {
        if index > 0 && (whole.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    let sign = if amount < 0.0 && cents > 0 { "-" } else { "" };
    format!("{}{}.{:02} {}", sign, grouped, cents % 100, currency)
        .trim_end()
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum AddressStatus {
    Current,
    Future,
    Expired,
}

fn address_status(location: &PartnerLocation, day: NaiveDate) -> AddressStatus {
    if location.date_effective.is_some_and(|start| start > day) {
        AddressStatus::Future
    } else if location.date_good_until.is_some_and(|end| end < day) {
        AddressStatus::Expired
    } else {
        AddressStatus::Current
    }
}

/// The address to print on a letter dated `day`.
///
/// Current addresses win, mail-enabled ones first and the most recently
/// effective among them. Without a current address the next future one is
/// used, and failing that the one that expired last.
pub fn best_address(locations: &[PartnerLocation], day: NaiveDate) -> Option<&PartnerLocation> {
    locations.iter().min_by_key(|location| {
        let status = address_status(location, day);
        let effective = location.date_effective.unwrap_or(NaiveDate::MIN).num_days_from_ce();
        let until = location.date_good_until.unwrap_or(NaiveDate::MAX).num_days_from_ce();
        let order = match status {
            AddressStatus::Current => -i64::from(effective),
            AddressStatus::Future => i64::from(effective),
            AddressStatus::Expired => -i64::from(until),
        };
        (status, !location.send_mail, order)
    })
}

/// Joins the letters into one document: the first letter up to its closing
/// `</html>`, every further letter from its `<body` on.
pub fn combine_letters(letters: &[String]) -> String {
    let mut document = String::new();
    for letter in letters {
        let lower = letter.to_ascii_lowercase();
        let start = if document.is_empty() {
            0
        } else {
            lower.find("<body").unwrap_or(0)
        };
        let end = lower[start..]
            .find("</html")
            .map(|e| start + e)
            .unwrap_or(letter.len());
        document.push_str(&letter[start..end]);
    }
    if !document.is_empty() {
        document.push_str("</html>");
    }
    document
}

// src/api/handlers/receipts.rs
use actix_web::{HttpResponse, Result, web};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Deserializer};
use serde_json::json;

use crate::api::AppState;
use crate::api::envelope;
use crate::receipts::{self, AnnualReceiptRequest, EmbeddedImage};

/// Request body as posted by the receipt printing form.
#[derive(Deserialize)]
pub struct AnnualReceiptsRequest {
    #[serde(rename = "ALedgerNumber", deserialize_with = "number_or_text")]
    pub ledger_number: i64,
    #[serde(rename = "AStartDate")]
    pub start_date: NaiveDate,
    #[serde(rename = "AEndDate")]
    pub end_date: NaiveDate,
    #[serde(rename = "AHTMLTemplate")]
    pub html_template: String,
    #[serde(rename = "ADonorKey", default, deserialize_with = "number_or_text")]
    pub donor_key: i64,
    #[serde(rename = "ALogoImage", default)]
    pub logo_image: String,
    #[serde(rename = "ALogoFilename", default)]
    pub logo_filename: String,
    #[serde(rename = "ASignatureImage", default)]
    pub signature_image: String,
    #[serde(rename = "ASignatureFilename", default)]
    pub signature_filename: String,
    #[serde(rename = "APrintedOn", default)]
    pub printed_on: Option<NaiveDate>,
}

/// The client sends ledger numbers from local storage, i.e. as text.
fn number_or_text<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(i64),
        Text(String),
    }

    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(n) => Ok(n),
        NumberOrText::Text(text) if text.trim().is_empty() => Ok(0),
        NumberOrText::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

fn image(file_name: String, data_url: String) -> Option<EmbeddedImage> {
    if file_name.is_empty() || data_url.is_empty() {
        return None;
    }
    Some(EmbeddedImage { file_name, data_url })
}

impl From<AnnualReceiptsRequest> for AnnualReceiptRequest {
    fn from(req: AnnualReceiptsRequest) -> Self {
        Self {
            ledger_number: req.ledger_number,
            start_date: req.start_date,
            end_date: req.end_date,
            html_template: req.html_template,
            donor_key: req.donor_key,
            logo: image(req.logo_filename, req.logo_image),
            signature: image(req.signature_filename, req.signature_image),
            printed_on: req.printed_on.unwrap_or_else(|| Local::now().date_naive()),
        }
    }
}

pub async fn create_annual_receipts(
    state: web::Data<AppState>,
    req: web::Json<AnnualReceiptsRequest>,
) -> Result<HttpResponse> {
    let request = AnnualReceiptRequest::from(req.into_inner());
    let receipts = receipts::create_annual_gift_receipts(
        state.jobs.pool(),
        &request,
        state.config.report_timeout(),
    )
    .await?;

    if receipts.letters == 0 {
        return envelope::ok(&json!({ "result": false }));
    }
    envelope::ok(&json!({
        "result": true,
        "APDFReceipt": receipts.pdf,
        "AHTMLReceipt": receipts.html,
    }))
}

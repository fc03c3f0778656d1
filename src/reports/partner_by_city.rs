// src/reports/partner_by_city.rs
use async_trait::async_trait;
use chrono::Local;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::HashMap;
use std::sync::Arc;

use super::{CalculationContext, Column, ReportCalculator, ReportTemplates, format_partner_key, render_table};
use crate::database::date_to_db;
use crate::errors::{ReportError, Result};
use crate::models::CalculationResult;
use crate::parameters::ParameterList;

const NAME: &str = "PartnerByCity";

const COLUMNS: [Column; 7] = [
    Column { token: "#PARTNERKEY", caption: "Partner Key" },
    Column { token: "#PARTNERNAME", caption: "Name" },
    Column { token: "#PARTNERCLASS", caption: "Class" },
    Column { token: "#STREETNAME", caption: "Street" },
    Column { token: "#POSTALCODE", caption: "Postal Code" },
    Column { token: "#ADDRESSCITY", caption: "City" },
    Column { token: "#COUNTRYCODE", caption: "Country" },
];

/// Partners with an address in one city.
///
/// Parameters: `param_city` (required), `param_active` to list only active
/// partners, `param_only_addresses_valid_on` with `param_today` to skip
/// addresses that are not valid on that day.
pub struct PartnerByCity {
    templates: Arc<ReportTemplates>,
}

impl PartnerByCity {
    pub fn new(templates: Arc<ReportTemplates>) -> Self {
        Self { templates }
    }
}

#[async_trait]
impl ReportCalculator for PartnerByCity {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn calculate(
        &self,
        params: &ParameterList,
        conn: &mut SqliteConnection,
        ctx: &CalculationContext,
    ) -> Result<CalculationResult> {
        let city = params.get_string("param_city");
        if city.trim().is_empty() {
            return Err(ReportError::Validation("param_city is required".to_string()));
        }
        let today = params
            .get_date("param_today")
            .unwrap_or_else(|| Local::now().date_naive());

        let template = self.templates.load(NAME)?;
        ctx.report_status(&format!("Selecting partners in {}", city), None).await;

        let mut query = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT p.partner_key, p.short_name, p.partner_class,
                   COALESCE(l.street_name, ''), COALESCE(l.postal_code, ''),
                   COALESCE(l.city, ''), COALESCE(l.country_code, '')
            FROM p_partner p
            JOIN p_partner_location pl ON pl.partner_key = p.partner_key
            JOIN p_location l
              ON l.site_key = pl.site_key AND l.location_key = pl.location_key
            WHERE l.city = "#,
        );
        query.push_bind(city.clone());
        if params.get_bool("param_active") {
            query.push(" AND p.status_code = 'ACTIVE'");
        }
        if params.get_bool("param_only_addresses_valid_on") {
            let day = date_to_db(today);
            query.push(" AND (pl.date_effective IS NULL OR pl.date_effective <= ");
            query.push_bind(day.clone());
            query.push(") AND (pl.date_good_until IS NULL OR pl.date_good_until >= ");
            query.push_bind(day);
            query.push(")");
        }
        query.push(" ORDER BY p.short_name, p.partner_key");

        let records = query.build().fetch_all(&mut *conn).await?;
        ctx.checkpoint()?;

        let rows: Vec<Vec<String>> = records
            .iter()
            .map(|row| {
                vec![
                    format_partner_key(row.get::<i64, _>(0)),
                    row.get(1),
                    row.get(2),
                    row.get(3),
                    row.get(4),
                    row.get(5),
                    row.get(6),
                ]
            })
            .collect();

        let mut header = HashMap::new();
        header.insert("#TITLE", "Partner by City".to_string());
        header.insert("#CITY", city);
        header.insert("#DATE", today.format("%d.%m.%Y").to_string());
        header.insert("#COUNT", rows.len().to_string());

        render_table(&template, "Partner by City", "#PARTNERKEY", &header, &COLUMNS, rows, ctx).await
    }
}

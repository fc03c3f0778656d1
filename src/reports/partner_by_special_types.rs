// src/reports/partner_by_special_types.rs
use async_trait::async_trait;
use chrono::Local;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use std::collections::HashMap;
use std::sync::Arc;

use super::{CalculationContext, Column, ReportCalculator, ReportTemplates, format_partner_key, render_table};
use crate::database;
use crate::errors::{ReportError, Result};
use crate::models::CalculationResult;
use crate::parameters::ParameterList;
use crate::receipts::best_address;

const NAME: &str = "PartnerBySpecialTypes";

const COLUMNS: [Column; 7] = [
    Column { token: "#PARTNERKEY", caption: "Partner Key" },
    Column { token: "#PARTNERNAME", caption: "Name" },
    Column { token: "#SPECIALTYPES", caption: "Special Types" },
    Column { token: "#STREETNAME", caption: "Street" },
    Column { token: "#POSTALCODE", caption: "Postal Code" },
    Column { token: "#ADDRESSCITY", caption: "City" },
    Column { token: "#COUNTRYCODE", caption: "Country" },
];

/// Partners carrying at least one of the special types listed in
/// `param_explicit_specialtypes` (comma separated), one row each with the
/// partner's best address. With `param_only_addresses_valid_on` only
/// addresses valid on `param_today` are considered; partners without one are
/// still listed, with the address columns empty.
pub struct PartnerBySpecialTypes {
    templates: Arc<ReportTemplates>,
}

impl PartnerBySpecialTypes {
    pub fn new(templates: Arc<ReportTemplates>) -> Self {
        Self { templates }
    }
}

#[async_trait]
impl ReportCalculator for PartnerBySpecialTypes {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn calculate(
        &self,
        params: &ParameterList,
        conn: &mut SqliteConnection,
        ctx: &CalculationContext,
    ) -> Result<CalculationResult> {
        let types = params.get_list("param_explicit_specialtypes");
        if types.is_empty() {
            return Err(ReportError::Validation(
                "param_explicit_specialtypes needs at least one type".to_string(),
            ));
        }
        let today = params
            .get_date("param_today")
            .unwrap_or_else(|| Local::now().date_naive());

        let template = self.templates.load(NAME)?;
        ctx.report_status("Selecting partners", None).await;

        let mut query = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT p.partner_key, p.short_name,
                   (SELECT GROUP_CONCAT(t.type_code, ', ')
                      FROM p_partner_type t WHERE t.partner_key = p.partner_key)
            FROM p_partner p
            WHERE p.partner_key IN (SELECT partner_key FROM p_partner_type WHERE type_code IN ("#,
        );
        let mut separated = query.separated(", ");
        for type_code in &types {
            separated.push_bind(type_code.clone());
        }
        separated.push_unseparated("))");
        if params.get_bool("param_active") {
            query.push(" AND p.status_code = 'ACTIVE'");
        }
        query.push(" ORDER BY p.short_name, p.partner_key");

        let partners = query.build().fetch_all(&mut *conn).await?;
        let only_valid = params.get_bool("param_only_addresses_valid_on");

        // one row per partner, showing its best address
        let mut rows: Vec<Vec<String>> = Vec::with_capacity(partners.len());
        for partner in &partners {
            ctx.checkpoint()?;
            let partner_key = partner.get::<i64, _>(0);
            let mut locations = database::get_partner_locations(&mut *conn, partner_key).await?;
            if only_valid {
                locations.retain(|location| location.is_valid_on(today));
            }
            let address = best_address(&locations, today)
                .map(|best| best.location.clone())
                .unwrap_or_default();

            rows.push(vec![
                format_partner_key(partner_key),
                partner.get(1),
                partner.get::<Option<String>, _>(2).unwrap_or_default(),
                address.street_name,
                address.postal_code,
                address.city,
                address.country_code,
            ]);
        }

        let mut header = HashMap::new();
        header.insert("#TITLE", "Partner by Special Types".to_string());
        header.insert("#TYPES", types.join(", "));
        header.insert("#DATE", today.format("%d.%m.%Y").to_string());
        header.insert("#COUNT", rows.len().to_string());

        render_table(&template, "Partner by Special Types", "#PARTNERKEY", &header, &COLUMNS, rows, ctx).await
    }
}

use std::path::PathBuf;
use std::str::FromStr;

use bigdecimal::BigDecimal;

use crate::error::{BillingError, BillingResult};

/// Runtime settings, read from the environment exactly once at startup.
/// A missing required value is a fatal `Config` error before any entity is
/// touched; everything else falls back to a documented default.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address the HTTP trigger should bind to. Defaults to `0.0.0.0`.
    pub bind_address: String,
    /// Port the HTTP trigger should listen on. Defaults to `3000`.
    pub bind_port: u16,
    /// Base URL of the CRM REST API. Required (`CRM_BASE_URL`).
    pub crm_base_url: String,
    /// Bearer token for the CRM API. Required (`CRM_API_TOKEN`).
    pub crm_token: String,
    /// Endpoint of the HTML-to-PDF render service. Required (`PDF_SERVICE_URL`).
    pub pdf_service_url: String,
    /// Root directory for the filesystem object store. Defaults to `storage`.
    pub storage_root: PathBuf,
    /// Public base URL stored objects are reachable under.
    pub public_base_url: String,
    /// Recipient of the per-run summary email. Required (`REPORT_RECIPIENT`).
    pub report_recipient: String,
    /// Recipient of run-level failure alerts. Defaults to the report recipient.
    pub operator_email: String,
    /// From address for outgoing mail.
    pub mail_from: String,
    /// SMTP relay settings; absent means the console mailer is used.
    pub smtp: Option<SmtpSettings>,
    /// Membership fee schedule.
    pub fees: FeeSchedule,
    /// Fixed pacing delay between entities, in milliseconds.
    pub throttle_ms: u64,
    /// Wall-clock budget for one invocation, in seconds.
    pub time_budget_secs: u64,
    /// Remaining-budget threshold below which the run stops taking on new
    /// entities and goes straight to reporting.
    pub time_budget_reserve_secs: u64,
    /// Persist run state after this many successes rather than after each one.
    pub state_flush_every: u32,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub username: String,
    pub password: String,
}

/// Rule tables for the pricing resolver, one flat fee per membership category
/// plus the per-territory distributor rate.
#[derive(Debug, Clone)]
pub struct FeeSchedule {
    pub distributor_base: BigDecimal,
    pub per_territory: BigDecimal,
    pub service_provider: BigDecimal,
    pub individual: BigDecimal,
    /// Fallback used when a manufacturer record carries no sales-tier label.
    pub manufacturer_default: BigDecimal,
    /// Optional CRM product id attached to dues line items.
    pub dues_product_ref: Option<String>,
}

impl Settings {
    pub fn from_env() -> BillingResult<Self> {
        let report_recipient = require("REPORT_RECIPIENT")?;
        let operator_email =
            optional("OPERATOR_EMAIL").unwrap_or_else(|| report_recipient.clone());

        let smtp = match optional("SMTP_HOST") {
            Some(host) => Some(SmtpSettings {
                host,
                username: require("SMTP_USERNAME")?,
                password: require("SMTP_PASSWORD")?,
            }),
            None => None,
        };

        Ok(Self {
            bind_address: optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0".to_string()),
            bind_port: parse_or("BIND_PORT", 3000)?,
            crm_base_url: require("CRM_BASE_URL")?,
            crm_token: require("CRM_API_TOKEN")?,
            pdf_service_url: require("PDF_SERVICE_URL")?,
            storage_root: PathBuf::from(
                optional("STORAGE_ROOT").unwrap_or_else(|| "storage".to_string()),
            ),
            public_base_url: optional("PUBLIC_BASE_URL")
                .unwrap_or_else(|| "https://files.localhost".to_string()),
            report_recipient,
            operator_email,
            mail_from: optional("MAIL_FROM")
                .unwrap_or_else(|| "billing@association.localhost".to_string()),
            smtp,
            fees: FeeSchedule::from_env()?,
            throttle_ms: parse_or("THROTTLE_MS", 750)?,
            time_budget_secs: parse_or("TIME_BUDGET_SECS", 840)?,
            time_budget_reserve_secs: parse_or("TIME_BUDGET_RESERVE_SECS", 60)?,
            state_flush_every: parse_or("STATE_FLUSH_EVERY", 5)?,
        })
    }
}

impl FeeSchedule {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            distributor_base: decimal_or("DISTRIBUTOR_BASE_FEE", "1500")?,
            per_territory: decimal_or("PER_TERRITORY_FEE", "250")?,
            service_provider: decimal_or("SERVICE_PROVIDER_FEE", "1000")?,
            individual: decimal_or("INDIVIDUAL_FEE", "150")?,
            manufacturer_default: decimal_or("MANUFACTURER_DEFAULT_FEE", "2500")?,
            dues_product_ref: optional("DUES_PRODUCT_REF"),
        })
    }
}

fn require(key: &str) -> BillingResult<String> {
    optional(key).ok_or_else(|| BillingError::config(format!("{key} must be set")))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> BillingResult<T> {
    match optional(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| BillingError::config(format!("{key} has an invalid value: {raw}"))),
    }
}

fn decimal_or(key: &str, default: &str) -> BillingResult<BigDecimal> {
    let raw = optional(key).unwrap_or_else(|| default.to_string());
    BigDecimal::from_str(&raw)
        .map_err(|_| BillingError::config(format!("{key} is not a valid amount: {raw}")))
}

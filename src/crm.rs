use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{Datelike, Days, Months, NaiveDate};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::billing::LineItem;
use crate::error::{BillingError, BillingResult};

/// Raw CRM object: an opaque id plus a string property bag. Records are
/// snapshots; nothing here is written back except through explicit calls.
#[derive(Debug, Clone, Deserialize)]
pub struct CrmRecord {
    pub id: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl CrmRecord {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

/// Calendar window memberships are pulled for, closed on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl RenewalWindow {
    /// The calendar month containing `date`.
    pub fn for_month(date: NaiveDate) -> Self {
        let start = date.with_day(1).unwrap_or(date);
        let end = start
            .checked_add_months(Months::new(1))
            .and_then(|next| next.checked_sub_days(Days::new(1)))
            .unwrap_or(start);
        Self { start, end }
    }
}

/// Everything the CRM needs to materialize an invoice: billing contact,
/// optional company association, line items and the computed total.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDraft {
    pub contact_id: String,
    pub company_id: Option<String>,
    pub line_items: Vec<LineItem>,
    pub total: BigDecimal,
    pub period: String,
    pub memo: String,
}

/// CRM operations the run consumes. One implementation per backend; the run
/// itself never touches HTTP directly.
#[async_trait]
pub trait CrmClient: Send + Sync {
    /// Company and individual memberships whose renewal date falls inside the
    /// window. The orchestrator sorts by external id before processing.
    async fn expiring_memberships(&self, window: &RenewalWindow) -> BillingResult<Vec<CrmRecord>>;
    async fn primary_contact(&self, company_id: &str) -> BillingResult<Option<CrmRecord>>;
    /// Id of an existing invoice on the contact whose status is in `statuses`.
    async fn open_invoice(
        &self,
        contact_id: &str,
        statuses: &[&str],
    ) -> BillingResult<Option<String>>;
    async fn create_invoice(&self, draft: &InvoiceDraft) -> BillingResult<String>;
    /// Transition a draft invoice to payable status.
    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<()>;
    /// Payment reference printed on the PDF, when the CRM has issued one.
    async fn payment_reference(&self, invoice_id: &str) -> BillingResult<Option<String>>;
    async fn update_company_dues(&self, company_id: &str, total: &BigDecimal)
        -> BillingResult<()>;
}

/// Thin REST wrapper over the CRM API. Constructed once per process and
/// passed into the run explicitly; no global client state.
pub struct HttpCrmClient {
    base: String,
    token: String,
    client: Client,
}

impl HttpCrmClient {
    pub fn new(base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("client build"),
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
        context: &str,
    ) -> BillingResult<Option<Value>> {
        let url = format!("{}/{}", self.base, path);
        let mut req = self
            .client
            .request(method, &url)
            .bearer_auth(&self.token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.map_err(|e| lookup_err(context, e))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status().map_err(|e| lookup_err(context, e))?;
        // The body bytes decide emptiness; chunked replies carry no
        // Content-Length header.
        let bytes = resp.bytes().await.map_err(|e| lookup_err(context, e))?;
        if bytes.is_empty() {
            return Ok(Some(Value::Null));
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| BillingError::lookup(format!("{context}: bad response: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct SearchResults {
    #[serde(default)]
    results: Vec<CrmRecord>,
}

fn lookup_err(context: &str, err: reqwest::Error) -> BillingError {
    BillingError::lookup(format!("{context}: {err}"))
}

fn decode<T: serde::de::DeserializeOwned>(context: &str, value: Value) -> BillingResult<T> {
    serde_json::from_value(value)
        .map_err(|e| BillingError::lookup(format!("{context}: bad response: {e}")))
}

#[async_trait]
impl CrmClient for HttpCrmClient {
    async fn expiring_memberships(&self, window: &RenewalWindow) -> BillingResult<Vec<CrmRecord>> {
        let body = json!({
            "renewal_after": window.start,
            "renewal_before": window.end,
        });
        let value = self
            .request(
                reqwest::Method::POST,
                "objects/memberships/search",
                Some(body),
                "membership search",
            )
            .await?
            .unwrap_or(Value::Null);
        let results: SearchResults = decode("membership search", value)?;
        Ok(results.results)
    }

    async fn primary_contact(&self, company_id: &str) -> BillingResult<Option<CrmRecord>> {
        let value = self
            .request(
                reqwest::Method::GET,
                &format!("objects/companies/{company_id}/primary-contact"),
                None,
                "primary contact",
            )
            .await?;
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(decode("primary contact", value)?)),
        }
    }

    async fn open_invoice(
        &self,
        contact_id: &str,
        statuses: &[&str],
    ) -> BillingResult<Option<String>> {
        let body = json!({
            "contact_id": contact_id,
            "statuses": statuses,
            "limit": 1,
        });
        let value = self
            .request(
                reqwest::Method::POST,
                "objects/invoices/search",
                Some(body),
                "open invoice search",
            )
            .await?
            .unwrap_or(Value::Null);
        let results: SearchResults = decode("open invoice search", value)?;
        Ok(results.results.into_iter().next().map(|r| r.id))
    }

    async fn create_invoice(&self, draft: &InvoiceDraft) -> BillingResult<String> {
        let body = serde_json::to_value(draft)
            .map_err(|e| BillingError::lookup(format!("invoice draft encode: {e}")))?;
        let value = self
            .request(
                reqwest::Method::POST,
                "objects/invoices",
                Some(body),
                "invoice create",
            )
            .await?
            .ok_or_else(|| BillingError::lookup("invoice create: endpoint missing"))?;
        value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BillingError::lookup("invoice create: response missing id"))
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<()> {
        self.request(
            reqwest::Method::POST,
            &format!("objects/invoices/{invoice_id}/finalize"),
            None,
            "invoice finalize",
        )
        .await?;
        Ok(())
    }

    async fn payment_reference(&self, invoice_id: &str) -> BillingResult<Option<String>> {
        let value = self
            .request(
                reqwest::Method::GET,
                &format!("objects/invoices/{invoice_id}/payment-reference"),
                None,
                "payment reference",
            )
            .await?;
        Ok(value
            .and_then(|v| v.get("reference").and_then(Value::as_str).map(str::to_string)))
    }

    async fn update_company_dues(
        &self,
        company_id: &str,
        total: &BigDecimal,
    ) -> BillingResult<()> {
        let body = json!({
            "properties": { "annual_dues": total.to_string() },
        });
        self.request(
            reqwest::Method::PATCH,
            &format!("objects/companies/{company_id}"),
            Some(body),
            "company dues update",
        )
        .await?;
        Ok(())
    }
}

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::billing::{MembershipEntity, PriceResult};
use crate::error::{BillingError, BillingResult};

/// HTML-to-PDF rendering seam. Rendering internals live behind the service
/// endpoint; the run only ever sees bytes.
#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render(&self, html: &str) -> BillingResult<Vec<u8>>;
}

/// Posts HTML to an external render service and returns the PDF body.
pub struct HttpPdfRenderer {
    endpoint: String,
    client: Client,
}

impl HttpPdfRenderer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("client build"),
        }
    }
}

#[async_trait]
impl PdfRenderer for HttpPdfRenderer {
    async fn render(&self, html: &str) -> BillingResult<Vec<u8>> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "html": html }))
            .send()
            .await
            .map_err(|e| BillingError::render(format!("render request: {e}")))?
            .error_for_status()
            .map_err(|e| BillingError::render(format!("render status: {e}")))?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| BillingError::render(format!("render body: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Invoice document markup handed to the renderer. Deliberately plain; layout
/// polish belongs to the render service's stylesheet.
pub fn invoice_html(
    entity: &MembershipEntity,
    price: &PriceResult,
    period: &str,
    payment_reference: Option<&str>,
) -> String {
    let mut rows = String::new();
    for item in &price.line_items {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape(&item.name),
            item.quantity,
            item.unit_price,
            escape(&item.description),
        ));
    }
    let reference = payment_reference
        .map(|r| format!("<p>Payment reference: {}</p>", escape(r)))
        .unwrap_or_default();
    format!(
        "<html><body>\n\
         <h1>Membership dues invoice</h1>\n\
         <p>{name} &mdash; period {period}</p>\n\
         <table>\n\
         <tr><th>Item</th><th>Qty</th><th>Unit price</th><th>Description</th></tr>\n\
         {rows}\
         </table>\n\
         <p>Total due: {total}</p>\n\
         {reference}\n\
         </body></html>",
        name = escape(entity.name()),
        period = period,
        rows = rows,
        total = price.total,
        reference = reference,
    )
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

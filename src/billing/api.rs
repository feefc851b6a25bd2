use std::sync::Arc;

use axum::{extract::Extension, Json};

use crate::error::BillingError;

use super::models::{RunSummary, RunTrigger};
use super::run::BillingRun;

/// key: dues-api -> run trigger endpoint
///
/// The scheduler (or an operator) POSTs the trigger payload here; the run
/// executes synchronously and the summary comes back in the response body.
pub async fn trigger_run(
    Extension(run): Extension<Arc<BillingRun>>,
    Json(trigger): Json<RunTrigger>,
) -> Result<Json<RunSummary>, BillingError> {
    let summary = run.execute(trigger).await?;
    Ok(Json(summary))
}

pub async fn health() -> &'static str {
    "ok"
}

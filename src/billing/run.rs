use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::crm::{CrmClient, CrmRecord, InvoiceDraft, RenewalWindow};
use crate::error::{BillingError, BillingResult};
use crate::mailer::Mailer;
use crate::pdf::{invoice_html, PdfRenderer};
use crate::storage::{sanitize_key_component, ObjectStore};

use super::guard;
use super::models::{
    attrs, EntityOutcome, MembershipEntity, OutcomeStatus, PriceResult, RunMode, RunSummary,
    RunTrigger,
};
use super::pricing::resolve_price;
use super::report::RunReport;
use super::state::{RunState, RunStateStore};

/// key: dues-run -> batch orchestrator
///
/// Drives the end-to-end per-entity workflow: guard, pricing, invoice
/// creation, PDF, state bookkeeping, reporting. Strictly sequential; one
/// entity's failure never aborts the batch. Collaborators are injected and
/// live for exactly one invocation.
pub struct BillingRun {
    settings: Arc<Settings>,
    crm: Arc<dyn CrmClient>,
    store: Arc<dyn ObjectStore>,
    renderer: Arc<dyn PdfRenderer>,
    mailer: Arc<dyn Mailer>,
}

struct InvoiceArtifacts {
    invoice_id: Option<String>,
    pdf_url: Option<String>,
}

impl BillingRun {
    pub fn new(
        settings: Arc<Settings>,
        crm: Arc<dyn CrmClient>,
        store: Arc<dyn ObjectStore>,
        renderer: Arc<dyn PdfRenderer>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            settings,
            crm,
            store,
            renderer,
            mailer,
        }
    }

    pub async fn execute(&self, trigger: RunTrigger) -> BillingResult<RunSummary> {
        let run_date = Utc::now().date_naive();
        let mode = RunMode::from_trigger(&trigger);
        let period = run_date.format("%Y-%m").to_string();
        info!(%run_date, mode = mode.as_str(), "starting dues run");

        let state_store = RunStateStore::new(self.store.clone());
        if trigger.clear_state {
            if mode.writes_storage() {
                state_store.clear(run_date).await?;
                info!(%run_date, "run state cleared by operator request");
            } else {
                info!("dry run; clear_state ignored");
            }
        }

        let mut state = if mode.tracks_state() {
            state_store.load(run_date).await?
        } else {
            RunState::new(run_date)
        };
        if state.is_complete {
            info!(%run_date, "run already complete for this period");
            let report = RunReport::new(run_date, mode, Vec::new());
            return Ok(report.summary("run already complete for this period", None));
        }

        let window = RenewalWindow::for_month(run_date);
        let mut candidates = match self.crm.expiring_memberships(&window).await {
            Ok(records) => records,
            Err(err) => {
                error!(%err, "candidate retrieval failed; aborting run");
                self.notify_operator(run_date, &err).await;
                return Err(err);
            }
        };
        // Stable processing order regardless of backend ordering.
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(limit) = mode.limit() {
            candidates.truncate(limit);
        }
        info!(count = candidates.len(), "candidates retrieved");

        let deadline = Instant::now() + Duration::from_secs(self.settings.time_budget_secs);
        let reserve = Duration::from_secs(self.settings.time_budget_reserve_secs);
        let throttle = Duration::from_millis(self.settings.throttle_ms);

        let mut outcomes: Vec<EntityOutcome> = Vec::with_capacity(candidates.len());
        let mut since_flush = 0u32;
        let mut deferred = 0usize;

        for (idx, record) in candidates.iter().enumerate() {
            if deadline.saturating_duration_since(Instant::now()) < reserve {
                deferred = candidates.len() - idx;
                info!(
                    deferred,
                    "time budget low; deferring remaining entities to a later invocation"
                );
                break;
            }
            if idx > 0 && !throttle.is_zero() {
                tokio::time::sleep(throttle).await;
            }

            let outcome = self
                .process_record(record, &state, mode, trigger.keep_draft, &period)
                .await;
            match outcome.status {
                OutcomeStatus::Invoiced if mode.tracks_state() => {
                    state.mark_processed(&outcome.entity_id);
                    since_flush += 1;
                    if since_flush >= self.settings.state_flush_every {
                        if let Err(err) = state_store.persist(&state).await {
                            warn!(%err, "interim run state persist failed");
                        }
                        since_flush = 0;
                    }
                }
                OutcomeStatus::Failed if mode.tracks_state() => {
                    state.failed += 1;
                }
                _ => {}
            }
            outcomes.push(outcome);
        }

        if mode.tracks_state() {
            if deferred == 0 {
                state.is_complete = true;
            }
            if let Err(err) = state_store.persist(&state).await {
                error!(%err, "final run state persist failed");
            }
        }

        let report = RunReport::new(run_date, mode, outcomes);
        let report_url = self.publish_report(&report, mode).await;
        if let Err(err) = self
            .mailer
            .send(
                &self.settings.report_recipient,
                &report.email_subject(),
                &report.email_body(report_url.as_deref()),
            )
            .await
        {
            error!(%err, "summary email failed");
        }

        let message = if deferred > 0 {
            "time budget reached; remaining entities deferred to the next invocation"
        } else {
            "run complete"
        };
        info!(
            processed = report.processed(),
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            "dues run finished"
        );
        Ok(report.summary(message, report_url))
    }

    /// One entity, start to finish. Every failure is caught here and turned
    /// into a failed outcome row; nothing propagates to the batch loop.
    async fn process_record(
        &self,
        record: &CrmRecord,
        state: &RunState,
        mode: RunMode,
        keep_draft: bool,
        period: &str,
    ) -> EntityOutcome {
        let entity = match self.normalize_record(record).await {
            Ok(entity) => entity,
            Err(err) => {
                return self.failure_outcome(
                    record.id.clone(),
                    record.property(attrs::NAME).unwrap_or("unknown").to_string(),
                    record.property(attrs::KIND).unwrap_or("unknown").to_string(),
                    "unknown".to_string(),
                    "normalize",
                    err,
                )
            }
        };

        if let Some(reason) = guard::should_skip(self.crm.as_ref(), &entity, state, mode).await {
            info!(
                entity_id = entity.id(),
                entity_name = entity.name(),
                reason = %reason,
                "entity skipped"
            );
            return EntityOutcome {
                entity_id: entity.id().to_string(),
                name: entity.name().to_string(),
                kind: entity.kind().to_string(),
                category: entity.category_label().to_string(),
                status: OutcomeStatus::Skipped,
                amount: None,
                invoice_id: None,
                detail: reason.to_string(),
            };
        }

        let price = match resolve_price(&entity, &self.settings.fees) {
            Ok(price) => price,
            Err(err) => return self.entity_failure(&entity, "pricing", err),
        };

        match self
            .issue_invoice(&entity, &price, mode, keep_draft, period)
            .await
        {
            Ok(artifacts) => {
                info!(
                    entity_id = entity.id(),
                    entity_name = entity.name(),
                    amount = %price.total,
                    invoice_id = artifacts.invoice_id.as_deref().unwrap_or(""),
                    pdf_url = artifacts.pdf_url.as_deref().unwrap_or(""),
                    "entity invoiced"
                );
                EntityOutcome {
                    entity_id: entity.id().to_string(),
                    name: entity.name().to_string(),
                    kind: entity.kind().to_string(),
                    category: entity.category_label().to_string(),
                    status: OutcomeStatus::Invoiced,
                    amount: Some(price.total.clone()),
                    invoice_id: artifacts.invoice_id,
                    detail: artifacts.pdf_url.unwrap_or_default(),
                }
            }
            Err((stage, err)) => self.entity_failure(&entity, stage, err),
        }
    }

    /// Normalize the raw CRM record into the uniform entity shape, resolving
    /// the billing contact for companies. A company without a primary contact
    /// cannot be invoiced and fails here.
    async fn normalize_record(&self, record: &CrmRecord) -> BillingResult<MembershipEntity> {
        match record.property(attrs::KIND) {
            Some("individual") => Ok(MembershipEntity::from_individual_record(record)),
            Some("company") => {
                let contact = self
                    .crm
                    .primary_contact(&record.id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::lookup(format!(
                            "company {} has no primary contact",
                            record.id
                        ))
                    })?;
                Ok(MembershipEntity::from_company_record(record, contact.id))
            }
            other => Err(BillingError::lookup(format!(
                "record {} has unrecognized kind {other:?}",
                record.id
            ))),
        }
    }

    /// Steps 4-7 of the per-entity pipeline: CRM invoice, payment reference,
    /// PDF render + store, dues write-back. Which of these actually happen
    /// depends on the run mode.
    async fn issue_invoice(
        &self,
        entity: &MembershipEntity,
        price: &PriceResult,
        mode: RunMode,
        keep_draft: bool,
        period: &str,
    ) -> Result<InvoiceArtifacts, (&'static str, BillingError)> {
        let mut invoice_id = None;
        if mode.writes_crm() {
            let draft = InvoiceDraft {
                contact_id: entity.billing_contact_id().to_string(),
                company_id: match entity {
                    MembershipEntity::Company { id, .. } => Some(id.clone()),
                    MembershipEntity::Individual { .. } => None,
                },
                line_items: price.line_items.clone(),
                total: price.total.clone(),
                period: period.to_string(),
                memo: format!("{} membership dues, {period}", entity.category_label()),
            };
            let id = self
                .crm
                .create_invoice(&draft)
                .await
                .map_err(|e| ("invoice", e))?;
            if !keep_draft {
                self.crm
                    .finalize_invoice(&id)
                    .await
                    .map_err(|e| ("invoice", e))?;
            }
            invoice_id = Some(id);
        } else if mode == RunMode::DryRun {
            invoice_id = Some(format!("dry-{}", Uuid::new_v4()));
        }

        // Best-effort: a missing payment reference degrades the PDF, it does
        // not fail the entity.
        let payment_reference = match &invoice_id {
            Some(id) if mode.writes_crm() => match self.crm.payment_reference(id).await {
                Ok(reference) => reference,
                Err(err) => {
                    warn!(
                        entity_id = entity.id(),
                        invoice_id = id.as_str(),
                        %err,
                        "payment reference lookup failed; rendering without it"
                    );
                    None
                }
            },
            _ => None,
        };

        let key = invoice_key(period, entity);
        let pdf_url = if mode.writes_storage() {
            let html = invoice_html(entity, price, period, payment_reference.as_deref());
            let bytes = self
                .renderer
                .render(&html)
                .await
                .map_err(|e| ("render", e))?;
            Some(
                self.store
                    .put(&key, bytes, "application/pdf")
                    .await
                    .map_err(|e| ("store", e))?,
            )
        } else {
            Some(format!("dry://{key}"))
        };

        if mode.writes_crm() {
            if let MembershipEntity::Company { id, .. } = entity {
                self.crm
                    .update_company_dues(id, &price.total)
                    .await
                    .map_err(|e| ("dues-update", e))?;
            }
        }

        Ok(InvoiceArtifacts {
            invoice_id,
            pdf_url,
        })
    }

    fn entity_failure(
        &self,
        entity: &MembershipEntity,
        stage: &'static str,
        err: BillingError,
    ) -> EntityOutcome {
        self.failure_outcome(
            entity.id().to_string(),
            entity.name().to_string(),
            entity.kind().to_string(),
            entity.category_label().to_string(),
            stage,
            err,
        )
    }

    fn failure_outcome(
        &self,
        entity_id: String,
        name: String,
        kind: String,
        category: String,
        stage: &'static str,
        err: BillingError,
    ) -> EntityOutcome {
        warn!(
            entity_id = entity_id.as_str(),
            entity_name = name.as_str(),
            stage,
            %err,
            "entity failed"
        );
        EntityOutcome {
            entity_id,
            name,
            kind,
            category,
            status: OutcomeStatus::Failed,
            amount: None,
            invoice_id: None,
            detail: format!("{stage}: {err}"),
        }
    }

    async fn publish_report(&self, report: &RunReport, mode: RunMode) -> Option<String> {
        let bytes = match report.to_csv() {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(%err, "report serialization failed");
                return None;
            }
        };
        if !mode.writes_storage() {
            return Some(format!("dry://{}", report.storage_key()));
        }
        match self
            .store
            .put(&report.storage_key(), bytes, "text/csv")
            .await
        {
            Ok(url) => Some(url),
            Err(err) => {
                error!(%err, "report upload failed");
                None
            }
        }
    }

    /// Single top-level failure-notification boundary for run-level errors.
    async fn notify_operator(&self, run_date: chrono::NaiveDate, err: &BillingError) {
        let body = format!(
            "The membership dues run for {run_date} failed before processing any entities.\n\n{err}\n"
        );
        if let Err(mail_err) = self
            .mailer
            .send(
                &self.settings.operator_email,
                &format!("Dues run {run_date} FAILED"),
                &body,
            )
            .await
        {
            error!(%mail_err, "operator notification failed");
        }
    }
}

fn invoice_key(period: &str, entity: &MembershipEntity) -> String {
    format!(
        "invoices/{period}/{}/{}-{}.pdf",
        entity.kind(),
        sanitize_key_component(entity.name()),
        sanitize_key_component(entity.id()),
    )
}

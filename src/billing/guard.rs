use tracing::warn;

use crate::crm::CrmClient;

use super::models::{MembershipEntity, RunMode, SkipReason};
use super::state::RunState;

/// Invoice statuses that count as "open": billing again while one of these
/// exists would double-invoice the member.
pub const OPEN_INVOICE_STATUSES: [&str; 4] = ["SENT", "DRAFT", "PROCESSING", "OVERDUE"];

/// key: dues-guard -> duplicate and resume checks
///
/// Returns the reason to skip this entity, or None to proceed. The
/// open-invoice lookup fails open: a transient CRM error must not stall the
/// whole run, so on error we log and continue as if nothing was found.
pub async fn should_skip(
    crm: &dyn CrmClient,
    entity: &MembershipEntity,
    state: &RunState,
    mode: RunMode,
) -> Option<SkipReason> {
    match crm
        .open_invoice(entity.billing_contact_id(), &OPEN_INVOICE_STATUSES)
        .await
    {
        Ok(Some(invoice_id)) => return Some(SkipReason::OpenInvoice(invoice_id)),
        Ok(None) => {}
        Err(err) => warn!(
            entity_id = entity.id(),
            entity_name = entity.name(),
            %err,
            "open invoice lookup failed; continuing without duplicate check"
        ),
    }

    if mode.tracks_state() && state.already_processed(entity.id()) {
        return Some(SkipReason::AlreadyProcessed);
    }

    None
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;

use dues_automation::billing::{
    attrs, BillingRun, RunState, RunStateStore, RunTrigger, OPEN_INVOICE_STATUSES,
};
use dues_automation::config::{FeeSchedule, Settings};
use dues_automation::crm::{CrmClient, CrmRecord, InvoiceDraft, RenewalWindow};
use dues_automation::error::{BillingError, BillingResult};
use dues_automation::mailer::Mailer;
use dues_automation::pdf::PdfRenderer;
use dues_automation::storage::{MemoryObjectStore, ObjectStore};

// key: dues-run-tests -> end-to-end scenarios over fakes

#[derive(Default)]
struct FakeCrm {
    records: Vec<CrmRecord>,
    /// company id -> primary contact id
    contacts: HashMap<String, String>,
    /// contact id -> (invoice id, status)
    open_invoices: HashMap<String, (String, String)>,
    fail_open_lookup: bool,
    create_calls: Mutex<Vec<InvoiceDraft>>,
    finalize_calls: Mutex<Vec<String>>,
    dues_updates: Mutex<Vec<(String, BigDecimal)>>,
}

#[async_trait]
impl CrmClient for FakeCrm {
    async fn expiring_memberships(&self, _window: &RenewalWindow) -> BillingResult<Vec<CrmRecord>> {
        Ok(self.records.clone())
    }

    async fn primary_contact(&self, company_id: &str) -> BillingResult<Option<CrmRecord>> {
        Ok(self.contacts.get(company_id).map(|id| CrmRecord {
            id: id.clone(),
            properties: HashMap::new(),
        }))
    }

    async fn open_invoice(
        &self,
        contact_id: &str,
        statuses: &[&str],
    ) -> BillingResult<Option<String>> {
        if self.fail_open_lookup {
            return Err(BillingError::lookup("crm is down"));
        }
        Ok(self
            .open_invoices
            .get(contact_id)
            .filter(|(_, status)| statuses.contains(&status.as_str()))
            .map(|(id, _)| id.clone()))
    }

    async fn create_invoice(&self, draft: &InvoiceDraft) -> BillingResult<String> {
        let mut calls = self.create_calls.lock().unwrap();
        calls.push(draft.clone());
        Ok(format!("inv-{}", calls.len()))
    }

    async fn finalize_invoice(&self, invoice_id: &str) -> BillingResult<()> {
        self.finalize_calls
            .lock()
            .unwrap()
            .push(invoice_id.to_string());
        Ok(())
    }

    async fn payment_reference(&self, _invoice_id: &str) -> BillingResult<Option<String>> {
        Ok(Some("REF-42".to_string()))
    }

    async fn update_company_dues(
        &self,
        company_id: &str,
        total: &BigDecimal,
    ) -> BillingResult<()> {
        self.dues_updates
            .lock()
            .unwrap()
            .push((company_id.to_string(), total.clone()));
        Ok(())
    }
}

struct FakeRenderer;

#[async_trait]
impl PdfRenderer for FakeRenderer {
    async fn render(&self, _html: &str) -> BillingResult<Vec<u8>> {
        Ok(b"%PDF-fake".to_vec())
    }
}

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> BillingResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }
}

fn settings() -> Arc<Settings> {
    Arc::new(Settings {
        bind_address: "127.0.0.1".to_string(),
        bind_port: 0,
        crm_base_url: "http://crm.test".to_string(),
        crm_token: "token".to_string(),
        pdf_service_url: "http://pdf.test".to_string(),
        storage_root: "storage".into(),
        public_base_url: "https://files.test".to_string(),
        report_recipient: "reports@example.test".to_string(),
        operator_email: "ops@example.test".to_string(),
        mail_from: "billing@example.test".to_string(),
        smtp: None,
        fees: FeeSchedule {
            distributor_base: BigDecimal::from(1500),
            per_territory: BigDecimal::from(250),
            service_provider: BigDecimal::from(1000),
            individual: BigDecimal::from(150),
            manufacturer_default: BigDecimal::from(2500),
            dues_product_ref: None,
        },
        throttle_ms: 0,
        time_budget_secs: 300,
        time_budget_reserve_secs: 10,
        state_flush_every: 1,
    })
}

fn company_record(id: &str, name: &str, membership_type: &str, extra: &[(&str, &str)]) -> CrmRecord {
    let mut properties: HashMap<String, String> = extra
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    properties.insert(attrs::KIND.to_string(), "company".to_string());
    properties.insert(attrs::NAME.to_string(), name.to_string());
    properties.insert(attrs::MEMBERSHIP_TYPE.to_string(), membership_type.to_string());
    CrmRecord {
        id: id.to_string(),
        properties,
    }
}

fn individual_record(id: &str, name: &str) -> CrmRecord {
    let properties = HashMap::from([
        (attrs::KIND.to_string(), "individual".to_string()),
        (attrs::NAME.to_string(), name.to_string()),
    ]);
    CrmRecord {
        id: id.to_string(),
        properties,
    }
}

fn distributor(id: &str, name: &str) -> CrmRecord {
    company_record(
        id,
        name,
        "Distributor",
        &[
            (attrs::HOME_STATE, "California"),
            (attrs::DOMESTIC_STATES, "California;Nevada;Arizona"),
        ],
    )
}

struct Harness {
    crm: Arc<FakeCrm>,
    store: Arc<MemoryObjectStore>,
    mailer: Arc<RecordingMailer>,
    run: BillingRun,
}

fn harness(crm: FakeCrm) -> Harness {
    let crm = Arc::new(crm);
    let store = Arc::new(MemoryObjectStore::new());
    let mailer = Arc::new(RecordingMailer::default());
    let run = BillingRun::new(
        settings(),
        crm.clone(),
        store.clone(),
        Arc::new(FakeRenderer),
        mailer.clone(),
    );
    Harness {
        crm,
        store,
        mailer,
        run,
    }
}

#[tokio::test]
async fn full_run_invoices_companies_and_individuals() {
    let mut crm = FakeCrm::default();
    crm.records = vec![distributor("co-1", "Acme Supply"), individual_record("in-2", "Sam Doe")];
    crm.contacts.insert("co-1".to_string(), "ct-1".to_string());
    let h = harness(crm);

    let summary = h.run.execute(RunTrigger::default()).await.unwrap();
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);
    // distributor: 1500 + 2 * 250, individual: 150
    assert_eq!(summary.total_amount, "2150");

    let creates = h.crm.create_calls.lock().unwrap();
    assert_eq!(creates.len(), 2);
    assert_eq!(creates[0].contact_id, "ct-1");
    assert_eq!(creates[0].total, BigDecimal::from(2000));
    drop(creates);
    assert_eq!(h.crm.finalize_calls.lock().unwrap().len(), 2);
    assert_eq!(
        *h.crm.dues_updates.lock().unwrap(),
        vec![("co-1".to_string(), BigDecimal::from(2000))]
    );

    // PDFs and the report landed in storage; run state marks both processed.
    let period = Utc::now().date_naive().format("%Y-%m").to_string();
    let pdfs = h.store.list(&format!("invoices/{period}/")).await.unwrap();
    assert_eq!(pdfs.len(), 2);
    assert!(summary.report_url.as_deref().unwrap().contains("reports/"));

    let state = RunStateStore::new(h.store.clone())
        .load(Utc::now().date_naive())
        .await
        .unwrap();
    assert!(state.already_processed("co-1"));
    assert!(state.already_processed("in-2"));
    assert!(state.is_complete);

    let sent = h.mailer.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "reports@example.test");
    assert!(sent[0].1.contains("2 invoiced"));
}

#[tokio::test]
async fn already_processed_entities_are_not_invoiced_again() {
    let mut crm = FakeCrm::default();
    crm.records = vec![distributor("co-1", "Acme Supply"), individual_record("in-2", "Sam Doe")];
    crm.contacts.insert("co-1".to_string(), "ct-1".to_string());
    let h = harness(crm);

    // First invocation processed co-1, then the platform timed out.
    let mut state = RunState::new(Utc::now().date_naive());
    state.mark_processed("co-1");
    RunStateStore::new(h.store.clone())
        .persist(&state)
        .await
        .unwrap();

    let summary = h.run.execute(RunTrigger::default()).await.unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.succeeded, 1);

    let creates = h.crm.create_calls.lock().unwrap();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].contact_id, "in-2");
}

#[tokio::test]
async fn dry_run_makes_no_external_writes_but_reports_amounts() {
    let mut crm = FakeCrm::default();
    crm.records = vec![distributor("co-1", "Acme Supply")];
    crm.contacts.insert("co-1".to_string(), "ct-1".to_string());
    let h = harness(crm);

    let summary = h
        .run
        .execute(RunTrigger {
            dry_run: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.total_amount, "2000");
    assert!(summary.report_url.as_deref().unwrap().starts_with("dry://"));
    assert!(h.crm.create_calls.lock().unwrap().is_empty());
    assert!(h.crm.dues_updates.lock().unwrap().is_empty());
    // Nothing was written to storage, state included.
    assert!(h.store.list("").await.unwrap().is_empty());
    // The summary email still goes out.
    assert_eq!(h.mailer.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn every_open_invoice_status_blocks_rebilling() {
    for status in OPEN_INVOICE_STATUSES {
        let mut crm = FakeCrm::default();
        crm.records = vec![individual_record("in-1", "Sam Doe")];
        crm.open_invoices.insert(
            "in-1".to_string(),
            ("inv-existing".to_string(), status.to_string()),
        );
        let h = harness(crm);

        let summary = h.run.execute(RunTrigger::default()).await.unwrap();
        assert_eq!(summary.skipped, 1, "status {status} should skip");
        assert!(h.crm.create_calls.lock().unwrap().is_empty());
    }
}

#[tokio::test]
async fn settled_invoice_status_does_not_block() {
    let mut crm = FakeCrm::default();
    crm.records = vec![individual_record("in-1", "Sam Doe")];
    crm.open_invoices
        .insert("in-1".to_string(), ("inv-old".to_string(), "PAID".to_string()));
    let h = harness(crm);

    let summary = h.run.execute(RunTrigger::default()).await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(h.crm.create_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn open_invoice_lookup_failure_fails_open() {
    let mut crm = FakeCrm::default();
    crm.records = vec![individual_record("in-1", "Sam Doe")];
    crm.fail_open_lookup = true;
    let h = harness(crm);

    let summary = h.run.execute(RunTrigger::default()).await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(h.crm.create_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn keep_draft_suppresses_finalize() {
    let mut crm = FakeCrm::default();
    crm.records = vec![individual_record("in-1", "Sam Doe")];
    let h = harness(crm);

    h.run
        .execute(RunTrigger {
            keep_draft: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(h.crm.create_calls.lock().unwrap().len(), 1);
    assert!(h.crm.finalize_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn pdf_test_mode_renders_without_crm_writes() {
    let mut crm = FakeCrm::default();
    crm.records = vec![
        individual_record("in-1", "Sam Doe"),
        individual_record("in-2", "Lee Park"),
        individual_record("in-3", "Ada Byron"),
    ];
    let h = harness(crm);

    let summary = h
        .run
        .execute(RunTrigger {
            pdf_test_limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(summary.processed, 2);
    assert!(h.crm.create_calls.lock().unwrap().is_empty());
    let period = Utc::now().date_naive().format("%Y-%m").to_string();
    let pdfs = h.store.list(&format!("invoices/{period}/")).await.unwrap();
    assert_eq!(pdfs.len(), 2);
    // Test modes never touch the resumable run state.
    let state_objects = h.store.list("run-state/").await.unwrap();
    assert!(state_objects.is_empty());
}

#[tokio::test]
async fn company_without_primary_contact_fails_alone() {
    let mut crm = FakeCrm::default();
    crm.records = vec![distributor("co-1", "Acme Supply"), individual_record("in-2", "Sam Doe")];
    // No contact registered for co-1.
    let h = harness(crm);

    let summary = h.run.execute(RunTrigger::default()).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(h.crm.create_calls.lock().unwrap().len(), 1);

    let body = &h.mailer.sent.lock().unwrap()[0].2;
    assert!(body.contains("Failures:"));
    assert!(body.contains("co-1"));
}

#[tokio::test]
async fn exhausted_time_budget_defers_the_whole_batch() {
    let mut crm = FakeCrm::default();
    crm.records = vec![individual_record("in-1", "Sam Doe")];
    let crm = Arc::new(crm);
    let store = Arc::new(MemoryObjectStore::new());
    let mailer = Arc::new(RecordingMailer::default());
    let mut exhausted = (*settings()).clone();
    exhausted.time_budget_secs = 0;
    let run = BillingRun::new(
        Arc::new(exhausted),
        crm.clone(),
        store.clone(),
        Arc::new(FakeRenderer),
        mailer,
    );

    let summary = run.execute(RunTrigger::default()).await.unwrap();
    assert_eq!(summary.processed, 0);
    assert!(summary.message.contains("deferred"));
    assert!(crm.create_calls.lock().unwrap().is_empty());

    let state = RunStateStore::new(store)
        .load(Utc::now().date_naive())
        .await
        .unwrap();
    assert!(!state.is_complete);
}

#[tokio::test]
async fn completed_period_short_circuits() {
    let mut crm = FakeCrm::default();
    crm.records = vec![individual_record("in-1", "Sam Doe")];
    let h = harness(crm);

    let mut state = RunState::new(Utc::now().date_naive());
    state.is_complete = true;
    RunStateStore::new(h.store.clone())
        .persist(&state)
        .await
        .unwrap();

    let summary = h.run.execute(RunTrigger::default()).await.unwrap();
    assert_eq!(summary.processed, 0);
    assert!(summary.message.contains("already complete"));
    assert!(h.crm.create_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn clear_state_restarts_the_period() {
    let mut crm = FakeCrm::default();
    crm.records = vec![individual_record("in-1", "Sam Doe")];
    let h = harness(crm);

    let mut state = RunState::new(Utc::now().date_naive());
    state.mark_processed("in-1");
    state.is_complete = true;
    RunStateStore::new(h.store.clone())
        .persist(&state)
        .await
        .unwrap();

    let summary = h
        .run
        .execute(RunTrigger {
            clear_state: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(h.crm.create_calls.lock().unwrap().len(), 1);
}

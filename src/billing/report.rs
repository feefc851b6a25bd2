use bigdecimal::BigDecimal;
use chrono::NaiveDate;

use crate::error::{BillingError, BillingResult};

use super::models::{EntityOutcome, OutcomeStatus, RunMode, RunSummary};

/// key: dues-report -> flat tabular run summary
///
/// Ephemeral: built once after the batch loop, written out as CSV, summarized
/// in the run email, then dropped.
#[derive(Debug)]
pub struct RunReport {
    pub run_date: NaiveDate,
    pub mode: RunMode,
    pub outcomes: Vec<EntityOutcome>,
}

impl RunReport {
    pub fn new(run_date: NaiveDate, mode: RunMode, outcomes: Vec<EntityOutcome>) -> Self {
        Self {
            run_date,
            mode,
            outcomes,
        }
    }

    pub fn processed(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.count(OutcomeStatus::Invoiced)
    }

    pub fn failed(&self) -> usize {
        self.count(OutcomeStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(OutcomeStatus::Skipped)
    }

    fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Sum of amounts across invoiced entities. Dry runs report this too;
    /// computation happens regardless of write mode.
    pub fn total_amount(&self) -> BigDecimal {
        self.outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Invoiced)
            .filter_map(|o| o.amount.clone())
            .fold(BigDecimal::from(0), |acc, amount| acc + amount)
    }

    pub fn storage_key(&self) -> String {
        format!("reports/{}.csv", self.run_date)
    }

    pub fn to_csv(&self) -> BillingResult<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record([
                "entity_id",
                "name",
                "kind",
                "category",
                "outcome",
                "amount",
                "invoice_id",
                "detail",
            ])
            .map_err(|e| BillingError::storage(format!("report header: {e}")))?;
        for outcome in &self.outcomes {
            let amount = outcome
                .amount
                .as_ref()
                .map(|a| a.to_string())
                .unwrap_or_default();
            writer
                .write_record([
                    outcome.entity_id.as_str(),
                    outcome.name.as_str(),
                    outcome.kind.as_str(),
                    outcome.category.as_str(),
                    outcome.status.as_str(),
                    amount.as_str(),
                    outcome.invoice_id.as_deref().unwrap_or_default(),
                    outcome.detail.as_str(),
                ])
                .map_err(|e| BillingError::storage(format!("report row: {e}")))?;
        }
        writer
            .into_inner()
            .map_err(|e| BillingError::storage(format!("report flush: {e}")))
    }

    pub fn email_subject(&self) -> String {
        format!(
            "Dues run {} ({}): {} invoiced, {} failed, {} skipped",
            self.run_date,
            self.mode.as_str(),
            self.succeeded(),
            self.failed(),
            self.skipped()
        )
    }

    pub fn email_body(&self, report_url: Option<&str>) -> String {
        let mut body = format!(
            "Membership dues run for {} ({} mode)\n\n\
             Processed: {}\nInvoiced:  {}\nFailed:    {}\nSkipped:   {}\n\
             Total billed: {}\n",
            self.run_date,
            self.mode.as_str(),
            self.processed(),
            self.succeeded(),
            self.failed(),
            self.skipped(),
            self.total_amount(),
        );
        if let Some(url) = report_url {
            body.push_str(&format!("\nFull report: {url}\n"));
        }
        let failures: Vec<&EntityOutcome> = self
            .outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Failed)
            .collect();
        if !failures.is_empty() {
            body.push_str("\nFailures:\n");
            for outcome in failures {
                body.push_str(&format!(
                    "  {} {} - {}\n",
                    outcome.entity_id, outcome.name, outcome.detail
                ));
            }
        }
        body
    }

    pub fn summary(&self, message: impl Into<String>, report_url: Option<String>) -> RunSummary {
        RunSummary {
            message: message.into(),
            run_date: self.run_date.to_string(),
            mode: self.mode.as_str().to_string(),
            processed: self.processed(),
            succeeded: self.succeeded(),
            failed: self.failed(),
            skipped: self.skipped(),
            total_amount: self.total_amount().to_string(),
            report_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, status: OutcomeStatus, amount: Option<i64>) -> EntityOutcome {
        EntityOutcome {
            entity_id: id.to_string(),
            name: format!("Entity {id}"),
            kind: "company".to_string(),
            category: "Distributor".to_string(),
            status,
            amount: amount.map(BigDecimal::from),
            invoice_id: None,
            detail: String::new(),
        }
    }

    fn report() -> RunReport {
        RunReport::new(
            NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
            RunMode::Full,
            vec![
                outcome("1", OutcomeStatus::Invoiced, Some(2000)),
                outcome("2", OutcomeStatus::Invoiced, Some(1500)),
                outcome("3", OutcomeStatus::Failed, None),
                outcome("4", OutcomeStatus::Skipped, None),
            ],
        )
    }

    #[test]
    fn counts_and_total_line_up() {
        let report = report();
        assert_eq!(report.processed(), 4);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.total_amount(), BigDecimal::from(3500));
    }

    #[test]
    fn csv_has_a_row_per_outcome() {
        let bytes = report().to_csv().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.trim().lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("entity_id,name,kind"));
        assert!(lines[1].contains("invoiced"));
        assert!(lines[3].contains("failed"));
    }

    #[test]
    fn email_body_lists_failures() {
        let body = report().email_body(Some("mem://reports/2026-08-01.csv"));
        assert!(body.contains("Total billed: 3500"));
        assert!(body.contains("Failures:"));
        assert!(body.contains("Entity 3"));
        assert!(body.contains("mem://reports/2026-08-01.csv"));
    }
}

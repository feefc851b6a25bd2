use std::collections::HashMap;
use std::fmt;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};

use crate::crm::CrmRecord;

/// CRM property names the run reads off membership records.
pub mod attrs {
    pub const MEMBERSHIP_TYPE: &str = "membership_type";
    pub const HOME_STATE: &str = "home_state";
    pub const DOMESTIC_STATES: &str = "domestic_states";
    pub const PROVINCES: &str = "provinces";
    pub const NON_DOMESTIC_TERRITORIES: &str = "non_domestic_territories";
    pub const SALES_TIER: &str = "sales_tier";
    pub const RENEWAL_DATE: &str = "renewal_date";
    pub const NAME: &str = "name";
    pub const KIND: &str = "kind";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipCategory {
    Distributor,
    Manufacturer,
    ServiceProvider,
    Individual,
}

impl MembershipCategory {
    /// Map a company's membership-type label. Unknown labels resolve to None
    /// and become a pricing error for that entity, not a run failure.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().replace([' ', '-', '_'], "").as_str() {
            "distributor" => Some(Self::Distributor),
            "manufacturer" => Some(Self::Manufacturer),
            "serviceprovider" => Some(Self::ServiceProvider),
            _ => None,
        }
    }
}

impl fmt::Display for MembershipCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Distributor => "Distributor",
            Self::Manufacturer => "Manufacturer",
            Self::ServiceProvider => "Service Provider",
            Self::Individual => "Individual",
        };
        f.write_str(label)
    }
}

/// key: dues-entity -> uniform in-memory membership shape
///
/// One variant per entity kind so the orchestrator stays type-uniform; the
/// raw CRM snapshot rides along as a read-only property bag.
#[derive(Debug, Clone)]
pub enum MembershipEntity {
    Company {
        id: String,
        name: String,
        category_label: String,
        billing_contact_id: String,
        attributes: HashMap<String, String>,
    },
    Individual {
        id: String,
        name: String,
        contact_id: String,
        attributes: HashMap<String, String>,
    },
}

impl MembershipEntity {
    pub fn from_company_record(record: &CrmRecord, billing_contact_id: String) -> Self {
        Self::Company {
            id: record.id.clone(),
            name: record
                .property(attrs::NAME)
                .unwrap_or("unnamed company")
                .to_string(),
            category_label: record
                .property(attrs::MEMBERSHIP_TYPE)
                .unwrap_or_default()
                .to_string(),
            billing_contact_id,
            attributes: record.properties.clone(),
        }
    }

    pub fn from_individual_record(record: &CrmRecord) -> Self {
        Self::Individual {
            id: record.id.clone(),
            name: record
                .property(attrs::NAME)
                .unwrap_or("unnamed member")
                .to_string(),
            contact_id: record.id.clone(),
            attributes: record.properties.clone(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Company { id, .. } | Self::Individual { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Company { name, .. } | Self::Individual { name, .. } => name,
        }
    }

    /// Invoice recipient: the primary contact for companies, the member
    /// themselves for individuals.
    pub fn billing_contact_id(&self) -> &str {
        match self {
            Self::Company {
                billing_contact_id, ..
            } => billing_contact_id,
            Self::Individual { contact_id, .. } => contact_id,
        }
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        match self {
            Self::Company { attributes, .. } | Self::Individual { attributes, .. } => attributes,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes()
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Company { .. } => "company",
            Self::Individual { .. } => "individual",
        }
    }

    pub fn category(&self) -> Option<MembershipCategory> {
        match self {
            Self::Company { category_label, .. } => MembershipCategory::from_label(category_label),
            Self::Individual { .. } => Some(MembershipCategory::Individual),
        }
    }

    pub fn category_label(&self) -> &str {
        match self {
            Self::Company { category_label, .. } => category_label,
            Self::Individual { .. } => "Individual",
        }
    }
}

/// One itemized charge on the invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub quantity: i64,
    pub unit_price: BigDecimal,
    pub description: String,
    pub product_ref: Option<String>,
}

impl LineItem {
    pub fn amount(&self) -> BigDecimal {
        BigDecimal::from(self.quantity) * &self.unit_price
    }
}

/// Pricing resolver output. `total` always equals the sum of line amounts;
/// the constructor is the only way to build one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceResult {
    pub total: BigDecimal,
    pub line_items: Vec<LineItem>,
}

impl PriceResult {
    pub fn from_line_items(line_items: Vec<LineItem>) -> Self {
        let total = line_items
            .iter()
            .fold(BigDecimal::from(0), |acc, item| acc + item.amount());
        Self { total, line_items }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    OpenInvoice(String),
    AlreadyProcessed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenInvoice(id) => write!(f, "open invoice {id} exists"),
            Self::AlreadyProcessed => f.write_str("already processed this run"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Invoiced,
    Skipped,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoiced => "invoiced",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

/// Per-entity outcome row feeding the run report.
#[derive(Debug, Clone, Serialize)]
pub struct EntityOutcome {
    pub entity_id: String,
    pub name: String,
    pub kind: String,
    pub category: String,
    pub status: OutcomeStatus,
    pub amount: Option<BigDecimal>,
    pub invoice_id: Option<String>,
    /// Skip reason or failure detail; empty on clean success.
    pub detail: String,
}

/// Trigger payload accepted by the run endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunTrigger {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub pdf_test_limit: Option<usize>,
    #[serde(default)]
    pub full_test_limit: Option<usize>,
    #[serde(default)]
    pub keep_draft: bool,
    #[serde(default)]
    pub clear_state: bool,
}

/// Execution mode resolved from the trigger. `dry_run` wins over the test
/// limits; the limits are mutually exclusive with pdf taking precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Full,
    DryRun,
    PdfTest(usize),
    FullTest(usize),
}

impl RunMode {
    pub fn from_trigger(trigger: &RunTrigger) -> Self {
        if trigger.dry_run {
            Self::DryRun
        } else if let Some(limit) = trigger.pdf_test_limit {
            Self::PdfTest(limit)
        } else if let Some(limit) = trigger.full_test_limit {
            Self::FullTest(limit)
        } else {
            Self::Full
        }
    }

    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::PdfTest(limit) | Self::FullTest(limit) => Some(*limit),
            Self::Full | Self::DryRun => None,
        }
    }

    /// Whether invoices are actually created and companies updated in the CRM.
    pub fn writes_crm(&self) -> bool {
        matches!(self, Self::Full | Self::FullTest(_))
    }

    /// Whether PDFs and reports are written to the object store.
    pub fn writes_storage(&self) -> bool {
        !matches!(self, Self::DryRun)
    }

    /// The resumable-run bookkeeping only applies to full production runs.
    pub fn tracks_state(&self) -> bool {
        matches!(self, Self::Full)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::DryRun => "dry_run",
            Self::PdfTest(_) => "pdf_test",
            Self::FullTest(_) => "full_test",
        }
    }
}

/// Body of the trigger response.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub message: String,
    pub run_date: String,
    pub mode: String,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_amount: String,
    pub report_url: Option<String>,
}

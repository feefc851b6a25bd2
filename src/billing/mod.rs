pub mod api;
pub mod guard;
pub mod models;
pub mod pricing;
pub mod report;
pub mod run;
pub mod state;
pub mod territory;

pub use guard::{should_skip, OPEN_INVOICE_STATUSES};
pub use models::{
    attrs, EntityOutcome, LineItem, MembershipCategory, MembershipEntity, OutcomeStatus,
    PriceResult, RunMode, RunSummary, RunTrigger, SkipReason,
};
pub use pricing::{parse_fee_label, resolve_price};
pub use report::RunReport;
pub use run::BillingRun;
pub use state::{RunState, RunStateStore};

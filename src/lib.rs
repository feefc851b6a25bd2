pub mod billing;
pub mod config;
pub mod crm;
pub mod error;
pub mod mailer;
pub mod pdf;
pub mod storage;

pub use billing::BillingRun;
pub use config::Settings;
pub use error::{BillingError, BillingResult};

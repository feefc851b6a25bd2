use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Failure taxonomy for a billing run. `Config` is fatal at startup; every
/// other variant is entity-scoped and recorded against the entity that hit it
/// without aborting the batch.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("config error: {0}")]
    Config(String),
    #[error("pricing error: {0}")]
    Pricing(String),
    #[error("lookup error: {0}")]
    Lookup(String),
    #[error("render error: {0}")]
    Render(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("mail error: {0}")]
    Mail(String),
}

impl BillingError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn pricing(msg: impl Into<String>) -> Self {
        Self::Pricing(msg.into())
    }

    pub fn lookup(msg: impl Into<String>) -> Self {
        Self::Lookup(msg.into())
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn mail(msg: impl Into<String>) -> Self {
        Self::Mail(msg.into())
    }
}

impl IntoResponse for BillingError {
    fn into_response(self) -> Response {
        let status = match self {
            BillingError::Lookup(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

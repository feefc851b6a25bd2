use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Router,
};
use tracing_subscriber::{fmt, EnvFilter};

use dues_automation::billing::{api, BillingRun};
use dues_automation::config::Settings;
use dues_automation::crm::HttpCrmClient;
use dues_automation::mailer::{ConsoleMailer, Mailer, SmtpMailer};
use dues_automation::pdf::HttpPdfRenderer;
use dues_automation::storage::FsObjectStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast: a missing required setting aborts before any entity is read.
    let settings = Arc::new(Settings::from_env()?);

    let crm = Arc::new(HttpCrmClient::new(
        settings.crm_base_url.clone(),
        settings.crm_token.clone(),
    ));
    let store = Arc::new(FsObjectStore::new(
        settings.storage_root.clone(),
        settings.public_base_url.clone(),
    ));
    let renderer = Arc::new(HttpPdfRenderer::new(settings.pdf_service_url.clone()));
    let mailer: Arc<dyn Mailer> = match &settings.smtp {
        Some(smtp) => Arc::new(SmtpMailer::new(smtp, settings.mail_from.clone())?),
        None => {
            tracing::warn!("no SMTP host configured; falling back to console mailer");
            Arc::new(ConsoleMailer)
        }
    };

    let run = Arc::new(BillingRun::new(
        settings.clone(),
        crm,
        store,
        renderer,
        mailer,
    ));

    let app = Router::new()
        .route("/health", get(api::health))
        .route("/api/billing/run", post(api::trigger_run))
        .layer(Extension(run));

    let addr: SocketAddr = format!("{}:{}", settings.bind_address, settings.bind_port).parse()?;
    tracing::info!(%addr, "listening for run triggers");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

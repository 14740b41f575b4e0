/// Identity Service Main Entry Point
///
/// Preflight for a deployment:
/// - loads configuration and builds the token signer
/// - opens the configured credential store (Postgres, or in-memory when
///   `DATABASE_URL` is unset)
/// - checks the reference data every operation depends on
use anyhow::{bail, Context, Result};
use identity_service::{
    config::Settings,
    security::Signer,
    store::{missing_reference_data, CredentialStore, MemoryCredentialStore, PgCredentialStore},
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "identity_service=info,info".into()),
        )
        .with_target(false)
        .json()
        .init();

    info!("Starting Identity Service preflight");

    let settings = Settings::load().context("Failed to load configuration")?;
    info!("Configuration loaded successfully");

    Signer::from_settings(&settings.jwt).context("Failed to build token signer")?;
    info!(issuer = %settings.jwt.issuer, "Token signer ready");

    let missing = match &settings.database {
        Some(database) => {
            let store = PgCredentialStore::connect(database)
                .await
                .context("Failed to connect to database")?;
            info!("Database connection pool ready");
            check_reference_data(&store).await?
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory credential store");
            check_reference_data(&MemoryCredentialStore::seeded()).await?
        }
    };

    if !missing.is_empty() {
        for item in &missing {
            error!(missing = %item, "Reference data missing");
        }
        bail!("{} reference row(s) missing", missing.len());
    }

    info!("Identity Service preflight passed");
    Ok(())
}

async fn check_reference_data<C: CredentialStore>(store: &C) -> Result<Vec<String>> {
    let mut unit = store
        .unit_of_work()
        .await
        .context("Failed to open credential store session")?;
    missing_reference_data(&mut unit)
        .await
        .context("Failed to read reference data")
}

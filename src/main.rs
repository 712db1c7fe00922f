use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vault_core::collaborators::{StaticTenantDirectory, TenantDirectory};
use vault_core::config::{master_key_from_env_value, CoreConfig, EnvValues};
use vault_core::crypto::StaticKeyProvider;
use vault_core::ids::UserId;
use vault_core::services::documents::PipelineReport;
use vault_core::{Collaborators, Vault};

const DEFAULT_PIPELINE_INTERVAL_SECS: u64 = 30;
const PURGE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

fn interval_from_env(name: &str, default_secs: u64) -> anyhow::Result<Duration> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => {
            let secs: u64 = v.trim().parse()?;
            anyhow::ensure!(secs > 0, "{name} must be positive");
            Ok(Duration::from_secs(secs))
        }
        _ => Ok(Duration::from_secs(default_secs)),
    }
}

fn open_vault() -> anyhow::Result<Vault> {
    let cfg = Arc::new(CoreConfig::from_env_values(EnvValues::from_process())?);
    let key = master_key_from_env_value(std::env::var("MEDVAULT_MASTER_KEY").ok())?;
    let tenants: Arc<dyn TenantDirectory> = match std::env::var("MEDVAULT_MEMBERS_FILE") {
        Ok(path) if !path.trim().is_empty() => {
            Arc::new(StaticTenantDirectory::load(Path::new(&path))?)
        }
        _ => {
            tracing::warn!("MEDVAULT_MEMBERS_FILE not set; only system maintenance will be authorised");
            Arc::new(StaticTenantDirectory::new(Some("default".into())))
        }
    };
    let collaborators = Collaborators::local(&cfg, Arc::new(StaticKeyProvider::new(key)), tenants)?;
    Ok(Vault::open(cfg, collaborators)?)
}

/// One pass of the document pipeline and the retention sweep.
fn run_maintenance(vault: &Vault) {
    match vault.pipeline().process_pending() {
        Ok(report) if report != PipelineReport::default() => tracing::info!(
            "pipeline: {} validated, {} failed validation, {} pending, {} errors",
            report.validated,
            report.failed_validation,
            report.still_pending,
            report.errors
        ),
        Ok(_) => {}
        Err(e) => tracing::error!("document pipeline failed: {}", e),
    }
    if let Err(e) = vault.documents().archive_expired_documents() {
        tracing::error!("retention sweep failed: {}", e);
    }
}

fn run_purge(vault: &Vault) {
    match vault.audit().purge_old_logs(&UserId::system(), None) {
        Ok(n) => tracing::info!("purged {} audit entries past retention", n),
        Err(e) => tracing::error!("audit purge failed: {}", e),
    }
}

/// Maintenance runner for a MedVault data directory
///
/// Opens the vault once, logs a health report, then on a fixed interval:
/// - moves uploaded documents through encryption confirmation and virus scanning
/// - archives documents past their retention period
/// - once a day, purges audit entries past the audit retention period
///
/// # Environment Variables
/// - `MEDVAULT_DATA_DIR`: root of the vault tables and blobs (default: "medvault_data")
/// - `MEDVAULT_MASTER_KEY`: base64 32-byte master key (required)
/// - `MEDVAULT_MEMBERS_FILE`: YAML tenant directory (optional)
/// - `MEDVAULT_PIPELINE_INTERVAL_SECS`: seconds between maintenance passes (default: 30)
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vault_core=info".parse()?)
                .add_directive("medvault_run=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let every = interval_from_env("MEDVAULT_PIPELINE_INTERVAL_SECS", DEFAULT_PIPELINE_INTERVAL_SECS)?;
    let vault = open_vault()?;

    let health = vault.integrity().health_check()?;
    tracing::info!("++ Starting MedVault maintenance every {:?}", every);
    tracing::info!("health: {}", serde_json::to_string(&health)?);
    if !health.ok {
        tracing::warn!("vault is not healthy; run `medvault orphans` for details");
    }

    let mut pipeline_tick = tokio::time::interval(every);
    let mut purge_tick = tokio::time::interval(PURGE_INTERVAL);

    loop {
        tokio::select! {
            _ = pipeline_tick.tick() => {
                let v = vault.clone();
                tokio::task::spawn_blocking(move || run_maintenance(&v)).await?;
            }
            _ = purge_tick.tick() => {
                let v = vault.clone();
                tokio::task::spawn_blocking(move || run_purge(&v)).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("-- Stopping MedVault maintenance");
                break;
            }
        }
    }

    Ok(())
}

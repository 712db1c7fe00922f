use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vault_core::collaborators::{StaticTenantDirectory, TenantDirectory};
use vault_core::config::{master_key_from_env_value, CoreConfig, EnvValues};
use vault_core::crypto::StaticKeyProvider;
use vault_core::domain::audit::{AuditFilter, ExportFormat};
use vault_core::domain::document::{DocumentMetadataInput, FileKind, UploadFile};
use vault_core::domain::patient::{DuplicateCandidate, NewPatient, PatientStatus};
use vault_core::ids::{DocumentId, PatientId, UserId};
use vault_core::services::patients::PatientQuery;
use vault_core::{Collaborators, Vault};

#[derive(Parser)]
#[command(name = "medvault")]
#[command(about = "MedVault clinical records CLI")]
struct Cli {
    /// Acting user id. Defaults to the system principal.
    #[arg(long, global = true)]
    actor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Entity counts, orphan count and data directory check
    Health,
    /// Register a patient
    Register {
        full_name: String,
        /// Birth date (YYYY-MM-DD)
        birth_date: String,
        gender: String,
        #[arg(long)]
        cpf: Option<String>,
    },
    /// List live patients
    List {
        /// Name fragment
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    /// Change a patient's status
    Status {
        patient_id: String,
        to: String,
        reason: String,
    },
    /// Status ledger of a patient, oldest first
    History { patient_id: String },
    /// Look for patients matching the given identity
    Duplicates {
        full_name: String,
        birth_date: String,
        #[arg(long)]
        cpf: Option<String>,
    },
    /// Upload a clinical document and run it through the pipeline
    Upload {
        patient_id: String,
        file: PathBuf,
        #[arg(long)]
        title: String,
        #[arg(long = "type", default_value = "other")]
        document_type: String,
        #[arg(long)]
        confidential: bool,
    },
    /// Decrypt a document version into a file
    Retrieve {
        document_id: String,
        output: PathBuf,
        #[arg(long)]
        version: Option<u32>,
    },
    /// Audit log operations
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
    /// List orphaned entities
    Orphans,
}

#[derive(Subcommand)]
enum AuditCommands {
    /// One page of matching entries
    Query {
        #[arg(long)]
        patient_id: Option<String>,
        #[arg(long)]
        operation: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Every matching entry as json, csv or xml
    Export {
        #[arg(long, default_value = "json")]
        format: String,
        #[arg(long)]
        patient_id: Option<String>,
    },
    /// Aggregate statistics
    Stats {
        /// RFC 3339 lower bound (inclusive)
        #[arg(long)]
        from: Option<String>,
        /// RFC 3339 upper bound (exclusive)
        #[arg(long)]
        to: Option<String>,
    },
    /// Delete entries past retention
    Purge {
        #[arg(long)]
        years: Option<u32>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_date(input: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .with_context(|| format!("invalid date '{input}', expected YYYY-MM-DD"))
}

fn parse_instant(input: Option<String>) -> anyhow::Result<Option<DateTime<Utc>>> {
    input
        .map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|d| d.with_timezone(&Utc))
                .with_context(|| format!("invalid timestamp '{s}'"))
        })
        .transpose()
}

fn parse_patient(input: Option<String>) -> anyhow::Result<Option<PatientId>> {
    Ok(input.map(|s| PatientId::parse(&s)).transpose()?)
}

/// Media type from the file extension; the core sniffs the content as well.
fn media_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    FileKind::ALL
        .into_iter()
        .find(|k| k.extensions().contains(&ext.as_str()))
        .map(|k| k.media_type())
        .unwrap_or("application/octet-stream")
}

fn open_vault() -> anyhow::Result<Vault> {
    let cfg = Arc::new(CoreConfig::from_env_values(EnvValues::from_process())?);
    tracing::debug!("opening vault at {}", cfg.data_dir().display());
    let key = master_key_from_env_value(std::env::var("MEDVAULT_MASTER_KEY").ok())?;
    let tenants: Arc<dyn TenantDirectory> = match std::env::var("MEDVAULT_MEMBERS_FILE") {
        Ok(path) if !path.trim().is_empty() => Arc::new(StaticTenantDirectory::load(Path::new(&path))?),
        _ => Arc::new(StaticTenantDirectory::new(Some("default".into()))),
    };
    let collaborators = Collaborators::local(&cfg, Arc::new(StaticKeyProvider::new(key)), tenants)?;
    Ok(Vault::open(cfg, collaborators)?)
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("vault_core=warn".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let actor = match cli.actor {
        Some(id) => UserId::parse(&id)?,
        None => UserId::system(),
    };
    let vault = open_vault()?;

    match cli.command {
        Commands::Health => {
            let report = vault.integrity().health_check()?;
            print_json(&report)?;
            if !report.ok {
                std::process::exit(1);
            }
        }
        Commands::Register {
            full_name,
            birth_date,
            gender,
            cpf,
        } => {
            let mut input = NewPatient::new(full_name, parse_date(&birth_date)?, gender);
            if let Some(cpf) = cpf {
                input = input.with_cpf(cpf);
            }
            let patient = vault.patients().register(&input, &actor)?;
            println!("{}", patient.id());
        }
        Commands::List { name, status } => {
            let status = status
                .map(|s| PatientStatus::parse("status", &s))
                .transpose()?;
            let patients = vault.patients().search(&PatientQuery {
                name,
                status,
                ..PatientQuery::default()
            })?;
            if patients.is_empty() {
                println!("No patients found.");
            }
            for patient in patients {
                println!(
                    "{}  {}  {}  registered {}",
                    patient.id(),
                    patient.full_name(),
                    patient.status(),
                    patient.created_at().format("%Y-%m-%d")
                );
            }
        }
        Commands::Status {
            patient_id,
            to,
            reason,
        } => {
            let to = PatientStatus::parse("to", &to)?;
            let patient = vault
                .status()
                .change_status(&PatientId::parse(&patient_id)?, to, &reason, &actor)?;
            println!("{} is now {}", patient.id(), patient.status());
        }
        Commands::History { patient_id } => {
            let history = vault.status().history(&PatientId::parse(&patient_id)?, &actor)?;
            print_json(&history)?;
        }
        Commands::Duplicates {
            full_name,
            birth_date,
            cpf,
        } => {
            let check = vault.patients().find_duplicates(&DuplicateCandidate {
                full_name,
                birth_date: parse_date(&birth_date)?,
                cpf,
            })?;
            print_json(&check)?;
        }
        Commands::Upload {
            patient_id,
            file,
            title,
            document_type,
            confidential,
        } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let file_name = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload")
                .to_string();
            let upload = UploadFile::new(file_name, media_type_for(&file), bytes);
            let metadata = DocumentMetadataInput {
                title,
                document_type,
                confidential,
                ..DocumentMetadataInput::default()
            };
            let document =
                vault
                    .documents()
                    .upload(&PatientId::parse(&patient_id)?, &upload, &metadata, &actor)?;
            let document = vault.pipeline().process(document.id())?;
            println!("{} {}", document.id(), document.status());
        }
        Commands::Retrieve {
            document_id,
            output,
            version,
        } => {
            let retrieved = vault.documents().retrieve_document(
                &DocumentId::parse(&document_id)?,
                version,
                &actor,
            )?;
            std::fs::write(&output, &retrieved.bytes)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!(
                "wrote version {} ({} bytes) to {}",
                retrieved.version,
                retrieved.bytes.len(),
                output.display()
            );
        }
        Commands::Audit { command } => match command {
            AuditCommands::Query {
                patient_id,
                operation,
                offset,
                limit,
            } => {
                let filter = AuditFilter {
                    patient_id: parse_patient(patient_id)?,
                    operation,
                    offset,
                    limit,
                    ..AuditFilter::default()
                };
                print_json(&vault.audit().query(&actor, &filter)?)?;
            }
            AuditCommands::Export { format, patient_id } => {
                let filter = AuditFilter {
                    patient_id: parse_patient(patient_id)?,
                    ..AuditFilter::default()
                };
                let format = ExportFormat::parse(&format)?;
                println!("{}", vault.audit().export(&actor, &filter, format)?);
            }
            AuditCommands::Stats { from, to } => {
                let stats = vault
                    .audit()
                    .statistics(&actor, parse_instant(from)?, parse_instant(to)?)?;
                print_json(&stats)?;
            }
            AuditCommands::Purge { years } => {
                let deleted = vault.audit().purge_old_logs(&actor, years)?;
                println!("purged {deleted} audit entries");
            }
        },
        Commands::Orphans => {
            let report = vault.integrity().find_orphans()?;
            print_json(&report)?;
        }
    }

    Ok(())
}

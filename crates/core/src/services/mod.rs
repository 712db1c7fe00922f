//! Service layer: one type per area of the vault, each holding `Arc`s to the shared
//! repositories and audit engine. [`crate::vault::Vault`] wires them together.

pub mod access;
pub mod audit;
pub mod compliance;
pub mod documents;
pub mod integrity;
pub mod patients;
pub mod records;
pub mod status;

#[cfg(test)]
pub(crate) mod test_support {
    use super::access::TenantGuard;
    use super::audit::AuditService;
    use super::compliance::ComplianceService;
    use super::documents::{DocumentPipeline, DocumentStore};
    use super::integrity::IntegrityService;
    use super::patients::PatientService;
    use super::records::MedicalRecordService;
    use super::status::StatusTracker;
    use crate::collaborators::tests::RecordingAlertSink;
    use crate::collaborators::{SignatureScanner, StaticTenantDirectory};
    use crate::config::{AuditSettings, CoreConfig, DocumentSettings};
    use crate::crypto::tests::{fast_kdf, test_master_key};
    use crate::crypto::StaticKeyProvider;
    use crate::ids::UserId;
    use crate::repositories::Repositories;
    use crate::vault::{Collaborators, Vault};
    use std::sync::Arc;
    use tempfile::TempDir;
    use vault_files::FsBlobStore;

    /// A vault in a temporary directory with four users: a physician, a nurse and an admin in
    /// tenant "clinic", and an outsider in tenant "elsewhere".
    pub(crate) struct TestVault {
        _temp: TempDir,
        pub(crate) repos: Arc<Repositories>,
        pub(crate) audit: Arc<AuditService>,
        pub(crate) guard: Arc<TenantGuard>,
        pub(crate) patients: Arc<PatientService>,
        pub(crate) status: Arc<StatusTracker>,
        pub(crate) records: Arc<MedicalRecordService>,
        pub(crate) documents: Arc<DocumentStore>,
        pub(crate) pipeline: Arc<DocumentPipeline>,
        pub(crate) compliance: Arc<ComplianceService>,
        pub(crate) integrity: Arc<IntegrityService>,
        pub(crate) alerts: Arc<RecordingAlertSink>,
        pub(crate) physician: UserId,
        pub(crate) nurse: UserId,
        pub(crate) admin: UserId,
        pub(crate) outsider: UserId,
    }

    impl TestVault {
        pub(crate) fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let cfg = Arc::new(
                CoreConfig::new(
                    temp.path().to_path_buf(),
                    AuditSettings::default(),
                    DocumentSettings::default(),
                    fast_kdf(),
                )
                .unwrap(),
            );
            let (physician, nurse, admin, outsider) =
                (UserId::new(), UserId::new(), UserId::new(), UserId::new());
            let tenants = StaticTenantDirectory::new(Some("clinic".into()))
                .with_member(physician.clone(), "clinic", "physician")
                .with_member(nurse.clone(), "clinic", "nurse")
                .with_member(admin.clone(), "clinic", "admin")
                .with_member(outsider.clone(), "elsewhere", "physician");
            let alerts = Arc::new(RecordingAlertSink::default());

            let vault = Vault::open(
                cfg.clone(),
                Collaborators {
                    tenants: Arc::new(tenants),
                    keys: Arc::new(StaticKeyProvider::new(test_master_key())),
                    blobs: Arc::new(FsBlobStore::new(&cfg.blobs_dir()).unwrap()),
                    scanner: Arc::new(SignatureScanner::new()),
                    alerts: alerts.clone(),
                },
            )
            .unwrap();

            Self {
                _temp: temp,
                repos: vault.repos.clone(),
                audit: vault.audit.clone(),
                guard: vault.guard.clone(),
                patients: vault.patients.clone(),
                status: vault.status.clone(),
                records: vault.records.clone(),
                documents: vault.documents.clone(),
                pipeline: vault.pipeline.clone(),
                compliance: vault.compliance.clone(),
                integrity: vault.integrity.clone(),
                alerts,
                physician,
                nurse,
                admin,
                outsider,
            }
        }
    }
}

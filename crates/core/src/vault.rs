//! Composition root.
//!
//! [`Vault::open`] builds the repositories and every service exactly once from a resolved
//! [`CoreConfig`] and the external collaborators. Nothing in the crate looks services up from
//! global state; outer layers hold a `Vault` and call through its accessors.

use crate::collaborators::{
    AlertSink, SignatureScanner, TenantDirectory, TracingAlertSink, VirusScanner,
};
use crate::config::CoreConfig;
use crate::crypto::KeyProvider;
use crate::repositories::Repositories;
use crate::services::access::TenantGuard;
use crate::services::audit::AuditService;
use crate::services::compliance::ComplianceService;
use crate::services::documents::{DocumentPipeline, DocumentStore};
use crate::services::integrity::IntegrityService;
use crate::services::patients::PatientService;
use crate::services::records::MedicalRecordService;
use crate::services::status::StatusTracker;
use crate::CoreResult;
use std::sync::Arc;
use vault_files::{BlobStore, FsBlobStore};

/// The black boxes the vault depends on.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub tenants: Arc<dyn TenantDirectory>,
    pub keys: Arc<dyn KeyProvider>,
    pub blobs: Arc<dyn BlobStore>,
    pub scanner: Arc<dyn VirusScanner>,
    pub alerts: Arc<dyn AlertSink>,
}

impl Collaborators {
    /// Filesystem blobs under the data directory, the signature scanner and tracing alerts.
    pub fn local(
        cfg: &CoreConfig,
        keys: Arc<dyn KeyProvider>,
        tenants: Arc<dyn TenantDirectory>,
    ) -> CoreResult<Self> {
        Ok(Self {
            tenants,
            keys,
            blobs: Arc::new(FsBlobStore::new(&cfg.blobs_dir())?),
            scanner: Arc::new(SignatureScanner::new()),
            alerts: Arc::new(TracingAlertSink),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Vault {
    cfg: Arc<CoreConfig>,
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
}

impl Vault {
    /// # Errors
    ///
    /// Returns [`crate::CoreError::StorageDirCreation`] if the table directories cannot be
    /// created under the data directory.
    pub fn open(cfg: Arc<CoreConfig>, collaborators: Collaborators) -> CoreResult<Self> {
        let Collaborators {
            tenants,
            keys,
            blobs,
            scanner,
            alerts,
        } = collaborators;

        let repos = Arc::new(Repositories::open(&cfg, blobs)?);
        let audit = Arc::new(AuditService::new(
            cfg.clone(),
            keys.clone(),
            tenants.clone(),
            alerts,
        ));
        let guard = Arc::new(TenantGuard::new(tenants, audit.clone()));
        let documents = Arc::new(DocumentStore::new(
            cfg.clone(),
            repos.clone(),
            audit.clone(),
            keys,
            guard.clone(),
        ));

        tracing::info!("vault opened at {}", cfg.data_dir().display());
        Ok(Self {
            patients: Arc::new(PatientService::new(repos.clone(), audit.clone(), guard.clone())),
            status: Arc::new(StatusTracker::new(repos.clone(), audit.clone(), guard.clone())),
            records: Arc::new(MedicalRecordService::new(repos.clone(), audit.clone(), guard.clone())),
            pipeline: Arc::new(DocumentPipeline::new(documents.clone(), scanner)),
            compliance: Arc::new(ComplianceService::new(repos.clone(), audit.clone(), guard.clone())),
            integrity: Arc::new(IntegrityService::new(cfg.clone(), repos.clone(), audit.clone())),
            documents,
            guard,
            audit,
            repos,
            cfg,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    pub fn patients(&self) -> &PatientService {
        &self.patients
    }

    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    pub fn records(&self) -> &MedicalRecordService {
        &self.records
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    pub fn pipeline(&self) -> &DocumentPipeline {
        &self.pipeline
    }

    pub fn compliance(&self) -> &ComplianceService {
        &self.compliance
    }

    pub fn audit(&self) -> &AuditService {
        &self.audit
    }

    pub fn integrity(&self) -> &IntegrityService {
        &self.integrity
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }
}

//! Persistence with patient-scoped referential integrity.
//!
//! Patients are the root of every ownership chain. Medical records, documents, status
//! transitions and consents each carry a `patient_id` and are written only while the owning
//! patient's lock is held and the patient is known to exist, so a dependent can never be created
//! for a patient that a concurrent delete is removing.

pub mod audit_log;
pub mod locks;
pub mod table;

use crate::config::CoreConfig;
use crate::constants::{
    CONSENT_FILENAME, DOCUMENT_FILENAME, ENCRYPTION_METADATA_FILENAME, MEDICAL_RECORD_FILENAME,
    PATIENT_FILENAME, STATUS_TRANSITION_FILENAME,
};
use crate::domain::clinical::MedicalRecord;
use crate::domain::consent::ConsentRecord;
use crate::domain::document::{Document, DocumentEncryption};
use crate::domain::patient::Patient;
use crate::domain::status::{sort_ledger, StatusTransition};
use crate::ids::{ConsentId, DocumentId, MedicalRecordId, PatientId, StatusTransitionId};
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use vault_files::{BlobPath, BlobStore};
use vault_uuid::ShardableUuid;

pub use locks::PatientLocks;
pub use table::Table;

/// An entity owned by exactly one patient.
pub trait Dependent: Serialize + DeserializeOwned + Clone {
    type Id: Clone + std::fmt::Display;

    fn id(&self) -> &Self::Id;
    fn key(&self) -> &ShardableUuid;
    fn owner(&self) -> &PatientId;
    /// The same entity pointing at another patient.
    fn reassigned_to(&self, patient_id: &PatientId, now: DateTime<Utc>) -> Self;
}

impl Dependent for MedicalRecord {
    type Id = MedicalRecordId;

    fn id(&self) -> &MedicalRecordId {
        MedicalRecord::id(self)
    }

    fn key(&self) -> &ShardableUuid {
        MedicalRecord::id(self).as_uuid()
    }

    fn owner(&self) -> &PatientId {
        self.patient_id()
    }

    fn reassigned_to(&self, patient_id: &PatientId, now: DateTime<Utc>) -> Self {
        self.reassigned(patient_id, now)
    }
}

impl Dependent for Document {
    type Id = DocumentId;

    fn id(&self) -> &DocumentId {
        Document::id(self)
    }

    fn key(&self) -> &ShardableUuid {
        Document::id(self).as_uuid()
    }

    fn owner(&self) -> &PatientId {
        self.patient_id()
    }

    fn reassigned_to(&self, patient_id: &PatientId, now: DateTime<Utc>) -> Self {
        self.reassigned(patient_id, now)
    }
}

impl Dependent for StatusTransition {
    type Id = StatusTransitionId;

    fn id(&self) -> &StatusTransitionId {
        StatusTransition::id(self)
    }

    fn key(&self) -> &ShardableUuid {
        StatusTransition::id(self).as_uuid()
    }

    fn owner(&self) -> &PatientId {
        self.patient_id()
    }

    fn reassigned_to(&self, patient_id: &PatientId, _now: DateTime<Utc>) -> Self {
        self.reassigned(patient_id)
    }
}

impl Dependent for ConsentRecord {
    type Id = ConsentId;

    fn id(&self) -> &ConsentId {
        ConsentRecord::id(self)
    }

    fn key(&self) -> &ShardableUuid {
        ConsentRecord::id(self).as_uuid()
    }

    fn owner(&self) -> &PatientId {
        self.patient_id()
    }

    fn reassigned_to(&self, patient_id: &PatientId, _now: DateTime<Utc>) -> Self {
        self.reassigned(patient_id)
    }
}

/// Dependents whose owning patient no longer exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanReport {
    pub medical_records: Vec<MedicalRecordId>,
    pub documents: Vec<DocumentId>,
    pub status_transitions: Vec<StatusTransitionId>,
    pub consents: Vec<ConsentId>,
    /// Encryption metadata whose document no longer exists.
    pub encryption_metadata: Vec<DocumentId>,
}

impl OrphanReport {
    pub fn total(&self) -> usize {
        self.medical_records.len()
            + self.documents.len()
            + self.status_transitions.len()
            + self.consents.len()
            + self.encryption_metadata.len()
    }

    pub fn is_clean(&self) -> bool {
        self.total() == 0
    }
}

/// What a cascade removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeReport {
    pub medical_records: usize,
    pub documents: usize,
    pub status_transitions: usize,
    pub consents: usize,
    pub blobs: usize,
}

/// Per-table entity counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub patients: usize,
    pub medical_records: usize,
    pub documents: usize,
    pub status_transitions: usize,
    pub consents: usize,
}

/// Every table plus the blob store, sharing one set of patient locks.
#[derive(Debug)]
pub struct Repositories {
    pub(crate) patients: Table<Patient>,
    pub(crate) records: Table<MedicalRecord>,
    pub(crate) documents: Table<Document>,
    pub(crate) encryption: Table<DocumentEncryption>,
    pub(crate) transitions: Table<StatusTransition>,
    pub(crate) consents: Table<ConsentRecord>,
    blobs: Arc<dyn BlobStore>,
    locks: PatientLocks,
}

impl Repositories {
    /// Open the tables under the configured data directory, creating their roots.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StorageDirCreation`] if a table directory cannot be created.
    pub fn open(cfg: &CoreConfig, blobs: Arc<dyn BlobStore>) -> CoreResult<Self> {
        let repos = Self {
            patients: Table::new(cfg.patients_dir(), PATIENT_FILENAME, "patient"),
            records: Table::new(cfg.medical_records_dir(), MEDICAL_RECORD_FILENAME, "medical record"),
            documents: Table::new(cfg.documents_dir(), DOCUMENT_FILENAME, "document"),
            encryption: Table::new(
                cfg.encryption_metadata_dir(),
                ENCRYPTION_METADATA_FILENAME,
                "encryption metadata",
            ),
            transitions: Table::new(
                cfg.status_history_dir(),
                STATUS_TRANSITION_FILENAME,
                "status transition",
            ),
            consents: Table::new(cfg.consents_dir(), CONSENT_FILENAME, "consent"),
            blobs,
            locks: PatientLocks::new(),
        };
        for root in [
            repos.patients.root(),
            repos.records.root(),
            repos.documents.root(),
            repos.encryption.root(),
            repos.transitions.root(),
            repos.consents.root(),
        ] {
            fs::create_dir_all(root).map_err(CoreError::StorageDirCreation)?;
        }
        Ok(repos)
    }

    pub fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    pub fn locks(&self) -> &PatientLocks {
        &self.locks
    }

    pub fn patient(&self, id: &PatientId) -> CoreResult<Patient> {
        self.patients.fetch(id.as_uuid())
    }

    /// The patient if it exists and is not soft-deleted, else a referential-integrity error
    /// naming `entity`.
    ///
    /// Callers must hold the patient's lock for the check to mean anything.
    pub(crate) fn require_live_patient(
        &self,
        entity: &'static str,
        id: &PatientId,
    ) -> CoreResult<Patient> {
        match self.patients.get(id.as_uuid())? {
            Some(patient) if !patient.is_deleted() => Ok(patient),
            _ => Err(CoreError::ReferentialIntegrity {
                entity,
                patient_id: id.to_string(),
            }),
        }
    }

    /// Insert a dependent, checking its owner under the owner's lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReferentialIntegrity`] if the owner does not exist (or is
    /// soft-deleted); nothing is written in that case.
    pub fn insert_dependent<D: Dependent>(&self, table: &Table<D>, value: &D) -> CoreResult<()> {
        self.locks.with_lock(value.owner(), || {
            self.require_live_patient(table.entity(), value.owner())?;
            table.insert_new(value.key(), value)
        })
    }

    /// Dependents of one patient, unordered.
    pub fn dependents_of<D: Dependent>(
        &self,
        table: &Table<D>,
        patient_id: &PatientId,
    ) -> CoreResult<Vec<D>> {
        Ok(table
            .list()?
            .into_iter()
            .filter(|d| d.owner() == patient_id)
            .collect())
    }

    /// The patient's own status ledger in chronological order.
    ///
    /// Rows carried over from a merged duplicate are left out.
    pub fn status_ledger(&self, patient_id: &PatientId) -> CoreResult<Vec<StatusTransition>> {
        let mut rows: Vec<StatusTransition> = self
            .dependents_of(&self.transitions, patient_id)?
            .into_iter()
            .filter(StatusTransition::is_own)
            .collect();
        sort_ledger(&mut rows);
        Ok(rows)
    }

    /// Physically remove a patient and everything it owns, dependents first.
    ///
    /// Runs under the patient's lock so a concurrent dependent insert either lands before the
    /// sweep (and is removed with it) or observes the patient gone and fails.
    pub fn cascade_delete(&self, patient_id: &PatientId) -> CoreResult<CascadeReport> {
        let report = self.locks.with_lock(patient_id, || {
            if !self.patients.exists(patient_id.as_uuid()) {
                return Err(CoreError::not_found("patient", patient_id));
            }
            let mut report = CascadeReport {
                medical_records: self.remove_dependents(&self.records, patient_id)?,
                status_transitions: self.remove_dependents(&self.transitions, patient_id)?,
                consents: self.remove_dependents(&self.consents, patient_id)?,
                ..CascadeReport::default()
            };
            for document in self.dependents_of(&self.documents, patient_id)? {
                report.blobs += self.remove_document_files(&document)?;
                self.documents.remove(document.key())?;
                report.documents += 1;
            }
            self.patients.remove(patient_id.as_uuid())?;
            Ok(report)
        })?;
        self.locks.forget(patient_id);
        tracing::info!(
            "cascade delete of patient {} removed {} records, {} documents, {} transitions, {} consents",
            patient_id,
            report.medical_records,
            report.documents,
            report.status_transitions,
            report.consents
        );
        Ok(report)
    }

    fn remove_dependents<D: Dependent>(
        &self,
        table: &Table<D>,
        patient_id: &PatientId,
    ) -> CoreResult<usize> {
        let mut removed = 0;
        for dependent in self.dependents_of(table, patient_id)? {
            if table.remove(dependent.key())? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete every blob of a document and its encryption metadata.
    pub(crate) fn remove_document_files(&self, document: &Document) -> CoreResult<usize> {
        let mut removed = 0;
        for path in document.blob_paths() {
            if self.blobs.delete(&BlobPath::new(path)?)? {
                removed += 1;
            }
        }
        self.encryption.remove(document.id().as_uuid())?;
        Ok(removed)
    }

    /// Point every dependent of `from` at `to`. Callers hold both patients' locks.
    pub(crate) fn reassign_dependents(
        &self,
        from: &PatientId,
        to: &PatientId,
        now: DateTime<Utc>,
    ) -> CoreResult<usize> {
        Ok(self.reassign(&self.records, from, to, now)?
            + self.reassign(&self.documents, from, to, now)?
            + self.reassign(&self.transitions, from, to, now)?
            + self.reassign(&self.consents, from, to, now)?)
    }

    fn reassign<D: Dependent>(
        &self,
        table: &Table<D>,
        from: &PatientId,
        to: &PatientId,
        now: DateTime<Utc>,
    ) -> CoreResult<usize> {
        let owned = self.dependents_of(table, from)?;
        for dependent in &owned {
            table.replace(dependent.key(), &dependent.reassigned_to(to, now))?;
        }
        Ok(owned.len())
    }

    /// Enumerate dependents whose patient no longer exists.
    pub fn find_orphans(&self) -> CoreResult<OrphanReport> {
        let patients: HashSet<PatientId> = self
            .patients
            .list()?
            .into_iter()
            .map(|p| p.id().clone())
            .collect();
        let documents = self.documents.list()?;
        let document_ids: HashSet<&DocumentId> = documents.iter().map(|d| d.id()).collect();

        Ok(OrphanReport {
            medical_records: orphans_in(self.records.list()?, &patients),
            status_transitions: orphans_in(self.transitions.list()?, &patients),
            consents: orphans_in(self.consents.list()?, &patients),
            encryption_metadata: self
                .encryption
                .list()?
                .into_iter()
                .filter(|meta| !document_ids.contains(&meta.document_id))
                .map(|meta| meta.document_id)
                .collect(),
            documents: orphans_in(documents, &patients),
        })
    }

    pub fn counts(&self) -> CoreResult<EntityCounts> {
        Ok(EntityCounts {
            patients: self.patients.count()?,
            medical_records: self.records.count()?,
            documents: self.documents.count()?,
            status_transitions: self.transitions.count()?,
            consents: self.consents.count()?,
        })
    }
}

fn orphans_in<D: Dependent>(items: Vec<D>, patients: &HashSet<PatientId>) -> Vec<D::Id> {
    items
        .into_iter()
        .filter(|d| !patients.contains(d.owner()))
        .map(|d| d.id().clone())
        .collect()
}

//! Patient registration, updates, search, duplicate detection and merge.

use crate::domain::audit::{AccessResult, NewAuditEntry};
use crate::domain::document::DocumentStatus;
use crate::domain::patient::{
    DuplicateCandidate, DuplicateCheck, DuplicateMatch, MergeStrategy, NewPatient, Patient,
    PatientStatus, PatientUpdate,
};
use crate::domain::status::{next_sequence, StatusTransition};
use crate::domain::values::Cpf;
use crate::ids::{PatientId, UserId};
use crate::repositories::{Dependent, Repositories};
use crate::services::access::TenantGuard;
use crate::services::audit::AuditService;
use crate::{CoreError, CoreResult, OperationContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Reason recorded on the first ledger row of every patient.
pub const REGISTRATION_REASON: &str = "Patient registered";

/// Search criteria. Empty criteria match every live patient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientQuery {
    /// Case-insensitive fragment of the full name.
    pub name: Option<String>,
    pub status: Option<PatientStatus>,
    /// Masked or bare CPF.
    pub cpf: Option<String>,
    pub include_deleted: bool,
}

fn audit_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

#[derive(Debug)]
pub struct PatientService {
    repos: Arc<Repositories>,
    audit: Arc<AuditService>,
    guard: Arc<TenantGuard>,
}

impl PatientService {
    pub fn new(repos: Arc<Repositories>, audit: Arc<AuditService>, guard: Arc<TenantGuard>) -> Self {
        Self { repos, audit, guard }
    }

    /// Resolve the patient, then check that `actor` may act on it.
    fn require_access(&self, id: &PatientId, actor: &UserId, operation: &'static str) -> CoreResult<()> {
        self.repos.patient(id)?;
        self.guard.require_member(actor, id, operation, "patient")
    }

    /// Register a new patient in status `new` together with its first ledger row.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Validation`] listing every invalid field, or a storage error if the
    /// patient or its ledger row could not be written (in which case neither remains).
    pub fn register(&self, input: &NewPatient, actor: &UserId) -> CoreResult<Patient> {
        let now = Utc::now();
        let patient = Patient::register(input, actor, now)?;
        let initial = StatusTransition::new(
            patient.id(),
            None,
            PatientStatus::New,
            REGISTRATION_REASON,
            actor,
            now,
            1,
        )?;

        self.repos
            .locks()
            .with_lock(patient.id(), || {
                self.repos.patients.insert_new(patient.id().as_uuid(), &patient)?;
                if let Err(e) = self.repos.transitions.insert_new(initial.key(), &initial) {
                    if let Err(cleanup) = self.repos.patients.remove(patient.id().as_uuid()) {
                        return Err(CoreError::CleanupAfterFailure {
                            path: patient.id().to_string(),
                            error: Box::new(e),
                            cleanup_error: Box::new(cleanup),
                        });
                    }
                    return Err(e);
                }
                Ok(())
            })
            .context("register patient")?;

        self.guard.directory().enroll_patient(patient.id(), actor)?;
        tracing::info!("registered patient {}", patient.id());
        self.audit.log_data_access(
            NewAuditEntry::new(actor, "create", "patient", AccessResult::Granted)
                .patient(patient.id())
                .after(audit_value(&patient)),
        );
        Ok(patient)
    }

    /// The stored patient, including soft-deleted ones.
    pub fn get(&self, id: &PatientId) -> CoreResult<Patient> {
        self.repos.patient(id)
    }

    /// Apply `update` if the stored `updated_at` still equals `expected_updated_at`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Conflict`] when the patient changed since the caller read it or is
    /// soft-deleted, [`CoreError::Validation`] for invalid replacement values and
    /// [`CoreError::AccessDenied`] for actors outside the patient's tenant.
    pub fn update(
        &self,
        id: &PatientId,
        update: &PatientUpdate,
        expected_updated_at: DateTime<Utc>,
        actor: &UserId,
    ) -> CoreResult<Patient> {
        self.require_access(id, actor, "update")?;
        let (before, after) = self.repos.locks().with_lock(id, || {
            let current = self.repos.patient(id)?;
            if current.is_deleted() {
                return Err(CoreError::Conflict(format!("patient {id} is deleted")));
            }
            if current.updated_at() != expected_updated_at {
                return Err(CoreError::Conflict(format!(
                    "patient {id} was modified at {}",
                    current.updated_at()
                )));
            }
            let next = current.updated(update, Utc::now())?;
            self.repos
                .patients
                .replace(id.as_uuid(), &next)
                .context("update patient")?;
            Ok((current, next))
        })?;

        self.audit.log_data_access(
            NewAuditEntry::new(actor, "update", "patient", AccessResult::Granted)
                .patient(id)
                .before(audit_value(&before))
                .after(audit_value(&after)),
        );
        Ok(after)
    }

    /// Soft-delete: stamp `deleted_at`, archive validated documents, keep everything else.
    ///
    /// Deleting an already deleted patient returns it unchanged.
    pub fn delete(&self, id: &PatientId, actor: &UserId) -> CoreResult<Patient> {
        self.require_access(id, actor, "delete")?;
        let now = Utc::now();
        let (deleted, archived) = self.repos.locks().with_lock(id, || {
            let current = self.repos.patient(id)?;
            if current.is_deleted() {
                return Ok((current, 0));
            }
            let mut archived = 0;
            for document in self.repos.dependents_of(&self.repos.documents, id)? {
                if document.status() == DocumentStatus::Validated {
                    self.repos
                        .documents
                        .replace(document.key(), &document.archived(now)?)?;
                    archived += 1;
                }
            }
            let next = current.soft_deleted(actor, now);
            self.repos.patients.replace(id.as_uuid(), &next)?;
            Ok((next, archived))
        })
        .context("delete patient")?;

        tracing::info!("soft-deleted patient {} ({} documents archived)", id, archived);
        self.audit.log_data_access(
            NewAuditEntry::new(actor, "delete", "patient", AccessResult::Granted)
                .patient(id)
                .after(json!({ "deleted_at": deleted.deleted_at(), "archived_documents": archived })),
        );
        Ok(deleted)
    }

    /// Patients matching every given criterion, oldest registration first.
    pub fn search(&self, query: &PatientQuery) -> CoreResult<Vec<Patient>> {
        let cpf = match query.cpf.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => Some(Cpf::new("cpf", raw)?),
            None => None,
        };
        let fragment = query
            .name
            .as_deref()
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty());

        let mut found: Vec<Patient> = self
            .repos
            .patients
            .list()
            .context("search patients")?
            .into_iter()
            .filter(|p| query.include_deleted || !p.is_deleted())
            .filter(|p| query.status.is_none_or(|s| p.status() == s))
            .filter(|p| cpf.as_ref().is_none_or(|c| p.personal().cpf.as_ref() == Some(c)))
            .filter(|p| {
                fragment
                    .as_deref()
                    .is_none_or(|f| p.full_name().as_str().to_lowercase().contains(f))
            })
            .collect();
        found.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then(a.id().cmp(b.id())));
        Ok(found)
    }

    /// Live patients that look like the same person as `candidate`.
    pub fn find_duplicates(&self, candidate: &DuplicateCandidate) -> CoreResult<DuplicateCheck> {
        let matches = self
            .repos
            .patients
            .list()
            .context("find duplicate patients")?
            .into_iter()
            .filter(|p| !p.is_deleted())
            .filter_map(|p| {
                p.duplicate_match(candidate).map(|matched_fields| DuplicateMatch {
                    patient_id: p.id().clone(),
                    matched_fields,
                })
            })
            .collect();
        Ok(DuplicateCheck::from_matches(matches))
    }

    /// Merge `duplicate` into `primary` field by field, move the duplicate's dependents to the
    /// primary and remove the duplicate. Both patients stay locked for the whole merge.
    ///
    /// The duplicate's ledger rows move along marked with their origin and stay out of the
    /// primary's status views. One new row records the merge itself and ends in the merged
    /// patient's status.
    pub fn merge(
        &self,
        primary_id: &PatientId,
        duplicate_id: &PatientId,
        strategy: &MergeStrategy,
        actor: &UserId,
    ) -> CoreResult<Patient> {
        if primary_id == duplicate_id {
            return Err(CoreError::InvalidInput(
                "a patient cannot be merged into itself".into(),
            ));
        }
        self.require_access(primary_id, actor, "merge")?;
        self.require_access(duplicate_id, actor, "merge")?;
        let now = Utc::now();
        let (merged, moved) = self
            .repos
            .locks()
            .with_pair(primary_id, duplicate_id, || {
                let primary = self.repos.patient(primary_id)?;
                let duplicate = self.repos.patient(duplicate_id)?;
                if primary.is_deleted() || duplicate.is_deleted() {
                    return Err(CoreError::Conflict(
                        "deleted patients cannot be merged".into(),
                    ));
                }
                let merged = primary.merged(&duplicate, strategy, now);
                let moved = self.repos.reassign_dependents(duplicate_id, primary_id, now)?;
                let ledger = self.repos.dependents_of(&self.repos.transitions, primary_id)?;
                let sequence = next_sequence(&ledger).ok_or_else(|| {
                    CoreError::Conflict(format!("status ledger of patient {primary_id} is full"))
                })?;
                let merge_row = StatusTransition::new(
                    primary_id,
                    Some(primary.status()),
                    merged.status(),
                    &format!("merged from {duplicate_id}"),
                    actor,
                    merged.updated_at(),
                    sequence,
                )?;
                self.repos.transitions.insert_new(merge_row.key(), &merge_row)?;
                self.repos.patients.replace(primary_id.as_uuid(), &merged)?;
                self.repos.patients.remove(duplicate_id.as_uuid())?;
                Ok((merged, moved))
            })
            .context("merge patients")?;
        self.repos.locks().forget(duplicate_id);

        tracing::info!(
            "merged patient {} into {} ({} dependents reassigned)",
            duplicate_id,
            primary_id,
            moved
        );
        self.audit.log_data_access(
            NewAuditEntry::new(actor, "merge", "patient", AccessResult::Granted)
                .patient(primary_id)
                .after(json!({ "merged_from": duplicate_id, "dependents_reassigned": moved })),
        );
        Ok(merged)
    }
}

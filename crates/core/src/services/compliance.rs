//! Consent, access authorization and data-subject requests.

use crate::domain::audit::{AccessResult, AuditRecord, NewAuditEntry};
use crate::domain::clinical::MedicalRecord;
use crate::domain::consent::{AccessDecision, ConsentInput, ConsentPurpose, ConsentRecord};
use crate::domain::document::Document;
use crate::domain::patient::Patient;
use crate::domain::status::{sort_ledger, StatusTransition};
use crate::ids::{ConsentId, PatientId, UserId};
use crate::repositories::{CascadeReport, Dependent, Repositories};
use crate::services::access::TenantGuard;
use crate::services::audit::AuditService;
use crate::{CoreError, CoreResult, OperationContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

/// Everything held about one patient, for a data-subject access request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientDataExport {
    pub exported_at: DateTime<Utc>,
    pub patient: Patient,
    pub medical_records: Vec<MedicalRecord>,
    /// Document records only; file content is retrieved through the document store.
    pub documents: Vec<Document>,
    pub status_history: Vec<StatusTransition>,
    pub consents: Vec<ConsentRecord>,
    pub audit_entries: Vec<AuditRecord>,
}

impl PatientDataExport {
    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string_pretty(self).map_err(CoreError::JsonSerialization)
    }
}

#[derive(Debug)]
pub struct ComplianceService {
    repos: Arc<Repositories>,
    audit: Arc<AuditService>,
    guard: Arc<TenantGuard>,
}

impl ComplianceService {
    pub fn new(repos: Arc<Repositories>, audit: Arc<AuditService>, guard: Arc<TenantGuard>) -> Self {
        Self { repos, audit, guard }
    }

    /// # Errors
    ///
    /// Returns [`CoreError::ReferentialIntegrity`] for unknown or deleted patients and
    /// [`CoreError::AccessDenied`] for actors outside the patient's tenant.
    pub fn record_consent(
        &self,
        patient_id: &PatientId,
        input: &ConsentInput,
        actor: &UserId,
    ) -> CoreResult<ConsentRecord> {
        // an unknown patient falls through to the referential check on insert
        if self.repos.patients.exists(patient_id.as_uuid()) {
            self.guard
                .require_member(actor, patient_id, "record_consent", "consent")?;
        }
        let consent = ConsentRecord::new(patient_id, input, actor, Utc::now())?;
        self.repos
            .insert_dependent(&self.repos.consents, &consent)
            .context("record consent")?;

        self.audit.log_data_access(
            NewAuditEntry::new(actor, "record_consent", "consent", AccessResult::Granted)
                .patient(patient_id)
                .after(json!({
                    "consent_id": consent.id(),
                    "purpose": consent.purpose(),
                    "granted": consent.granted(),
                })),
        );
        Ok(consent)
    }

    /// # Errors
    ///
    /// Returns [`CoreError::Conflict`] if the consent was already revoked and
    /// [`CoreError::AccessDenied`] for actors outside the patient's tenant.
    pub fn revoke_consent(&self, id: &ConsentId, actor: &UserId) -> CoreResult<ConsentRecord> {
        let owner = self.repos.consents.fetch(id.as_uuid())?.patient_id().clone();
        self.guard
            .require_member(actor, &owner, "revoke_consent", "consent")?;
        let revoked = self
            .repos
            .locks()
            .with_lock(&owner, || {
                let current: ConsentRecord = self.repos.consents.fetch(id.as_uuid())?;
                let revoked = current.revoked(actor, Utc::now())?;
                self.repos.consents.replace(revoked.key(), &revoked)?;
                Ok(revoked)
            })
            .context("revoke consent")?;

        self.audit.log_data_access(
            NewAuditEntry::new(actor, "revoke_consent", "consent", AccessResult::Granted)
                .patient(&owner)
                .after(json!({ "consent_id": id, "purpose": revoked.purpose() })),
        );
        Ok(revoked)
    }

    /// The most recently recorded consent for `purpose` that is currently in force.
    pub fn active_consent(
        &self,
        patient_id: &PatientId,
        purpose: ConsentPurpose,
    ) -> CoreResult<Option<ConsentRecord>> {
        let now = Utc::now();
        Ok(self
            .repos
            .dependents_of(&self.repos.consents, patient_id)
            .context("read consents")?
            .into_iter()
            .filter(|c| c.purpose() == purpose && c.is_active_at(now))
            .max_by_key(|c| c.recorded_at()))
    }

    /// Decide whether `actor` may touch `data_type` for a patient.
    ///
    /// The actor must share a tenant with the patient. A `data_type` naming a consent purpose
    /// other than treatment additionally requires an active consent for that purpose. Every
    /// decision is audited; denials feed suspicious-activity detection.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for unknown patients, which is not a denial.
    pub fn check_access(
        &self,
        actor: &UserId,
        patient_id: &PatientId,
        data_type: &str,
    ) -> CoreResult<AccessDecision> {
        let patient = self.repos.patient(patient_id)?;
        let decision = self.decide(actor, &patient, data_type)?;

        let result = if decision.granted {
            AccessResult::Granted
        } else {
            tracing::warn!("access denied for {} to patient {}: {}", actor, patient_id, decision.reason);
            AccessResult::Denied
        };
        self.audit.log_data_access(
            NewAuditEntry::new(actor, "check_access", data_type, result)
                .patient(patient_id)
                .justification(decision.reason.clone()),
        );
        Ok(decision)
    }

    fn decide(&self, actor: &UserId, patient: &Patient, data_type: &str) -> CoreResult<AccessDecision> {
        if actor.is_system() {
            return Ok(AccessDecision::granted("system actor"));
        }
        if !self.guard.directory().shares_tenant(actor, patient.id())? {
            return Ok(AccessDecision::denied("actor does not share a tenant with the patient"));
        }
        if patient.is_deleted() {
            return Ok(AccessDecision::denied("patient record is deleted"));
        }
        match ConsentPurpose::parse("data_type", data_type) {
            Ok(ConsentPurpose::Treatment) | Err(_) => Ok(AccessDecision::granted("same tenant")),
            Ok(purpose) => Ok(match self.active_consent(patient.id(), purpose)? {
                Some(_) => AccessDecision::granted(format!("active {purpose} consent")),
                None => AccessDecision::denied(format!("no active {purpose} consent")),
            }),
        }
    }

    fn require_access(&self, actor: &UserId, patient_id: &PatientId, data_type: &str) -> CoreResult<()> {
        let decision = self.check_access(actor, patient_id, data_type)?;
        if decision.granted {
            Ok(())
        } else {
            Err(CoreError::AccessDenied(decision.reason))
        }
    }

    /// Collect every record about a patient into one serialisable document.
    pub fn export_patient_data(
        &self,
        patient_id: &PatientId,
        actor: &UserId,
    ) -> CoreResult<PatientDataExport> {
        self.require_access(actor, patient_id, "patient_data")?;

        let export = self.gather_export(patient_id).context("export patient data")?;

        tracing::info!("exported data of patient {}", patient_id);
        self.audit.log_data_access(
            NewAuditEntry::new(actor, "export", "patient_data", AccessResult::Granted)
                .patient(patient_id)
                .after(json!({
                    "medical_records": export.medical_records.len(),
                    "documents": export.documents.len(),
                    "audit_entries": export.audit_entries.len(),
                })),
        );
        Ok(export)
    }

    fn gather_export(&self, patient_id: &PatientId) -> CoreResult<PatientDataExport> {
        let mut status_history = self.repos.dependents_of(&self.repos.transitions, patient_id)?;
        sort_ledger(&mut status_history);
        let mut medical_records = self.repos.dependents_of(&self.repos.records, patient_id)?;
        medical_records.sort_by_key(|r| r.created_at());
        let mut documents = self.repos.dependents_of(&self.repos.documents, patient_id)?;
        documents.sort_by_key(|d| d.uploaded_at());
        let mut consents = self.repos.dependents_of(&self.repos.consents, patient_id)?;
        consents.sort_by_key(|c| c.recorded_at());

        Ok(PatientDataExport {
            exported_at: Utc::now(),
            patient: self.repos.patient(patient_id)?,
            medical_records,
            documents,
            status_history,
            consents,
            audit_entries: self.audit.entries_for_patient(patient_id)?,
        })
    }

    /// Physically remove a patient and everything it owns. Audit entries about the patient are
    /// kept, as is the entry recording the erasure.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] when no justification is given.
    pub fn erase_patient_data(
        &self,
        patient_id: &PatientId,
        actor: &UserId,
        justification: &str,
    ) -> CoreResult<CascadeReport> {
        let justification = justification.trim();
        if justification.is_empty() {
            return Err(CoreError::InvalidInput(
                "an erasure request needs a justification".into(),
            ));
        }
        self.require_access(actor, patient_id, "patient_data")?;

        let report = self
            .repos
            .cascade_delete(patient_id)
            .context("erase patient data")?;

        self.audit.log_data_access(
            NewAuditEntry::new(actor, "erase", "patient_data", AccessResult::Granted)
                .patient(patient_id)
                .justification(justification)
                .after(serde_json::to_value(&report).unwrap_or_default()),
        );
        Ok(report)
    }
}

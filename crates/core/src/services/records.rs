//! Medical records and the patient timeline.

use crate::domain::audit::{AccessResult, NewAuditEntry};
use crate::domain::clinical::{
    build_timeline, Allergy, AllergyInput, Assessment, AssessmentInput, Diagnosis, DiagnosisInput,
    MedicalRecord, Medication, MedicationInput, ProgressNote, ProgressNoteInput, TimelineEvent,
    TimelineEventKind, TreatmentEntry, TreatmentInput,
};
use crate::ids::{MedicalRecordId, PatientId, UserId};
use crate::repositories::{Dependent, Repositories};
use crate::services::access::TenantGuard;
use crate::services::audit::AuditService;
use crate::{CoreError, CoreResult, OperationContext};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug)]
pub struct MedicalRecordService {
    repos: Arc<Repositories>,
    audit: Arc<AuditService>,
    guard: Arc<TenantGuard>,
}

impl MedicalRecordService {
    pub fn new(repos: Arc<Repositories>, audit: Arc<AuditService>, guard: Arc<TenantGuard>) -> Self {
        Self { repos, audit, guard }
    }

    /// Open an empty record for a patient.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ReferentialIntegrity`] if the patient does not exist or is deleted,
    /// and [`CoreError::AccessDenied`] for actors outside the patient's tenant.
    pub fn create_medical_record(
        &self,
        patient_id: &PatientId,
        actor: &UserId,
    ) -> CoreResult<MedicalRecord> {
        // an unknown patient falls through to the referential check below
        if self.repos.patients.exists(patient_id.as_uuid()) {
            self.guard
                .require_member(actor, patient_id, "create", "medical_record")?;
        }
        let record = MedicalRecord::new(patient_id.clone(), actor, Utc::now());
        self.repos
            .insert_dependent(&self.repos.records, &record)
            .context("create medical record")?;

        tracing::info!("created medical record {} for patient {}", record.id(), patient_id);
        self.audit.log_data_access(
            NewAuditEntry::new(actor, "create", "medical_record", AccessResult::Granted)
                .patient(patient_id)
                .after(json!({ "record_id": record.id() })),
        );
        Ok(record)
    }

    pub fn get(&self, id: &MedicalRecordId) -> CoreResult<MedicalRecord> {
        self.repos.records.fetch(id.as_uuid())
    }

    /// Every record of a patient, oldest first.
    pub fn records_for(&self, patient_id: &PatientId, actor: &UserId) -> CoreResult<Vec<MedicalRecord>> {
        self.repos.patient(patient_id)?;
        self.guard
            .require_member(actor, patient_id, "read", "medical_record")?;
        self.list_records(patient_id)
    }

    fn list_records(&self, patient_id: &PatientId) -> CoreResult<Vec<MedicalRecord>> {
        let mut records = self
            .repos
            .dependents_of(&self.repos.records, patient_id)
            .context("list medical records")?;
        records.sort_by_key(|r| r.created_at());
        Ok(records)
    }

    /// Replace a record with `change(current)` under its patient's lock, provided it has not
    /// been modified since `expected_updated_at`.
    fn amend(
        &self,
        id: &MedicalRecordId,
        expected_updated_at: DateTime<Utc>,
        actor: &UserId,
        added: &'static str,
        change: impl FnOnce(&MedicalRecord, DateTime<Utc>) -> MedicalRecord,
    ) -> CoreResult<MedicalRecord> {
        let owner = self.get(id)?.patient_id().clone();
        self.guard
            .require_member(actor, &owner, "update", "medical_record")?;
        let next = self
            .repos
            .locks()
            .with_lock(&owner, || {
                let current = self.get(id)?;
                if current.patient_id() != &owner {
                    return Err(CoreError::Conflict(format!(
                        "medical record {id} moved to another patient"
                    )));
                }
                self.repos.require_live_patient("medical record", &owner)?;
                if current.updated_at() != expected_updated_at {
                    return Err(CoreError::Conflict(format!(
                        "medical record {id} was modified at {}",
                        current.updated_at()
                    )));
                }
                let next = change(&current, Utc::now());
                self.repos.records.replace(next.key(), &next)?;
                Ok(next)
            })
            .context("update medical record")?;

        self.audit.log_data_access(
            NewAuditEntry::new(actor, "update", "medical_record", AccessResult::Granted)
                .patient(&owner)
                .after(json!({ "record_id": id, "added": added })),
        );
        Ok(next)
    }

    pub fn add_diagnosis(
        &self,
        id: &MedicalRecordId,
        input: &DiagnosisInput,
        expected_updated_at: DateTime<Utc>,
        actor: &UserId,
    ) -> CoreResult<MedicalRecord> {
        let diagnosis = Diagnosis::new(input, actor)?;
        self.amend(id, expected_updated_at, actor, "diagnosis", |r, now| {
            r.with_diagnosis(diagnosis, now)
        })
    }

    pub fn add_medication(
        &self,
        id: &MedicalRecordId,
        input: &MedicationInput,
        expected_updated_at: DateTime<Utc>,
        actor: &UserId,
    ) -> CoreResult<MedicalRecord> {
        let medication = Medication::new(input, actor)?;
        self.amend(id, expected_updated_at, actor, "medication", |r, now| {
            r.with_medication(medication, now)
        })
    }

    pub fn add_allergy(
        &self,
        id: &MedicalRecordId,
        input: &AllergyInput,
        expected_updated_at: DateTime<Utc>,
        actor: &UserId,
    ) -> CoreResult<MedicalRecord> {
        let allergy = Allergy::new(input, Utc::now())?;
        self.amend(id, expected_updated_at, actor, "allergy", |r, now| {
            r.with_allergy(allergy, now)
        })
    }

    pub fn add_progress_note(
        &self,
        id: &MedicalRecordId,
        input: &ProgressNoteInput,
        expected_updated_at: DateTime<Utc>,
        actor: &UserId,
    ) -> CoreResult<MedicalRecord> {
        let note = ProgressNote::new(input, actor)?;
        self.amend(id, expected_updated_at, actor, "progress_note", |r, now| {
            r.with_progress_note(note, now)
        })
    }

    pub fn add_assessment(
        &self,
        id: &MedicalRecordId,
        input: &AssessmentInput,
        expected_updated_at: DateTime<Utc>,
        actor: &UserId,
    ) -> CoreResult<MedicalRecord> {
        let assessment = Assessment::new(input, actor)?;
        self.amend(id, expected_updated_at, actor, "assessment", |r, now| {
            r.with_assessment(assessment, now)
        })
    }

    pub fn add_treatment_entry(
        &self,
        id: &MedicalRecordId,
        input: &TreatmentInput,
        expected_updated_at: DateTime<Utc>,
        actor: &UserId,
    ) -> CoreResult<MedicalRecord> {
        let entry = TreatmentEntry::new(input)?;
        self.amend(id, expected_updated_at, actor, "treatment_entry", |r, now| {
            r.with_treatment(entry, now)
        })
    }

    /// Clinical entries, status changes and document uploads of a patient in time order.
    ///
    /// Status changes come from the patient's own ledger only.
    pub fn timeline(&self, patient_id: &PatientId, actor: &UserId) -> CoreResult<Vec<TimelineEvent>> {
        self.repos.patient(patient_id)?;
        self.guard
            .require_member(actor, patient_id, "read", "timeline")?;
        let mut events: Vec<TimelineEvent> = self
            .list_records(patient_id)?
            .iter()
            .flat_map(MedicalRecord::events)
            .collect();

        for t in self
            .repos
            .status_ledger(patient_id)
            .context("read status history")?
        {
            let summary = match t.from() {
                Some(from) if from == t.to() => t.reason().to_string(),
                Some(from) => format!("{} -> {}", from, t.to()),
                None => format!("registered as {}", t.to()),
            };
            events.push(TimelineEvent {
                at: t.at(),
                kind: TimelineEventKind::StatusChange,
                summary,
                source_id: t.id().to_string(),
            });
        }
        for d in self
            .repos
            .dependents_of(&self.repos.documents, patient_id)
            .context("list documents")?
        {
            events.push(TimelineEvent {
                at: d.uploaded_at(),
                kind: TimelineEventKind::DocumentUploaded,
                summary: d.metadata().title().to_string(),
                source_id: d.id().to_string(),
            });
        }
        Ok(build_timeline(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::patient::NewPatient;
    use crate::services::test_support::TestVault;
    use chrono::{Duration, NaiveDate};

    fn setup() -> (TestVault, PatientId) {
        let v = TestVault::new();
        let patient = v
            .patients
            .register(
                &NewPatient::new("Rui Barbosa", NaiveDate::from_ymd_opt(1960, 11, 5).unwrap(), "male"),
                &v.physician,
            )
            .unwrap();
        (v, patient.id().clone())
    }

    fn note(at: DateTime<Utc>) -> ProgressNoteInput {
        ProgressNoteInput {
            content: "Patient reports better sleep.".into(),
            category: "session".into(),
            recorded_at: at,
        }
    }

    #[test]
    fn test_create_requires_live_patient() {
        let (v, _) = setup();
        let result = v.records.create_medical_record(&PatientId::new(), &v.physician);
        assert!(matches!(result, Err(CoreError::ReferentialIntegrity { .. })));
        assert_eq!(v.repos.counts().unwrap().medical_records, 0);
    }

    #[test]
    fn test_additions_return_new_values_and_check_version() {
        let (v, patient) = setup();
        let record = v.records.create_medical_record(&patient, &v.physician).unwrap();

        let with_note = v
            .records
            .add_progress_note(record.id(), &note(Utc::now()), record.updated_at(), &v.physician)
            .unwrap();
        assert_eq!(with_note.progress_notes().len(), 1);
        assert!(record.progress_notes().is_empty());
        assert_eq!(v.records.get(record.id()).unwrap(), with_note);

        let stale = v.records.add_progress_note(
            record.id(),
            &note(Utc::now()),
            record.updated_at(),
            &v.physician,
        );
        assert!(matches!(stale, Err(CoreError::Conflict(_))));
    }

    #[test]
    fn test_invalid_entry_is_rejected_before_storage() {
        let (v, patient) = setup();
        let record = v.records.create_medical_record(&patient, &v.physician).unwrap();
        let bad = DiagnosisInput {
            code: "not-a-code".into(),
            description: "".into(),
            severity: "apocalyptic".into(),
            diagnosed_on: Utc::now().date_naive() + Duration::days(3),
        };

        match v.records.add_diagnosis(record.id(), &bad, record.updated_at(), &v.physician) {
            Err(CoreError::Validation(errors)) => assert!(errors.len() >= 4),
            other => panic!("expected validation errors, got {other:?}"),
        }
        assert!(v.records.get(record.id()).unwrap().diagnoses().is_empty());
    }

    #[test]
    fn test_outsider_cannot_touch_records() {
        let (v, patient) = setup();
        let record = v.records.create_medical_record(&patient, &v.physician).unwrap();

        assert!(matches!(
            v.records.create_medical_record(&patient, &v.outsider),
            Err(CoreError::AccessDenied(_))
        ));
        assert!(matches!(
            v.records
                .add_progress_note(record.id(), &note(Utc::now()), record.updated_at(), &v.outsider),
            Err(CoreError::AccessDenied(_))
        ));
        assert!(matches!(
            v.records.records_for(&patient, &v.outsider),
            Err(CoreError::AccessDenied(_))
        ));
        assert!(matches!(
            v.records.timeline(&patient, &v.outsider),
            Err(CoreError::AccessDenied(_))
        ));

        assert_eq!(v.repos.counts().unwrap().medical_records, 1);
        assert!(v.records.get(record.id()).unwrap().progress_notes().is_empty());
        assert_eq!(v.records.records_for(&patient, &v.nurse).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_patient_is_not_found_for_readers() {
        let (v, _) = setup();
        assert!(matches!(
            v.records.records_for(&PatientId::new(), &v.outsider),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_timeline_is_sorted_with_one_entry_per_event() {
        let (v, patient) = setup();
        let record = v.records.create_medical_record(&patient, &v.physician).unwrap();
        let now = Utc::now();
        let mut current = record.clone();
        // out of order, with a duplicate timestamp
        for at in [now - Duration::days(1), now - Duration::days(5), now - Duration::days(1)] {
            current = v
                .records
                .add_progress_note(record.id(), &note(at), current.updated_at(), &v.physician)
                .unwrap();
        }
        v.status
            .change_status(&patient, crate::domain::patient::PatientStatus::Active, "intake", &v.physician)
            .unwrap();

        let timeline = v.records.timeline(&patient, &v.physician).unwrap();
        // three notes, the registration row and the activation
        assert_eq!(timeline.len(), 5);
        assert!(timeline.windows(2).all(|w| w[0].at <= w[1].at));
        assert_eq!(timeline[0].kind, TimelineEventKind::StatusChange);
    }
}

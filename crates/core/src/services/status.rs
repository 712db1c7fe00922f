//! Patient status state machine with an append-only ledger.

use crate::domain::audit::{AccessResult, NewAuditEntry};
use crate::domain::patient::{Patient, PatientStatus};
use crate::domain::status::{
    next_sequence, sort_ledger, time_in_status, transition_patterns, StatusTransition,
    TimeInStatus, TransitionPattern,
};
use crate::ids::{PatientId, UserId};
use crate::repositories::{Dependent, Repositories};
use crate::services::access::TenantGuard;
use crate::services::audit::AuditService;
use crate::{CoreError, CoreResult, OperationContext};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;

#[derive(Debug)]
pub struct StatusTracker {
    repos: Arc<Repositories>,
    audit: Arc<AuditService>,
    guard: Arc<TenantGuard>,
}

impl StatusTracker {
    pub fn new(repos: Arc<Repositories>, audit: Arc<AuditService>, guard: Arc<TenantGuard>) -> Self {
        Self { repos, audit, guard }
    }

    /// Move a patient to `to`, appending one ledger row.
    ///
    /// The ledger row is written first and removed again if the patient cannot be updated, so
    /// either both effects are visible or neither is.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidTransition`] when `to` is not reachable from the current
    /// status; nothing is written in that case. Actors outside the patient's tenant get
    /// [`CoreError::AccessDenied`].
    pub fn change_status(
        &self,
        patient_id: &PatientId,
        to: PatientStatus,
        reason: &str,
        actor: &UserId,
    ) -> CoreResult<Patient> {
        self.repos.patient(patient_id)?;
        self.guard
            .require_member(actor, patient_id, "status_change", "patient_status")?;

        let (from, updated) = self.repos.locks().with_lock(patient_id, || {
            let current = self.repos.patient(patient_id)?;
            if current.is_deleted() {
                return Err(CoreError::ReferentialIntegrity {
                    entity: "status transition",
                    patient_id: patient_id.to_string(),
                });
            }
            let from = current.status();
            if !from.can_transition_to(to) {
                tracing::warn!(
                    "rejected status change for patient {}: {} -> {}",
                    patient_id,
                    from,
                    to
                );
                return Err(CoreError::InvalidTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }

            let updated = current.with_status(to, Utc::now());
            let ledger = self.repos.dependents_of(&self.repos.transitions, patient_id)?;
            let sequence = next_sequence(&ledger).ok_or_else(|| {
                CoreError::Conflict(format!("status ledger of patient {patient_id} is full"))
            })?;
            let row = StatusTransition::new(
                patient_id,
                Some(from),
                to,
                reason,
                actor,
                updated.updated_at(),
                sequence,
            )?;

            self.repos.transitions.insert_new(row.key(), &row)?;
            if let Err(e) = self.repos.patients.replace(patient_id.as_uuid(), &updated) {
                if let Err(cleanup) = self.repos.transitions.remove(row.key()) {
                    return Err(CoreError::CleanupAfterFailure {
                        path: row.id().to_string(),
                        error: Box::new(e),
                        cleanup_error: Box::new(cleanup),
                    });
                }
                return Err(e);
            }
            Ok((from, updated))
        })
        .context("change patient status")?;

        tracing::info!("patient {} status {} -> {}", patient_id, from, to);
        self.audit.log_data_access(
            NewAuditEntry::new(actor, "status_change", "patient_status", AccessResult::Granted)
                .patient(patient_id)
                .before(json!({ "status": from }))
                .after(json!({ "status": to, "reason": reason })),
        );
        Ok(updated)
    }

    /// The patient's ledger in chronological order.
    ///
    /// Rows inherited from a merged duplicate are not part of it; the merge itself appears as
    /// one row ending in the status the patient holds.
    pub fn history(&self, patient_id: &PatientId, actor: &UserId) -> CoreResult<Vec<StatusTransition>> {
        self.repos.patient(patient_id)?;
        self.guard
            .require_member(actor, patient_id, "read", "patient_status")?;
        self.repos
            .status_ledger(patient_id)
            .context("read status history")
    }

    pub fn time_in_status(&self, patient_id: &PatientId, actor: &UserId) -> CoreResult<Vec<TimeInStatus>> {
        let history = self.history(patient_id, actor)?;
        Ok(time_in_status(&history, Utc::now()))
    }

    /// The `top` most frequent transitions across all patients.
    pub fn transition_patterns(&self, top: usize) -> CoreResult<Vec<TransitionPattern>> {
        let mut rows: Vec<StatusTransition> = self
            .repos
            .transitions
            .list()
            .context("read status ledger")?
            .into_iter()
            .filter(StatusTransition::is_own)
            .collect();
        sort_ledger(&mut rows);
        Ok(transition_patterns(&rows, top))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::patient::NewPatient;
    use crate::services::test_support::TestVault;
    use chrono::NaiveDate;
    use PatientStatus::*;

    fn registered(v: &TestVault) -> Patient {
        v.patients
            .register(
                &NewPatient::new("Carla Dias", NaiveDate::from_ymd_opt(1992, 7, 3).unwrap(), "female"),
                &v.physician,
            )
            .unwrap()
    }

    #[test]
    fn test_valid_transition_updates_patient_and_ledger() {
        let v = TestVault::new();
        let patient = registered(&v);

        let active = v
            .status
            .change_status(patient.id(), Active, "first session", &v.physician)
            .unwrap();
        assert_eq!(active.status(), Active);
        assert!(active.updated_at() > patient.updated_at());

        let history = v.status.history(patient.id(), &v.physician).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].from(), Some(New));
        assert_eq!(history[1].to(), Active);
        assert_eq!(history[1].sequence(), 2);
        assert_eq!(history[1].at(), active.updated_at());
    }

    #[test]
    fn test_discharged_to_on_hold_is_rejected_without_side_effects() {
        let v = TestVault::new();
        let patient = registered(&v);
        v.status.change_status(patient.id(), Active, "start", &v.physician).unwrap();
        let discharged = v
            .status
            .change_status(patient.id(), Discharged, "done", &v.physician)
            .unwrap();
        let ledger_before = v.status.history(patient.id(), &v.physician).unwrap();

        let result = v
            .status
            .change_status(patient.id(), OnHold, "pause", &v.physician);
        assert!(matches!(result, Err(CoreError::InvalidTransition { .. })));
        assert_eq!(v.patients.get(patient.id()).unwrap(), discharged);
        assert_eq!(v.status.history(patient.id(), &v.physician).unwrap(), ledger_before);
    }

    #[test]
    fn test_transition_table_is_enforced_for_every_pair() {
        for from in PatientStatus::ALL {
            for to in PatientStatus::ALL {
                let expected = matches!(
                    (from, to),
                    (New, Active)
                        | (New, Inactive)
                        | (Active, OnHold)
                        | (Active, Discharged)
                        | (Active, Inactive)
                        | (OnHold, Active)
                        | (OnHold, Discharged)
                        | (OnHold, Inactive)
                        | (Discharged, Active)
                        | (Inactive, Active)
                );
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_blank_reason_writes_nothing() {
        let v = TestVault::new();
        let patient = registered(&v);
        let result = v.status.change_status(patient.id(), Active, "   ", &v.physician);

        assert!(matches!(result, Err(CoreError::Validation(_))));
        assert_eq!(v.patients.get(patient.id()).unwrap().status(), New);
        assert_eq!(v.status.history(patient.id(), &v.physician).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_and_deleted_patients() {
        let v = TestVault::new();
        assert!(matches!(
            v.status.change_status(&PatientId::new(), Active, "x", &v.physician),
            Err(CoreError::NotFound { .. })
        ));

        let patient = registered(&v);
        v.patients.delete(patient.id(), &v.physician).unwrap();
        assert!(matches!(
            v.status.change_status(patient.id(), Active, "x", &v.physician),
            Err(CoreError::ReferentialIntegrity { .. })
        ));
    }

    #[test]
    fn test_outsider_cannot_change_or_read_status() {
        let v = TestVault::new();
        let patient = registered(&v);

        assert!(matches!(
            v.status.change_status(patient.id(), Active, "admit", &v.outsider),
            Err(CoreError::AccessDenied(_))
        ));
        assert!(matches!(
            v.status.history(patient.id(), &v.outsider),
            Err(CoreError::AccessDenied(_))
        ));
        assert!(matches!(
            v.status.time_in_status(patient.id(), &v.outsider),
            Err(CoreError::AccessDenied(_))
        ));
        assert_eq!(v.patients.get(patient.id()).unwrap().status(), New);
        assert_eq!(v.status.history(patient.id(), &v.physician).unwrap().len(), 1);
    }

    #[test]
    fn test_sequence_continues_after_a_gap() {
        let v = TestVault::new();
        let patient = registered(&v);
        v.status.change_status(patient.id(), Active, "a", &v.physician).unwrap();
        v.status.change_status(patient.id(), OnHold, "b", &v.physician).unwrap();

        // losing a middle row must not hand its successor's sequence out twice
        let ledger = v.status.history(patient.id(), &v.physician).unwrap();
        v.repos.transitions.remove(ledger[1].key()).unwrap();
        v.status.change_status(patient.id(), Active, "c", &v.physician).unwrap();

        let sequences: Vec<u32> = v
            .status
            .history(patient.id(), &v.physician)
            .unwrap()
            .iter()
            .map(StatusTransition::sequence)
            .collect();
        assert_eq!(sequences, vec![1, 3, 4]);
    }

    #[test]
    fn test_derived_views() {
        let v = TestVault::new();
        let patient = registered(&v);
        v.status.change_status(patient.id(), Active, "a", &v.physician).unwrap();
        v.status.change_status(patient.id(), OnHold, "b", &v.physician).unwrap();
        v.status.change_status(patient.id(), Active, "c", &v.physician).unwrap();

        let times = v.status.time_in_status(patient.id(), &v.physician).unwrap();
        let statuses: Vec<PatientStatus> = times.iter().map(|t| t.status).collect();
        assert_eq!(statuses, vec![New, Active, OnHold]);

        let patterns = v.status.transition_patterns(5).unwrap();
        assert_eq!(patterns.len(), 3);
        assert!(patterns.iter().all(|p| p.count == 1));
    }
}

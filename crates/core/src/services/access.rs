//! Tenant membership checks shared by every service that acts on one patient's data.

use crate::collaborators::TenantDirectory;
use crate::domain::audit::{AccessResult, NewAuditEntry};
use crate::ids::{PatientId, UserId};
use crate::services::audit::AuditService;
use crate::{CoreError, CoreResult};
use std::sync::Arc;

#[derive(Debug)]
pub struct TenantGuard {
    tenants: Arc<dyn TenantDirectory>,
    audit: Arc<AuditService>,
}

impl TenantGuard {
    pub fn new(tenants: Arc<dyn TenantDirectory>, audit: Arc<AuditService>) -> Self {
        Self { tenants, audit }
    }

    pub fn directory(&self) -> &dyn TenantDirectory {
        self.tenants.as_ref()
    }

    /// Fail unless `actor` shares a tenant with the patient. The system actor always passes.
    ///
    /// Callers resolve the patient first: an unknown patient is "not found", never a denial.
    /// A denial is audited as `denied` for `operation` on `data_type` before the error returns.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AccessDenied`] for actors outside the patient's tenant.
    pub fn require_member(
        &self,
        actor: &UserId,
        patient_id: &PatientId,
        operation: &'static str,
        data_type: &'static str,
    ) -> CoreResult<()> {
        if actor.is_system() || self.tenants.shares_tenant(actor, patient_id)? {
            return Ok(());
        }
        self.deny(
            actor,
            patient_id,
            operation,
            data_type,
            "actor does not share a tenant with the patient".to_string(),
        )
    }

    /// Audit a denial and return it as an error.
    pub(crate) fn deny<T>(
        &self,
        actor: &UserId,
        patient_id: &PatientId,
        operation: &'static str,
        data_type: &'static str,
        reason: String,
    ) -> CoreResult<T> {
        tracing::warn!("{} denied for {} on patient {}: {}", operation, actor, patient_id, reason);
        self.audit.log_data_access(
            NewAuditEntry::new(actor, operation, data_type, AccessResult::Denied)
                .patient(patient_id)
                .justification(reason.clone()),
        );
        Err(CoreError::AccessDenied(reason))
    }
}

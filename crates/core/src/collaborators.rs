//! Collaborator seams.
//!
//! The core consumes tenant membership, virus scanning and operational alerting as black boxes.
//! Each is a trait so deployments can plug in real services; the implementations here cover
//! single-site deployments and tests.

use crate::domain::document::ScanResult;
use crate::ids::{PatientId, UserId};
use crate::{CoreError, CoreResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

/// Answers "does this actor share a tenant with this patient, and what is the actor's role?"
pub trait TenantDirectory: Send + Sync + fmt::Debug {
    /// The actor's role, lowercased, or `None` for unknown actors.
    fn role(&self, actor: &UserId) -> CoreResult<Option<String>>;

    fn shares_tenant(&self, actor: &UserId, patient_id: &PatientId) -> CoreResult<bool>;

    /// Called after a patient is registered so the directory can place it in the registering
    /// actor's tenant.
    fn enroll_patient(&self, _patient_id: &PatientId, _registered_by: &UserId) -> CoreResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MemberEntry {
    user: UserId,
    tenant: String,
    role: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PatientEntry {
    patient: PatientId,
    tenant: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DirectoryFile {
    default_tenant: Option<String>,
    members: Vec<MemberEntry>,
    patients: Vec<PatientEntry>,
}

#[derive(Debug, Clone)]
struct Member {
    tenant: String,
    role: String,
}

/// In-memory directory, optionally loaded from a YAML members file:
///
/// ```yaml
/// default_tenant: clinic
/// members:
///   - user: 7d1c0a4e9b2f4c8d8e1a2b3c4d5e6f70
///     tenant: clinic
///     role: physician
/// patients:
///   - patient: 0a1b2c3d4e5f46a7b8c9d0e1f2a3b4c5
///     tenant: clinic
/// ```
///
/// Patients without an explicit assignment belong to `default_tenant` when one is set.
#[derive(Debug, Default)]
pub struct StaticTenantDirectory {
    default_tenant: Option<String>,
    members: HashMap<UserId, Member>,
    patients: RwLock<HashMap<PatientId, String>>,
}

impl StaticTenantDirectory {
    pub fn new(default_tenant: Option<String>) -> Self {
        Self {
            default_tenant,
            ..Self::default()
        }
    }

    pub fn from_yaml_str(contents: &str) -> CoreResult<Self> {
        let file: DirectoryFile =
            serde_yaml::from_str(contents).map_err(CoreError::YamlDeserialization)?;
        let mut directory = Self::new(file.default_tenant);
        for m in file.members {
            directory = directory.with_member(m.user, &m.tenant, &m.role);
        }
        {
            let mut patients = directory
                .patients
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for p in file.patients {
                patients.insert(p.patient, p.tenant);
            }
        }
        Ok(directory)
    }

    pub fn load(path: &Path) -> CoreResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(CoreError::FileRead)?;
        Self::from_yaml_str(&contents)
    }

    pub fn with_member(mut self, user: UserId, tenant: &str, role: &str) -> Self {
        self.members.insert(
            user,
            Member {
                tenant: tenant.to_string(),
                role: role.trim().to_ascii_lowercase(),
            },
        );
        self
    }

    pub fn assign_patient(&self, patient_id: &PatientId, tenant: &str) {
        self.patients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(patient_id.clone(), tenant.to_string());
    }

    fn tenant_of_patient(&self, patient_id: &PatientId) -> Option<String> {
        self.patients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(patient_id)
            .cloned()
            .or_else(|| self.default_tenant.clone())
    }
}

impl TenantDirectory for StaticTenantDirectory {
    fn role(&self, actor: &UserId) -> CoreResult<Option<String>> {
        Ok(self.members.get(actor).map(|m| m.role.clone()))
    }

    fn shares_tenant(&self, actor: &UserId, patient_id: &PatientId) -> CoreResult<bool> {
        let Some(member) = self.members.get(actor) else {
            return Ok(false);
        };
        Ok(self
            .tenant_of_patient(patient_id)
            .is_some_and(|tenant| tenant == member.tenant))
    }

    fn enroll_patient(&self, patient_id: &PatientId, registered_by: &UserId) -> CoreResult<()> {
        if let Some(member) = self.members.get(registered_by) {
            self.assign_patient(patient_id, &member.tenant);
        }
        Ok(())
    }
}

/// Scans plaintext document bytes.
pub trait VirusScanner: Send + Sync + fmt::Debug {
    fn scan(&self, bytes: &[u8]) -> CoreResult<ScanResult>;
}

const EICAR_SIGNATURE: &[u8] = b"EICAR-STANDARD-ANTIVIRUS-TEST-FILE";

/// Signature matcher that flags the EICAR test file. Stand-in for a real scanning service.
#[derive(Debug, Clone, Default)]
pub struct SignatureScanner {
    extra_signatures: Vec<Vec<u8>>,
}

impl SignatureScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signature(mut self, signature: impl Into<Vec<u8>>) -> Self {
        self.extra_signatures.push(signature.into());
        self
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

impl VirusScanner for SignatureScanner {
    fn scan(&self, bytes: &[u8]) -> CoreResult<ScanResult> {
        let infected = contains(bytes, EICAR_SIGNATURE)
            || self.extra_signatures.iter().any(|sig| contains(bytes, sig));
        Ok(if infected {
            ScanResult::Infected
        } else {
            ScanResult::Clean
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// An audit entry could not be persisted.
    AuditWriteFailed,
    /// Denied accesses crossed the suspicious-activity threshold.
    SuspiciousActivity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationalAlert {
    pub kind: AlertKind,
    pub message: String,
}

/// Secondary channel for failures that must not fail the operation that caused them.
pub trait AlertSink: Send + Sync + fmt::Debug {
    fn alert(&self, alert: OperationalAlert);
}

/// Emits alerts as `error`-level tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, alert: OperationalAlert) {
        tracing::error!(kind = ?alert.kind, "operational alert: {}", alert.message);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Keeps alerts for assertions.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingAlertSink {
        pub(crate) alerts: Mutex<Vec<OperationalAlert>>,
    }

    impl AlertSink for RecordingAlertSink {
        fn alert(&self, alert: OperationalAlert) {
            self.alerts.lock().unwrap().push(alert);
        }
    }

    #[test]
    fn test_directory_from_yaml() {
        let physician = UserId::new();
        let outsider = UserId::new();
        let listed = PatientId::new();
        let yaml = format!(
            "default_tenant: clinic\nmembers:\n  - user: {physician}\n    tenant: clinic\n    role: Physician\n  - user: {outsider}\n    tenant: elsewhere\n    role: nurse\npatients:\n  - patient: {listed}\n    tenant: clinic\n"
        );
        let directory = StaticTenantDirectory::from_yaml_str(&yaml).unwrap();

        assert_eq!(directory.role(&physician).unwrap().as_deref(), Some("physician"));
        assert!(directory.shares_tenant(&physician, &listed).unwrap());
        assert!(directory.shares_tenant(&physician, &PatientId::new()).unwrap());
        assert!(!directory.shares_tenant(&outsider, &listed).unwrap());
        assert!(!directory.shares_tenant(&UserId::new(), &listed).unwrap());
    }

    #[test]
    fn test_enroll_places_patient_in_actor_tenant() {
        let nurse = UserId::new();
        let directory = StaticTenantDirectory::new(None).with_member(nurse.clone(), "north", "nurse");
        let patient = PatientId::new();

        assert!(!directory.shares_tenant(&nurse, &patient).unwrap());
        directory.enroll_patient(&patient, &nurse).unwrap();
        assert!(directory.shares_tenant(&nurse, &patient).unwrap());
    }

    #[test]
    fn test_signature_scanner() {
        let scanner = SignatureScanner::new().with_signature(b"BAD".to_vec());
        assert_eq!(scanner.scan(b"hello").unwrap(), ScanResult::Clean);
        assert_eq!(
            scanner
                .scan(b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*")
                .unwrap(),
            ScanResult::Infected
        );
        assert_eq!(scanner.scan(b"..BAD..").unwrap(), ScanResult::Infected);
    }
}

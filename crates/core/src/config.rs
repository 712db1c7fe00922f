//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into core services behind
//! an `Arc`. Nothing in the core reads process-wide environment variables while handling a
//! request; binaries read them up front through the `*_from_env_value` helpers below, which
//! accept the raw `Option<String>` so they can be tested without touching the environment.

use crate::constants::{
    AUDIT_LOG_DIR_NAME, BLOBS_DIR_NAME, CONSENTS_DIR_NAME, DEFAULT_AUDIT_READER_ROLES,
    DEFAULT_AUDIT_RETENTION_YEARS, DEFAULT_CONFIDENTIAL_ROLES, DEFAULT_DATA_DIR,
    DEFAULT_KDF_ITERATIONS, DEFAULT_KDF_MEMORY_KIB, DEFAULT_KDF_PARALLELISM,
    DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_SUSPICIOUS_THRESHOLD, DEFAULT_SUSPICIOUS_WINDOW_SECS,
    DEFAULT_TOP_SUBJECTS, DOCUMENTS_DIR_NAME, ENCRYPTION_METADATA_DIR_NAME,
    MEDICAL_RECORDS_DIR_NAME, PATIENTS_DIR_NAME, STATUS_HISTORY_DIR_NAME,
};
use crate::crypto::MasterKey;
use crate::{CoreError, CoreResult};
use chrono::Duration;
use std::path::{Path, PathBuf};

/// Tunables for the audit engine.
#[derive(Clone, Debug)]
pub struct AuditSettings {
    /// Denied accesses within `suspicious_window` that trigger a security alert.
    pub suspicious_threshold: u32,
    pub suspicious_window: Duration,
    pub retention_years: u32,
    pub top_subjects: usize,
    /// Roles allowed to read and export the audit trail.
    pub reader_roles: Vec<String>,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            suspicious_threshold: DEFAULT_SUSPICIOUS_THRESHOLD,
            suspicious_window: Duration::seconds(DEFAULT_SUSPICIOUS_WINDOW_SECS),
            retention_years: DEFAULT_AUDIT_RETENTION_YEARS,
            top_subjects: DEFAULT_TOP_SUBJECTS,
            reader_roles: DEFAULT_AUDIT_READER_ROLES
                .iter()
                .map(|r| r.to_string())
                .collect(),
        }
    }
}

/// Tunables for the secure document store.
#[derive(Clone, Debug)]
pub struct DocumentSettings {
    pub max_upload_bytes: u64,
    /// Roles allowed to upload or read documents flagged confidential.
    pub confidential_roles: Vec<String>,
}

impl Default for DocumentSettings {
    fn default() -> Self {
        Self {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            confidential_roles: DEFAULT_CONFIDENTIAL_ROLES
                .iter()
                .map(|r| r.to_string())
                .collect(),
        }
    }
}

/// Argon2id cost parameters for per-patient key derivation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfSettings {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfSettings {
    fn default() -> Self {
        Self {
            memory_kib: DEFAULT_KDF_MEMORY_KIB,
            iterations: DEFAULT_KDF_ITERATIONS,
            parallelism: DEFAULT_KDF_PARALLELISM,
        }
    }
}

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    data_dir: PathBuf,
    audit: AuditSettings,
    documents: DocumentSettings,
    kdf: KdfSettings,
}

impl CoreConfig {
    /// Create a new `CoreConfig`, rejecting settings that would disable a safeguard.
    pub fn new(
        data_dir: PathBuf,
        audit: AuditSettings,
        documents: DocumentSettings,
        kdf: KdfSettings,
    ) -> CoreResult<Self> {
        if audit.suspicious_threshold == 0 {
            return Err(CoreError::InvalidInput(
                "suspicious_threshold must be at least 1".into(),
            ));
        }
        if audit.suspicious_window <= Duration::zero() {
            return Err(CoreError::InvalidInput(
                "suspicious_window must be positive".into(),
            ));
        }
        if audit.retention_years == 0 {
            return Err(CoreError::InvalidInput(
                "audit retention must be at least one year".into(),
            ));
        }
        if documents.max_upload_bytes == 0 {
            return Err(CoreError::InvalidInput(
                "max_upload_bytes must be positive".into(),
            ));
        }
        if kdf.iterations == 0 || kdf.parallelism == 0 || kdf.memory_kib < 8 * kdf.parallelism {
            return Err(CoreError::InvalidInput(
                "kdf settings are below Argon2 minimums".into(),
            ));
        }

        Ok(Self {
            data_dir,
            audit,
            documents,
            kdf,
        })
    }

    /// Configuration with default tunables rooted at `data_dir`.
    pub fn with_defaults(data_dir: PathBuf) -> CoreResult<Self> {
        Self::new(
            data_dir,
            AuditSettings::default(),
            DocumentSettings::default(),
            KdfSettings::default(),
        )
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn patients_dir(&self) -> PathBuf {
        self.data_dir.join(PATIENTS_DIR_NAME)
    }

    pub fn medical_records_dir(&self) -> PathBuf {
        self.data_dir.join(MEDICAL_RECORDS_DIR_NAME)
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.data_dir.join(DOCUMENTS_DIR_NAME)
    }

    pub fn encryption_metadata_dir(&self) -> PathBuf {
        self.data_dir.join(ENCRYPTION_METADATA_DIR_NAME)
    }

    pub fn status_history_dir(&self) -> PathBuf {
        self.data_dir.join(STATUS_HISTORY_DIR_NAME)
    }

    pub fn consents_dir(&self) -> PathBuf {
        self.data_dir.join(CONSENTS_DIR_NAME)
    }

    pub fn audit_log_dir(&self) -> PathBuf {
        self.data_dir.join(AUDIT_LOG_DIR_NAME)
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join(BLOBS_DIR_NAME)
    }

    pub fn audit(&self) -> &AuditSettings {
        &self.audit
    }

    pub fn documents(&self) -> &DocumentSettings {
        &self.documents
    }

    pub fn kdf(&self) -> KdfSettings {
        self.kdf
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Resolve the data directory, falling back to `medvault_data` in the working directory.
pub fn data_dir_from_env_value(value: Option<String>) -> PathBuf {
    non_empty(value)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

/// Parse the suspicious-activity threshold. `None`/blank means the default.
pub fn suspicious_threshold_from_env_value(value: Option<String>) -> CoreResult<u32> {
    match non_empty(value) {
        None => Ok(DEFAULT_SUSPICIOUS_THRESHOLD),
        Some(v) => v.parse::<u32>().map_err(|e| {
            CoreError::InvalidInput(format!("invalid suspicious threshold '{}': {}", v, e))
        }),
    }
}

/// Parse the suspicious-activity window in seconds. `None`/blank means the default.
pub fn suspicious_window_from_env_value(value: Option<String>) -> CoreResult<Duration> {
    match non_empty(value) {
        None => Ok(Duration::seconds(DEFAULT_SUSPICIOUS_WINDOW_SECS)),
        Some(v) => v.parse::<i64>().map(Duration::seconds).map_err(|e| {
            CoreError::InvalidInput(format!("invalid suspicious window '{}': {}", v, e))
        }),
    }
}

/// Parse audit retention in years. `None`/blank means seven years.
pub fn retention_years_from_env_value(value: Option<String>) -> CoreResult<u32> {
    match non_empty(value) {
        None => Ok(DEFAULT_AUDIT_RETENTION_YEARS),
        Some(v) => v.parse::<u32>().map_err(|e| {
            CoreError::InvalidInput(format!("invalid audit retention '{}': {}", v, e))
        }),
    }
}

/// Parse a comma-separated role list. `None`/blank yields `default`.
pub fn roles_from_env_value(value: Option<String>, default: &[&str]) -> Vec<String> {
    match non_empty(value) {
        None => default.iter().map(|r| r.to_string()).collect(),
        Some(v) => v
            .split(',')
            .map(|r| r.trim().to_ascii_lowercase())
            .filter(|r| !r.is_empty())
            .collect(),
    }
}

/// Decode the base64 master key. A missing key is an error: there is no safe default.
pub fn master_key_from_env_value(value: Option<String>) -> CoreResult<MasterKey> {
    let encoded = non_empty(value).ok_or_else(|| {
        CoreError::InvalidInput("MEDVAULT_MASTER_KEY is required (base64, 32 bytes)".into())
    })?;
    MasterKey::from_base64(&encoded)
}

/// Raw `MEDVAULT_*` values, read once by a binary at startup.
#[derive(Debug, Clone, Default)]
pub struct EnvValues {
    pub data_dir: Option<String>,
    pub suspicious_threshold: Option<String>,
    pub suspicious_window_secs: Option<String>,
    pub audit_retention_years: Option<String>,
    pub confidential_roles: Option<String>,
    pub audit_reader_roles: Option<String>,
}

impl EnvValues {
    pub fn from_process() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self {
            data_dir: var("MEDVAULT_DATA_DIR"),
            suspicious_threshold: var("MEDVAULT_SUSPICIOUS_THRESHOLD"),
            suspicious_window_secs: var("MEDVAULT_SUSPICIOUS_WINDOW_SECS"),
            audit_retention_years: var("MEDVAULT_AUDIT_RETENTION_YEARS"),
            confidential_roles: var("MEDVAULT_CONFIDENTIAL_ROLES"),
            audit_reader_roles: var("MEDVAULT_AUDIT_READER_ROLES"),
        }
    }
}

impl CoreConfig {
    /// Build and validate a configuration from raw environment values.
    pub fn from_env_values(values: EnvValues) -> CoreResult<Self> {
        let audit = AuditSettings {
            suspicious_threshold: suspicious_threshold_from_env_value(values.suspicious_threshold)?,
            suspicious_window: suspicious_window_from_env_value(values.suspicious_window_secs)?,
            retention_years: retention_years_from_env_value(values.audit_retention_years)?,
            reader_roles: roles_from_env_value(values.audit_reader_roles, DEFAULT_AUDIT_READER_ROLES),
            ..AuditSettings::default()
        };
        let documents = DocumentSettings {
            confidential_roles: roles_from_env_value(
                values.confidential_roles,
                DEFAULT_CONFIDENTIAL_ROLES,
            ),
            ..DocumentSettings::default()
        };
        Self::new(
            data_dir_from_env_value(values.data_dir),
            audit,
            documents,
            KdfSettings::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = CoreConfig::with_defaults(PathBuf::from("/tmp/vault")).unwrap();
        assert_eq!(cfg.audit().suspicious_threshold, 5);
        assert_eq!(cfg.audit().retention_years, 7);
        assert_eq!(cfg.documents().max_upload_bytes, 50 * 1024 * 1024);
        assert_eq!(cfg.patients_dir(), PathBuf::from("/tmp/vault/patients"));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let audit = AuditSettings {
            suspicious_threshold: 0,
            ..AuditSettings::default()
        };
        let result = CoreConfig::new(
            PathBuf::from("/tmp/vault"),
            audit,
            DocumentSettings::default(),
            KdfSettings::default(),
        );
        assert!(matches!(result, Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_env_value_helpers() {
        assert_eq!(suspicious_threshold_from_env_value(None).unwrap(), 5);
        assert_eq!(
            suspicious_threshold_from_env_value(Some(" 3 ".into())).unwrap(),
            3
        );
        assert!(suspicious_threshold_from_env_value(Some("many".into())).is_err());
        assert_eq!(
            suspicious_window_from_env_value(Some("60".into())).unwrap(),
            Duration::seconds(60)
        );
        assert_eq!(
            data_dir_from_env_value(Some("  ".into())),
            PathBuf::from("medvault_data")
        );
        assert_eq!(
            roles_from_env_value(Some("Physician, nurse,,".into()), &[]),
            vec!["physician".to_string(), "nurse".to_string()]
        );
        assert!(master_key_from_env_value(None).is_err());
    }

    #[test]
    fn test_from_env_values() {
        let cfg = CoreConfig::from_env_values(EnvValues {
            data_dir: Some("/srv/vault".into()),
            suspicious_threshold: Some("3".into()),
            suspicious_window_secs: Some("60".into()),
            confidential_roles: Some("Physician, nurse".into()),
            ..EnvValues::default()
        })
        .unwrap();
        assert_eq!(cfg.data_dir(), Path::new("/srv/vault"));
        assert_eq!(cfg.audit().suspicious_threshold, 3);
        assert_eq!(cfg.audit().suspicious_window, Duration::seconds(60));
        assert_eq!(cfg.documents().confidential_roles, vec!["physician", "nurse"]);

        let zero = EnvValues {
            suspicious_threshold: Some("0".into()),
            ..EnvValues::default()
        };
        assert!(matches!(
            CoreConfig::from_env_values(zero),
            Err(CoreError::InvalidInput(_))
        ));
    }
}

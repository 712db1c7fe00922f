//! Path, filename and default-value constants used throughout the core crate.

/// Default directory for all MedVault data when no explicit directory is configured.
pub const DEFAULT_DATA_DIR: &str = "medvault_data";

pub const PATIENTS_DIR_NAME: &str = "patients";
pub const MEDICAL_RECORDS_DIR_NAME: &str = "medical_records";
pub const DOCUMENTS_DIR_NAME: &str = "patient_documents";
pub const ENCRYPTION_METADATA_DIR_NAME: &str = "document_encryption_metadata";
pub const STATUS_HISTORY_DIR_NAME: &str = "patient_status_history";
pub const CONSENTS_DIR_NAME: &str = "consents";
pub const AUDIT_LOG_DIR_NAME: &str = "audit_log";
pub const BLOBS_DIR_NAME: &str = "blobs";

pub const PATIENT_FILENAME: &str = "patient.yaml";
pub const MEDICAL_RECORD_FILENAME: &str = "record.yaml";
pub const DOCUMENT_FILENAME: &str = "document.yaml";
pub const ENCRYPTION_METADATA_FILENAME: &str = "encryption.yaml";
pub const STATUS_TRANSITION_FILENAME: &str = "transition.yaml";
pub const CONSENT_FILENAME: &str = "consent.yaml";

/// Blob key prefix for document ciphertext.
pub const DOCUMENT_BLOB_PREFIX: &str = "documents";

/// Largest accepted upload (50 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// Denied accesses for one actor/subject pair before a security alert is raised.
pub const DEFAULT_SUSPICIOUS_THRESHOLD: u32 = 5;

/// Sliding window, in seconds, used for suspicious-activity detection.
pub const DEFAULT_SUSPICIOUS_WINDOW_SECS: i64 = 15 * 60;

/// Statutory minimum retention for audit entries, in years.
pub const DEFAULT_AUDIT_RETENTION_YEARS: u32 = 7;

pub const DEFAULT_TOP_SUBJECTS: usize = 10;

pub const DEFAULT_CONFIDENTIAL_ROLES: &[&str] = &["physician", "psychologist", "admin"];
pub const DEFAULT_AUDIT_READER_ROLES: &[&str] = &["admin", "compliance_officer"];

/// Argon2id defaults (OWASP minimum: 19 MiB, 2 passes, 1 lane).
pub const DEFAULT_KDF_MEMORY_KIB: u32 = 19 * 1024;
pub const DEFAULT_KDF_ITERATIONS: u32 = 2;
pub const DEFAULT_KDF_PARALLELISM: u32 = 1;

/// Salt for the key that seals audit payloads. Patient keys use the patient id instead.
pub const AUDIT_KEY_SALT: &[u8] = b"medvault/audit-log/v1";

pub const CIPHER_ALGORITHM: &str = "AES-256-GCM";
pub const KDF_ALGORITHM: &str = "argon2id";

//! Secure document store.
//!
//! Uploads are checked for access, validated as a whole, checksummed, sealed with a key derived
//! for the owning patient and written to the blob store. The key metadata (salt, nonce, tag)
//! lives in a separate table from the ciphertext. A stored document starts in `UPLOADING`; the
//! [`DocumentPipeline`] moves it on from there.

use crate::collaborators::VirusScanner;
use crate::config::CoreConfig;
use crate::constants::{CIPHER_ALGORITHM, KDF_ALGORITHM};
use crate::crypto::{decode_b64, encode_b64, open, seal, DataKey, KeyDeriver, KeyProvider};
use crate::domain::audit::{AccessResult, NewAuditEntry};
use crate::domain::document::{
    associated_data, blob_path_for, document_id_from_path, Document, DocumentEncryption,
    DocumentMetadata, DocumentMetadataInput, DocumentStatus, EncryptionEntry, MetadataChanges,
    ScanResult, StoredVersion, UploadFile,
};
use crate::domain::optional_text;
use crate::error::ValidationErrors;
use crate::ids::{DocumentId, PatientId, UserId};
use crate::repositories::{Dependent, Repositories};
use crate::services::access::TenantGuard;
use crate::services::audit::AuditService;
use crate::{CoreError, CoreResult, OperationContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use vault_files::{sha256_digest, BlobPath};

/// Decrypted content of one document version.
#[derive(Clone, PartialEq, Eq)]
pub struct RetrievedDocument {
    pub document: Document,
    pub version: u32,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for RetrievedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievedDocument")
            .field("document", self.document.id())
            .field("version", &self.version)
            .field("size", &self.bytes.len())
            .finish()
    }
}

/// A sealed blob ready to be written, with the metadata that opens it.
struct SealedBlob {
    path: String,
    ciphertext: Vec<u8>,
    entry: EncryptionEntry,
}

#[derive(Debug)]
pub struct DocumentStore {
    cfg: Arc<CoreConfig>,
    repos: Arc<Repositories>,
    audit: Arc<AuditService>,
    keys: Arc<dyn KeyProvider>,
    guard: Arc<TenantGuard>,
}

impl DocumentStore {
    pub fn new(
        cfg: Arc<CoreConfig>,
        repos: Arc<Repositories>,
        audit: Arc<AuditService>,
        keys: Arc<dyn KeyProvider>,
        guard: Arc<TenantGuard>,
    ) -> Self {
        Self {
            cfg,
            repos,
            audit,
            keys,
            guard,
        }
    }

    fn data_key(&self, salt: &str) -> CoreResult<DataKey> {
        let master = self.keys.master_key()?;
        KeyDeriver::new(self.cfg.kdf()).derive(&master, salt.as_bytes())
    }

    /// Tenant membership, plus a privileged role for confidential documents. Denials are
    /// audited before the error is returned.
    fn authorize(
        &self,
        actor: &UserId,
        patient_id: &PatientId,
        confidential: bool,
        operation: &'static str,
    ) -> CoreResult<()> {
        self.guard.require_member(actor, patient_id, operation, "document")?;
        if !confidential || actor.is_system() {
            return Ok(());
        }
        let role = self.guard.directory().role(actor)?;
        let privileged = role
            .as_deref()
            .is_some_and(|r| self.cfg.documents().confidential_roles.iter().any(|allowed| allowed == r));
        if privileged {
            return Ok(());
        }
        self.guard.deny(
            actor,
            patient_id,
            operation,
            "document",
            format!(
                "role {} may not access confidential documents",
                role.as_deref().unwrap_or("<none>")
            ),
        )
    }

    fn seal_version(
        &self,
        patient_id: &PatientId,
        document_id: &DocumentId,
        version: u32,
        bytes: &[u8],
    ) -> CoreResult<SealedBlob> {
        let path = blob_path_for(patient_id, document_id, version);
        let salt = patient_id.to_string();
        let key = self.data_key(&salt)?;
        let sealed = seal(&key, bytes, &associated_data(document_id, &path))?;
        Ok(SealedBlob {
            entry: EncryptionEntry {
                path: path.clone(),
                algorithm: CIPHER_ALGORITHM.to_string(),
                kdf: KDF_ALGORITHM.to_string(),
                key_salt: salt,
                nonce: encode_b64(&sealed.nonce),
                tag: encode_b64(&sealed.tag),
                created_at: Utc::now(),
            },
            path,
            ciphertext: sealed.ciphertext,
        })
    }

    /// Run `write` after the blob is in place; remove the blob again if `write` fails.
    fn with_blob<T>(&self, blob: &SealedBlob, write: impl FnOnce() -> CoreResult<T>) -> CoreResult<T> {
        let path = BlobPath::new(&blob.path)?;
        self.repos.blobs().put(&path, &blob.ciphertext)?;
        write().or_else(|e| match self.repos.blobs().delete(&path) {
            Ok(_) => Err(e),
            Err(cleanup) => Err(CoreError::CleanupAfterFailure {
                path: blob.path.clone(),
                error: Box::new(e),
                cleanup_error: Box::new(CoreError::from(cleanup)),
            }),
        })
    }

    /// Validate, checksum, encrypt and store a new document in `UPLOADING`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::AccessDenied`] if the actor may not upload for this patient.
    /// - [`CoreError::Validation`] listing every problem with the file and the metadata.
    /// - [`CoreError::ReferentialIntegrity`] if the patient does not exist or is deleted.
    ///
    /// Nothing is persisted when any of these is returned.
    pub fn upload(
        &self,
        patient_id: &PatientId,
        file: &UploadFile,
        input: &DocumentMetadataInput,
        actor: &UserId,
    ) -> CoreResult<Document> {
        if !self.repos.patients.exists(patient_id.as_uuid()) {
            return Err(CoreError::ReferentialIntegrity {
                entity: "document",
                patient_id: patient_id.to_string(),
            });
        }
        self.authorize(actor, patient_id, input.confidential, "upload")?;

        let mut errors = ValidationErrors::new();
        let checked = errors.collect(file.validate(self.cfg.documents().max_upload_bytes));
        let metadata = errors.collect_nested("metadata", DocumentMetadata::new(input));
        let ((file_name, file_kind), metadata) = match (checked, metadata) {
            (Some(checked), Some(metadata)) if errors.is_empty() => (checked, metadata),
            _ => {
                tracing::warn!("rejected upload for patient {}: {}", patient_id, errors);
                return Err(CoreError::Validation(errors));
            }
        };

        let checksum = sha256_digest(&file.bytes);
        let document_id = DocumentId::new();
        let blob = self.seal_version(patient_id, &document_id, metadata.version(), &file.bytes)?;

        let document = self
            .repos
            .locks()
            .with_lock(patient_id, || {
                self.repos.require_live_patient("document", patient_id)?;
                self.with_blob(&blob, || {
                    let encryption = DocumentEncryption::new(document_id.clone()).with_entry(blob.entry.clone());
                    self.repos.encryption.insert_new(document_id.as_uuid(), &encryption)?;

                    let document = Document::uploaded(
                        document_id.clone(),
                        patient_id.clone(),
                        file_name,
                        file_kind,
                        metadata,
                        StoredVersion {
                            path: blob.path.clone(),
                            checksum,
                            size: file.size(),
                            note: None,
                        },
                        actor,
                        Utc::now(),
                    );
                    if let Err(e) = self.repos.documents.insert_new(document.key(), &document) {
                        self.repos.encryption.remove(document_id.as_uuid())?;
                        return Err(e);
                    }
                    Ok(document)
                })
            })
            .context("upload document")?;

        tracing::info!("stored document {} for patient {}", document.id(), patient_id);
        self.audit.log_data_access(
            NewAuditEntry::new(actor, "upload", "document", AccessResult::Granted)
                .patient(patient_id)
                .after(json!({
                    "document_id": document.id(),
                    "title": document.metadata().title(),
                    "size": file.size(),
                })),
        );
        Ok(document)
    }

    pub fn get(&self, id: &DocumentId) -> CoreResult<Document> {
        self.repos.documents.fetch(id.as_uuid())
    }

    /// Store new content for an existing document under the next version number.
    ///
    /// Earlier versions keep their blobs and stay retrievable. The document returns to
    /// `PROCESSING` until the new content is scanned.
    pub fn create_document_version(
        &self,
        id: &DocumentId,
        file: &UploadFile,
        actor: &UserId,
        note: Option<&str>,
    ) -> CoreResult<Document> {
        let current = self.get(id)?;
        let owner = current.patient_id().clone();
        self.authorize(actor, &owner, current.metadata().is_confidential(), "create_version")?;

        let mut errors = ValidationErrors::new();
        let checked = errors.collect(file.validate(self.cfg.documents().max_upload_bytes));
        let note = errors.collect(optional_text("note", note, 500));
        let ((file_name, file_kind), note) = match (checked, note) {
            (Some(checked), Some(note)) if errors.is_empty() => (checked, note),
            _ => return Err(CoreError::Validation(errors)),
        };

        let version = current.metadata().version() + 1;
        let blob = self.seal_version(&owner, id, version, &file.bytes)?;
        let checksum = sha256_digest(&file.bytes);

        let next = self
            .repos
            .locks()
            .with_lock(&owner, || {
                let latest = self.get(id)?;
                if latest.patient_id() != &owner || latest.metadata().version() + 1 != version {
                    return Err(CoreError::Conflict(format!(
                        "document {id} changed while the new version was being prepared"
                    )));
                }
                self.repos.require_live_patient("document", &owner)?;
                let next = latest.with_new_version(
                    file_name,
                    file_kind,
                    StoredVersion {
                        path: blob.path.clone(),
                        checksum,
                        size: file.size(),
                        note,
                    },
                    actor,
                    Utc::now(),
                )?;

                self.with_blob(&blob, || {
                    let previous = self
                        .repos
                        .encryption
                        .get(id.as_uuid())?
                        .unwrap_or_else(|| DocumentEncryption::new(id.clone()));
                    self.repos
                        .encryption
                        .replace(id.as_uuid(), &previous.with_entry(blob.entry.clone()))?;
                    if let Err(e) = self.repos.documents.replace(next.key(), &next) {
                        self.repos.encryption.replace(id.as_uuid(), &previous)?;
                        return Err(e);
                    }
                    Ok(next)
                })
            })
            .context("create document version")?;

        tracing::info!("document {} now at version {}", id, version);
        self.audit.log_data_access(
            NewAuditEntry::new(actor, "create_version", "document", AccessResult::Granted)
                .patient(&owner)
                .before(json!({ "version": version - 1 }))
                .after(json!({ "document_id": id, "version": version })),
        );
        Ok(next)
    }

    /// Metadata-only update, guarded by the version the caller last saw.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Conflict`] when `expected_version` is not the stored version.
    pub fn update_document_metadata(
        &self,
        id: &DocumentId,
        changes: &MetadataChanges,
        expected_version: u32,
        actor: &UserId,
    ) -> CoreResult<Document> {
        let current = self.get(id)?;
        let owner = current.patient_id().clone();
        let confidential = current.metadata().is_confidential() || changes.confidential == Some(true);
        self.authorize(actor, &owner, confidential, "update_metadata")?;

        let (before, next) = self
            .repos
            .locks()
            .with_lock(&owner, || {
                let latest = self.get(id)?;
                if latest.metadata().version() != expected_version {
                    return Err(CoreError::Conflict(format!(
                        "document {id} is at version {}, expected {expected_version}",
                        latest.metadata().version()
                    )));
                }
                self.repos.require_live_patient("document", &owner)?;
                let next = latest.with_metadata(changes, None, actor, Utc::now())?;
                self.repos.documents.replace(next.key(), &next)?;
                Ok((latest, next))
            })
            .context("update document metadata")?;

        self.audit.log_data_access(
            NewAuditEntry::new(actor, "update_metadata", "document", AccessResult::Granted)
                .patient(&owner)
                .before(serde_json::to_value(before.metadata()).unwrap_or_default())
                .after(serde_json::to_value(next.metadata()).unwrap_or_default()),
        );
        Ok(next)
    }

    /// Decrypt the blob at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MissingEncryptionMetadata`] when no key metadata exists for the
    /// path; ciphertext is never returned in place of plaintext.
    pub fn retrieve_file(&self, path: &str) -> CoreResult<Vec<u8>> {
        let document_id = document_id_from_path(path)?;
        let metadata = self
            .repos
            .encryption
            .get(document_id.as_uuid())?
            .ok_or_else(|| CoreError::MissingEncryptionMetadata(path.to_string()))?;
        let entry = metadata
            .entry_for(path)
            .ok_or_else(|| CoreError::MissingEncryptionMetadata(path.to_string()))?;

        let ciphertext = self.repos.blobs().get(&BlobPath::new(path)?)?;
        let key = self.data_key(&entry.key_salt)?;
        let nonce = decode_b64("nonce", &entry.nonce)?;
        let tag = decode_b64("tag", &entry.tag)?;
        open(&key, &ciphertext, &nonce, &tag, &associated_data(&document_id, path))
    }

    /// Plaintext of the current version, or of `version` when given.
    ///
    /// The document must be accessible (validated, encrypted and scanned clean), and the
    /// decrypted bytes must match the checksum recorded for that version.
    pub fn retrieve_document(
        &self,
        id: &DocumentId,
        version: Option<u32>,
        actor: &UserId,
    ) -> CoreResult<RetrievedDocument> {
        let document = self.get(id)?;
        self.authorize(
            actor,
            document.patient_id(),
            document.metadata().is_confidential(),
            "read",
        )?;
        if !document.is_accessible() {
            return Err(CoreError::Conflict(format!(
                "document {id} is {} and cannot be retrieved",
                document.status()
            )));
        }

        let selected = match version {
            Some(n) => document
                .version(n)
                .ok_or_else(|| CoreError::not_found("document version", format!("{id} v{n}")))?,
            None => document
                .current_version()
                .ok_or_else(|| CoreError::not_found("document version", id))?,
        };
        let bytes = self.retrieve_file(&selected.path).context("retrieve document")?;
        let actual = sha256_digest(&bytes);
        if actual != selected.checksum {
            return Err(CoreError::ChecksumMismatch {
                path: selected.path.clone(),
                expected: selected.checksum.to_string(),
                actual: actual.to_string(),
            });
        }
        let number = selected.version;

        self.audit.log_data_access(
            NewAuditEntry::new(actor, "read", "document", AccessResult::Granted)
                .patient(document.patient_id())
                .after(json!({ "document_id": id, "version": number })),
        );
        Ok(RetrievedDocument {
            document,
            version: number,
            bytes,
        })
    }

    /// Documents of one patient, oldest upload first.
    pub fn list_patient_documents(&self, patient_id: &PatientId) -> CoreResult<Vec<Document>> {
        self.repos.patient(patient_id)?;
        let mut documents = self
            .repos
            .dependents_of(&self.repos.documents, patient_id)
            .context("list documents")?;
        documents.sort_by_key(|d| d.uploaded_at());
        Ok(documents)
    }

    /// Logical delete: the document moves to `ARCHIVED`; blobs stay until erasure.
    pub fn delete_document(&self, id: &DocumentId, actor: &UserId) -> CoreResult<Document> {
        let current = self.get(id)?;
        let owner = current.patient_id().clone();
        self.authorize(actor, &owner, current.metadata().is_confidential(), "delete")?;
        let archived = self.transition(id, &owner, |d, now| d.archived(now))?;

        self.audit.log_data_access(
            NewAuditEntry::new(actor, "delete", "document", AccessResult::Granted)
                .patient(&owner)
                .before(json!({ "status": current.status() }))
                .after(json!({ "document_id": id, "status": archived.status() })),
        );
        Ok(archived)
    }

    /// Archive every document past its retention period. Returns how many were archived.
    ///
    /// Documents still in the upload pipeline are left for a later sweep.
    pub fn archive_expired_documents(&self) -> CoreResult<usize> {
        let now = Utc::now();
        let mut archived = 0;
        for document in self.repos.documents.list().context("list documents")? {
            if !document.is_expired_at(now)
                || !document.status().can_transition_to(DocumentStatus::Archived)
            {
                continue;
            }
            match self.transition(document.id(), document.patient_id(), |d, now| d.archived(now)) {
                Ok(_) => archived += 1,
                Err(e) => tracing::warn!("could not archive expired document {}: {}", document.id(), e),
            }
        }
        if archived > 0 {
            tracing::info!("archived {} expired documents", archived);
            self.audit.log_data_access(
                NewAuditEntry::new(&UserId::system(), "archive_expired", "document", AccessResult::Granted)
                    .after(json!({ "archived": archived })),
            );
        }
        Ok(archived)
    }

    /// Re-read a document under its owner's lock and persist `change(document)` if it differs.
    pub(crate) fn transition(
        &self,
        id: &DocumentId,
        owner: &PatientId,
        change: impl FnOnce(&Document, DateTime<Utc>) -> CoreResult<Document>,
    ) -> CoreResult<Document> {
        self.repos
            .locks()
            .with_lock(owner, || {
                let current = self.get(id)?;
                if current.patient_id() != owner {
                    return Err(CoreError::Conflict(format!(
                        "document {id} moved to another patient"
                    )));
                }
                let next = change(&current, Utc::now())?;
                if next != current {
                    self.repos.documents.replace(next.key(), &next)?;
                }
                Ok(next)
            })
            .context("update document status")
    }
}

/// What one pipeline sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub validated: usize,
    pub failed_validation: usize,
    pub still_pending: usize,
    pub errors: usize,
}

/// Moves stored documents through encryption confirmation and virus scanning.
///
/// Each step persists before the next runs, so an interrupted run leaves the document in
/// `UPLOADING` or `PROCESSING` and the next [`process`](Self::process) picks up from there.
#[derive(Debug)]
pub struct DocumentPipeline {
    store: Arc<DocumentStore>,
    scanner: Arc<dyn VirusScanner>,
}

impl DocumentPipeline {
    pub fn new(store: Arc<DocumentStore>, scanner: Arc<dyn VirusScanner>) -> Self {
        Self { store, scanner }
    }

    /// `UPLOADING -> PROCESSING` once key metadata for the current blob exists. Idempotent.
    pub fn confirm_encryption(&self, id: &DocumentId) -> CoreResult<Document> {
        let document = self.store.get(id)?;
        let path = document.current_path().to_string();
        let has_metadata = self
            .store
            .repos
            .encryption
            .get(id.as_uuid())?
            .is_some_and(|meta| meta.entry_for(&path).is_some());
        if !has_metadata {
            return Err(CoreError::MissingEncryptionMetadata(path));
        }
        self.store
            .transition(id, document.patient_id(), |d, now| d.with_encryption_confirmed(now))
    }

    /// Record a scanner verdict. Idempotent; `Pending` leaves the document in `PROCESSING`.
    pub fn apply_scan_result(&self, id: &DocumentId, result: ScanResult) -> CoreResult<Document> {
        let document = self.store.get(id)?;
        let next = self
            .store
            .transition(id, document.patient_id(), |d, now| d.with_scan_result(result, now))?;
        if next.status() != document.status() {
            tracing::info!("document {} {} -> {}", id, document.status(), next.status());
            self.store.audit.log_data_access(
                NewAuditEntry::new(&UserId::system(), "scan", "document", AccessResult::Granted)
                    .patient(next.patient_id())
                    .after(json!({ "document_id": id, "status": next.status(), "scan_result": result })),
            );
        }
        Ok(next)
    }

    /// Advance one document as far as it can go.
    pub fn process(&self, id: &DocumentId) -> CoreResult<Document> {
        let mut document = self.store.get(id)?;
        if document.status() == DocumentStatus::Uploading {
            document = self.confirm_encryption(id)?;
        }
        if document.status() == DocumentStatus::Processing {
            let plaintext = self.store.retrieve_file(document.current_path())?;
            let verdict = self.scanner.scan(&plaintext)?;
            document = self.apply_scan_result(id, verdict)?;
        }
        Ok(document)
    }

    /// Process every document still in `UPLOADING` or `PROCESSING`. Failures are logged and
    /// counted; the document stays where it was for the next sweep.
    pub fn process_pending(&self) -> CoreResult<PipelineReport> {
        let mut report = PipelineReport::default();
        let pending = self
            .store
            .repos
            .documents
            .list()
            .context("list documents")?
            .into_iter()
            .filter(|d| matches!(d.status(), DocumentStatus::Uploading | DocumentStatus::Processing));

        for document in pending {
            match self.process(document.id()) {
                Ok(d) => match d.status() {
                    DocumentStatus::Validated => report.validated += 1,
                    DocumentStatus::FailedValidation => report.failed_validation += 1,
                    _ => report.still_pending += 1,
                },
                Err(e) => {
                    tracing::warn!("pipeline failed for document {}: {}", document.id(), e);
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audit::AuditFilter;
    use crate::domain::patient::NewPatient;
    use crate::error::RuleCode;
    use crate::services::test_support::TestVault;
    use chrono::NaiveDate;

    fn pdf(len: usize) -> Vec<u8> {
        let mut bytes = b"%PDF-1.7\n".to_vec();
        bytes.resize(len, b'x');
        bytes
    }

    fn metadata(confidential: bool) -> DocumentMetadataInput {
        DocumentMetadataInput {
            title: "Referral letter".into(),
            document_type: "referral".into(),
            confidential,
            ..DocumentMetadataInput::default()
        }
    }

    fn setup() -> (TestVault, PatientId) {
        let v = TestVault::new();
        let patient = v
            .patients
            .register(
                &NewPatient::new("Ana Lima", NaiveDate::from_ymd_opt(1979, 1, 20).unwrap(), "female"),
                &v.physician,
            )
            .unwrap();
        (v, patient.id().clone())
    }

    fn uploaded(v: &TestVault, patient: &PatientId, bytes: Vec<u8>) -> Document {
        v.documents
            .upload(
                patient,
                &UploadFile::new("letter.pdf", "application/pdf", bytes),
                &metadata(false),
                &v.physician,
            )
            .unwrap()
    }

    #[test]
    fn test_upload_stores_ciphertext_and_separate_key_metadata() {
        let (v, patient) = setup();
        let bytes = pdf(2048);
        let document = uploaded(&v, &patient, bytes.clone());

        assert_eq!(document.status(), DocumentStatus::Uploading);
        assert_eq!(document.metadata().version(), 1);
        assert_eq!(document.security().checksum, sha256_digest(&bytes));

        let stored = v
            .repos
            .blobs()
            .get(&BlobPath::new(document.current_path()).unwrap())
            .unwrap();
        assert_ne!(stored, bytes);
        let meta = v.repos.encryption.fetch(document.id().as_uuid()).unwrap();
        assert_eq!(meta.entries[0].key_salt, patient.to_string());
        assert_eq!(v.documents.retrieve_file(document.current_path()).unwrap(), bytes);
    }

    #[test]
    fn test_invalid_upload_reports_everything_and_persists_nothing() {
        let (v, patient) = setup();
        let file = UploadFile::new("payload.exe", "application/x-msdownload", Vec::new());
        let bad_metadata = DocumentMetadataInput {
            title: " ".into(),
            document_type: "selfie".into(),
            ..DocumentMetadataInput::default()
        };

        match v.documents.upload(&patient, &file, &bad_metadata, &v.physician) {
            Err(CoreError::Validation(errors)) => {
                assert!(errors.has("media_type", RuleCode::DisallowedFileType));
                assert!(errors.has("size", RuleCode::EmptyFile));
                assert!(errors.has("metadata.title", RuleCode::Required));
                assert!(errors.has("metadata.document_type", RuleCode::InvalidValue));
            }
            other => panic!("expected validation errors, got {other:?}"),
        }
        assert_eq!(v.repos.counts().unwrap().documents, 0);
        assert_eq!(v.repos.encryption.count().unwrap(), 0);
    }

    #[test]
    fn test_access_control() {
        let (v, patient) = setup();
        let file = UploadFile::new("letter.pdf", "application/pdf", pdf(100));

        let outsider = v.documents.upload(&patient, &file, &metadata(false), &v.outsider);
        assert!(matches!(outsider, Err(CoreError::AccessDenied(_))));

        let nurse_confidential = v.documents.upload(&patient, &file, &metadata(true), &v.nurse);
        assert!(matches!(nurse_confidential, Err(CoreError::AccessDenied(_))));

        assert!(v.documents.upload(&patient, &file, &metadata(true), &v.physician).is_ok());
        assert!(v.documents.upload(&patient, &file, &metadata(false), &v.nurse).is_ok());
        assert_eq!(v.repos.counts().unwrap().documents, 2);
    }

    #[test]
    fn test_upload_for_unknown_patient_is_rejected() {
        let (v, _) = setup();
        let file = UploadFile::new("letter.pdf", "application/pdf", pdf(100));
        let result = v.documents.upload(&PatientId::new(), &file, &metadata(false), &v.physician);

        assert!(matches!(result, Err(CoreError::ReferentialIntegrity { .. })));
        assert_eq!(v.repos.counts().unwrap().documents, 0);
        assert_eq!(v.repos.encryption.count().unwrap(), 0);
    }

    #[test]
    fn test_unknown_patient_is_not_an_access_denial() {
        let (v, _) = setup();
        let file = UploadFile::new("letter.pdf", "application/pdf", pdf(100));
        let result = v.documents.upload(&PatientId::new(), &file, &metadata(false), &v.outsider);

        assert!(matches!(result, Err(CoreError::ReferentialIntegrity { .. })));
        let denials = AuditFilter {
            actor: Some(v.outsider.clone()),
            result: Some(AccessResult::Denied),
            ..AuditFilter::default()
        };
        assert_eq!(v.audit.query(&UserId::system(), &denials).unwrap().total_count, 0);
    }

    #[test]
    fn test_infected_document_takes_no_new_version() {
        let (v, patient) = setup();
        let mut infected_bytes = pdf(512);
        infected_bytes.extend_from_slice(b"EICAR-STANDARD-ANTIVIRUS-TEST-FILE");
        let infected = uploaded(&v, &patient, infected_bytes);
        v.pipeline.process(infected.id()).unwrap();

        let result = v.documents.create_document_version(
            infected.id(),
            &UploadFile::new("letter-clean.pdf", "application/pdf", pdf(512)),
            &v.physician,
            Some("rescanned copy"),
        );
        assert!(matches!(result, Err(CoreError::InvalidTransition { .. })));

        let stored = v.documents.get(infected.id()).unwrap();
        assert_eq!(stored.status(), DocumentStatus::FailedValidation);
        assert_eq!(stored.metadata().version(), 1);
        let second = BlobPath::new(&blob_path_for(&patient, infected.id(), 2)).unwrap();
        assert!(!v.repos.blobs().exists(&second).unwrap());
    }

    #[test]
    fn test_pipeline_validates_clean_and_rejects_infected() {
        let (v, patient) = setup();
        let clean = uploaded(&v, &patient, pdf(512));
        let mut infected_bytes = pdf(512);
        infected_bytes.extend_from_slice(b"EICAR-STANDARD-ANTIVIRUS-TEST-FILE");
        let infected = uploaded(&v, &patient, infected_bytes);

        let report = v.pipeline.process_pending().unwrap();
        assert_eq!(report.validated, 1);
        assert_eq!(report.failed_validation, 1);

        let clean = v.documents.get(clean.id()).unwrap();
        assert!(clean.is_accessible());
        let infected = v.documents.get(infected.id()).unwrap();
        assert_eq!(infected.status(), DocumentStatus::FailedValidation);
        assert!(matches!(
            v.documents.retrieve_document(infected.id(), None, &v.physician),
            Err(CoreError::Conflict(_))
        ));

        // a second run has nothing to do and changes nothing
        assert_eq!(v.pipeline.process_pending().unwrap(), PipelineReport::default());
        assert_eq!(v.pipeline.process(clean.id()).unwrap(), clean);
    }

    #[test]
    fn test_missing_encryption_metadata_is_a_hard_failure() {
        let (v, patient) = setup();
        let document = uploaded(&v, &patient, pdf(256));
        v.repos.encryption.remove(document.id().as_uuid()).unwrap();

        assert!(matches!(
            v.documents.retrieve_file(document.current_path()),
            Err(CoreError::MissingEncryptionMetadata(_))
        ));
        assert!(matches!(
            v.pipeline.process(document.id()),
            Err(CoreError::MissingEncryptionMetadata(_))
        ));
        assert_eq!(v.documents.get(document.id()).unwrap().status(), DocumentStatus::Uploading);
    }

    #[test]
    fn test_new_versions_keep_old_content_retrievable() {
        let (v, patient) = setup();
        let first = pdf(300);
        let document = uploaded(&v, &patient, first.clone());
        v.pipeline.process(document.id()).unwrap();

        let second = pdf(600);
        let next = v
            .documents
            .create_document_version(
                document.id(),
                &UploadFile::new("letter-v2.pdf", "application/pdf", second.clone()),
                &v.physician,
                Some("corrected dosage"),
            )
            .unwrap();
        assert_eq!(next.metadata().version(), 2);
        assert_eq!(next.status(), DocumentStatus::Processing);
        v.pipeline.process(document.id()).unwrap();

        let v1 = v.documents.retrieve_document(document.id(), Some(1), &v.physician).unwrap();
        let v2 = v.documents.retrieve_document(document.id(), None, &v.physician).unwrap();
        assert_eq!(v1.bytes, first);
        assert_eq!(v2.bytes, second);
        assert_eq!(v2.version, 2);
    }

    #[test]
    fn test_metadata_update_checks_expected_version() {
        let (v, patient) = setup();
        let document = uploaded(&v, &patient, pdf(300));
        let changes = MetadataChanges {
            title: Some("Referral letter (signed)".into()),
            ..MetadataChanges::default()
        };

        let updated = v
            .documents
            .update_document_metadata(document.id(), &changes, 1, &v.physician)
            .unwrap();
        assert_eq!(updated.metadata().version(), 2);
        assert_eq!(updated.current_path(), document.current_path());
        assert!(matches!(
            v.documents.update_document_metadata(document.id(), &changes, 1, &v.physician),
            Err(CoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_tampered_blob_fails_decryption() {
        let (v, patient) = setup();
        let document = uploaded(&v, &patient, pdf(300));
        let path = BlobPath::new(document.current_path()).unwrap();
        let mut ciphertext = v.repos.blobs().get(&path).unwrap();
        ciphertext[0] ^= 0xff;
        v.repos.blobs().delete(&path).unwrap();
        v.repos.blobs().put(&path, &ciphertext).unwrap();

        assert!(matches!(
            v.documents.retrieve_file(document.current_path()),
            Err(CoreError::Crypto(_))
        ));
    }

    #[test]
    fn test_delete_archives_without_removing_blobs() {
        let (v, patient) = setup();
        let document = uploaded(&v, &patient, pdf(300));
        v.pipeline.process(document.id()).unwrap();

        let archived = v.documents.delete_document(document.id(), &v.physician).unwrap();
        assert_eq!(archived.status(), DocumentStatus::Archived);
        assert!(archived.should_be_archived_at(Utc::now()));
        assert!(v
            .repos
            .blobs()
            .exists(&BlobPath::new(document.current_path()).unwrap())
            .unwrap());
        assert_eq!(v.documents.list_patient_documents(&patient).unwrap().len(), 1);
    }
}

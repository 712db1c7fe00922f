//! Clinical document aggregate: metadata, security state, status machine and version history.
//!
//! Status flow:
//!
//! ```text
//! UPLOADING -> PROCESSING -> VALIDATED -> ARCHIVED
//!                   |            |
//!                   |            +-> PROCESSING (new file version pending scan)
//!                   +-> FAILED_VALIDATION -> ARCHIVED
//! ```
//!
//! A document is accessible only when it is `VALIDATED`, encrypted and scan-clean. Archival is a
//! status change; nothing here deletes bytes.

use super::{optional_text, parse_enum, required_text};
use crate::constants::{CIPHER_ALGORITHM, DOCUMENT_BLOB_PREFIX};
use crate::error::{RuleCode, ValidationErrors};
use crate::ids::{DocumentId, PatientId, UserId};
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use vault_files::{sniff_media_type, Sha256Hash};
use vault_types::NonEmptyText;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    ClinicalReport,
    LabResult,
    Imaging,
    Prescription,
    ConsentForm,
    Referral,
    Identification,
    InsuranceCard,
    Other,
}

impl DocumentType {
    const VARIANTS: &'static [(&'static str, DocumentType)] = &[
        ("clinical_report", DocumentType::ClinicalReport),
        ("lab_result", DocumentType::LabResult),
        ("imaging", DocumentType::Imaging),
        ("prescription", DocumentType::Prescription),
        ("consent_form", DocumentType::ConsentForm),
        ("referral", DocumentType::Referral),
        ("identification", DocumentType::Identification),
        ("insurance_card", DocumentType::InsuranceCard),
        ("other", DocumentType::Other),
    ];

    pub fn parse(field: &str, input: &str) -> Result<Self, ValidationErrors> {
        parse_enum(field, input, Self::VARIANTS)
    }
}

/// Accepted file kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Pdf,
    Doc,
    Docx,
    Jpeg,
    Png,
    Txt,
}

impl FileKind {
    pub const ALL: [FileKind; 6] = [
        FileKind::Pdf,
        FileKind::Doc,
        FileKind::Docx,
        FileKind::Jpeg,
        FileKind::Png,
        FileKind::Txt,
    ];

    pub fn media_type(&self) -> &'static str {
        match self {
            FileKind::Pdf => "application/pdf",
            FileKind::Doc => "application/msword",
            FileKind::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
            FileKind::Jpeg => "image/jpeg",
            FileKind::Png => "image/png",
            FileKind::Txt => "text/plain",
        }
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            FileKind::Pdf => &["pdf"],
            FileKind::Doc => &["doc"],
            FileKind::Docx => &["docx"],
            FileKind::Jpeg => &["jpg", "jpeg"],
            FileKind::Png => &["png"],
            FileKind::Txt => &["txt"],
        }
    }

    pub fn from_media_type(media_type: &str) -> Option<Self> {
        let essence = media_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|k| k.media_type() == essence)
    }

    /// Whether magic-byte detection reporting `sniffed` is consistent with this kind.
    ///
    /// Office formats are containers, so the sniffer may report the container type instead.
    fn admits_sniffed(&self, sniffed: &str) -> bool {
        if Self::from_media_type(sniffed).is_some() {
            return true;
        }
        match self {
            FileKind::Docx => sniffed == "application/zip",
            FileKind::Doc => sniffed == "application/x-ole-storage" || sniffed == "application/x-cfb",
            _ => false,
        }
    }
}

/// An uploaded file as handed over by the outer layer.
#[derive(Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub file_name: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFile")
            .field("file_name", &self.file_name)
            .field("media_type", &self.media_type)
            .field("size", &self.bytes.len())
            .finish()
    }
}

impl UploadFile {
    pub fn new(file_name: impl Into<String>, media_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            media_type: media_type.into(),
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Check kind, extension, size and content signature. Reports every violation.
    pub fn validate(&self, max_bytes: u64) -> Result<(NonEmptyText, FileKind), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let file_name = errors.collect(required_text("file_name", &self.file_name, 255));

        let kind = FileKind::from_media_type(&self.media_type);
        if kind.is_none() {
            errors.push(
                "media_type",
                RuleCode::DisallowedFileType,
                format!("file type '{}' is not allowed", self.media_type),
            );
        }

        if let (Some(kind), Some(name)) = (kind, &file_name) {
            let extension = name
                .as_str()
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_ascii_lowercase())
                .unwrap_or_default();
            if !kind.extensions().contains(&extension.as_str()) {
                errors.push(
                    "file_name",
                    RuleCode::DisallowedFileType,
                    format!("extension '.{extension}' does not match {}", kind.media_type()),
                );
            }
        }

        if self.bytes.is_empty() {
            errors.push("size", RuleCode::EmptyFile, "file is empty");
        } else if self.size() > max_bytes {
            errors.push(
                "size",
                RuleCode::FileTooLarge,
                format!("file is too large: {} bytes exceeds the {} byte limit", self.size(), max_bytes),
            );
        }

        if let (Some(kind), Some(sniffed)) = (kind, sniff_media_type(&self.bytes)) {
            if !kind.admits_sniffed(sniffed) {
                errors.push(
                    "content",
                    RuleCode::ContentMismatch,
                    format!("content looks like '{sniffed}', which is not an allowed file type"),
                );
            }
        }

        match (file_name, kind) {
            (Some(name), Some(kind)) if errors.is_empty() => Ok((name, kind)),
            _ => Err(errors),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadataInput {
    pub title: String,
    pub document_type: String,
    #[serde(default)]
    pub confidential: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub retention_years: Option<u32>,
}

/// Replacement values for a metadata update. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataChanges {
    pub title: Option<String>,
    pub document_type: Option<String>,
    pub confidential: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub description: Option<String>,
    pub retention_years: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    title: NonEmptyText,
    document_type: DocumentType,
    confidential: bool,
    tags: Vec<NonEmptyText>,
    description: Option<NonEmptyText>,
    version: u32,
    retention_years: Option<u32>,
}

const MAX_TAGS: usize = 20;

fn tags(inputs: &[String]) -> Result<Vec<NonEmptyText>, ValidationErrors> {
    let mut errors = ValidationErrors::new();
    if inputs.len() > MAX_TAGS {
        errors.push("tags", RuleCode::TooLong, format!("at most {MAX_TAGS} tags are allowed"));
    }
    let mut out: Vec<NonEmptyText> = Vec::new();
    for (i, raw) in inputs.iter().enumerate() {
        if let Some(tag) = errors.collect(required_text(&format!("tags[{i}]"), &raw.to_lowercase(), 50)) {
            if !out.contains(&tag) {
                out.push(tag);
            }
        }
    }
    errors.into_result()?;
    Ok(out)
}

fn retention(years: Option<u32>) -> Result<Option<u32>, ValidationErrors> {
    match years {
        Some(y) if !(1..=100).contains(&y) => Err(ValidationErrors::single(
            "retention_years",
            RuleCode::OutOfRange,
            "retention_years must be between 1 and 100",
        )),
        other => Ok(other),
    }
}

impl DocumentMetadata {
    /// Metadata for a fresh upload (version 1).
    pub fn new(input: &DocumentMetadataInput) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let title = errors.collect(required_text("title", &input.title, 200));
        let document_type = errors.collect(DocumentType::parse("document_type", &input.document_type));
        let tag_list = errors.collect(tags(&input.tags));
        let description = errors.collect(optional_text("description", input.description.as_deref(), 1000));
        let retention_years = errors.collect(retention(input.retention_years));

        match (title, document_type, tag_list, description, retention_years) {
            (Some(title), Some(document_type), Some(tags), Some(description), Some(retention_years)) => {
                Ok(Self {
                    title,
                    document_type,
                    confidential: input.confidential,
                    tags,
                    description,
                    version: 1,
                    retention_years,
                })
            }
            _ => Err(errors),
        }
    }

    /// Apply `changes` and bump the version by exactly one.
    fn changed(&self, changes: &MetadataChanges) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let mut next = self.clone();

        if let Some(raw) = &changes.title {
            if let Some(v) = errors.collect(required_text("title", raw, 200)) {
                next.title = v;
            }
        }
        if let Some(raw) = &changes.document_type {
            if let Some(v) = errors.collect(DocumentType::parse("document_type", raw)) {
                next.document_type = v;
            }
        }
        if let Some(flag) = changes.confidential {
            next.confidential = flag;
        }
        if let Some(list) = &changes.tags {
            if let Some(v) = errors.collect(tags(list)) {
                next.tags = v;
            }
        }
        if let Some(raw) = &changes.description {
            if let Some(v) = errors.collect(optional_text("description", Some(raw), 1000)) {
                next.description = v;
            }
        }
        if changes.retention_years.is_some() {
            if let Some(v) = errors.collect(retention(changes.retention_years)) {
                next.retention_years = v;
            }
        }

        errors.into_result()?;
        next.version = self.version + 1;
        Ok(next)
    }

    pub fn title(&self) -> &str {
        self.title.as_str()
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn is_confidential(&self) -> bool {
        self.confidential
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(NonEmptyText::as_str)
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_ref().map(NonEmptyText::as_str)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn retention_years(&self) -> Option<u32> {
        self.retention_years
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanResult {
    Pending,
    Clean,
    Infected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityInfo {
    pub encrypted: bool,
    pub algorithm: String,
    pub scan_result: ScanResult,
    pub scanned_at: Option<DateTime<Utc>>,
    /// SHA-256 of the plaintext of the current version.
    pub checksum: Sha256Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Uploading,
    Processing,
    Validated,
    FailedValidation,
    Archived,
}

impl DocumentStatus {
    pub fn can_transition_to(&self, target: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, target),
            (Uploading, Processing)
                | (Processing, Validated)
                | (Processing, FailedValidation)
                | (Validated, Archived)
                | (Validated, Processing)
                | (FailedValidation, Archived)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploading => "UPLOADING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Validated => "VALIDATED",
            DocumentStatus::FailedValidation => "FAILED_VALIDATION",
            DocumentStatus::Archived => "ARCHIVED",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a document's version history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub version: u32,
    pub path: String,
    pub checksum: Sha256Hash,
    pub size: u64,
    pub created_by: UserId,
    pub note: Option<NonEmptyText>,
    pub created_at: DateTime<Utc>,
}

/// Blob key for the ciphertext of one document version.
pub fn blob_path_for(patient_id: &PatientId, document_id: &DocumentId, version: u32) -> String {
    format!("{DOCUMENT_BLOB_PREFIX}/{patient_id}/{document_id}/v{version}.enc")
}

/// Recover the document id embedded in a blob path produced by [`blob_path_for`].
pub fn document_id_from_path(path: &str) -> CoreResult<DocumentId> {
    let mut segments = path.split('/');
    match (segments.next(), segments.next(), segments.next()) {
        (Some(DOCUMENT_BLOB_PREFIX), Some(_patient), Some(document)) => DocumentId::parse(document),
        _ => Err(CoreError::InvalidInput(format!(
            "'{path}' is not a document blob path"
        ))),
    }
}

/// Additional authenticated data binding ciphertext to its document and path.
pub fn associated_data(document_id: &DocumentId, path: &str) -> Vec<u8> {
    format!("{document_id}:{path}").into_bytes()
}

/// Parameters for a new stored version, produced after the bytes are sealed and written.
#[derive(Debug, Clone)]
pub struct StoredVersion {
    pub path: String,
    pub checksum: Sha256Hash,
    pub size: u64,
    pub note: Option<NonEmptyText>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    id: DocumentId,
    patient_id: PatientId,
    file_name: NonEmptyText,
    file_kind: FileKind,
    metadata: DocumentMetadata,
    security: SecurityInfo,
    status: DocumentStatus,
    current_path: String,
    versions: Vec<DocumentVersion>,
    uploaded_by: UserId,
    uploaded_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Document {
    /// A freshly uploaded document in `UPLOADING`.
    pub fn uploaded(
        id: DocumentId,
        patient_id: PatientId,
        file_name: NonEmptyText,
        file_kind: FileKind,
        metadata: DocumentMetadata,
        stored: StoredVersion,
        actor: &UserId,
        now: DateTime<Utc>,
    ) -> Self {
        let first = DocumentVersion {
            version: metadata.version,
            path: stored.path.clone(),
            checksum: stored.checksum.clone(),
            size: stored.size,
            created_by: actor.clone(),
            note: stored.note,
            created_at: now,
        };
        Self {
            id,
            patient_id,
            file_name,
            file_kind,
            metadata,
            security: SecurityInfo {
                encrypted: false,
                algorithm: CIPHER_ALGORITHM.to_string(),
                scan_result: ScanResult::Pending,
                scanned_at: None,
                checksum: stored.checksum,
            },
            status: DocumentStatus::Uploading,
            current_path: stored.path,
            versions: vec![first],
            uploaded_by: actor.clone(),
            uploaded_at: now,
            updated_at: now,
        }
    }

    fn touched(&self, now: DateTime<Utc>) -> Self {
        Self {
            updated_at: super::patient::next_timestamp(self.updated_at, now),
            ..self.clone()
        }
    }

    fn transitioned(&self, target: DocumentStatus, now: DateTime<Utc>) -> CoreResult<Self> {
        if !self.status.can_transition_to(target) {
            return Err(CoreError::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        Ok(Self {
            status: target,
            ..self.touched(now)
        })
    }

    /// New file content. The version counter moves by one and the document waits for a fresh scan.
    pub fn with_new_version(
        &self,
        file_name: NonEmptyText,
        file_kind: FileKind,
        stored: StoredVersion,
        actor: &UserId,
        now: DateTime<Utc>,
    ) -> CoreResult<Self> {
        let mut next = match self.status {
            DocumentStatus::Uploading | DocumentStatus::Processing => self.touched(now),
            _ => self.transitioned(DocumentStatus::Processing, now)?,
        };
        let version = self.metadata.version + 1;
        next.metadata.version = version;
        next.versions.push(DocumentVersion {
            version,
            path: stored.path.clone(),
            checksum: stored.checksum.clone(),
            size: stored.size,
            created_by: actor.clone(),
            note: stored.note,
            created_at: now,
        });
        next.file_name = file_name;
        next.file_kind = file_kind;
        next.current_path = stored.path;
        next.security.checksum = stored.checksum;
        next.security.scan_result = ScanResult::Pending;
        next.security.scanned_at = None;
        Ok(next)
    }

    /// Metadata-only update. The new version record points at the current blob.
    pub fn with_metadata(
        &self,
        changes: &MetadataChanges,
        note: Option<NonEmptyText>,
        actor: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationErrors> {
        let metadata = self.metadata.changed(changes)?;
        let size = self.current_version().map(|v| v.size).unwrap_or_default();
        let mut next = self.touched(now);
        next.versions.push(DocumentVersion {
            version: metadata.version,
            path: self.current_path.clone(),
            checksum: self.security.checksum.clone(),
            size,
            created_by: actor.clone(),
            note,
            created_at: now,
        });
        next.metadata = metadata;
        Ok(next)
    }

    /// Record that the ciphertext and its key metadata are in place. Idempotent.
    pub fn with_encryption_confirmed(&self, now: DateTime<Utc>) -> CoreResult<Self> {
        if self.status != DocumentStatus::Uploading && self.security.encrypted {
            return Ok(self.clone());
        }
        let mut next = match self.status {
            DocumentStatus::Uploading => self.transitioned(DocumentStatus::Processing, now)?,
            _ => self.touched(now),
        };
        next.security.encrypted = true;
        next.security.algorithm = CIPHER_ALGORITHM.to_string();
        Ok(next)
    }

    /// Apply a scanner verdict. Idempotent; `Pending` leaves the document in `PROCESSING`.
    pub fn with_scan_result(&self, result: ScanResult, now: DateTime<Utc>) -> CoreResult<Self> {
        let target = match result {
            ScanResult::Pending => return Ok(self.clone()),
            ScanResult::Clean => DocumentStatus::Validated,
            ScanResult::Infected => DocumentStatus::FailedValidation,
        };
        if self.status == target && self.security.scan_result == result {
            return Ok(self.clone());
        }
        let mut next = self.transitioned(target, now)?;
        next.security.scan_result = result;
        next.security.scanned_at = Some(now);
        Ok(next)
    }

    pub fn archived(&self, now: DateTime<Utc>) -> CoreResult<Self> {
        if self.status == DocumentStatus::Archived {
            return Ok(self.clone());
        }
        self.transitioned(DocumentStatus::Archived, now)
    }

    pub(crate) fn reassigned(&self, patient_id: &PatientId, now: DateTime<Utc>) -> Self {
        Self {
            patient_id: patient_id.clone(),
            ..self.touched(now)
        }
    }

    pub fn is_accessible(&self) -> bool {
        self.status == DocumentStatus::Validated
            && self.security.encrypted
            && self.security.scan_result == ScanResult::Clean
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .retention_years
            .and_then(|years| self.uploaded_at.checked_add_months(Months::new(years * 12)))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now > at)
    }

    pub fn should_be_archived_at(&self, now: DateTime<Utc>) -> bool {
        self.status == DocumentStatus::Archived || self.is_expired_at(now)
    }

    pub fn version(&self, number: u32) -> Option<&DocumentVersion> {
        self.versions.iter().find(|v| v.version == number)
    }

    pub fn current_version(&self) -> Option<&DocumentVersion> {
        self.versions.last()
    }

    /// Distinct blob paths referenced by the version history.
    pub fn blob_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = Vec::new();
        for v in &self.versions {
            if !paths.contains(&v.path.as_str()) {
                paths.push(&v.path);
            }
        }
        paths
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn patient_id(&self) -> &PatientId {
        &self.patient_id
    }

    pub fn file_name(&self) -> &str {
        self.file_name.as_str()
    }

    pub fn file_kind(&self) -> FileKind {
        self.file_kind
    }

    pub fn metadata(&self) -> &DocumentMetadata {
        &self.metadata
    }

    pub fn security(&self) -> &SecurityInfo {
        &self.security
    }

    pub fn status(&self) -> DocumentStatus {
        self.status
    }

    pub fn current_path(&self) -> &str {
        &self.current_path
    }

    pub fn versions(&self) -> &[DocumentVersion] {
        &self.versions
    }

    pub fn uploaded_by(&self) -> &UserId {
        &self.uploaded_by
    }

    pub fn uploaded_at(&self) -> DateTime<Utc> {
        self.uploaded_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// Key metadata for one sealed blob. Stored apart from the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionEntry {
    pub path: String,
    pub algorithm: String,
    pub kdf: String,
    /// Salt the data key was derived with: the owning patient's id at write time.
    pub key_salt: String,
    pub nonce: String,
    pub tag: String,
    pub created_at: DateTime<Utc>,
}

/// All encryption metadata for one document, keyed by document id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentEncryption {
    pub document_id: DocumentId,
    pub entries: Vec<EncryptionEntry>,
}

impl DocumentEncryption {
    pub fn new(document_id: DocumentId) -> Self {
        Self {
            document_id,
            entries: Vec::new(),
        }
    }

    pub fn entry_for(&self, path: &str) -> Option<&EncryptionEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn with_entry(&self, entry: EncryptionEntry) -> Self {
        let mut next = self.clone();
        next.entries.retain(|e| e.path != entry.path);
        next.entries.push(entry);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use vault_files::sha256_digest;

    fn pdf_bytes(len: usize) -> Vec<u8> {
        let mut bytes = b"%PDF-1.4\n".to_vec();
        bytes.resize(len, b' ');
        bytes
    }

    fn metadata() -> DocumentMetadata {
        DocumentMetadata::new(&DocumentMetadataInput {
            title: "Lab panel".into(),
            document_type: "lab_result".into(),
            tags: vec!["Blood".into(), "blood".into()],
            retention_years: Some(5),
            ..DocumentMetadataInput::default()
        })
        .unwrap()
    }

    fn stored(path: &str, content: &[u8]) -> StoredVersion {
        StoredVersion {
            path: path.into(),
            checksum: sha256_digest(content),
            size: content.len() as u64,
            note: None,
        }
    }

    fn uploaded(now: DateTime<Utc>) -> Document {
        let patient = PatientId::new();
        let id = DocumentId::new();
        let path = blob_path_for(&patient, &id, 1);
        Document::uploaded(
            id,
            patient,
            NonEmptyText::new("panel.pdf").unwrap(),
            FileKind::Pdf,
            metadata(),
            stored(&path, b"v1"),
            &UserId::new(),
            now,
        )
    }

    #[test]
    fn test_upload_validation_reports_every_rule() {
        let file = UploadFile::new("payload.exe", "application/x-msdownload", vec![]);
        let errors = file.validate(1024).unwrap_err();
        assert!(errors.has("media_type", RuleCode::DisallowedFileType));
        assert!(errors.has("size", RuleCode::EmptyFile));

        let big = UploadFile::new("scan.pdf", "application/pdf", pdf_bytes(2048));
        let errors = big.validate(1024).unwrap_err();
        assert!(errors.has("size", RuleCode::FileTooLarge));

        let wrong_ext = UploadFile::new("scan.png", "application/pdf", pdf_bytes(64));
        assert!(wrong_ext
            .validate(1024)
            .unwrap_err()
            .has("file_name", RuleCode::DisallowedFileType));
    }

    #[test]
    fn test_upload_validation_sniffs_content() {
        let mut zip = b"PK\x03\x04".to_vec();
        zip.resize(64, 0);
        let disguised = UploadFile::new("notes.txt", "text/plain", zip.clone());
        assert!(disguised
            .validate(1024)
            .unwrap_err()
            .has("content", RuleCode::ContentMismatch));

        let docx = UploadFile::new(
            "report.docx",
            FileKind::Docx.media_type(),
            zip,
        );
        assert!(docx.validate(1024).is_ok());

        let pdf = UploadFile::new("scan.PDF", "application/pdf", pdf_bytes(64));
        assert_eq!(pdf.validate(1024).unwrap().1, FileKind::Pdf);
    }

    #[test]
    fn test_metadata_rules() {
        let errors = DocumentMetadata::new(&DocumentMetadataInput {
            title: "t".repeat(201),
            document_type: "selfie".into(),
            tags: (0..21).map(|i| format!("tag{i}")).collect(),
            retention_years: Some(0),
            ..DocumentMetadataInput::default()
        })
        .unwrap_err();
        assert!(errors.has("title", RuleCode::TooLong));
        assert!(errors.has("document_type", RuleCode::InvalidValue));
        assert!(errors.has("tags", RuleCode::TooLong));
        assert!(errors.has("retention_years", RuleCode::OutOfRange));

        let meta = metadata();
        assert_eq!(meta.version(), 1);
        assert_eq!(meta.tags().collect::<Vec<_>>(), vec!["blood"]);
    }

    #[test]
    fn test_status_machine() {
        use DocumentStatus::*;
        assert!(Uploading.can_transition_to(Processing));
        assert!(!Uploading.can_transition_to(Validated));
        assert!(Processing.can_transition_to(FailedValidation));
        assert!(Validated.can_transition_to(Archived));
        assert!(!Archived.can_transition_to(Validated));
        assert_eq!(
            serde_yaml::to_string(&FailedValidation).unwrap().trim(),
            "FAILED_VALIDATION"
        );
    }

    #[test]
    fn test_pipeline_steps_and_accessibility() {
        let now = Utc::now();
        let doc = uploaded(now);
        assert!(!doc.is_accessible());
        assert!(doc.with_scan_result(ScanResult::Clean, now).is_err());

        let processing = doc.with_encryption_confirmed(now).unwrap();
        assert_eq!(processing.status(), DocumentStatus::Processing);
        assert_eq!(processing.with_encryption_confirmed(now).unwrap(), processing);

        let pending = processing.with_scan_result(ScanResult::Pending, now).unwrap();
        assert_eq!(pending.status(), DocumentStatus::Processing);

        let clean = processing.with_scan_result(ScanResult::Clean, now).unwrap();
        assert!(clean.is_accessible());
        assert_eq!(clean.with_scan_result(ScanResult::Clean, now).unwrap(), clean);

        let infected = processing.with_scan_result(ScanResult::Infected, now).unwrap();
        assert_eq!(infected.status(), DocumentStatus::FailedValidation);
        assert!(!infected.is_accessible());
    }

    #[test]
    fn test_versions_accumulate() {
        let now = Utc::now();
        let doc = uploaded(now);
        let v2 = doc
            .with_metadata(
                &MetadataChanges {
                    title: Some("Lab panel (corrected)".into()),
                    ..MetadataChanges::default()
                },
                None,
                &UserId::new(),
                now,
            )
            .unwrap();
        assert_eq!(v2.metadata().version(), 2);
        assert_eq!(v2.versions().len(), 2);
        assert_eq!(v2.version(2).unwrap().path, doc.current_path());

        let path3 = blob_path_for(v2.patient_id(), v2.id(), 3);
        let v3 = v2
            .with_new_version(
                NonEmptyText::new("panel-v3.pdf").unwrap(),
                FileKind::Pdf,
                stored(&path3, b"v3"),
                &UserId::new(),
                now,
            )
            .unwrap();
        assert_eq!(v3.metadata().version(), 3);
        assert_eq!(v3.current_path(), path3);
        assert_eq!(v3.version(1).unwrap().checksum, sha256_digest(b"v1"));
        assert_eq!(v3.blob_paths().len(), 2);
    }

    #[test]
    fn test_expiry_and_archival_flag() {
        let now = Utc::now();
        let doc = uploaded(now);
        assert_eq!(doc.metadata().retention_years(), Some(5));
        assert!(!doc.is_expired_at(now + Duration::days(365)));
        assert!(doc.should_be_archived_at(now + Duration::days(366 * 5 + 2)));
    }

    #[test]
    fn test_blob_path_embeds_document_id() {
        let patient = PatientId::new();
        let doc = DocumentId::new();
        let path = blob_path_for(&patient, &doc, 4);
        assert!(path.ends_with("/v4.enc"));
        assert_eq!(document_id_from_path(&path).unwrap(), doc);
        assert!(document_id_from_path("elsewhere/x").is_err());
    }
}

//! End-to-end behaviour of a vault on a temporary directory.

use chrono::{Duration, Months, NaiveDate, Utc};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use vault_core::collaborators::StaticTenantDirectory;
use vault_core::config::{AuditSettings, CoreConfig, DocumentSettings, KdfSettings};
use vault_core::crypto::{MasterKey, StaticKeyProvider};
use vault_core::domain::audit::{AccessResult, AuditFilter, NewAuditEntry, AUDIT_PURGE_OPERATION};
use vault_core::domain::document::{DocumentMetadataInput, MetadataChanges, UploadFile};
use vault_core::domain::patient::{
    Confidence, DuplicateCandidate, MatchedField, NewPatient, PatientStatus,
};
use vault_core::ids::{PatientId, UserId};
use vault_core::{Collaborators, CoreError, RuleCode, Vault};
use vault_files::BlobPath;

struct Fixture {
    _temp: TempDir,
    vault: Vault,
    physician: UserId,
    admin: UserId,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let kdf = KdfSettings {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    };
    let cfg = Arc::new(
        CoreConfig::new(
            temp.path().to_path_buf(),
            AuditSettings::default(),
            DocumentSettings::default(),
            kdf,
        )
        .unwrap(),
    );
    let physician = UserId::new();
    let admin = UserId::new();
    let tenants = StaticTenantDirectory::new(Some("clinic".into()))
        .with_member(physician.clone(), "clinic", "physician")
        .with_member(admin.clone(), "clinic", "admin");
    let keys = StaticKeyProvider::new(MasterKey::from_bytes([7u8; 32]));
    let collaborators = Collaborators::local(&cfg, Arc::new(keys), Arc::new(tenants)).unwrap();
    let vault = Vault::open(cfg, collaborators).unwrap();
    Fixture {
        _temp: temp,
        vault,
        physician,
        admin,
    }
}

fn register(f: &Fixture, name: &str) -> PatientId {
    f.vault
        .patients()
        .register(
            &NewPatient::new(name, NaiveDate::from_ymd_opt(1984, 4, 4).unwrap(), "female"),
            &f.physician,
        )
        .unwrap()
        .id()
        .clone()
}

fn pdf(len: usize) -> Vec<u8> {
    let mut bytes = b"%PDF-1.5\n".to_vec();
    bytes.resize(len, b'0');
    bytes
}

fn lab_result() -> DocumentMetadataInput {
    DocumentMetadataInput {
        title: "Blood panel".into(),
        document_type: "lab_result".into(),
        ..DocumentMetadataInput::default()
    }
}

#[test]
fn duplicate_cpf_is_reported_with_high_confidence() {
    let f = fixture();
    let joao = f
        .vault
        .patients()
        .register(
            &NewPatient::new(
                "João Silva Santos",
                NaiveDate::from_ymd_opt(1990, 5, 15).unwrap(),
                "male",
            )
            .with_cpf("111.444.777-35"),
            &f.physician,
        )
        .unwrap();

    let check = f
        .vault
        .patients()
        .find_duplicates(&DuplicateCandidate {
            full_name: "Marcos Oliveira".into(),
            birth_date: NaiveDate::from_ymd_opt(1975, 12, 1).unwrap(),
            cpf: Some("11144477735".into()),
        })
        .unwrap();

    assert!(check.is_duplicate);
    assert_eq!(check.confidence, Confidence::High);
    assert_eq!(&check.matches[0].patient_id, joao.id());
    assert!(check.matched_fields().any(|m| *m == MatchedField::Cpf));
}

#[test]
fn oversized_pdf_is_rejected_without_persisting_anything() {
    let f = fixture();
    let patient = register(&f, "Beatriz Costa");
    let file = UploadFile::new("scan.pdf", "application/pdf", pdf(60 * 1024 * 1024));

    match f.vault.documents().upload(&patient, &file, &lab_result(), &f.physician) {
        Err(CoreError::Validation(errors)) => assert!(errors.has("size", RuleCode::FileTooLarge)),
        other => panic!("expected a validation failure, got {other:?}"),
    }
    assert_eq!(f.vault.repositories().counts().unwrap().documents, 0);
    assert!(f.vault.documents().list_patient_documents(&patient).unwrap().is_empty());
}

#[test]
fn discharged_patient_cannot_go_on_hold() {
    let f = fixture();
    let patient = register(&f, "Caio Nunes");
    let status = f.vault.status();
    status.change_status(&patient, PatientStatus::Active, "intake", &f.physician).unwrap();
    status.change_status(&patient, PatientStatus::Discharged, "completed", &f.physician).unwrap();
    let ledger = status.history(&patient, &f.physician).unwrap();

    let result = status.change_status(&patient, PatientStatus::OnHold, "pause", &f.physician);
    assert!(matches!(result, Err(CoreError::InvalidTransition { .. })));
    assert_eq!(
        f.vault.patients().get(&patient).unwrap().status(),
        PatientStatus::Discharged
    );
    assert_eq!(status.history(&patient, &f.physician).unwrap(), ledger);
}

#[test]
fn erasure_leaves_no_orphans_and_spares_other_patients() {
    let f = fixture();
    let doomed = register(&f, "Diego Ramos");
    let kept = register(&f, "Elisa Rocha");
    for patient in [&doomed, &kept] {
        f.vault.records().create_medical_record(patient, &f.physician).unwrap();
        f.vault
            .documents()
            .upload(
                patient,
                &UploadFile::new("panel.pdf", "application/pdf", pdf(1024)),
                &lab_result(),
                &f.physician,
            )
            .unwrap();
    }
    let doomed_blob = f.vault.documents().list_patient_documents(&doomed).unwrap()[0]
        .current_path()
        .to_string();

    let report = f
        .vault
        .compliance()
        .erase_patient_data(&doomed, &f.physician, "patient request")
        .unwrap();
    assert_eq!(report.medical_records, 1);
    assert_eq!(report.documents, 1);
    assert_eq!(report.blobs, 1);

    assert!(f.vault.integrity().find_orphans().unwrap().is_clean());
    assert!(!f
        .vault
        .repositories()
        .blobs()
        .exists(&BlobPath::new(&doomed_blob).unwrap())
        .unwrap());
    assert_eq!(f.vault.records().records_for(&kept, &f.physician).unwrap().len(), 1);
    assert_eq!(f.vault.documents().list_patient_documents(&kept).unwrap().len(), 1);
    assert!(f.vault.integrity().health_check().unwrap().ok);
}

#[test]
fn every_metadata_version_stays_retrievable() {
    let f = fixture();
    let patient = register(&f, "Fábio Teixeira");
    let bytes = pdf(4096);
    let document = f
        .vault
        .documents()
        .upload(
            &patient,
            &UploadFile::new("panel.pdf", "application/pdf", bytes.clone()),
            &lab_result(),
            &f.physician,
        )
        .unwrap();
    f.vault.pipeline().process(document.id()).unwrap();

    const K: u32 = 4;
    for k in 0..K {
        let changes = MetadataChanges {
            tags: Some(vec![format!("review-{k}")]),
            ..MetadataChanges::default()
        };
        f.vault
            .documents()
            .update_document_metadata(document.id(), &changes, 1 + k, &f.physician)
            .unwrap();
    }

    let current = f.vault.documents().get(document.id()).unwrap();
    assert_eq!(current.metadata().version(), 1 + K);
    for n in 1..=1 + K {
        let retrieved = f
            .vault
            .documents()
            .retrieve_document(document.id(), Some(n), &f.physician)
            .unwrap();
        assert_eq!(retrieved.version, n);
        assert_eq!(retrieved.bytes, bytes);
        assert_eq!(current.version(n).unwrap().checksum, document.security().checksum);
    }
}

#[test]
fn purge_removes_only_entries_past_retention() {
    let f = fixture();
    let audit = f.vault.audit();
    let now = Utc::now();
    let cutoff = now.checked_sub_months(Months::new(7 * 12)).unwrap();
    for at in [
        cutoff - Duration::days(30),
        cutoff - Duration::days(1),
        cutoff + Duration::days(1),
        now - Duration::days(10),
    ] {
        audit
            .log_data_access(
                NewAuditEntry::new(&f.physician, "read", "medical_record", AccessResult::Granted).at(at),
            )
            .unwrap();
    }

    let deleted = audit.purge_old_logs(&f.admin, Some(7)).unwrap();
    assert_eq!(deleted, 2);

    let all = AuditFilter {
        limit: 1000,
        ..AuditFilter::default()
    };
    let page = audit.query(&f.admin, &all).unwrap();
    assert!(page.items.iter().all(|e| e.timestamp >= cutoff));
    let purges = page
        .items
        .iter()
        .filter(|e| e.operation == AUDIT_PURGE_OPERATION)
        .count();
    assert_eq!(purges, 1);
}

#[test]
fn dependent_creation_racing_erasure_never_orphans() {
    for _ in 0..5 {
        let f = Arc::new(fixture());
        let patient = register(&f, "Gabriela Alves");

        let creator = {
            let (f, patient) = (f.clone(), patient.clone());
            thread::spawn(move || {
                let mut created = 0;
                for _ in 0..20 {
                    match f.vault.records().create_medical_record(&patient, &f.physician) {
                        Ok(_) => created += 1,
                        Err(CoreError::ReferentialIntegrity { .. }) => break,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                created
            })
        };
        let eraser = {
            let (f, patient) = (f.clone(), patient.clone());
            thread::spawn(move || {
                f.vault
                    .compliance()
                    .erase_patient_data(&patient, &UserId::system(), "race")
                    .unwrap()
            })
        };

        creator.join().unwrap();
        eraser.join().unwrap();
        assert!(f.vault.integrity().find_orphans().unwrap().is_clean());
        assert_eq!(f.vault.repositories().counts().unwrap().medical_records, 0);
    }
}

//! Medical record aggregate and its clinical value objects.

use super::{date_not_in_future, instant_not_in_future, optional_text, parse_enum, required_text};
use crate::error::{RuleCode, ValidationErrors};
use crate::ids::{MedicalRecordId, PatientId, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use vault_types::NonEmptyText;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Mild,
    Moderate,
    Severe,
    Critical,
}

impl Severity {
    const VARIANTS: &'static [(&'static str, Severity)] = &[
        ("mild", Severity::Mild),
        ("moderate", Severity::Moderate),
        ("severe", Severity::Severe),
        ("critical", Severity::Critical),
    ];

    pub fn parse(field: &str, input: &str) -> Result<Self, ValidationErrors> {
        parse_enum(field, input, Self::VARIANTS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteCategory {
    Session,
    Evaluation,
    Observation,
    Discharge,
    Other,
}

impl NoteCategory {
    const VARIANTS: &'static [(&'static str, NoteCategory)] = &[
        ("session", NoteCategory::Session),
        ("evaluation", NoteCategory::Evaluation),
        ("observation", NoteCategory::Observation),
        ("discharge", NoteCategory::Discharge),
        ("other", NoteCategory::Other),
    ];

    pub fn parse(field: &str, input: &str) -> Result<Self, ValidationErrors> {
        parse_enum(field, input, Self::VARIANTS)
    }
}

/// ICD-10 shape: a letter, two digits, then optionally `.` and one to four alphanumerics.
fn icd10_code(field: &str, input: &str) -> Result<String, ValidationErrors> {
    let code = input.trim().to_ascii_uppercase();
    if code.is_empty() {
        return Err(ValidationErrors::single(field, RuleCode::Required, format!("{field} is required")));
    }
    let bytes = code.as_bytes();
    let head_ok = bytes.len() >= 3
        && bytes[0].is_ascii_uppercase()
        && bytes[1].is_ascii_digit()
        && bytes[2].is_ascii_alphanumeric();
    let tail_ok = match code.get(3..) {
        Some("") => true,
        Some(rest) => match rest.strip_prefix('.') {
            Some(sub) => (1..=4).contains(&sub.len()) && sub.bytes().all(|b| b.is_ascii_alphanumeric()),
            None => false,
        },
        None => false,
    };
    if !(head_ok && tail_ok) {
        return Err(ValidationErrors::single(
            field,
            RuleCode::InvalidFormat,
            format!("{field} must look like an ICD-10 code (e.g. F32.1)"),
        ));
    }
    Ok(code)
}

fn end_not_before_start(
    errors: &mut ValidationErrors,
    field: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) {
    if let (Some(start), Some(end)) = (start, end) {
        if end < start {
            errors.push(field, RuleCode::DateOrder, format!("{field} must not be before the start date"));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisInput {
    pub code: String,
    pub description: String,
    pub severity: String,
    pub diagnosed_on: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    code: String,
    description: NonEmptyText,
    severity: Severity,
    diagnosed_on: NaiveDate,
    recorded_by: UserId,
}

impl Diagnosis {
    pub fn new(input: &DiagnosisInput, actor: &UserId) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let code = errors.collect(icd10_code("code", &input.code));
        let description = errors.collect(required_text("description", &input.description, 500));
        let severity = errors.collect(Severity::parse("severity", &input.severity));
        let diagnosed_on = errors.collect(date_not_in_future("diagnosed_on", input.diagnosed_on));

        match (code, description, severity, diagnosed_on) {
            (Some(code), Some(description), Some(severity), Some(diagnosed_on)) => Ok(Self {
                code,
                description,
                severity,
                diagnosed_on,
                recorded_by: actor.clone(),
            }),
            _ => Err(errors),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn description(&self) -> &str {
        self.description.as_str()
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn diagnosed_on(&self) -> NaiveDate {
        self.diagnosed_on
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicationInput {
    pub name: String,
    pub dosage: String,
    pub frequency: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Medication {
    name: NonEmptyText,
    dosage: NonEmptyText,
    frequency: NonEmptyText,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    prescribed_by: UserId,
}

impl Medication {
    pub fn new(input: &MedicationInput, actor: &UserId) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let name = errors.collect(required_text("name", &input.name, 200));
        let dosage = errors.collect(required_text("dosage", &input.dosage, 100));
        let frequency = errors.collect(required_text("frequency", &input.frequency, 100));
        let start_date = errors.collect(date_not_in_future("start_date", input.start_date));
        end_not_before_start(&mut errors, "end_date", start_date, input.end_date);

        match (name, dosage, frequency, start_date) {
            (Some(name), Some(dosage), Some(frequency), Some(start_date)) if errors.is_empty() => {
                Ok(Self {
                    name,
                    dosage,
                    frequency,
                    start_date,
                    end_date: input.end_date,
                    prescribed_by: actor.clone(),
                })
            }
            _ => Err(errors),
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start_date
    }

    pub fn end_date(&self) -> Option<NaiveDate> {
        self.end_date
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllergyInput {
    pub substance: String,
    pub reaction: Option<String>,
    pub severity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allergy {
    substance: NonEmptyText,
    reaction: Option<NonEmptyText>,
    severity: Severity,
    recorded_at: DateTime<Utc>,
}

impl Allergy {
    pub fn new(input: &AllergyInput, now: DateTime<Utc>) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let substance = errors.collect(required_text("substance", &input.substance, 200));
        let reaction = errors.collect(optional_text("reaction", input.reaction.as_deref(), 500));
        let severity = errors.collect(Severity::parse("severity", &input.severity));

        match (substance, reaction, severity) {
            (Some(substance), Some(reaction), Some(severity)) => Ok(Self {
                substance,
                reaction,
                severity,
                recorded_at: now,
            }),
            _ => Err(errors),
        }
    }

    pub fn substance(&self) -> &str {
        self.substance.as_str()
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressNoteInput {
    pub content: String,
    pub category: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressNote {
    content: NonEmptyText,
    category: NoteCategory,
    recorded_at: DateTime<Utc>,
    author: UserId,
}

impl ProgressNote {
    pub const MAX_CONTENT: usize = 10_000;

    pub fn new(input: &ProgressNoteInput, author: &UserId) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let content = errors.collect(required_text("content", &input.content, Self::MAX_CONTENT));
        let category = errors.collect(NoteCategory::parse("category", &input.category));
        let recorded_at = errors.collect(instant_not_in_future("recorded_at", input.recorded_at));

        match (content, category, recorded_at) {
            (Some(content), Some(category), Some(recorded_at)) => Ok(Self {
                content,
                category,
                recorded_at,
                author: author.clone(),
            }),
            _ => Err(errors),
        }
    }

    pub fn content(&self) -> &str {
        self.content.as_str()
    }

    pub fn category(&self) -> NoteCategory {
        self.category
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn author(&self) -> &UserId {
        &self.author
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentInput {
    pub instrument: String,
    pub score: Option<u32>,
    pub summary: String,
    pub assessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assessment {
    instrument: NonEmptyText,
    score: Option<u32>,
    summary: NonEmptyText,
    assessed_at: DateTime<Utc>,
    assessed_by: UserId,
}

impl Assessment {
    pub const MAX_SCORE: u32 = 1000;

    pub fn new(input: &AssessmentInput, actor: &UserId) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let instrument = errors.collect(required_text("instrument", &input.instrument, 200));
        let summary = errors.collect(required_text("summary", &input.summary, 2000));
        let assessed_at = errors.collect(instant_not_in_future("assessed_at", input.assessed_at));
        if input.score.is_some_and(|s| s > Self::MAX_SCORE) {
            errors.push(
                "score",
                RuleCode::OutOfRange,
                format!("score must be between 0 and {}", Self::MAX_SCORE),
            );
        }

        match (instrument, summary, assessed_at) {
            (Some(instrument), Some(summary), Some(assessed_at)) if errors.is_empty() => Ok(Self {
                instrument,
                score: input.score,
                summary,
                assessed_at,
                assessed_by: actor.clone(),
            }),
            _ => Err(errors),
        }
    }

    pub fn instrument(&self) -> &str {
        self.instrument.as_str()
    }

    pub fn score(&self) -> Option<u32> {
        self.score
    }

    pub fn assessed_at(&self) -> DateTime<Utc> {
        self.assessed_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentInput {
    pub description: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub outcome: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreatmentEntry {
    description: NonEmptyText,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    outcome: Option<NonEmptyText>,
}

impl TreatmentEntry {
    pub fn new(input: &TreatmentInput) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let description = errors.collect(required_text("description", &input.description, 1000));
        let start_date = errors.collect(date_not_in_future("start_date", input.start_date));
        let outcome = errors.collect(optional_text("outcome", input.outcome.as_deref(), 1000));
        end_not_before_start(&mut errors, "end_date", start_date, input.end_date);

        match (description, start_date, outcome) {
            (Some(description), Some(start_date), Some(outcome)) if errors.is_empty() => Ok(Self {
                description,
                start_date,
                end_date: input.end_date,
                outcome,
            }),
            _ => Err(errors),
        }
    }

    pub fn description(&self) -> &str {
        self.description.as_str()
    }

    pub fn start_date(&self) -> NaiveDate {
        self.start_date
    }
}

/// Clinical history of one patient. Collections only grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MedicalRecord {
    id: MedicalRecordId,
    patient_id: PatientId,
    #[serde(default)]
    diagnoses: Vec<Diagnosis>,
    #[serde(default)]
    medications: Vec<Medication>,
    #[serde(default)]
    allergies: Vec<Allergy>,
    #[serde(default)]
    progress_notes: Vec<ProgressNote>,
    #[serde(default)]
    assessments: Vec<Assessment>,
    #[serde(default)]
    treatment_history: Vec<TreatmentEntry>,
    created_by: UserId,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl MedicalRecord {
    pub fn new(patient_id: PatientId, actor: &UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: MedicalRecordId::new(),
            patient_id,
            diagnoses: Vec::new(),
            medications: Vec::new(),
            allergies: Vec::new(),
            progress_notes: Vec::new(),
            assessments: Vec::new(),
            treatment_history: Vec::new(),
            created_by: actor.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    fn touched(&self, now: DateTime<Utc>) -> Self {
        Self {
            updated_at: super::patient::next_timestamp(self.updated_at, now),
            ..self.clone()
        }
    }

    pub fn with_diagnosis(&self, diagnosis: Diagnosis, now: DateTime<Utc>) -> Self {
        let mut next = self.touched(now);
        next.diagnoses.push(diagnosis);
        next
    }

    pub fn with_medication(&self, medication: Medication, now: DateTime<Utc>) -> Self {
        let mut next = self.touched(now);
        next.medications.push(medication);
        next
    }

    pub fn with_allergy(&self, allergy: Allergy, now: DateTime<Utc>) -> Self {
        let mut next = self.touched(now);
        next.allergies.push(allergy);
        next
    }

    pub fn with_progress_note(&self, note: ProgressNote, now: DateTime<Utc>) -> Self {
        let mut next = self.touched(now);
        next.progress_notes.push(note);
        next
    }

    pub fn with_assessment(&self, assessment: Assessment, now: DateTime<Utc>) -> Self {
        let mut next = self.touched(now);
        next.assessments.push(assessment);
        next
    }

    pub fn with_treatment(&self, entry: TreatmentEntry, now: DateTime<Utc>) -> Self {
        let mut next = self.touched(now);
        next.treatment_history.push(entry);
        next
    }

    pub(crate) fn reassigned(&self, patient_id: &PatientId, now: DateTime<Utc>) -> Self {
        Self {
            patient_id: patient_id.clone(),
            ..self.touched(now)
        }
    }

    pub fn id(&self) -> &MedicalRecordId {
        &self.id
    }

    pub fn patient_id(&self) -> &PatientId {
        &self.patient_id
    }

    pub fn diagnoses(&self) -> &[Diagnosis] {
        &self.diagnoses
    }

    pub fn medications(&self) -> &[Medication] {
        &self.medications
    }

    pub fn allergies(&self) -> &[Allergy] {
        &self.allergies
    }

    pub fn progress_notes(&self) -> &[ProgressNote] {
        &self.progress_notes
    }

    pub fn assessments(&self) -> &[Assessment] {
        &self.assessments
    }

    pub fn treatment_history(&self) -> &[TreatmentEntry] {
        &self.treatment_history
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// One timeline event per clinical entry in this record.
    pub fn events(&self) -> Vec<TimelineEvent> {
        let start_of = |d: NaiveDate| d.and_time(chrono::NaiveTime::MIN).and_utc();
        let mut events = Vec::new();

        for d in &self.diagnoses {
            events.push(self.event(
                start_of(d.diagnosed_on),
                TimelineEventKind::Diagnosis,
                format!("{} ({:?})", d.code, d.severity).to_lowercase(),
            ));
        }
        for m in &self.medications {
            events.push(self.event(
                start_of(m.start_date),
                TimelineEventKind::MedicationStarted,
                m.name.as_str().to_string(),
            ));
        }
        for a in &self.allergies {
            events.push(self.event(
                a.recorded_at,
                TimelineEventKind::Allergy,
                a.substance.as_str().to_string(),
            ));
        }
        for n in &self.progress_notes {
            events.push(self.event(
                n.recorded_at,
                TimelineEventKind::ProgressNote,
                format!("{:?} note", n.category).to_lowercase(),
            ));
        }
        for a in &self.assessments {
            events.push(self.event(
                a.assessed_at,
                TimelineEventKind::Assessment,
                a.instrument.as_str().to_string(),
            ));
        }
        for t in &self.treatment_history {
            events.push(self.event(
                start_of(t.start_date),
                TimelineEventKind::Treatment,
                t.description.as_str().to_string(),
            ));
        }
        events
    }

    fn event(&self, at: DateTime<Utc>, kind: TimelineEventKind, summary: String) -> TimelineEvent {
        TimelineEvent {
            at,
            kind,
            summary,
            source_id: self.id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    Diagnosis,
    MedicationStarted,
    Allergy,
    ProgressNote,
    Assessment,
    Treatment,
    StatusChange,
    DocumentUploaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub at: DateTime<Utc>,
    pub kind: TimelineEventKind,
    pub summary: String,
    /// Id of the record, transition or document the event came from.
    pub source_id: String,
}

/// Sort events non-decreasing by time. Equal timestamps keep their input order.
pub fn build_timeline(mut events: Vec<TimelineEvent>) -> Vec<TimelineEvent> {
    events.sort_by_key(|e| e.at);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn diagnosis_input() -> DiagnosisInput {
        DiagnosisInput {
            code: "f32.1".into(),
            description: "Moderate depressive episode".into(),
            severity: "moderate".into(),
            diagnosed_on: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        }
    }

    #[test]
    fn test_diagnosis_validation() {
        let actor = UserId::new();
        let d = Diagnosis::new(&diagnosis_input(), &actor).unwrap();
        assert_eq!(d.code(), "F32.1");
        assert_eq!(d.severity(), Severity::Moderate);

        let bad = DiagnosisInput {
            code: "32F".into(),
            description: "x".repeat(501),
            severity: "fatal".into(),
            diagnosed_on: Utc::now().date_naive() + Duration::days(1),
        };
        let errors = Diagnosis::new(&bad, &actor).unwrap_err();
        assert!(errors.has("code", RuleCode::InvalidFormat));
        assert!(errors.has("description", RuleCode::TooLong));
        assert!(errors.has("severity", RuleCode::InvalidValue));
        assert!(errors.has("diagnosed_on", RuleCode::FutureDate));
    }

    #[test]
    fn test_icd10_shapes() {
        assert!(icd10_code("code", "F32").is_ok());
        assert!(icd10_code("code", "J45.909").is_ok());
        assert!(icd10_code("code", "F32.").is_err());
        assert!(icd10_code("code", "F32.12345").is_err());
        assert!(icd10_code("code", "F3").is_err());
    }

    #[test]
    fn test_medication_end_before_start() {
        let input = MedicationInput {
            name: "Sertraline".into(),
            dosage: "50mg".into(),
            frequency: "daily".into(),
            start_date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
            end_date: Some(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
        };
        let errors = Medication::new(&input, &UserId::new()).unwrap_err();
        assert!(errors.has("end_date", RuleCode::DateOrder));
    }

    #[test]
    fn test_note_and_assessment_bounds() {
        let author = UserId::new();
        let note = ProgressNoteInput {
            content: "x".repeat(ProgressNote::MAX_CONTENT + 1),
            category: "session".into(),
            recorded_at: Utc::now(),
        };
        assert!(ProgressNote::new(&note, &author)
            .unwrap_err()
            .has("content", RuleCode::TooLong));

        let assessment = AssessmentInput {
            instrument: "PHQ-9".into(),
            score: Some(1001),
            summary: "screening".into(),
            assessed_at: Utc::now(),
        };
        assert!(Assessment::new(&assessment, &author)
            .unwrap_err()
            .has("score", RuleCode::OutOfRange));
    }

    #[test]
    fn test_record_additions_return_new_values() {
        let now = Utc::now();
        let actor = UserId::new();
        let record = MedicalRecord::new(PatientId::new(), &actor, now);
        let with = record.with_diagnosis(Diagnosis::new(&diagnosis_input(), &actor).unwrap(), now);

        assert!(record.diagnoses().is_empty());
        assert_eq!(with.diagnoses().len(), 1);
        assert_eq!(with.id(), record.id());
        assert!(with.updated_at() > record.updated_at());
    }

    #[test]
    fn test_timeline_sorted_and_stable() {
        let base = Utc::now();
        let mk = |offset: i64, summary: &str| TimelineEvent {
            at: base + Duration::seconds(offset),
            kind: TimelineEventKind::ProgressNote,
            summary: summary.into(),
            source_id: "r".into(),
        };
        let events = vec![mk(5, "c"), mk(-3, "a"), mk(5, "d"), mk(0, "b"), mk(-3, "a2")];
        let timeline = build_timeline(events);

        let summaries: Vec<&str> = timeline.iter().map(|e| e.summary.as_str()).collect();
        assert_eq!(summaries, vec!["a", "a2", "b", "c", "d"]);
        assert!(timeline.windows(2).all(|w| w[0].at <= w[1].at));
    }
}

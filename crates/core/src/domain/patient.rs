//! Patient aggregate, its status state machine and duplicate matching.

use super::values::{
    AddressInput, Cpf, EmailAddress, EmergencyContact, EmergencyContactInput, Gender,
    InsuranceInfo, InsuranceInput, PersonName, PhoneNumber, PostalAddress, Rg,
};
use super::{date_not_in_future, parse_enum};
use crate::error::{RuleCode, ValidationErrors};
use crate::ids::{PatientId, UserId};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Finite patient status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatientStatus {
    New,
    Active,
    OnHold,
    Discharged,
    Inactive,
}

impl PatientStatus {
    pub const ALL: [PatientStatus; 5] = [
        PatientStatus::New,
        PatientStatus::Active,
        PatientStatus::OnHold,
        PatientStatus::Discharged,
        PatientStatus::Inactive,
    ];

    const VARIANTS: &'static [(&'static str, PatientStatus)] = &[
        ("new", PatientStatus::New),
        ("active", PatientStatus::Active),
        ("on_hold", PatientStatus::OnHold),
        ("discharged", PatientStatus::Discharged),
        ("inactive", PatientStatus::Inactive),
    ];

    pub fn parse(field: &str, input: &str) -> Result<Self, ValidationErrors> {
        parse_enum(field, input, Self::VARIANTS)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PatientStatus::New => "new",
            PatientStatus::Active => "active",
            PatientStatus::OnHold => "on_hold",
            PatientStatus::Discharged => "discharged",
            PatientStatus::Inactive => "inactive",
        }
    }

    /// The fixed adjacency table.
    pub fn allowed_targets(&self) -> &'static [PatientStatus] {
        use PatientStatus::*;
        match self {
            New => &[Active, Inactive],
            Active => &[OnHold, Discharged, Inactive],
            OnHold => &[Active, Discharged, Inactive],
            Discharged => &[Active],
            Inactive => &[Active],
        }
    }

    pub fn can_transition_to(&self, target: PatientStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, PatientStatus::Active)
    }

    pub fn can_schedule_appointment(&self) -> bool {
        matches!(
            self,
            PatientStatus::New | PatientStatus::Active | PatientStatus::OnHold
        )
    }
}

impl fmt::Display for PatientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalInfo {
    pub full_name: PersonName,
    pub birth_date: NaiveDate,
    pub gender: Gender,
    pub cpf: Option<Cpf>,
    pub rg: Option<Rg>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub phones: Vec<PhoneNumber>,
    pub email: Option<EmailAddress>,
    pub address: Option<PostalAddress>,
}

/// Registration input as supplied by the outer layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPatient {
    pub full_name: String,
    pub birth_date: NaiveDate,
    pub gender: String,
    pub cpf: Option<String>,
    pub rg: Option<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    pub email: Option<String>,
    pub address: Option<AddressInput>,
    pub emergency_contact: Option<EmergencyContactInput>,
    pub insurance: Option<InsuranceInput>,
}

impl NewPatient {
    /// Minimal input: name, birth date and gender.
    pub fn new(full_name: impl Into<String>, birth_date: NaiveDate, gender: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            birth_date,
            gender: gender.into(),
            cpf: None,
            rg: None,
            phones: Vec::new(),
            email: None,
            address: None,
            emergency_contact: None,
            insurance: None,
        }
    }

    pub fn with_cpf(mut self, cpf: impl Into<String>) -> Self {
        self.cpf = Some(cpf.into());
        self
    }
}

/// Replacement values for an update. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientUpdate {
    pub full_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub gender: Option<String>,
    pub cpf: Option<String>,
    pub rg: Option<String>,
    pub phones: Option<Vec<String>>,
    pub email: Option<String>,
    pub address: Option<AddressInput>,
    pub emergency_contact: Option<EmergencyContactInput>,
    pub insurance: Option<InsuranceInput>,
}

fn birth_date(field: &str, date: NaiveDate) -> Result<NaiveDate, ValidationErrors> {
    let date = date_not_in_future(field, date)?;
    let earliest = Utc::now().date_naive() - Duration::days(150 * 366);
    if date < earliest {
        return Err(ValidationErrors::single(
            field,
            RuleCode::OutOfRange,
            format!("{field} is more than 150 years ago"),
        ));
    }
    Ok(date)
}

fn phones(field: &str, inputs: &[String]) -> Result<Vec<PhoneNumber>, ValidationErrors> {
    let mut errors = ValidationErrors::new();
    let mut out = Vec::with_capacity(inputs.len());
    for (i, raw) in inputs.iter().enumerate() {
        if let Some(phone) = errors.collect(PhoneNumber::new(&format!("{field}[{i}]"), raw)) {
            if !out.contains(&phone) {
                out.push(phone);
            }
        }
    }
    errors.into_result()?;
    Ok(out)
}

/// Validate an optional nested value, re-rooting its field names under `prefix`.
fn nested<I, T>(
    errors: &mut ValidationErrors,
    prefix: &str,
    input: Option<&I>,
    build: impl FnOnce(&I) -> Result<T, ValidationErrors>,
) -> Option<Option<T>> {
    match input {
        None => Some(None),
        Some(input) => errors.collect_nested(prefix, build(input)).map(Some),
    }
}

/// A registered patient. Every change produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    id: PatientId,
    personal: PersonalInfo,
    contact: ContactInfo,
    emergency_contact: Option<EmergencyContact>,
    insurance: Option<InsuranceInfo>,
    status: PatientStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    created_by: UserId,
    deleted_at: Option<DateTime<Utc>>,
    deleted_by: Option<UserId>,
}

impl Patient {
    /// Validate registration input. Reports every violated rule.
    pub fn register(
        input: &NewPatient,
        actor: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();

        let full_name = errors.collect(PersonName::new("full_name", &input.full_name));
        let birth = errors.collect(birth_date("birth_date", input.birth_date));
        let gender = errors.collect(Gender::parse("gender", &input.gender));
        let cpf = match input.cpf.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            None => Some(None),
            Some(raw) => errors.collect(Cpf::new("cpf", raw)).map(Some),
        };
        let rg = match input.rg.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            None => Some(None),
            Some(raw) => errors.collect(Rg::new("rg", raw)).map(Some),
        };
        let phone_list = errors.collect(phones("contact.phones", &input.phones));
        let email = match input.email.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            None => Some(None),
            Some(raw) => errors.collect(EmailAddress::new("contact.email", raw)).map(Some),
        };
        let address = nested(&mut errors, "contact.address", input.address.as_ref(), PostalAddress::new);
        let emergency = nested(
            &mut errors,
            "emergency_contact",
            input.emergency_contact.as_ref(),
            EmergencyContact::new,
        );
        let insurance = nested(&mut errors, "insurance", input.insurance.as_ref(), InsuranceInfo::new);

        match (
            full_name, birth, gender, cpf, rg, phone_list, email, address, emergency, insurance,
        ) {
            (
                Some(full_name),
                Some(birth_date),
                Some(gender),
                Some(cpf),
                Some(rg),
                Some(phones),
                Some(email),
                Some(address),
                Some(emergency_contact),
                Some(insurance),
            ) => Ok(Self {
                id: PatientId::new(),
                personal: PersonalInfo {
                    full_name,
                    birth_date,
                    gender,
                    cpf,
                    rg,
                },
                contact: ContactInfo {
                    phones,
                    email,
                    address,
                },
                emergency_contact,
                insurance,
                status: PatientStatus::New,
                created_at: now,
                updated_at: now,
                created_by: actor.clone(),
                deleted_at: None,
                deleted_by: None,
            }),
            _ => Err(errors),
        }
    }

    /// Apply `update`, revalidating only the replaced fields.
    pub fn updated(&self, update: &PatientUpdate, now: DateTime<Utc>) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let mut next = self.clone();

        if let Some(raw) = &update.full_name {
            if let Some(v) = errors.collect(PersonName::new("full_name", raw)) {
                next.personal.full_name = v;
            }
        }
        if let Some(date) = update.birth_date {
            if let Some(v) = errors.collect(birth_date("birth_date", date)) {
                next.personal.birth_date = v;
            }
        }
        if let Some(raw) = &update.gender {
            if let Some(v) = errors.collect(Gender::parse("gender", raw)) {
                next.personal.gender = v;
            }
        }
        if let Some(raw) = &update.cpf {
            if let Some(v) = errors.collect(Cpf::new("cpf", raw)) {
                next.personal.cpf = Some(v);
            }
        }
        if let Some(raw) = &update.rg {
            if let Some(v) = errors.collect(Rg::new("rg", raw)) {
                next.personal.rg = Some(v);
            }
        }
        if let Some(list) = &update.phones {
            if let Some(v) = errors.collect(phones("contact.phones", list)) {
                next.contact.phones = v;
            }
        }
        if let Some(raw) = &update.email {
            if let Some(v) = errors.collect(EmailAddress::new("contact.email", raw)) {
                next.contact.email = Some(v);
            }
        }
        if let Some(Some(v)) = nested(&mut errors, "contact.address", update.address.as_ref(), PostalAddress::new) {
            next.contact.address = Some(v);
        }
        if let Some(Some(v)) = nested(
            &mut errors,
            "emergency_contact",
            update.emergency_contact.as_ref(),
            EmergencyContact::new,
        ) {
            next.emergency_contact = Some(v);
        }
        if let Some(Some(v)) = nested(&mut errors, "insurance", update.insurance.as_ref(), InsuranceInfo::new) {
            next.insurance = Some(v);
        }

        errors.into_result()?;
        next.updated_at = next_timestamp(self.updated_at, now);
        Ok(next)
    }

    /// New value carrying `status`. Callers validate the transition first.
    pub(crate) fn with_status(&self, status: PatientStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            updated_at: next_timestamp(self.updated_at, now),
            ..self.clone()
        }
    }

    pub(crate) fn soft_deleted(&self, actor: &UserId, now: DateTime<Utc>) -> Self {
        Self {
            deleted_at: Some(now),
            deleted_by: Some(actor.clone()),
            updated_at: next_timestamp(self.updated_at, now),
            ..self.clone()
        }
    }

    /// Unified patient built from `self` (primary) and `duplicate`, keeping the primary's id.
    pub fn merged(&self, duplicate: &Patient, strategy: &MergeStrategy, now: DateTime<Utc>) -> Self {
        let pick = |source: FieldSource| match source {
            FieldSource::Primary => self,
            FieldSource::Duplicate => duplicate,
        };
        let pick_opt = |source: FieldSource, get: fn(&Patient) -> bool| {
            let preferred = pick(source);
            if get(preferred) {
                preferred
            } else if std::ptr::eq(preferred, self) {
                duplicate
            } else {
                self
            }
        };

        let mut contact = pick(strategy.contact).contact.clone();
        let other = if std::ptr::eq(pick(strategy.contact), self) {
            &duplicate.contact
        } else {
            &self.contact
        };
        for phone in &other.phones {
            if !contact.phones.contains(phone) {
                contact.phones.push(phone.clone());
            }
        }
        if contact.email.is_none() {
            contact.email = other.email.clone();
        }
        if contact.address.is_none() {
            contact.address = other.address.clone();
        }

        Self {
            id: self.id.clone(),
            personal: PersonalInfo {
                full_name: pick(strategy.full_name).personal.full_name.clone(),
                birth_date: pick(strategy.birth_date).personal.birth_date,
                gender: pick(strategy.gender).personal.gender,
                cpf: pick_opt(strategy.cpf, |p| p.personal.cpf.is_some()).personal.cpf.clone(),
                rg: pick_opt(strategy.rg, |p| p.personal.rg.is_some()).personal.rg.clone(),
            },
            contact,
            emergency_contact: pick_opt(strategy.emergency_contact, |p| p.emergency_contact.is_some())
                .emergency_contact
                .clone(),
            insurance: pick_opt(strategy.insurance, |p| p.insurance.is_some())
                .insurance
                .clone(),
            status: self.status,
            created_at: self.created_at.min(duplicate.created_at),
            updated_at: next_timestamp(self.updated_at, now),
            created_by: self.created_by.clone(),
            deleted_at: None,
            deleted_by: None,
        }
    }

    /// Match against a candidate. `None` means not a duplicate.
    pub fn duplicate_match(&self, candidate: &DuplicateCandidate) -> Option<Vec<MatchedField>> {
        let cpf_match = match (&self.personal.cpf, candidate.cpf.as_deref()) {
            (Some(ours), Some(theirs)) => Cpf::new("cpf", theirs).is_ok_and(|c| &c == ours),
            _ => false,
        };
        let name_match = self.personal.full_name.matches_ignoring_case(&candidate.full_name);
        let birth_match = self.personal.birth_date == candidate.birth_date;

        let mut fields = Vec::new();
        if cpf_match {
            fields.push(MatchedField::Cpf);
        }
        if name_match && birth_match {
            fields.push(MatchedField::FullName);
            fields.push(MatchedField::BirthDate);
        }
        if fields.is_empty() {
            None
        } else {
            Some(fields)
        }
    }

    pub fn id(&self) -> &PatientId {
        &self.id
    }

    pub fn personal(&self) -> &PersonalInfo {
        &self.personal
    }

    pub fn full_name(&self) -> &PersonName {
        &self.personal.full_name
    }

    pub fn contact(&self) -> &ContactInfo {
        &self.contact
    }

    pub fn emergency_contact(&self) -> Option<&EmergencyContact> {
        self.emergency_contact.as_ref()
    }

    pub fn insurance(&self) -> Option<&InsuranceInfo> {
        self.insurance.as_ref()
    }

    pub fn status(&self) -> PatientStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn created_by(&self) -> &UserId {
        &self.created_by
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    pub fn deleted_by(&self) -> Option<&UserId> {
        self.deleted_by.as_ref()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// `now`, nudged forward if the clock has not moved past `previous`.
///
/// `updated_at` doubles as the optimistic concurrency token, so it must change on every write.
pub(crate) fn next_timestamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    #[default]
    Primary,
    Duplicate,
}

/// Per-field choice of which patient wins a merge.
///
/// Optional fields fall back to the other patient when the chosen one has no value. Phone numbers
/// are unioned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeStrategy {
    pub full_name: FieldSource,
    pub birth_date: FieldSource,
    pub gender: FieldSource,
    pub cpf: FieldSource,
    pub rg: FieldSource,
    pub contact: FieldSource,
    pub emergency_contact: FieldSource,
    pub insurance: FieldSource,
}

/// Identity facts checked for duplicates before registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateCandidate {
    pub full_name: String,
    pub birth_date: NaiveDate,
    pub cpf: Option<String>,
}

impl From<&NewPatient> for DuplicateCandidate {
    fn from(value: &NewPatient) -> Self {
        Self {
            full_name: value.full_name.clone(),
            birth_date: value.birth_date,
            cpf: value.cpf.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedField {
    Cpf,
    FullName,
    BirthDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateMatch {
    pub patient_id: PatientId,
    pub matched_fields: Vec<MatchedField>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    pub confidence: Confidence,
    pub matches: Vec<DuplicateMatch>,
}

impl DuplicateCheck {
    pub fn from_matches(matches: Vec<DuplicateMatch>) -> Self {
        let is_duplicate = !matches.is_empty();
        Self {
            is_duplicate,
            confidence: if is_duplicate {
                Confidence::High
            } else {
                Confidence::Low
            },
            matches,
        }
    }

    pub fn matched_fields(&self) -> impl Iterator<Item = &MatchedField> {
        self.matches.iter().flat_map(|m| m.matched_fields.iter())
    }
}

//! Patient consent records and access decisions.

use super::{optional_text, parse_enum};
use crate::error::{RuleCode, ValidationErrors};
use crate::ids::{ConsentId, PatientId, UserId};
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use vault_types::NonEmptyText;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentPurpose {
    Treatment,
    DataSharing,
    Research,
    Communication,
}

impl ConsentPurpose {
    const VARIANTS: &'static [(&'static str, ConsentPurpose)] = &[
        ("treatment", ConsentPurpose::Treatment),
        ("data_sharing", ConsentPurpose::DataSharing),
        ("research", ConsentPurpose::Research),
        ("communication", ConsentPurpose::Communication),
    ];

    pub fn parse(field: &str, input: &str) -> Result<Self, ValidationErrors> {
        parse_enum(field, input, Self::VARIANTS)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsentPurpose::Treatment => "treatment",
            ConsentPurpose::DataSharing => "data_sharing",
            ConsentPurpose::Research => "research",
            ConsentPurpose::Communication => "communication",
        }
    }
}

impl fmt::Display for ConsentPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentInput {
    pub purpose: String,
    pub granted: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    id: ConsentId,
    patient_id: PatientId,
    purpose: ConsentPurpose,
    granted: bool,
    expires_at: Option<DateTime<Utc>>,
    notes: Option<NonEmptyText>,
    recorded_by: UserId,
    recorded_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
    revoked_by: Option<UserId>,
}

impl ConsentRecord {
    pub fn new(
        patient_id: &PatientId,
        input: &ConsentInput,
        actor: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let purpose = errors.collect(ConsentPurpose::parse("purpose", &input.purpose));
        let notes = errors.collect(optional_text("notes", input.notes.as_deref(), 1000));
        if input.expires_at.is_some_and(|at| at <= now) {
            errors.push("expires_at", RuleCode::DateOrder, "expires_at must be in the future");
        }

        match (purpose, notes) {
            (Some(purpose), Some(notes)) if errors.is_empty() => Ok(Self {
                id: ConsentId::new(),
                patient_id: patient_id.clone(),
                purpose,
                granted: input.granted,
                expires_at: input.expires_at,
                notes,
                recorded_by: actor.clone(),
                recorded_at: now,
                revoked_at: None,
                revoked_by: None,
            }),
            _ => Err(errors),
        }
    }

    pub fn revoked(&self, actor: &UserId, now: DateTime<Utc>) -> CoreResult<Self> {
        if self.revoked_at.is_some() {
            return Err(CoreError::Conflict(format!("consent {} is already revoked", self.id)));
        }
        Ok(Self {
            revoked_at: Some(now),
            revoked_by: Some(actor.clone()),
            ..self.clone()
        })
    }

    pub(crate) fn reassigned(&self, patient_id: &PatientId) -> Self {
        Self {
            patient_id: patient_id.clone(),
            ..self.clone()
        }
    }

    /// Granted, not revoked and not expired.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.granted && self.revoked_at.is_none() && self.expires_at.is_none_or(|at| at > now)
    }

    pub fn id(&self) -> &ConsentId {
        &self.id
    }

    pub fn patient_id(&self) -> &PatientId {
        &self.patient_id
    }

    pub fn purpose(&self) -> ConsentPurpose {
        self.purpose
    }

    pub fn granted(&self) -> bool {
        self.granted
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn revoked_at(&self) -> Option<DateTime<Utc>> {
        self.revoked_at
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub granted: bool,
    pub reason: String,
}

impl AccessDecision {
    pub fn granted(reason: impl Into<String>) -> Self {
        Self {
            granted: true,
            reason: reason.into(),
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn input(purpose: &str) -> ConsentInput {
        ConsentInput {
            purpose: purpose.into(),
            granted: true,
            expires_at: None,
            notes: None,
        }
    }

    #[test]
    fn test_consent_validation() {
        let now = Utc::now();
        let bad = ConsentInput {
            expires_at: Some(now - Duration::days(1)),
            ..input("marketing")
        };
        let errors = ConsentRecord::new(&PatientId::new(), &bad, &UserId::new(), now).unwrap_err();
        assert!(errors.has("purpose", RuleCode::InvalidValue));
        assert!(errors.has("expires_at", RuleCode::DateOrder));
    }

    #[test]
    fn test_active_until_revoked_or_expired() {
        let now = Utc::now();
        let actor = UserId::new();
        let expiring = ConsentInput {
            expires_at: Some(now + Duration::days(30)),
            ..input("research")
        };
        let consent = ConsentRecord::new(&PatientId::new(), &expiring, &actor, now).unwrap();

        assert!(consent.is_active_at(now));
        assert!(!consent.is_active_at(now + Duration::days(31)));

        let revoked = consent.revoked(&actor, now).unwrap();
        assert!(!revoked.is_active_at(now));
        assert!(matches!(revoked.revoked(&actor, now), Err(CoreError::Conflict(_))));
        assert!(consent.is_active_at(now));
    }
}

//! Typed identifiers.
//!
//! Every entity id is a canonical [`ShardableUuid`] under a distinct type, so a document id can
//! never be passed where a patient id is expected. Construction from strings validates the
//! canonical 32-hex form.

use crate::CoreResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use vault_uuid::{ShardableUuid, TimestampUuid};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(ShardableUuid);

        impl $name {
            pub fn new() -> Self {
                Self(ShardableUuid::new())
            }

            pub fn parse(input: &str) -> CoreResult<Self> {
                Ok(Self(ShardableUuid::parse(input)?))
            }

            pub fn as_uuid(&self) -> &ShardableUuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<ShardableUuid> for $name {
            fn from(value: ShardableUuid) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = crate::CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

entity_id!(
    /// Identifies a patient.
    PatientId
);
entity_id!(MedicalRecordId);
entity_id!(DocumentId);
entity_id!(StatusTransitionId);
entity_id!(ConsentId);
entity_id!(
    /// Identifies an actor. Supplied by the outer identity layer.
    UserId
);

impl UserId {
    /// Principal used for scheduled maintenance performed by the system itself.
    pub fn system() -> Self {
        Self(ShardableUuid::nil())
    }

    pub fn is_system(&self) -> bool {
        self.0 == ShardableUuid::nil()
    }
}

/// Identifies an audit entry. Time-prefixed so entries sort chronologically by id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditLogId(TimestampUuid);

impl AuditLogId {
    pub fn parse(input: &str) -> CoreResult<Self> {
        Ok(Self(TimestampUuid::parse(input)?))
    }

    pub fn inner(&self) -> &TimestampUuid {
        &self.0
    }
}

impl From<TimestampUuid> for AuditLogId {
    fn from(value: TimestampUuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for AuditLogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoreError;

    #[test]
    fn test_ids_reject_malformed_values() {
        assert!(matches!(
            PatientId::parse("not-a-uuid"),
            Err(CoreError::Uuid(_))
        ));
        assert!(DocumentId::parse("550e8400e29b41d4a716446655440000").is_ok());
    }

    #[test]
    fn test_system_user_is_nil() {
        assert!(UserId::system().is_system());
        assert!(!UserId::new().is_system());
    }
}

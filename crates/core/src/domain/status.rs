//! Status ledger rows and the read views derived from them.

use super::patient::PatientStatus;
use super::required_text;
use crate::error::ValidationErrors;
use crate::ids::{PatientId, StatusTransitionId, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use vault_types::NonEmptyText;

/// One append-only ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    id: StatusTransitionId,
    patient_id: PatientId,
    from: Option<PatientStatus>,
    to: PatientStatus,
    reason: NonEmptyText,
    actor: UserId,
    at: DateTime<Utc>,
    /// Position in the patient's ledger, starting at 1.
    sequence: u32,
    /// Set on rows carried over from a duplicate by a merge. Such rows keep the duplicate's
    /// history and are not part of the owning patient's own ledger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    merged_from: Option<PatientId>,
}

impl StatusTransition {
    pub const MAX_REASON: usize = 500;

    pub fn new(
        patient_id: &PatientId,
        from: Option<PatientStatus>,
        to: PatientStatus,
        reason: &str,
        actor: &UserId,
        at: DateTime<Utc>,
        sequence: u32,
    ) -> Result<Self, ValidationErrors> {
        let reason = required_text("reason", reason, Self::MAX_REASON)?;
        Ok(Self {
            id: StatusTransitionId::new(),
            patient_id: patient_id.clone(),
            from,
            to,
            reason,
            actor: actor.clone(),
            at,
            sequence,
            merged_from: None,
        })
    }

    /// The row moved under `patient_id`, remembering the patient whose ledger it belonged to.
    pub(crate) fn reassigned(&self, patient_id: &PatientId) -> Self {
        Self {
            patient_id: patient_id.clone(),
            merged_from: self
                .merged_from
                .clone()
                .or_else(|| Some(self.patient_id.clone())),
            ..self.clone()
        }
    }

    pub fn id(&self) -> &StatusTransitionId {
        &self.id
    }

    pub fn patient_id(&self) -> &PatientId {
        &self.patient_id
    }

    pub fn from(&self) -> Option<PatientStatus> {
        self.from
    }

    pub fn to(&self) -> PatientStatus {
        self.to
    }

    pub fn reason(&self) -> &str {
        self.reason.as_str()
    }

    pub fn actor(&self) -> &UserId {
        &self.actor
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn merged_from(&self) -> Option<&PatientId> {
        self.merged_from.as_ref()
    }

    /// Whether the row belongs to the owning patient's own ledger.
    pub fn is_own(&self) -> bool {
        self.merged_from.is_none()
    }
}

/// Sequence for the next row appended to `ledger`: one past the highest in use.
///
/// `None` once the sequence space is exhausted.
pub fn next_sequence(ledger: &[StatusTransition]) -> Option<u32> {
    ledger
        .iter()
        .map(|t| t.sequence)
        .max()
        .unwrap_or(0)
        .checked_add(1)
}

/// Chronological ledger order: timestamp, then sequence.
pub fn sort_ledger(transitions: &mut [StatusTransition]) {
    transitions.sort_by(|a, b| a.at.cmp(&b.at).then(a.sequence.cmp(&b.sequence)));
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInStatus {
    pub status: PatientStatus,
    pub seconds: i64,
}

/// Total time spent in each status, the last one measured up to `now`.
///
/// `history` must be in ledger order. Statuses never entered are omitted.
pub fn time_in_status(history: &[StatusTransition], now: DateTime<Utc>) -> Vec<TimeInStatus> {
    let mut totals: Vec<(PatientStatus, Duration)> = Vec::new();
    for (i, transition) in history.iter().enumerate() {
        let until = history.get(i + 1).map(|next| next.at).unwrap_or(now);
        let spent = (until - transition.at).max(Duration::zero());
        match totals.iter_mut().find(|(status, _)| *status == transition.to) {
            Some((_, total)) => *total += spent,
            None => totals.push((transition.to, spent)),
        }
    }
    totals.sort_by_key(|(status, _)| *status);
    totals
        .into_iter()
        .map(|(status, total)| TimeInStatus {
            status,
            seconds: total.num_seconds(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionPattern {
    pub from: PatientStatus,
    pub to: PatientStatus,
    pub count: usize,
}

/// The `top` most frequent `from -> to` pairs. Ties keep first-seen order.
///
/// Registration rows and rows that keep the status (a merge) are not transitions.
pub fn transition_patterns<'a>(
    transitions: impl IntoIterator<Item = &'a StatusTransition>,
    top: usize,
) -> Vec<TransitionPattern> {
    let mut patterns: Vec<TransitionPattern> = Vec::new();
    for t in transitions {
        let Some(from) = t.from.filter(|from| *from != t.to) else { continue };
        match patterns.iter_mut().find(|p| p.from == from && p.to == t.to) {
            Some(p) => p.count += 1,
            None => patterns.push(TransitionPattern {
                from,
                to: t.to,
                count: 1,
            }),
        }
    }
    // stable sort keeps first-seen order among equal counts
    patterns.sort_by(|a, b| b.count.cmp(&a.count));
    patterns.truncate(top);
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;
    use PatientStatus::*;

    fn row(patient: &PatientId, from: Option<PatientStatus>, to: PatientStatus, at: DateTime<Utc>, seq: u32) -> StatusTransition {
        StatusTransition::new(patient, from, to, "clinical decision", &UserId::new(), at, seq).unwrap()
    }

    #[test]
    fn test_reason_is_required_and_bounded() {
        let patient = PatientId::new();
        let actor = UserId::new();
        assert!(StatusTransition::new(&patient, None, New, "  ", &actor, Utc::now(), 1).is_err());
        assert!(StatusTransition::new(&patient, None, New, &"x".repeat(501), &actor, Utc::now(), 1).is_err());
    }

    #[test]
    fn test_time_in_status() {
        let p = PatientId::new();
        let t0 = Utc::now() - Duration::hours(10);
        let history = vec![
            row(&p, None, New, t0, 1),
            row(&p, Some(New), Active, t0 + Duration::hours(1), 2),
            row(&p, Some(Active), OnHold, t0 + Duration::hours(4), 3),
            row(&p, Some(OnHold), Active, t0 + Duration::hours(6), 4),
        ];
        let now = t0 + Duration::hours(10);
        let view = time_in_status(&history, now);

        assert_eq!(
            view,
            vec![
                TimeInStatus { status: New, seconds: 3600 },
                TimeInStatus { status: Active, seconds: 7 * 3600 },
                TimeInStatus { status: OnHold, seconds: 2 * 3600 },
            ]
        );
    }

    #[test]
    fn test_patterns_ranked_with_first_seen_ties() {
        let p = PatientId::new();
        let t = Utc::now();
        let history = vec![
            row(&p, None, New, t, 1),
            row(&p, Some(New), Active, t, 2),
            row(&p, Some(Active), OnHold, t, 3),
            row(&p, Some(OnHold), Active, t, 4),
            row(&p, Some(Active), OnHold, t, 5),
        ];
        let patterns = transition_patterns(&history, 2);

        assert_eq!(patterns.len(), 2);
        assert_eq!((patterns[0].from, patterns[0].to, patterns[0].count), (Active, OnHold, 2));
        assert_eq!((patterns[1].from, patterns[1].to), (New, Active));
    }

    #[test]
    fn test_next_sequence_follows_the_highest_in_use() {
        let p = PatientId::new();
        let t = Utc::now();
        assert_eq!(next_sequence(&[]), Some(1));

        // a gap left by a removed row must not lead to a reused sequence
        let gapped = vec![row(&p, None, New, t, 1), row(&p, Some(New), Active, t, 3)];
        assert_eq!(next_sequence(&gapped), Some(4));

        let full = vec![row(&p, Some(Active), OnHold, t, u32::MAX)];
        assert_eq!(next_sequence(&full), None);
    }

    #[test]
    fn test_reassigned_rows_remember_their_first_owner() {
        let duplicate = PatientId::new();
        let primary = PatientId::new();
        let original = row(&duplicate, None, New, Utc::now(), 1);
        assert!(original.is_own());

        let moved = original.reassigned(&primary);
        assert_eq!(moved.patient_id(), &primary);
        assert_eq!(moved.merged_from(), Some(&duplicate));
        assert!(!moved.is_own());

        let moved_again = moved.reassigned(&PatientId::new());
        assert_eq!(moved_again.merged_from(), Some(&duplicate));
    }

    #[test]
    fn test_sort_ledger_uses_sequence_for_equal_times() {
        let p = PatientId::new();
        let t = Utc::now();
        let mut rows = vec![row(&p, Some(New), Active, t, 2), row(&p, None, New, t, 1)];
        sort_ledger(&mut rows);
        assert_eq!(rows[0].sequence(), 1);
    }
}

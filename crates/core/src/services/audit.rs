//! Audit logging and compliance engine.
//!
//! Recording never fails the caller: [`AuditService::log_data_access`] returns `Option` and
//! routes storage failures to the [`AlertSink`]. Payloads are sealed with a key derived from the
//! master key; if sealing fails a redacted placeholder is stored instead of plaintext.

use crate::collaborators::{AlertKind, AlertSink, OperationalAlert, TenantDirectory};
use crate::config::CoreConfig;
use crate::constants::AUDIT_KEY_SALT;
use crate::crypto::{seal, DataKey, KeyDeriver, KeyProvider, SealedEnvelope};
use crate::domain::audit::{
    AccessResult, AuditFilter, AuditLogEntry, AuditPage, AuditRecord, AuditStatistics,
    ExportFormat, NewAuditEntry, PayloadView, StoredPayload, AUDIT_PURGE_OPERATION,
    SECURITY_ALERT_OPERATION,
};
use crate::ids::{AuditLogId, PatientId, UserId};
use crate::repositories::audit_log::AuditLogRepository;
use crate::{CoreError, CoreResult, OperationContext};
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};
use vault_uuid::TimestampUuid;

/// Largest page a query returns regardless of the requested limit.
const MAX_PAGE_SIZE: usize = 1000;

#[derive(Serialize, Deserialize)]
struct PayloadBody {
    before: Option<Value>,
    after: Option<Value>,
}

#[derive(Debug)]
pub struct AuditService {
    cfg: Arc<CoreConfig>,
    log: AuditLogRepository,
    keys: Arc<dyn KeyProvider>,
    tenants: Arc<dyn TenantDirectory>,
    alerts: Arc<dyn AlertSink>,
    audit_key: Mutex<Option<Arc<DataKey>>>,
    last_id: Mutex<Option<TimestampUuid>>,
}

impl AuditService {
    pub fn new(
        cfg: Arc<CoreConfig>,
        keys: Arc<dyn KeyProvider>,
        tenants: Arc<dyn TenantDirectory>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let log = AuditLogRepository::new(cfg.audit_log_dir());
        Self {
            cfg,
            log,
            keys,
            tenants,
            alerts,
            audit_key: Mutex::new(None),
            last_id: Mutex::new(None),
        }
    }

    fn key(&self) -> CoreResult<Arc<DataKey>> {
        let mut cached = self.audit_key.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }
        let master = self.keys.master_key()?;
        let key = Arc::new(KeyDeriver::new(self.cfg.kdf()).derive(&master, AUDIT_KEY_SALT)?);
        *cached = Some(key.clone());
        Ok(key)
    }

    fn next_id(&self, at: Option<DateTime<Utc>>) -> AuditLogId {
        match at {
            Some(at) => AuditLogId::from(TimestampUuid::at(at)),
            None => {
                let mut last = self.last_id.lock().unwrap_or_else(PoisonError::into_inner);
                let id = TimestampUuid::generate(last.as_ref());
                *last = Some(id.clone());
                AuditLogId::from(id)
            }
        }
    }

    fn seal_payload(&self, id: &AuditLogId, body: &PayloadBody) -> CoreResult<StoredPayload> {
        let key = self.key()?;
        let plaintext = serde_json::to_vec(body).map_err(CoreError::JsonSerialization)?;
        let sealed = seal(&key, &plaintext, id.to_string().as_bytes())?;
        Ok(StoredPayload::Encrypted {
            envelope: SealedEnvelope::from_sealed(&sealed),
        })
    }

    /// Record one operation. Never fails: returns the new entry's id, or `None` if it could not
    /// be stored (reported through the alert sink).
    ///
    /// A denied entry about a patient triggers suspicious-activity detection for the same
    /// actor and patient.
    pub fn log_data_access(&self, entry: NewAuditEntry) -> Option<AuditLogId> {
        let id = self.next_id(entry.at);
        let payload = if entry.has_payload() {
            let body = PayloadBody {
                before: entry.before.clone(),
                after: entry.after.clone(),
            };
            Some(self.seal_payload(&id, &body).unwrap_or_else(|e| {
                tracing::warn!("audit payload for {} redacted: {}", id, e);
                StoredPayload::Redacted {
                    reason: format!("payload encryption failed: {e}"),
                }
            }))
        } else {
            None
        };
        let stored = entry.into_entry(id.clone(), payload);

        if let Err(e) = self.log.append(&stored) {
            self.alerts.alert(OperationalAlert {
                kind: AlertKind::AuditWriteFailed,
                message: format!(
                    "failed to persist audit entry {} ({} {}): {}",
                    id, stored.operation, stored.data_type, e
                ),
            });
            return None;
        }

        if stored.result == AccessResult::Denied && stored.operation != SECURITY_ALERT_OPERATION {
            if let Some(patient_id) = &stored.patient_id {
                self.detect_suspicious_activity(&stored.actor, patient_id, stored.timestamp);
            }
        }
        Some(id)
    }

    /// Raise one `security_alert` per window once denied accesses for this actor and patient
    /// reach the configured threshold.
    fn detect_suspicious_activity(&self, actor: &UserId, patient_id: &PatientId, now: DateTime<Utc>) {
        let settings = self.cfg.audit();
        let since = now - settings.suspicious_window;
        let recent = match self.log.list_since(Some(since)) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("suspicious-activity check skipped: {}", e);
                return;
            }
        };
        let about_pair = |e: &&AuditLogEntry| {
            e.actor == *actor && e.patient_id.as_ref() == Some(patient_id) && e.timestamp <= now
        };
        let denied = recent
            .iter()
            .filter(about_pair)
            .filter(|e| e.result == AccessResult::Denied && e.operation != SECURITY_ALERT_OPERATION)
            .count();
        let already_alerted = recent
            .iter()
            .filter(about_pair)
            .any(|e| e.operation == SECURITY_ALERT_OPERATION);
        if denied < settings.suspicious_threshold as usize || already_alerted {
            return;
        }

        let minutes = settings.suspicious_window.num_minutes();
        let alert = NewAuditEntry::new(actor, SECURITY_ALERT_OPERATION, "access_pattern", AccessResult::Denied)
            .patient(patient_id)
            .justification(format!(
                "{denied} denied accesses within {minutes} minutes"
            ));
        self.log_data_access(alert);
        self.alerts.alert(OperationalAlert {
            kind: AlertKind::SuspiciousActivity,
            message: format!(
                "actor {actor} was denied access to patient {patient_id} {denied} times within {minutes} minutes"
            ),
        });
    }

    /// Reject actors whose role may not read the audit trail. Denials are themselves audited.
    fn ensure_reader(&self, actor: &UserId, operation: &'static str) -> CoreResult<()> {
        if actor.is_system() {
            return Ok(());
        }
        let role = self.tenants.role(actor)?;
        let allowed = role
            .as_deref()
            .is_some_and(|r| self.cfg.audit().reader_roles.iter().any(|allowed| allowed == r));
        if allowed {
            return Ok(());
        }
        self.log_data_access(NewAuditEntry::new(actor, operation, "audit_log", AccessResult::Denied));
        Err(CoreError::AccessDenied(format!(
            "role {} may not read the audit log",
            role.as_deref().unwrap_or("<none>")
        )))
    }

    fn open_payload(&self, entry: &AuditLogEntry) -> PayloadView {
        match &entry.payload {
            None => PayloadView::Absent,
            Some(StoredPayload::Redacted { reason }) => PayloadView::Redacted {
                reason: reason.clone(),
            },
            Some(StoredPayload::Encrypted { envelope }) => {
                let opened = self.key().and_then(|key| {
                    let bytes = envelope.open(&key, entry.id.to_string().as_bytes())?;
                    serde_json::from_slice::<PayloadBody>(&bytes)
                        .map_err(CoreError::JsonDeserialization)
                });
                match opened {
                    Ok(body) => PayloadView::Plain {
                        before: body.before,
                        after: body.after,
                    },
                    Err(e) => PayloadView::Unreadable {
                        reason: e.to_string(),
                    },
                }
            }
        }
    }

    fn matching(&self, filter: &AuditFilter) -> CoreResult<Vec<AuditLogEntry>> {
        Ok(self
            .log
            .list_since(filter.from)?
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect())
    }

    /// Filtered, paginated entries with payloads opened.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AccessDenied`] unless the actor holds an audit-reader role.
    pub fn query(&self, actor: &UserId, filter: &AuditFilter) -> CoreResult<AuditPage> {
        self.ensure_reader(actor, "audit_query")?;
        let entries = self.matching(filter).context("query audit log")?;
        let limit = filter.limit.clamp(1, MAX_PAGE_SIZE);
        let total = entries.len();
        let items: Vec<AuditRecord> = entries
            .into_iter()
            .skip(filter.offset)
            .take(limit)
            .map(|e| {
                let payload = self.open_payload(&e);
                AuditRecord::new(e, payload)
            })
            .collect();
        self.log_data_access(NewAuditEntry::new(actor, "audit_query", "audit_log", AccessResult::Granted));
        Ok(AuditPage::new(items, total, filter.offset, limit))
    }

    /// Every entry matching `filter` (pagination ignored), rendered in `format`.
    pub fn export(
        &self,
        actor: &UserId,
        filter: &AuditFilter,
        format: ExportFormat,
    ) -> CoreResult<String> {
        self.ensure_reader(actor, "audit_export")?;
        let records: Vec<AuditRecord> = self
            .matching(filter)
            .context("export audit log")?
            .into_iter()
            .map(|e| {
                let payload = self.open_payload(&e);
                AuditRecord::new(e, payload)
            })
            .collect();
        let rendered = format.render(&records)?;
        self.log_data_access(
            NewAuditEntry::new(actor, "audit_export", "audit_log", AccessResult::Granted)
                .justification(format!("{} entries exported as {:?}", records.len(), format)),
        );
        Ok(rendered)
    }

    /// Statistics over entries with `from <= timestamp < to`.
    pub fn statistics(
        &self,
        actor: &UserId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> CoreResult<AuditStatistics> {
        self.ensure_reader(actor, "audit_statistics")?;
        let filter = AuditFilter {
            from,
            to,
            ..AuditFilter::default()
        };
        let entries = self.matching(&filter).context("compute audit statistics")?;
        Ok(AuditStatistics::compute(&entries, self.cfg.audit().top_subjects))
    }

    /// Entries about one patient, oldest first. Used by data-subject exports.
    pub(crate) fn entries_for_patient(&self, patient_id: &PatientId) -> CoreResult<Vec<AuditRecord>> {
        let filter = AuditFilter {
            patient_id: Some(patient_id.clone()),
            ..AuditFilter::default()
        };
        Ok(self
            .matching(&filter)?
            .into_iter()
            .map(|e| {
                let payload = self.open_payload(&e);
                AuditRecord::new(e, payload)
            })
            .collect())
    }

    /// Delete entries older than `retention_years` (default from config) and record the purge.
    ///
    /// The purge entry is written after the sweep, so it is never subject to the cutoff it
    /// enforced. Returns the number of entries deleted.
    pub fn purge_old_logs(&self, actor: &UserId, retention_years: Option<u32>) -> CoreResult<usize> {
        self.ensure_reader(actor, AUDIT_PURGE_OPERATION)?;
        let years = retention_years.unwrap_or(self.cfg.audit().retention_years);
        if years == 0 {
            return Err(CoreError::InvalidInput(
                "retention must be at least one year".into(),
            ));
        }
        let now = Utc::now();
        let cutoff = now
            .checked_sub_months(Months::new(years * 12))
            .ok_or_else(|| CoreError::InvalidInput(format!("retention of {years} years is out of range")))?;

        let deleted = self.log.remove_older_than(cutoff).context("purge audit log")?;
        tracing::info!("audit purge removed {} entries older than {}", deleted, cutoff);

        self.log_data_access(
            NewAuditEntry::new(actor, AUDIT_PURGE_OPERATION, "audit_log", AccessResult::Granted)
                .justification(format!("retention policy of {years} years"))
                .after(json!({
                    "deleted": deleted,
                    "cutoff": cutoff.to_rfc3339(),
                    "retention_years": years,
                })),
        );
        Ok(deleted)
    }

    pub fn entry_count(&self) -> CoreResult<usize> {
        self.log.count()
    }

    pub(crate) fn repository(&self) -> &AuditLogRepository {
        &self.log
    }
}

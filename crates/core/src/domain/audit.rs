//! Audit trail records, filters, statistics and export rendering.

use crate::crypto::SealedEnvelope;
use crate::ids::{AuditLogId, PatientId, UserId};
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;

/// Operation name of the entries synthesized by suspicious-activity detection.
pub const SECURITY_ALERT_OPERATION: &str = "security_alert";
pub const AUDIT_PURGE_OPERATION: &str = "audit_purge";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessResult {
    Granted,
    Denied,
}

impl AccessResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessResult::Granted => "granted",
            AccessResult::Denied => "denied",
        }
    }
}

impl fmt::Display for AccessResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network and client facts supplied by the outer layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
}

/// Before/after payload as persisted: sealed, or a placeholder when sealing failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredPayload {
    Encrypted { envelope: SealedEnvelope },
    Redacted { reason: String },
}

/// One persisted audit entry. Never modified after it is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: AuditLogId,
    pub actor: UserId,
    pub patient_id: Option<PatientId>,
    pub operation: String,
    pub data_type: String,
    pub result: AccessResult,
    pub timestamp: DateTime<Utc>,
    pub payload: Option<StoredPayload>,
    pub client: Option<ClientInfo>,
    pub justification: Option<String>,
    pub correlation_id: Option<String>,
    pub request_id: Option<String>,
}

/// A request to record one audited operation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub actor: UserId,
    pub patient_id: Option<PatientId>,
    pub operation: String,
    pub data_type: String,
    pub result: AccessResult,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub client: Option<ClientInfo>,
    pub justification: Option<String>,
    pub correlation_id: Option<String>,
    pub request_id: Option<String>,
    /// Explicit timestamp, for imported history. Defaults to now.
    pub at: Option<DateTime<Utc>>,
}

impl NewAuditEntry {
    pub fn new(
        actor: &UserId,
        operation: impl Into<String>,
        data_type: impl Into<String>,
        result: AccessResult,
    ) -> Self {
        Self {
            actor: actor.clone(),
            patient_id: None,
            operation: operation.into(),
            data_type: data_type.into(),
            result,
            before: None,
            after: None,
            client: None,
            justification: None,
            correlation_id: None,
            request_id: None,
            at: None,
        }
    }

    pub fn patient(mut self, patient_id: &PatientId) -> Self {
        self.patient_id = Some(patient_id.clone());
        self
    }

    pub fn before(mut self, value: Value) -> Self {
        self.before = Some(value);
        self
    }

    pub fn after(mut self, value: Value) -> Self {
        self.after = Some(value);
        self
    }

    pub fn client(mut self, client: ClientInfo) -> Self {
        self.client = Some(client);
        self
    }

    pub fn justification(mut self, text: impl Into<String>) -> Self {
        self.justification = Some(text.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    pub fn has_payload(&self) -> bool {
        self.before.is_some() || self.after.is_some()
    }
}

/// Lowercase snake_case tag; blank input becomes `unspecified`.
pub fn normalize_tag(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    let trimmed = out.trim_end_matches('_');
    if trimmed.is_empty() {
        "unspecified".to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_optional(input: Option<String>, max: usize) -> Option<String> {
    input
        .map(|s| s.trim().chars().take(max).collect::<String>())
        .filter(|s| !s.is_empty())
}

impl NewAuditEntry {
    /// Normalize into a persistable entry. Never fails: audit recording must not block the
    /// operation it describes.
    pub(crate) fn into_entry(self, id: AuditLogId, payload: Option<StoredPayload>) -> AuditLogEntry {
        let timestamp = id.inner().timestamp();
        AuditLogEntry {
            id,
            actor: self.actor,
            patient_id: self.patient_id,
            operation: normalize_tag(&self.operation),
            data_type: normalize_tag(&self.data_type),
            result: self.result,
            timestamp,
            payload,
            client: self.client,
            justification: normalize_optional(self.justification, 1000),
            correlation_id: normalize_optional(self.correlation_id, 128),
            request_id: normalize_optional(self.request_id, 128),
        }
    }
}

/// Payload as returned to an authorized reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadView {
    Absent,
    Plain {
        before: Option<Value>,
        after: Option<Value>,
    },
    Redacted {
        reason: String,
    },
    /// The stored ciphertext could not be opened with the current key.
    Unreadable {
        reason: String,
    },
}

/// An audit entry with its payload opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: AuditLogId,
    pub actor: UserId,
    pub patient_id: Option<PatientId>,
    pub operation: String,
    pub data_type: String,
    pub result: AccessResult,
    pub timestamp: DateTime<Utc>,
    pub payload: PayloadView,
    pub client: Option<ClientInfo>,
    pub justification: Option<String>,
    pub correlation_id: Option<String>,
    pub request_id: Option<String>,
}

impl AuditRecord {
    pub fn new(entry: AuditLogEntry, payload: PayloadView) -> Self {
        Self {
            id: entry.id,
            actor: entry.actor,
            patient_id: entry.patient_id,
            operation: entry.operation,
            data_type: entry.data_type,
            result: entry.result,
            timestamp: entry.timestamp,
            payload,
            client: entry.client,
            justification: entry.justification,
            correlation_id: entry.correlation_id,
            request_id: entry.request_id,
        }
    }
}

/// Query filter. `from` is inclusive, `to` exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditFilter {
    pub actor: Option<UserId>,
    pub patient_id: Option<PatientId>,
    pub operation: Option<String>,
    pub data_type: Option<String>,
    pub result: Option<AccessResult>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for AuditFilter {
    fn default() -> Self {
        Self {
            actor: None,
            patient_id: None,
            operation: None,
            data_type: None,
            result: None,
            from: None,
            to: None,
            offset: 0,
            limit: 100,
        }
    }
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.actor.as_ref().is_none_or(|a| *a == entry.actor)
            && self
                .patient_id
                .as_ref()
                .is_none_or(|p| entry.patient_id.as_ref() == Some(p))
            && self
                .operation
                .as_deref()
                .is_none_or(|op| normalize_tag(op) == entry.operation)
            && self
                .data_type
                .as_deref()
                .is_none_or(|dt| normalize_tag(dt) == entry.data_type)
            && self.result.is_none_or(|r| r == entry.result)
            && self.from.is_none_or(|from| entry.timestamp >= from)
            && self.to.is_none_or(|to| entry.timestamp < to)
    }
}

/// One page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditPage {
    pub items: Vec<AuditRecord>,
    pub total_count: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
}

impl AuditPage {
    pub fn new(items: Vec<AuditRecord>, total_count: usize, offset: usize, limit: usize) -> Self {
        let has_more = offset + items.len() < total_count;
        Self {
            items,
            total_count,
            offset,
            limit,
            has_more,
        }
    }

    pub fn next_offset(&self) -> Option<usize> {
        if self.has_more {
            Some(self.offset + self.limit)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectCount {
    pub patient_id: PatientId,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCount {
    pub operation: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditStatistics {
    pub total: usize,
    pub distinct_actors: usize,
    pub denied: usize,
    /// Sorted by operation name.
    pub operations: Vec<OperationCount>,
    /// Most-accessed patients, ties broken by first-seen order.
    pub top_subjects: Vec<SubjectCount>,
    pub security_alerts: usize,
}

impl AuditStatistics {
    /// `entries` must be in chronological order for the tie-break to mean "first seen".
    pub fn compute(entries: &[AuditLogEntry], top: usize) -> Self {
        let mut actors: HashSet<&UserId> = HashSet::new();
        let mut operations: Vec<OperationCount> = Vec::new();
        let mut subjects: Vec<SubjectCount> = Vec::new();
        let mut denied = 0;
        let mut security_alerts = 0;

        for entry in entries {
            actors.insert(&entry.actor);
            if entry.result == AccessResult::Denied {
                denied += 1;
            }
            if entry.operation == SECURITY_ALERT_OPERATION {
                security_alerts += 1;
            }
            match operations.iter_mut().find(|o| o.operation == entry.operation) {
                Some(o) => o.count += 1,
                None => operations.push(OperationCount {
                    operation: entry.operation.clone(),
                    count: 1,
                }),
            }
            if let Some(patient) = &entry.patient_id {
                match subjects.iter_mut().find(|s| &s.patient_id == patient) {
                    Some(s) => s.count += 1,
                    None => subjects.push(SubjectCount {
                        patient_id: patient.clone(),
                        count: 1,
                    }),
                }
            }
        }

        operations.sort_by(|a, b| a.operation.cmp(&b.operation));
        subjects.sort_by(|a, b| b.count.cmp(&a.count));
        subjects.truncate(top);

        Self {
            total: entries.len(),
            distinct_actors: actors.len(),
            denied,
            operations,
            top_subjects: subjects,
            security_alerts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Csv,
    Xml,
}

impl ExportFormat {
    pub fn parse(input: &str) -> CoreResult<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "xml" => Ok(ExportFormat::Xml),
            other => Err(CoreError::UnsupportedExportFormat(other.to_string())),
        }
    }

    pub fn render(&self, records: &[AuditRecord]) -> CoreResult<String> {
        match self {
            ExportFormat::Json => {
                serde_json::to_string_pretty(records).map_err(CoreError::JsonSerialization)
            }
            ExportFormat::Csv => render_csv(records),
            ExportFormat::Xml => render_xml(records),
        }
    }
}

const CSV_COLUMNS: [&str; 11] = [
    "id",
    "timestamp",
    "actor",
    "patient_id",
    "operation",
    "data_type",
    "result",
    "justification",
    "correlation_id",
    "request_id",
    "payload",
];

fn payload_json(view: &PayloadView) -> CoreResult<String> {
    serde_json::to_string(view).map_err(CoreError::JsonSerialization)
}

fn record_fields(r: &AuditRecord) -> CoreResult<[String; 11]> {
    Ok([
        r.id.to_string(),
        r.timestamp.to_rfc3339(),
        r.actor.to_string(),
        r.patient_id.as_ref().map(ToString::to_string).unwrap_or_default(),
        r.operation.clone(),
        r.data_type.clone(),
        r.result.to_string(),
        r.justification.clone().unwrap_or_default(),
        r.correlation_id.clone().unwrap_or_default(),
        r.request_id.clone().unwrap_or_default(),
        payload_json(&r.payload)?,
    ])
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn render_csv(records: &[AuditRecord]) -> CoreResult<String> {
    let mut out = CSV_COLUMNS.join(",");
    out.push('\n');
    for record in records {
        let fields = record_fields(record)?;
        let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    Ok(out)
}

fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn render_xml(records: &[AuditRecord]) -> CoreResult<String> {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<auditLog>\n");
    for record in records {
        out.push_str("  <entry>\n");
        for (name, value) in CSV_COLUMNS.iter().zip(record_fields(record)?) {
            if value.is_empty() {
                continue;
            }
            out.push_str(&format!("    <{name}>{}</{name}>\n", xml_escape(&value)));
        }
        out.push_str("  </entry>\n");
    }
    out.push_str("</auditLog>\n");
    Ok(out)
}

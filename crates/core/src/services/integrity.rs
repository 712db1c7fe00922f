//! Orphan detection and health reporting.

use crate::config::CoreConfig;
use crate::repositories::{EntityCounts, OrphanReport, Repositories};
use crate::services::audit::AuditService;
use crate::{CoreError, CoreResult, OperationContext};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;

const PROBE_FILE_NAME: &str = ".medvault-health-probe";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub counts: EntityCounts,
    pub orphan_count: usize,
    pub audit_entries: usize,
    pub data_dir_writable: bool,
    /// No orphans and a writable data directory.
    pub ok: bool,
}

#[derive(Debug)]
pub struct IntegrityService {
    cfg: Arc<CoreConfig>,
    repos: Arc<Repositories>,
    audit: Arc<AuditService>,
}

impl IntegrityService {
    pub fn new(cfg: Arc<CoreConfig>, repos: Arc<Repositories>, audit: Arc<AuditService>) -> Self {
        Self { cfg, repos, audit }
    }

    pub fn find_orphans(&self) -> CoreResult<OrphanReport> {
        let report = self.repos.find_orphans().context("scan for orphans")?;
        if !report.is_clean() {
            tracing::warn!("found {} orphaned entities", report.total());
        }
        Ok(report)
    }

    pub fn health_check(&self) -> CoreResult<HealthReport> {
        let counts = self.repos.counts().context("count entities")?;
        let orphan_count = self.find_orphans()?.total();
        let audit_entries = self.audit.entry_count().context("count audit entries")?;
        let data_dir_writable = match self.probe_data_dir() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("data directory {} is not writable: {}", self.cfg.data_dir().display(), e);
                false
            }
        };
        Ok(HealthReport {
            counts,
            orphan_count,
            audit_entries,
            data_dir_writable,
            ok: orphan_count == 0 && data_dir_writable,
        })
    }

    fn probe_data_dir(&self) -> CoreResult<()> {
        let probe = self.cfg.data_dir().join(PROBE_FILE_NAME);
        fs::write(&probe, b"ok").map_err(CoreError::FileWrite)?;
        fs::remove_file(&probe).map_err(CoreError::FileRemove)
    }
}

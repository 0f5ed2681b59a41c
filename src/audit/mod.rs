//! Audit logging
//!
//! Every run, successful or failed, leaves one record with a content hash of
//! its final context.

use crate::error::OrchestrationError;
use crate::models::{Cadence, FiscalContext, PipelineStatus, StageFailure};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub audit_id: Uuid,
    pub run_id: Uuid,
    pub period_label: String,
    pub cadence: Cadence,
    pub status: PipelineStatus,
    pub context_hash: String,
    pub failure: Option<StageFailure>,
    pub publication_id: Option<Uuid>,
    pub context: Arc<FiscalContext>,
    pub created_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

impl RunRecord {
    pub fn new(context: FiscalContext, publication_id: Option<Uuid>, execution_time_ms: u64) -> Self {
        Self {
            audit_id: Uuid::new_v4(),
            run_id: context.run_id,
            period_label: context.period.label(),
            cadence: context.period.cadence,
            status: context.status,
            context_hash: compute_context_hash(&context),
            failure: context.failure.clone(),
            publication_id,
            context: Arc::new(context),
            created_at: Utc::now(),
            execution_time_ms,
        }
    }
}

/// Audit trail storage
pub struct AuditLog {
    records: Arc<RwLock<HashMap<Uuid, RunRecord>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Append-only: a second record under an existing audit id is refused.
    pub async fn record(&self, record: RunRecord) -> Result<Uuid> {
        let audit_id = record.audit_id;
        let mut records = self.records.write().await;

        if records.contains_key(&audit_id) {
            return Err(OrchestrationError::AuditError(format!(
                "audit record {} already exists",
                audit_id
            )));
        }

        records.insert(audit_id, record);
        Ok(audit_id)
    }

    pub async fn get(&self, audit_id: Uuid) -> Result<Option<RunRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&audit_id).cloned())
    }

    /// Audit ids for one period, oldest first.
    pub async fn list_for_period(&self, period_label: &str) -> Result<Vec<Uuid>> {
        let records = self.records.read().await;

        let mut items: Vec<_> = records
            .values()
            .filter(|record| record.period_label == period_label)
            .map(|record| (record.audit_id, record.created_at))
            .collect();

        items.sort_by_key(|(_, created_at)| *created_at);

        Ok(items.into_iter().map(|(id, _)| id).collect())
    }

    /// Recompute a record's hash against its stored context.
    pub async fn verify_integrity(&self, audit_id: Uuid) -> Result<bool> {
        let records = self.records.read().await;

        if let Some(record) = records.get(&audit_id) {
            Ok(compute_context_hash(&record.context) == record.context_hash)
        } else {
            Ok(false)
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 of the context with its run id removed, so two runs over the
/// same inputs hash the same.
pub fn compute_context_hash(context: &FiscalContext) -> String {
    let mut value = match serde_json::to_value(context) {
        Ok(value) => value,
        Err(_) => return String::new(),
    };
    if let Some(fields) = value.as_object_mut() {
        fields.remove("run_id");
    }

    let mut hasher = Sha256::new();
    if serde_json::to_writer(&mut HashWriter(&mut hasher), &value).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PeriodScope;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn context() -> FiscalContext {
        FiscalContext::new(
            Uuid::new_v4(),
            PeriodScope::quarterly(2025, 3).unwrap(),
            NaiveDate::from_ymd_opt(2025, 10, 1).unwrap(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_hash_ignores_run_id() {
        let a = context();
        let b = context();
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(compute_context_hash(&a), compute_context_hash(&b));
        assert_eq!(compute_context_hash(&a).len(), 64);

        let mut c = context();
        c.trace.push("COLLECT: started".to_string());
        assert_ne!(compute_context_hash(&a), compute_context_hash(&c));
    }

    #[tokio::test]
    async fn test_record_and_verify() {
        let log = AuditLog::new();
        let record = RunRecord::new(context(), None, 12);
        let audit_id = log.record(record).await.unwrap();

        assert!(log.verify_integrity(audit_id).await.unwrap());
        assert!(!log.verify_integrity(Uuid::new_v4()).await.unwrap());

        let stored = log.get(audit_id).await.unwrap().unwrap();
        assert_eq!(stored.period_label, "2025-Q3");
        assert_eq!(log.list_for_period("2025-Q3").await.unwrap(), vec![audit_id]);
        assert!(log.list_for_period("2025-Q2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_existing_record_is_never_overwritten() {
        let log = AuditLog::new();
        let original = RunRecord::new(context(), None, 12);
        let mut replacement = RunRecord::new(context(), Some(Uuid::new_v4()), 40);
        replacement.audit_id = original.audit_id;

        let audit_id = log.record(original).await.unwrap();
        let err = log.record(replacement).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::AuditError(_)));

        let stored = log.get(audit_id).await.unwrap().unwrap();
        assert_eq!(stored.publication_id, None);
        assert_eq!(stored.execution_time_ms, 12);
    }
}

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::storage::ObjectStore;

/// key: dues-run-state -> resumable per-period bookkeeping
///
/// One record per run date. A resumed invocation loads this and skips every
/// id already in `processed_ids`, which is what makes a full run safe to
/// retry after a platform timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_date: NaiveDate,
    pub processed_ids: BTreeSet<String>,
    pub is_complete: bool,
    pub succeeded: u32,
    pub failed: u32,
}

impl RunState {
    pub fn new(run_date: NaiveDate) -> Self {
        Self {
            run_date,
            processed_ids: BTreeSet::new(),
            is_complete: false,
            succeeded: 0,
            failed: 0,
        }
    }

    pub fn mark_processed(&mut self, entity_id: &str) {
        self.processed_ids.insert(entity_id.to_string());
        self.succeeded += 1;
    }

    pub fn already_processed(&self, entity_id: &str) -> bool {
        self.processed_ids.contains(entity_id)
    }
}

/// Persists run state as one JSON object per run date in the object store.
pub struct RunStateStore {
    store: Arc<dyn ObjectStore>,
}

impl RunStateStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn key(run_date: NaiveDate) -> String {
        format!("run-state/{run_date}.json")
    }

    /// Load the state for a run date, or a fresh one if none was persisted.
    /// A record that no longer parses is treated as a storage error rather
    /// than silently restarting the period.
    pub async fn load(&self, run_date: NaiveDate) -> BillingResult<RunState> {
        match self.store.get(&Self::key(run_date)).await? {
            None => Ok(RunState::new(run_date)),
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                BillingError::storage(format!("run state for {run_date} is unreadable: {e}"))
            }),
        }
    }

    pub async fn persist(&self, state: &RunState) -> BillingResult<()> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| BillingError::storage(format!("run state encode: {e}")))?;
        self.store
            .put(&Self::key(state.run_date), bytes, "application/json")
            .await?;
        Ok(())
    }

    /// Operator-requested reset: overwrite the period with an empty record.
    pub async fn clear(&self, run_date: NaiveDate) -> BillingResult<()> {
        self.persist(&RunState::new(run_date)).await
    }
}

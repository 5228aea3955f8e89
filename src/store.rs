//! Persistence of execution records.
//!
//! The engine only needs `save` plus paged history reads. Retention is
//! applied per job after each save; evicted records are gone.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::EngineError;
use crate::model::{ExecutionRecord, ExecutionState};

/// One page of a history listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub offset: usize,
    pub limit: usize,
    /// Matching records across all pages.
    pub total: usize,
}

pub trait ExecutionStore: Send + Sync {
    /// Inserts or replaces the record with the same id.
    fn save(&self, record: &ExecutionRecord) -> Result<(), EngineError>;

    /// Keeps the `keep` newest records of `job_id` and drops the rest.
    fn apply_retention(&self, job_id: &str, keep: usize) -> Result<usize, EngineError>;

    /// Records of `job_id`, newest first, optionally filtered by state.
    /// A `limit` of zero is rejected with [`EngineError::Store`].
    fn load_history(
        &self,
        job_id: &str,
        state: Option<ExecutionState>,
        offset: usize,
        limit: usize,
    ) -> Result<Page<ExecutionRecord>, EngineError>;

    fn latest(&self, job_id: &str) -> Result<Option<ExecutionRecord>, EngineError> {
        Ok(self.load_history(job_id, None, 0, 1)?.items.into_iter().next())
    }

    /// `(job id, job name)` of every job whose most recent record is FAILED.
    fn failed_jobs(&self) -> Result<Vec<(String, String)>, EngineError>;
}

/// Process-local store. Records per job are kept oldest first.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    records: RwLock<HashMap<String, VecDeque<ExecutionRecord>>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    fn save(&self, record: &ExecutionRecord) -> Result<(), EngineError> {
        let mut records = self.records.write();
        let history = records.entry(record.job_id.clone()).or_default();
        match history.iter_mut().find(|existing| existing.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => history.push_back(record.clone()),
        }
        Ok(())
    }

    fn apply_retention(&self, job_id: &str, keep: usize) -> Result<usize, EngineError> {
        let mut records = self.records.write();
        let Some(history) = records.get_mut(job_id) else {
            return Ok(0);
        };
        let mut evicted = 0;
        while history.len() > keep {
            history.pop_front();
            evicted += 1;
        }
        Ok(evicted)
    }

    fn load_history(
        &self,
        job_id: &str,
        state: Option<ExecutionState>,
        offset: usize,
        limit: usize,
    ) -> Result<Page<ExecutionRecord>, EngineError> {
        if limit == 0 {
            return Err(EngineError::Store("page limit must be at least 1".into()));
        }
        let records = self.records.read();
        let matching: Vec<&ExecutionRecord> = records
            .get(job_id)
            .into_iter()
            .flat_map(|history| history.iter().rev())
            .filter(|record| state.is_none_or(|wanted| record.state == wanted))
            .collect();

        Ok(Page {
            total: matching.len(),
            items: matching.into_iter().skip(offset).take(limit).cloned().collect(),
            offset,
            limit,
        })
    }

    fn failed_jobs(&self) -> Result<Vec<(String, String)>, EngineError> {
        let records = self.records.read();
        let mut jobs: Vec<(String, String)> = records
            .values()
            .filter_map(|history| history.back())
            .filter(|latest| latest.state == ExecutionState::Failed)
            .map(|latest| (latest.job_id.clone(), latest.job_name.clone()))
            .collect();
        jobs.sort();
        Ok(jobs)
    }
}

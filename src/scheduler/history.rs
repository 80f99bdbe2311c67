//! Consumers of suite run results.
//!
//! Every finished run is handed to each registered [`ResultSink`], tagged by
//! task, deployment and suite. Metrics exporters plug in here; [`RunHistory`]
//! keeps the latest run per task for status reporting.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{info, warn};

use crate::suite::TestExecutionResult;

/// Receives every finished suite run.
pub trait ResultSink: Send + Sync {
    fn record(&self, task_id: &str, result: &TestExecutionResult);
}

/// Logs one summary line per run.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ResultSink for LogSink {
    fn record(&self, task_id: &str, result: &TestExecutionResult) {
        if result.success {
            info!(
                task = %task_id,
                deployment = %result.deployment_name,
                suite = %result.suite_name,
                tests = result.tests_run,
                duration_ms = result.duration_ms,
                "smoke test passed"
            );
        } else if let Some(error) = &result.execution_error {
            warn!(
                task = %task_id,
                deployment = %result.deployment_name,
                suite = %result.suite_name,
                %error,
                "smoke test could not run"
            );
        } else {
            warn!(
                task = %task_id,
                deployment = %result.deployment_name,
                suite = %result.suite_name,
                failed = result.failure_count,
                tests = result.tests_run,
                failures = ?result.failure_messages,
                "smoke test failed"
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Success,
    Failed,
    Aborted,
}

impl RunStatus {
    fn of(result: &TestExecutionResult) -> Self {
        if result.execution_error.is_some() {
            RunStatus::Aborted
        } else if result.success {
            RunStatus::Success
        } else {
            RunStatus::Failed
        }
    }
}

/// A record of the most recent run of one task.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub task_id: String,
    pub status: RunStatus,
    pub result: TestExecutionResult,
}

/// Aggregate counters across all runs seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub runs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub aborted: u64,
}

#[derive(Debug, Default)]
struct HistoryInner {
    latest: BTreeMap<String, HistoryEntry>,
    totals: RunTotals,
}

/// In-memory store of the latest run per task.
#[derive(Debug, Clone, Default)]
pub struct RunHistory {
    inner: Arc<Mutex<HistoryInner>>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HistoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn latest(&self, task_id: &str) -> Option<HistoryEntry> {
        self.lock().latest.get(task_id).cloned()
    }

    pub fn all_latest(&self) -> Vec<HistoryEntry> {
        self.lock().latest.values().cloned().collect()
    }

    pub fn totals(&self) -> RunTotals {
        self.lock().totals
    }
}

impl ResultSink for RunHistory {
    fn record(&self, task_id: &str, result: &TestExecutionResult) {
        let status = RunStatus::of(result);
        let mut inner = self.lock();
        inner.totals.runs += 1;
        match status {
            RunStatus::Success => inner.totals.succeeded += 1,
            RunStatus::Failed => inner.totals.failed += 1,
            RunStatus::Aborted => inner.totals.aborted += 1,
        }
        inner.latest.insert(
            task_id.to_string(),
            HistoryEntry {
                task_id: task_id.to_string(),
                status,
                result: result.clone(),
            },
        );
    }
}

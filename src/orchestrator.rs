//! Top-level lifecycle: validate the configuration, turn it into scheduled
//! tasks, and answer status queries.
//!
//! Validation is all-or-nothing: a configuration with any error schedules
//! nothing. Invalid schedule expressions are only warnings; those suites run
//! on the default schedule. Once validation passes, scheduling is per suite
//! and a suite that cannot be resolved is skipped without affecting the
//! others.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock, RwLockReadGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{task_id, DeploymentSpec, SmokeConfig, TestSuiteSpec};
use crate::scheduler::trigger::{self, Trigger};
use crate::scheduler::{LogSink, RescheduleSummary, ResultSink, RunHistory, ScheduleTaskError, Scheduler};
use crate::suite::{SuiteRegistry, TestExecutionResult};
use crate::validate::{self, ValidationReport};

/// Longest window [`Orchestrator::preview`] will look ahead.
pub const MAX_PREVIEW_HOURS: i64 = 24 * 366;

/// Most firings listed per task by [`Orchestrator::preview`].
pub const MAX_PREVIEW_RUNS: usize = 1000;

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("configuration is invalid: {}", .0.join("; "))]
    InvalidConfiguration(Vec<String>),
    #[error("unknown deployment '{0}'")]
    UnknownDeployment(String),
    #[error("deployment '{deployment}' has no test suite '{suite}'")]
    UnknownSuite { deployment: String, suite: String },
    #[error(transparent)]
    Schedule(#[from] ScheduleTaskError),
}

/// Snapshot reported to status endpoints and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulingStatus {
    pub configured_deployments: usize,
    pub configured_test_suites: usize,
    pub enabled_test_suites: usize,
    pub active_tasks: usize,
    pub active_task_ids: BTreeSet<String>,
}

/// One upcoming firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRun {
    pub at: DateTime<Utc>,
    pub task_id: String,
    pub trigger: String,
}

pub struct Orchestrator {
    config: RwLock<SmokeConfig>,
    scheduler: Scheduler,
    history: RunHistory,
}

impl Orchestrator {
    /// Build an orchestrator that logs every run and keeps the latest result
    /// per task.
    pub fn new(config: SmokeConfig, registry: SuiteRegistry) -> Self {
        Self::with_sinks(config, registry, Vec::new())
    }

    /// Like [`Orchestrator::new`], also forwarding results to `sinks`.
    pub fn with_sinks(
        config: SmokeConfig,
        registry: SuiteRegistry,
        sinks: Vec<Arc<dyn ResultSink>>,
    ) -> Self {
        let history = RunHistory::new();
        let mut all: Vec<Arc<dyn ResultSink>> = vec![Arc::new(LogSink), Arc::new(history.clone())];
        all.extend(sinks);
        let scheduler = Scheduler::new(Arc::new(registry), &config.scheduler, all);
        Self {
            config: RwLock::new(config),
            scheduler,
            history,
        }
    }

    fn config_read(&self) -> RwLockReadGuard<'_, SmokeConfig> {
        self.config.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A copy of the active configuration.
    pub fn config(&self) -> SmokeConfig {
        self.config_read().clone()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    /// Called once at process start.
    pub fn initialize(&self) -> Result<RescheduleSummary, OrchestrationError> {
        info!(
            deployments = self.config_read().deployments.len(),
            suites = self.scheduler.registry().len(),
            "initializing smoke-test orchestration"
        );
        self.validate_and_schedule_all()
    }

    /// Problems in the active configuration.
    pub fn validate(&self) -> ValidationReport {
        validate::validate(&self.config_read(), self.scheduler.registry())
    }

    /// Turn a report into the gate's verdict, logging what it found.
    fn gate(report: ValidationReport) -> Result<(), OrchestrationError> {
        if !report.schedule_warnings.is_empty() {
            warn!(
                count = report.schedule_warnings.len(),
                "some suites will run on the default schedule"
            );
        }
        if report.is_usable() {
            return Ok(());
        }
        for e in &report.errors {
            error!(problem = %e, "configuration error");
        }
        Err(OrchestrationError::InvalidConfiguration(report.errors))
    }

    /// Validate the active configuration and, only if it has no errors,
    /// (re)schedule every enabled suite in it.
    pub fn validate_and_schedule_all(&self) -> Result<RescheduleSummary, OrchestrationError> {
        let config = self.config_read();
        if let Err(e) = Self::gate(validate::validate(&config, self.scheduler.registry())) {
            error!("configuration invalid, nothing scheduled");
            return Err(e);
        }

        let summary = self.scheduler.reschedule_all(&config);
        if summary.skipped > 0 {
            warn!(skipped = summary.skipped, "some suites could not be scheduled");
        }
        Ok(summary)
    }

    /// Rebuild every task from the active configuration.
    pub fn refresh_schedules(&self) -> Result<RescheduleSummary, OrchestrationError> {
        info!("refreshing schedules");
        self.validate_and_schedule_all()
    }

    /// Swap in `candidate` if it validates, then refresh. An invalid
    /// candidate leaves the active configuration and its tasks untouched.
    pub fn replace_config(&self, candidate: SmokeConfig) -> Result<RescheduleSummary, OrchestrationError> {
        if let Err(e) = Self::gate(validate::validate(&candidate, self.scheduler.registry())) {
            warn!("rejected new configuration, keeping current one");
            return Err(e);
        }
        {
            let mut config = self.config.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            *config = candidate;
        }
        self.refresh_schedules()
    }

    fn lookup(
        &self,
        deployment_key: &str,
        suite_identifier: &str,
    ) -> Result<(DeploymentSpec, TestSuiteSpec), OrchestrationError> {
        let config = self.config_read();
        let deployment = config
            .deployments
            .get(deployment_key)
            .ok_or_else(|| OrchestrationError::UnknownDeployment(deployment_key.to_string()))?;
        let suite = deployment
            .suite(suite_identifier)
            .ok_or_else(|| OrchestrationError::UnknownSuite {
                deployment: deployment_key.to_string(),
                suite: suite_identifier.to_string(),
            })?;
        Ok((deployment.clone(), suite.clone()))
    }

    /// Schedule one configured, enabled suite. Returns whether a task is now
    /// registered for it.
    pub fn schedule_one(&self, deployment_key: &str, suite_identifier: &str) -> bool {
        let (deployment, suite) = match self.lookup(deployment_key, suite_identifier) {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "cannot schedule");
                return false;
            }
        };
        match self.scheduler.schedule(&deployment, &suite) {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!(
                    deployment = %deployment_key,
                    suite = %suite_identifier,
                    error = %e,
                    "could not schedule suite"
                );
                false
            }
        }
    }

    /// Cancel the task of one pair. Returns whether a task was removed.
    pub fn cancel_one(&self, deployment_key: &str, suite_identifier: &str) -> bool {
        self.scheduler.cancel(&task_id(deployment_key, suite_identifier))
    }

    /// Run one configured pair now, outside its trigger.
    pub async fn run_now(
        &self,
        deployment_key: &str,
        suite_identifier: &str,
    ) -> Result<TestExecutionResult, OrchestrationError> {
        let (deployment, suite) = self.lookup(deployment_key, suite_identifier)?;
        Ok(self.scheduler.run_once(&deployment, &suite).await?)
    }

    pub fn status(&self) -> SchedulingStatus {
        let (configured_deployments, configured_test_suites, enabled_test_suites) = {
            let config = self.config_read();
            (
                config.deployments.len(),
                config.suite_count(),
                config.enabled_suite_count(),
            )
        };
        let active_task_ids = self.scheduler.active_task_ids();
        SchedulingStatus {
            configured_deployments,
            configured_test_suites,
            enabled_test_suites,
            active_tasks: active_task_ids.len(),
            active_task_ids,
        }
    }

    /// Firings of the enabled suites in the active configuration within
    /// the next `hours`, earliest first. Nothing is scheduled or run.
    pub fn preview(&self, hours: u64) -> Vec<PlannedRun> {
        let planned: Vec<(String, Trigger)> = self
            .config_read()
            .suite_entries()
            .filter(|(_, suite)| suite.enabled)
            .map(|(deployment, suite)| {
                (
                    task_id(&deployment.key, &suite.identifier),
                    trigger::parse(Some(&suite.schedule)),
                )
            })
            .collect();

        let now = Utc::now();
        let hours = i64::try_from(hours).unwrap_or(i64::MAX).min(MAX_PREVIEW_HOURS);
        let end = now + chrono::Duration::hours(hours);
        let mut runs = Vec::new();
        for (id, trigger) in planned {
            let label = trigger.to_string();
            let mut after = now;
            let mut listed = 0;
            // Interval tasks fire as soon as they are scheduled.
            if matches!(trigger, Trigger::Interval(_)) {
                runs.push(PlannedRun {
                    at: now,
                    task_id: id.clone(),
                    trigger: label.clone(),
                });
                listed += 1;
            }
            // Page through firings until the window is passed.
            while listed < MAX_PREVIEW_RUNS {
                let batch = trigger.upcoming(after, 64);
                let Some(last) = batch.last().copied() else { break };
                for at in batch.into_iter().take_while(|at| *at <= end) {
                    if listed == MAX_PREVIEW_RUNS {
                        break;
                    }
                    runs.push(PlannedRun {
                        at,
                        task_id: id.clone(),
                        trigger: label.clone(),
                    });
                    listed += 1;
                }
                if last > end {
                    break;
                }
                after = last;
            }
        }
        runs.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.task_id.cmp(&b.task_id)));
        runs
    }

    /// Stop all tasks and wait for in-flight runs up to the configured
    /// timeout.
    pub async fn shutdown(&self) -> bool {
        let timeout = self.config_read().scheduler.shutdown_timeout();
        self.scheduler.shutdown(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::{TestOutcome, TestResult, TestSuite};

    struct Quick;

    #[async_trait::async_trait]
    impl TestSuite for Quick {
        fn tests(&self) -> Vec<&'static str> {
            vec!["ok"]
        }

        async fn run(&self, _test: &str) -> TestResult {
            Ok(TestOutcome::Passed)
        }
    }

    fn registry() -> SuiteRegistry {
        let mut r = SuiteRegistry::new();
        r.register("smoke.Quick", |_ctx| Ok(Quick))
            .register("smoke.Other", |_ctx| Ok(Quick));
        r
    }

    fn config(toml: &str) -> SmokeConfig {
        SmokeConfig::from_toml(toml).unwrap()
    }

    const TWO_DEPLOYMENTS: &str = r#"
[deployments.a]
name = "A"
url = "https://a.example.com"
test_suites = [
  { identifier = "smoke.Quick", schedule = "0 */10 * * * *" },
  { identifier = "smoke.Other", schedule = "1h", enabled = false },
]

[deployments.b]
name = "B"
url = "https://b.example.com"
test_suites = [{ identifier = "smoke.Quick", schedule = "0 0 * * * *" }]
"#;

    #[tokio::test]
    async fn test_initialize_schedules_enabled_suites() {
        let o = Orchestrator::new(config(TWO_DEPLOYMENTS), registry());
        let summary = o.initialize().unwrap();
        assert_eq!(summary.scheduled, 2);
        assert_eq!(summary.disabled, 1);

        let status = o.status();
        assert_eq!(status.configured_deployments, 2);
        assert_eq!(status.configured_test_suites, 3);
        assert_eq!(status.enabled_test_suites, 2);
        assert_eq!(status.active_tasks, 2);
        assert_eq!(
            status.active_task_ids,
            BTreeSet::from(["a-Quick".to_string(), "b-Quick".to_string()])
        );
    }

    #[tokio::test]
    async fn test_invalid_configuration_schedules_nothing() {
        let o = Orchestrator::new(
            config(
                r#"
[deployments.a]
name = "A"
url = "https://a.example.com"
test_suites = [{ identifier = "smoke.Quick", schedule = "10m" }]

[deployments.b]
name = "B"
url = "not-a-url"
test_suites = [{ identifier = "smoke.Quick", schedule = "10m" }]
"#,
            ),
            registry(),
        );
        match o.validate_and_schedule_all() {
            Err(OrchestrationError::InvalidConfiguration(errors)) => {
                assert!(errors.iter().any(|e| e.contains("'b'")));
            }
            other => panic!("expected invalid configuration, got {:?}", other),
        }
        assert!(o.status().active_task_ids.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_and_cancel_one() {
        let o = Orchestrator::new(config(TWO_DEPLOYMENTS), registry());

        assert!(o.schedule_one("a", "smoke.Quick"));
        assert!(o.schedule_one("a", "smoke.Quick"));
        assert_eq!(o.status().active_tasks, 1);

        // Disabled, unknown deployment, unknown suite.
        assert!(!o.schedule_one("a", "smoke.Other"));
        assert!(!o.schedule_one("zzz", "smoke.Quick"));
        assert!(!o.schedule_one("b", "smoke.Other"));

        assert!(o.cancel_one("a", "smoke.Quick"));
        assert!(!o.cancel_one("a", "smoke.Quick"));
        assert_eq!(o.status().active_tasks, 0);
    }

    #[tokio::test]
    async fn test_refresh_restores_task_set() {
        let o = Orchestrator::new(config(TWO_DEPLOYMENTS), registry());
        o.initialize().unwrap();
        let before = o.status().active_task_ids;

        o.scheduler().cancel_all();
        assert!(o.status().active_task_ids.is_empty());
        o.refresh_schedules().unwrap();
        assert_eq!(o.status().active_task_ids, before);
    }

    #[tokio::test]
    async fn test_replace_config() {
        let o = Orchestrator::new(config(TWO_DEPLOYMENTS), registry());
        o.initialize().unwrap();

        let bad = config(
            r#"
[deployments.c]
name = ""
url = "https://c.example.com"
"#,
        );
        assert!(matches!(
            o.replace_config(bad),
            Err(OrchestrationError::InvalidConfiguration(_))
        ));
        assert_eq!(o.status().active_tasks, 2);

        let good = config(
            r#"
[deployments.c]
name = "C"
url = "https://c.example.com"
test_suites = [{ identifier = "smoke.Other", schedule = "30m" }]
"#,
        );
        o.replace_config(good).unwrap();
        assert_eq!(
            o.status().active_task_ids,
            BTreeSet::from(["c-Other".to_string()])
        );
        assert_eq!(o.config().deployments.len(), 1);
    }

    #[tokio::test]
    async fn test_run_now_records_history() {
        let o = Orchestrator::new(config(TWO_DEPLOYMENTS), registry());
        let result = o.run_now("b", "smoke.Quick").await.unwrap();
        assert!(result.success);
        assert_eq!(result.deployment_name, "B");
        assert!(o.history().latest("b-Quick").is_some());

        assert!(matches!(
            o.run_now("b", "smoke.Nope").await,
            Err(OrchestrationError::UnknownSuite { .. })
        ));
    }

    #[tokio::test]
    async fn test_preview_orders_runs() {
        let o = Orchestrator::new(config(TWO_DEPLOYMENTS), registry());
        let runs = o.preview(2);
        assert_eq!(o.status().active_tasks, 0);
        // Every 10 minutes for a-Quick, hourly for b-Quick.
        assert!(runs.iter().filter(|r| r.task_id == "a-Quick").count() >= 11);
        assert!(runs.iter().filter(|r| r.task_id == "b-Quick").count() >= 1);
        assert!(runs.windows(2).all(|w| w[0].at <= w[1].at));
    }

    #[tokio::test]
    async fn test_preview_includes_immediate_interval_run() {
        let o = Orchestrator::new(
            config(
                r#"
[deployments.a]
name = "A"
url = "https://a.example.com"
test_suites = [{ identifier = "smoke.Quick", schedule = "30m" }]
"#,
            ),
            registry(),
        );
        let before = Utc::now();
        let runs = o.preview(1);
        assert_eq!(runs.len(), 3, "{:?}", runs);
        assert!(runs[0].at >= before && runs[0].at <= Utc::now());
        assert_eq!(runs[1].at - runs[0].at, chrono::Duration::minutes(30));
        assert_eq!(runs[2].at - runs[0].at, chrono::Duration::hours(1));
        assert!(runs.iter().all(|r| r.trigger == "every 1800s"));
    }

    #[tokio::test]
    async fn test_bad_schedule_does_not_block() {
        let o = Orchestrator::new(
            config(
                r#"
[deployments.a]
name = "A"
url = "https://a.example.com"
test_suites = [{ identifier = "smoke.Quick", schedule = "every ten minutes" }]
"#,
            ),
            registry(),
        );
        let report = o.validate();
        assert!(report.errors.is_empty());
        assert_eq!(report.schedule_warnings.len(), 1);

        assert_eq!(o.initialize().unwrap().scheduled, 1);
        assert_eq!(o.scheduler().trigger_of("a-Quick"), Some(Trigger::fallback()));
    }
}

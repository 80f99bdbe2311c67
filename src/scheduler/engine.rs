//! Task registry and timer loops.
//!
//! Each enabled `(deployment, suite)` pair becomes one task with a
//! deterministic id. A task owns a timer loop that, on every firing, submits a
//! suite run to the shared worker pool and goes straight back to waiting, so a
//! slow suite never delays any trigger. Cancelling a task stops future
//! firings; a run already in the pool is left to finish.
//!
//! ```text
//! schedule() ─► tasks[id] = { trigger loop, cancel token }
//!                  │ fire
//!                  ▼
//!            worker pool (semaphore) ─► SuiteExecutor ─► ResultSinks
//! ```

use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::history::ResultSink;
use super::trigger::{self, Trigger};
use crate::config::{task_id, DeploymentSpec, SchedulerConfig, SmokeConfig, TestSuiteSpec};
use crate::suite::{
    panic_message, DeploymentContext, InstantiationError, SuiteExecutor, SuiteRegistry, SuiteType,
    TestExecutionResult,
};

#[derive(Debug, Error)]
pub enum ScheduleTaskError {
    #[error(transparent)]
    Instantiation(#[from] InstantiationError),
    #[error("no tokio runtime available to drive the task")]
    NoRuntime,
    #[error("suite run aborted: {0}")]
    RunAborted(String),
}

/// Counts produced by [`Scheduler::reschedule_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RescheduleSummary {
    pub scheduled: usize,
    pub disabled: usize,
    pub skipped: usize,
}

/// What one task runs and against which deployment.
struct Binding {
    task_id: String,
    suite_type: SuiteType,
    context: DeploymentContext,
    /// Set while a run of this registration is in flight.
    running: AtomicBool,
}

/// Clears the in-flight flag when a run ends, however it ends.
struct RunningGuard(Arc<Binding>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

/// A live registration in the task map.
struct ScheduledTask {
    trigger: Trigger,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.handle.is_finished()
    }
}

/// Everything a firing needs, shared by all timer loops.
struct Runner {
    executor: SuiteExecutor,
    sinks: Vec<Arc<dyn ResultSink>>,
    pool: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl Runner {
    /// Run one suite on the pool and publish the result.
    async fn run(&self, binding: &Binding) -> Result<TestExecutionResult, ScheduleTaskError> {
        let _permit = self
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ScheduleTaskError::RunAborted("worker pool closed".to_string()))?;

        let outcome = AssertUnwindSafe(self.executor.execute(&binding.suite_type, &binding.context))
            .catch_unwind()
            .await;

        match outcome {
            Ok(result) => {
                self.publish(&binding.task_id, &result);
                Ok(result)
            }
            Err(payload) => Err(ScheduleTaskError::RunAborted(panic_message(payload.as_ref()))),
        }
    }

    fn publish(&self, task_id: &str, result: &TestExecutionResult) {
        for sink in &self.sinks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink.record(task_id, result))) {
                error!(task = %task_id, panic = %panic_message(payload.as_ref()), "result sink panicked");
            }
        }
    }

    /// Submit a run of `binding` to the pool unless one is still in flight.
    fn fire(runner: &Arc<Self>, binding: &Arc<Binding>) {
        if binding.running.swap(true, Ordering::SeqCst) {
            warn!(task = %binding.task_id, "previous run still in progress, skipping this firing");
            return;
        }
        debug!(task = %binding.task_id, "trigger fired");

        let guard = RunningGuard(Arc::clone(binding));
        let tracker = runner.tracker.clone();
        let runner = Arc::clone(runner);
        tracker.spawn(async move {
            let binding = Arc::clone(&guard.0);
            if let Err(e) = runner.run(&binding).await {
                error!(task = %binding.task_id, error = %e, "scheduled run failed");
            }
            drop(guard);
        });
    }

    /// Timer loop of one task; exits when `cancel` fires.
    async fn drive(self: Arc<Self>, binding: Arc<Binding>, trigger: Trigger, cancel: CancellationToken) {
        match trigger {
            Trigger::Interval(period) => {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => Runner::fire(&self, &binding),
                    }
                }
            }
            Trigger::Calendar { .. } => loop {
                let Some(delay) = trigger.next_delay(Utc::now()) else {
                    warn!(task = %binding.task_id, %trigger, "calendar has no future firing, task ends");
                    break;
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => Runner::fire(&self, &binding),
                }
            },
        }
        debug!(task = %binding.task_id, "timer loop stopped");
    }
}

struct Inner {
    registry: Arc<SuiteRegistry>,
    runner: Arc<Runner>,
    tasks: Mutex<HashMap<String, ScheduledTask>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let tasks = self
            .tasks
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.values() {
            task.cancel.cancel();
        }
    }
}

/// Owns every live task. Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<SuiteRegistry>,
        config: &SchedulerConfig,
        sinks: Vec<Arc<dyn ResultSink>>,
    ) -> Self {
        let runner = Runner {
            executor: SuiteExecutor::new(config.test_timeout()),
            sinks,
            pool: Arc::new(Semaphore::new(config.pool_size.max(1))),
            tracker: TaskTracker::new(),
        };
        Self {
            inner: Arc::new(Inner {
                registry,
                runner: Arc::new(runner),
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, ScheduledTask>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn registry(&self) -> &SuiteRegistry {
        &self.inner.registry
    }

    fn bind(
        &self,
        deployment: &DeploymentSpec,
        suite: &TestSuiteSpec,
    ) -> Result<Arc<Binding>, InstantiationError> {
        let suite_type = self.inner.registry.resolve(&suite.identifier)?;
        Ok(Arc::new(Binding {
            task_id: task_id(&deployment.key, &suite.identifier),
            suite_type,
            context: DeploymentContext::new(&deployment.name, &deployment.url),
            running: AtomicBool::new(false),
        }))
    }

    /// Register a timer for `suite` on `deployment`, replacing any task with
    /// the same id. Returns the task id, or `None` for a disabled suite.
    pub fn schedule(
        &self,
        deployment: &DeploymentSpec,
        suite: &TestSuiteSpec,
    ) -> Result<Option<String>, ScheduleTaskError> {
        if !suite.enabled {
            info!(
                deployment = %deployment.key,
                suite = %suite.identifier,
                "suite disabled, not scheduling"
            );
            return Ok(None);
        }

        self.schedule_with(deployment, suite, trigger::parse(Some(&suite.schedule)))
            .map(Some)
    }

    fn schedule_with(
        &self,
        deployment: &DeploymentSpec,
        suite: &TestSuiteSpec,
        trigger: Trigger,
    ) -> Result<String, ScheduleTaskError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ScheduleTaskError::NoRuntime)?;
        let binding = self.bind(deployment, suite)?;
        let id = binding.task_id.clone();
        let cancel = CancellationToken::new();

        let mut tasks = self.tasks();
        let handle = runtime.spawn(Arc::clone(&self.inner.runner).drive(
            binding,
            trigger.clone(),
            cancel.clone(),
        ));
        let replaced = tasks.insert(
            id.clone(),
            ScheduledTask {
                trigger: trigger.clone(),
                cancel,
                handle,
            },
        );
        drop(tasks);

        if let Some(previous) = replaced {
            previous.cancel.cancel();
            debug!(task = %id, "replaced existing registration");
        }
        info!(task = %id, %trigger, "scheduled");
        Ok(id)
    }

    /// Stop future firings of `task_id`. Returns whether a task was removed.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.tasks().remove(task_id) {
            Some(task) => {
                task.cancel.cancel();
                info!(task = %task_id, "cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every tracked task; returns how many were removed.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.tasks().drain().collect();
        for (_, task) in &drained {
            task.cancel.cancel();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "cancelled all tasks");
        }
        drained.len()
    }

    /// Cancel everything, then schedule every enabled pair in `config`.
    pub fn reschedule_all(&self, config: &SmokeConfig) -> RescheduleSummary {
        self.cancel_all();

        let mut summary = RescheduleSummary::default();
        for (deployment, suite) in config.suite_entries() {
            match self.schedule(deployment, suite) {
                Ok(Some(_)) => summary.scheduled += 1,
                Ok(None) => summary.disabled += 1,
                Err(e) => {
                    warn!(
                        deployment = %deployment.key,
                        suite = %suite.identifier,
                        error = %e,
                        "could not schedule suite, skipping"
                    );
                    summary.skipped += 1;
                }
            }
        }
        info!(
            scheduled = summary.scheduled,
            disabled = summary.disabled,
            skipped = summary.skipped,
            "rescheduled all tasks"
        );
        summary
    }

    /// Ids of live tasks. Entries whose timer has ended are evicted.
    pub fn active_task_ids(&self) -> BTreeSet<String> {
        let mut tasks = self.tasks();
        tasks.retain(|_, task| task.is_live());
        tasks.keys().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.active_task_ids().len()
    }

    /// The effective trigger of a live task.
    pub fn trigger_of(&self, task_id: &str) -> Option<Trigger> {
        self.tasks()
            .get(task_id)
            .filter(|task| task.is_live())
            .map(|task| task.trigger.clone())
    }

    /// Live tasks and their triggers, ordered by id.
    pub fn planned(&self) -> Vec<(String, Trigger)> {
        let tasks = self.tasks();
        let mut planned: Vec<_> = tasks
            .iter()
            .filter(|(_, task)| task.is_live())
            .map(|(id, task)| (id.clone(), task.trigger.clone()))
            .collect();
        planned.sort_by(|a, b| a.0.cmp(&b.0));
        planned
    }

    /// Resolve and run one pair immediately, outside any trigger.
    pub async fn run_once(
        &self,
        deployment: &DeploymentSpec,
        suite: &TestSuiteSpec,
    ) -> Result<TestExecutionResult, ScheduleTaskError> {
        let binding = self.bind(deployment, suite)?;
        info!(task = %binding.task_id, "manual run requested");
        self.inner.runner.run(&binding).await
    }

    /// Stop all triggers and wait up to `timeout` for in-flight runs.
    /// Returns whether every run finished in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel_all();
        let tracker = &self.inner.runner.tracker;
        tracker.close();
        match tokio::time::timeout(timeout, tracker.wait()).await {
            Ok(()) => {
                info!("scheduler stopped, no runs in flight");
                true
            }
            Err(_) => {
                warn!(
                    in_flight = tracker.len(),
                    timeout_secs = timeout.as_secs(),
                    "shutdown timeout elapsed, abandoning in-flight runs"
                );
                false
            }
        }
    }
}

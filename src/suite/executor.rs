//! Runs one suite instance's tests once and reports the outcome.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{panic_message, DeploymentContext, SuiteType, TestOutcome, TestSuite};

/// Outcome of one suite run against one deployment.
#[derive(Debug, Clone, Serialize)]
pub struct TestExecutionResult {
    pub run_id: Uuid,
    pub deployment_name: String,
    pub suite_name: String,
    pub success: bool,
    pub tests_run: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,
    pub duration_ms: u64,
    pub failure_messages: Vec<String>,
    /// Set only when the suite could not be instantiated.
    pub execution_error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl TestExecutionResult {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Whether the suite never got as far as running a test.
    pub fn is_execution_failure(&self) -> bool {
        self.execution_error.is_some()
    }
}

/// Runs resolved suites test by test.
#[derive(Debug, Clone)]
pub struct SuiteExecutor {
    test_timeout: Duration,
}

impl Default for SuiteExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

impl SuiteExecutor {
    pub fn new(test_timeout: Duration) -> Self {
        Self { test_timeout }
    }

    /// Instantiate `suite_type` for `context` and run every test it lists.
    ///
    /// Never fails: instantiation problems and failing tests are both
    /// reported inside the returned result.
    pub async fn execute(
        &self,
        suite_type: &SuiteType,
        context: &DeploymentContext,
    ) -> TestExecutionResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut result = TestExecutionResult {
            run_id: Uuid::new_v4(),
            deployment_name: context.name().to_string(),
            suite_name: suite_type.simple_name().to_string(),
            success: false,
            tests_run: 0,
            success_count: 0,
            failure_count: 0,
            skipped_count: 0,
            duration_ms: 0,
            failure_messages: Vec::new(),
            execution_error: None,
            started_at,
        };

        match suite_type.instantiate(context) {
            Ok(suite) => self.run_tests(suite.as_ref(), &mut result).await,
            Err(e) => {
                warn!(
                    deployment = %result.deployment_name,
                    suite = %result.suite_name,
                    error = %e,
                    "suite instantiation failed"
                );
                result.failure_count = 1;
                result.execution_error = Some(e.to_string());
            }
        }

        result.duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        result.success = result.failure_count == 0 && result.execution_error.is_none();

        info!(
            deployment = %result.deployment_name,
            suite = %result.suite_name,
            run = %result.tests_run,
            passed = %result.success_count,
            failed = %result.failure_count,
            skipped = %result.skipped_count,
            duration_ms = %result.duration_ms,
            "suite finished"
        );
        result
    }

    async fn run_tests(&self, suite: &dyn TestSuite, result: &mut TestExecutionResult) {
        for test in suite.tests() {
            result.tests_run += 1;
            let outcome = tokio::time::timeout(
                self.test_timeout,
                AssertUnwindSafe(suite.run(test)).catch_unwind(),
            )
            .await;

            match outcome {
                Ok(Ok(Ok(TestOutcome::Passed))) => {
                    debug!(suite = %result.suite_name, test, "passed");
                    result.success_count += 1;
                }
                Ok(Ok(Ok(TestOutcome::Skipped(reason)))) => {
                    debug!(suite = %result.suite_name, test, %reason, "skipped");
                    result.skipped_count += 1;
                }
                Ok(Ok(Err(e))) => {
                    self.fail(result, test, format!("{:#}", e));
                }
                Ok(Err(payload)) => {
                    self.fail(result, test, format!("panicked: {}", panic_message(payload.as_ref())));
                }
                Err(_) => {
                    self.fail(
                        result,
                        test,
                        format!("timed out after {:?}", self.test_timeout),
                    );
                }
            }
        }
    }

    fn fail(&self, result: &mut TestExecutionResult, test: &str, message: String) {
        warn!(
            deployment = %result.deployment_name,
            suite = %result.suite_name,
            test,
            %message,
            "test failed"
        );
        result.failure_count += 1;
        result.failure_messages.push(format!("{}: {}", test, message));
    }
}

//! End-to-end orchestration scenarios against the library API.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tripwatch::config::{DeploymentSpec, SmokeConfig, TestSuiteSpec};
use tripwatch::orchestrator::{OrchestrationError, Orchestrator};
use tripwatch::scheduler::{is_valid, parse, ResultSink, Trigger};
use tripwatch::suite::{
    DeploymentContext, SuiteRegistry, TestExecutionResult, TestOutcome, TestResult, TestSuite,
};
use tripwatch::suites::builtin_registry;

fn ids(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn deployment_a(schedule: &str) -> SmokeConfig {
    SmokeConfig::from_toml(&format!(
        r#"
[deployments.a]
name = "Deployment A"
url = "https://a.example.com"
test_suites = [{{ identifier = "ExampleSuite", schedule = "{}", enabled = true }}]
"#,
        schedule
    ))
    .unwrap()
}

#[tokio::test]
async fn test_single_deployment_is_scheduled() {
    let o = Orchestrator::new(deployment_a("0 */10 * * * *"), builtin_registry());
    o.initialize().unwrap();

    let status = o.status();
    assert_eq!(status.configured_deployments, 1);
    assert_eq!(status.enabled_test_suites, 1);
    assert_eq!(status.active_task_ids, ids(&["a-ExampleSuite"]));
    assert_eq!(
        o.scheduler().planned(),
        vec![("a-ExampleSuite".to_string(), parse(Some("0 */10 * * * *")))]
    );

    o.scheduler().cancel_all();
}

#[tokio::test]
async fn test_bogus_schedule_falls_back_to_default() {
    assert!(!is_valid("bogus"));
    assert!(parse(Some("bogus")).is_fallback());

    let o = Orchestrator::new(deployment_a("bogus"), builtin_registry());
    let summary = o.initialize().unwrap();
    assert_eq!(summary.scheduled, 1);

    let status = o.status();
    assert_eq!(status.configured_deployments, 1);
    assert_eq!(status.enabled_test_suites, 1);
    assert_eq!(status.active_task_ids, ids(&["a-ExampleSuite"]));
    assert_eq!(o.scheduler().trigger_of("a-ExampleSuite"), Some(Trigger::fallback()));

    // Still reported, just not blocking.
    let report = o.validate();
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.schedule_warnings.len(), 1);
    assert!(report.schedule_warnings[0].contains("'a'"));
    assert!(report.schedule_warnings[0].contains("bogus"));

    o.scheduler().cancel_all();
}

#[tokio::test]
async fn test_invalid_url_blocks_all_scheduling() {
    let config = SmokeConfig::from_toml(
        r#"
[deployments.a]
name = "Deployment A"
url = "https://a.example.com"
testSuites = [{ identifier = "ExampleSuite", schedule = "0 */10 * * * *" }]

[deployments.b]
name = "Deployment B"
otpUrl = "not-a-url"
testSuites = [{ identifier = "ExampleSuite", schedule = "0 */10 * * * *" }]
"#,
    )
    .unwrap();
    let o = Orchestrator::new(config, builtin_registry());

    match o.validate_and_schedule_all() {
        Err(OrchestrationError::InvalidConfiguration(errors)) => {
            assert!(errors.iter().any(|e| e.contains("'b'")), "{:?}", errors);
        }
        other => panic!("expected validation failure, got {:?}", other),
    }
    assert!(o.status().active_task_ids.is_empty());
}

struct Flaky {
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl TestSuite for Flaky {
    fn tests(&self) -> Vec<&'static str> {
        vec!["first", "second"]
    }

    async fn run(&self, test: &str) -> TestResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match test {
            "first" => Ok(TestOutcome::Passed),
            _ => anyhow::bail!("second always fails"),
        }
    }
}

struct Broken;

#[async_trait::async_trait]
impl TestSuite for Broken {
    fn tests(&self) -> Vec<&'static str> {
        vec!["never"]
    }

    async fn run(&self, _test: &str) -> TestResult {
        Ok(TestOutcome::Passed)
    }
}

#[derive(Default)]
struct Collect(std::sync::Mutex<Vec<TestExecutionResult>>);

impl ResultSink for Collect {
    fn record(&self, _task_id: &str, result: &TestExecutionResult) {
        self.0.lock().unwrap().push(result.clone());
    }
}

#[tokio::test]
async fn test_interval_suite_fires_and_failures_stay_isolated() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = SuiteRegistry::new();
    let counter = Arc::clone(&calls);
    registry
        .register("smoke.Flaky", move |_ctx: DeploymentContext| {
            Ok(Flaky { calls: Arc::clone(&counter) })
        })
        .register("smoke.Broken", |_ctx: DeploymentContext| -> anyhow::Result<Broken> {
            anyhow::bail!("cannot reach planner")
        });

    let config = SmokeConfig::from_toml(
        r#"
[scheduler]
pool_size = 2

[deployments.x]
name = "X"
url = "http://x.local:8080"
test_suites = [
  { identifier = "smoke.Flaky", schedule = "1h" },
  { identifier = "smoke.Broken", schedule = "1h" },
]
"#,
    )
    .unwrap();
    let sink = Arc::new(Collect::default());
    let o = Orchestrator::with_sinks(config, registry, vec![sink.clone() as Arc<dyn ResultSink>]);
    let summary = o.initialize().unwrap();
    assert_eq!(summary.scheduled, 2);

    // Interval triggers fire once right away.
    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.0.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both suites should report");

    let results = sink.0.lock().unwrap().clone();
    let flaky = results.iter().find(|r| r.suite_name == "Flaky").unwrap();
    assert_eq!((flaky.tests_run, flaky.success_count, flaky.failure_count), (2, 1, 1));
    assert!(flaky.failure_messages[0].contains("second always fails"));

    let broken = results.iter().find(|r| r.suite_name == "Broken").unwrap();
    assert_eq!((broken.tests_run, broken.failure_count), (0, 1));
    assert!(broken.execution_error.is_some());

    // A failing run leaves the task registered for future firings.
    assert_eq!(o.status().active_task_ids, ids(&["x-Flaky", "x-Broken"]));
    assert_eq!(o.history().totals().runs, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert!(o.shutdown().await);
    assert_eq!(o.status().active_tasks, 0);
}

#[tokio::test]
async fn test_disabled_suites_never_appear() {
    let config = SmokeConfig {
        deployments: [(
            "a".to_string(),
            DeploymentSpec::new("a", "A", "https://a.example.com")
                .with_suite(TestSuiteSpec::new("ExampleSuite", "0 0 * * * *").disabled()),
        )]
        .into_iter()
        .collect(),
        ..SmokeConfig::default()
    };
    let o = Orchestrator::new(config, builtin_registry());
    let summary = o.initialize().unwrap();
    assert_eq!((summary.scheduled, summary.disabled), (0, 1));
    assert!(!o.schedule_one("a", "ExampleSuite"));
    assert!(o.status().active_task_ids.is_empty());
}

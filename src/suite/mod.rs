//! Test suites: the capability every suite implements, the context a suite is
//! bound to, and the per-test outcomes.

use std::fmt;

use anyhow::Result;

pub mod executor;
pub mod registry;

pub use self::executor::{SuiteExecutor, TestExecutionResult};
pub use self::registry::{InstantiationError, SuiteFactory, SuiteRegistry, SuiteType};

/// Immutable deployment information handed to a suite at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeploymentContext {
    name: String,
    base_url: String,
}

impl DeploymentContext {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Join `path` onto the base URL with exactly one slash between them.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl fmt::Display for DeploymentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.base_url)
    }
}

/// Non-failing result of one test method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Skipped(String),
}

/// A test method returns `Err` to fail.
pub type TestResult = Result<TestOutcome>;

/// A named group of checks run against one deployment.
///
/// `tests` lists the test methods in the order they run; the executor calls
/// `run` once per name.
#[async_trait::async_trait]
pub trait TestSuite: Send + Sync {
    fn tests(&self) -> Vec<&'static str>;

    async fn run(&self, test: &str) -> TestResult;
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

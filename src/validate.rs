//! Configuration validation.
//!
//! Collects every problem in a candidate configuration as a readable message
//! instead of stopping at the first. Problems come in two grades: errors,
//! which make the configuration unusable, and schedule warnings, for
//! expressions that will be replaced by the default schedule when the suite is
//! scheduled. Validation has no side effects beyond logging.

use std::collections::HashMap;

use serde::Serialize;
use tracing::warn;

use crate::config::{task_id, DeploymentSpec, SmokeConfig};
use crate::scheduler::trigger;
use crate::suite::SuiteRegistry;

/// Everything found wrong with a configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    /// Problems that block scheduling.
    pub errors: Vec<String>,
    /// Invalid schedule expressions; the suite still runs on the default
    /// schedule.
    pub schedule_warnings: Vec<String>,
}

impl ValidationReport {
    /// No errors. Schedule warnings do not count.
    pub fn is_usable(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.schedule_warnings.is_empty()
    }

    /// Errors followed by schedule warnings.
    pub fn problems(&self) -> impl Iterator<Item = &String> {
        self.errors.iter().chain(&self.schedule_warnings)
    }
}

/// Check every deployment in `config` against `registry`.
pub fn validate(config: &SmokeConfig, registry: &SuiteRegistry) -> ValidationReport {
    validate_deployments(config.deployments.values(), registry)
}

/// Check `deployments` against `registry`, in order.
pub fn validate_deployments<'a>(
    deployments: impl IntoIterator<Item = &'a DeploymentSpec>,
    registry: &SuiteRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    for deployment in deployments {
        validate_deployment(deployment, registry, &mut report);
    }
    report
}

fn validate_deployment(deployment: &DeploymentSpec, registry: &SuiteRegistry, report: &mut ValidationReport) {
    let key = deployment.key.as_str();
    let errors = &mut report.errors;

    if key.trim().is_empty() {
        errors.push("deployment with a blank key".to_string());
    }
    if deployment.name.trim().is_empty() {
        errors.push(format!("deployment '{}': name must not be blank", key));
    }
    if let Err(reason) = check_url(&deployment.url) {
        errors.push(format!(
            "deployment '{}': invalid url '{}': {}",
            key, deployment.url, reason
        ));
    }

    if deployment.test_suites.is_empty() {
        warn!(deployment = %key, "deployment has no test suites, nothing will be scheduled");
        return;
    }

    // Task id -> identifier of the first enabled suite that claimed it.
    let mut claimed: HashMap<String, &str> = HashMap::new();

    for (index, suite) in deployment.test_suites.iter().enumerate() {
        if suite.identifier.trim().is_empty() {
            errors.push(format!(
                "deployment '{}': test suite #{} has a blank identifier",
                key,
                index + 1
            ));
        } else if !registry.can_instantiate(&suite.identifier) {
            errors.push(format!(
                "deployment '{}': test suite '{}' is not a registered suite",
                key, suite.identifier
            ));
        } else if suite.enabled {
            let id = task_id(key, &suite.identifier);
            if let Some(first) = claimed.get(&id) {
                errors.push(format!(
                    "deployment '{}': test suites '{}' and '{}' share task id '{}'",
                    key, first, suite.identifier, id
                ));
            } else {
                claimed.insert(id, &suite.identifier);
            }
        }

        if let Err(e) = trigger::try_parse(&suite.schedule) {
            let problem = format!(
                "deployment '{}': test suite '{}' has an invalid schedule, using '{}': {}",
                key,
                suite.identifier,
                trigger::DEFAULT_SCHEDULE,
                e
            );
            warn!(%problem, "schedule problem");
            report.schedule_warnings.push(problem);
        }
    }
}

/// An absolute `http`/`https` URL with a host.
fn check_url(url: &str) -> Result<(), String> {
    if url.trim().is_empty() {
        return Err("url must not be blank".to_string());
    }
    let lower = url.to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Err("url must start with http:// or https://".to_string());
    }
    let parsed = reqwest::Url::parse(url).map_err(|e| e.to_string())?;
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err("url has no host".to_string()),
    }
}

//! Resolution of suite identifiers to constructible suite types.
//!
//! Suites are registered up front under their identifier together with a
//! constructor. A constructor either takes the [`DeploymentContext`] or, for
//! older suites, nothing at all; the legacy form runs with no deployment
//! configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::{panic_message, DeploymentContext, TestSuite};
use crate::config::simple_name;

type ContextConstructor =
    dyn Fn(DeploymentContext) -> anyhow::Result<Box<dyn TestSuite>> + Send + Sync;
type LegacyConstructor = dyn Fn() -> anyhow::Result<Box<dyn TestSuite>> + Send + Sync;

/// How a suite type is constructed.
#[derive(Clone)]
pub enum SuiteFactory {
    ContextAware(Arc<ContextConstructor>),
    Legacy(Arc<LegacyConstructor>),
}

impl fmt::Debug for SuiteFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuiteFactory::ContextAware(_) => f.write_str("ContextAware"),
            SuiteFactory::Legacy(_) => f.write_str("Legacy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstantiationErrorKind {
    NotRegistered,
    ConstructorFailed(String),
    ConstructorPanicked(String),
}

impl fmt::Display for InstantiationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRegistered => f.write_str("no suite registered under this identifier"),
            Self::ConstructorFailed(e) => write!(f, "constructor failed: {}", e),
            Self::ConstructorPanicked(e) => write!(f, "constructor panicked: {}", e),
        }
    }
}

/// A suite identifier could not be resolved or constructed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot instantiate test suite '{identifier}': {kind}")]
pub struct InstantiationError {
    pub identifier: String,
    pub kind: InstantiationErrorKind,
}

impl InstantiationError {
    fn new(identifier: &str, kind: InstantiationErrorKind) -> Self {
        Self {
            identifier: identifier.to_string(),
            kind,
        }
    }
}

/// A resolved suite identifier, ready to be instantiated for a deployment.
#[derive(Debug, Clone)]
pub struct SuiteType {
    identifier: String,
    factory: SuiteFactory,
}

impl SuiteType {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn simple_name(&self) -> &str {
        simple_name(&self.identifier)
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self.factory, SuiteFactory::Legacy(_))
    }

    /// Construct a suite instance bound to `context`.
    ///
    /// Constructor errors and panics both surface as [`InstantiationError`].
    pub fn instantiate(
        &self,
        context: &DeploymentContext,
    ) -> Result<Box<dyn TestSuite>, InstantiationError> {
        let built = match &self.factory {
            SuiteFactory::ContextAware(ctor) => {
                let context = context.clone();
                panic::catch_unwind(AssertUnwindSafe(|| ctor(context)))
            }
            SuiteFactory::Legacy(ctor) => {
                debug!(
                    suite = %self.identifier,
                    deployment = %context.name(),
                    "legacy suite constructed without deployment context"
                );
                panic::catch_unwind(AssertUnwindSafe(|| ctor()))
            }
        };

        match built {
            Ok(Ok(suite)) => Ok(suite),
            Ok(Err(e)) => Err(InstantiationError::new(
                &self.identifier,
                InstantiationErrorKind::ConstructorFailed(format!("{:#}", e)),
            )),
            Err(payload) => Err(InstantiationError::new(
                &self.identifier,
                InstantiationErrorKind::ConstructorPanicked(panic_message(payload.as_ref())),
            )),
        }
    }
}

/// Identifier -> constructor table consulted by validation and scheduling.
#[derive(Debug, Clone, Default)]
pub struct SuiteRegistry {
    factories: BTreeMap<String, SuiteFactory>,
}

impl SuiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a suite constructed from the deployment context.
    pub fn register<S, F>(&mut self, identifier: impl Into<String>, ctor: F) -> &mut Self
    where
        S: TestSuite + 'static,
        F: Fn(DeploymentContext) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        let factory = SuiteFactory::ContextAware(Arc::new(move |ctx| {
            ctor(ctx).map(|s| Box::new(s) as Box<dyn TestSuite>)
        }));
        self.insert(identifier.into(), factory)
    }

    /// Register a suite whose constructor takes no arguments.
    pub fn register_legacy<S, F>(&mut self, identifier: impl Into<String>, ctor: F) -> &mut Self
    where
        S: TestSuite + 'static,
        F: Fn() -> anyhow::Result<S> + Send + Sync + 'static,
    {
        let factory = SuiteFactory::Legacy(Arc::new(move || {
            ctor().map(|s| Box::new(s) as Box<dyn TestSuite>)
        }));
        self.insert(identifier.into(), factory)
    }

    fn insert(&mut self, identifier: String, factory: SuiteFactory) -> &mut Self {
        if self.factories.insert(identifier.clone(), factory).is_some() {
            warn!(suite = %identifier, "suite registered twice, keeping the last registration");
        }
        self
    }

    /// Look up the suite type registered under `identifier`.
    pub fn resolve(&self, identifier: &str) -> Result<SuiteType, InstantiationError> {
        self.factories
            .get(identifier)
            .map(|factory| SuiteType {
                identifier: identifier.to_string(),
                factory: factory.clone(),
            })
            .ok_or_else(|| {
                InstantiationError::new(identifier, InstantiationErrorKind::NotRegistered)
            })
    }

    /// Resolve and construct in one step.
    pub fn instantiate(
        &self,
        identifier: &str,
        context: &DeploymentContext,
    ) -> Result<Box<dyn TestSuite>, InstantiationError> {
        self.resolve(identifier)?.instantiate(context)
    }

    /// Whether `identifier` resolves to a constructible suite, without
    /// constructing one.
    pub fn can_instantiate(&self, identifier: &str) -> bool {
        self.factories.contains_key(identifier)
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::{TestOutcome, TestResult};

    struct Bound {
        ctx: Option<DeploymentContext>,
    }

    #[async_trait::async_trait]
    impl TestSuite for Bound {
        fn tests(&self) -> Vec<&'static str> {
            vec!["bound"]
        }

        async fn run(&self, _test: &str) -> TestResult {
            match &self.ctx {
                Some(_) => Ok(TestOutcome::Passed),
                None => Ok(TestOutcome::Skipped("no deployment context".into())),
            }
        }
    }

    fn registry() -> SuiteRegistry {
        let mut r = SuiteRegistry::new();
        r.register("smoke.Bound", |ctx| Ok(Bound { ctx: Some(ctx) }))
            .register_legacy("smoke.Old", || Ok(Bound { ctx: None }))
            .register("smoke.Broken", |_ctx| -> anyhow::Result<Bound> {
                anyhow::bail!("geocoder unavailable")
            })
            .register("smoke.Panics", |_ctx| -> anyhow::Result<Bound> {
                panic!("boom in constructor")
            });
        r
    }

    #[test]
    fn test_resolve_known_and_unknown() {
        let r = registry();
        let t = r.resolve("smoke.Bound").unwrap();
        assert_eq!(t.identifier(), "smoke.Bound");
        assert_eq!(t.simple_name(), "Bound");
        assert!(!t.is_legacy());

        let err = r.resolve("smoke.Missing").unwrap_err();
        assert_eq!(err.identifier, "smoke.Missing");
        assert_eq!(err.kind, InstantiationErrorKind::NotRegistered);
        assert!(err.to_string().contains("smoke.Missing"));
    }

    #[test]
    fn test_can_instantiate_mirrors_resolve() {
        let r = registry();
        assert!(r.can_instantiate("smoke.Bound"));
        assert!(r.can_instantiate("smoke.Old"));
        assert!(!r.can_instantiate("smoke.Missing"));
        assert!(!r.can_instantiate(""));
    }

    #[tokio::test]
    async fn test_context_aware_receives_context() {
        let r = registry();
        let ctx = DeploymentContext::new("A", "https://a.example.com");
        let suite = r.instantiate("smoke.Bound", &ctx).unwrap();
        assert_eq!(suite.run("bound").await.unwrap(), TestOutcome::Passed);
    }

    #[tokio::test]
    async fn test_legacy_constructor_gets_no_context() {
        let r = registry();
        let ctx = DeploymentContext::new("A", "https://a.example.com");
        let t = r.resolve("smoke.Old").unwrap();
        assert!(t.is_legacy());
        let suite = t.instantiate(&ctx).unwrap();
        assert!(matches!(suite.run("bound").await.unwrap(), TestOutcome::Skipped(_)));
    }

    #[test]
    fn test_constructor_failure_and_panic() {
        let r = registry();
        let ctx = DeploymentContext::new("A", "https://a.example.com");

        let err = r.instantiate("smoke.Broken", &ctx).err().unwrap();
        assert!(
            matches!(err.kind, InstantiationErrorKind::ConstructorFailed(ref m) if m.contains("geocoder"))
        );

        let err = r.instantiate("smoke.Panics", &ctx).err().unwrap();
        assert!(
            matches!(err.kind, InstantiationErrorKind::ConstructorPanicked(ref m) if m.contains("boom"))
        );
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut r = SuiteRegistry::new();
        r.register_legacy("X", || Ok(Bound { ctx: None }));
        r.register("X", |ctx| Ok(Bound { ctx: Some(ctx) }));
        assert_eq!(r.len(), 1);
        assert!(!r.resolve("X").unwrap().is_legacy());
    }
}

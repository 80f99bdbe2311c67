//! Built-in smoke-test suites.

use crate::suite::SuiteRegistry;

pub mod plan;

pub use self::plan::ExampleSuite;

/// Registry holding every built-in suite under its identifier.
pub fn builtin_registry() -> SuiteRegistry {
    let mut registry = SuiteRegistry::new();
    registry.register(ExampleSuite::IDENTIFIER, ExampleSuite::new);
    registry
}

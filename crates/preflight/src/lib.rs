//! Keel preflight: an ordered battery of checks run against a plan before any
//! of it is executed.

#![forbid(unsafe_code)]

use std::time::Instant;

use anyhow::Result;
use keel_core::ExecutionPlan;
use keel_kubehub::UpgradeContext;
use metrics::counter;
use tracing::{info, warn};

pub mod checks;

/// Collects findings of one check.
#[derive(Debug, Default)]
pub struct Reporter {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl Reporter {
    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

#[async_trait::async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &'static str;

    /// Record findings on `reporter`. An `Err` means the check itself could
    /// not run (e.g. a failing cluster call) and aborts preflight.
    async fn run(&self, ctx: &UpgradeContext, plan: &ExecutionPlan, reporter: &mut Reporter) -> Result<()>;
}

/// The fixed check order.
pub fn default_checks() -> Vec<Box<dyn Check>> {
    vec![
        Box::new(checks::ResourcesCheck),
        Box::new(checks::SchemaCheck),
        Box::new(checks::NamespaceCheck),
        Box::new(checks::LabelsCheck),
        Box::new(checks::PreconditionsCheck),
        Box::new(checks::AccessCheck),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub check: &'static str,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub outcomes: Vec<CheckOutcome>,
}

impl PreflightReport {
    pub fn error_count(&self) -> usize {
        self.outcomes.iter().map(|o| o.errors.len()).sum()
    }

    pub fn warning_count(&self) -> usize {
        self.outcomes.iter().map(|o| o.warnings.len()).sum()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("preflight check {check:?} failed with {} error(s): {}", .errors.len(), .errors.join("; "))]
pub struct PreflightError {
    pub check: &'static str,
    pub errors: Vec<String>,
}

/// Run `checks` in order. The first check reporting errors stops the run with
/// a [`PreflightError`], unless `fail_on_error` is false, in which case errors
/// are downgraded to warnings and every check runs.
pub async fn run_checks(
    ctx: &UpgradeContext,
    plan: &ExecutionPlan,
    checks: &[Box<dyn Check>],
    fail_on_error: bool,
) -> Result<PreflightReport> {
    let t0 = Instant::now();
    let mut report = PreflightReport::default();
    for check in checks {
        let mut reporter = Reporter::default();
        check.run(ctx, plan, &mut reporter).await?;
        let Reporter { mut errors, mut warnings } = reporter;
        for w in &warnings {
            warn!(check = check.name(), "{}", w);
        }
        info!(check = check.name(), errors = errors.len(), warnings = warnings.len(), "preflight check done");
        if !errors.is_empty() {
            counter!("upgrader_preflight_errors_total", errors.len() as u64, "check" => check.name());
            if fail_on_error {
                return Err(PreflightError { check: check.name(), errors }.into());
            }
            for e in &errors {
                warn!(check = check.name(), "ignored error: {}", e);
            }
            warnings.append(&mut errors);
        }
        report.outcomes.push(CheckOutcome { check: check.name(), errors, warnings });
    }
    info!(
        warnings = report.warning_count(),
        took_ms = %t0.elapsed().as_millis(),
        "preflight passed"
    );
    Ok(report)
}

pub async fn run_preflight(ctx: &UpgradeContext, plan: &ExecutionPlan, fail_on_error: bool) -> Result<PreflightReport> {
    run_checks(ctx, plan, &default_checks(), fail_on_error).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::UpgraderConfig;
    use keel_kubehub::MemCluster;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct Fixed {
        name: &'static str,
        errors: usize,
    }

    #[async_trait::async_trait]
    impl Check for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, _: &UpgradeContext, _: &ExecutionPlan, reporter: &mut Reporter) -> Result<()> {
            for i in 0..self.errors {
                reporter.error(format!("problem {}", i));
            }
            reporter.warn("heads up");
            Ok(())
        }
    }

    fn ctx() -> UpgradeContext {
        UpgradeContext::new(UpgraderConfig::new("p1", "stackrox"), Arc::new(MemCluster::new()), CancellationToken::new())
    }

    #[tokio::test]
    async fn first_failing_check_stops_the_run() {
        let checks: Vec<Box<dyn Check>> = vec![
            Box::new(Fixed { name: "a", errors: 0 }),
            Box::new(Fixed { name: "b", errors: 2 }),
            Box::new(Fixed { name: "c", errors: 1 }),
        ];
        let err = run_checks(&ctx(), &ExecutionPlan::default(), &checks, true).await.unwrap_err();
        let err = err.downcast::<PreflightError>().unwrap();
        assert_eq!(err.check, "b");
        assert_eq!(err.errors.len(), 2);
        assert!(err.to_string().contains("problem 1"));
    }

    #[tokio::test]
    async fn errors_become_warnings_when_not_failing() {
        let checks: Vec<Box<dyn Check>> = vec![Box::new(Fixed { name: "b", errors: 2 }), Box::new(Fixed { name: "c", errors: 0 })];
        let report = run_checks(&ctx(), &ExecutionPlan::default(), &checks, false).await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.error_count(), 0);
        assert_eq!(report.warning_count(), 4);
    }
}

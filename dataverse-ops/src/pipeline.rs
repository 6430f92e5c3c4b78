//! Ordered step execution with abort-on-first-error semantics.
//!
//! A [`Pipeline`] owns a fixed list of [`Step`]s that share a mutable context
//! `C`. Each step is either disabled (recorded as skipped), described
//! (dry run), or executed. The first failing step ends the run: later steps
//! assume the side effects of earlier ones and never execute.

use std::fmt;

use crate::error::OpsError;
use crate::report::{ExecutionReport, StepOutcome};

/// Whether a step takes part in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enablement {
    Enabled,
    /// Skipped, with the reason shown in the report.
    Disabled(String),
}

impl Enablement {
    pub fn disabled(reason: impl Into<String>) -> Self {
        Enablement::Disabled(reason.into())
    }
}

pub trait Step<C> {
    /// Stable step name, used in logs, reports and error messages.
    fn name(&self) -> &'static str;

    fn enablement(&self, _ctx: &C) -> Enablement {
        Enablement::Enabled
    }

    /// What the step would do, phrased to follow "would".
    fn describe(&self, ctx: &C) -> String;

    /// Perform the step; the returned text ends up in the report.
    fn execute(&self, ctx: &mut C) -> Result<Option<String>, OpsError>;
}

/// A run that stopped early. The partial report is kept for the summary.
#[derive(Debug)]
pub struct Aborted {
    pub report: ExecutionReport,
    /// Step that failed, or `None` when the run never reached the steps.
    pub step: Option<String>,
    pub error: OpsError,
}

impl Aborted {
    /// Failure before the first step, e.g. in configuration or the guard.
    pub fn before_start(report: ExecutionReport, error: OpsError) -> Self {
        Self {
            report,
            step: None,
            error,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }
}

impl fmt::Display for Aborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(step) => write!(f, "{} stopped at step '{step}'", self.report.workflow),
            None => write!(f, "{} did not start", self.report.workflow),
        }
    }
}

impl std::error::Error for Aborted {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

pub struct Pipeline<C> {
    workflow: &'static str,
    steps: Vec<Box<dyn Step<C>>>,
}

impl<C> Pipeline<C> {
    pub fn new(workflow: &'static str) -> Self {
        Self {
            workflow,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: impl Step<C> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn workflow(&self) -> &'static str {
        self.workflow
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn run(&self, ctx: &mut C, dry_run: bool) -> Result<ExecutionReport, Aborted> {
        self.run_into(ExecutionReport::new(self.workflow, dry_run), ctx)
    }

    /// Continue an existing report, e.g. one that already holds guard results.
    pub fn run_into(&self, mut report: ExecutionReport, ctx: &mut C) -> Result<ExecutionReport, Aborted> {
        let dry_run = report.dry_run;
        let total = self.steps.len();
        for (idx, step) in self.steps.iter().enumerate() {
            let name = step.name();
            if let Enablement::Disabled(reason) = step.enablement(ctx) {
                tracing::info!("[{}/{total}] {name}: skipped ({reason})", idx + 1);
                report.record(name, StepOutcome::Skipped, reason);
                continue;
            }

            let description = step.describe(ctx);
            if dry_run {
                tracing::info!("DRY RUN: would {description}");
                report.record(name, StepOutcome::WouldRun, description);
                continue;
            }

            tracing::info!("[{}/{total}] {name}: {description}", idx + 1);
            match step.execute(ctx) {
                Ok(detail) => {
                    let detail = detail.unwrap_or_else(|| "done".to_string());
                    tracing::info!("{name}: {detail}");
                    report.record(name, StepOutcome::Ok, detail);
                }
                Err(error) => {
                    tracing::error!("{name} failed: {error}");
                    report.record(name, StepOutcome::Failed, error.to_string());
                    return Err(Aborted {
                        report,
                        step: Some(name.to_string()),
                        error,
                    });
                }
            }
        }
        Ok(report)
    }
}

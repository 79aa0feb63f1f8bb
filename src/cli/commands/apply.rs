//! `crucible apply`

use anyhow::Result;
use clap::Parser;
use crucible::pipeline::{FailurePolicy, Pipeline, Plan, StepOutput};
use crucible::rollover::TargetResolver;
use std::path::PathBuf;
use std::sync::Arc;

use super::CommandContext;
use crate::cli::output::{HostStatus, RecapStats};

/// Arguments for the apply command
#[derive(Parser, Debug, Clone)]
pub struct ApplyArgs {
    /// Plan file (TOML)
    pub plan: PathBuf,

    /// Override the failure policy of the plan and the settings
    #[arg(long)]
    pub policy: Option<FailurePolicy>,

    /// Roll back every push of this run when a step halts it
    #[arg(long)]
    pub rollback_on_failure: bool,

    /// Keep a pristine copy next to each patched file on the hosts too
    #[arg(long)]
    pub mirror_pristine: bool,
}

impl ApplyArgs {
    /// Execute the apply command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let plan = Plan::load(&self.plan)?;
        let policy = self
            .policy
            .or(plan.failure_policy)
            .unwrap_or(ctx.settings.defaults.failure_policy);
        let steps = plan.into_steps()?;

        ctx.output.banner(&format!("APPLY {}", self.plan.display()));
        ctx.output
            .info(&format!("{} step(s), failure policy {}", steps.len(), policy));

        let resolver: Arc<dyn TargetResolver> = Arc::new(ctx.settings.clone());
        let pipeline = Pipeline::new(ctx.sync(self.mirror_pristine)?, resolver)
            .policy(policy)
            .rollback_on_halt(self.rollback_on_failure)
            .steps(steps);

        let report = pipeline.run().await;

        let mut recap = RecapStats::new();
        for step in &report.steps {
            ctx.output.section(&format!("STEP [{}]", step.name));
            for (host, output) in &step.succeeded {
                let (status, message) = match output {
                    StepOutput::Patched(outcome) => {
                        let status = if outcome.pushed {
                            HostStatus::Changed
                        } else {
                            HostStatus::Ok
                        };
                        (status, outcome.report.summary())
                    }
                    StepOutput::Executed(result) => {
                        (HostStatus::Changed, format!("rc={}", result.exit_code))
                    }
                    StepOutput::Exported(path) => {
                        (HostStatus::Changed, path.display().to_string())
                    }
                };
                ctx.output.host_result(host, status, Some(&message));
                if let (true, StepOutput::Patched(outcome)) = (ctx.diff_mode, output) {
                    ctx.output.diff(&outcome.diff);
                }
                recap.record(host, status);
            }
            for (host, err) in &step.failed {
                let status = HostStatus::from_error(err);
                ctx.output.host_result(host, status, Some(&err.to_string()));
                recap.record(host, status);
            }
        }

        if let Some(step) = &report.halted_at {
            ctx.output.error(&format!("Halted at step '{}'", step));
        }
        if report.rolled_back > 0 {
            ctx.output
                .warning(&format!("Rolled back {} push(es)", report.rolled_back));
        }
        if let Some(err) = &report.rollback_error {
            ctx.output.error(&format!("Rollback stopped: {}", err));
        }
        ctx.output.recap(&recap);

        match report.into_result() {
            Ok(()) => Ok(0),
            Err(e) => Ok(e.exit_code()),
        }
    }
}

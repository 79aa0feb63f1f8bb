//! `crucible patch`

use anyhow::Result;
use clap::Parser;
use crucible::patch::NotFoundPolicy;
use crucible::pipeline::{Plan, PlanStep, PlanStepKind, StepAction};
use std::path::PathBuf;

use super::{parse_assignments, CommandContext};

/// Arguments for the patch command
#[derive(Parser, Debug, Clone)]
pub struct PatchArgs {
    /// Hosts to patch
    #[arg(short = 'H', long = "host", required = true)]
    pub hosts: Vec<String>,

    /// Remote file; defaults to the section's filepath/filename
    pub path: Option<PathBuf>,

    /// Value to set
    #[arg(short, long, value_name = "KEY=VALUE")]
    pub set: Vec<String>,

    /// INI file holding the values to set
    #[arg(long, requires = "section")]
    pub ini: Option<PathBuf>,

    /// Section of the INI file to apply
    #[arg(long, requires = "ini")]
    pub section: Option<String>,

    /// Delimiter to write: a literal such as "=" or " ", or "strip"
    #[arg(short, long)]
    pub delimiter: Option<String>,

    /// What to do with keys missing from the file
    #[arg(long, default_value = "ignore")]
    pub not_found: NotFoundPolicy,

    /// Keep a pristine copy next to the file on each host too
    #[arg(long)]
    pub mirror_pristine: bool,
}

impl PatchArgs {
    /// Execute the patch command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let step = PlanStep {
            name: "patch".to_string(),
            hosts: self.hosts.clone(),
            kind: PlanStepKind::Patch {
                path: self.path.clone(),
                section: self.section.clone(),
                set: parse_assignments(&self.set)?,
                delimiter: self.delimiter.clone(),
                not_found: self.not_found,
            },
        };
        let plan = Plan {
            ini: self.ini.clone(),
            failure_policy: None,
            steps: vec![step],
        };

        let Some(step) = plan.into_steps()?.into_iter().next() else {
            return Ok(0);
        };
        let StepAction::Patch {
            remote_path,
            directives,
        } = step.action
        else {
            return Ok(0);
        };

        if directives.is_empty() {
            ctx.output.warning("Nothing to set");
            return Ok(0);
        }

        ctx.output.banner(&format!("PATCH {}", remote_path.display()));
        ctx.output.info(&format!(
            "{} value(s) on {} host(s)",
            directives.len(),
            self.hosts.len()
        ));

        let sync = ctx.sync(self.mirror_pristine)?;
        let targets = ctx.targets(&self.hosts);
        let results = sync.patch_hosts(&targets, &remote_path, &directives).await;

        Ok(ctx.report_outcomes(&results))
    }
}

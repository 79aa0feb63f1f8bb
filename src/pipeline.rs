//! Named steps run in order against groups of hosts.
//!
//! A [`Pipeline`] runs each [`Step`] on all of its hosts concurrently and
//! waits for every host before moving on. What happens after a failed step
//! is decided by its [`FailurePolicy`]; by default the pipeline halts, and
//! it can optionally roll back every push recorded so far.
//!
//! Pipelines are usually loaded from a TOML plan:
//!
//! ```toml
//! ini = "migration.ini"
//!
//! [[step]]
//! name = "libvirtd"
//! kind = "patch"
//! hosts = ["compute1", "compute2"]
//! section = "libvirtd"
//! delimiter = "="
//!
//! [[step]]
//! name = "restart libvirtd"
//! kind = "exec"
//! hosts = ["compute1", "compute2"]
//! command = "systemctl restart libvirtd"
//! ```

use futures::future::join_all;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument, Span};

use crate::connection::{CommandResult, RemoteTarget};
use crate::error::{Error, Result};
use crate::generate::GeneratedFile;
use crate::ini::IniFile;
use crate::patch::{Delimiter, NotFoundPolicy, PatchDirective};
use crate::rollover::TargetResolver;
use crate::sync::{RemoteFileSync, SyncOutcome};

/// What to do after a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop at the first failing step
    #[default]
    Halt,
    /// Record the failure and run the remaining steps
    Continue,
}

impl FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "halt" => Ok(FailurePolicy::Halt),
            "continue" => Ok(FailurePolicy::Continue),
            _ => Err(Error::InvalidInput(format!(
                "Invalid failure policy '{}'. Valid policies: halt, continue",
                s
            ))),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Halt => f.write_str("halt"),
            FailurePolicy::Continue => f.write_str("continue"),
        }
    }
}

/// The work a step does on each of its hosts.
#[derive(Debug, Clone)]
pub enum StepAction {
    /// Patch a remote file
    Patch {
        remote_path: PathBuf,
        directives: Vec<PatchDirective>,
    },
    /// Run a command, failing unless it exits with one of `valid`
    Exec { command: String, valid: Vec<i32> },
    /// Write a generated file
    Export { remote_path: PathBuf, file: GeneratedFile },
}

/// A named unit of work.
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub hosts: Vec<String>,
    pub action: StepAction,
}

impl Step {
    pub fn new(name: impl Into<String>, action: StepAction) -> Self {
        Self {
            name: name.into(),
            hosts: Vec::new(),
            action,
        }
    }

    /// Add a host to run on
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.hosts.push(host.into());
        self
    }

    /// Run on every host in `hosts`
    pub fn hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts.extend(hosts.into_iter().map(Into::into));
        self
    }
}

/// What a step produced on one host.
#[derive(Debug, Clone)]
pub enum StepOutput {
    Patched(SyncOutcome),
    Executed(CommandResult),
    Exported(PathBuf),
}

/// Result of one step.
#[derive(Debug)]
pub struct StepReport {
    pub name: String,
    /// Hosts the step succeeded on, with what it produced
    pub succeeded: Vec<(String, StepOutput)>,
    /// Hosts the step failed on
    pub failed: Vec<(String, Error)>,
}

impl StepReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of a whole pipeline run.
#[derive(Debug, Default)]
pub struct PipelineReport {
    /// Steps that ran, in order
    pub steps: Vec<StepReport>,
    /// Step that stopped the run under [`FailurePolicy::Halt`]
    pub halted_at: Option<String>,
    /// Number of pushes undone after the halt
    pub rolled_back: usize,
    /// Why the rollback after a halt stopped early
    pub rollback_error: Option<Error>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.rollback_error.is_none() && self.steps.iter().all(StepReport::is_success)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| !s.is_success())
    }

    /// The first failure as an error, if any step failed.
    ///
    /// A failed rollback wins over the step failure that triggered it.
    pub fn into_result(self) -> Result<()> {
        if let Some(err) = self.rollback_error {
            return Err(err);
        }
        for step in self.steps {
            if let Some((host, err)) = step.failed.into_iter().next() {
                return Err(Error::step_failed(format!("{} on {}", step.name, host), err));
            }
        }
        Ok(())
    }
}

/// Ordered steps sharing one [`RemoteFileSync`].
pub struct Pipeline {
    sync: RemoteFileSync,
    resolver: Arc<dyn TargetResolver>,
    steps: Vec<Step>,
    policy: FailurePolicy,
    rollback_on_halt: bool,
    span: Span,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.steps.len())
            .field("policy", &self.policy)
            .field("rollback_on_halt", &self.rollback_on_halt)
            .finish()
    }
}

impl Pipeline {
    pub fn new(sync: RemoteFileSync, resolver: Arc<dyn TargetResolver>) -> Self {
        Self {
            sync,
            resolver,
            steps: Vec::new(),
            policy: FailurePolicy::Halt,
            rollback_on_halt: false,
            span: info_span!("pipeline"),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Undo recorded pushes when a step halts the run.
    ///
    /// Only has an effect when the sync has a rollover manager attached.
    pub fn rollback_on_halt(mut self, enabled: bool) -> Self {
        self.rollback_on_halt = enabled;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order.
    ///
    /// Failures are reported, not returned; see
    /// [`PipelineReport::into_result`].
    pub async fn run(&self) -> PipelineReport {
        let mut report = PipelineReport::default();

        for step in &self.steps {
            let span = info_span!(parent: &self.span, "step", name = %step.name);
            let step_report = self.run_step(step).instrument(span).await;

            let failed = !step_report.is_success();
            report.steps.push(step_report);

            if failed {
                error!(step = %step.name, policy = %self.policy, "Step failed");
                if self.policy == FailurePolicy::Halt {
                    report.halted_at = Some(step.name.clone());
                    if self.rollback_on_halt {
                        self.roll_back(&mut report).await;
                    }
                    break;
                }
            }
        }

        info!(
            steps = report.steps.len(),
            failed = report.failed_steps().count(),
            "Pipeline finished"
        );
        report
    }

    async fn run_step(&self, step: &Step) -> StepReport {
        let mut report = StepReport {
            name: step.name.clone(),
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        let mut targets = Vec::with_capacity(step.hosts.len());
        for host in &step.hosts {
            match self.resolver.resolve(host) {
                Ok(target) => targets.push(target),
                Err(e) => report.failed.push((host.clone(), e)),
            }
        }
        if step.hosts.is_empty() {
            warn!(step = %step.name, "Step has no hosts");
        }

        let results = join_all(targets.iter().map(|target| self.run_on(target, &step.action))).await;
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(output) => report.succeeded.push((target.name.clone(), output)),
                Err(e) => {
                    warn!(host = %target.name, error = %e, "Step failed on host");
                    report.failed.push((target.name.clone(), e));
                }
            }
        }
        report
    }

    async fn run_on(&self, target: &RemoteTarget, action: &StepAction) -> Result<StepOutput> {
        match action {
            StepAction::Patch {
                remote_path,
                directives,
            } => self
                .sync
                .patch_remote(target, remote_path, directives)
                .await
                .map(StepOutput::Patched),
            StepAction::Exec { command, valid } => self
                .sync
                .session()
                .execute_checked(target, command, valid)
                .await
                .map(StepOutput::Executed),
            StepAction::Export { remote_path, file } => self
                .sync
                .write_generated(target, remote_path, file)
                .await
                .map(|_| StepOutput::Exported(remote_path.clone())),
        }
    }

    async fn roll_back(&self, report: &mut PipelineReport) {
        let Some(rollover) = self.sync.rollover() else {
            return;
        };
        let before = rollover.len();
        warn!(entries = before, "Rolling back after halt");
        match rollover.rollback_all(self.resolver.as_ref()).await {
            Ok(undone) => report.rolled_back = undone.len(),
            Err(e) => {
                report.rolled_back = before.saturating_sub(rollover.len());
                error!(error = %e, remaining = rollover.len(), "Rollback after halt failed");
                report.rollback_error = Some(e);
            }
        }
    }
}

// ============================================================================
// Plan files
// ============================================================================

/// A pipeline described in TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    /// INI file that `section` keys of patch steps refer to
    #[serde(default)]
    pub ini: Option<PathBuf>,
    /// Overrides the configured failure policy
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default, rename = "step")]
    pub steps: Vec<PlanStep>,
}

/// One `[[step]]` of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub name: String,
    pub hosts: Vec<String>,
    #[serde(flatten)]
    pub kind: PlanStepKind,
}

/// The `kind`-specific keys of a plan step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PlanStepKind {
    Patch {
        /// Remote file; taken from the section's `filepath`/`filename` if absent
        #[serde(default)]
        path: Option<PathBuf>,
        /// INI section whose keys become directives
        #[serde(default)]
        section: Option<String>,
        /// Extra values, applied after the section's
        #[serde(default)]
        set: IndexMap<String, String>,
        #[serde(default)]
        delimiter: Option<String>,
        #[serde(default)]
        not_found: NotFoundPolicy,
    },
    Exec {
        command: String,
        #[serde(default = "default_valid_codes")]
        valid: Vec<i32>,
    },
    Export {
        path: PathBuf,
        fields: Vec<String>,
        /// Inclusive field range to join into one field
        #[serde(default)]
        merge: Option<[usize; 2]>,
    },
}

fn default_valid_codes() -> Vec<i32> {
    vec![0]
}

impl Plan {
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read a plan; a relative `ini` path is resolved against the plan's
    /// directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::file_io(path, e))?;
        let mut plan = Self::from_toml(&content)?;
        if let (Some(ini), Some(dir)) = (&plan.ini, path.parent()) {
            if ini.is_relative() {
                plan.ini = Some(dir.join(ini));
            }
        }
        Ok(plan)
    }

    /// Resolve every plan step into a runnable [`Step`].
    pub fn into_steps(self) -> Result<Vec<Step>> {
        let ini = match &self.ini {
            Some(path) => Some(IniFile::load(path)?),
            None => None,
        };
        self.steps
            .into_iter()
            .map(|step| step.resolve(ini.as_ref()))
            .collect()
    }
}

impl PlanStep {
    fn resolve(self, ini: Option<&IniFile>) -> Result<Step> {
        if self.hosts.is_empty() {
            return Err(Error::Config(format!("step '{}' has no hosts", self.name)));
        }

        let action = match self.kind {
            PlanStepKind::Patch {
                path,
                section,
                set,
                delimiter,
                not_found,
            } => {
                let delimiter = Delimiter::parse(delimiter.as_deref());
                let mut directives = Vec::new();
                let mut remote_path = path;

                if let Some(name) = section {
                    let ini = ini.ok_or_else(|| {
                        Error::Config(format!(
                            "step '{}' names section [{}] but the plan has no ini file",
                            self.name, name
                        ))
                    })?;
                    let section = ini.section(&name)?;
                    directives.extend(section.directives(&delimiter, not_found));
                    if remote_path.is_none() {
                        remote_path = section.remote_path();
                    }
                }

                for (key, value) in set {
                    directives.retain(|d: &PatchDirective| d.token != key);
                    directives.push(
                        PatchDirective::new(key, value)
                            .delimiter(delimiter.clone())
                            .not_found(not_found),
                    );
                }

                let remote_path = remote_path.ok_or_else(|| {
                    Error::Config(format!("step '{}' does not say which file to patch", self.name))
                })?;
                StepAction::Patch {
                    remote_path,
                    directives,
                }
            }
            PlanStepKind::Exec { command, valid } => StepAction::Exec { command, valid },
            PlanStepKind::Export {
                path,
                fields,
                merge,
            } => {
                let mut file = GeneratedFile::new(fields);
                if let Some([start, end]) = merge {
                    file.merge(start..=end)?;
                }
                StepAction::Export {
                    remote_path: path,
                    file,
                }
            }
        };

        Ok(Step {
            name: self.name,
            hosts: self.hosts,
            action,
        })
    }
}

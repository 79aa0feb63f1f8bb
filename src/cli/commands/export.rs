//! `crucible export`

use anyhow::Result;
use clap::Parser;
use crucible::generate::GeneratedFile;
use futures::future::join_all;
use std::path::PathBuf;

use super::CommandContext;
use crate::cli::output::{HostStatus, RecapStats};

/// Arguments for the export command
#[derive(Parser, Debug, Clone)]
pub struct ExportArgs {
    /// Hosts to write to
    #[arg(short = 'H', long = "host", required = true)]
    pub hosts: Vec<String>,

    /// Join fields START..=END into one before writing
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    pub merge: Option<Vec<usize>>,

    /// Remote file to write
    pub path: PathBuf,

    /// Fields of the file, in order
    #[arg(required = true)]
    pub fields: Vec<String>,
}

impl ExportArgs {
    /// Execute the export command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let mut file = GeneratedFile::new(self.fields.iter().cloned());
        if let Some(range) = &self.merge {
            if let [start, end] = range.as_slice() {
                file.merge(*start..=*end)?;
            }
        }

        ctx.output.banner(&format!("EXPORT {}", self.path.display()));
        if ctx.diff_mode {
            ctx.output.diff(&format!("+{}", file.render()));
        }

        let sync = ctx.sync(false)?;
        let targets = ctx.targets(&self.hosts);
        let results = join_all(
            targets
                .iter()
                .map(|t| sync.write_generated(t, &self.path, &file)),
        )
        .await;

        let mut recap = RecapStats::new();
        let mut exit_code = 0;
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(_) => {
                    ctx.output.host_result(&target.name, HostStatus::Changed, None);
                    recap.record(&target.name, HostStatus::Changed);
                }
                Err(e) => {
                    let status = HostStatus::from_error(&e);
                    ctx.output.host_result(&target.name, status, Some(&e.to_string()));
                    recap.record(&target.name, status);
                    if exit_code == 0 {
                        exit_code = e.exit_code();
                    }
                }
            }
        }

        ctx.output.recap(&recap);
        Ok(exit_code)
    }
}

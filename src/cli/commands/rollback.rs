//! `crucible rollback` and `crucible commit`

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use super::CommandContext;

/// Arguments for the rollback command
#[derive(Parser, Debug, Clone)]
pub struct RollbackArgs {
    /// Undo every recorded push, newest first
    #[arg(long, conflicts_with = "pristine")]
    pub all: bool,

    /// Restore the pristine copy of one file
    #[arg(long, requires = "host")]
    pub pristine: bool,

    /// Host of the file to restore
    #[arg(short = 'H', long, requires = "path")]
    pub host: Option<String>,

    /// Remote path of the file to restore
    #[arg(long, requires = "pristine")]
    pub path: Option<PathBuf>,
}

impl RollbackArgs {
    /// Execute the rollback command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let rollover = ctx.rollover()?;
        ctx.output.banner("ROLLBACK");

        if self.pristine {
            if let (Some(host), Some(path)) = (&self.host, &self.path) {
                rollover
                    .restore_pristine(&ctx.settings, host, path)
                    .await?;
                ctx.output
                    .plain(&format!("Restored pristine {} on {}", path.display(), host));
            }
            return Ok(0);
        }

        if rollover.is_empty() {
            ctx.output.warning("Nothing recorded to roll back");
            return Ok(0);
        }

        let undone = if self.all {
            rollover.rollback_all(&ctx.settings).await?
        } else {
            rollover.rollback_last(&ctx.settings).await?.into_iter().collect()
        };

        let items: Vec<String> = undone
            .iter()
            .map(|e| format!("{}:{}", e.host, e.remote_path.display()))
            .collect();
        ctx.output.list("Rolled back", &items);
        Ok(0)
    }
}

/// Clear the rollback journal
pub async fn commit(ctx: &mut CommandContext) -> Result<i32> {
    let rollover = ctx.rollover()?;
    let count = rollover.len();
    rollover.commit()?;
    ctx.output
        .plain(&format!("Committed {} recorded push(es)", count));
    Ok(0)
}

//! `crucible exec`

use anyhow::Result;
use clap::Parser;
use crucible::connection::{ExecuteOptions, OutputLine};
use futures::future::join_all;
use tokio::sync::mpsc;

use super::CommandContext;
use crate::cli::output::{HostStatus, RecapStats};

/// Arguments for the exec command
#[derive(Parser, Debug, Clone)]
pub struct ExecArgs {
    /// Hosts to run on
    #[arg(short = 'H', long = "host", required = true)]
    pub hosts: Vec<String>,

    /// Exit codes that count as success
    #[arg(long, value_delimiter = ',', default_value = "0")]
    pub valid: Vec<i32>,

    /// Print output lines as they arrive, one host at a time
    #[arg(long)]
    pub stream: bool,

    /// Give up on the command after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Command to run
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl ExecArgs {
    /// Execute the exec command
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let command = self.command.join(" ");
        ctx.output.banner(&format!("EXEC {}", command));

        let session = ctx.session();
        let targets = ctx.targets(&self.hosts);
        let mut recap = RecapStats::new();
        let mut exit_code = 0;
        let mut options = ExecuteOptions::new();
        if let Some(secs) = self.timeout {
            options = options.with_timeout(secs);
        }

        let results = if self.stream {
            let mut results = Vec::with_capacity(targets.len());
            for target in &targets {
                let (tx, mut rx) = mpsc::channel(64);
                let host = target.name.clone();
                let printer = tokio::spawn(async move {
                    while let Some(line) = rx.recv().await {
                        match line {
                            OutputLine::Stdout(l) => println!("{} | {}", host, l),
                            OutputLine::Stderr(l) => eprintln!("{} | {}", host, l),
                        }
                    }
                });
                let result = session
                    .execute_streaming(target, &command, options.clone(), tx)
                    .await;
                let _ = printer.await;
                results.push(result);
            }
            results
        } else {
            join_all(
                targets
                    .iter()
                    .map(|t| session.execute_with(t, &command, options.clone())),
            )
            .await
        };

        for (target, result) in targets.iter().zip(results) {
            let result = result.and_then(|r| {
                if self.valid.contains(&r.exit_code) {
                    Ok(r)
                } else {
                    Err(crucible::Error::RemoteCommand {
                        host: target.name.clone(),
                        command: command.clone(),
                        exit_code: r.exit_code,
                        stderr: r.stderr.trim_end().to_string(),
                    })
                }
            });

            match result {
                Ok(r) => {
                    ctx.output.host_result(
                        &target.name,
                        HostStatus::Changed,
                        Some(&format!("rc={}", r.exit_code)),
                    );
                    if !self.stream {
                        for line in r.stdout_lines() {
                            ctx.output.plain(&format!("    {}", line));
                        }
                    }
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

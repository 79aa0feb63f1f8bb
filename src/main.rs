//! crucible - patch configuration files on remote hosts
//!
//! This is the main entry point for the crucible CLI.

mod cli;

use anyhow::Result;
use cli::commands::CommandContext;
use cli::{Cli, Commands};
use crucible::config::Settings;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Application version information
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize logging based on verbosity
    let log_path = init_logging(cli.verbosity(), cli.log_file)?;

    if cli.verbosity() >= 2 {
        eprintln!("crucible v{}", VERSION);
    }
    if let Some(path) = &log_path {
        eprintln!("Logging to {}", path.display());
    }

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("ERROR: Failed to load config: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    let mut ctx = CommandContext::new(&cli, settings);

    // Execute the appropriate command
    let result = match &cli.command {
        Commands::Patch(args) => args.execute(&mut ctx).await,
        Commands::Exec(args) => args.execute(&mut ctx).await,
        Commands::Export(args) => args.execute(&mut ctx).await,
        Commands::Apply(args) => args.execute(&mut ctx).await,
        Commands::Rollback(args) => args.execute(&mut ctx).await,
        Commands::Commit => cli::commands::rollback::commit(&mut ctx).await,
    };

    let exit_code = match result {
        Ok(code) => code,
        Err(e) => {
            ctx.output.error(&format!("{:#}", e));
            e.downcast_ref::<crucible::Error>()
                .map(crucible::Error::exit_code)
                .unwrap_or(1)
        }
    };

    ctx.output.flush();
    std::process::exit(exit_code);
}

/// Initialize logging based on verbosity level.
///
/// With `log_file` set, everything at the same level is also written to a
/// timestamped file under the temp directory, whose path is returned.
fn init_logging(verbosity: u8, log_file: bool) -> Result<Option<PathBuf>> {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let (file_layer, path) = if log_file {
        let path = std::env::temp_dir().join(format!(
            "crucible-{}.log",
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        ));
        let file = std::fs::File::create(&path)?;
        let layer = fmt::layer()
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file));
        (Some(layer), Some(path))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity >= 3),
        )
        .with(file_layer)
        .with(env_filter)
        .init();

    Ok(path)
}

//! Output formatting for the crucible CLI
//!
//! Colored banners, per-host results, diffs and a closing recap.

use colored::Colorize;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::time::{Duration, Instant};

/// Outcome of an operation on one host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    /// Nothing needed changing
    Ok,
    /// The host was modified
    Changed,
    /// The operation failed
    Failed,
    /// The host could not be reached
    Unreachable,
}

impl HostStatus {
    /// Get the colored string representation
    pub fn colored_string(&self) -> String {
        match self {
            HostStatus::Ok => "ok".green().to_string(),
            HostStatus::Changed => "changed".yellow().to_string(),
            HostStatus::Failed => "failed".red().bold().to_string(),
            HostStatus::Unreachable => "unreachable".red().bold().to_string(),
        }
    }

    /// Get the plain string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Ok => "ok",
            HostStatus::Changed => "changed",
            HostStatus::Failed => "failed",
            HostStatus::Unreachable => "unreachable",
        }
    }

    /// Status for a failed operation
    pub fn from_error(err: &crucible::Error) -> Self {
        match err {
            crucible::Error::Connectivity { .. } => HostStatus::Unreachable,
            _ => HostStatus::Failed,
        }
    }
}

/// Output formatter
pub struct OutputFormatter {
    use_color: bool,
    verbosity: u8,
    start_time: Instant,
}

impl OutputFormatter {
    /// Create a new output formatter
    pub fn new(use_color: bool, verbosity: u8) -> Self {
        // Respect NO_COLOR environment variable
        let use_color = use_color && std::env::var("NO_COLOR").is_err();
        if !use_color {
            colored::control::set_override(false);
        }

        Self {
            use_color,
            verbosity,
            start_time: Instant::now(),
        }
    }

    /// Print a banner/header
    pub fn banner(&self, title: &str) {
        let line = "=".repeat(title.len() + 4);
        if self.use_color {
            println!("\n{}", line.bright_blue());
            println!("{}", format!("  {}  ", title).bright_blue().bold());
            println!("{}\n", line.bright_blue());
        } else {
            println!("\n{}", line);
            println!("  {}  ", title);
            println!("{}\n", line);
        }
    }

    /// Print a section header
    pub fn section(&self, title: &str) {
        if self.use_color {
            println!("\n{}", title.cyan().bold());
            println!("{}", "-".repeat(title.len()).cyan());
        } else {
            println!("\n{}", title);
            println!("{}", "-".repeat(title.len()));
        }
    }

    /// Print the result for one host
    pub fn host_result(&self, host: &str, status: HostStatus, message: Option<&str>) {
        let status_str = if self.use_color {
            status.colored_string()
        } else {
            status.as_str().to_string()
        };

        let host_str = if self.use_color {
            host.bright_white().bold().to_string()
        } else {
            host.to_string()
        };

        print!("{}: [{}]", status_str, host_str);
        if let Some(msg) = message {
            print!(" => {}", msg);
        }
        println!();
    }

    /// Print an error message
    pub fn error(&self, message: &str) {
        if self.use_color {
            eprintln!("{} {}", "ERROR:".red().bold(), message);
        } else {
            eprintln!("ERROR: {}", message);
        }
    }

    /// Print a warning message
    pub fn warning(&self, message: &str) {
        if self.use_color {
            eprintln!("{} {}", "WARNING:".yellow().bold(), message);
        } else {
            eprintln!("WARNING: {}", message);
        }
    }

    /// Print an info message (respects verbosity)
    pub fn info(&self, message: &str) {
        if self.verbosity < 1 {
            return;
        }

        if self.use_color {
            println!("{} {}", "INFO:".blue(), message);
        } else {
            println!("INFO: {}", message);
        }
    }

    /// Print plain output, whatever the verbosity
    pub fn plain(&self, message: &str) {
        println!("{}", message);
    }

    /// Print a unified diff, coloring added and removed lines
    pub fn diff(&self, diff: &str) {
        if diff.is_empty() {
            return;
        }

        for line in diff.lines() {
            if !self.use_color {
                println!("{}", line);
            } else if line.starts_with("+++") || line.starts_with("---") {
                println!("{}", line.bold());
            } else if line.starts_with('+') {
                println!("{}", line.green());
            } else if line.starts_with('-') {
                println!("{}", line.red());
            } else if line.starts_with("@@") {
                println!("{}", line.cyan());
            } else {
                println!("{}", line);
            }
        }
    }

    /// Print a list of items
    pub fn list(&self, title: &str, items: &[String]) {
        if self.use_color {
            println!("\n{}:", title.bright_white().bold());
        } else {
            println!("\n{}:", title);
        }

        for item in items {
            if self.use_color {
                println!("  {} {}", "-".bright_black(), item);
            } else {
                println!("  - {}", item);
            }
        }
    }

    /// Print a recap summary
    pub fn recap(&self, stats: &RecapStats) {
        self.section("RECAP");

        for (host, s) in &stats.hosts {
            let host_str = if self.use_color {
                format!("{:<20}", host).bright_white().bold().to_string()
            } else {
                format!("{:<20}", host)
            };
            let line = format!(
                "{} : ok={} changed={} unreachable={} failed={}",
                host_str, s.ok, s.changed, s.unreachable, s.failed
            );
            if self.use_color && s.has_failures() {
                println!("{}", line.red());
            } else {
                println!("{}", line);
            }
        }

        println!();
        println!("Finished in {}", format_duration(self.start_time.elapsed()));
    }

    /// Flush stdout
    pub fn flush(&self) {
        let _ = io::stdout().flush();
    }
}

/// Statistics for a single host
#[derive(Debug, Clone, Default)]
pub struct HostStats {
    pub ok: u32,
    pub changed: u32,
    pub unreachable: u32,
    pub failed: u32,
}

impl HostStats {
    /// Record a status
    pub fn record(&mut self, status: HostStatus) {
        match status {
            HostStatus::Ok => self.ok += 1,
            HostStatus::Changed => self.changed += 1,
            HostStatus::Failed => self.failed += 1,
            HostStatus::Unreachable => self.unreachable += 1,
        }
    }

    /// Check if there were any failures
    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.unreachable > 0
    }
}

/// Recap statistics for all hosts
#[derive(Debug, Clone, Default)]
pub struct RecapStats {
    pub hosts: BTreeMap<String, HostStats>,
}

impl RecapStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a result for a host
    pub fn record(&mut self, host: &str, status: HostStatus) {
        self.hosts
            .entry(host.to_string())
            .or_default()
            .record(status);
    }

    /// Check if any host had failures
    pub fn has_failures(&self) -> bool {
        self.hosts.values().any(|h| h.has_failures())
    }
}

/// Format a duration as a human-readable string
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}.{:03}s", secs, millis)
    } else {
        format!("{}ms", millis)
    }
}

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::EnvFilter;

fn filter(directives: &str) -> Result<EnvFilter> {
  EnvFilter::try_new(directives).with_context(|| format!("invalid log filter '{}'", directives))
}

/// Logs to stderr so stdout stays free for command output.
pub fn init_stderr(directives: &str) -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(filter(directives)?)
    .with_writer(std::io::stderr)
    .try_init()
    .map_err(|e| anyhow!(e))
}

/// Logs to a file; the dashboard owns the terminal.
pub fn init_file(directives: &str, path: &Path) -> Result<()> {
  let file = OpenOptions::new()
    .create(true)
    .append(true)
    .open(path)
    .with_context(|| format!("cannot open log file {}", path.display()))?;
  tracing_subscriber::fmt()
    .with_env_filter(filter(directives)?)
    .with_ansi(false)
    .with_writer(Mutex::new(file))
    .try_init()
    .map_err(|e| anyhow!(e))
}

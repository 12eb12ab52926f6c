use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

#[derive(Debug, Clone)]
pub struct Config {
  pub api_url: String,
  pub token: Option<String>,
  pub poll_interval: Duration,
  pub running_interval: Duration,
  pub http_timeout: Option<Duration>,
  pub log_filter: String,
  pub log_file: PathBuf,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      api_url: "http://127.0.0.1:3000".into(),
      token: None,
      poll_interval: Duration::from_millis(1000),
      running_interval: Duration::from_millis(5000),
      http_timeout: None,
      log_filter: "info".into(),
      log_file: PathBuf::from("taskwatch.log"),
    }
  }
}

impl Config {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let defaults = Self::default();
    let var = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

    let poll_interval = match var("TASKWATCH_POLL_INTERVAL_MS") {
      Some(raw) => positive_millis("TASKWATCH_POLL_INTERVAL_MS", &raw)?,
      None => defaults.poll_interval,
    };
    let running_interval = match var("TASKWATCH_RUNNING_INTERVAL_MS") {
      Some(raw) => positive_millis("TASKWATCH_RUNNING_INTERVAL_MS", &raw)?,
      None => defaults.running_interval,
    };
    let http_timeout = match var("TASKWATCH_HTTP_TIMEOUT_SECS") {
      Some(raw) => {
        let secs: u64 = raw
          .parse()
          .with_context(|| format!("TASKWATCH_HTTP_TIMEOUT_SECS is not a number: {}", raw))?;
        (secs > 0).then(|| Duration::from_secs(secs))
      }
      None => None,
    };

    Ok(Self {
      api_url: var("TASKWATCH_API_URL")
        .map(|url| url.trim_end_matches('/').to_owned())
        .unwrap_or(defaults.api_url),
      token: var("TASKWATCH_TOKEN"),
      poll_interval,
      running_interval,
      http_timeout,
      log_filter: var("TASKWATCH_LOG").unwrap_or(defaults.log_filter),
      log_file: var("TASKWATCH_LOG_FILE").map(PathBuf::from).unwrap_or(defaults.log_file),
    })
  }
}

fn positive_millis(key: &str, raw: &str) -> Result<Duration> {
  let millis: u64 = raw
    .parse()
    .with_context(|| format!("{} is not a number: {}", key, raw))?;
  if millis == 0 {
    bail!("{} must be greater than zero", key);
  }
  Ok(Duration::from_millis(millis))
}

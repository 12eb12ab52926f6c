use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::{RunStatus, TaskRun};

/// Display values derived from the latest snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
  pub status: RunStatus,
  pub percent: u8,
  pub label: &'static str,
  pub elapsed: Duration,
}

impl Projection {
  pub fn elapsed_display(&self) -> String {
    format_elapsed(self.elapsed)
  }
}

pub fn project(run: &TaskRun, now: DateTime<Utc>) -> Projection {
  Projection {
    status: run.status,
    percent: display_percent(run),
    label: status_label(run.status),
    elapsed: elapsed(run, now),
  }
}

pub fn display_percent(run: &TaskRun) -> u8 {
  match run.status {
    RunStatus::Success | RunStatus::Failed => 100,
    RunStatus::Running => run.progress.min(100),
    RunStatus::Pending => 0,
  }
}

pub fn status_label(status: RunStatus) -> &'static str {
  match status {
    RunStatus::Pending => "preparing",
    RunStatus::Running => "in progress",
    RunStatus::Success => "complete",
    RunStatus::Failed => "failed",
  }
}

/// `(end_time or now) - start_time`, zero without a start time or when clocks disagree.
pub fn elapsed(run: &TaskRun, now: DateTime<Utc>) -> Duration {
  let Some(start) = run.start_time else {
    return Duration::ZERO;
  };
  let end = run.end_time.unwrap_or(now);
  (end - start).to_std().unwrap_or(Duration::ZERO)
}

pub fn format_elapsed(elapsed: Duration) -> String {
  let total = elapsed.as_secs();
  let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
  if hours > 0 {
    format!("{}h {}m {}s", hours, minutes, seconds)
  } else if minutes > 0 {
    format!("{}m {}s", minutes, seconds)
  } else {
    format!("{}s", seconds)
  }
}

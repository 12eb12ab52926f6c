use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

static CRON_FIELD: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[0-9A-Za-z*/,?\-]+$").expect("cron field pattern"));
static HEADER_NAME: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[!#$%&'*+\-.^_`|~0-9A-Za-z]+$").expect("header name pattern"));

const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ValidationError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl fmt::Display for TaskId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl fmt::Display for RunId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl FromStr for TaskId {
  type Err = std::num::ParseIntError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    s.trim().parse().map(TaskId)
  }
}

impl FromStr for RunId {
  type Err = std::num::ParseIntError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    s.trim().parse().map(RunId)
  }
}

/// Lifecycle of a run as reported by the backend.
///
/// `Pending -> Running -> {Success, Failed}`; the terminal states have no
/// outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
  Pending,
  Running,
  Success,
  Failed,
}

impl RunStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, RunStatus::Success | RunStatus::Failed)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      RunStatus::Pending => "pending",
      RunStatus::Running => "running",
      RunStatus::Success => "success",
      RunStatus::Failed => "failed",
    }
  }

  /// Position in the forward order; both terminal states share the last rank.
  pub fn rank(self) -> u8 {
    match self {
      RunStatus::Pending => 0,
      RunStatus::Running => 1,
      RunStatus::Success | RunStatus::Failed => 2,
    }
  }
}

impl fmt::Display for RunStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for RunStatus {
  type Err = ValidationError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "pending" => Ok(RunStatus::Pending),
      "running" => Ok(RunStatus::Running),
      "success" => Ok(RunStatus::Success),
      "failed" => Ok(RunStatus::Failed),
      other => Err(ValidationError(format!("unknown run status '{}'", other))),
    }
  }
}

/// One execution attempt of a task, as last reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TaskRunWire", into = "TaskRunWire")]
pub struct TaskRun {
  pub id: RunId,
  pub task_id: Option<TaskId>,
  /// Present when the backend joins the owning task (running list, history).
  pub task_name: Option<String>,
  pub status: RunStatus,
  pub start_time: Option<DateTime<Utc>>,
  pub end_time: Option<DateTime<Utc>>,
  pub output: String,
  pub error: String,
  pub duration: Option<u64>,
  pub progress: u8,
}

impl TaskRun {
  pub fn is_terminal(&self) -> bool {
    self.status.is_terminal()
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskRefWire {
  #[serde(default)]
  name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskRunWire {
  #[serde(alias = "run_id", alias = "log_id")]
  id: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  task_id: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  task: Option<TaskRefWire>,
  status: String,
  #[serde(default, deserialize_with = "nullable_string")]
  output: String,
  #[serde(default, deserialize_with = "nullable_string")]
  error: String,
  #[serde(default, deserialize_with = "optional_time")]
  start_time: Option<DateTime<Utc>>,
  #[serde(default, deserialize_with = "optional_time")]
  end_time: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  duration: Option<i64>,
  #[serde(default)]
  progress: i64,
}

impl TryFrom<TaskRunWire> for TaskRun {
  type Error = ValidationError;

  fn try_from(wire: TaskRunWire) -> Result<Self, Self::Error> {
    let status: RunStatus = wire.status.parse()?;
    // end_time only means something once the run has left `running`
    let end_time = if status.is_terminal() { wire.end_time } else { None };
    Ok(TaskRun {
      id: RunId(wire.id),
      task_id: wire.task_id.filter(|id| *id != 0).map(TaskId),
      task_name: wire.task.map(|t| t.name).filter(|n| !n.is_empty()),
      status,
      start_time: wire.start_time,
      end_time,
      output: wire.output,
      error: wire.error,
      duration: wire.duration.and_then(|d| u64::try_from(d).ok()),
      progress: wire.progress.clamp(0, 100) as u8,
    })
  }
}

impl From<TaskRun> for TaskRunWire {
  fn from(run: TaskRun) -> Self {
    TaskRunWire {
      id: run.id.0,
      task_id: run.task_id.map(|t| t.0),
      task: run.task_name.map(|name| TaskRefWire { name }),
      status: run.status.as_str().to_owned(),
      output: run.output,
      error: run.error,
      start_time: run.start_time,
      end_time: run.end_time,
      duration: run.duration.and_then(|d| i64::try_from(d).ok()),
      progress: i64::from(run.progress),
    }
  }
}

/// What a task does when it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
  Script {
    script: String,
  },
  Http {
    url: String,
    method: String,
    headers: BTreeMap<String, String>,
    body: String,
  },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
  pub expr: String,
  pub enabled: bool,
}

/// A stored, user-configured unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TaskWire", into = "TaskWire")]
pub struct Task {
  /// `None` until the backend has stored the task.
  pub id: Option<TaskId>,
  pub name: String,
  pub description: String,
  pub kind: TaskKind,
  pub timeout: Duration,
  pub enabled: bool,
  pub schedule: Option<Schedule>,
  pub created_at: Option<DateTime<Utc>>,
  pub updated_at: Option<DateTime<Utc>>,
}

impl Task {
  pub fn script(name: impl Into<String>, script: impl Into<String>) -> Self {
    Task {
      id: None,
      name: name.into(),
      description: String::new(),
      kind: TaskKind::Script { script: script.into() },
      timeout: DEFAULT_TASK_TIMEOUT,
      enabled: true,
      schedule: None,
      created_at: None,
      updated_at: None,
    }
  }

  pub fn kind_name(&self) -> &'static str {
    match self.kind {
      TaskKind::Script { .. } => "script",
      TaskKind::Http { .. } => "http",
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TaskWire {
  #[serde(default)]
  id: u64,
  #[serde(default, deserialize_with = "nullable_string")]
  name: String,
  #[serde(default, deserialize_with = "nullable_string")]
  description: String,
  #[serde(rename = "type", default, deserialize_with = "nullable_string")]
  kind: String,
  #[serde(default, deserialize_with = "nullable_string")]
  script: String,
  #[serde(default, deserialize_with = "nullable_string")]
  url: String,
  #[serde(default, deserialize_with = "nullable_string")]
  method: String,
  #[serde(default, deserialize_with = "nullable_string")]
  headers: String,
  #[serde(default, deserialize_with = "nullable_string")]
  body: String,
  #[serde(default)]
  timeout: i64,
  #[serde(default, deserialize_with = "nullable_string")]
  status: String,
  #[serde(default)]
  enable_cron: u8,
  #[serde(default, deserialize_with = "nullable_string")]
  cron_expr: String,
  #[serde(default, deserialize_with = "optional_time", skip_serializing_if = "Option::is_none")]
  created_at: Option<DateTime<Utc>>,
  #[serde(default, deserialize_with = "optional_time", skip_serializing_if = "Option::is_none")]
  updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskWire> for Task {
  type Error = ValidationError;

  fn try_from(wire: TaskWire) -> Result<Self, Self::Error> {
    let kind = match wire.kind.trim().to_ascii_lowercase().as_str() {
      "" | "script" => TaskKind::Script { script: wire.script },
      "http" => TaskKind::Http {
        url: validate_url(&wire.url)?,
        method: validate_method(&wire.method)?,
        headers: parse_headers(&wire.headers)?,
        body: wire.body,
      },
      other => return Err(ValidationError(format!("unknown task type '{}'", other))),
    };
    let enabled = match wire.status.trim().to_ascii_lowercase().as_str() {
      "" | "active" => true,
      "inactive" => false,
      other => return Err(ValidationError(format!("unknown task status '{}'", other))),
    };
    let timeout = match wire.timeout {
      t if t < 0 => return Err(ValidationError(format!("negative timeout {}", t))),
      0 => DEFAULT_TASK_TIMEOUT,
      t => Duration::from_secs(t as u64),
    };
    let schedule = match (wire.enable_cron, wire.cron_expr.trim()) {
      (0, "") => None,
      (0, expr) => Some(Schedule { expr: expr.to_owned(), enabled: false }),
      (_, expr) => Some(Schedule { expr: validate_cron(expr)?, enabled: true }),
    };
    Ok(Task {
      id: (wire.id != 0).then_some(TaskId(wire.id)),
      name: wire.name,
      description: wire.description,
      kind,
      timeout,
      enabled,
      schedule,
      created_at: wire.created_at,
      updated_at: wire.updated_at,
    })
  }
}

impl From<Task> for TaskWire {
  fn from(task: Task) -> Self {
    let mut wire = TaskWire {
      id: task.id.map(|id| id.0).unwrap_or(0),
      name: task.name,
      description: task.description,
      timeout: i64::try_from(task.timeout.as_secs()).unwrap_or(i64::MAX),
      status: if task.enabled { "active" } else { "inactive" }.to_owned(),
      created_at: task.created_at,
      updated_at: task.updated_at,
      ..TaskWire::default()
    };
    match task.kind {
      TaskKind::Script { script } => {
        wire.kind = "script".into();
        wire.script = script;
      }
      TaskKind::Http { url, method, headers, body } => {
        wire.kind = "http".into();
        wire.url = url;
        wire.method = method;
        wire.headers = if headers.is_empty() {
          String::new()
        } else {
          serde_json::to_string(&headers).unwrap_or_default()
        };
        wire.body = body;
      }
    }
    if let Some(schedule) = task.schedule {
      wire.enable_cron = u8::from(schedule.enabled);
      wire.cron_expr = schedule.expr;
    }
    wire
  }
}

fn validate_url(url: &str) -> Result<String, ValidationError> {
  let url = url.trim();
  if url.starts_with("http://") || url.starts_with("https://") {
    Ok(url.to_owned())
  } else if url.is_empty() {
    Err(ValidationError("http task requires a url".into()))
  } else {
    Err(ValidationError(format!("unsupported url '{}'", url)))
  }
}

fn validate_method(method: &str) -> Result<String, ValidationError> {
  let method = method.trim().to_ascii_uppercase();
  if method.is_empty() {
    return Ok("GET".into());
  }
  if HTTP_METHODS.contains(&method.as_str()) {
    Ok(method)
  } else {
    Err(ValidationError(format!("unsupported http method '{}'", method)))
  }
}

fn parse_headers(raw: &str) -> Result<BTreeMap<String, String>, ValidationError> {
  if raw.trim().is_empty() {
    return Ok(BTreeMap::new());
  }
  let headers: BTreeMap<String, String> = serde_json::from_str(raw)
    .map_err(|e| ValidationError(format!("headers must be a JSON object of strings: {}", e)))?;
  if let Some(bad) = headers.keys().find(|k| !HEADER_NAME.is_match(k)) {
    return Err(ValidationError(format!("invalid header name '{}'", bad)));
  }
  Ok(headers)
}

/// Checks the shape of a cron expression: 5 or 6 fields of cron characters.
pub fn validate_cron(expr: &str) -> Result<String, ValidationError> {
  let fields: Vec<&str> = expr.split_whitespace().collect();
  if !(5..=6).contains(&fields.len()) {
    return Err(ValidationError(format!(
      "cron expression needs 5 or 6 fields, got {}",
      fields.len()
    )));
  }
  if let Some(bad) = fields.iter().find(|f| !CRON_FIELD.is_match(f)) {
    return Err(ValidationError(format!("invalid cron field '{}'", bad)));
  }
  Ok(fields.join(" "))
}

fn nullable_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

// Go encodes an unset time.Time as 0001-01-01T00:00:00Z.
fn optional_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
  D: Deserializer<'de>,
{
  let value = Option::<DateTime<Utc>>::deserialize(deserializer)?;
  Ok(value.filter(|t| t.year() > 1))
}

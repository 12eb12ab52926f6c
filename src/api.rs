//! HTTP/JSON collaborator interface of the task backend.
//!
//! Routes live under `{base}/api/citask`:
//! - `POST /run/{task}` starts a run, `GET /progress/{run}` polls it,
//!   `POST /stop/{run}` asks the backend to stop it, `GET /running` lists
//!   runs that have not finished
//! - the task catalogue (`GET|POST /`, `GET|PUT|DELETE /{task}`, `GET /search`,
//!   `GET /logs/{task}`, `GET /next-run`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::models::{RunId, Task, TaskId, TaskRun};

/// Run lifecycle calls used by the progress poller.
#[async_trait]
pub trait RunApi: Send + Sync {
  async fn start_run(&self, task: TaskId) -> ApiResult<TaskRun>;

  async fn fetch_run(&self, run: RunId) -> ApiResult<TaskRun>;

  /// Advisory: acceptance does not mean the run has finished.
  async fn stop_run(&self, run: RunId) -> ApiResult<()>;

  /// Runs currently `pending` or `running`.
  async fn list_running(&self) -> ApiResult<Vec<TaskRun>>;
}

/// Task catalogue calls. One-shot, never retried.
#[async_trait]
pub trait TaskCatalog: Send + Sync {
  async fn list_tasks(&self) -> ApiResult<Vec<Task>>;
  async fn search_tasks(&self, keyword: &str) -> ApiResult<Vec<Task>>;
  async fn get_task(&self, task: TaskId) -> ApiResult<Task>;
  async fn create_task(&self, task: &Task) -> ApiResult<Task>;
  async fn update_task(&self, id: TaskId, task: &Task) -> ApiResult<Task>;
  async fn delete_task(&self, task: TaskId) -> ApiResult<()>;
  /// Past and current runs of one task, newest first.
  async fn task_runs(&self, task: TaskId) -> ApiResult<Vec<TaskRun>>;
  async fn next_run_time(&self, cron_expr: &str) -> ApiResult<Option<DateTime<Utc>>>;
}

pub struct HttpTaskApi {
  client: reqwest::Client,
  base_url: String,
  token: Option<String>,
}

#[derive(Deserialize)]
struct NextRunResponse {
  #[serde(default)]
  next_run: Option<DateTime<Utc>>,
}

impl HttpTaskApi {
  pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
    Self::build(base_url.into(), None, None)
  }

  pub fn from_config(config: &Config) -> ApiResult<Self> {
    Self::build(config.api_url.clone(), config.token.clone(), config.http_timeout)
  }

  fn build(
    base_url: String,
    token: Option<String>,
    timeout: Option<std::time::Duration>,
  ) -> ApiResult<Self> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }
    let client = builder.build().map_err(ApiError::transport)?;
    Ok(Self {
      client,
      base_url: base_url.trim_end_matches('/').to_owned(),
      token,
    })
  }

  fn request(&self, method: Method, path: &str) -> RequestBuilder {
    let url = format!("{}/api/citask{}", self.base_url, path);
    debug!(%method, %url, "task api request");
    let request = self.client.request(method, url);
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  async fn send(&self, request: RequestBuilder) -> ApiResult<Value> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    let parsed = if body.trim().is_empty() {
      Ok(Value::Null)
    } else {
      serde_json::from_str::<Value>(&body)
    };

    if !status.is_success() {
      let message = parsed.ok().as_ref().and_then(error_message);
      return Err(ApiError::Application { status: status.as_u16(), message });
    }

    let value = parsed?;
    if value.get("success").and_then(Value::as_bool) == Some(false) {
      return Err(ApiError::Application {
        status: status.as_u16(),
        message: error_message(&value),
      });
    }
    Ok(value)
  }

  async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ApiResult<T> {
    let value = self.send(request).await?;
    Ok(serde_json::from_value(value)?)
  }
}

fn error_message(body: &Value) -> Option<String> {
  ["error", "message", "msg"]
    .iter()
    .find_map(|key| body.get(*key).and_then(Value::as_str))
    .map(str::to_owned)
}

#[async_trait]
impl RunApi for HttpTaskApi {
  async fn start_run(&self, task: TaskId) -> ApiResult<TaskRun> {
    self.send_json(self.request(Method::POST, &format!("/run/{}", task))).await
  }

  async fn fetch_run(&self, run: RunId) -> ApiResult<TaskRun> {
    self.send_json(self.request(Method::GET, &format!("/progress/{}", run))).await
  }

  async fn stop_run(&self, run: RunId) -> ApiResult<()> {
    self.send(self.request(Method::POST, &format!("/stop/{}", run))).await?;
    Ok(())
  }

  async fn list_running(&self) -> ApiResult<Vec<TaskRun>> {
    let value = self.send(self.request(Method::GET, "/running")).await?;
    // an idle backend may answer with null instead of []
    if value.is_null() {
      return Ok(Vec::new());
    }
    Ok(serde_json::from_value(value)?)
  }
}

#[async_trait]
impl TaskCatalog for HttpTaskApi {
  async fn list_tasks(&self) -> ApiResult<Vec<Task>> {
    self.send_json(self.request(Method::GET, "")).await
  }

  async fn search_tasks(&self, keyword: &str) -> ApiResult<Vec<Task>> {
    self
      .send_json(self.request(Method::GET, "/search").query(&[("keyword", keyword)]))
      .await
  }

  async fn get_task(&self, task: TaskId) -> ApiResult<Task> {
    self.send_json(self.request(Method::GET, &format!("/{}", task))).await
  }

  async fn create_task(&self, task: &Task) -> ApiResult<Task> {
    self.send_json(self.request(Method::POST, "").json(task)).await
  }

  async fn update_task(&self, id: TaskId, task: &Task) -> ApiResult<Task> {
    self
      .send_json(self.request(Method::PUT, &format!("/{}", id)).json(task))
      .await
  }

  async fn delete_task(&self, task: TaskId) -> ApiResult<()> {
    self.send(self.request(Method::DELETE, &format!("/{}", task))).await?;
    Ok(())
  }

  async fn task_runs(&self, task: TaskId) -> ApiResult<Vec<TaskRun>> {
    self.send_json(self.request(Method::GET, &format!("/logs/{}", task))).await
  }

  async fn next_run_time(&self, cron_expr: &str) -> ApiResult<Option<DateTime<Utc>>> {
    let response: NextRunResponse = self
      .send_json(self.request(Method::GET, "/next-run").query(&[("cron_expr", cron_expr)]))
      .await?;
    Ok(response.next_run)
  }
}

impl HttpTaskApi {
  pub fn base_url(&self) -> &str {
    &self.base_url
  }
}

/// True for the statuses the backend uses when an id does not exist.
pub fn is_not_found(err: &ApiError) -> bool {
  matches!(err, ApiError::Application { status, .. } if *status == StatusCode::NOT_FOUND.as_u16())
}

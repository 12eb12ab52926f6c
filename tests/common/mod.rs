#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use taskwatch::api::RunApi;
use taskwatch::error::{ApiError, ApiResult};
use taskwatch::models::{RunId, RunStatus, TaskId, TaskRun};
use tokio::sync::Notify;

pub fn started_at() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
}

pub fn run(id: u64, status: RunStatus, progress: u8, output: &str) -> TaskRun {
  TaskRun {
    id: RunId(id),
    task_id: Some(TaskId(7)),
    task_name: None,
    status,
    start_time: Some(started_at()),
    end_time: status.is_terminal().then(|| started_at() + chrono::Duration::seconds(12)),
    output: output.to_owned(),
    error: String::new(),
    duration: None,
    progress,
  }
}

#[derive(Clone, Debug)]
pub enum Failure {
  Network,
  Status(u16, &'static str),
}

impl Failure {
  fn to_error(&self) -> ApiError {
    match self {
      Failure::Network => ApiError::transport(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "connection reset by peer",
      )),
      Failure::Status(status, message) => ApiError::Application {
        status: *status,
        message: Some((*message).to_owned()),
      },
    }
  }
}

#[derive(Clone)]
pub enum Step {
  Snapshot(TaskRun),
  Fail(Failure),
  /// Waits for the gate before answering.
  Gated(Arc<Notify>, TaskRun),
}

#[derive(Default)]
struct FakeState {
  starts: HashMap<TaskId, Result<TaskRun, Failure>>,
  polls: HashMap<RunId, VecDeque<Step>>,
  last: HashMap<RunId, TaskRun>,
  running: VecDeque<Result<Vec<TaskRun>, Failure>>,
  last_running: Vec<TaskRun>,
  stop_failure: Option<Failure>,
  fetches: Vec<RunId>,
  stops: Vec<RunId>,
  list_calls: usize,
}

/// Scripted backend: each run answers its queued steps in order, then keeps
/// repeating the last snapshot it returned.
#[derive(Default)]
pub struct FakeRunApi {
  state: Mutex<FakeState>,
}

impl FakeRunApi {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn on_start(&self, task: u64, result: Result<TaskRun, Failure>) {
    let mut state = self.state.lock().unwrap();
    if let Ok(run) = &result {
      state.last.insert(run.id, run.clone());
    }
    state.starts.insert(TaskId(task), result);
  }

  pub fn script(&self, run: u64, steps: Vec<Step>) {
    self.state.lock().unwrap().polls.entry(RunId(run)).or_default().extend(steps);
  }

  pub fn on_running(&self, result: Result<Vec<TaskRun>, Failure>) {
    self.state.lock().unwrap().running.push_back(result);
  }

  pub fn fail_stop(&self, failure: Failure) {
    self.state.lock().unwrap().stop_failure = Some(failure);
  }

  pub fn fetches(&self) -> Vec<RunId> {
    self.state.lock().unwrap().fetches.clone()
  }

  pub fn fetch_count(&self, run: u64) -> usize {
    self.fetches().iter().filter(|r| **r == RunId(run)).count()
  }

  pub fn stops(&self) -> Vec<RunId> {
    self.state.lock().unwrap().stops.clone()
  }

  pub fn list_calls(&self) -> usize {
    self.state.lock().unwrap().list_calls
  }
}

#[async_trait]
impl RunApi for FakeRunApi {
  async fn start_run(&self, task: TaskId) -> ApiResult<TaskRun> {
    let state = self.state.lock().unwrap();
    match state.starts.get(&task) {
      Some(Ok(run)) => Ok(run.clone()),
      Some(Err(failure)) => Err(failure.to_error()),
      None => Err(Failure::Status(404, "task not found").to_error()),
    }
  }

  async fn fetch_run(&self, run: RunId) -> ApiResult<TaskRun> {
    let step = {
      let mut state = self.state.lock().unwrap();
      state.fetches.push(run);
      match state.polls.get_mut(&run).and_then(VecDeque::pop_front) {
        Some(step) => step,
        None => match state.last.get(&run) {
          Some(last) => Step::Snapshot(last.clone()),
          None => Step::Fail(Failure::Status(404, "run not found")),
        },
      }
    };
    let snapshot = match step {
      Step::Snapshot(snapshot) => snapshot,
      Step::Fail(failure) => return Err(failure.to_error()),
      Step::Gated(gate, snapshot) => {
        gate.notified().await;
        snapshot
      }
    };
    self.state.lock().unwrap().last.insert(run, snapshot.clone());
    Ok(snapshot)
  }

  async fn stop_run(&self, run: RunId) -> ApiResult<()> {
    let mut state = self.state.lock().unwrap();
    if let Some(failure) = &state.stop_failure {
      return Err(failure.to_error());
    }
    state.stops.push(run);
    Ok(())
  }

  async fn list_running(&self) -> ApiResult<Vec<TaskRun>> {
    let mut state = self.state.lock().unwrap();
    state.list_calls += 1;
    match state.running.pop_front() {
      Some(Ok(runs)) => {
        state.last_running = runs.clone();
        Ok(runs)
      }
      Some(Err(failure)) => Err(failure.to_error()),
      None => Ok(state.last_running.clone()),
    }
  }
}

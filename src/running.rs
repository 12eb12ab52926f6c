use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::api::RunApi;
use crate::error::ApiResult;
use crate::models::{RunId, TaskRun};
use crate::session::{ProgressSession, RunHandle};
use crate::timer::{PollTimer, TickOutcome};

#[derive(Default)]
struct RunningState {
  generation: u64,
  runs: Vec<TaskRun>,
  selected: usize,
  refreshed_at: Option<DateTime<Utc>>,
  last_error: Option<String>,
  timer: Option<PollTimer>,
}

impl RunningState {
  fn replace(&mut self, runs: Vec<TaskRun>) {
    // keep the cursor on the same run when it is still listed
    let selected_id = self.runs.get(self.selected).map(|r| r.id);
    self.runs = runs;
    self.selected = selected_id
      .and_then(|id| self.runs.iter().position(|r| r.id == id))
      .unwrap_or(0)
      .min(self.runs.len().saturating_sub(1));
    self.refreshed_at = Some(Utc::now());
    self.last_error = None;
  }

  fn stop_timer(&mut self) {
    if let Some(timer) = self.timer.take() {
      timer.cancel();
    }
  }
}

fn lock(state: &Mutex<RunningState>) -> MutexGuard<'_, RunningState> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// List of unfinished runs, refreshed on its own timer independently of any
/// [`ProgressSession`]. A failed refresh stops the timer; call
/// [`RunningTasksMonitor::start`] again to resume.
pub struct RunningTasksMonitor {
  api: Arc<dyn RunApi>,
  interval: Duration,
  state: Arc<Mutex<RunningState>>,
}

impl RunningTasksMonitor {
  pub fn new(api: Arc<dyn RunApi>, interval: Duration) -> Self {
    Self {
      api,
      interval,
      state: Arc::new(Mutex::new(RunningState::default())),
    }
  }

  /// One-shot refresh. A failure is recorded in [`Self::last_error`] but
  /// leaves a running refresh timer alone.
  pub async fn refresh(&self) -> ApiResult<()> {
    let generation = lock(&self.state).generation;
    refresh_once(self.api.as_ref(), &self.state, generation, false).await.map(|_| ())
  }

  /// Refreshes now and then on every interval until stopped or a refresh fails.
  pub fn start(&self) {
    let mut state = lock(&self.state);
    state.stop_timer();
    state.generation += 1;
    let generation = state.generation;
    let api = Arc::clone(&self.api);
    let shared = Arc::clone(&self.state);
    let initial = Arc::clone(&shared);
    let initial_api = Arc::clone(&api);
    state.timer = Some(PollTimer::spawn(self.interval, move || {
      let api = Arc::clone(&api);
      let shared = Arc::clone(&shared);
      async move {
        match refresh_once(api.as_ref(), &shared, generation, true).await {
          Ok(true) => TickOutcome::Continue,
          Ok(false) | Err(_) => TickOutcome::Stop,
        }
      }
    }));
    drop(state);
    tokio::spawn(async move {
      let _ = refresh_once(initial_api.as_ref(), &initial, generation, true).await;
    });
  }

  pub fn stop(&self) {
    let mut state = lock(&self.state);
    state.stop_timer();
    state.generation += 1;
  }

  pub fn is_refreshing(&self) -> bool {
    lock(&self.state).timer.as_ref().is_some_and(|t| !t.is_cancelled())
  }

  pub fn runs(&self) -> Vec<TaskRun> {
    lock(&self.state).runs.clone()
  }

  pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
    lock(&self.state).refreshed_at
  }

  pub fn last_error(&self) -> Option<String> {
    lock(&self.state).last_error.clone()
  }

  pub fn selected_index(&self) -> usize {
    lock(&self.state).selected
  }

  pub fn selected(&self) -> Option<RunId> {
    let state = lock(&self.state);
    state.runs.get(state.selected).map(|r| r.id)
  }

  pub fn select_next(&self) {
    let mut state = lock(&self.state);
    if state.selected + 1 < state.runs.len() {
      state.selected += 1;
    }
  }

  pub fn select_previous(&self) {
    let mut state = lock(&self.state);
    state.selected = state.selected.saturating_sub(1);
  }

  /// Points `session` at the selected run.
  pub async fn attach_selected(&self, session: &ProgressSession) -> ApiResult<Option<RunHandle>> {
    match self.selected() {
      Some(run_id) => session.resume(run_id).await,
      None => Ok(None),
    }
  }
}

impl Drop for RunningTasksMonitor {
  fn drop(&mut self) {
    lock(&self.state).stop_timer();
  }
}

/// Returns `Ok(false)` when the result belonged to an older generation.
/// `fail_stop` stops the refresh timer on error.
async fn refresh_once(
  api: &dyn RunApi,
  shared: &Mutex<RunningState>,
  generation: u64,
  fail_stop: bool,
) -> ApiResult<bool> {
  let result = api.list_running().await;
  let mut state = lock(shared);
  if state.generation != generation {
    debug!(generation, current = state.generation, "dropping stale running list");
    return Ok(false);
  }
  match result {
    Ok(runs) => {
      let runs: Vec<TaskRun> = runs.into_iter().filter(|r| !r.is_terminal()).collect();
      debug!(count = runs.len(), "running list refreshed");
      state.replace(runs);
      Ok(true)
    }
    Err(err) => {
      error!("running list refresh failed: {}", err);
      state.last_error = Some(err.user_message());
      if fail_stop {
        state.stop_timer();
      }
      Err(err)
    }
  }
}

//! Live view of a single task run.
//!
//! A [`ProgressSession`] owns the latest [`TaskRun`] snapshot, the output
//! buffer and at most one polling timer. Every change of observed run (trigger,
//! resume, close) bumps a generation counter under the same lock that swaps the
//! timer and snapshot. A poll tick carries the generation it was started with,
//! and its response is dropped if the session has moved on by the time it
//! arrives.
//!
//! The initial request of a trigger or resume is tagged the same way with a
//! request ticket: only the most recent trigger, resume or close may change
//! which run is observed, so a slow answer to an older request is discarded.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::api::RunApi;
use crate::error::{ApiError, ApiResult};
use crate::models::{RunId, RunStatus, TaskId, TaskRun};
use crate::output_view::{OutputView, render_payload};
use crate::progress::{Projection, project};
use crate::timer::{PollTimer, TickOutcome};

const MAX_NOTIFICATIONS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
  Info,
  Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub level: NotificationLevel,
  pub message: String,
}

/// Identifies one attachment of a session to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunHandle {
  pub run_id: RunId,
  pub generation: u64,
}

struct SessionState {
  generation: u64,
  requests: u64,
  run: Option<TaskRun>,
  timer: Option<PollTimer>,
  view: OutputView,
  notifications: VecDeque<Notification>,
  revision: watch::Sender<u64>,
}

impl SessionState {
  fn changed(&self) {
    self.revision.send_modify(|rev| *rev = rev.wrapping_add(1));
  }

  fn notify(&mut self, level: NotificationLevel, message: String) {
    if self.notifications.len() == MAX_NOTIFICATIONS {
      self.notifications.pop_front();
    }
    self.notifications.push_back(Notification { level, message });
    self.changed();
  }

  fn begin_request(&mut self) -> u64 {
    self.requests += 1;
    self.requests
  }

  fn is_current(&self, ticket: u64) -> bool {
    self.requests == ticket
  }

  fn cancel_timer(&mut self) {
    if let Some(timer) = self.timer.take() {
      timer.cancel();
    }
  }

  /// Switches to a new run (or to none) and invalidates in-flight ticks.
  fn reset(&mut self) -> u64 {
    self.cancel_timer();
    self.generation += 1;
    self.run = None;
    self.view.clear();
    self.generation
  }

  fn apply(&mut self, run: TaskRun) {
    if let Some(previous) = &self.run {
      if run.status.rank() < previous.status.rank() {
        warn!(run = %run.id, from = %previous.status, to = %run.status, "run status moved backwards");
      }
      if run.status == RunStatus::Running && run.output.len() < previous.output.len() {
        warn!(run = %run.id, "run output shrank while running");
      }
    }
    self.view.set_content(&display_text(&run));
    self.run = Some(run);
    self.changed();
  }
}

/// Output as shown to the user: the payload, then the error text if any.
pub fn display_text(run: &TaskRun) -> String {
  let mut text = render_payload(&run.output).into_text();
  if !run.error.is_empty() {
    if !text.is_empty() && !text.ends_with('\n') {
      text.push('\n');
    }
    text.push_str(&run.error);
  }
  text
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ProgressSession {
  api: Arc<dyn RunApi>,
  interval: Duration,
  state: Arc<Mutex<SessionState>>,
  revisions: watch::Receiver<u64>,
}

impl ProgressSession {
  pub fn new(api: Arc<dyn RunApi>, interval: Duration, viewport: usize) -> Self {
    let (revision, revisions) = watch::channel(0);
    let state = SessionState {
      generation: 0,
      requests: 0,
      run: None,
      timer: None,
      view: OutputView::new(viewport),
      notifications: VecDeque::new(),
      revision,
    };
    Self {
      api,
      interval,
      state: Arc::new(Mutex::new(state)),
      revisions,
    }
  }

  /// Starts a run of `task` and observes it.
  ///
  /// On failure the session is left exactly as it was, apart from an error
  /// notification. Returns `Ok(None)` when a later trigger, resume or close
  /// was issued while the run was being started; the started run is then not
  /// observed.
  pub async fn trigger(&self, task: TaskId) -> ApiResult<Option<RunHandle>> {
    let ticket = lock(&self.state).begin_request();
    info!(task = %task, "starting task run");
    match self.api.start_run(task).await {
      Ok(run) => {
        let run_id = run.id;
        let handle = self.attach(run, ticket);
        if handle.is_some() {
          self.notify(NotificationLevel::Info, format!("Task {} started as run {}", task, run_id));
        }
        Ok(handle)
      }
      Err(err) => {
        error!(task = %task, "failed to start run: {}", err);
        self.notify_if_current(ticket, NotificationLevel::Error, err.user_message());
        Err(err)
      }
    }
  }

  /// Observes a run that is already in progress, e.g. one picked from the
  /// running list. `Ok(None)` means the request was overtaken like in
  /// [`ProgressSession::trigger`].
  pub async fn resume(&self, run_id: RunId) -> ApiResult<Option<RunHandle>> {
    let ticket = lock(&self.state).begin_request();
    info!(run = %run_id, "resuming observation");
    match self.api.fetch_run(run_id).await {
      Ok(run) if run.id != run_id => {
        let err = ApiError::Malformed(format!("asked for run {} but received run {}", run_id, run.id));
        self.notify_if_current(ticket, NotificationLevel::Error, err.user_message());
        Err(err)
      }
      Ok(run) => Ok(self.attach(run, ticket)),
      Err(err) => {
        error!(run = %run_id, "failed to fetch run: {}", err);
        self.notify_if_current(ticket, NotificationLevel::Error, err.user_message());
        Err(err)
      }
    }
  }

  /// Asks the backend to stop `run_id`. Polling carries on until the backend
  /// reports a terminal status.
  pub async fn stop(&self, run_id: RunId) -> ApiResult<()> {
    match self.api.stop_run(run_id).await {
      Ok(()) => {
        info!(run = %run_id, "stop requested");
        self.notify(NotificationLevel::Info, format!("Stop requested for run {}", run_id));
        Ok(())
      }
      Err(err) => {
        error!(run = %run_id, "failed to stop run: {}", err);
        self.notify(NotificationLevel::Error, err.user_message());
        Err(err)
      }
    }
  }

  /// Closes the view: stops polling and discards the local snapshot.
  pub fn close(&self) {
    let mut state = lock(&self.state);
    if state.run.is_some() || state.timer.is_some() {
      debug!(generation = state.generation, "closing progress view");
    }
    state.begin_request();
    state.reset();
    state.changed();
  }

  fn attach(&self, run: TaskRun, ticket: u64) -> Option<RunHandle> {
    let mut state = lock(&self.state);
    if !state.is_current(ticket) {
      debug!(run = %run.id, "dropping response to an overtaken request");
      return None;
    }
    let generation = state.reset();
    let run_id = run.id;
    let terminal = run.is_terminal();
    state.apply(run);
    if terminal {
      debug!(run = %run_id, "run already finished, not polling");
    } else {
      let timer = self.spawn_poll(run_id, generation);
      state.timer = Some(timer);
    }
    Some(RunHandle { run_id, generation })
  }

  fn spawn_poll(&self, run_id: RunId, generation: u64) -> PollTimer {
    let api = Arc::clone(&self.api);
    let shared = Arc::clone(&self.state);
    PollTimer::spawn(self.interval, move || {
      let api = Arc::clone(&api);
      let shared = Arc::clone(&shared);
      async move { poll_tick(api.as_ref(), &shared, run_id, generation).await }
    })
  }

  fn notify(&self, level: NotificationLevel, message: String) {
    lock(&self.state).notify(level, message);
  }

  fn notify_if_current(&self, ticket: u64, level: NotificationLevel, message: String) {
    let mut state = lock(&self.state);
    if state.is_current(ticket) {
      state.notify(level, message);
    }
  }

  pub fn snapshot(&self) -> Option<TaskRun> {
    lock(&self.state).run.clone()
  }

  pub fn current_run(&self) -> Option<RunId> {
    lock(&self.state).run.as_ref().map(|r| r.id)
  }

  pub fn projection(&self, now: DateTime<Utc>) -> Option<Projection> {
    lock(&self.state).run.as_ref().map(|r| project(r, now))
  }

  pub fn generation(&self) -> u64 {
    lock(&self.state).generation
  }

  /// True while a polling timer is installed and not cancelled.
  pub fn is_polling(&self) -> bool {
    lock(&self.state).timer.as_ref().is_some_and(|t| !t.is_cancelled())
  }

  pub fn view(&self) -> OutputView {
    lock(&self.state).view.clone()
  }

  pub fn with_view<R>(&self, f: impl FnOnce(&mut OutputView) -> R) -> R {
    let mut state = lock(&self.state);
    let result = f(&mut state.view);
    state.changed();
    result
  }

  pub fn take_notifications(&self) -> Vec<Notification> {
    lock(&self.state).notifications.drain(..).collect()
  }

  /// Receiver that changes whenever the view should be re-rendered.
  pub fn subscribe(&self) -> watch::Receiver<u64> {
    self.revisions.clone()
  }
}

impl Drop for ProgressSession {
  fn drop(&mut self) {
    lock(&self.state).cancel_timer();
  }
}

async fn poll_tick(
  api: &dyn RunApi,
  shared: &Mutex<SessionState>,
  run_id: RunId,
  generation: u64,
) -> TickOutcome {
  if lock(shared).generation != generation {
    return TickOutcome::Stop;
  }
  debug!(run = %run_id, "polling run");
  let result = api.fetch_run(run_id).await;

  let mut state = lock(shared);
  if state.generation != generation {
    debug!(run = %run_id, generation, current = state.generation, "dropping stale poll result");
    return TickOutcome::Stop;
  }
  match result {
    Ok(run) if run.id != run_id => {
      let err = ApiError::Malformed(format!("asked for run {} but received run {}", run_id, run.id));
      error!(run = %run_id, "{}", err);
      state.notify(NotificationLevel::Error, err.user_message());
      state.cancel_timer();
      state.changed();
      TickOutcome::Stop
    }
    Ok(run) => {
      let terminal = run.is_terminal();
      let status = run.status;
      state.apply(run);
      if terminal {
        info!(run = %run_id, %status, "run finished");
        state.cancel_timer();
        state.changed();
        TickOutcome::Stop
      } else {
        TickOutcome::Continue
      }
    }
    Err(err) => {
      error!(run = %run_id, "poll failed, stopping observation: {}", err);
      state.notify(NotificationLevel::Error, err.user_message());
      state.cancel_timer();
      state.changed();
      TickOutcome::Stop
    }
  }
}

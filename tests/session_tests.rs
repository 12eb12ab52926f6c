mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{FakeRunApi, Failure, Step, run};
use taskwatch::error::ApiError;
use taskwatch::models::{RunId, RunStatus, TaskId};
use taskwatch::running::RunningTasksMonitor;
use taskwatch::session::{NotificationLevel, ProgressSession};
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_test::{assert_err, assert_ok};

const TICK: Duration = Duration::from_secs(1);

fn session(api: &Arc<FakeRunApi>) -> ProgressSession {
  ProgressSession::new(api.clone(), TICK, 5)
}

/// Sleeps past the next tick so that its fetch has been applied.
async fn next_tick() {
  sleep(TICK + Duration::from_millis(10)).await;
}

fn label_and_percent(session: &ProgressSession) -> (&'static str, u8) {
  let p = session.projection(Utc::now()).expect("session has a snapshot");
  (p.label, p.percent)
}

#[tokio::test(start_paused = true)]
async fn trigger_follows_run_to_completion() {
  let api = FakeRunApi::new();
  api.on_start(7, Ok(run(42, RunStatus::Pending, 0, "")));
  api.script(42, vec![
    Step::Snapshot(run(42, RunStatus::Running, 35, "...step1...\n")),
    Step::Snapshot(run(42, RunStatus::Success, 90, "...step1...\n...step2...\n")),
  ]);
  let session = session(&api);

  let handle = assert_ok!(session.trigger(TaskId(7)).await).unwrap();
  assert_eq!(handle.run_id, RunId(42));
  assert_eq!(label_and_percent(&session), ("preparing", 0));
  assert!(session.is_polling());
  assert!(api.fetches().is_empty());

  next_tick().await;
  assert_eq!(label_and_percent(&session), ("in progress", 35));
  assert_eq!(session.view().text(), "...step1...\n");

  next_tick().await;
  assert_eq!(label_and_percent(&session), ("complete", 100));
  assert!(session.view().text().ends_with("...step2...\n"));
  assert!(!session.is_polling());
  assert_eq!(api.fetch_count(42), 2);

  sleep(Duration::from_secs(30)).await;
  assert_eq!(api.fetch_count(42), 2);
}

#[tokio::test(start_paused = true)]
async fn stop_is_advisory_until_backend_reports_terminal() {
  let api = FakeRunApi::new();
  api.on_start(7, Ok(run(42, RunStatus::Running, 10, "")));
  api.script(42, vec![
    Step::Snapshot(run(42, RunStatus::Running, 20, "a\n")),
    Step::Snapshot(run(42, RunStatus::Running, 20, "a\n")),
    Step::Snapshot(run(42, RunStatus::Failed, 20, "a\nstopped\n")),
  ]);
  let session = session(&api);
  assert_ok!(session.trigger(TaskId(7)).await);

  assert_ok!(session.stop(RunId(42)).await);
  assert_eq!(api.stops(), vec![RunId(42)]);
  assert!(session.is_polling());
  assert_eq!(session.snapshot().unwrap().status, RunStatus::Running);

  next_tick().await;
  next_tick().await;
  assert!(session.is_polling());
  assert_eq!(label_and_percent(&session), ("in progress", 20));

  next_tick().await;
  assert!(!session.is_polling());
  assert_eq!(label_and_percent(&session), ("failed", 100));
  assert_eq!(api.fetch_count(42), 3);
}

#[tokio::test(start_paused = true)]
async fn network_error_stops_polling_until_resumed() {
  let api = FakeRunApi::new();
  api.on_start(7, Ok(run(42, RunStatus::Running, 0, "")));
  api.script(42, vec![
    Step::Snapshot(run(42, RunStatus::Running, 10, "x\n")),
    Step::Fail(Failure::Network),
    Step::Snapshot(run(42, RunStatus::Running, 50, "x\ny\n")),
    Step::Snapshot(run(42, RunStatus::Running, 60, "x\ny\nz\n")),
  ]);
  let session = session(&api);
  assert_ok!(session.trigger(TaskId(7)).await);
  session.take_notifications();

  next_tick().await;
  next_tick().await;
  assert!(!session.is_polling());
  assert_eq!(api.fetch_count(42), 2);
  // the last good snapshot stays on screen
  assert_eq!(label_and_percent(&session), ("in progress", 10));
  let notes = session.take_notifications();
  assert_eq!(notes.len(), 1);
  assert_eq!(notes[0].level, NotificationLevel::Error);
  assert!(notes[0].message.contains("connection reset"));

  sleep(Duration::from_secs(30)).await;
  assert_eq!(api.fetch_count(42), 2);

  assert_ok!(session.resume(RunId(42)).await);
  assert_eq!(label_and_percent(&session), ("in progress", 50));
  assert!(session.is_polling());
  next_tick().await;
  assert_eq!(label_and_percent(&session), ("in progress", 60));
}

#[tokio::test(start_paused = true)]
async fn stale_poll_result_is_dropped_after_switching_runs() {
  let api = FakeRunApi::new();
  let gate = Arc::new(Notify::new());
  api.on_start(1, Ok(run(10, RunStatus::Running, 5, "run A\n")));
  api.on_start(2, Ok(run(20, RunStatus::Running, 40, "run B\n")));
  api.script(10, vec![Step::Gated(gate.clone(), run(10, RunStatus::Success, 100, "run A done\n"))]);
  api.script(20, vec![Step::Snapshot(run(20, RunStatus::Running, 45, "run B\nmore\n"))]);
  let session = session(&api);

  assert_ok!(session.trigger(TaskId(1)).await);
  next_tick().await;
  // the fetch for run A is now in flight, blocked on the gate
  assert_eq!(api.fetch_count(10), 1);

  assert_ok!(session.trigger(TaskId(2)).await);
  gate.notify_one();
  sleep(Duration::from_millis(100)).await;

  let snapshot = session.snapshot().unwrap();
  assert_eq!(snapshot.id, RunId(20));
  assert_eq!(snapshot.status, RunStatus::Running);
  assert_eq!(session.view().text(), "run B\n");

  next_tick().await;
  assert_eq!(session.snapshot().unwrap().progress, 45);
  assert!(session.is_polling());
  assert_eq!(api.fetch_count(10), 1);
}

#[tokio::test(start_paused = true)]
async fn close_while_resuming_keeps_view_closed() {
  let api = FakeRunApi::new();
  let gate = Arc::new(Notify::new());
  api.script(10, vec![Step::Gated(gate.clone(), run(10, RunStatus::Running, 30, "run A\n"))]);
  let session = Arc::new(session(&api));

  let resuming = tokio::spawn({
    let session = session.clone();
    async move { session.resume(RunId(10)).await }
  });
  sleep(Duration::from_millis(10)).await;
  assert_eq!(api.fetch_count(10), 1);

  session.close();
  gate.notify_one();
  let handle = assert_ok!(resuming.await.unwrap());
  assert!(handle.is_none());

  assert!(!session.is_polling());
  assert_eq!(session.current_run(), None);
  sleep(Duration::from_secs(5)).await;
  assert_eq!(api.fetch_count(10), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_resume_does_not_replace_newer_selection() {
  let api = FakeRunApi::new();
  let gate = Arc::new(Notify::new());
  api.script(10, vec![Step::Gated(gate.clone(), run(10, RunStatus::Running, 30, "run A\n"))]);
  api.script(20, vec![Step::Snapshot(run(20, RunStatus::Running, 50, "run B\n"))]);
  let session = Arc::new(session(&api));

  let first = tokio::spawn({
    let session = session.clone();
    async move { session.resume(RunId(10)).await }
  });
  sleep(Duration::from_millis(10)).await;

  let handle = assert_ok!(session.resume(RunId(20)).await).unwrap();
  assert_eq!(handle.run_id, RunId(20));
  gate.notify_one();
  assert!(assert_ok!(first.await.unwrap()).is_none());

  assert_eq!(session.current_run(), Some(RunId(20)));
  assert_eq!(session.view().text(), "run B\n");
  next_tick().await;
  next_tick().await;
  assert_eq!(api.fetch_count(10), 1);
  assert_eq!(api.fetch_count(20), 3);
  assert!(session.is_polling());
}

#[tokio::test(start_paused = true)]
async fn only_one_timer_is_ever_active() {
  let api = FakeRunApi::new();
  for task in 1..=4 {
    api.on_start(task, Ok(run(task * 10, RunStatus::Running, 1, "")));
  }
  let session = session(&api);

  assert_ok!(session.trigger(TaskId(1)).await);
  assert_ok!(session.trigger(TaskId(2)).await);
  assert_ok!(session.trigger(TaskId(3)).await);
  sleep(Duration::from_millis(3500)).await;
  assert_eq!(api.fetches(), vec![RunId(30); 3]);

  session.close();
  assert!(!session.is_polling());
  assert!(session.snapshot().is_none());
  sleep(Duration::from_secs(5)).await;
  assert_eq!(api.fetches().len(), 3);

  assert_ok!(session.trigger(TaskId(4)).await);
  assert_ok!(session.resume(RunId(10)).await);
  sleep(Duration::from_millis(2500)).await;
  // resume fetched run 10 once, then two ticks; run 40 never polled
  assert_eq!(api.fetch_count(40), 0);
  assert_eq!(api.fetch_count(10), 3);
  assert_eq!(api.fetches().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn already_finished_run_is_not_polled() {
  let api = FakeRunApi::new();
  api.on_start(7, Ok(run(42, RunStatus::Success, 100, "done\n")));
  let session = session(&api);

  assert_ok!(session.trigger(TaskId(7)).await);
  assert!(!session.is_polling());
  assert_eq!(label_and_percent(&session), ("complete", 100));
  sleep(Duration::from_secs(10)).await;
  assert!(api.fetches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn displayed_progress_never_decreases_and_ends_at_100() {
  let api = FakeRunApi::new();
  api.on_start(7, Ok(run(42, RunStatus::Pending, 0, "")));
  let raw = [10u8, 20, 20, 55, 80];
  let mut steps: Vec<Step> = raw
    .iter()
    .map(|p| Step::Snapshot(run(42, RunStatus::Running, *p, "")))
    .collect();
  steps.push(Step::Snapshot(run(42, RunStatus::Success, 80, "")));
  api.script(42, steps);
  let session = session(&api);
  assert_ok!(session.trigger(TaskId(7)).await);

  let mut seen = vec![label_and_percent(&session).1];
  while session.is_polling() {
    next_tick().await;
    seen.push(label_and_percent(&session).1);
  }
  assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
  assert_eq!(seen.last(), Some(&100));
  assert_eq!(seen.len(), raw.len() + 2);
}

#[tokio::test(start_paused = true)]
async fn output_view_sticks_to_bottom_only_when_pinned() {
  let lines = |n: usize| -> String { (1..=n).map(|i| format!("line {}\n", i)).collect() };
  let api = FakeRunApi::new();
  api.on_start(7, Ok(run(42, RunStatus::Running, 0, &lines(2))));
  api.script(42, vec![
    Step::Snapshot(run(42, RunStatus::Running, 10, &lines(10))),
    Step::Snapshot(run(42, RunStatus::Running, 20, &lines(16))),
    Step::Snapshot(run(42, RunStatus::Running, 30, &lines(20))),
  ]);
  let session = session(&api);
  session.with_view(|view| view.set_viewport(4));
  assert_ok!(session.trigger(TaskId(7)).await);

  next_tick().await;
  let view = session.view();
  assert!(view.is_at_bottom());
  assert_eq!(view.visible_lines().last(), Some("line 10"));

  session.with_view(|view| view.scroll_up(3));
  let before = session.view().offset();
  next_tick().await;
  assert_eq!(session.view().offset(), before);
  assert!(!session.view().is_at_bottom());

  session.with_view(|view| view.scroll_to_bottom());
  next_tick().await;
  assert!(session.view().is_at_bottom());
  assert_eq!(session.view().visible_lines().last(), Some("line 20"));
}

#[tokio::test(start_paused = true)]
async fn failed_trigger_leaves_session_untouched() {
  let api = FakeRunApi::new();
  api.on_start(1, Ok(run(10, RunStatus::Running, 30, "busy\n")));
  api.on_start(2, Err(Failure::Status(400, "task is disabled")));
  let session = session(&api);
  assert_ok!(session.trigger(TaskId(1)).await);
  let generation = session.generation();
  session.take_notifications();

  let err = assert_err!(session.trigger(TaskId(2)).await);
  assert!(matches!(err, ApiError::Application { status: 400, .. }));
  assert_eq!(session.generation(), generation);
  assert_eq!(session.current_run(), Some(RunId(10)));
  assert!(session.is_polling());
  let notes = session.take_notifications();
  assert_eq!(notes.len(), 1);
  assert_eq!(notes[0].message, "task is disabled");

  let err = assert_err!(session.trigger(TaskId(99)).await);
  assert!(matches!(err, ApiError::Application { status: 404, .. }));
  assert_eq!(session.current_run(), Some(RunId(10)));
}

#[tokio::test(start_paused = true)]
async fn failed_stop_does_not_change_polling() {
  let api = FakeRunApi::new();
  api.on_start(7, Ok(run(42, RunStatus::Running, 0, "")));
  api.fail_stop(Failure::Status(400, "task already finished"));
  let session = session(&api);
  assert_ok!(session.trigger(TaskId(7)).await);

  assert_err!(session.stop(RunId(42)).await);
  assert!(session.is_polling());
  let notes = session.take_notifications();
  assert_eq!(notes.last().unwrap().message, "task already finished");

  next_tick().await;
  assert_eq!(api.fetch_count(42), 1);
}

#[tokio::test(start_paused = true)]
async fn mismatched_run_in_poll_response_stops_polling() {
  let api = FakeRunApi::new();
  api.on_start(7, Ok(run(42, RunStatus::Running, 0, "")));
  api.script(42, vec![Step::Snapshot(run(43, RunStatus::Running, 50, ""))]);
  let session = session(&api);
  assert_ok!(session.trigger(TaskId(7)).await);

  next_tick().await;
  assert!(!session.is_polling());
  assert_eq!(session.current_run(), Some(RunId(42)));
  assert_eq!(session.snapshot().unwrap().progress, 0);
}

#[tokio::test(start_paused = true)]
async fn running_list_refreshes_and_attaches_selection() {
  let api = FakeRunApi::new();
  let mut deploy = run(5, RunStatus::Running, 60, "deploying\n");
  deploy.task_name = Some("deploy".into());
  let pending = run(6, RunStatus::Pending, 0, "");
  api.on_running(Ok(vec![deploy.clone(), pending.clone()]));
  api.script(6, vec![
    Step::Snapshot(run(6, RunStatus::Running, 15, "")),
    Step::Snapshot(run(6, RunStatus::Running, 25, "")),
  ]);

  let monitor = RunningTasksMonitor::new(api.clone(), Duration::from_secs(5));
  monitor.start();
  sleep(Duration::from_millis(10)).await;
  let runs = monitor.runs();
  assert_eq!(runs.len(), 2);
  assert_eq!(runs[0].task_name.as_deref(), Some("deploy"));
  assert_eq!(monitor.selected(), Some(RunId(5)));

  monitor.select_next();
  monitor.select_next();
  assert_eq!(monitor.selected(), Some(RunId(6)));

  let session = session(&api);
  let handle = assert_ok!(monitor.attach_selected(&session).await).unwrap();
  assert_eq!(handle.run_id, RunId(6));
  assert_eq!(label_and_percent(&session), ("in progress", 15));
  next_tick().await;
  assert_eq!(label_and_percent(&session), ("in progress", 25));

  // list timer ticks on its own schedule
  sleep(Duration::from_secs(5)).await;
  assert!(api.list_calls() >= 2);
  assert!(monitor.is_refreshing());
  assert_eq!(monitor.selected(), Some(RunId(6)));
}

#[tokio::test(start_paused = true)]
async fn running_list_stops_refreshing_after_failure() {
  let api = FakeRunApi::new();
  api.on_running(Ok(vec![run(5, RunStatus::Running, 0, "")]));
  api.on_running(Err(Failure::Network));
  let monitor = RunningTasksMonitor::new(api.clone(), Duration::from_secs(2));
  monitor.start();

  sleep(Duration::from_millis(2100)).await;
  assert!(!monitor.is_refreshing());
  assert!(monitor.last_error().unwrap().contains("connection reset"));
  // the last good list stays visible
  assert_eq!(monitor.runs().len(), 1);
  let calls = api.list_calls();
  sleep(Duration::from_secs(10)).await;
  assert_eq!(api.list_calls(), calls);

  monitor.start();
  sleep(Duration::from_millis(10)).await;
  assert!(monitor.is_refreshing());
  assert!(monitor.last_error().is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_manual_refresh_keeps_list_timer_running() {
  let api = FakeRunApi::new();
  api.on_running(Ok(vec![run(5, RunStatus::Running, 0, "")]));
  let monitor = RunningTasksMonitor::new(api.clone(), Duration::from_secs(2));
  monitor.start();
  sleep(Duration::from_millis(10)).await;
  assert_eq!(monitor.runs().len(), 1);

  api.on_running(Err(Failure::Network));
  assert_err!(monitor.refresh().await);
  assert!(monitor.is_refreshing());
  assert!(monitor.last_error().is_some());
  assert_eq!(monitor.runs().len(), 1);

  let calls = api.list_calls();
  sleep(Duration::from_millis(2100)).await;
  assert_eq!(api.list_calls(), calls + 1);
  assert!(monitor.is_refreshing());
  assert!(monitor.last_error().is_none());
}

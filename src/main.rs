use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use taskwatch::api::{HttpTaskApi, RunApi, TaskCatalog, is_not_found};
use taskwatch::config::Config;
use taskwatch::logging;
use taskwatch::models::{RunId, RunStatus, Task, TaskId, TaskRun};
use taskwatch::progress::project;
use taskwatch::session::{NotificationLevel, ProgressSession};

#[derive(Parser)]
#[command(name = "taskwatch", about = "Run and follow CI tasks")]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// List tasks, optionally filtered by keyword
  Tasks {
    #[arg(long)]
    search: Option<String>,
  },
  /// Show one task as JSON
  Show { task: TaskId },
  /// Create a task from a JSON file
  Create { file: PathBuf },
  /// Replace a task with the contents of a JSON file
  Update { task: TaskId, file: PathBuf },
  Delete { task: TaskId },
  /// List past runs of a task
  History { task: TaskId },
  /// Ask the backend when a cron expression fires next
  NextRun { expr: String },
  /// Start a task and follow its output until it finishes
  Run { task: TaskId },
  /// Follow a run that is already in progress
  Watch { run: RunId },
  /// Request that a run stops
  Stop { run: RunId },
  /// List runs that have not finished
  Running,
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  let config = Config::from_env()?;
  logging::init_stderr(&config.log_filter)?;
  let api = Arc::new(HttpTaskApi::from_config(&config)?);

  match cli.command {
    Command::Tasks { search } => {
      let tasks = match search {
        Some(keyword) => api.search_tasks(&keyword).await?,
        None => api.list_tasks().await?,
      };
      for task in &tasks {
        print_task_line(task);
      }
    }
    Command::Show { task } => match api.get_task(task).await {
      Ok(task) => println!("{}", serde_json::to_string_pretty(&task)?),
      Err(e) if is_not_found(&e) => bail!("task {} does not exist", task),
      Err(e) => return Err(e.into()),
    },
    Command::Create { file } => {
      let task = read_task(&file)?;
      let created = api.create_task(&task).await?;
      print_task_line(&created);
    }
    Command::Update { task: id, file } => {
      let task = read_task(&file)?;
      let updated = api.update_task(id, &task).await?;
      print_task_line(&updated);
    }
    Command::Delete { task } => {
      api.delete_task(task).await?;
      println!("deleted task {}", task);
    }
    Command::History { task } => {
      for run in api.task_runs(task).await? {
        print_run_line(&run);
      }
    }
    Command::NextRun { expr } => match api.next_run_time(&expr).await? {
      Some(at) => println!("{}", at.to_rfc3339()),
      None => println!("never"),
    },
    Command::Run { task } => {
      let session = ProgressSession::new(api.clone(), config.poll_interval, usize::MAX);
      session.trigger(task).await?;
      follow(&session).await?;
    }
    Command::Watch { run } => {
      let session = ProgressSession::new(api.clone(), config.poll_interval, usize::MAX);
      session.resume(run).await?;
      follow(&session).await?;
    }
    Command::Stop { run } => {
      api.stop_run(run).await?;
      println!("stop requested for run {}", run);
    }
    Command::Running => {
      let runs = api.list_running().await?;
      if runs.is_empty() {
        println!("no runs in progress");
      }
      for run in &runs {
        print_run_line(run);
      }
    }
  }
  Ok(())
}

fn read_task(path: &Path) -> Result<Task> {
  let raw = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
  serde_json::from_str(&raw).with_context(|| format!("{} is not a valid task", path.display()))
}

fn print_task_line(task: &Task) {
  let id = task.id.map(|id| id.to_string()).unwrap_or_else(|| "-".into());
  let state = if task.enabled { "active" } else { "inactive" };
  let schedule = match &task.schedule {
    Some(s) if s.enabled => s.expr.as_str(),
    _ => "manual",
  };
  println!("{:>6}  {:<8} {:<8} {:<16} {}", id, task.kind_name(), state, schedule, task.name);
}

fn print_run_line(run: &TaskRun) {
  let p = project(run, Utc::now());
  let name = run.task_name.as_deref().unwrap_or("");
  let started = run
    .start_time
    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| "-".into());
  println!(
    "{:>6}  {:<12} {:>3}%  {:<19} {:>10}  {}",
    run.id,
    p.label,
    p.percent,
    started,
    p.elapsed_display(),
    name
  );
}

/// Position in the raw run output that has already been written out.
#[derive(Default)]
struct OutputCursor {
  printed: usize,
}

impl OutputCursor {
  /// Output appended since the previous call, or all of it again when the
  /// backend rewrote what was already printed.
  fn advance<'a>(&mut self, output: &'a str) -> &'a str {
    if output.len() < self.printed || !output.is_char_boundary(self.printed) {
      self.printed = 0;
    }
    let fresh = &output[self.printed..];
    self.printed = output.len();
    fresh
  }
}

/// Prints progress to stderr and new output to stdout until polling ends.
async fn follow(session: &ProgressSession) -> Result<()> {
  let mut updates = session.subscribe();
  let mut cursor = OutputCursor::default();
  let mut last_status = String::new();
  loop {
    if let Some(run) = session.snapshot() {
      let mut stdout = std::io::stdout().lock();
      stdout.write_all(cursor.advance(&run.output).as_bytes())?;
      stdout.flush()?;

      let p = project(&run, Utc::now());
      let status = format!("run {}: {} {}%", run.id, p.label, p.percent);
      if status != last_status {
        eprintln!("{} ({})", status, p.elapsed_display());
        last_status = status;
      }
    }
    for note in session.take_notifications() {
      match note.level {
        NotificationLevel::Info => eprintln!("{}", note.message),
        NotificationLevel::Error => eprintln!("error: {}", note.message),
      }
    }
    if !session.is_polling() {
      break;
    }
    tokio::select! {
      changed = updates.changed() => {
        if changed.is_err() {
          break;
        }
      }
      _ = tokio::signal::ctrl_c() => {
        session.close();
        bail!("interrupted");
      }
    }
  }

  match session.snapshot() {
    Some(run) if run.status == RunStatus::Failed => {
      if !run.error.is_empty() {
        eprintln!("{}", run.error.trim_end());
      }
      bail!("run {} failed", run.id)
    }
    Some(run) if !run.is_terminal() => bail!("stopped following run {} before it finished", run.id),
    _ => Ok(()),
  }
}

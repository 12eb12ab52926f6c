//! Progress (observed run: gauge, elapsed time, output, notifications)
//! Running (runs that have not finished; Enter attaches the progress view)

use std::{
  error::Error,
  io,
  sync::Arc,
  time::{Duration, Instant},
};

use chrono::Utc;
use clap::Parser;
use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use taskwatch::{
  api::{HttpTaskApi, RunApi},
  config::Config,
  logging,
  models::{RunId, RunStatus, TaskId},
  progress::project,
  running::RunningTasksMonitor,
  session::{Notification, NotificationLevel, ProgressSession},
};
use tokio::runtime::Runtime;
use tracing::info;
use tui::{
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, Gauge, List, ListItem, ListState, Paragraph, Tabs},
  Terminal,
};

const NOTIFICATION_HISTORY: usize = 5;

#[derive(Parser)]
#[command(name = "taskwatch_dashboard", about = "Live view of CI task runs")]
struct Args {
  /// Start this task and open its progress view
  #[arg(long, conflicts_with = "run")]
  task: Option<TaskId>,
  /// Open the progress view on a run already in progress
  #[arg(long)]
  run: Option<RunId>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DashboardTab {
  Progress,
  Running,
}

struct App {
  current_tab: DashboardTab,
  session: Arc<ProgressSession>,
  running: Arc<RunningTasksMonitor>,
  notifications: Vec<Notification>,
}

impl App {
  fn new(session: Arc<ProgressSession>, running: Arc<RunningTasksMonitor>) -> Self {
    Self {
      current_tab: DashboardTab::Progress,
      session,
      running,
      notifications: vec![],
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Progress => DashboardTab::Running,
      DashboardTab::Running => DashboardTab::Progress,
    }
  }

  fn collect_notifications(&mut self) {
    self.notifications.extend(self.session.take_notifications());
    if self.notifications.len() > NOTIFICATION_HISTORY {
      let excess = self.notifications.len() - NOTIFICATION_HISTORY;
      self.notifications.drain(..excess);
    }
  }
}

fn main() -> Result<(), Box<dyn Error>> {
  let args = Args::parse();
  let config = Config::from_env()?;
  logging::init_file(&config.log_filter, &config.log_file)?;

  let rt = Runtime::new()?;
  let _guard = rt.enter();
  let api: Arc<dyn RunApi> = Arc::new(HttpTaskApi::from_config(&config)?);
  let session = Arc::new(ProgressSession::new(api.clone(), config.poll_interval, 10));
  let running = Arc::new(RunningTasksMonitor::new(api, config.running_interval));
  running.start();

  // errors surface as session notifications
  if let Some(task) = args.task {
    let session = session.clone();
    rt.spawn(async move { session.trigger(task).await });
  } else if let Some(run) = args.run {
    let session = session.clone();
    rt.spawn(async move { session.resume(run).await });
  }

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let mut app = App::new(session, running);
  let result = run_app(&mut terminal, &mut app, &rt);

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  app.session.close();
  app.running.stop();
  result
}

fn run_app<B: Backend>(
  terminal: &mut Terminal<B>,
  app: &mut App,
  rt: &Runtime,
) -> Result<(), Box<dyn Error>> {
  let tick_rate = Duration::from_millis(250);
  let mut last_tick = Instant::now();

  loop {
    app.collect_notifications();
    terminal.draw(|f| ui(f, app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right | KeyCode::Left | KeyCode::Tab => app.next_tab(),
          KeyCode::Char('r') => app.running.start(),
          KeyCode::Char('c') => app.session.close(),
          KeyCode::Char('s') => {
            if let Some(run) = app.session.current_run() {
              let session = app.session.clone();
              rt.spawn(async move { session.stop(run).await });
            }
          }
          code => match app.current_tab {
            DashboardTab::Progress => handle_progress_key(app, code),
            DashboardTab::Running => handle_running_key(app, code, rt),
          },
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }
  Ok(())
}

fn handle_progress_key(app: &App, code: KeyCode) {
  app.session.with_view(|view| {
    let page = view.viewport();
    match code {
      KeyCode::Up => view.scroll_up(1),
      KeyCode::Down => view.scroll_down(1),
      KeyCode::PageUp => view.scroll_up(page),
      KeyCode::PageDown => view.scroll_down(page),
      KeyCode::End => view.scroll_to_bottom(),
      KeyCode::Home => view.scroll_up(usize::MAX),
      _ => {}
    }
  });
}

fn handle_running_key(app: &mut App, code: KeyCode, rt: &Runtime) {
  match code {
    KeyCode::Up => app.running.select_previous(),
    KeyCode::Down => app.running.select_next(),
    KeyCode::Enter => {
      if let Some(run) = app.running.selected() {
        info!(run = %run, "attaching progress view from running list");
        let session = app.session.clone();
        rt.spawn(async move { session.resume(run).await });
        app.current_tab = DashboardTab::Progress;
      }
    }
    _ => {}
  }
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([
      Constraint::Length(3),
      Constraint::Min(0),
      Constraint::Length(3),
    ].as_ref())
    .split(f.size());

  let tab_titles = vec!["Progress", "Running"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
    .block(Block::default().borders(Borders::ALL).title("taskwatch"))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(match app.current_tab {
      DashboardTab::Progress => 0,
      DashboardTab::Running => 1,
    });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Progress => render_progress(f, app, chunks[1]),
    DashboardTab::Running => render_running(f, app, chunks[1]),
  }

  let help = match app.current_tab {
    DashboardTab::Progress => "←/→: Tabs | ↑/↓ PgUp/PgDn End: Scroll | s: Stop run | c: Close | q: Quit",
    DashboardTab::Running => "←/→: Tabs | ↑/↓: Select | Enter: Watch | r: Restart refresh | q: Quit",
  };
  let footer = Paragraph::new(help)
    .style(Style::default().fg(Color::White))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn status_color(status: RunStatus) -> Color {
  match status {
    RunStatus::Pending => Color::Gray,
    RunStatus::Running => Color::Cyan,
    RunStatus::Success => Color::Green,
    RunStatus::Failed => Color::Red,
  }
}

fn render_progress<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .constraints([
      Constraint::Length(3),
      Constraint::Min(3),
      Constraint::Length(NOTIFICATION_HISTORY as u16 + 2),
    ].as_ref())
    .split(area);

  // the output pane loses two rows to its border
  let viewport = chunks[1].height.saturating_sub(2).max(1) as usize;
  if app.session.view().viewport() != viewport {
    app.session.with_view(|view| view.set_viewport(viewport));
  }

  match (app.session.snapshot(), app.session.projection(Utc::now())) {
    (Some(run), Some(p)) => {
      let title = match &run.task_name {
        Some(name) => format!("Run {} of {} ({})", run.id, name, p.elapsed_display()),
        None => format!("Run {} ({})", run.id, p.elapsed_display()),
      };
      let polling = if app.session.is_polling() { "" } else { " [not polling]" };
      let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title(title))
        .gauge_style(Style::default().fg(status_color(p.status)))
        .percent(u16::from(p.percent))
        .label(format!("{} {}%{}", p.label, p.percent, polling));
      f.render_widget(gauge, chunks[0]);
    }
    _ => {
      let idle = Paragraph::new("No run selected. Pick one from the Running tab.")
        .block(Block::default().borders(Borders::ALL).title("Run"));
      f.render_widget(idle, chunks[0]);
    }
  }

  let view = app.session.view();
  let title = if view.is_at_bottom() { "Output (following)" } else { "Output (scrolled)" };
  let lines: Vec<Spans> = view.visible_lines().map(|l| Spans::from(Span::raw(l.to_owned()))).collect();
  let output = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
  f.render_widget(output, chunks[1]);

  let note_items: Vec<ListItem> = app.notifications.iter().map(|n| {
    let style = match n.level {
      NotificationLevel::Info => Style::default().fg(Color::Green),
      NotificationLevel::Error => Style::default().fg(Color::Red),
    };
    ListItem::new(Spans::from(Span::styled(n.message.clone(), style)))
  }).collect();
  let notes = List::new(note_items).block(Block::default().borders(Borders::ALL).title("Notifications"));
  f.render_widget(notes, chunks[2]);
}

fn render_running<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let now = Utc::now();
  let runs = app.running.runs();
  let items: Vec<ListItem> = runs.iter().map(|run| {
    let p = project(run, now);
    ListItem::new(Spans::from(vec![
      Span::styled(format!("{:>6} ", run.id), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
      Span::styled(format!("{:<12}", p.label), Style::default().fg(status_color(p.status))),
      Span::raw(format!(
        "{:>3}%  {:>10}  {}",
        p.percent,
        p.elapsed_display(),
        run.task_name.as_deref().unwrap_or("")
      )),
    ]))
  }).collect();

  let refreshed = app
    .running
    .refreshed_at()
    .map(|t| t.format("%H:%M:%S").to_string())
    .unwrap_or_else(|| "never".into());
  let header = match app.running.last_error() {
    Some(err) => format!("Running tasks (refresh stopped: {}; press r)", err),
    None => format!("Running tasks: {} (updated {})", runs.len(), refreshed),
  };
  let list = List::new(if items.is_empty() { vec![ListItem::new(Spans::from(Span::raw("No runs in progress")))] } else { items })
    .block(Block::default().borders(Borders::ALL).title(header))
    .highlight_style(Style::default().bg(Color::Blue));
  let mut state = ListState::default();
  if !runs.is_empty() {
    state.select(Some(app.running.selected_index()));
  }
  f.render_stateful_widget(list, area, &mut state);
}

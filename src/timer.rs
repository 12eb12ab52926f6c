//! Cancellable fixed-interval timer driving a polling loop.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;

/// What the loop does after a tick has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
  Continue,
  Stop,
}

/// Handle to a spawned polling loop.
///
/// The first tick fires one period after [`PollTimer::spawn`]. A tick that is
/// still awaiting its callback when [`PollTimer::cancel`] is called runs to
/// completion; no tick starts after cancellation. Dropping the handle cancels.
pub struct PollTimer {
  cancel: watch::Sender<bool>,
  handle: JoinHandle<()>,
}

impl PollTimer {
  pub fn spawn<F, Fut>(period: Duration, mut on_tick: F) -> Self
  where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = TickOutcome> + Send + 'static,
  {
    let (cancel, mut cancelled) = watch::channel(false);
    let first = Instant::now() + period;
    let handle = tokio::spawn(async move {
      let mut interval = interval_at(first, period);
      // a slow request delays the next tick instead of bunching them up
      interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
      let mut ticks = IntervalStream::new(interval);
      loop {
        tokio::select! {
          biased;
          _ = cancelled.changed() => break,
          tick = ticks.next() => {
            if tick.is_none() {
              break;
            }
          }
        }
        if *cancelled.borrow() {
          break;
        }
        if on_tick().await == TickOutcome::Stop {
          break;
        }
      }
    });
    Self { cancel, handle }
  }

  pub fn cancel(&self) {
    // stores the flag even when the loop has already exited
    self.cancel.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.cancel.borrow()
  }

  /// True once the loop task has exited.
  pub fn is_finished(&self) -> bool {
    self.handle.is_finished()
  }
}

impl Drop for PollTimer {
  fn drop(&mut self) {
    self.cancel();
  }
}

//! Start/stop lifecycle shared by the background pollers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Running,
}

/// One unit of recurring background work.
#[async_trait::async_trait]
pub trait Tick: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn tick(&self);
}

struct Running {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Owns at most one spawned ticker task.
#[derive(Default)]
pub struct LoopController {
    running: Mutex<Option<Running>>,
}

impl LoopController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LoopState {
        match self.lock().as_ref() {
            Some(r) if !r.join.is_finished() => LoopState::Running,
            _ => LoopState::Stopped,
        }
    }

    /// Spawns the ticker. Returns `false` if it was already running.
    pub fn start<T: Tick>(&self, task: Arc<T>, interval: Duration) -> bool {
        let mut running = self.lock();
        if running.as_ref().is_some_and(|r| !r.join.is_finished()) {
            return false;
        }

        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(run_ticker(task, interval, rx));
        *running = Some(Running { shutdown, join });
        true
    }

    /// Signals the ticker and waits for its current tick to finish.
    pub async fn stop(&self) {
        let running = self.lock().take();
        let Some(Running { shutdown, join }) = running else {
            return;
        };
        let _ = shutdown.send(true);
        if let Err(e) = join.await {
            warn!(error = %e, "background loop ended abnormally");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_ticker<T: Tick>(
    task: Arc<T>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let name = task.name();
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(loop_name = name, ?interval, "background loop started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                debug!(loop_name = name, "tick");
                task.tick().await;
            }
        }
    }

    info!(loop_name = name, "background loop stopped");
}

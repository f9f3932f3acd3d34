//! Background eviction of idle and expired pooled connections.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::pool::PoolControl;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Sweep interval for an idle threshold: half the threshold, within [1s, 30s].
#[must_use]
pub fn sweep_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 2).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL)
}

struct RunningReaper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct ReaperState {
    running: Option<RunningReaper>,
    /// Set by `shutdown`; `start` refuses to spawn afterwards
    terminated: bool,
}

impl ReaperState {
    fn cancel(&mut self) -> bool {
        match self.running.take() {
            Some(running) => {
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

/// Periodically closes pooled connections idle longer than a threshold.
///
/// Nothing runs until [`start`](Self::start) is called. With no idle
/// threshold the reaper stays disabled and `start` does nothing. After
/// [`shutdown`](Self::shutdown) it can never be started again.
pub struct IdleConnectionReaper {
    pool: Arc<dyn PoolControl>,
    idle_timeout: Option<Duration>,
    state: Mutex<ReaperState>,
}

impl std::fmt::Debug for IdleConnectionReaper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleConnectionReaper")
            .field("idle_timeout", &self.idle_timeout)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl IdleConnectionReaper {
    /// `None` or a zero threshold disables reaping.
    #[must_use]
    pub fn new(pool: Arc<dyn PoolControl>, idle_timeout: Option<Duration>) -> Self {
        Self {
            pool,
            idle_timeout: idle_timeout.filter(|t| !t.is_zero()),
            state: Mutex::new(ReaperState::default()),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.idle_timeout.is_some()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .running
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Spawn the sweep task on the current tokio runtime.
    ///
    /// Returns whether a sweep task is running afterwards. Calling `start`
    /// on a running reaper does not spawn a second task. Outside a tokio
    /// runtime, or once shut down, nothing is spawned.
    pub fn start(&self) -> bool {
        let Some(idle_timeout) = self.idle_timeout else {
            tracing::debug!("idle connection reaping disabled");
            return false;
        };

        let mut state = self.state.lock();
        if state.terminated {
            tracing::debug!("idle connection reaper shut down, not starting");
            return false;
        }
        if state.running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return true;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime, idle connection reaper not started");
            return false;
        };

        let interval = sweep_interval(idle_timeout);
        let cancel = CancellationToken::new();
        let handle = runtime.spawn(run_sweeps(
            Arc::clone(&self.pool),
            idle_timeout,
            interval,
            cancel.clone(),
        ));
        state.running = Some(RunningReaper { cancel, handle });

        tracing::info!(
            idle_timeout_ms = idle_timeout.as_millis(),
            interval_ms = interval.as_millis(),
            "idle connection reaper started"
        );
        true
    }

    /// Cancel the sweep task. A no-op if it was never started; a later
    /// `start` may spawn it again.
    pub fn stop(&self) {
        if self.state.lock().cancel() {
            tracing::info!("idle connection reaper stopped");
        }
    }

    /// Cancel the sweep task and refuse every later `start`.
    ///
    /// The terminal flag is set under the same lock `start` checks, so a
    /// `start` racing with `shutdown` either loses or is cancelled here.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.terminated = true;
        if state.cancel() {
            tracing::info!("idle connection reaper stopped");
        }
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().terminated
    }
}

impl Drop for IdleConnectionReaper {
    fn drop(&mut self) {
        self.state.get_mut().cancel();
    }
}

async fn run_sweeps(
    pool: Arc<dyn PoolControl>,
    idle_timeout: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                tracing::debug!("idle connection reaper cancelled");
                break;
            }

            _ = ticker.tick() => {
                let expired = pool.close_expired();
                let idle = pool.close_idle(idle_timeout);
                if expired + idle > 0 {
                    tracing::debug!(expired, idle, "reaped pooled connections");
                }
            }
        }
    }
}

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const MS_PER_SECOND: u64 = 1_000;
const MS_PER_MINUTE: u64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: u64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: u64 = 24 * MS_PER_HOUR;

/// Default period between countdown re-evaluations.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(1);

/// Label shown once the target time is reached.
pub const EXPIRED_LABEL: &str = "Event Started";

/// Wall-clock source in milliseconds since Unix epoch.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Whole days, hours, minutes and seconds left until the target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountdownBreakdown {
    pub days: u64,
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

impl CountdownBreakdown {
    pub fn from_distance_ms(distance_ms: u64) -> Self {
        Self {
            days: distance_ms / MS_PER_DAY,
            hours: (distance_ms % MS_PER_DAY) / MS_PER_HOUR,
            minutes: (distance_ms % MS_PER_HOUR) / MS_PER_MINUTE,
            seconds: (distance_ms % MS_PER_MINUTE) / MS_PER_SECOND,
        }
    }
}

impl fmt::Display for CountdownBreakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}d {}h {}m {}s",
            self.days, self.hours, self.minutes, self.seconds
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CountdownPhase {
    Running,
    /// Target reached. Terminal.
    Expired,
    /// Stopped before the target was reached. Terminal.
    Cancelled,
}

/// One emission of a running countdown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CountdownUpdate {
    Remaining(CountdownBreakdown),
    Expired,
}

impl CountdownUpdate {
    pub fn label(&self) -> String {
        match self {
            Self::Remaining(breakdown) => breakdown.to_string(),
            Self::Expired => EXPIRED_LABEL.to_owned(),
        }
    }
}

/// Countdown toward a fixed target, re-evaluated by the caller on every tick.
#[derive(Debug, Clone)]
pub struct Countdown {
    target_ms: u64,
    phase: CountdownPhase,
}

impl Countdown {
    /// Starts `Running` only when the target is still in the future.
    pub fn new(target_ms: u64, now_ms: u64) -> Self {
        let phase = if target_ms > now_ms {
            CountdownPhase::Running
        } else {
            CountdownPhase::Expired
        };
        Self { target_ms, phase }
    }

    pub fn target_ms(&self) -> u64 {
        self.target_ms
    }

    pub fn phase(&self) -> CountdownPhase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase != CountdownPhase::Running
    }

    /// Re-evaluate at `now_ms`. Returns `None` once terminal.
    pub fn tick(&mut self, now_ms: u64) -> Option<CountdownUpdate> {
        if self.is_terminal() {
            return None;
        }

        let distance_ms = self.target_ms.saturating_sub(now_ms);
        if distance_ms == 0 {
            self.phase = CountdownPhase::Expired;
            return Some(CountdownUpdate::Expired);
        }

        Some(CountdownUpdate::Remaining(
            CountdownBreakdown::from_distance_ms(distance_ms),
        ))
    }

    pub fn cancel(&mut self) {
        if self.phase == CountdownPhase::Running {
            self.phase = CountdownPhase::Cancelled;
        }
    }
}

/// Handle to a spawned countdown tick task.
///
/// Dropping the handle cancels the task; [`CountdownTimer::stop`] additionally
/// waits for it so no callback can run after it returns.
#[derive(Debug)]
pub struct CountdownTimer {
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CountdownTimer {
    /// Spawn a tick task calling `on_update` once per `period` until the
    /// target is reached or the timer is stopped.
    ///
    /// A target that is already in the past produces no updates at all.
    pub fn spawn<C, F>(target_ms: u64, clock: C, period: Duration, mut on_update: F) -> Self
    where
        C: Clock,
        F: FnMut(CountdownUpdate) + Send + 'static,
    {
        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let period = period.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut countdown = Countdown::new(target_ms, clock.now_ms());
            if countdown.is_terminal() {
                debug!(target_ms, "countdown target already reached; no ticks");
                return;
            }

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = stop_child.cancelled() => {
                        countdown.cancel();
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(update) = countdown.tick(clock.now_ms()) else {
                            break;
                        };
                        on_update(update);
                        if countdown.is_terminal() {
                            break;
                        }
                    }
                }
            }

            debug!(target_ms, phase = ?countdown.phase(), "countdown task finished");
        });

        Self {
            stop,
            task: Some(task),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancel the tick task and wait for it to exit.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CountdownTimer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

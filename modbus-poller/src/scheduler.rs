//! Cycle scheduler
//!
//! Runs one cycle as soon as it starts, then one per trigger tick:
//! - `Trigger::aligned_minutes(30)` ticks at :00 and :30 wall-clock time
//! - `Trigger::every(period)` ticks every `period` after start
//!
//! Cycles never overlap. A tick that arrives while a cycle is still running
//! is skipped, not queued. A failed cycle never stops the trigger.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Timelike, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// Something that can execute one full poll-and-forward cycle.
#[async_trait]
pub trait CycleRunner: Send + Sync + 'static {
    /// Returns true when the cycle collected at least one reading.
    async fn run_cycle(&self) -> bool;
}

/// When recurring cycles fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Fixed period measured from start.
    Every(Duration),
    /// Wall-clock minutes divisible by n, like cron `*/n`.
    AlignedMinutes(u32),
}

impl Trigger {
    pub fn every(period: Duration) -> Self {
        Trigger::Every(period)
    }

    pub fn aligned_minutes(minutes: u32) -> Self {
        Trigger::AlignedMinutes(minutes.clamp(1, 60))
    }

    fn ticker(self) -> Ticker {
        match self {
            Trigger::Every(period) => {
                let start = tokio::time::Instant::now() + period;
                let mut interval = interval_at(start, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                Ticker::Fixed(interval)
            }
            Trigger::AlignedMinutes(minutes) => Ticker::Aligned(minutes),
        }
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Trigger::aligned_minutes(30)
    }
}

enum Ticker {
    Fixed(Interval),
    Aligned(u32),
}

impl Ticker {
    async fn tick(&mut self) {
        match self {
            Ticker::Fixed(interval) => {
                interval.tick().await;
            }
            Ticker::Aligned(minutes) => {
                tokio::time::sleep(aligned_delay(Utc::now(), *minutes)).await;
            }
        }
    }
}

/// Time to sleep until the next aligned boundary.
///
/// A boundary less than a second away is the one just served (the timer
/// woke a hair early), so the following one is used instead.
fn aligned_delay(now: DateTime<Utc>, minutes: u32) -> Duration {
    let mut next = next_aligned(now, minutes);
    if next - now < ChronoDuration::seconds(1) {
        next = next_aligned(next, minutes);
    }
    (next - now).to_std().unwrap_or_default()
}

/// First instant strictly after `now` whose minute is divisible by `minutes`
/// (seconds zero). Minutes restart at every hour, as in cron.
pub fn next_aligned(now: DateTime<Utc>, minutes: u32) -> DateTime<Utc> {
    let minutes = minutes.clamp(1, 60);
    let hour_start = now
        .duration_trunc(ChronoDuration::hours(1))
        .unwrap_or(now - ChronoDuration::seconds(i64::from(now.minute() * 60 + now.second())));

    let mut minute = (now.minute() / minutes + 1) * minutes;
    if minute >= 60 {
        minute = 60;
    }
    let next = hour_start + ChronoDuration::minutes(i64::from(minute));
    if next > now {
        next
    } else {
        hour_start + ChronoDuration::hours(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

/// Counters shared with the trigger loop.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub started: AtomicU64,
    pub skipped: AtomicU64,
    pub failed: AtomicU64,
}

/// Clears the busy flag when a cycle ends, even by panic.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct CycleScheduler<R: CycleRunner> {
    runner: Arc<R>,
    trigger: Trigger,
    busy: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: CycleRunner> CycleScheduler<R> {
    pub fn new(runner: Arc<R>, trigger: Trigger) -> Self {
        Self {
            runner,
            trigger,
            busy: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SchedulerStats::default()),
            shutdown: None,
            handle: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        if self.handle.is_some() {
            SchedulerState::Running
        } else {
            SchedulerState::Idle
        }
    }

    /// True while a cycle is executing.
    pub fn is_cycle_running(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    /// Runs one cycle right away and arms the trigger. No-op when running.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!("Scheduler already running");
            return;
        }

        match self.trigger {
            Trigger::Every(period) => info!("Scheduler configured to run every {:?}", period),
            Trigger::AlignedMinutes(m) => info!("Scheduler configured to run every {} minutes", m),
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let runner = self.runner.clone();
        let busy = self.busy.clone();
        let stats = self.stats.clone();
        let ticker = self.trigger.ticker();

        self.shutdown = Some(shutdown_tx);
        self.handle = Some(tokio::spawn(trigger_loop(runner, busy, stats, ticker, shutdown_rx)));
    }

    /// Disarms the trigger, waits for the in-flight cycle, returns to idle.
    pub async fn stop(&mut self) {
        info!("Stopping scheduler...");
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!("Scheduler loop ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}

async fn trigger_loop<R: CycleRunner>(
    runner: Arc<R>,
    busy: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
    mut ticker: Ticker,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut in_flight = launch(&runner, &busy, &stats);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(handle) = launch(&runner, &busy, &stats) {
                    in_flight = Some(handle);
                }
            }
            _ = &mut shutdown => break,
        }
    }

    if let Some(handle) = in_flight {
        if let Err(e) = handle.await {
            error!("Polling cycle aborted: {}", e);
        }
    }
}

fn launch<R: CycleRunner>(
    runner: &Arc<R>,
    busy: &Arc<AtomicBool>,
    stats: &Arc<SchedulerStats>,
) -> Option<JoinHandle<()>> {
    if busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
        warn!("Previous polling cycle still running, skipping this trigger");
        stats.skipped.fetch_add(1, Ordering::Relaxed);
        return None;
    }

    stats.started.fetch_add(1, Ordering::Relaxed);
    let guard = BusyGuard(busy.clone());
    let runner = runner.clone();
    let stats = stats.clone();

    Some(tokio::spawn(async move {
        let _guard = guard;
        info!("Starting scheduled polling cycle");
        let start = Instant::now();

        let success = runner.run_cycle().await;
        let duration = start.elapsed().as_secs_f64();

        if success {
            info!("Polling cycle completed successfully in {:.2} seconds", duration);
        } else {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!("Polling cycle failed after {:.2} seconds", duration);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    const MINUTE: Duration = Duration::from_secs(60);

    #[derive(Default)]
    struct TimedRunner {
        duration: Duration,
        succeed: bool,
        runs: AtomicUsize,
        completed: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl TimedRunner {
        fn new(duration: Duration, succeed: bool) -> Arc<Self> {
            Arc::new(Self { duration, succeed, ..Self::default() })
        }
    }

    #[async_trait]
    impl CycleRunner for TimedRunner {
        async fn run_cycle(&self) -> bool {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.duration).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            self.succeed
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_run_before_first_tick() {
        let runner = TimedRunner::new(MINUTE, true);
        let mut scheduler = CycleScheduler::new(runner.clone(), Trigger::every(30 * MINUTE));
        scheduler.start();
        assert_eq!(scheduler.state(), SchedulerState::Running);

        tokio::time::sleep(29 * MINUTE).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(2 * MINUTE).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);

        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_cycle_skips_tick() {
        let runner = TimedRunner::new(45 * MINUTE, true);
        let mut scheduler = CycleScheduler::new(runner.clone(), Trigger::every(30 * MINUTE));
        scheduler.start();

        // 0..45 first cycle, tick at 30 skipped, tick at 60 runs
        tokio::time::sleep(61 * MINUTE).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.stats().skipped.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_cycle_running());

        scheduler.stop().await;
        assert_eq!(runner.completed.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_cycle_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycles_keep_trigger_armed() {
        let runner = TimedRunner::new(Duration::from_secs(1), false);
        let mut scheduler = CycleScheduler::new(runner.clone(), Trigger::every(10 * MINUTE));
        scheduler.start();

        tokio::time::sleep(35 * MINUTE).await;
        scheduler.stop().await;

        assert_eq!(runner.runs.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.stats().failed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drains_in_flight_cycle() {
        let runner = TimedRunner::new(10 * MINUTE, true);
        let mut scheduler = CycleScheduler::new(runner.clone(), Trigger::every(30 * MINUTE));
        scheduler.start();
        tokio::time::sleep(Duration::from_secs(1)).await;

        scheduler.stop().await;
        assert_eq!(runner.completed.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_next_aligned_boundaries() {
        let at = |h, m, s| Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap();

        assert_eq!(next_aligned(at(12, 7, 13), 30), at(12, 30, 0));
        assert_eq!(next_aligned(at(12, 30, 0), 30), at(13, 0, 0));
        assert_eq!(next_aligned(at(12, 45, 59), 30), at(13, 0, 0));
        assert_eq!(next_aligned(at(23, 59, 0), 30), Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
        assert_eq!(next_aligned(at(12, 7, 13), 15), at(12, 15, 0));
        assert_eq!(next_aligned(at(12, 56, 0), 7), at(13, 0, 0));
    }

    #[test]
    fn test_aligned_delay_skips_boundary_just_served() {
        let at = |h, m, s| Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap();

        assert_eq!(aligned_delay(at(12, 29, 58), 30), Duration::from_secs(2));
        assert_eq!(aligned_delay(at(12, 0, 0), 30), 30 * MINUTE);

        let early = at(12, 29, 59) + ChronoDuration::milliseconds(600);
        assert_eq!(aligned_delay(early, 30), 30 * MINUTE + Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aligned_trigger_fires() {
        let runner = TimedRunner::new(Duration::from_secs(1), true);
        let mut scheduler = CycleScheduler::new(runner.clone(), Trigger::aligned_minutes(1));
        scheduler.start();

        // the next minute boundary is at most a minute away
        tokio::time::sleep(Duration::from_secs(62)).await;
        scheduler.stop().await;

        assert!(runner.runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_trigger() {
        assert_eq!(Trigger::default(), Trigger::AlignedMinutes(30));
        assert_eq!(Trigger::aligned_minutes(0), Trigger::AlignedMinutes(1));
    }
}

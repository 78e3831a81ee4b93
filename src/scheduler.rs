use chrono::{DateTime, Local, TimeZone, Timelike};
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::ScheduleConfig;
use crate::signals::ShutdownSignal;

/// Time from `now` until the next multiple of `interval_minutes` since local midnight
///
/// Exactly on a boundary yields zero.
pub fn delay_until_next_boundary<Tz: TimeZone>(now: &DateTime<Tz>, interval_minutes: u32) -> Duration {
    let interval_secs = u64::from(interval_minutes.max(1)) * 60;
    let since_midnight = u64::from(now.num_seconds_from_midnight());
    // 闰秒时 nanosecond 可能 >= 1e9
    let nanos = u64::from(now.nanosecond() % 1_000_000_000);

    let remainder = since_midnight % interval_secs;
    if remainder == 0 && nanos == 0 {
        return Duration::ZERO;
    }

    Duration::from_secs(interval_secs - remainder) - Duration::from_nanos(nanos)
}

/// Fires ticks aligned to wall-clock boundaries
///
/// Each tick runs as its own task, so a slow send never holds up the next one.
#[derive(Debug, Clone)]
pub struct Scheduler {
    interval_minutes: u32,
    send_on_start: bool,
    initial_delay: Option<Duration>,
}

impl Scheduler {
    pub fn new(config: &ScheduleConfig) -> Self {
        Self {
            interval_minutes: config.send_freq_minutes.max(1),
            send_on_start: config.send_on_start,
            initial_delay: None,
        }
    }

    /// Use a fixed first delay instead of aligning to the local clock
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_minutes) * 60)
    }

    /// Start the tick loop; it ends when `shutdown` fires or its sender is dropped
    pub fn spawn<F, Fut>(
        self,
        tick: F,
        mut shutdown: broadcast::Receiver<ShutdownSignal>,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            if self.send_on_start {
                tracing::info!("Sending initial record on start");
                tokio::spawn(tick());
            }

            let delay = self
                .initial_delay
                .unwrap_or_else(|| delay_until_next_boundary(&Local::now(), self.interval_minutes));
            tracing::info!(
                interval_minutes = self.interval_minutes,
                first_tick_in_secs = delay.as_secs(),
                "Scheduler started"
            );

            let mut timer = interval_at(Instant::now() + delay, self.interval());
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        tracing::debug!("Tick");
                        tokio::spawn(tick());
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("Scheduler stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn at(hour: u32, minute: u32, second: u32, milli: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_milli_opt(hour, minute, second, milli)
            .unwrap()
            .and_utc()
    }

    fn schedule(minutes: u32, send_on_start: bool) -> ScheduleConfig {
        ScheduleConfig {
            send_freq_minutes: minutes,
            send_on_start,
        }
    }

    fn counting_tick(counter: Arc<AtomicUsize>) -> impl Fn() -> std::future::Ready<()> + Send + Sync + 'static {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[test]
    fn test_delay_until_next_boundary() {
        assert_eq!(
            delay_until_next_boundary(&at(9, 23, 0, 0), 10),
            Duration::from_secs(7 * 60)
        );
        assert_eq!(delay_until_next_boundary(&at(9, 30, 0, 0), 10), Duration::ZERO);
        assert_eq!(
            delay_until_next_boundary(&at(9, 29, 59, 500), 10),
            Duration::from_millis(500)
        );
        assert_eq!(
            delay_until_next_boundary(&at(9, 30, 0, 250), 10),
            Duration::from_secs(600) - Duration::from_millis(250)
        );
    }

    #[test]
    fn test_delay_aligns_to_midnight() {
        assert_eq!(
            delay_until_next_boundary(&at(23, 59, 0, 0), 60),
            Duration::from_secs(60)
        );
        // 7 does not divide an hour, boundaries still count from midnight
        assert_eq!(
            delay_until_next_boundary(&at(1, 0, 0, 0), 7),
            Duration::from_secs(60 * (63 - 60))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_then_every_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        // started at 09:23:00 with a 10 minute interval
        let delay = delay_until_next_boundary(&at(9, 23, 0, 0), 10);
        let handle = Scheduler::new(&schedule(10, false))
            .with_initial_delay(delay)
            .spawn(counting_tick(counter.clone()), shutdown_rx);

        tokio::time::sleep(Duration::from_secs(7 * 60 - 1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // 09:30:00
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // 09:40:00, 09:50:00
        tokio::time::sleep(Duration::from_secs(20 * 60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_on_start_fires_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = Scheduler::new(&schedule(10, true))
            .with_initial_delay(Duration::from_secs(300))
            .spawn(counting_tick(counter.clone()), shutdown_rx);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tick_does_not_delay_next() {
        let started = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let tick_started = started.clone();
        let handle = Scheduler::new(&schedule(1, false))
            .with_initial_delay(Duration::ZERO)
            .spawn(
                move || {
                    let started = tick_started.clone();
                    async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        // far longer than the interval
                        tokio::time::sleep(Duration::from_secs(600)).await;
                    }
                },
                shutdown_rx,
            );

        tokio::time::sleep(Duration::from_secs(3 * 60 + 1)).await;
        assert_eq!(started.load(Ordering::SeqCst), 4);

        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_ticks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = Scheduler::new(&schedule(1, false))
            .with_initial_delay(Duration::from_secs(60))
            .spawn(counting_tick(counter.clone()), shutdown_rx);

        shutdown_tx.send(ShutdownSignal::Graceful).unwrap();
        handle.await.unwrap();

        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}

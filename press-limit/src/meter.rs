use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use quanta::Clock;
use quanta::Instant;

/// A fixed-window request counter for one route.
///
/// The window index and the count share a single atomic word
/// (`epoch << 32 | count`), so a rotation and the increments around it can
/// never be observed half-applied.
#[derive(Debug)]
pub struct LoadMeter {
    state: AtomicU64,
    window_ns: u64,
    window: Duration,
    clock: Clock,
    anchor: Instant,
}

/// A consistent view of one meter window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// Requests recorded in the current window.
    pub count: u32,
    /// Time since the current window started.
    pub elapsed: Duration,
    pub window: Duration,
}

impl WindowSnapshot {
    /// Time left until the window rotates.
    pub fn remaining(&self) -> Duration {
        self.window.saturating_sub(self.elapsed)
    }

    /// Observed requests per second.
    pub fn rate(&self) -> f64 {
        f64::from(self.count) / self.window.as_secs_f64()
    }
}

impl LoadMeter {
    pub fn new(window: Duration) -> Self {
        Self::with_clock(window, Clock::new())
    }

    pub fn with_clock(window: Duration, clock: Clock) -> Self {
        let anchor = clock.now();
        Self {
            state: AtomicU64::new(0),
            // A zero window would make every epoch calculation divide by zero.
            window_ns: (window.as_nanos() as u64).max(1),
            window,
            clock,
            anchor,
        }
    }

    /// Count one request in the window it arrived in, rotating first if needed.
    pub fn record_request(&self) {
        let epoch = self.epoch_at(self.now_ns());
        // The closure always returns Some, so the update cannot fail.
        let _ = self
            .state
            .fetch_update(Ordering::SeqCst, Ordering::Acquire, |packed| {
                Some(increment(packed, epoch))
            });
    }

    /// Requests per second observed in the current window.
    pub fn current_rate(&self) -> f64 {
        self.snapshot().rate()
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        let now = self.now_ns();
        let epoch = self.epoch_at(now);
        let (stored, count) = unpack(self.state.load(Ordering::Acquire));

        let count = if stored == epoch || is_newer(stored, epoch) {
            count
        } else {
            0
        };

        WindowSnapshot {
            count,
            elapsed: Duration::from_nanos(now % self.window_ns),
            window: self.window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn now_ns(&self) -> u64 {
        self.clock.now().duration_since(self.anchor).as_nanos() as u64
    }

    fn epoch_at(&self, now_ns: u64) -> u32 {
        (now_ns / self.window_ns) as u32
    }
}

fn pack(epoch: u32, count: u32) -> u64 {
    (u64::from(epoch) << 32) | u64::from(count)
}

fn unpack(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

/// Epochs wrap, so compare them as a signed distance.
fn is_newer(stored: u32, epoch: u32) -> bool {
    (stored.wrapping_sub(epoch) as i32) > 0
}

fn increment(packed: u64, epoch: u32) -> u64 {
    let (stored, count) = unpack(packed);
    if stored == epoch || is_newer(stored, epoch) {
        // A straggler from an older window lands in the live one.
        pack(stored, count.saturating_add(1))
    } else {
        pack(epoch, 1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn it_reports_zero_without_traffic() {
        let (clock, _mock) = Clock::mock();
        let meter = LoadMeter::with_clock(Duration::from_secs(1), clock);

        assert_eq!(meter.current_rate(), 0.0);
        assert_eq!(meter.snapshot().count, 0);
    }

    #[test]
    fn it_scales_the_count_to_requests_per_second() {
        let (clock, _mock) = Clock::mock();
        let meter = LoadMeter::with_clock(Duration::from_secs(2), clock);

        for _ in 0..10 {
            meter.record_request();
        }

        assert_eq!(meter.snapshot().count, 10);
        assert_eq!(meter.current_rate(), 5.0);
    }

    #[test]
    fn it_rotates_at_the_window_boundary() {
        let (clock, mock) = Clock::mock();
        let meter = LoadMeter::with_clock(Duration::from_secs(1), clock);

        for _ in 0..5 {
            meter.record_request();
        }
        mock.increment(Duration::from_millis(999));
        assert_eq!(meter.snapshot().count, 5);
        assert_eq!(meter.snapshot().remaining(), Duration::from_millis(1));

        mock.increment(Duration::from_millis(1));
        // The next window has started but nothing has been recorded in it yet.
        assert_eq!(meter.current_rate(), 0.0);

        meter.record_request();
        let snapshot = meter.snapshot();
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.elapsed, Duration::ZERO);
    }

    #[test]
    fn it_forgets_long_idle_periods() {
        let (clock, mock) = Clock::mock();
        let meter = LoadMeter::with_clock(Duration::from_millis(100), clock);

        meter.record_request();
        mock.increment(Duration::from_secs(60));

        assert_eq!(meter.current_rate(), 0.0);
        meter.record_request();
        assert_eq!(meter.snapshot().count, 1);
    }

    #[test]
    fn current_rate_is_idempotent() {
        let (clock, mock) = Clock::mock();
        let meter = LoadMeter::with_clock(Duration::from_secs(1), clock);

        for _ in 0..42 {
            meter.record_request();
        }
        let first = meter.current_rate();
        mock.increment(Duration::from_millis(300));
        let second = meter.current_rate();

        assert_eq!(first, 42.0);
        assert_eq!(first, second);
    }

    #[test]
    fn stragglers_count_into_the_live_window() {
        let live = pack(7, 3);

        assert_eq!(unpack(increment(live, 6)), (7, 4));
        assert_eq!(unpack(increment(live, 7)), (7, 4));
        assert_eq!(unpack(increment(live, 8)), (8, 1));
    }

    #[test]
    fn epoch_comparison_survives_wrapping() {
        assert!(is_newer(0, u32::MAX));
        assert!(!is_newer(u32::MAX, 0));
        assert!(!is_newer(5, 5));
    }

    #[test]
    fn test_meter_thread_concurrency() {
        use std::thread;

        let meter = Arc::new(LoadMeter::new(Duration::from_secs(600)));
        let threads = 8;
        let per_thread = 1_000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let meter = Arc::clone(&meter);
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        meter.record_request();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(meter.snapshot().count, threads * per_thread);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_meter_task_concurrency() {
        let meter = Arc::new(LoadMeter::new(Duration::from_secs(600)));
        let tasks = 500;

        let handles: Vec<_> = (0..tasks)
            .map(|_| {
                let meter = Arc::clone(&meter);
                tokio::spawn(async move { meter.record_request() })
            })
            .collect();
        let results = futures::future::join_all(handles).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(meter.snapshot().count, tasks);
    }
}

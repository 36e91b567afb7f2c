use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A pair of time sources: a monotonic clock for measuring elapsed time and a
/// wall clock used only to translate an externally supplied reference time.
///
/// Both readings are in microseconds. The monotonic reading has an arbitrary
/// origin; the wall reading counts from the UNIX epoch.
pub trait Clock: Send + Sync + 'static {
    fn monotonic_us(&self) -> i64;
    fn wall_us(&self) -> i64;
}

/// Microseconds on the process-local monotonic clock.
pub fn steady_clock_us() -> i64 {
    QuantaClock::global().monotonic_us()
}

/// Microseconds since the UNIX epoch on the system wall clock.
///
/// This is the value a coordinator broadcasts to `resync` so that several
/// processes share one timeline.
pub fn system_clock_us() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX),
        Err(before_epoch) => -i64::try_from(before_epoch.duration().as_micros()).unwrap_or(i64::MAX),
    }
}

/// Monotonic time from `std::time::Instant`.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn monotonic_us(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_micros()).unwrap_or(i64::MAX)
    }

    fn wall_us(&self) -> i64 {
        system_clock_us()
    }
}

/// Monotonic time from the CPU's Time-Stamp Counter via the `quanta` crate.
///
/// Faster to read than `Instant` and never goes backwards. This is the default
/// clock for responders and requesters.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    clock: quanta::Clock,
    origin: quanta::Instant,
}

impl Default for QuantaClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let origin = clock.now();
        Self { clock, origin }
    }
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn global() -> &'static QuantaClock {
        static GLOBAL: std::sync::OnceLock<QuantaClock> = std::sync::OnceLock::new();
        GLOBAL.get_or_init(QuantaClock::new)
    }
}

impl Clock for QuantaClock {
    fn monotonic_us(&self) -> i64 {
        let elapsed = self.clock.now().duration_since(self.origin);
        i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX)
    }

    fn wall_us(&self) -> i64 {
        system_clock_us()
    }
}

/// A hand-driven clock for tests and simulations.
///
/// Clones share the same readings, so a test can keep one handle and advance
/// the clock seen by a responder that owns another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    monotonic_us: Arc<AtomicI64>,
    wall_us: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(monotonic_us: i64, wall_us: i64) -> Self {
        Self {
            monotonic_us: Arc::new(AtomicI64::new(monotonic_us)),
            wall_us: Arc::new(AtomicI64::new(wall_us)),
        }
    }

    /// Moves both readings forward by `delta_us`.
    pub fn advance_us(&self, delta_us: i64) {
        self.monotonic_us.fetch_add(delta_us, Ordering::AcqRel);
        self.wall_us.fetch_add(delta_us, Ordering::AcqRel);
    }

    pub fn advance_secs(&self, delta: f64) {
        self.advance_us((delta * 1e6).round() as i64);
    }

    /// Steps the wall clock alone, as an NTP correction would.
    pub fn set_wall_us(&self, wall_us: i64) {
        self.wall_us.store(wall_us, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn monotonic_us(&self) -> i64 {
        self.monotonic_us.load(Ordering::Acquire)
    }

    fn wall_us(&self) -> i64 {
        self.wall_us.load(Ordering::Acquire)
    }
}

/// Maps a process-local monotonic clock onto a logical epoch shared with
/// other processes.
///
/// Timestamps are seconds since the epoch, which starts at construction and
/// moves whenever [`SyncedClock::reset_start_time`] is called with a wall-clock
/// reference. Alignment is best effort: no round-trip latency is compensated.
#[derive(Debug)]
pub struct SyncedClock<C: Clock = QuantaClock> {
    clock: C,
    epoch_us: AtomicI64,
}

impl<C: Clock> SyncedClock<C> {
    pub fn new(clock: C) -> Self {
        let epoch_us = AtomicI64::new(clock.monotonic_us());
        Self { clock, epoch_us }
    }

    /// Seconds elapsed on the logical timeline.
    pub fn timestamp(&self) -> f64 {
        let elapsed = self.clock.monotonic_us() - self.epoch_us.load(Ordering::Acquire);
        elapsed as f64 / 1e6
    }

    /// Re-anchors the timeline so that `reference_wall_us` (microseconds since
    /// the UNIX epoch) is time zero.
    pub fn reset_start_time(&self, reference_wall_us: i64) {
        let epoch = self.clock.monotonic_us() + (reference_wall_us - self.clock.wall_us());
        self.epoch_us.store(epoch, Ordering::Release);
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}

impl Default for SyncedClock<QuantaClock> {
    fn default() -> Self {
        Self::new(QuantaClock::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_starts_at_zero_and_tracks_monotonic_clock() {
        let clock = ManualClock::new(5_000_000, 1_700_000_000_000_000);
        let synced = SyncedClock::new(clock.clone());
        assert_eq!(synced.timestamp(), 0.0);

        clock.advance_us(1_500_000);
        assert!((synced.timestamp() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn reset_start_time_aligns_independently_started_processes() {
        let wall = 1_700_000_000_000_000;
        // Two processes whose monotonic clocks have unrelated origins.
        let a = ManualClock::new(10_000_000, wall);
        let b = ManualClock::new(987_654_321, wall);
        let synced_a = SyncedClock::new(a.clone());
        a.advance_us(3_000_000);
        b.advance_us(3_000_000);
        let synced_b = SyncedClock::new(b.clone());
        assert!((synced_a.timestamp() - synced_b.timestamp()).abs() > 2.0);

        let reference = wall + 3_000_000 - 250_000;
        synced_a.reset_start_time(reference);
        synced_b.reset_start_time(reference);
        assert!((synced_a.timestamp() - 0.25).abs() < 1e-9);
        assert!((synced_b.timestamp() - 0.25).abs() < 1e-9);

        a.advance_us(100_000);
        b.advance_us(100_000);
        assert!((synced_a.timestamp() - synced_b.timestamp()).abs() < 1e-9);
    }

    #[test]
    fn wall_clock_steps_after_resync_do_not_move_timestamps() {
        let clock = ManualClock::new(0, 2_000_000);
        let synced = SyncedClock::new(clock.clone());
        synced.reset_start_time(1_000_000);
        assert!((synced.timestamp() - 1.0).abs() < 1e-9);

        clock.set_wall_us(50_000_000);
        assert!((synced.timestamp() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn real_clocks_are_monotonic() {
        let quanta = QuantaClock::new();
        let first = quanta.monotonic_us();
        assert!(quanta.monotonic_us() >= first);

        let system = SystemClock::new();
        let first = system.monotonic_us();
        assert!(system.monotonic_us() >= first);
        assert!(steady_clock_us() <= steady_clock_us());
        assert!(system_clock_us() > 0);
    }
}

//! Stage timer: scoped measurements fed straight into the output stream.
//!
//! On x86_64 the clock is the time-stamp counter, calibrated once against the
//! monotonic clock when the timer is built, so taking a measurement needs no
//! syscall while the sandbox is active.

/// Receiver of `(stage, microseconds)` measurements
pub trait MeasurementSink {
    /// Record one finished stage
    fn emit_measurement(&self, name: &str, micros: i64);
}

#[cfg(target_arch = "x86_64")]
mod clock {
    use std::time::{Duration, Instant};

    const CALIBRATION: Duration = Duration::from_micros(200);

    fn read_tsc() -> u64 {
        // SAFETY: rdtsc is available on every x86_64 CPU.
        #[allow(unused_unsafe)]
        unsafe {
            core::arch::x86_64::_rdtsc()
        }
    }

    #[derive(Clone, Copy, Debug)]
    pub struct Tick(u64);

    #[derive(Clone, Copy, Debug)]
    pub struct Clock {
        ticks_per_us: u64,
    }

    impl Clock {
        pub fn calibrate() -> Self {
            let start_tick = read_tsc();
            let start = Instant::now();
            let elapsed = loop {
                let elapsed = start.elapsed();
                if elapsed >= CALIBRATION {
                    break elapsed;
                }
            };
            let ticks = read_tsc().saturating_sub(start_tick);
            let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX).max(1);
            Self {
                ticks_per_us: (ticks / micros).max(1),
            }
        }

        pub fn now(self) -> Tick {
            Tick(read_tsc())
        }

        pub fn micros_since(self, start: Tick) -> i64 {
            let ticks = read_tsc().saturating_sub(start.0);
            i64::try_from(ticks / self.ticks_per_us).unwrap_or(i64::MAX)
        }
    }
}

#[cfg(not(target_arch = "x86_64"))]
mod clock {
    use std::time::Instant;

    #[derive(Clone, Copy, Debug)]
    pub struct Tick(Instant);

    #[derive(Clone, Copy, Debug)]
    pub struct Clock;

    impl Clock {
        pub fn calibrate() -> Self {
            Self
        }

        pub fn now(self) -> Tick {
            Tick(Instant::now())
        }

        pub fn micros_since(self, start: Tick) -> i64 {
            i64::try_from(start.0.elapsed().as_micros()).unwrap_or(i64::MAX)
        }
    }
}

use clock::{Clock, Tick};

/// Hands out [`Scope`] guards that report their lifetime on drop.
pub struct StageTimer<'s> {
    clock: Clock,
    sink: &'s dyn MeasurementSink,
}

impl<'s> StageTimer<'s> {
    /// Build a timer reporting into `sink`. Calibrates the clock.
    #[must_use]
    pub fn new(sink: &'s dyn MeasurementSink) -> Self {
        Self {
            clock: Clock::calibrate(),
            sink,
        }
    }

    /// Start measuring `name`; the measurement is emitted when the guard drops.
    #[must_use = "the stage is measured until the guard is dropped"]
    pub fn measure(&self, name: &'static str) -> Scope<'_, 's> {
        Scope {
            name,
            start: self.clock.now(),
            timer: self,
        }
    }

    /// Measure the duration of `f`
    pub fn time<T>(&self, name: &'static str, f: impl FnOnce() -> T) -> T {
        let _scope = self.measure(name);
        f()
    }
}

/// A running measurement
pub struct Scope<'t, 's> {
    name: &'static str,
    start: Tick,
    timer: &'t StageTimer<'s>,
}

impl Drop for Scope<'_, '_> {
    fn drop(&mut self) {
        let micros = self.timer.clock.micros_since(self.start);
        self.timer.sink.emit_measurement(self.name, micros);
    }
}

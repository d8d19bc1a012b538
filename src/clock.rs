//! Host timebase access and the loopback zero-timestamp clock.
//!
//! With no wrapped hardware engine, the device derives its timing from the
//! host's monotonic clock: an anchor tick count is latched when IO starts and
//! every ring-buffer-sized period after it becomes one zero time stamp.

use once_cell::sync::Lazy;

#[cfg(target_os = "macos")]
use mach::mach_time::{mach_absolute_time, mach_timebase_info, mach_timebase_info_data_t};

#[cfg(target_os = "macos")]
fn timebase() -> (u64, u64) {
    static TIMEBASE: Lazy<(u64, u64)> = Lazy::new(|| unsafe {
        let mut info = mach_timebase_info_data_t::default();
        mach_timebase_info(&mut info);
        (info.numer as u64, info.denom as u64)
    });
    *TIMEBASE
}

/// Current host time in ticks of the host clock.
pub fn host_now() -> u64 {
    #[cfg(target_os = "macos")]
    {
        unsafe { mach_absolute_time() }
    }
    #[cfg(not(target_os = "macos"))]
    {
        static START: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);
        START.elapsed().as_nanos() as u64
    }
}

/// Host clock frequency in ticks per second.
pub fn host_tick_frequency() -> f64 {
    #[cfg(target_os = "macos")]
    {
        let (numer, denom) = timebase();
        // One tick is numer/denom nanoseconds.
        1_000_000_000.0 * denom as f64 / numer as f64
    }
    #[cfg(not(target_os = "macos"))]
    {
        1_000_000_000.0
    }
}

/// Move the calling thread into the host's time-constraint scheduling band.
///
/// `period = 0` leaves the wake-up cadence to the scheduler; the nominal and
/// maximum computation budgets bound how long the thread may run once woken.
/// The thread stays preemptible by other time-constraint threads. Outside
/// macOS this is a logged no-op.
pub fn promote_current_thread_to_time_constraint(nominal_ns: u64, max_ns: u64) {
    #[cfg(target_os = "macos")]
    {
        let ticks_per_ns = host_tick_frequency() / 1_000_000_000.0;
        let policy = time_constraint::thread_time_constraint_policy_data_t {
            period: 0,
            computation: (nominal_ns as f64 * ticks_per_ns) as u32,
            constraint: (max_ns as f64 * ticks_per_ns) as u32,
            preemptible: 1,
        };
        let result = unsafe {
            time_constraint::thread_policy_set(
                mach::mach_init::mach_thread_self(),
                time_constraint::THREAD_TIME_CONSTRAINT_POLICY,
                &policy as *const _ as *mut _,
                time_constraint::THREAD_TIME_CONSTRAINT_POLICY_COUNT,
            )
        };
        if result != 0 {
            tracing::warn!(result, "failed to enter the time-constraint band");
        }
    }
    #[cfg(not(target_os = "macos"))]
    {
        tracing::debug!(nominal_ns, max_ns, "time-constraint scheduling unavailable");
    }
}

// Bindings for the one scheduling call the mach crate does not cover.
#[cfg(target_os = "macos")]
mod time_constraint {
    use mach::kern_return::kern_return_t;
    use mach::mach_types::thread_act_t;

    pub const THREAD_TIME_CONSTRAINT_POLICY: u32 = 2;
    pub const THREAD_TIME_CONSTRAINT_POLICY_COUNT: u32 = 4;

    #[repr(C)]
    pub struct thread_time_constraint_policy_data_t {
        pub period: u32,
        pub computation: u32,
        pub constraint: u32,
        pub preemptible: u32,
    }

    extern "C" {
        pub fn thread_policy_set(
            thread: thread_act_t,
            flavor: u32,
            policy_info: *mut u32,
            count: u32,
        ) -> kern_return_t;
    }
}

/// Zero-timestamp generator anchored to the host clock.
///
/// One timestamp is reported per ring buffer of frames; `zero_time_stamp`
/// advances the counter whenever the host clock has moved past the next
/// period boundary.
pub struct LoopbackClock {
    anchor_host_time: u64,
    timestamp_count: u64,
    host_ticks_per_frame: f64,
    frames_per_period: u32,
}

impl LoopbackClock {
    /// Create a clock for `sample_rate` with `frames_per_period` frames
    /// between successive zero time stamps.
    pub fn new(sample_rate: f64, frames_per_period: u32) -> Self {
        Self {
            anchor_host_time: host_now(),
            timestamp_count: 0,
            host_ticks_per_frame: host_tick_frequency() / sample_rate,
            frames_per_period,
        }
    }

    /// Re-anchor the clock to "now". Called when the IO engine starts.
    pub fn reset(&mut self) {
        self.anchor_host_time = host_now();
        self.timestamp_count = 0;
    }

    /// Recompute the tick-per-frame ratio for a new sample rate.
    pub fn set_sample_rate(&mut self, sample_rate: f64) {
        self.host_ticks_per_frame = host_tick_frequency() / sample_rate;
    }

    /// Host clock ticks per audio frame at the current sample rate.
    pub fn host_ticks_per_frame(&self) -> f64 {
        self.host_ticks_per_frame
    }

    /// Produce the current `(sample_time, host_time, seed)` correspondence.
    pub fn zero_time_stamp(&mut self) -> (f64, u64, u64) {
        let now = host_now();
        let ticks_per_period = self.host_ticks_per_frame * f64::from(self.frames_per_period);
        let next_host_time =
            self.anchor_host_time + ((self.timestamp_count + 1) as f64 * ticks_per_period) as u64;
        if next_host_time <= now {
            self.timestamp_count += 1;
        }
        let sample_time = (self.timestamp_count * u64::from(self.frames_per_period)) as f64;
        let host_time =
            self.anchor_host_time + (self.timestamp_count as f64 * ticks_per_period) as u64;
        (sample_time, host_time, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_advance_on_period_boundaries() {
        let mut clock = LoopbackClock::new(48_000.0, 512);
        clock.reset();
        let (sample_time, host_time, seed) = clock.zero_time_stamp();
        assert_eq!(sample_time, 0.0);
        assert_eq!(seed, 1);
        assert!(host_time >= clock.anchor_host_time);

        // ~11ms per 512-frame period at 48kHz; after sleeping past one
        // boundary the counter must have advanced.
        std::thread::sleep(std::time::Duration::from_millis(15));
        let (sample_time, _, _) = clock.zero_time_stamp();
        assert!(sample_time >= 512.0, "got {sample_time}");
    }

    #[test]
    fn sample_rate_change_scales_the_tick_ratio() {
        let mut clock = LoopbackClock::new(44_100.0, 512);
        let at_44k = clock.host_ticks_per_frame();
        clock.set_sample_rate(88_200.0);
        let at_88k = clock.host_ticks_per_frame();
        assert!((at_44k / at_88k - 2.0).abs() < 1e-9);
    }
}

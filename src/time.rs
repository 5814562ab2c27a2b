use lazy_static::lazy_static;
use spin::Mutex;

pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Wall-clock style timestamp kept by the timer tick. Field order makes
/// the derived ordering lexicographic, which is correct as long as the
/// value is normalized (nanoseconds < 1e9).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeSpec {
    pub seconds: u64,
    pub nanoseconds: u64,
}

impl TimeSpec {
    pub const fn new(seconds: u64, nanoseconds: u64) -> Self {
        TimeSpec { seconds, nanoseconds }
    }

    /// Add another timespec, carrying nanosecond overflow into seconds.
    pub fn add(self, other: TimeSpec) -> TimeSpec {
        let mut seconds = self.seconds + other.seconds;
        let mut nanoseconds = self.nanoseconds + other.nanoseconds;
        if nanoseconds >= NANOS_PER_SEC {
            seconds += nanoseconds / NANOS_PER_SEC;
            nanoseconds %= NANOS_PER_SEC;
        }
        TimeSpec { seconds, nanoseconds }
    }
}

lazy_static! {
    static ref SYSTEM_TIME: Mutex<TimeSpec> = Mutex::new(TimeSpec::default());
}

/// Advance the system clock by one timer period.
pub fn tick(step: TimeSpec) {
    let mut now = SYSTEM_TIME.lock();
    *now = now.add(step);
}

/// Current system time (time since boot).
pub fn now() -> TimeSpec {
    *SYSTEM_TIME.lock()
}

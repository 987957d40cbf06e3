//! Sample-clock timestamps
//!
//! A [`Timestamp`] is a tick count tagged with the sampling frequency it is
//! counted in. Tick counters wrap; the wrap point is chosen per frequency so
//! that every clock wraps after the same wall-clock period ([`WRAP_SECONDS`]).
//! Rebasing between frequencies therefore never lands on the wrong side of a
//! wrap, and arithmetic stays correct across it.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

/// Wall-clock period after which every timestamp wraps (about 18 hours)
pub const WRAP_SECONDS: u64 = 65536;

/// Frequency-tagged sample clock value
#[derive(Debug, Clone, Copy)]
pub struct Timestamp {
    ticks: u64,
    freq: u32,
}

impl Timestamp {
    /// Create a timestamp; `ticks` is reduced modulo the wrap point of `freq`
    pub fn new(ticks: u64, freq: u32) -> Self {
        let freq = freq.max(1);
        Self {
            ticks: ticks % Self::wrap_for(freq),
            freq,
        }
    }

    /// Zero ticks at the given frequency
    pub fn zero(freq: u32) -> Self {
        Self::new(0, freq)
    }

    /// An interval of `ms` milliseconds expressed at `freq`
    pub fn from_millis(ms: u64, freq: u32) -> Self {
        Self::new(ms * freq as u64 / 1000, freq)
    }

    /// An interval equal to `duration` expressed at `freq`
    pub fn from_duration(duration: Duration, freq: u32) -> Self {
        let ticks = duration.as_nanos() * freq as u128 / 1_000_000_000;
        Self::new(ticks as u64, freq)
    }

    fn wrap_for(freq: u32) -> u64 {
        freq as u64 * WRAP_SECONDS
    }

    /// Number of ticks, always below [`Timestamp::wrap`]
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Sampling frequency in Hz
    pub fn freq(&self) -> u32 {
        self.freq
    }

    /// Tick count at which this clock wraps to zero
    pub fn wrap(&self) -> u64 {
        Self::wrap_for(self.freq)
    }

    pub fn is_zero(&self) -> bool {
        self.ticks == 0
    }

    /// Interpret this value as an interval and convert it to a duration
    pub fn to_duration(&self) -> Duration {
        let nanos = self.ticks as u128 * 1_000_000_000 / self.freq as u128;
        Duration::from_nanos(nanos as u64)
    }

    /// Interpret this value as an interval in milliseconds
    pub fn as_millis(&self) -> u64 {
        self.ticks * 1000 / self.freq as u64
    }

    /// Rebase onto another frequency (floor rounding)
    pub fn convert(&self, freq: u32) -> Self {
        let freq = freq.max(1);
        if freq == self.freq {
            return *self;
        }
        let ticks = self.ticks as u128 * freq as u128 / self.freq as u128;
        Self::new(ticks as u64, freq)
    }

    /// Move forward (or backward, if negative) by a number of ticks
    pub fn add_ticks(&self, delta: i64) -> Self {
        let wrap = self.wrap() as i128;
        let ticks = (self.ticks as i128 + delta as i128).rem_euclid(wrap);
        Self {
            ticks: ticks as u64,
            freq: self.freq,
        }
    }

    /// Multiply an interval by `n`
    pub fn scale(&self, n: u64) -> Self {
        let ticks = (self.ticks as u128 * n as u128) % self.wrap() as u128;
        Self {
            ticks: ticks as u64,
            freq: self.freq,
        }
    }

    /// Signed distance `self - other` in ticks of this timestamp's frequency
    ///
    /// The result lies in the half-open window `(-wrap/2, wrap/2]`.
    pub fn signed_delta(&self, other: &Timestamp) -> i64 {
        let other = other.convert(self.freq);
        let wrap = self.wrap();
        let diff = (self.ticks + wrap - other.ticks) % wrap;
        if diff > wrap / 2 {
            diff as i64 - wrap as i64
        } else {
            diff as i64
        }
    }

    /// Absolute distance between two timestamps, as an interval
    pub fn abs_diff(&self, other: &Timestamp) -> Timestamp {
        Timestamp::new(self.signed_delta(other).unsigned_abs(), self.freq)
    }

    /// Whether this timestamp lies strictly after `other`
    pub fn is_after(&self, other: &Timestamp) -> bool {
        self.cmp(other) == Ordering::Greater
    }

    /// Whether this timestamp lies strictly before `other`
    pub fn is_before(&self, other: &Timestamp) -> bool {
        self.cmp(other) == Ordering::Less
    }
}

impl Add for Timestamp {
    type Output = Timestamp;

    /// Sum, expressed at the left operand's frequency
    fn add(self, rhs: Timestamp) -> Timestamp {
        let rhs = rhs.convert(self.freq);
        Timestamp {
            ticks: (self.ticks + rhs.ticks) % self.wrap(),
            freq: self.freq,
        }
    }
}

impl Sub for Timestamp {
    type Output = Timestamp;

    /// Modular difference, expressed at the left operand's frequency
    fn sub(self, rhs: Timestamp) -> Timestamp {
        let rhs = rhs.convert(self.freq);
        let wrap = self.wrap();
        Timestamp {
            ticks: (self.ticks + wrap - rhs.ticks) % wrap,
            freq: self.freq,
        }
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    /// Serial-number ordering over a half-wrap window, at the finer of the two clocks
    fn cmp(&self, other: &Self) -> Ordering {
        let freq = self.freq.max(other.freq);
        self.convert(freq).signed_delta(&other.convert(freq)).cmp(&0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}Hz", self.ticks, self.freq)
    }
}

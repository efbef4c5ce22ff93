use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Represents a point in trace time as integer nanoseconds since time zero.
///
/// Uses u64 internally to provide:
/// - 1 nanosecond resolution
/// - ~584 years maximum duration
/// - No floating point precision issues
/// - Fast integer arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TimeNs(pub u64);

impl TimeNs {
    pub const ZERO: TimeNs = TimeNs(0);

    /// Create a new TimeNs from nanoseconds
    pub fn from_nanos(nanos: u64) -> Self {
        TimeNs(nanos)
    }

    /// Create a new TimeNs from seconds (converts to nanoseconds)
    pub fn from_seconds(seconds: f64) -> Self {
        TimeNs((seconds * 1_000_000_000.0) as u64)
    }

    /// Floor a fractional nanosecond value into integer time.
    ///
    /// Viewports compute fractional bounds; queries must use integer ones,
    /// rounded outward so the integer window still covers the request.
    pub fn floor_f64(nanos: f64) -> Self {
        TimeNs(nanos.max(0.0).floor() as u64)
    }

    /// Ceil a fractional nanosecond value into integer time.
    pub fn ceil_f64(nanos: f64) -> Self {
        TimeNs(nanos.max(0.0).ceil() as u64)
    }

    /// Get nanoseconds value
    pub fn nanos(self) -> u64 {
        self.0
    }

    /// Convert to seconds (for display purposes only)
    pub fn to_seconds(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Convert to milliseconds (for display purposes only)
    pub fn to_millis(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Convert to microseconds (for display purposes only)
    pub fn to_micros(self) -> f64 {
        self.0 as f64 / 1_000.0
    }

    /// Safely subtract two time points, returning a duration
    pub fn duration_since(self, earlier: TimeNs) -> DurationNs {
        DurationNs(self.0.saturating_sub(earlier.0))
    }

    /// Safely add a duration to this time point
    pub fn add_duration(self, duration: DurationNs) -> TimeNs {
        TimeNs(self.0.saturating_add(duration.0))
    }

    /// Safely subtract a duration from this time point
    pub fn sub_duration(self, duration: DurationNs) -> TimeNs {
        TimeNs(self.0.saturating_sub(duration.0))
    }

    pub fn min(self, other: TimeNs) -> TimeNs {
        TimeNs(self.0.min(other.0))
    }

    pub fn max(self, other: TimeNs) -> TimeNs {
        TimeNs(self.0.max(other.0))
    }
}

impl fmt::Display for TimeNs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.to_seconds();
        if seconds >= 1.0 {
            write!(f, "{:.3}s", seconds)
        } else if seconds >= 0.001 {
            write!(f, "{:.3}ms", self.to_millis())
        } else if seconds >= 0.000001 {
            write!(f, "{:.3}μs", self.to_micros())
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

impl Add<DurationNs> for TimeNs {
    type Output = TimeNs;
    fn add(self, rhs: DurationNs) -> TimeNs {
        self.add_duration(rhs)
    }
}

impl Sub<DurationNs> for TimeNs {
    type Output = TimeNs;
    fn sub(self, rhs: DurationNs) -> TimeNs {
        self.sub_duration(rhs)
    }
}

/// Represents a duration in nanoseconds.
///
/// Used for time windows, padding calculations, and temporal arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct DurationNs(pub u64);

impl DurationNs {
    pub const ZERO: DurationNs = DurationNs(0);

    /// Create a new DurationNs from nanoseconds
    pub fn from_nanos(nanos: u64) -> Self {
        DurationNs(nanos)
    }

    /// Create a new DurationNs from seconds (converts to nanoseconds)
    pub fn from_seconds(seconds: f64) -> Self {
        DurationNs((seconds * 1_000_000_000.0) as u64)
    }

    /// Get nanoseconds value
    pub fn nanos(self) -> u64 {
        self.0
    }

    /// Convert to seconds (for display purposes only)
    pub fn to_seconds(self) -> f64 {
        self.0 as f64 / 1_000_000_000.0
    }

    /// Divide duration by a factor
    pub fn div_f64(self, divisor: f64) -> DurationNs {
        DurationNs((self.0 as f64 / divisor).round() as u64)
    }

    /// Multiply duration by a factor
    pub fn mul_f64(self, multiplier: f64) -> DurationNs {
        DurationNs((self.0 as f64 * multiplier).round() as u64)
    }
}

impl fmt::Display for DurationNs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.to_seconds();
        if seconds >= 1.0 {
            write!(f, "{:.3}s", seconds)
        } else if seconds >= 0.001 {
            write!(f, "{:.3}ms", self.0 as f64 / 1_000_000.0)
        } else if seconds >= 0.000001 {
            write!(f, "{:.3}μs", self.0 as f64 / 1_000.0)
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

//! Linear intensity ramps between a start and an end value.

use serde::{Deserialize, Serialize};

/// Value of a ramp at `current_minute`.
///
/// The ratio along `[start_minute, stop_minute]` is clamped to `[0, 1]`, so the
/// result never leaves `[min(start, end), max(start, end)]`. A zero-length (or
/// inverted) interval counts as already finished once it has begun. Halves
/// round away from zero. Any pair of `i64` endpoints is accepted.
pub fn interpolate(
    start_value: i64,
    end_value: i64,
    start_minute: f64,
    stop_minute: f64,
    current_minute: f64,
) -> i64 {
    let span = stop_minute - start_minute;
    let ratio = if span <= 0.0 {
        if current_minute >= start_minute {
            1.0
        } else {
            0.0
        }
    } else {
        ((current_minute - start_minute) / span).clamp(0.0, 1.0)
    };

    if ratio <= 0.0 {
        return start_value;
    }
    if ratio >= 1.0 {
        return end_value;
    }

    // The difference of two i64 values may not fit in an i64.
    let delta = end_value as f64 - start_value as f64;
    let value = (start_value as f64 + delta * ratio).round() as i64;
    value.clamp(start_value.min(end_value), start_value.max(end_value))
}

/// A ramp bound to the minutes of one feature instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampSpan {
    pub start_value: i64,
    pub end_value: i64,
    pub start_minute: u32,
    pub stop_minute: u32,
}

impl RampSpan {
    pub fn new(start_value: i64, end_value: i64, start_minute: u32, stop_minute: u32) -> Self {
        Self {
            start_value,
            end_value,
            start_minute,
            stop_minute,
        }
    }

    pub fn value_at(&self, minute: f64) -> i64 {
        interpolate(
            self.start_value,
            self.end_value,
            f64::from(self.start_minute),
            f64::from(self.stop_minute),
            minute,
        )
    }

    pub fn final_value(&self) -> i64 {
        self.value_at(f64::from(self.stop_minute))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hits_both_endpoints() {
        for (start, end) in [(10, 90), (90, 10), (0, 0), (-20, 35)] {
            assert_eq!(interpolate(start, end, 2.0, 10.0, 2.0), start);
            assert_eq!(interpolate(start, end, 2.0, 10.0, 10.0), end);
        }
    }

    #[test]
    fn stays_within_endpoints_outside_interval() {
        assert_eq!(interpolate(10, 90, 2.0, 10.0, 0.0), 10);
        assert_eq!(interpolate(10, 90, 2.0, 10.0, 25.0), 90);
        assert_eq!(interpolate(90, 10, 2.0, 10.0, -3.0), 90);
        assert_eq!(interpolate(90, 10, 2.0, 10.0, 11.5), 10);
    }

    #[test]
    fn midpoint_is_linear() {
        assert_eq!(interpolate(10, 90, 2.0, 10.0, 6.0), 50);
        assert_eq!(interpolate(0, 100, 0.0, 4.0, 1.0), 25);
    }

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(interpolate(0, 1, 0.0, 2.0, 1.0), 1);
        assert_eq!(interpolate(0, -1, 0.0, 2.0, 1.0), -1);
        assert_eq!(interpolate(0, 3, 0.0, 2.0, 1.0), 2);
    }

    #[test]
    fn zero_length_interval_jumps_to_end() {
        assert_eq!(interpolate(10, 90, 5.0, 5.0, 5.0), 90);
        assert_eq!(interpolate(10, 90, 5.0, 5.0, 7.25), 90);
        assert_eq!(interpolate(10, 90, 5.0, 5.0, 4.0), 10);
    }

    #[test]
    fn monotonic_in_time() {
        let mut previous = interpolate(3, 97, 1.0, 13.0, 0.0);
        let mut previous_reversed = interpolate(97, 3, 1.0, 13.0, 0.0);
        for step in 1..=300 {
            let minute = step as f64 * 0.05;
            let value = interpolate(3, 97, 1.0, 13.0, minute);
            let reversed = interpolate(97, 3, 1.0, 13.0, minute);
            assert!(value >= previous, "rising ramp fell at minute {minute}");
            assert!(reversed <= previous_reversed, "falling ramp rose at minute {minute}");
            previous = value;
            previous_reversed = reversed;
        }
    }

    #[test]
    fn handles_full_i64_range() {
        assert_eq!(interpolate(i64::MIN, i64::MAX, 0.0, 10.0, 0.0), i64::MIN);
        assert_eq!(interpolate(i64::MIN, i64::MAX, 0.0, 10.0, 5.0), 0);
        assert_eq!(interpolate(i64::MIN, i64::MAX, 0.0, 10.0, 10.0), i64::MAX);
        assert_eq!(interpolate(i64::MAX, i64::MIN, 0.0, 10.0, 5.0), 0);
        assert_eq!(interpolate(i64::MAX, i64::MIN, 0.0, 10.0, 12.0), i64::MIN);

        let mut previous = i64::MIN;
        for step in 0..=40 {
            let value = interpolate(i64::MIN, i64::MAX, 0.0, 10.0, step as f64 * 0.25);
            assert!(value >= previous, "wide ramp fell at step {step}");
            previous = value;
        }
    }

    #[test]
    fn span_reports_final_value() {
        let span = RampSpan::new(10, 90, 2, 10);
        assert_eq!(span.value_at(6.0), 50);
        assert_eq!(span.final_value(), 90);
    }
}

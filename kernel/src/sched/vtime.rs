//! 128-bit fixed-point virtual time.
//!
//! Grounded on `original_source/include/kernel/sched/sched.h`'s
//! `vclock_t`/`SCHED_FIXED_POINT`/`SCHED_FIXED_TO`/`SCHED_FIXED_FROM`/
//! `SCHED_EPSILON`: virtual time and lag are carried as signed 128-bit
//! values with 63 fractional bits so that `veligible`/`vdeadline`
//! arithmetic never touches a floating-point unit, matching the kernel's
//! "all lag and virtual-time arithmetic runs in fixed-point; no floating
//! point in the kernel."

use core::ops::{Add, AddAssign, Sub, SubAssign};

/// Number of fractional bits carried by [`VClock`].
pub const FRAC_BITS: u32 = 63;

/// `Q` in : one unit of real time expressed in fixed point.
pub const Q: i128 = 1i128 << FRAC_BITS;

/// Two virtual times are considered equal when their integer parts
/// differ by at most this many ticks .
pub const SCHED_EPSILON: i128 = 10 * Q;

/// Signed 128-bit fixed-point virtual time / lag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct VClock(i128);

impl VClock {
    pub const ZERO: VClock = VClock(0);

    /// Build a `VClock` from a raw fixed-point value.
    pub const fn from_raw(raw: i128) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i128 {
        self.0
    }

    /// Convert an integer number of real-time ticks into virtual time.
    pub const fn from_ticks(ticks: u64) -> Self {
        Self((ticks as i128) << FRAC_BITS)
    }

    /// `Q * numerator / denominator`, used for both the `vtime +=
    /// Q*(t-lastUpdate)/W` update and the `veligible += Q*u/w` update in
    /// 
    pub fn scaled(numerator: u64, denominator: u64) -> Self {
        debug_assert!(denominator > 0);
        Self((numerator as i128 * Q) / denominator as i128)
    }

    /// `self` is eligible relative to `vtime` iff `self <= vtime` within
    /// [`SCHED_EPSILON`].
    pub fn eligible_at(self, vtime: VClock) -> bool {
        self.0 <= vtime.0 + SCHED_EPSILON
    }

    /// Whether two virtual times are equal within [`SCHED_EPSILON`].
    pub fn nearly_eq(self, other: VClock) -> bool {
        (self.0 - other.0).unsigned_abs() <= SCHED_EPSILON as u128
    }

    pub fn saturating_add(self, rhs: VClock) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_sub(self, rhs: VClock) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl Add for VClock {
    type Output = VClock;
    fn add(self, rhs: VClock) -> VClock {
        VClock(self.0 + rhs.0)
    }
}

impl AddAssign for VClock {
    fn add_assign(&mut self, rhs: VClock) {
        self.0 += rhs.0;
    }
}

impl Sub for VClock {
    type Output = VClock;
    fn sub(self, rhs: VClock) -> VClock {
        VClock(self.0 - rhs.0)
    }
}

impl SubAssign for VClock {
    fn sub_assign(&mut self, rhs: VClock) {
        self.0 -= rhs.0;
    }
}

/// `lag_i = vtime - veligible_i`: how far ahead or behind a client is of
/// the scheduler's virtual clock. Testable property in  bounds
/// `Σ lag_i` within `SCHED_EPSILON · N`.
pub type Lag = VClock;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_ticks_round_trips_through_scaled() {
        let one_second = VClock::from_ticks(1);
        assert_eq!(one_second.raw(), Q);
    }

    #[test]
    fn eligible_respects_epsilon() {
        let vtime = VClock::from_ticks(100);
        let just_behind = vtime - VClock::from_raw(5);
        assert!(just_behind.eligible_at(vtime));
        let far_ahead = vtime + VClock::from_ticks(1);
        assert!(!far_ahead.eligible_at(vtime));
    }

    #[test]
    fn scaled_divides_in_fixed_point() {
        // u=10 real ticks at weight w=2 should double veligible's delta
        // relative to w=1 over the same real time.
        let w1 = VClock::scaled(10, 1);
        let w2 = VClock::scaled(10, 2);
        assert!(w2.raw() * 2 <= w1.raw() + 1 && w2.raw() * 2 >= w1.raw() - 1);
    }
}

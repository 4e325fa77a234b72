//! Rational time bases and the rescale operations used throughout the
//! decoder, encoder, and muxer wrappers (spec §3, §4.5).

use std::fmt;

/// Rounding mode for [`TimebaseMath::rescale`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    Nearest,
    Up,
    Down,
}

/// A rational number `num/den` with `den > 0` after normalization.
///
/// Equality is value-based: `Rational::new(2, 4) == Rational::new(1, 2)`,
/// because the constructor always reduces to lowest terms and moves any
/// negative sign onto the numerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    num: i64,
    den: i64,
}

impl Rational {
    /// Normalizes `num/den` to lowest terms with a strictly positive
    /// denominator. Panics on a zero denominator — every call site in this
    /// crate constructs time bases from native stream/codec metadata, which
    /// never reports `den == 0`.
    pub fn new(num: i64, den: i64) -> Self {
        assert!(den != 0, "Rational denominator must be non-zero");
        let (mut num, mut den) = (num, den);
        if den < 0 {
            num = -num;
            den = -den;
        }
        let g = gcd(num, den).max(1);
        Rational { num: num / g, den: den / g }
    }

    pub fn num(self) -> i64 {
        self.num
    }

    pub fn den(self) -> i64 {
        self.den
    }

    /// The multiplicative inverse `den/num`.
    pub fn inv(self) -> Rational {
        Rational::new(self.den, self.num)
    }

    pub fn mul(self, other: Rational) -> Rational {
        Rational::new(self.num * other.num, self.den * other.den)
    }

    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl From<(i32, i32)> for Rational {
    fn from((num, den): (i32, i32)) -> Self {
        Rational::new(num as i64, den as i64)
    }
}

/// Euclidean GCD; result is always non-negative.
pub fn gcd(a: i64, b: i64) -> i64 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// Namespace for the rescale family of operations (spec §4.5). A zero-sized
/// type rather than free functions so call sites read `TimebaseMath::rescale(...)`,
/// matching the spec's naming of this as a distinct component.
pub struct TimebaseMath;

impl TimebaseMath {
    /// Rescales `value` from `src` to `dst`, preserving sign, with the given
    /// rounding mode. Returns `value` unchanged when `src == dst`.
    pub fn rescale(value: i64, src: Rational, dst: Rational, rounding: Rounding) -> i64 {
        if src == dst {
            return value;
        }
        let num = value as i128 * src.num as i128 * dst.den as i128;
        let den = src.den as i128 * dst.num as i128;
        div_rounded(num, den, rounding)
    }

    pub fn gcd(a: i64, b: i64) -> i64 {
        gcd(a, b)
    }

    pub fn inv(r: Rational) -> Rational {
        r.inv()
    }

    pub fn mul(a: Rational, b: Rational) -> Rational {
        a.mul(b)
    }

    /// Drift-free rescale of a sequence of consecutive timestamps.
    ///
    /// Ports the native library's `av_rescale_delta` behavior: rather than
    /// independently rounding each timestamp from `src_tb` into `dst_tb`
    /// (which accumulates rounding error when `src_tb` doesn't evenly divide
    /// `dst_tb`, as happens when resampled audio crosses from a source time
    /// base into `1/sample_rate`), it tracks the predicted next timestamp in
    /// an `intermediate_tb` via `state`, and blends the freshly rescaled
    /// value with that prediction.
    ///
    /// `state` starts as `None` (the native "unspecified time" sentinel).
    /// When the predicted and freshly-rescaled values diverge by more than
    /// `2 * step` — a real gap, not smoothing slop — `state` is reset to
    /// `None` and this call falls back to an independent rescale, exactly as
    /// spec §4.5 describes.
    pub fn rescale_delta(
        src_tb: Rational,
        src_ts: i64,
        intermediate_tb: Rational,
        step: i64,
        state: &mut Option<i64>,
        dst_tb: Rational,
    ) -> i64 {
        let simple_round = |state: &mut Option<i64>| -> i64 {
            let in_intermediate =
                TimebaseMath::rescale(src_ts, src_tb, intermediate_tb, Rounding::Nearest);
            *state = Some(in_intermediate + step);
            TimebaseMath::rescale(src_ts, src_tb, dst_tb, Rounding::Nearest)
        };

        // Guard against a time base pairing that can't be compared at all.
        let invalid_conversion =
            src_tb.num * dst_tb.den <= 0 || src_tb.den * dst_tb.num <= 0;

        let Some(last) = *state else {
            return simple_round(state);
        };
        if invalid_conversion {
            return simple_round(state);
        }

        let a = TimebaseMath::rescale(2 * src_ts - 1, src_tb, intermediate_tb, Rounding::Down) >> 1;
        let b = (last - a) >> 1;

        if b.abs() > 2 * step.abs().max(1) {
            *state = None;
            return simple_round(state);
        }

        *state = Some(last + step);
        let blended = a + b;
        TimebaseMath::rescale(blended, intermediate_tb, dst_tb, Rounding::Nearest)
    }
}

fn div_rounded(num: i128, den: i128, rounding: Rounding) -> i64 {
    let sign: i128 = if (num < 0) != (den < 0) { -1 } else { 1 };
    let num_abs = num.unsigned_abs();
    let den_abs = den.unsigned_abs();
    let q = num_abs / den_abs;
    let r = num_abs % den_abs;
    let result = match rounding {
        Rounding::Down => q,
        Rounding::Up => {
            if r > 0 {
                q + 1
            } else {
                q
            }
        }
        Rounding::Nearest => {
            if r * 2 >= den_abs {
                q + 1
            } else {
                q
            }
        }
    };
    (sign * result as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_to_lowest_terms() {
        assert_eq!(Rational::new(2, 4), Rational::new(1, 2));
        assert_eq!(Rational::new(-1, 2), Rational::new(1, -2));
    }

    #[test]
    fn rescale_identity_when_same_timebase() {
        let tb = Rational::new(1, 48_000);
        assert_eq!(TimebaseMath::rescale(12_345, tb, tb, Rounding::Nearest), 12_345);
    }

    #[test]
    fn rescale_nearest_rounds_nonexact_values() {
        // 1 in 1/3 rescaled to 1/9 is exactly 3; rescale 1/3 -> 1/2 rounds.
        let src = Rational::new(1, 3);
        let dst = Rational::new(1, 2);
        // value=1 -> 1 * (1*2)/(3*1) = 2/3 -> nearest rounds to 1.
        assert_eq!(TimebaseMath::rescale(1, src, dst, Rounding::Nearest), 1);
        assert_eq!(TimebaseMath::rescale(1, src, dst, Rounding::Down), 0);
        assert_eq!(TimebaseMath::rescale(1, src, dst, Rounding::Up), 1);
    }

    #[test]
    fn rescale_preserves_sign() {
        let src = Rational::new(1, 1000);
        let dst = Rational::new(1, 1_000_000);
        assert_eq!(TimebaseMath::rescale(-5, src, dst, Rounding::Nearest), -5000);
    }

    #[test]
    fn gcd_handles_negatives_and_zero() {
        assert_eq!(gcd(-12, 18), 6);
        assert_eq!(gcd(0, 5), 5);
    }

    #[test]
    fn inv_and_mul() {
        let r = Rational::new(1, 30);
        assert_eq!(r.inv(), Rational::new(30, 1));
        assert_eq!(r.mul(Rational::new(2, 1)), Rational::new(1, 15));
    }

    #[test]
    fn rescale_delta_conserves_step_across_consecutive_calls() {
        // Simulates resampled audio: src_tb 1/44100, intermediate 1/44100,
        // dst 1/90000, constant step of 1024 samples.
        let src_tb = Rational::new(1, 44_100);
        let dst_tb = Rational::new(1, 90_000);
        let mut state: Option<i64> = None;
        let mut src_ts = 0i64;
        let mut last_dst = -1i64;
        for _ in 0..20 {
            let dst = TimebaseMath::rescale_delta(src_tb, src_ts, src_tb, 1024, &mut state, dst_tb);
            assert!(dst > last_dst, "rescaled timestamps must be monotonically increasing");
            last_dst = dst;
            src_ts += 1024;
        }
    }

    #[test]
    fn rescale_delta_resets_state_on_large_gap() {
        let tb = Rational::new(1, 48_000);
        let mut state: Option<i64> = Some(0);
        // A gap far larger than 2*step should force the simple-round fallback,
        // which re-seeds state rather than blending with a stale prediction.
        let _ = TimebaseMath::rescale_delta(tb, 10_000_000, tb, 960, &mut state, tb);
        assert_eq!(state, Some(10_000_000 + 960));
    }
}

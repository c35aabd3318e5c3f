use std::fmt;

/// Marker for an absent timestamp.
pub const NOPTS_VALUE: i64 = i64::MIN;

pub const MILLI_TIME_BASE: Rational = Rational::new(1, 1000);
pub const MICRO_TIME_BASE: Rational = Rational::new(1, 1_000_000);
pub const MPEGTS_TIME_BASE: Rational = Rational::new(1, 90_000);

/// A time base or frame rate as `num / den`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Default for Rational {
    fn default() -> Self {
        Self { num: 0, den: 1 }
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    pub fn to_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }

    pub fn invert(&self) -> Self {
        Self::new(self.den, self.num)
    }

    /// Reduces to lowest terms.
    pub fn reduce(&self) -> Self {
        let g = gcd(self.num.unsigned_abs() as u64, self.den.unsigned_abs() as u64);
        if g <= 1 {
            return *self;
        }
        Self::new(self.num / g as i32, self.den / g as i32)
    }

    /// Closest rational to `value` with numerator and denominator bounded by `max`.
    pub fn from_f64(value: f64, max: i32) -> Self {
        if !value.is_finite() || value == 0.0 {
            return Self::new(0, 1);
        }

        // Continued fraction expansion
        let (mut h0, mut h1) = (0i64, 1i64);
        let (mut k0, mut k1) = (1i64, 0i64);
        let mut x = value.abs();
        for _ in 0..32 {
            let a = x.floor() as i64;
            let h2 = a * h1 + h0;
            let k2 = a * k1 + k0;
            if h2 > max as i64 || k2 > max as i64 {
                break;
            }
            (h0, h1) = (h1, h2);
            (k0, k1) = (k1, k2);
            let frac = x - a as f64;
            if frac < 1e-9 {
                break;
            }
            x = 1.0 / frac;
        }

        if k1 == 0 {
            return Self::new(max, 1);
        }
        let sign = if value < 0.0 { -1 } else { 1 };
        Self::new(sign * h1 as i32, k1 as i32)
    }
}

pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Rescales `value` from time base `from` to `to`, rounding to nearest with
/// ties away from zero. [`NOPTS_VALUE`] passes through unchanged.
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    if value == NOPTS_VALUE {
        return value;
    }

    let b = from.num as i128 * to.den as i128;
    let c = from.den as i128 * to.num as i128;
    if c == 0 {
        return value;
    }

    let product = value as i128 * b;
    let half = c.abs() / 2;
    let rounded = if (product < 0) ^ (c < 0) {
        (product - half * c.signum()) / c
    } else {
        (product + half * c.signum()) / c
    };

    rounded.clamp(i64::MIN as i128 + 1, i64::MAX as i128) as i64
}

/// Like [`rescale`] but always rounds toward negative infinity.
pub fn rescale_floor(value: i64, from: Rational, to: Rational) -> i64 {
    if value == NOPTS_VALUE {
        return value;
    }

    let b = from.num as i128 * to.den as i128;
    let c = from.den as i128 * to.num as i128;
    if c == 0 {
        return value;
    }

    (value as i128 * b).div_euclid(c) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_rounding() {
        let ms = MILLI_TIME_BASE;
        let ts = MPEGTS_TIME_BASE;
        assert_eq!(rescale(1000, ms, ts), 90_000);
        assert_eq!(rescale(90_001, ts, ms), 1000);
        assert_eq!(rescale(45, ts, ms), 1); // 0.5 ms rounds away from zero
        assert_eq!(rescale(-45, ts, ms), -1);
        assert_eq!(rescale(NOPTS_VALUE, ms, ts), NOPTS_VALUE);
        assert_eq!(rescale_floor(89, ts, ms), 0);
        assert_eq!(rescale_floor(-1, ts, ms), -1);
    }

    #[test]
    fn approximate_frame_rate() {
        assert_eq!(Rational::from_f64(25.0, i32::MAX), Rational::new(25, 1));
        assert_eq!(
            Rational::from_f64(30000.0 / 1001.0, 100_000),
            Rational::new(30000, 1001)
        );
        assert_eq!(Rational::new(6, 4).reduce(), Rational::new(3, 2));
    }
}

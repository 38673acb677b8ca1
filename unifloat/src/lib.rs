//! Deterministic, integer-implemented floating point (§4.12).
//!
//! Ordinary hardware `f64` arithmetic is not trusted for any value that
//! feeds into matching decisions: different compilers/CPUs round
//! differently in edge cases, and the matcher must be bit-identical across
//! independent nodes. `UniFloat` stores a sign, a fixed-width integer
//! mantissa, and a signed exponent, and every arithmetic operation is
//! implemented with plain integer shifts/adds/multiplies so the result is
//! reproducible everywhere.

use std::cmp::Ordering as CmpOrdering;

/// Width of the computation mantissa.
pub const COMPUTATION_BITS: u32 = 52;
const MANT_MIN: u64 = 1 << (COMPUTATION_BITS - 1);
const MANT_MAX_EXCL: u64 = 1 << COMPUTATION_BITS;

/// Wire-form field widths.
pub const WIRE_EXPONENT_BITS: u32 = 11;
pub const WIRE_MANTISSA_BITS: u32 = 21;
const WIRE_BIAS: i32 = 1023;
const WIRE_EXP_MAX: i32 = (1 << WIRE_EXPONENT_BITS) - 1;
const WIRE_MANT_MASK: u32 = (1 << WIRE_MANTISSA_BITS) - 1;

/// Directional rounding used throughout: round the discarded low bits down,
/// up, or to nearest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Round {
    Down = -1,
    Nearest = 0,
    Up = 1,
}

/// A deterministic float: `sign * mant * 2^exp`, with `mant` normalized
/// into `[MANT_MIN, MANT_MAX_EXCL)` whenever `sign != 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniFloat {
    sign: i8,
    mant: u64,
    exp: i32,
}

impl UniFloat {
    pub const ZERO: UniFloat = UniFloat { sign: 0, mant: 0, exp: 0 };

    pub fn is_zero(&self) -> bool {
        self.sign == 0
    }

    pub fn sign(&self) -> i8 {
        self.sign
    }

    fn normalized(mut sign: i8, mut mant: u64, mut exp: i32) -> UniFloat {
        if mant == 0 {
            return UniFloat::ZERO;
        }
        while mant >= MANT_MAX_EXCL {
            mant >>= 1;
            exp += 1;
        }
        while mant < MANT_MIN {
            mant <<= 1;
            exp -= 1;
        }
        if sign == 0 {
            sign = 1;
        }
        UniFloat { sign, mant, exp }
    }

    /// One, exactly.
    pub fn one() -> UniFloat {
        UniFloat { sign: 1, mant: MANT_MIN, exp: -(COMPUTATION_BITS as i32 - 1) }
    }

    /// Decomposes an `f64` into its `UniFloat` representation.
    pub fn decompose(x: f64) -> UniFloat {
        if x == 0.0 || x.is_nan() {
            return UniFloat::ZERO;
        }
        let sign: i8 = if x.is_sign_negative() { -1 } else { 1 };
        let bits = x.abs().to_bits();
        let raw_exp = ((bits >> 52) & 0x7FF) as i32;
        let frac = bits & 0x000F_FFFF_FFFF_FFFF;
        let (mant53, exp53) = if raw_exp == 0 {
            (frac, -1022 - 52)
        } else {
            ((1u64 << 52) | frac, raw_exp - 1023 - 52)
        };
        // mant53 occupies up to 53 bits; shrink to COMPUTATION_BITS.
        let shift = 53i32 - COMPUTATION_BITS as i32;
        let (mant, carry) = shift_round_u64(mant53, shift, Round::Nearest);
        let exp = exp53 + shift + if carry { 1 } else { 0 };
        UniFloat::normalized(sign, if carry { mant >> 1 } else { mant }, exp)
    }

    /// Reconstructs an `f64` from a `UniFloat`.
    pub fn recompose(&self) -> f64 {
        if self.is_zero() {
            return 0.0;
        }
        (self.sign as f64) * (self.mant as f64) * exp2(self.exp)
    }

    /// `a + b`, rounding the renormalization step per `round`.
    pub fn add(a: UniFloat, b: UniFloat, round: Round) -> UniFloat {
        if a.is_zero() {
            return b;
        }
        if b.is_zero() {
            return a;
        }
        let (hi, lo) = if a.exp >= b.exp { (a, b) } else { (b, a) };
        let shift = hi.exp - lo.exp;
        let lo_mant = if shift >= 64 {
            0
        } else {
            shift_round_u64(lo.mant, shift, round).0
        };
        let hi_signed = hi.sign as i128 * hi.mant as i128;
        let lo_signed = lo.sign as i128 * lo_mant as i128;
        let sum = hi_signed + lo_signed;
        if sum == 0 {
            return UniFloat::ZERO;
        }
        let sign: i8 = if sum < 0 { -1 } else { 1 };
        let mag = sum.unsigned_abs() as u64;
        UniFloat::normalized(sign, mag, hi.exp)
    }

    /// `a * b`.
    pub fn multiply(a: UniFloat, b: UniFloat) -> UniFloat {
        if a.is_zero() || b.is_zero() {
            return UniFloat::ZERO;
        }
        let product = a.mant as u128 * b.mant as u128;
        // product occupies up to 2*COMPUTATION_BITS bits.
        let bits = 128 - product.leading_zeros();
        let shift = bits as i32 - COMPUTATION_BITS as i32;
        let mant = if shift <= 0 {
            (product << (-shift)) as u64
        } else {
            shift_round_u128(product, shift, Round::Nearest) as u64
        };
        let sign = a.sign * b.sign;
        UniFloat::normalized(sign, mant, a.exp + b.exp + shift.max(0))
    }

    /// `a / b`. Division by zero returns signed max magnitude rather than
    /// panicking, matching the source's `±DBL_MAX` convention.
    pub fn divide(a: UniFloat, b: UniFloat, round: Round) -> UniFloat {
        if b.is_zero() {
            let sign: i8 = if a.sign == 0 { 1 } else { a.sign };
            return UniFloat::max_magnitude(sign);
        }
        if a.is_zero() {
            return UniFloat::ZERO;
        }
        let shift = 127 - COMPUTATION_BITS as i32;
        let dividend = (a.mant as u128) << shift;
        let divisor = b.mant as u128;
        let quotient = match round {
            Round::Down => dividend / divisor,
            Round::Up => (dividend + divisor - 1) / divisor,
            Round::Nearest => (dividend + divisor / 2) / divisor,
        };
        let sign = a.sign * b.sign;
        UniFloat::normalized(sign, quotient as u64, a.exp - b.exp - shift)
    }

    /// `a ^ n` for `n >= 0`, via binary exponentiation.
    pub fn power(a: UniFloat, mut n: u32) -> UniFloat {
        if n == 0 {
            return UniFloat::one();
        }
        let mut base = a;
        let mut acc = UniFloat::one();
        while n > 0 {
            if n & 1 == 1 {
                acc = UniFloat::multiply(acc, base);
            }
            base = UniFloat::multiply(base, base);
            n >>= 1;
        }
        acc
    }

    /// `(a + b) / 2`, computed as add-then-halve-exponent rather than a
    /// general divide.
    pub fn average(a: UniFloat, b: UniFloat, round: Round) -> UniFloat {
        let sum = UniFloat::add(a, b, round);
        if sum.is_zero() {
            return sum;
        }
        UniFloat { exp: sum.exp - 1, ..sum }
    }

    /// Rounds through the wire precision and back, exposing the lossy
    /// wire-form rounding within the computation domain (used by the
    /// matcher's rounding-bias retry loop).
    pub fn round(a: UniFloat, round: Round) -> UniFloat {
        if a.is_zero() {
            return a;
        }
        match a.wire_encode(round) {
            Some(w) => UniFloat::wire_decode(w).apply_sign(a.sign > 0),
            None => a,
        }
    }

    /// Forces the sign, leaving magnitude untouched. Zero stays zero.
    pub fn apply_sign(&self, positive: bool) -> UniFloat {
        if self.is_zero() {
            return *self;
        }
        UniFloat { sign: if positive { 1 } else { -1 }, ..*self }
    }

    /// `a <= b + 2*ulp(b)`, tolerating rounding error in consistency checks.
    pub fn check_le(a: UniFloat, b: UniFloat) -> bool {
        let af = a.recompose();
        let bf = b.recompose();
        if b.is_zero() {
            return af <= 2.0 * f64::MIN_POSITIVE;
        }
        let ulp = exp2(b.exp);
        af <= bf + 2.0 * ulp
    }

    fn max_magnitude(sign: i8) -> UniFloat {
        UniFloat { sign, mant: MANT_MAX_EXCL - 1, exp: 1024 - COMPUTATION_BITS as i32 }
    }

    /// Encodes to the 32-bit wire form (11-bit exponent, 21-bit mantissa,
    /// non-negative values only — sign is carried out-of-band by the
    /// caller via [`apply_sign`]). Returns `None` when rounding up would
    /// overflow the representable range.
    pub fn wire_encode(&self, round: Round) -> Option<u32> {
        if self.is_zero() {
            return Some(0);
        }
        let shift = COMPUTATION_BITS as i32 - WIRE_MANTISSA_BITS as i32;
        let (mut mant21, carry) = shift_round_u64(self.mant, shift, round);
        let mut exp_val = self.exp + shift;
        if carry {
            mant21 >>= 1;
            exp_val += 1;
        }
        let mut exp_field = exp_val + WIRE_BIAS + (WIRE_MANTISSA_BITS as i32 - 1);

        if exp_field <= 0 {
            let denorm_shift = 1 - exp_field;
            if denorm_shift >= 64 {
                return Some(0);
            }
            let (denorm_mant, _) = shift_round_u64(mant21, denorm_shift, round);
            return Some(denorm_mant as u32 & WIRE_MANT_MASK);
        }
        if exp_field >= WIRE_EXP_MAX {
            return match round {
                Round::Up => None,
                _ => Some(((WIRE_EXP_MAX - 1) as u32) << WIRE_MANTISSA_BITS | WIRE_MANT_MASK),
            };
        }
        if exp_field >= WIRE_EXP_MAX {
            exp_field = WIRE_EXP_MAX - 1;
        }
        Some(((exp_field as u32) << WIRE_MANTISSA_BITS) | (mant21 as u32 & WIRE_MANT_MASK))
    }

    /// Decodes a non-negative wire value back into a `UniFloat`.
    pub fn wire_decode(w: u32) -> UniFloat {
        if w == 0 {
            return UniFloat::ZERO;
        }
        let exp_field = (w >> WIRE_MANTISSA_BITS) as i32;
        let mant_field = (w & WIRE_MANT_MASK) as u64;
        let exp_val = if exp_field == 0 {
            -WIRE_BIAS - (WIRE_MANTISSA_BITS as i32 - 1)
        } else {
            exp_field - WIRE_BIAS - (WIRE_MANTISSA_BITS as i32 - 1)
        };
        UniFloat::normalized(1, mant_field, exp_val)
    }
}

impl PartialOrd for UniFloat {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for UniFloat {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.recompose().partial_cmp(&other.recompose()).unwrap_or(CmpOrdering::Equal)
    }
}

fn exp2(e: i32) -> f64 {
    if (-1020..=1020).contains(&e) {
        2f64.powi(e)
    } else if e > 1020 {
        2f64.powi(1020) * exp2(e - 1020)
    } else {
        2f64.powi(-1020) * exp2(e + 1020)
    }
}

/// Shifts `value` right by `shift` bits (no-op if `shift <= 0`), rounding
/// per `round`. Returns `(rounded, carry)` where `carry` is true if
/// rounding pushed the result one bit past its expected width.
fn shift_round_u64(value: u64, shift: i32, round: Round) -> (u64, bool) {
    if shift <= 0 {
        return (value << (-shift).min(63), false);
    }
    if shift >= 64 {
        return (0, false);
    }
    let mask = (1u64 << shift) - 1;
    let truncated = value >> shift;
    let remainder = value & mask;
    let rounded = match round {
        Round::Down => truncated,
        Round::Up => {
            if remainder != 0 {
                truncated + 1
            } else {
                truncated
            }
        }
        Round::Nearest => {
            let half = 1u64 << (shift - 1);
            if remainder > half || (remainder == half && (truncated & 1) == 1) {
                truncated + 1
            } else {
                truncated
            }
        }
    };
    let width = 64 - shift;
    let carry = width < 64 && rounded >= (1u64 << width);
    (rounded, carry)
}

fn shift_round_u128(value: u128, shift: i32, round: Round) -> u128 {
    if shift <= 0 {
        return value << (-shift);
    }
    let mask = (1u128 << shift) - 1;
    let truncated = value >> shift;
    let remainder = value & mask;
    match round {
        Round::Down => truncated,
        Round::Up => {
            if remainder != 0 {
                truncated + 1
            } else {
                truncated
            }
        }
        Round::Nearest => {
            let half = 1u128 << (shift - 1);
            if remainder > half || (remainder == half && (truncated & 1) == 1) {
                truncated + 1
            } else {
                truncated
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uf(x: f64) -> UniFloat {
        UniFloat::decompose(x)
    }

    #[test]
    fn zero_round_trips() {
        assert_eq!(uf(0.0).recompose(), 0.0);
        assert_eq!(uf(0.0).wire_encode(Round::Nearest), Some(0));
        assert!(UniFloat::wire_decode(0).is_zero());
    }

    #[test]
    fn one_is_exact() {
        assert_eq!(UniFloat::one().recompose(), 1.0);
    }

    #[test]
    fn decompose_recompose_round_trip() {
        for x in [1.0, 2.0, 0.5, 123.456, 1e10, 1e-10, 3.0] {
            let back = uf(x).recompose();
            assert!((back - x).abs() / x.abs() < 1e-12, "x={x} back={back}");
        }
    }

    #[test]
    fn add_matches_float_add_within_tolerance() {
        let a = uf(1.5);
        let b = uf(2.25);
        let sum = UniFloat::add(a, b, Round::Nearest);
        assert!((sum.recompose() - 3.75).abs() < 1e-9);
    }

    #[test]
    fn multiply_matches_float_multiply() {
        let a = uf(3.0);
        let b = uf(7.0);
        let prod = UniFloat::multiply(a, b);
        assert!((prod.recompose() - 21.0).abs() < 1e-9);
    }

    #[test]
    fn divide_by_zero_saturates() {
        let a = uf(5.0);
        let d = UniFloat::divide(a, UniFloat::ZERO, Round::Nearest);
        assert!(d.recompose() > 1e300);
    }

    #[test]
    fn divide_matches_float_divide() {
        let a = uf(10.0);
        let b = uf(4.0);
        let q = UniFloat::divide(a, b, Round::Nearest);
        assert!((q.recompose() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn power_of_zero_is_one() {
        assert_eq!(UniFloat::power(uf(123.0), 0).recompose(), 1.0);
    }

    #[test]
    fn power_matches_float_pow() {
        let r = UniFloat::power(uf(2.0), 10);
        assert!((r.recompose() - 1024.0).abs() < 1e-6);
    }

    #[test]
    fn apply_sign_flips_magnitude_only() {
        let a = uf(4.0).apply_sign(false);
        assert!(a.recompose() < 0.0);
        assert!((a.recompose().abs() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn wire_encode_decode_round_trip_is_monotonic_up() {
        let x = uf(2.0);
        let w = x.wire_encode(Round::Up).unwrap();
        let decoded = UniFloat::wire_decode(w);
        assert!(decoded.recompose() >= x.recompose());
    }

    #[test]
    fn wire_encode_decode_round_trip_is_monotonic_down() {
        let x = uf(2.0);
        let w = x.wire_encode(Round::Down).unwrap();
        let decoded = UniFloat::wire_decode(w);
        assert!(decoded.recompose() <= x.recompose());
    }

    #[test]
    fn check_le_tolerates_rounding() {
        let a = uf(1.0);
        let b = uf(1.0);
        assert!(UniFloat::check_le(a, b));
    }

    #[test]
    fn extreme_exponents_round_trip() {
        for x in [2f64.powi(1000), 2f64.powi(-1000)] {
            let back = uf(x).recompose();
            assert!((back / x - 1.0).abs() < 1e-9);
        }
    }
}

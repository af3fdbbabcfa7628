/// numeric.rs — NaN-safe floating-point comparison and step rounding
///
/// Every price, size and balance comparison on the hot path goes through
/// these helpers; raw `==`/`<` on f64 is banned there. The comparison is a
/// relative-epsilon test scaled by the operand magnitudes:
///
///   |a − b| / min(|a| + |b|, f64::MAX) < ε
///
/// NaN on either side makes every ordering predicate return `false`.

/// Machine epsilon used for the relative comparison.
const EPSILON: f64 = f64::EPSILON;

#[inline]
fn relative_diff(a: f64, b: f64) -> f64 {
    let denom = (a.abs() + b.abs()).min(f64::MAX);
    // Both operands zero: the values are exactly equal, report no difference.
    if denom == 0.0 {
        return 0.0;
    }
    (a - b).abs() / denom
}

/// `a == b` under relative epsilon. NaN never equals anything.
#[inline]
pub fn is_equal(a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return false;
    }
    relative_diff(a, b) < EPSILON
}

/// `a != b` under relative epsilon. NaN is different from everything.
#[inline]
pub fn is_diff(a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return true;
    }
    !is_equal(a, b)
}

/// `a > b` under relative epsilon; false on NaN.
#[inline]
pub fn is_greater(a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return false;
    }
    if relative_diff(a, b) < EPSILON {
        return false;
    }
    a > b
}

/// `a >= b` under relative epsilon; false on NaN.
#[inline]
pub fn is_greater_or_equal(a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return false;
    }
    if relative_diff(a, b) < EPSILON {
        return true;
    }
    a > b
}

/// `a < b` under relative epsilon; false on NaN.
#[inline]
pub fn is_less(a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return false;
    }
    if relative_diff(a, b) < EPSILON {
        return false;
    }
    a < b
}

/// `a <= b` under relative epsilon; false on NaN.
#[inline]
pub fn is_less_or_equal(a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return false;
    }
    if relative_diff(a, b) < EPSILON {
        return true;
    }
    a < b
}

/// Round `value` to the nearest multiple of `step`.
/// A zero or non-finite step passes the value through unchanged.
#[inline]
pub fn round_to_step(value: f64, step: f64) -> f64 {
    if !(step.is_finite()) || step <= 0.0 {
        return value;
    }
    (value / step).round() * step
}

/// Number of decimal places of a step value (e.g. 0.001 -> 3).
/// Used to derive display precision from exchange steps.
pub fn count_decimal_places(value: f64) -> usize {
    if !value.is_finite() {
        return 0;
    }
    // Steps come from exchange metadata with at most 8 decimals.
    for places in 0..=8usize {
        let scaled = value * 10f64.powi(places as i32);
        if is_equal(scaled, scaled.round()) {
            return places;
        }
    }
    8
}

/// Fixed-precision string for log and report output.
pub fn to_fixed_string(value: f64, precision: usize) -> String {
    format!("{value:.precision$}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn equal_after_float_drift() {
        let a = 0.1 + 0.2;
        assert!(is_equal(a, 0.3));
        assert!(!is_greater(a, 0.3));
        assert!(is_greater_or_equal(a, 0.3));
        assert!(is_less_or_equal(a, 0.3));
    }

    #[test]
    fn nan_never_orders() {
        assert!(!is_equal(f64::NAN, 1.0));
        assert!(!is_greater(f64::NAN, 1.0));
        assert!(!is_less(1.0, f64::NAN));
        assert!(!is_greater_or_equal(f64::NAN, f64::NAN));
        assert!(is_diff(f64::NAN, f64::NAN));
    }

    #[test]
    fn zero_compares_equal_to_zero() {
        assert!(is_equal(0.0, 0.0));
        assert!(is_equal(0.0, -0.0));
        assert!(!is_greater(0.0, 0.0));
    }

    #[test]
    fn round_to_price_step() {
        assert_eq!(round_to_step(994.9749, 0.01), 994.97);
        assert_eq!(round_to_step(100.0, 0.0), 100.0);
        assert!(is_equal(round_to_step(0.1234, 0.001), 0.123));
    }

    #[test]
    fn decimal_places_of_common_steps() {
        assert_eq!(count_decimal_places(1.0), 0);
        assert_eq!(count_decimal_places(0.1), 1);
        assert_eq!(count_decimal_places(0.001), 3);
        assert_eq!(count_decimal_places(0.00000001), 8);
    }

    proptest! {
        #[test]
        fn ordering_is_antisymmetric(a in -1e9f64..1e9, b in -1e9f64..1e9) {
            prop_assert!(!(is_greater(a, b) && is_greater(b, a)));
            prop_assert!(is_greater_or_equal(a, b) || is_less(a, b));
        }

        #[test]
        fn equality_is_reflexive(a in -1e9f64..1e9) {
            prop_assert!(is_equal(a, a));
            prop_assert!(!is_diff(a, a));
        }
    }
}

//! Display precision for physical values
//!
//! Decoded values are stored unrounded. These helpers only shape what is
//! shown to a user, so `140 * 0.01` prints as `1.4` instead of
//! `1.4000000000000001`.

/// Determine appropriate decimal places from scale factor
///
/// - scale 1.0 → 0
/// - scale 0.5 → 1
/// - scale 0.25 → 2
/// - scale 0.001 → 3
pub fn precision_from_scale(scale: f64) -> u8 {
    let abs_scale = scale.abs();
    if abs_scale == 0.0 || !abs_scale.is_finite() {
        return 4;
    }
    if abs_scale >= 1.0 {
        return 0;
    }

    let mut temp = abs_scale;
    let mut precision = 0u8;
    while precision < 6 {
        if (temp - temp.round()).abs() < 1e-9 {
            break;
        }
        temp *= 10.0;
        precision += 1;
    }
    precision
}

/// Round a value to the given number of decimal places
pub fn round_to_precision(value: f64, precision: u8) -> f64 {
    if precision == 0 {
        value.round()
    } else {
        let factor = 10_f64.powi(i32::from(precision));
        (value * factor).round() / factor
    }
}

/// Round a value based on the scale factor that produced it
pub fn round_for_scale(value: f64, scale: f64) -> f64 {
    round_to_precision(value, precision_from_scale(scale))
}

/// Round to a bounded number of significant digits
pub fn round_significant(value: f64, digits: u8) -> f64 {
    if value == 0.0 || !value.is_finite() || digits == 0 {
        return value;
    }
    let magnitude = value.abs().log10().floor() as i32;
    let decimals = i32::from(digits) - 1 - magnitude;
    if decimals <= 0 {
        let factor = 10_f64.powi(-decimals);
        (value / factor).round() * factor
    } else {
        let factor = 10_f64.powi(decimals.min(15));
        (value * factor).round() / factor
    }
}

/// Human-readable rendering with at most `digits` significant digits
///
/// Integral results are printed without a fractional part.
pub fn format_physical(value: f64, digits: u8) -> String {
    let rounded = round_significant(value, digits);
    if rounded.fract() == 0.0 && rounded.abs() < 1e15 {
        format!("{}", rounded as i64)
    } else {
        format!("{}", rounded)
    }
}

/// Format a value as a clean JSON number
pub fn to_json_number(value: f64, scale: f64) -> serde_json::Value {
    let rounded = round_for_scale(value, scale);
    if rounded.fract() == 0.0 && rounded.abs() < 9.0e15 {
        return serde_json::json!(rounded as i64);
    }
    serde_json::json!(rounded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_from_scale() {
        assert_eq!(precision_from_scale(1.0), 0);
        assert_eq!(precision_from_scale(10.0), 0);
        assert_eq!(precision_from_scale(0.5), 1);
        assert_eq!(precision_from_scale(0.25), 2);
        assert_eq!(precision_from_scale(0.001), 3);
        assert_eq!(precision_from_scale(0.0), 4);
    }

    #[test]
    fn test_round_for_scale() {
        assert_eq!(round_for_scale(1.4000000000001, 0.01), 1.4);
        assert_eq!(round_for_scale(92.0000001, 1.0), 92.0);
        assert_eq!(round_for_scale(20.25, 0.5), 20.3);
    }

    #[test]
    fn test_round_significant() {
        assert_eq!(round_significant(123.456, 4), 123.5);
        assert_eq!(round_significant(0.000123456, 3), 0.000123);
        assert_eq!(round_significant(98765.0, 2), 99000.0);
        assert_eq!(round_significant(0.0, 3), 0.0);
    }

    #[test]
    fn test_format_physical() {
        assert_eq!(format_physical(20.0, 6), "20");
        assert_eq!(format_physical(140.0 * 0.01, 6), "1.4");
        assert_eq!(format_physical(-3.14159265, 3), "-3.14");
    }

    #[test]
    fn test_to_json_number() {
        assert_eq!(to_json_number(92.0, 1.0), serde_json::json!(92));
        assert_eq!(to_json_number(140.0 * 0.01, 0.01), serde_json::json!(1.4));
    }
}

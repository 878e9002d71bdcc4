//! printf-compatible number rendering for the text writers.

/// `%.18e`: 18 fractional digits, signed exponent of at least two digits.
pub fn sci18(value: f64) -> String {
    if !value.is_finite() {
        return special(value);
    }
    let formatted = format!("{value:.18e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => formatted,
    }
}

/// `%f`: six fractional digits.
pub fn fixed6(value: f64) -> String {
    if !value.is_finite() {
        return special(value);
    }
    format!("{value:.6}")
}

/// Shortest round-trip form that always shows a decimal point (`10.0`,
/// `-172.5`, `0.25`).
pub fn short(value: f64) -> String {
    if !value.is_finite() {
        return special(value);
    }
    format!("{value:?}")
}

fn special(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value > 0.0 {
        "inf".to_string()
    } else {
        "-inf".to_string()
    }
}

//! Field decoding and encoding for ASCII instrument replies.
//!
//! Numeric fields are plain decimal digits with a fixed maximum width;
//! anything else inside the field is a protocol violation, never coerced.

use crate::error::ParseError;

/// Removes the space padding some instruments put around a reply.
#[must_use]
pub fn strip_padding(line: &str) -> &str {
    line.trim_matches(' ')
}

/// Parses an unsigned decimal field of at most `max_digits` digits.
pub fn parse_digits(field: &str, max_digits: usize) -> Result<u64, ParseError> {
    if field.is_empty() || field.len() > max_digits || !field.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(ParseError::unexpected(field));
    }
    Ok(field
        .bytes()
        .fold(0u64, |acc, b| acc * 10 + u64::from(b - b'0')))
}

/// Parses `III` or `III.FF`, each part limited to its own digit count.
///
/// The value is computed as one integer divided by a power of ten, so
/// `"12.50"` yields exactly `12.5`.
pub fn parse_decimal(
    field: &str,
    max_int_digits: usize,
    max_frac_digits: usize,
) -> Result<f64, ParseError> {
    let (int_part, frac_part) = match field.split_once('.') {
        Some((int_part, frac_part)) => (int_part, Some(frac_part)),
        None => (field, None),
    };
    let int_value =
        parse_digits(int_part, max_int_digits).map_err(|_| ParseError::unexpected(field))?;
    let Some(frac_part) = frac_part else {
        return Ok(int_value as f64);
    };
    let frac_value =
        parse_digits(frac_part, max_frac_digits).map_err(|_| ParseError::unexpected(field))?;
    let scale = 10u64.pow(frac_part.len() as u32);
    Ok((int_value * scale + frac_value) as f64 / scale as f64)
}

/// Splits `"<number> <unit>"` and checks the unit exactly (case-sensitive).
pub fn split_unit<'a>(field: &'a str, unit: &str) -> Result<&'a str, ParseError> {
    match field.rsplit_once(' ') {
        Some((number, got)) if got == unit => Ok(number.trim_end_matches(' ')),
        Some((_, got)) => Err(ParseError::UnexpectedUnit {
            expected: unit.to_owned(),
            got: got.to_owned(),
        }),
        None => Err(ParseError::UnexpectedUnit {
            expected: unit.to_owned(),
            got: String::new(),
        }),
    }
}

/// Parses a decimal quantity followed by its unit, e.g. `"12.5 ml/min"`.
pub fn parse_quantity(
    field: &str,
    unit: &str,
    max_int_digits: usize,
    max_frac_digits: usize,
) -> Result<f64, ParseError> {
    let number = split_unit(field, unit)?;
    parse_decimal(number, max_int_digits, max_frac_digits)
}

/// Accepts a non-empty printable ASCII field.
pub fn parse_text(field: &str) -> Result<String, ParseError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        return Err(ParseError::unexpected(field));
    }
    Ok(field.to_owned())
}

/// Zero-pads `value` to exactly `width` digits.
///
/// Values with more digits than `width` are written in full; callers
/// range-check before encoding.
#[must_use]
pub fn format_fixed(value: u64, width: usize) -> String {
    format!("{value:0width$}")
}

/// Scales a decimal value to an integer count of `10^-digits` units.
#[must_use]
pub fn to_fixed_point(value: f64, fractional_digits: u32) -> u64 {
    (value * 10f64.powi(fractional_digits as i32)).round().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_digits() {
        assert_eq!(parse_digits("0007", 4), Ok(7));
        assert_eq!(parse_digits("65535", 5), Ok(65_535));
        assert!(parse_digits("", 4).is_err());
        assert!(parse_digits("12345", 4).is_err());
        assert!(parse_digits("12a4", 4).is_err());
        assert!(parse_digits("-1", 4).is_err());
        assert!(parse_digits(" 12", 4).is_err());
    }

    #[test]
    fn test_parse_decimal_exact() {
        assert_eq!(parse_decimal("12.50", 4, 2), Ok(12.5));
        assert_eq!(parse_decimal("0.05", 4, 2), Ok(0.05));
        assert_eq!(parse_decimal("240", 4, 1), Ok(240.0));
        assert_eq!(parse_decimal("1.52", 2, 2), Ok(1.52));
    }

    #[test]
    fn test_parse_decimal_rejects_malformed_fields() {
        assert!(parse_decimal("12.", 4, 2).is_err());
        assert!(parse_decimal(".5", 4, 2).is_err());
        assert!(parse_decimal("1.2.3", 4, 2).is_err());
        assert!(parse_decimal("12.505", 4, 2).is_err());
        assert!(parse_decimal("12345.0", 4, 2).is_err());
        assert!(parse_decimal("1,5", 4, 2).is_err());
    }

    #[test]
    fn test_parse_quantity_checks_unit() {
        assert_eq!(parse_quantity("12.5 ml/min", "ml/min", 4, 4), Ok(12.5));
        assert_eq!(
            parse_quantity("12.5 ML/MIN", "ml/min", 4, 4),
            Err(ParseError::UnexpectedUnit {
                expected: "ml/min".into(),
                got: "ML/MIN".into(),
            })
        );
        assert!(matches!(
            parse_quantity("12.5", "ml/min", 4, 4),
            Err(ParseError::UnexpectedUnit { .. })
        ));
    }

    #[test]
    fn test_padded_quantity_matches_unpadded() {
        let padded = parse_quantity(strip_padding("  12.34 ml/min"), "ml/min", 4, 4);
        let plain = parse_quantity("12.34 ml/min", "ml/min", 4, 4);
        assert_eq!(padded, plain);
        assert_eq!(plain, Ok(12.34));
    }

    #[test]
    fn test_format_fixed() {
        assert_eq!(format_fixed(7, 4), "0007");
        assert_eq!(format_fixed(0, 5), "00000");
        assert_eq!(format_fixed(12_345, 4), "12345");
    }

    #[test]
    fn test_fixed_width_values_survive_decoding() {
        for value in [0, 1, 9, 10, 99, 100, 999, 1000, 4321, 9999] {
            let field = format_fixed(value, 4);
            assert_eq!(field.len(), 4);
            assert_eq!(parse_digits(&field, 4), Ok(value));
        }
    }

    #[test]
    fn test_to_fixed_point() {
        assert_eq!(to_fixed_point(1.52, 2), 152);
        assert_eq!(to_fixed_point(240.0, 1), 2400);
        assert_eq!(to_fixed_point(0.1, 1), 1);
    }

    #[test]
    fn test_parse_text() {
        assert_eq!(parse_text("MCP 0202 01"), Ok("MCP 0202 01".into()));
        assert!(parse_text("").is_err());
        assert!(parse_text("bad\u{6}").is_err());
    }
}

//! Conversion between Kubernetes resource quantities and byte counts

/// Binary suffixes, largest first, as (suffix, power of two)
const BINARY_SUFFIXES: &[(&str, u32)] = &[
    ("Ei", 60),
    ("Pi", 50),
    ("Ti", 40),
    ("Gi", 30),
    ("Mi", 20),
    ("Ki", 10),
];

/// Parse a quantity string such as `10Gi`, `500M`, `1.5Ki` or `1e3` into bytes.
///
/// Fractional results round up, matching how the API server reports an
/// integer value for a quantity. Returns `None` for malformed, negative or
/// out-of-range input.
pub fn parse_bytes(raw: &str) -> Option<i64> {
    let s = raw.trim();
    let s = s.strip_prefix('+').unwrap_or(s);
    if s.is_empty() {
        return None;
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() || number == "." {
        return None;
    }

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if frac_part.contains('.') || frac_part.len() > 18 {
        return None;
    }

    let (numerator, denominator) = multiplier(suffix)?;

    let scale = 10i128.checked_pow(frac_part.len() as u32)?;
    let int_value: i128 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().ok()?
    };
    let frac_value: i128 = if frac_part.is_empty() {
        0
    } else {
        frac_part.parse().ok()?
    };

    let mantissa = int_value.checked_mul(scale)?.checked_add(frac_value)?;
    let top = mantissa.checked_mul(numerator)?;
    let bottom = scale.checked_mul(denominator)?;
    let bytes = top.checked_add(bottom - 1)? / bottom;

    i64::try_from(bytes).ok()
}

/// Render a byte count using the largest binary suffix that divides it exactly
pub fn format_bytes(bytes: i64) -> String {
    if bytes > 0 {
        for (suffix, shift) in BINARY_SUFFIXES {
            let unit = 1i64 << shift;
            if bytes % unit == 0 {
                return format!("{}{}", bytes / unit, suffix);
            }
        }
    }
    bytes.to_string()
}

/// Multiplier for a suffix as an exact fraction
fn multiplier(suffix: &str) -> Option<(i128, i128)> {
    let pow10 = |exp: u32| 10i128.checked_pow(exp);
    let value = match suffix {
        "" => (1, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        "m" => (1, 1000),
        "k" => (pow10(3)?, 1),
        "M" => (pow10(6)?, 1),
        "G" => (pow10(9)?, 1),
        "T" => (pow10(12)?, 1),
        "P" => (pow10(15)?, 1),
        "E" => (pow10(18)?, 1),
        exp if exp.starts_with(['e', 'E']) => {
            let exponent: i32 = exp[1..].parse().ok()?;
            if exponent >= 0 {
                (pow10(exponent as u32)?, 1)
            } else {
                (1, pow10(exponent.unsigned_abs())?)
            }
        }
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GI: i64 = 1 << 30;

    #[test]
    fn test_parse_binary_suffixes() {
        assert_eq!(parse_bytes("10Gi"), Some(10 * GI));
        assert_eq!(parse_bytes("512Mi"), Some(512 << 20));
        assert_eq!(parse_bytes("1Ki"), Some(1024));
        assert_eq!(parse_bytes("1.5Gi"), Some(GI + GI / 2));
    }

    #[test]
    fn test_parse_decimal_suffixes_and_plain() {
        assert_eq!(parse_bytes("500M"), Some(500_000_000));
        assert_eq!(parse_bytes("2k"), Some(2000));
        assert_eq!(parse_bytes("16106127360"), Some(15 * GI));
        assert_eq!(parse_bytes("1e3"), Some(1000));
    }

    #[test]
    fn test_parse_rounds_fractions_up() {
        assert_eq!(parse_bytes("1500m"), Some(2));
        assert_eq!(parse_bytes("0.1"), Some(1));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_bytes(""), None);
        assert_eq!(parse_bytes("Gi"), None);
        assert_eq!(parse_bytes("-1Gi"), None);
        assert_eq!(parse_bytes("10GB"), None);
        assert_eq!(parse_bytes("1.2.3"), None);
    }

    #[test]
    fn test_parse_rejects_values_beyond_range() {
        assert_eq!(parse_bytes("17014118346046923173168730371588410572.4"), None);
        assert_eq!(parse_bytes("9223372036854775808"), None);
        assert_eq!(parse_bytes("8Ei"), None);
        assert_eq!(parse_bytes("9223372036854775807"), Some(i64::MAX));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(15 * GI), "15Gi");
        assert_eq!(format_bytes(3 * 512), "1536");
        assert_eq!(format_bytes(4), "4");
        assert_eq!(format_bytes(0), "0");
    }
}

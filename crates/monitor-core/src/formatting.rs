//! Display helpers shared by the terminal tables and CSV export.

use chrono::NaiveDateTime;

/// Format a floating-point number with thousands separators and a fixed number
/// of decimal places.
///
/// # Examples
///
/// ```
/// use monitor_core::formatting::format_number;
///
/// assert_eq!(format_number(1234.5,  1), "1,234.5");
/// assert_eq!(format_number(1234567.0, 0), "1,234,567");
/// assert_eq!(format_number(0.0, 2), "0.00");
/// assert_eq!(format_number(-9876.5, 1), "-9,876.5");
/// ```
pub fn format_number(value: f64, decimals: u32) -> String {
    let negative = value < 0.0;
    let factor = 10_f64.powi(decimals as i32);
    let abs_value = value.abs();
    // Nudge by one ULP at the target precision so exact midpoints round up.
    let scaled = ((abs_value * factor) + f64::EPSILON * abs_value * factor).round();

    let integer_part = (scaled / factor).trunc() as u64;
    let mut out = group_thousands(&integer_part.to_string());

    if decimals > 0 {
        let frac = (scaled as u64) % (factor as u64);
        out.push('.');
        out.push_str(&format!("{:0width$}", frac, width = decimals as usize));
    }

    if negative && scaled != 0.0 {
        format!("-{}", out)
    } else {
        out
    }
}

/// Format a usage duration given in hours.
///
/// * `< 1` hour → `"45m"`
/// * whole hours → `"3h"`
/// * otherwise → `"3h 45m"`
///
/// # Examples
///
/// ```
/// use monitor_core::formatting::format_hours;
///
/// assert_eq!(format_hours(0.75), "45m");
/// assert_eq!(format_hours(3.0),  "3h");
/// assert_eq!(format_hours(3.75), "3h 45m");
/// assert_eq!(format_hours(0.0),  "0m");
/// ```
pub fn format_hours(hours: f64) -> String {
    let total_mins = (hours * 60.0).round() as i64;
    match (total_mins / 60, total_mins % 60) {
        (0, m) => format!("{}m", m),
        (h, 0) => format!("{}h", h),
        (h, m) => format!("{}h {}m", h, m),
    }
}

/// `(part / whole) * 100`, or `None` when `whole` is not positive.
///
/// # Examples
///
/// ```
/// use monitor_core::formatting::ratio_pct;
///
/// assert_eq!(ratio_pct(50.0, 200.0), Some(25.0));
/// assert_eq!(ratio_pct(3.0, 0.0), None);
/// ```
pub fn ratio_pct(part: f64, whole: f64) -> Option<f64> {
    if whole > 0.0 && whole.is_finite() {
        Some(part / whole * 100.0)
    } else {
        None
    }
}

/// Round to `decimal_places`.
pub fn round_to(value: f64, decimal_places: u32) -> f64 {
    let factor = 10_f64.powi(decimal_places as i32);
    (value * factor).round() / factor
}

/// Render an optional percentage; missing values print as `"-"`.
pub fn format_optional_pct(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{}%", format_number(v, 1)),
        None => "-".to_string(),
    }
}

/// Render an optional count; missing values print as `"-"`.
pub fn format_optional_count(value: Option<u32>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn format_optional_timestamp(ts: Option<NaiveDateTime>) -> String {
    ts.map(format_timestamp).unwrap_or_default()
}

/// Insert commas every three digits from the right of an integer string.
fn group_thousands(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    let lead = s.len() % 3;
    for (i, c) in s.chars().enumerate() {
        if i != 0 && i % 3 == lead {
            result.push(',');
        }
        result.push(c);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number_zero() {
        assert_eq!(format_number(0.0, 0), "0");
        assert_eq!(format_number(0.0, 2), "0.00");
    }

    #[test]
    fn test_format_number_grouping() {
        assert_eq!(format_number(999.0, 0), "999");
        assert_eq!(format_number(1_000.0, 0), "1,000");
        assert_eq!(format_number(12_345_678.0, 0), "12,345,678");
    }

    #[test]
    fn test_format_number_decimals() {
        assert_eq!(format_number(123.456, 2), "123.46");
        assert_eq!(format_number(26.666_666, 1), "26.7");
        assert_eq!(format_number(0.05, 2), "0.05");
    }

    #[test]
    fn test_format_number_negative_rounding_to_zero() {
        assert_eq!(format_number(-0.001, 1), "0.0");
    }

    #[test]
    fn test_format_hours_rounds_minutes() {
        assert_eq!(format_hours(0.25), "15m");
        assert_eq!(format_hours(1.0 + 1.0 / 60.0), "1h 1m");
    }

    #[test]
    fn test_ratio_pct_guards() {
        assert_eq!(ratio_pct(1.0, -1.0), None);
        assert_eq!(ratio_pct(1.0, f64::NAN), None);
        let v = ratio_pct(4.0 / 3.0, 5.0).unwrap();
        assert!((v - 26.666_666).abs() < 1e-3);
    }

    #[test]
    fn test_round_to() {
        assert!((round_to(1.333_33, 2) - 1.33).abs() < 1e-9);
    }

    #[test]
    fn test_optional_renderers() {
        assert_eq!(format_optional_pct(None), "-");
        assert_eq!(format_optional_pct(Some(80.0)), "80.0%");
        assert_eq!(format_optional_count(Some(5)), "5");
        assert_eq!(format_optional_count(None), "-");
        assert_eq!(format_optional_timestamp(None), "");
    }
}

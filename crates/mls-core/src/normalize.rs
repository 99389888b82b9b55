//! Coercion of raw feed scalars.
//!
//! Feeds send blanks, `"none"` and `"null"` for missing values. Absence is
//! detected before any numeric or date parsing, and no function here fails:
//! unparseable input is simply absent.

use chrono::{DateTime, NaiveDate, NaiveTime};

pub fn clean_value(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("none")
        || trimmed.eq_ignore_ascii_case("null")
    {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Accepts plain decimals plus a leading `$` and `,` thousands separators.
pub fn parse_number(raw: Option<&str>) -> Option<f64> {
    let cleaned = clean_value(raw)?;
    let digits = cleaned
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',')
        .collect::<String>();
    digits.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Decimal input truncates toward zero ("2.0" bedrooms is 2).
pub fn parse_integer(raw: Option<&str>) -> Option<i64> {
    let cleaned = clean_value(raw)?;
    if let Ok(value) = cleaned.parse::<i64>() {
        return Some(value);
    }
    let value = parse_number(Some(&cleaned))?.trunc();
    if value >= i64::MIN as f64 && value <= i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

pub fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    let cleaned = clean_value(raw)?;
    if let Ok(date) = NaiveDate::parse_from_str(&cleaned, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(&cleaned, "%m/%d/%Y") {
        return Some(date);
    }
    DateTime::parse_from_rfc3339(&cleaned)
        .ok()
        .map(|dt| dt.date_naive())
}

pub fn parse_time(raw: Option<&str>) -> Option<NaiveTime> {
    let cleaned = clean_value(raw)?;
    ["%H:%M:%S", "%H:%M", "%I:%M %p", "%I:%M%p", "%I:%M:%S %p"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(&cleaned, fmt).ok())
}

/// Tri-state pets flag derived from the feed's inverted `NoPets` element:
/// only an explicit "no" (no restriction on pets) sets it.
pub fn pets_allowed_from_no_pets(raw: Option<&str>) -> Option<bool> {
    clean_value(raw)
        .filter(|value| value.eq_ignore_ascii_case("no"))
        .map(|_| true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_and_placeholder_values_are_absent() {
        assert_eq!(clean_value(None), None);
        assert_eq!(clean_value(Some("   ")), None);
        assert_eq!(clean_value(Some("None")), None);
        assert_eq!(clean_value(Some(" NULL ")), None);
        assert_eq!(clean_value(Some("  Main St ")), Some("Main St".to_string()));
        assert_eq!(clean_value(Some("nonexistent")), Some("nonexistent".to_string()));
    }

    #[test]
    fn numbers_parse_after_cleaning() {
        assert_eq!(parse_number(Some(" 450000.50 ")), Some(450000.5));
        assert_eq!(parse_number(Some("$1,250,000")), Some(1_250_000.0));
        assert_eq!(parse_number(Some("null")), None);
        assert_eq!(parse_number(Some("call for price")), None);
        assert_eq!(parse_number(Some("NaN")), None);
    }

    #[test]
    fn integers_truncate_decimal_input() {
        assert_eq!(parse_integer(Some("3")), Some(3));
        assert_eq!(parse_integer(Some("2.75")), Some(2));
        assert_eq!(parse_integer(Some("1,998")), Some(1998));
        assert_eq!(parse_integer(Some("")), None);
        assert_eq!(parse_integer(Some("three")), None);
    }

    #[test]
    fn dates_and_times_accept_common_feed_formats() {
        let expected = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert_eq!(parse_date(Some("2026-10-18")), Some(expected));
        assert_eq!(parse_date(Some("10/18/2026")), Some(expected));
        assert_eq!(parse_date(Some("2026-10-18T09:00:00Z")), Some(expected));
        assert_eq!(parse_date(Some("soon")), None);

        let one_pm = NaiveTime::from_hms_opt(13, 0, 0).unwrap();
        assert_eq!(parse_time(Some("13:00:00")), Some(one_pm));
        assert_eq!(parse_time(Some("13:00")), Some(one_pm));
        assert_eq!(parse_time(Some("1:00 PM")), Some(one_pm));
        assert_eq!(parse_time(Some("after lunch")), None);
    }

    #[test]
    fn pets_flag_is_set_only_by_explicit_no() {
        assert_eq!(pets_allowed_from_no_pets(Some("No")), Some(true));
        assert_eq!(pets_allowed_from_no_pets(Some(" no ")), Some(true));
        assert_eq!(pets_allowed_from_no_pets(Some("Yes")), None);
        assert_eq!(pets_allowed_from_no_pets(Some("")), None);
        assert_eq!(pets_allowed_from_no_pets(None), None);
    }
}

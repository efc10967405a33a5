use chrono::NaiveDate;

const DATE_FORMAT: &str = "%m/%d/%Y";

/// Normalizes an FEC date (`MMDDYYYY`, `MDDYYYY` or `MM/DD/YYYY`) to `MM/DD/YYYY`.
///
/// Returns `None` for anything that is not 7 or 8 digits once separators are removed.
pub fn normalize_date_str(raw: &str) -> Option<String> {
    let digits: String = raw.trim().chars().filter(|c| *c != '/').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let padded = match digits.len() {
        8 => digits,
        7 => format!("0{}", digits),
        _ => return None,
    };

    Some(format!("{}/{}/{}", &padded[0..2], &padded[2..4], &padded[4..8]))
}

pub fn parse_fec_date(raw: &str) -> Option<NaiveDate> {
    let normalized = normalize_date_str(raw)?;
    NaiveDate::parse_from_str(&normalized, DATE_FORMAT).ok()
}

/// Parses a decimal amount, defaulting to zero.
pub fn parse_amount(raw: &str) -> f32 {
    raw.trim().parse::<f32>().unwrap_or(0.0)
}

pub fn parse_u64(raw: &str) -> u64 {
    raw.trim().parse::<u64>().unwrap_or(0)
}

pub fn parse_i32(raw: &str) -> i32 {
    raw.trim().parse::<i32>().unwrap_or(0)
}

/// `total / count`, or zero when nothing has been counted.
pub fn average(total: f32, count: u32) -> f32 {
    if count == 0 {
        0.0
    } else {
        total / count as f32
    }
}

pub fn approx_eq(a: f32, b: f32, tolerance: f32) -> bool {
    (a - b).abs() <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_date_variants() {
        assert_eq!(normalize_date_str("01152020").as_deref(), Some("01/15/2020"));
        assert_eq!(normalize_date_str("1152020").as_deref(), Some("01/15/2020"));
        assert_eq!(normalize_date_str("01/15/2020").as_deref(), Some("01/15/2020"));
        assert_eq!(normalize_date_str(""), None);
        assert_eq!(normalize_date_str("2020-01-15"), None);
    }

    #[test]
    fn test_parse_fec_date() {
        assert_eq!(
            parse_fec_date("03312019"),
            NaiveDate::from_ymd_opt(2019, 3, 31)
        );
        assert_eq!(parse_fec_date("13402019"), None);
    }

    #[test]
    fn test_numeric_fields_default_to_zero() {
        assert_eq!(parse_amount("250.50"), 250.5);
        assert_eq!(parse_amount("-25"), -25.0);
        assert_eq!(parse_amount("n/a"), 0.0);
        assert_eq!(parse_u64("4041320191234567890"), 4041320191234567890);
        assert_eq!(parse_u64(""), 0);
        assert_eq!(parse_i32("2020"), 2020);
        assert_eq!(parse_i32("x"), 0);
    }

    #[test]
    fn test_average_of_empty_count_is_zero() {
        assert_eq!(average(100.0, 0), 0.0);
        assert_eq!(average(100.0, 4), 25.0);
    }
}

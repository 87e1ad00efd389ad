//! Order date codec. Two wire encodings are accepted: dotted day-first
//! (`dd.mm.yy` / `dd.mm.yyyy`) and ISO (`yyyy-mm-dd`). Anything else is
//! treated as no date at all, so renderers fall back to empty output
//! instead of erroring.

use chrono::{Datelike, Days, NaiveDate, Weekday};

/// Parse a raw order date. Returns `None` for empty, malformed or
/// calendar-invalid input (`31.13.99` is a `None`, not a rollover).
pub fn parse_order_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.contains('.') {
        parse_dotted(raw)
    } else if raw.contains('-') {
        parse_iso(raw)
    } else {
        None
    }
}

/// `dd.mm.yy` or `dd.mm.yyyy`; two-digit years live in 2000..=2099.
fn parse_dotted(raw: &str) -> Option<NaiveDate> {
    let mut parts = raw.splitn(3, '.');
    let day: u32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let year_part = parts.next()?;
    let year: i32 = match year_part.len() {
        2 => 2000 + year_part.parse::<i32>().ok()?,
        4 => year_part.parse().ok()?,
        _ => return None,
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

fn parse_iso(raw: &str) -> Option<NaiveDate> {
    let mut parts = raw.splitn(3, '-');
    let year_part = parts.next()?;
    if year_part.len() != 4 {
        return None;
    }
    let year: i32 = year_part.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

pub fn format_display(date: NaiveDate) -> String {
    date.format("%d.%m.%y").to_string()
}

pub fn format_iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Normalize a raw value to the display form `dd.mm.yy`. Values the codec
/// cannot parse come back unchanged (minus surrounding whitespace) so
/// free-text remarks survive a round trip through an edit form.
pub fn to_display(raw: &str) -> String {
    let trimmed = raw.trim();
    match parse_order_date(trimmed) {
        Some(date) => format_display(date),
        None => trimmed.to_string(),
    }
}

/// Normalize a raw value to ISO `yyyy-mm-dd`, or empty when unparseable.
pub fn to_iso(raw: &str) -> String {
    match parse_order_date(raw) {
        Some(date) => format_iso(date),
        None => String::new(),
    }
}

/// ISO week number of a date, 1..=53.
pub fn week_number(date: NaiveDate) -> u32 {
    date.iso_week().week()
}

/// Monday of the given ISO week.
pub fn start_of_week(year: i32, week: u32) -> Option<NaiveDate> {
    NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
}

/// Sentinel used only when ordering rows with missing dates. Never rendered.
pub fn sort_epoch() -> NaiveDate {
    NaiveDate::default()
}

pub fn parse_or_epoch(raw: &str) -> NaiveDate {
    parse_order_date(raw).unwrap_or_else(sort_epoch)
}

pub fn add_days(date: NaiveDate, days: u64) -> Option<NaiveDate> {
    date.checked_add_days(Days::new(days))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_two_digit_year() {
        assert_eq!(
            parse_order_date("05.01.25"),
            NaiveDate::from_ymd_opt(2025, 1, 5)
        );
    }

    #[test]
    fn parses_dotted_four_digit_year() {
        assert_eq!(
            parse_order_date("17.11.2024"),
            NaiveDate::from_ymd_opt(2024, 11, 17)
        );
    }

    #[test]
    fn parses_iso() {
        assert_eq!(
            parse_order_date("2025-03-10"),
            NaiveDate::from_ymd_opt(2025, 3, 10)
        );
    }

    #[test]
    fn rejects_calendar_invalid_dates() {
        assert_eq!(parse_order_date("31.13.99"), None);
        assert_eq!(parse_order_date("29.02.25"), None);
        assert_eq!(parse_order_date("2025-02-30"), None);
    }

    #[test]
    fn accepts_leap_day() {
        assert_eq!(
            parse_order_date("29.02.24"),
            NaiveDate::from_ymd_opt(2024, 2, 29)
        );
    }

    #[test]
    fn rejects_other_shapes() {
        assert_eq!(parse_order_date(""), None);
        assert_eq!(parse_order_date("   "), None);
        assert_eq!(parse_order_date("pending"), None);
        assert_eq!(parse_order_date("2025/01/05"), None);
        assert_eq!(parse_order_date("05.01"), None);
        assert_eq!(parse_order_date("05.01.025"), None);
    }

    #[test]
    fn display_round_trip() {
        assert_eq!(to_display("2025-01-05"), "05.01.25");
        assert_eq!(to_display("05.01.25"), "05.01.25");
        assert_eq!(to_display("  05.01.2025 "), "05.01.25");
    }

    #[test]
    fn display_passes_through_unparseable_text() {
        assert_eq!(to_display(" on request "), "on request");
        assert_eq!(to_display(""), "");
    }

    #[test]
    fn iso_normalization() {
        assert_eq!(to_iso("05.01.25"), "2025-01-05");
        assert_eq!(to_iso("2025-01-05"), "2025-01-05");
        assert_eq!(to_iso("junk"), "");
    }

    #[test]
    fn week_helpers_are_mutual_inverses() {
        for week in 1..=52 {
            let monday = start_of_week(2025, week).unwrap();
            assert_eq!(monday.weekday(), Weekday::Mon);
            assert_eq!(week_number(monday), week);
        }
    }

    #[test]
    fn epoch_sentinel_is_unix_epoch() {
        assert_eq!(sort_epoch(), NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
        assert_eq!(parse_or_epoch("garbage"), sort_epoch());
    }
}

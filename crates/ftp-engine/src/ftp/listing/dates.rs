//! Date and time fragments shared by the listing dialects. Servers print
//! local time with no zone; values are taken as UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// `Mar`, `MAR`, `march` → 3.
pub fn month_from_abbrev(s: &str) -> Option<u32> {
    if s.len() < 3 || !s.is_char_boundary(3) {
        return None;
    }
    let head = s[..3].to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|m| *m == head)
        .map(|i| i as u32 + 1)
}

/// Two-digit years pivot at 70: 69 → 2069, 70 → 1970.
pub fn expand_year(year: i32) -> i32 {
    match year {
        0..=69 => 2000 + year,
        70..=99 => 1900 + year,
        _ => year,
    }
}

pub fn datetime(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<DateTime<Utc>> {
    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, min, sec)?;
    Some(Utc.from_utc_datetime(&naive))
}

/// `15:19`, `15:19:55`, `11:04:47.12`, `10:02AM`, `10:02 pm` → (h, m, s).
pub fn parse_clock(s: &str) -> Option<(u32, u32, u32)> {
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let upper = compact.to_ascii_uppercase();
    let (body, meridiem) = if let Some(b) = upper.strip_suffix("AM") {
        (b, Some(false))
    } else if let Some(b) = upper.strip_suffix("PM") {
        (b, Some(true))
    } else {
        (upper.as_str(), None)
    };

    let mut parts = body.split(':');
    let mut hour: u32 = parts.next()?.parse().ok()?;
    let min: u32 = parts.next()?.parse().ok()?;
    let sec: u32 = match parts.next() {
        Some(p) => p.split('.').next()?.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }

    match meridiem {
        Some(pm) => {
            if hour == 0 || hour > 12 {
                return None;
            }
            if pm && hour < 12 {
                hour += 12;
            } else if !pm && hour == 12 {
                hour = 0;
            }
        }
        None if hour > 23 => return None,
        None => {}
    }
    if min > 59 || sec > 59 {
        return None;
    }
    Some((hour, min, sec))
}

/// A month/day with a clock but no year (`ls` for recent files): the most
/// recent such date not more than a day in the future.
pub fn recent_date(month: u32, day: u32, hour: u32, min: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let this_year = datetime(now.year(), month, day, hour, min, 0);
    match this_year {
        Some(dt) if dt <= now + Duration::days(1) => Some(dt),
        _ => datetime(now.year() - 1, month, day, hour, min, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn months() {
        assert_eq!(month_from_abbrev("Sep"), Some(9));
        assert_eq!(month_from_abbrev("MAR"), Some(3));
        assert_eq!(month_from_abbrev("december"), Some(12));
        assert_eq!(month_from_abbrev("Foo"), None);
        assert_eq!(month_from_abbrev("Ja"), None);
    }

    #[test]
    fn clocks() {
        assert_eq!(parse_clock("15:19"), Some((15, 19, 0)));
        assert_eq!(parse_clock("14:03:44"), Some((14, 3, 44)));
        assert_eq!(parse_clock("11:04:47.12"), Some((11, 4, 47)));
        assert_eq!(parse_clock("10:02AM"), Some((10, 2, 0)));
        assert_eq!(parse_clock("12:15 AM"), Some((0, 15, 0)));
        assert_eq!(parse_clock("01:30PM"), Some((13, 30, 0)));
        assert_eq!(parse_clock("25:00"), None);
        assert_eq!(parse_clock("2011"), None);
    }

    #[test]
    fn year_pivot() {
        assert_eq!(expand_year(0), 2000);
        assert_eq!(expand_year(69), 2069);
        assert_eq!(expand_year(70), 1970);
        assert_eq!(expand_year(2012), 2012);
    }

    #[test]
    fn recent_dates_roll_back_a_year() {
        let now = datetime(2026, 2, 10, 12, 0, 0).unwrap();
        assert_eq!(recent_date(1, 5, 8, 30, now), datetime(2026, 1, 5, 8, 30, 0));
        assert_eq!(recent_date(12, 24, 8, 30, now), datetime(2025, 12, 24, 8, 30, 0));
    }
}

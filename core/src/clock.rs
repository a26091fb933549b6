//! Calendar conversions and network time parsing
//!
//! Implements Howard Hinnant's civil_from_days and days_from_civil algorithms.
//! Reference: http://howardhinnant.github.io/date_algorithms.html
//!
//! The hub's wall clock holds *local* time because every schedule boundary
//! (wake marks, night mode) is expressed in local hours. The modem reports
//! network time as local time plus a quarter-hour zone offset; [`parse_cclk`]
//! normalises that to UTC and [`localize`] applies the configured offset, so
//! the result is independent of what zone the cell tower advertises.

use hal_abstractions::CivilTime;

const SECONDS_PER_DAY: i64 = 86_400;

/// A wall clock reading earlier than this year means the backup domain lost
/// power and the clock restarted from its reset value.
pub const MIN_VALID_YEAR: u16 = 2024;

/// Check if year is a leap year (Gregorian calendar)
pub fn is_leap_year(year: u16) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Number of days in `month` (1-12) of `year`
pub fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

/// True when `time` is a real calendar instant at or after [`MIN_VALID_YEAR`]
pub fn is_plausible(time: &CivilTime) -> bool {
    time.is_valid()
        && time.year >= MIN_VALID_YEAR
        && time.day <= days_in_month(time.year, time.month)
}

/// Seconds since 1970-01-01 00:00:00 of the given civil time
pub fn to_unix(time: &CivilTime) -> i64 {
    let days = days_from_civil(time.year, time.month, time.day) as i64;
    days * SECONDS_PER_DAY + time.seconds_of_day() as i64
}

/// Civil time of the given seconds since 1970-01-01 00:00:00
///
/// Valid range: 1970-2105 (u16 year limit).
pub fn from_unix(secs: i64) -> CivilTime {
    let days = secs.div_euclid(SECONDS_PER_DAY);
    let secs_today = secs.rem_euclid(SECONDS_PER_DAY) as u32;
    let (year, month, day) = civil_from_days(days as i32);

    CivilTime::new(
        year,
        month,
        day,
        (secs_today / 3600) as u8,
        ((secs_today % 3600) / 60) as u8,
        (secs_today % 60) as u8,
    )
}

/// ISO weekday of the given date: 1 = Monday .. 7 = Sunday
pub fn weekday(time: &CivilTime) -> u8 {
    // 1970-01-01 was a Thursday (ISO 4)
    let days = days_from_civil(time.year, time.month, time.day) as i64;
    ((days + 3).rem_euclid(7) + 1) as u8
}

/// Shift a UTC instant into local time at `utc_offset_minutes`
pub fn localize(utc: &CivilTime, utc_offset_minutes: i16) -> CivilTime {
    from_unix(to_unix(utc) + utc_offset_minutes as i64 * 60)
}

/// Parse a `+CCLK: "yy/MM/dd,hh:mm:ss±zz"` response line into UTC
///
/// `zz` is the zone offset in quarter hours. Returns `None` for anything
/// that is not a complete, plausible timestamp.
pub fn parse_cclk(line: &str) -> Option<CivilTime> {
    let rest = line.trim().strip_prefix("+CCLK:")?.trim();
    let rest = rest.strip_prefix('"')?;
    let body = rest.split('"').next()?;
    let (date, clock) = body.split_once(',')?;

    let mut date_fields = date.split('/');
    let yy: u16 = date_fields.next()?.parse().ok()?;
    let month: u8 = date_fields.next()?.parse().ok()?;
    let day: u8 = date_fields.next()?.parse().ok()?;
    if date_fields.next().is_some() {
        return None;
    }

    let zone_at = clock.find(|c| c == '+' || c == '-')?;
    let (hms, zone) = clock.split_at(zone_at);
    let quarters: i16 = zone.parse().ok()?;

    let mut hms_fields = hms.split(':');
    let hour: u8 = hms_fields.next()?.parse().ok()?;
    let minute: u8 = hms_fields.next()?.parse().ok()?;
    let second: u8 = hms_fields.next()?.parse().ok()?;
    if hms_fields.next().is_some() {
        return None;
    }

    // Two-digit years: the modem's pre-registration default is 1980
    let year = if yy >= 80 { 1900 + yy } else { 2000 + yy };
    let local = CivilTime::new(year, month, day, hour, minute, second);
    if !is_plausible(&local) {
        return None;
    }
    let utc = from_unix(to_unix(&local) - quarters as i64 * 15 * 60);
    Some(utc)
}

/// Convert days since Unix epoch to civil date (year, month, day)
fn civil_from_days(days_since_epoch: i32) -> (u16, u8, u8) {
    // Shift epoch from 1970-01-01 to 0000-03-01 so the leap day ends the year
    let z = days_since_epoch + 719468;

    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u32; // day of era [0, 146096]
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365; // [0, 399]
    let y = (yoe as i32) + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100); // [0, 365]
    let mp = (5 * doy + 2) / 153; // March = 0
    let d = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u8;
    let year = if m <= 2 { y + 1 } else { y };

    (year as u16, m, d)
}

/// Convert civil date (year, month, day) to days since Unix epoch
fn days_from_civil(year: u16, month: u8, day: u8) -> i32 {
    let y = year as i32;
    let m = month as i32;
    let d = day as i32;

    let (y, m) = if m <= 2 { (y - 1, m + 9) } else { (y, m - 3) };

    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as u32;
    let doy = (153 * (m as u32) + 2) / 5 + (d as u32) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;

    era * 146097 + (doe as i32) - 719468
}

//! Excel date-serial conversion.
//!
//! The 1900 date system counts days so that serial 1 is 1900-01-01, and
//! it believes 1900 was a leap year: serial 60 names a 1900-02-29 that
//! never existed. Every real date from 1900-03-01 on therefore sits one
//! serial higher than its true day count. Time of day is the fractional
//! part (no timezone). The formatter uses these helpers to render serial
//! numbers under date number-formats.

use std::cmp::Ordering;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

const SECS_PER_DAY: i64 = 86_400;

/// Day zero of the system: serial 1 lands one day later, on 1900-01-01.
fn day_zero() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 31).unwrap()
}

/// First date affected by the phantom leap day.
fn leap_bug_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(1900, 3, 1).unwrap()
}

/// Convert a date-time to an Excel serial number.
pub fn datetime_to_serial(dt: &NaiveDateTime) -> f64 {
    let shift = i64::from(dt.date() >= leap_bug_start());
    let whole = (dt.date() - day_zero()).num_days() + shift;
    let frac = dt.time().num_seconds_from_midnight() as f64 / SECS_PER_DAY as f64;
    whole as f64 + frac
}

/// Convert an Excel serial number back to a date-time.
pub fn serial_to_datetime(serial: f64) -> NaiveDateTime {
    let whole = serial.trunc() as i64;
    let secs = (serial.fract() * SECS_PER_DAY as f64).round() as i64;
    let time =
        NaiveTime::from_num_seconds_from_midnight_opt(secs.rem_euclid(SECS_PER_DAY) as u32, 0)
            .unwrap();

    let date = match whole.cmp(&60) {
        // Before the phantom day the count is honest.
        Ordering::Less => day_zero() + Duration::days(whole),
        // The phantom 1900-02-29 collapses onto the real 1900-02-28.
        Ordering::Equal => NaiveDate::from_ymd_opt(1900, 2, 28).unwrap(),
        // Past it, undo the one-serial inflation.
        Ordering::Greater => day_zero() + Duration::days(whole - 1),
    };
    NaiveDateTime::new(date, time)
}

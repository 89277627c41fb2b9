use hifitime::{Duration, Epoch};

use crate::relodd_errors::{ReloddError, ReloddResult};

/// Half-open time span `[start, end)` with microsecond resolution.
///
/// All catalog times and waveform windows are expressed as UTC
/// [`hifitime::Epoch`] values; a window is only a pair of them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeWindow {
    start: Epoch,
    end: Epoch,
}

impl TimeWindow {
    pub fn new(start: Epoch, end: Epoch) -> Self {
        TimeWindow { start, end }
    }

    /// Window starting at `start` and lasting `length_secs` seconds.
    pub fn from_start_length(start: Epoch, length_secs: f64) -> Self {
        TimeWindow {
            start,
            end: start + Duration::from_seconds(length_secs),
        }
    }

    pub fn start(&self) -> Epoch {
        self.start
    }

    pub fn end(&self) -> Epoch {
        self.end
    }

    pub fn length(&self) -> Duration {
        self.end - self.start
    }

    pub fn length_secs(&self) -> f64 {
        (self.end - self.start).to_seconds()
    }

    pub fn contains(&self, t: Epoch) -> bool {
        t >= self.start && t < self.end
    }
}

/// Render an epoch as `YYYY-MM-DDTHH:MM:SS.ffffffZ`.
///
/// Built from the Gregorian parts rather than the `Display` impl: the
/// string participates in waveform fingerprints and cache file names, so
/// its exact shape must never depend on the time library's formatting.
pub fn to_iso_string(epoch: Epoch) -> String {
    let (year, month, day, hour, minute, second, nanos) = epoch.to_gregorian_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}Z",
        year,
        month,
        day,
        hour,
        minute,
        second,
        nanos / 1_000
    )
}

/// Parse `YYYY-MM-DDTHH:MM:SS[.ffffff]Z` (the exact shape written by
/// [`to_iso_string`], fractional part optional) into an epoch.
pub fn parse_iso(s: &str) -> ReloddResult<Epoch> {
    let invalid = || ReloddError::InvalidTime(s.to_string());

    let s = s.trim().strip_suffix('Z').unwrap_or(s.trim());
    let (date, time) = s.split_once('T').ok_or_else(invalid)?;

    let mut date_parts = date.split('-');
    let year: i32 = next_field(&mut date_parts, s)?;
    let month: u8 = next_field(&mut date_parts, s)?;
    let day: u8 = next_field(&mut date_parts, s)?;

    let mut time_parts = time.split(':');
    let hour: u8 = next_field(&mut time_parts, s)?;
    let minute: u8 = next_field(&mut time_parts, s)?;
    let sec_str: &str = time_parts.next().ok_or_else(invalid)?;

    let (second, nanos) = match sec_str.split_once('.') {
        Some((sec, frac)) => {
            let second: u8 = sec.parse().map_err(|_| invalid())?;
            // pad/cut the fractional part to 9 digits
            let mut frac = frac.to_string();
            while frac.len() < 9 {
                frac.push('0');
            }
            let nanos: u32 = frac[..9].parse().map_err(|_| invalid())?;
            (second, nanos)
        }
        None => (sec_str.parse().map_err(|_| invalid())?, 0u32),
    };

    Ok(Epoch::from_gregorian_utc(
        year, month, day, hour, minute, second, nanos,
    ))
}

fn next_field<'a, T: std::str::FromStr>(
    parts: &mut impl Iterator<Item = &'a str>,
    full: &str,
) -> ReloddResult<T> {
    parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| ReloddError::InvalidTime(full.to_string()))
}

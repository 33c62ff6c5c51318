use chrono::{NaiveTime, Timelike};

/// Minutes since midnight.
pub type Minutes = u32;

pub const MINUTES_PER_DAY: Minutes = 24 * 60;

/// A time-of-day string that is neither `HH:MM` nor `HH:MM AM/PM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatError {
    pub input: String,
}

impl std::fmt::Display for FormatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed time of day: {:?} (expected HH:MM or HH:MM AM/PM)", self.input)
    }
}

impl std::error::Error for FormatError {}

/// Parse a 24-hour `"HH:MM"` or 12-hour `"HH:MM AM"` / `"HH:MM PM"` string.
pub fn parse_time_of_day(text: &str) -> Result<Minutes, FormatError> {
    let trimmed = text.trim();
    let err = || FormatError { input: text.to_string() };

    let upper = trimmed.to_ascii_uppercase();
    let twelve_hour = upper.ends_with("AM") || upper.ends_with("PM");

    let time = if twelve_hour {
        // Tolerate "10:30PM" as well as "10:30 PM".
        let (clock, meridiem) = upper.split_at(upper.len() - 2);
        let normalized = format!("{} {meridiem}", clock.trim_end());
        NaiveTime::parse_from_str(&normalized, "%I:%M %p").map_err(|_| err())?
    } else {
        if !is_strict_hh_mm(trimmed) {
            return Err(err());
        }
        NaiveTime::parse_from_str(trimmed, "%H:%M").map_err(|_| err())?
    };

    Ok(time.hour() * 60 + time.minute())
}

/// chrono accepts single-digit fields; the 24-hour form additionally
/// requires exactly two minute digits so "9:5" is rejected.
fn is_strict_hh_mm(s: &str) -> bool {
    match s.split_once(':') {
        Some((h, m)) => {
            (1..=2).contains(&h.len())
                && m.len() == 2
                && h.bytes().all(|b| b.is_ascii_digit())
                && m.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Render minutes since midnight as `HH:MM`. `1440` renders as `24:00`.
pub fn format_time_of_day(minutes: Minutes) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Half-open overlap test: `[s1, e1)` and `[s2, e2)` share at least one minute.
///
/// Touching endpoints do not overlap. Empty (or inverted) intervals never
/// overlap anything, themselves included.
pub fn overlaps(s1: Minutes, e1: Minutes, s2: Minutes, e2: Minutes) -> bool {
    if s1 >= e1 || s2 >= e2 {
        return false;
    }
    s1 < e2 && e1 > s2
}

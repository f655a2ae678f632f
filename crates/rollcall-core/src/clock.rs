//! Calendar-day resolution for attendance dates.

use chrono::{DateTime, FixedOffset, Local, NaiveDate, Offset, Utc};
use std::str::FromStr;

/// Timezone that decides where one attendance day ends and the next begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DayClock {
    /// The host's local timezone.
    #[default]
    Local,
    /// A fixed UTC offset, e.g. `+05:30`.
    Fixed(FixedOffset),
}

impl DayClock {
    /// Calendar date of `ts` in this clock's timezone.
    pub fn date_of(&self, ts: DateTime<Utc>) -> NaiveDate {
        match self {
            Self::Local => ts.with_timezone(&Local).date_naive(),
            Self::Fixed(offset) => ts.with_timezone(offset).date_naive(),
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.date_of(Utc::now())
    }
}

impl FromStr for DayClock {
    type Err = String;

    /// Accepts `local`, `utc`, `Z`, or a signed `HH:MM` / `HHMM` offset.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "local" | "" => return Ok(Self::Local),
            "utc" | "z" => return Ok(Self::Fixed(Utc.fix())),
            _ => {}
        }

        let (sign, rest) = match s.as_bytes().first() {
            Some(b'+') => (1, &s[1..]),
            Some(b'-') => (-1, &s[1..]),
            _ => return Err(format!("invalid timezone offset: {s}")),
        };
        let digits: String = rest.chars().filter(|c| *c != ':').collect();
        if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid timezone offset: {s}"));
        }
        let hours: i32 = digits[..2].parse().map_err(|_| format!("invalid hours in {s}"))?;
        let minutes: i32 = digits[2..].parse().map_err(|_| format!("invalid minutes in {s}"))?;
        if minutes >= 60 {
            return Err(format!("invalid minutes in {s}"));
        }

        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(Self::Fixed)
            .ok_or_else(|| format!("timezone offset out of range: {s}"))
    }
}

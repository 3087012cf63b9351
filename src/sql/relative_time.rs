//! `$relativeTime` expressions such as `"in 2 days"`, `"3 hours ago"`, `"now"`.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

use crate::error::{AdapterError, AdapterResult};

/// Resolve a relative time expression against `now`
pub fn resolve(text: &str, now: DateTime<Utc>) -> AdapterResult<NaiveDateTime> {
    let text = text.to_lowercase();
    let mut parts: Vec<&str> = text.split_whitespace().collect();

    if parts == ["now"] {
        return Ok(now.naive_utc());
    }

    let future = parts.first() == Some(&"in");
    let past = parts.last() == Some(&"ago");
    match (future, past) {
        (false, false) => {
            return Err(invalid("Time should either start with 'in' or end with 'ago'"));
        }
        (true, true) => return Err(invalid("Time cannot have both 'in' and 'ago'")),
        (true, false) => {
            parts.remove(0);
        }
        (false, true) => {
            parts.pop();
        }
    }

    if parts.len() % 2 != 0 {
        return Err(invalid("Invalid time string. Dangling unit or number."));
    }

    let mut seconds: i64 = 0;
    for pair in parts.chunks(2) {
        let amount: i64 = pair[0]
            .parse()
            .map_err(|_| invalid(&format!("'{}' is not an integer.", pair[0])))?;
        let unit = unit_seconds(pair[1]).ok_or_else(|| invalid(&format!("Invalid interval: '{}'", pair[1])))?;
        seconds = amount
            .checked_mul(unit)
            .and_then(|s| seconds.checked_add(s))
            .ok_or_else(|| invalid("Relative time is out of range"))?;
    }

    let offset = Duration::try_seconds(seconds).ok_or_else(|| invalid("Relative time is out of range"))?;
    let resolved = if future {
        now.checked_add_signed(offset)
    } else {
        now.checked_sub_signed(offset)
    };
    resolved
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| invalid("Relative time is out of range"))
}

fn unit_seconds(unit: &str) -> Option<i64> {
    Some(match unit {
        "yr" | "yrs" | "year" | "years" => 31_536_000,
        "wk" | "wks" | "week" | "weeks" => 604_800,
        "d" | "day" | "days" => 86_400,
        "hr" | "hrs" | "hour" | "hours" => 3_600,
        "min" | "mins" | "minute" | "minutes" => 60,
        "sec" | "secs" | "second" | "seconds" => 1,
        _ => return None,
    })
}

fn invalid(info: &str) -> AdapterError {
    AdapterError::InvalidQuery(format!("bad $relativeTime value: {}", info))
}

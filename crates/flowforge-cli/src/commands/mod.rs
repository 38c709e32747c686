pub mod bag;
pub mod generate;
pub mod selfcheck;

use flowforge_core::timeutil::ms_from_civil_hour;

/// Parse a time argument: either epoch milliseconds or `YYYY/MM/DD[:HH]`.
pub fn parse_time(s: &str) -> Result<i64, String> {
    if s.chars().all(|c| c.is_ascii_digit() || c == '-') && !s.contains('/') {
        return s
            .parse::<i64>()
            .map_err(|_| format!("bad epoch-millisecond time '{s}'"));
    }
    let (date, hour) = match s.split_once(':') {
        Some((date, hour)) => {
            let hour: u32 = hour
                .parse()
                .map_err(|_| format!("bad hour in time '{s}'"))?;
            if hour > 23 {
                return Err(format!("hour out of range in time '{s}'"));
            }
            (date, hour)
        }
        None => (s, 0),
    };
    let mut parts = date.split('/');
    let year: i64 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| format!("bad year in time '{s}'"))?;
    let month: u32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .filter(|m| (1..=12).contains(m))
        .ok_or_else(|| format!("bad month in time '{s}'"))?;
    let day: u32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .filter(|d| (1..=31).contains(d))
        .ok_or_else(|| format!("bad day in time '{s}'"))?;
    if parts.next().is_some() {
        return Err(format!("trailing fields in time '{s}'"));
    }
    Ok(ms_from_civil_hour(year, month, day, hour))
}

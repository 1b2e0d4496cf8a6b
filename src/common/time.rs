use crate::common::types::Timestamp;
use crate::error::{EngineError, EngineResult};
use chrono::DateTime;
use nom::{
    character::complete::{alpha1, digit1},
    combinator::{all_consuming, map_res},
    multi::many1,
    sequence::pair,
    IResult,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn current_time_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

pub fn system_time_to_millis(time: SystemTime) -> Timestamp {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as Timestamp,
        Err(e) => -(e.duration().as_millis() as Timestamp),
    }
}

#[inline]
pub fn duration_millis(d: Duration) -> i64 {
    d.as_millis() as i64
}

pub fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a.abs()
}

fn unit_millis(unit: &str) -> Option<i64> {
    let ms = match unit {
        "ms" => 1,
        "s" => 1000,
        "m" => 60 * 1000,
        "h" => 60 * 60 * 1000,
        "d" => 24 * 60 * 60 * 1000,
        "w" => 7 * 24 * 60 * 60 * 1000,
        "y" => 365 * 24 * 60 * 60 * 1000,
        _ => return None,
    };
    Some(ms)
}

fn duration_component(input: &str) -> IResult<&str, i64> {
    map_res(pair(digit1, alpha1), |(num, unit): (&str, &str)| {
        let n = num.parse::<i64>().map_err(|_| "invalid number")?;
        let ms = unit_millis(unit).ok_or("unknown unit")?;
        n.checked_mul(ms).ok_or("duration overflow")
    })(input)
}

/// Parses a Prometheus duration such as `1h30m` or `500ms` into milliseconds.
pub fn parse_prometheus_duration(s: &str) -> EngineResult<i64> {
    let parsed: IResult<&str, Vec<i64>> = all_consuming(many1(duration_component))(s);
    match parsed {
        Ok((_, parts)) => Ok(parts.into_iter().sum()),
        Err(_) => Err(EngineError::parse(format!("cannot parse {s:?} to a valid duration"))),
    }
}

/// A duration parameter: either float seconds or a Prometheus duration string.
pub fn parse_duration_param(s: &str, name: &str) -> EngineResult<i64> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        if !secs.is_finite() || secs * 1000.0 > i64::MAX as f64 {
            return Err(EngineError::parse(format!(
                "invalid parameter {name:?}: cannot parse {s:?} to a valid duration"
            )));
        }
        return Ok((secs * 1000.0).round() as i64);
    }
    parse_prometheus_duration(s)
        .map_err(|_| EngineError::parse(format!("invalid parameter {name:?}: cannot parse {s:?} to a valid duration")))
}

/// A time parameter: unix seconds (possibly fractional) or RFC3339.
pub fn parse_time_param(s: &str, name: &str) -> EngineResult<Timestamp> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        if secs.is_finite() {
            return Ok((secs * 1000.0).round() as Timestamp);
        }
    }
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.timestamp_millis())
        .map_err(|_| EngineError::parse(format!("invalid parameter {name:?}: cannot parse {s:?} to a valid timestamp")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("15s", 15_000)]
    #[test_case("1m30s", 90_000)]
    #[test_case("500ms", 500)]
    #[test_case("2h", 7_200_000)]
    #[test_case("1d", 86_400_000)]
    fn test_parse_prometheus_duration(s: &str, expected: i64) {
        assert_eq!(parse_prometheus_duration(s).unwrap(), expected);
    }

    #[test_case("")]
    #[test_case("15")]
    #[test_case("5x")]
    #[test_case("m5")]
    fn test_parse_prometheus_duration_invalid(s: &str) {
        assert!(parse_prometheus_duration(s).is_err());
    }

    #[test]
    fn test_parse_duration_param_seconds() {
        assert_eq!(parse_duration_param("1.5", "step").unwrap(), 1500);
        assert_eq!(parse_duration_param("30s", "step").unwrap(), 30_000);
    }

    #[test]
    fn test_parse_time_param() {
        assert_eq!(parse_time_param("1700000000", "time").unwrap(), 1_700_000_000_000);
        assert_eq!(parse_time_param("1700000000.25", "time").unwrap(), 1_700_000_000_250);
        assert_eq!(
            parse_time_param("2023-11-14T22:13:20Z", "time").unwrap(),
            1_700_000_000_000
        );
        assert!(parse_time_param("yesterday", "time").is_err());
    }

    #[test]
    fn test_gcd() {
        assert_eq!(gcd(15_000, 10_000), 5_000);
        assert_eq!(gcd(60_000, 15_000), 15_000);
        assert_eq!(gcd(7, 0), 7);
    }
}

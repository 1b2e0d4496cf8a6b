use crate::common::types::Timestamp;
use crate::common::{current_time_millis, duration_millis, parse_duration_param, parse_time_param};
use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use serde::Deserialize;
use std::time::Duration;

/// Upper bound on the number of steps of a range query.
pub const MAX_POINTS_PER_SERIES: i64 = 11_000;

/// A parameter given either as text or, in JSON bodies, as a number.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Text(String),
    Number(f64),
}

impl ParamValue {
    fn as_text(&self) -> String {
        match self {
            ParamValue::Text(s) => s.clone(),
            ParamValue::Number(n) => n.to_string(),
        }
    }
}

/// Raw parameters of `/api/v1/query` and `/api/v1/query_range`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueryParams {
    #[serde(default)]
    pub query: String,
    pub time: Option<ParamValue>,
    pub start: Option<ParamValue>,
    pub end: Option<ParamValue>,
    pub step: Option<ParamValue>,
    pub timeout: Option<ParamValue>,
}

impl QueryParams {
    /// Decodes an `application/x-www-form-urlencoded` body or query string.
    pub fn from_form(body: &str) -> Self {
        let mut params = QueryParams::default();
        for (name, value) in url::form_urlencoded::parse(body.as_bytes()) {
            let value = ParamValue::Text(value.into_owned());
            match name.as_ref() {
                "query" => {
                    if let ParamValue::Text(q) = value {
                        params.query = q;
                    }
                }
                "time" => params.time = Some(value),
                "start" => params.start = Some(value),
                "end" => params.end = Some(value),
                "step" => params.step = Some(value),
                "timeout" => params.timeout = Some(value),
                _ => {}
            }
        }
        params
    }

    pub fn from_json(body: &str) -> EngineResult<Self> {
        serde_json::from_str(body)
            .map_err(|err| EngineError::parse(format!("invalid request body: {err}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Instant {
        time: Timestamp,
    },
    Range {
        start: Timestamp,
        end: Timestamp,
        step: i64,
    },
}

/// A validated query request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub query: String,
    pub kind: QueryKind,
    pub timeout: Option<Duration>,
}

impl QueryRequest {
    pub fn instant(query: &str, time: Timestamp) -> Self {
        QueryRequest {
            query: query.to_string(),
            kind: QueryKind::Instant { time },
            timeout: None,
        }
    }

    pub fn range(query: &str, start: Timestamp, end: Timestamp, step: i64) -> Self {
        QueryRequest {
            query: query.to_string(),
            kind: QueryKind::Range { start, end, step },
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_instant(&self) -> bool {
        matches!(self.kind, QueryKind::Instant { .. })
    }

    /// A range request when `start` or `end` is present, an instant request otherwise.
    /// A missing `time` means now; a missing `step` the configured default.
    pub fn from_params(params: QueryParams, settings: &EngineSettings) -> EngineResult<Self> {
        let query = params.query.trim();
        if query.is_empty() {
            return Err(EngineError::parse("invalid parameter \"query\": query must not be empty"));
        }
        let timeout = params
            .timeout
            .map(|t| parse_duration_param(&t.as_text(), "timeout"))
            .transpose()?
            .map(|ms| {
                if ms <= 0 {
                    return Err(EngineError::parse("invalid parameter \"timeout\": timeout must be positive"));
                }
                Ok(Duration::from_millis(ms as u64))
            })
            .transpose()?;

        let kind = if params.start.is_some() || params.end.is_some() {
            let start = required_time(params.start, "start")?;
            let end = required_time(params.end, "end")?;
            let step = match params.step {
                Some(step) => parse_duration_param(&step.as_text(), "step")?,
                None => duration_millis(settings.default_step),
            };
            validate_range(start, end, step)?;
            QueryKind::Range { start, end, step }
        } else {
            let time = match params.time {
                Some(time) => parse_time_param(&time.as_text(), "time")?,
                None => current_time_millis(),
            };
            QueryKind::Instant { time }
        };

        Ok(QueryRequest {
            query: query.to_string(),
            kind,
            timeout,
        })
    }

    pub fn from_form(body: &str, settings: &EngineSettings) -> EngineResult<Self> {
        Self::from_params(QueryParams::from_form(body), settings)
    }

    pub fn from_json(body: &str, settings: &EngineSettings) -> EngineResult<Self> {
        Self::from_params(QueryParams::from_json(body)?, settings)
    }
}

fn required_time(value: Option<ParamValue>, name: &str) -> EngineResult<Timestamp> {
    match value {
        Some(value) => parse_time_param(&value.as_text(), name),
        None => Err(EngineError::parse(format!("invalid parameter \"{name}\": missing"))),
    }
}

pub fn validate_range(start: Timestamp, end: Timestamp, step: i64) -> EngineResult<()> {
    if end < start {
        return Err(EngineError::parse(
            "invalid parameter \"end\": end timestamp must not be before start time",
        ));
    }
    if step <= 0 {
        return Err(EngineError::parse(
            "invalid parameter \"step\": zero or negative query resolution step widths are not accepted. Try a positive integer",
        ));
    }
    if (end - start) / step >= MAX_POINTS_PER_SERIES {
        return Err(EngineError::parse(
            "exceeded maximum resolution of 11,000 points per timeseries. Try decreasing the query resolution (?step=XX)",
        ));
    }
    Ok(())
}

/// Floors `start` to a multiple of `step`.
pub fn align_start(start: Timestamp, step: i64) -> Timestamp {
    if step <= 0 {
        return start;
    }
    start.div_euclid(step) * step
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_form_range_request() {
        let body = "query=sum%28cpu%7Bhost%3D~%22a.*%22%7D%29&start=1700000000&end=2023-11-14T22:23:20.5Z&step=15s";
        let request = QueryRequest::from_form(body, &EngineSettings::default()).unwrap();
        assert_eq!(request.query, r#"sum(cpu{host=~"a.*"})"#);
        assert_eq!(
            request.kind,
            QueryKind::Range {
                start: 1_700_000_000_000,
                end: 1_700_000_600_500,
                step: 15_000
            }
        );
        assert!(!request.is_instant());
    }

    #[test]
    fn test_json_instant_request() {
        let body = r#"{"query": "up", "time": 1700000000.25, "timeout": "30s"}"#;
        let request = QueryRequest::from_json(body, &EngineSettings::default()).unwrap();
        assert_eq!(request.kind, QueryKind::Instant { time: 1_700_000_000_250 });
        assert_eq!(request.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_default_step() {
        let body = r#"{"query": "up", "start": "100", "end": "200"}"#;
        let request = QueryRequest::from_json(body, &EngineSettings::default()).unwrap();
        assert_eq!(
            request.kind,
            QueryKind::Range {
                start: 100_000,
                end: 200_000,
                step: 60_000
            }
        );
    }

    #[test_case("query=" ; "empty query")]
    #[test_case("query=up&start=100" ; "missing end")]
    #[test_case("query=up&start=200&end=100&step=1" ; "end before start")]
    #[test_case("query=up&start=100&end=200&step=0" ; "zero step")]
    #[test_case("query=up&start=0&end=100000&step=1" ; "too many points")]
    #[test_case("query=up&time=yesterday" ; "bad time")]
    #[test_case("query=up&timeout=0" ; "zero timeout")]
    #[test_case("query=up&timeout=-5" ; "negative timeout")]
    fn test_invalid_requests(body: &str) {
        let err = QueryRequest::from_form(body, &EngineSettings::default()).unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)), "{err:?}");
    }

    #[test]
    fn test_invalid_json() {
        let err = QueryRequest::from_json("{", &EngineSettings::default()).unwrap_err();
        assert_eq!(err.error_type().as_str(), "bad_data");
    }

    #[test_case(1_000, 300, 900)]
    #[test_case(900, 300, 900)]
    #[test_case(-100, 300, -300)]
    fn test_align_start(start: i64, step: i64, expected: i64) {
        assert_eq!(align_start(start, step), expected);
    }
}

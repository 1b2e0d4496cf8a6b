use crate::common::types::{Sample, Timestamp};
use crate::error::{EngineError, EngineResult};
use crate::eval::{RangeVector, Value};
use crate::labels::Labels;
use ahash::AHashMap;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, SerializeTuple, Serializer};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

/// One element of a vector result.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorElement {
    pub labels: Arc<Labels>,
    pub timestamp: Timestamp,
    pub value: f64,
}

/// One series of a matrix result.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixElement {
    pub labels: Arc<Labels>,
    pub samples: Vec<Sample>,
}

/// The shaped result of a query, serialized as the Prometheus `data` object.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryData {
    Scalar(Sample),
    String(Timestamp, String),
    Vector(Vec<VectorElement>),
    Matrix(Vec<MatrixElement>),
}

impl QueryData {
    pub fn result_type(&self) -> &'static str {
        match self {
            QueryData::Scalar(_) => "scalar",
            QueryData::String(..) => "string",
            QueryData::Vector(_) => "vector",
            QueryData::Matrix(_) => "matrix",
        }
    }

    /// `{"status":"success","data":{..}}`
    pub fn to_envelope(&self) -> JsonValue {
        json!({ "status": "success", "data": self })
    }
}

/// Seconds, integral when the timestamp is.
pub fn format_timestamp(ts: Timestamp) -> JsonValue {
    if ts % 1000 == 0 {
        json!(ts / 1000)
    } else {
        json!(ts as f64 / 1000.0)
    }
}

pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

struct Point<'a>(Timestamp, &'a str);

impl Serialize for Point<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&format_timestamp(self.0))?;
        tuple.serialize_element(self.1)?;
        tuple.end()
    }
}

struct SamplePoint<'a>(&'a Sample);

impl Serialize for SamplePoint<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Point(self.0.timestamp, &format_value(self.0.value)).serialize(serializer)
    }
}

struct Points<'a>(&'a [Sample]);

impl Serialize for Points<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for sample in self.0 {
            seq.serialize_element(&SamplePoint(sample))?;
        }
        seq.end()
    }
}

impl Serialize for VectorElement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("metric", &*self.labels)?;
        map.serialize_entry(
            "value",
            &SamplePoint(&Sample::new(self.timestamp, self.value)),
        )?;
        map.end()
    }
}

impl Serialize for MatrixElement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("metric", &*self.labels)?;
        map.serialize_entry("values", &Points(&self.samples))?;
        map.end()
    }
}

impl Serialize for QueryData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("resultType", self.result_type())?;
        match self {
            QueryData::Scalar(sample) => map.serialize_entry("result", &SamplePoint(sample))?,
            QueryData::String(ts, s) => map.serialize_entry("result", &Point(*ts, s))?,
            QueryData::Vector(elements) => map.serialize_entry("result", elements)?,
            QueryData::Matrix(elements) => map.serialize_entry("result", elements)?,
        }
        map.end()
    }
}

/// Shapes the value of an instant query evaluated at `time`. Vector order is kept as
/// evaluated; matrix series are sorted by labels.
pub fn shape_instant(value: Value, time: Timestamp) -> EngineResult<QueryData> {
    let data = match value {
        Value::Scalar(values) => {
            QueryData::Scalar(Sample::new(time, values.first().copied().unwrap_or(f64::NAN)))
        }
        Value::String(s) => QueryData::String(time, s),
        Value::Vector(steps) => QueryData::Vector(
            steps
                .into_iter()
                .next()
                .unwrap_or_default()
                .into_iter()
                .map(|s| VectorElement {
                    labels: s.labels,
                    timestamp: time,
                    value: s.value,
                })
                .collect(),
        ),
        Value::Matrix(matrix) => QueryData::Matrix(matrix_samples(matrix)),
    };
    Ok(data)
}

/// Per-bucket samples of the first window of `matrix`.
fn matrix_samples(matrix: RangeVector) -> Vec<MatrixElement> {
    if matrix.times.is_empty() {
        return Vec::new();
    }
    let mut result: Vec<MatrixElement> = matrix
        .series
        .iter()
        .filter_map(|series| {
            let samples: Vec<Sample> = matrix
                .window_of(series, 0)
                .iter()
                .filter_map(|b| b.stats.last_sample())
                .collect();
            if samples.is_empty() {
                None
            } else {
                Some(MatrixElement {
                    labels: series.labels.clone(),
                    samples,
                })
            }
        })
        .collect();
    result.sort_by(|a, b| a.labels.cmp(&b.labels));
    result
}

/// Shapes the value of a range query into a matrix, one series per distinct label set.
pub fn shape_range(value: Value, times: &[Timestamp]) -> EngineResult<QueryData> {
    let steps = match value {
        Value::Scalar(values) => {
            let samples = times
                .iter()
                .zip(values)
                .map(|(t, v)| Sample::new(*t, v))
                .collect();
            return Ok(QueryData::Matrix(vec![MatrixElement {
                labels: Arc::new(Labels::empty()),
                samples,
            }]));
        }
        Value::Vector(steps) => steps,
        other => {
            return Err(EngineError::parse(format!(
                "invalid expression type \"{}\" for range query, must be Scalar or instant Vector",
                other.type_name()
            )))
        }
    };

    let mut index: AHashMap<u64, usize> = AHashMap::new();
    let mut result: Vec<MatrixElement> = Vec::new();
    for (t, vector) in times.iter().zip(steps) {
        for sample in vector {
            let idx = *index.entry(sample.labels.hash_all()).or_insert_with(|| {
                result.push(MatrixElement {
                    labels: sample.labels.clone(),
                    samples: Vec::new(),
                });
                result.len() - 1
            });
            result[idx].samples.push(Sample::new(*t, sample.value));
        }
    }
    result.sort_by(|a, b| a.labels.cmp(&b.labels));
    Ok(QueryData::Matrix(result))
}

/// HTTP status and body for a query outcome.
pub fn to_response(result: &EngineResult<QueryData>) -> (u16, JsonValue) {
    match result {
        Ok(data) => (200, data.to_envelope()),
        Err(err) => (
            err.status_code(),
            serde_json::to_value(err.to_envelope()).unwrap_or_else(|_| {
                json!({ "status": "error", "errorType": err.error_type().as_str(), "error": err.to_string() })
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::StepSample;
    use test_case::test_case;

    #[test_case(1.0, "1")]
    #[test_case(2.5, "2.5")]
    #[test_case(-0.125, "-0.125")]
    #[test_case(1e21, "1000000000000000000000")]
    #[test_case(f64::NAN, "NaN")]
    #[test_case(f64::INFINITY, "+Inf")]
    #[test_case(f64::NEG_INFINITY, "-Inf")]
    fn test_format_value(value: f64, expected: &str) {
        assert_eq!(format_value(value), expected);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(1_700_000_000_000), json!(1_700_000_000));
        assert_eq!(format_timestamp(1_700_000_000_500), json!(1_700_000_000.5));
    }

    #[test]
    fn test_vector_envelope() {
        let labels = Arc::new(Labels::from_pairs(&[("__name__", "up"), ("job", "api")]));
        let value = Value::Vector(vec![vec![StepSample::new(labels, 1.0)]]);
        let data = shape_instant(value, 1_700_000_000_000).unwrap();
        assert_eq!(
            data.to_envelope(),
            json!({
                "status": "success",
                "data": {
                    "resultType": "vector",
                    "result": [
                        { "metric": { "__name__": "up", "job": "api" }, "value": [1700000000, "1"] }
                    ]
                }
            })
        );
    }

    #[test]
    fn test_scalar_and_string() {
        let data = shape_instant(Value::Scalar(vec![f64::INFINITY]), 1_500).unwrap();
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!({ "resultType": "scalar", "result": [1.5, "+Inf"] })
        );
        let data = shape_instant(Value::String("hello".into()), 2_000).unwrap();
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!({ "resultType": "string", "result": [2, "hello"] })
        );
    }

    #[test]
    fn test_range_groups_by_labels() {
        let a = Arc::new(Labels::from_pairs(&[("job", "b")]));
        let b = Arc::new(Labels::from_pairs(&[("job", "a")]));
        let value = Value::Vector(vec![
            vec![StepSample::new(a.clone(), 1.0)],
            vec![StepSample::new(b.clone(), 2.0), StepSample::new(a.clone(), 3.0)],
        ]);
        let data = shape_range(value, &[10_000, 20_000]).unwrap();
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!({
                "resultType": "matrix",
                "result": [
                    { "metric": { "job": "a" }, "values": [[20, "2"]] },
                    { "metric": { "job": "b" }, "values": [[10, "1"], [20, "3"]] }
                ]
            })
        );
    }

    #[test]
    fn test_range_rejects_string() {
        let err = shape_range(Value::String("x".into()), &[0]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid expression type \"string\" for range query, must be Scalar or instant Vector"
        );
    }

    #[test]
    fn test_error_response() {
        let (status, body) = to_response(&Err(EngineError::Timeout("expression evaluation".into())));
        assert_eq!(status, 503);
        assert_eq!(body["errorType"], "timeout");
        assert_eq!(body["error"], "query timed out in expression evaluation");
    }
}

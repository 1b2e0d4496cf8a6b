use super::value::{InstantVector, StepSample};
use crate::error::{EngineError, EngineResult};
use crate::labels::{Labels, Signature};
use ahash::AHashMap;
use promql_parser::parser::token::*;
use promql_parser::parser::LabelModifier;
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AggregateOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    TopK,
    BottomK,
}

impl AggregateOp {
    pub fn from_token(token: TokenType) -> EngineResult<Self> {
        let op = match token.id() {
            T_SUM => AggregateOp::Sum,
            T_AVG => AggregateOp::Avg,
            T_MIN => AggregateOp::Min,
            T_MAX => AggregateOp::Max,
            T_COUNT => AggregateOp::Count,
            T_TOPK => AggregateOp::TopK,
            T_BOTTOMK => AggregateOp::BottomK,
            _ => {
                return Err(EngineError::parse(format!(
                    "unsupported aggregation operator {token:?}"
                )))
            }
        };
        Ok(op)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            AggregateOp::Sum => "sum",
            AggregateOp::Avg => "avg",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Count => "count",
            AggregateOp::TopK => "topk",
            AggregateOp::BottomK => "bottomk",
        }
    }

    pub const fn takes_param(&self) -> bool {
        matches!(self, AggregateOp::TopK | AggregateOp::BottomK)
    }
}

/// `by (..)` or `without (..)` grouping.
#[derive(Debug, Clone, Default)]
pub struct Grouping {
    pub without: bool,
    pub names: Vec<String>,
}

impl Grouping {
    pub fn from_modifier(modifier: Option<&LabelModifier>) -> Self {
        match modifier {
            Some(LabelModifier::Include(labels)) => Grouping {
                without: false,
                names: labels.labels.clone(),
            },
            Some(LabelModifier::Exclude(labels)) => Grouping {
                without: true,
                names: labels.labels.clone(),
            },
            None => Grouping::default(),
        }
    }

    pub fn group_labels(&self, labels: &Labels) -> Labels {
        if self.without {
            labels.drop_names(&self.names)
        } else {
            labels.keep_only(&self.names)
        }
    }

    fn signature(&self, labels: &Labels) -> Signature {
        labels.signature(&self.names, self.without)
    }
}

struct Group {
    labels: Arc<Labels>,
    value: f64,
    count: usize,
    members: Vec<StepSample>,
}

/// Aggregates one step. `param` is the `k` of topk/bottomk at this step.
pub fn aggregate_step(
    op: AggregateOp,
    vector: InstantVector,
    grouping: &Grouping,
    param: Option<f64>,
) -> EngineResult<InstantVector> {
    let k = match (op.takes_param(), param) {
        (true, Some(k)) => {
            if k.is_nan() {
                return Err(EngineError::parse(format!(
                    "parameter value is NaN for {}",
                    op.as_str()
                )));
            }
            // truncated toward zero
            let k = k.trunc();
            if k < 1.0 {
                return Ok(Vec::new());
            }
            k.min(usize::MAX as f64) as usize
        }
        (true, None) => {
            return Err(EngineError::parse(format!(
                "expected type scalar in aggregation parameter of {}",
                op.as_str()
            )))
        }
        _ => 0,
    };

    let mut index: AHashMap<Signature, usize> = AHashMap::new();
    let mut groups: Vec<Group> = Vec::new();

    for sample in vector {
        let sig = grouping.signature(&sample.labels);
        let idx = match index.get(&sig) {
            Some(idx) => *idx,
            None => {
                let labels = if op.takes_param() {
                    Arc::new(Labels::empty())
                } else {
                    Arc::new(grouping.group_labels(&sample.labels))
                };
                groups.push(Group {
                    labels,
                    value: sample.value,
                    count: 0,
                    members: Vec::new(),
                });
                index.insert(sig, groups.len() - 1);
                groups.len() - 1
            }
        };
        let group = &mut groups[idx];
        let first = group.count == 0;
        group.count += 1;
        match op {
            AggregateOp::Sum | AggregateOp::Avg => {
                if !first {
                    group.value += sample.value;
                }
            }
            AggregateOp::Max => {
                if group.value < sample.value || group.value.is_nan() {
                    group.value = sample.value;
                }
            }
            AggregateOp::Min => {
                if group.value > sample.value || group.value.is_nan() {
                    group.value = sample.value;
                }
            }
            AggregateOp::Count => {}
            AggregateOp::TopK | AggregateOp::BottomK => group.members.push(sample),
        }
    }

    let mut result = Vec::with_capacity(groups.len());
    for group in groups {
        match op {
            AggregateOp::Sum | AggregateOp::Max | AggregateOp::Min => {
                result.push(StepSample::new(group.labels, group.value))
            }
            AggregateOp::Avg => result.push(StepSample::new(
                group.labels,
                group.value / group.count as f64,
            )),
            AggregateOp::Count => result.push(StepSample::new(group.labels, group.count as f64)),
            AggregateOp::TopK | AggregateOp::BottomK => {
                let mut members = group.members;
                // stable: ties keep input order
                members.sort_by(|a, b| rank(op, a.value, b.value));
                members.truncate(k);
                result.extend(members);
            }
        }
    }
    Ok(result)
}

/// Ordering for topk (descending) and bottomk (ascending). NaN ranks last in both.
fn rank(op: AggregateOp, a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            if op == AggregateOp::TopK {
                b.partial_cmp(&a).unwrap_or(Ordering::Equal)
            } else {
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
        }
    }
}

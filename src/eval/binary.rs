use super::value::{check_unique_labelsets, drop_metric_name, InstantVector, StepSample, Value};
use crate::error::{EngineError, EngineResult};
use crate::labels::{Labels, Signature};
use ahash::{AHashMap, AHashSet};
use phf::phf_map;
use promql_parser::parser::token::*;
use promql_parser::parser::{BinModifier, LabelModifier, VectorMatchCardinality};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

const DUPLICATE_MATCH_GROUP: &str =
    "found duplicate series for the match group, many-to-many only allowed for set operators";
const IMPLICIT_MANY_TO_ONE: &str =
    "multiple matches for labels: many-to-one matching must be explicit (group_left/group_right)";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eql,
    NotEq,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Unless,
}

pub static BINARY_OPS_MAP: phf::Map<&'static str, BinaryOp> = phf_map! {
    "+" => BinaryOp::Add,
    "-" => BinaryOp::Sub,
    "*" => BinaryOp::Mul,
    "/" => BinaryOp::Div,
    "%" => BinaryOp::Mod,
    "^" => BinaryOp::Pow,

    // cmp ops
    "==" => BinaryOp::Eql,
    "!=" => BinaryOp::NotEq,
    "<" => BinaryOp::Lt,
    ">" => BinaryOp::Gt,
    "<=" => BinaryOp::Lte,
    ">=" => BinaryOp::Gte,

    // logic set ops
    "and" => BinaryOp::And,
    "or" => BinaryOp::Or,
    "unless" => BinaryOp::Unless,
};

impl BinaryOp {
    pub const fn as_str(&self) -> &'static str {
        use BinaryOp::*;
        match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Mod => "%",
            Pow => "^",
            Eql => "==",
            NotEq => "!=",
            Gt => ">",
            Gte => ">=",
            Lt => "<",
            Lte => "<=",
            And => "and",
            Or => "or",
            Unless => "unless",
        }
    }

    pub fn from_token(token: TokenType) -> EngineResult<Self> {
        let op = match token.id() {
            T_ADD => BinaryOp::Add,
            T_SUB => BinaryOp::Sub,
            T_MUL => BinaryOp::Mul,
            T_DIV => BinaryOp::Div,
            T_MOD => BinaryOp::Mod,
            T_POW => BinaryOp::Pow,
            T_EQLC => BinaryOp::Eql,
            T_NEQ => BinaryOp::NotEq,
            T_GTR => BinaryOp::Gt,
            T_GTE => BinaryOp::Gte,
            T_LSS => BinaryOp::Lt,
            T_LTE => BinaryOp::Lte,
            T_LAND => BinaryOp::And,
            T_LOR => BinaryOp::Or,
            T_LUNLESS => BinaryOp::Unless,
            _ => {
                return Err(EngineError::parse(format!(
                    "unsupported binary operator {token:?}"
                )))
            }
        };
        Ok(op)
    }

    pub const fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eql | BinaryOp::NotEq | BinaryOp::Gt | BinaryOp::Gte | BinaryOp::Lt | BinaryOp::Lte
        )
    }

    pub const fn is_set_operator(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Unless)
    }

    /// Arithmetic on two values. Comparisons yield 1.0 or 0.0.
    pub fn apply(&self, left: f64, right: f64) -> f64 {
        use BinaryOp::*;
        match self {
            Add => left + right,
            Sub => left - right,
            Mul => left * right,
            Div => left / right,
            Mod => {
                if right == 0.0 {
                    f64::NAN
                } else {
                    left % right
                }
            }
            Pow => left.powf(right),
            Eql => bool_value(left == right),
            NotEq => bool_value(left != right),
            Gt => bool_value(left > right),
            Gte => bool_value(left >= right),
            Lt => bool_value(left < right),
            Lte => bool_value(left <= right),
            And | Or | Unless => f64::NAN,
        }
    }

    /// Value and keep flag for one matched pair. Filtering comparisons keep the left value.
    fn combine(&self, left: f64, right: f64, return_bool: bool) -> (f64, bool) {
        if self.is_comparison() {
            let holds = self.apply(left, right) == 1.0;
            if return_bool {
                (bool_value(holds), true)
            } else {
                (left, holds)
            }
        } else {
            (self.apply(left, right), true)
        }
    }
}

fn bool_value(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

impl TryFrom<&str> for BinaryOp {
    type Error = EngineError;

    fn try_from(op: &str) -> Result<Self, Self::Error> {
        match BINARY_OPS_MAP.get(op) {
            Some(operator) => Ok(*operator),
            None => match BINARY_OPS_MAP.get(op.to_lowercase().as_str()) {
                Some(operator) => Ok(*operator),
                None => Err(EngineError::parse(format!("unknown binary op {op}"))),
            },
        }
    }
}

impl FromStr for BinaryOp {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BinaryOp::try_from(s)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Vector matching parameters of one binary expression.
#[derive(Debug, Clone, Default)]
pub struct VectorMatching {
    /// `on(..)` when true, `ignoring(..)` otherwise
    pub on: bool,
    pub names: Vec<String>,
    pub card: Cardinality,
    /// Labels copied from the "one" side by `group_left(..)`/`group_right(..)`
    pub include: Vec<String>,
    pub return_bool: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Cardinality {
    #[default]
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

impl VectorMatching {
    pub fn from_modifier(modifier: Option<&BinModifier>) -> Self {
        let Some(modifier) = modifier else {
            return VectorMatching::default();
        };
        let (on, names) = match &modifier.matching {
            Some(LabelModifier::Include(labels)) => (true, labels.labels.clone()),
            Some(LabelModifier::Exclude(labels)) => (false, labels.labels.clone()),
            None => (false, Vec::new()),
        };
        let (card, include) = match &modifier.card {
            VectorMatchCardinality::OneToOne => (Cardinality::OneToOne, Vec::new()),
            VectorMatchCardinality::ManyToOne(labels) => (Cardinality::ManyToOne, labels.labels.clone()),
            VectorMatchCardinality::OneToMany(labels) => (Cardinality::OneToMany, labels.labels.clone()),
            VectorMatchCardinality::ManyToMany => (Cardinality::ManyToMany, Vec::new()),
        };
        VectorMatching {
            on,
            names,
            card,
            include,
            return_bool: modifier.return_bool,
        }
    }

    fn signature(&self, labels: &Labels) -> Signature {
        labels.signature(&self.names, !self.on)
    }
}

/// Evaluates `left op right` step by step.
pub fn eval_binary(op: BinaryOp, left: Value, right: Value, matching: &VectorMatching) -> EngineResult<Value> {
    match (left, right) {
        (Value::Scalar(l), Value::Scalar(r)) => {
            let values = l
                .into_iter()
                .zip(r)
                .map(|(a, b)| op.apply(a, b))
                .collect();
            Ok(Value::Scalar(values))
        }
        (Value::Vector(l), Value::Scalar(r)) => {
            let steps = l
                .into_iter()
                .zip(r)
                .map(|(vector, scalar)| vector_scalar(op, vector, scalar, false, matching.return_bool))
                .collect::<EngineResult<Vec<_>>>()?;
            Ok(Value::Vector(steps))
        }
        (Value::Scalar(l), Value::Vector(r)) => {
            let steps = r
                .into_iter()
                .zip(l)
                .map(|(vector, scalar)| vector_scalar(op, vector, scalar, true, matching.return_bool))
                .collect::<EngineResult<Vec<_>>>()?;
            Ok(Value::Vector(steps))
        }
        (Value::Vector(l), Value::Vector(r)) => {
            let steps = l
                .into_iter()
                .zip(r)
                .map(|(lhs, rhs)| match op {
                    BinaryOp::And => Ok(vector_and(lhs, rhs, matching)),
                    BinaryOp::Or => Ok(vector_or(lhs, rhs, matching)),
                    BinaryOp::Unless => Ok(vector_unless(lhs, rhs, matching)),
                    _ => vector_vector(op, lhs, rhs, matching),
                })
                .collect::<EngineResult<Vec<_>>>()?;
            Ok(Value::Vector(steps))
        }
        (l, r) => Err(EngineError::parse(format!(
            "binary expression must contain only scalar and instant vector types, got {} {op} {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}

fn vector_scalar(
    op: BinaryOp,
    vector: InstantVector,
    scalar: f64,
    swap: bool,
    return_bool: bool,
) -> EngineResult<InstantVector> {
    let mut result = Vec::with_capacity(vector.len());
    for sample in vector {
        let (l, r) = if swap {
            (scalar, sample.value)
        } else {
            (sample.value, scalar)
        };
        let (mut value, keep) = op.combine(l, r, return_bool);
        if !keep {
            continue;
        }
        // the vector element's value survives a filtering comparison on either side
        if op.is_comparison() && !return_bool {
            value = sample.value;
        }
        let labels = if !op.is_comparison() || return_bool {
            drop_metric_name(&sample.labels)
        } else {
            sample.labels
        };
        result.push(StepSample::new(labels, value));
    }
    check_unique_labelsets(&result)?;
    Ok(result)
}

fn vector_vector(
    op: BinaryOp,
    lhs: InstantVector,
    rhs: InstantVector,
    matching: &VectorMatching,
) -> EngineResult<InstantVector> {
    if matching.card == Cardinality::ManyToMany {
        return Err(EngineError::execution(DUPLICATE_MATCH_GROUP));
    }
    let swap = matching.card == Cardinality::OneToMany;
    let (many, one) = if swap { (rhs, lhs) } else { (lhs, rhs) };

    let mut one_side: AHashMap<Signature, StepSample> = AHashMap::with_capacity(one.len());
    for sample in one {
        let sig = matching.signature(&sample.labels);
        if one_side.insert(sig, sample).is_some() {
            return Err(EngineError::execution(DUPLICATE_MATCH_GROUP));
        }
    }

    let mut matched: AHashSet<Signature> = AHashSet::new();
    let mut inserted: AHashSet<Signature> = AHashSet::new();
    let mut result = Vec::with_capacity(many.len());
    for sample in many {
        let sig = matching.signature(&sample.labels);
        let Some(other) = one_side.get(&sig) else {
            continue;
        };
        if matching.card == Cardinality::OneToOne && !matched.insert(sig) {
            return Err(EngineError::execution(IMPLICIT_MANY_TO_ONE));
        }

        let (l, r) = if swap {
            (other.value, sample.value)
        } else {
            (sample.value, other.value)
        };
        let (value, keep) = op.combine(l, r, matching.return_bool);
        if !keep {
            continue;
        }

        let labels = result_labels(op, &sample.labels, &other.labels, matching);
        if matching.card != Cardinality::OneToOne && !inserted.insert(labels.hash_all()) {
            return Err(EngineError::execution(
                "multiple matches for labels: grouping labels must ensure unique matches",
            ));
        }
        result.push(StepSample::new(Arc::new(labels), value));
    }
    check_unique_labelsets(&result)?;
    Ok(result)
}

fn result_labels(op: BinaryOp, many: &Labels, one: &Labels, matching: &VectorMatching) -> Labels {
    let mut labels = if !op.is_comparison() || matching.return_bool {
        many.without_metric_name()
    } else {
        many.clone()
    };
    if matching.card == Cardinality::OneToOne {
        labels = if matching.on {
            labels.keep_only(&matching.names)
        } else {
            let mut kept = labels;
            for name in matching.names.iter() {
                kept = kept.without(name);
            }
            kept
        };
    }
    for name in matching.include.iter() {
        labels = match one.get(name) {
            Some(value) if !value.is_empty() => labels.with(name, value),
            _ => labels.without(name),
        };
    }
    labels
}

fn sig_set(vector: &[StepSample], matching: &VectorMatching) -> AHashSet<Signature> {
    vector.iter().map(|s| matching.signature(&s.labels)).collect()
}

fn vector_and(lhs: InstantVector, rhs: InstantVector, matching: &VectorMatching) -> InstantVector {
    let right = sig_set(&rhs, matching);
    lhs.into_iter()
        .filter(|s| right.contains(&matching.signature(&s.labels)))
        .collect()
}

fn vector_or(lhs: InstantVector, rhs: InstantVector, matching: &VectorMatching) -> InstantVector {
    let left = sig_set(&lhs, matching);
    let mut result = lhs;
    result.extend(
        rhs.into_iter()
            .filter(|s| !left.contains(&matching.signature(&s.labels))),
    );
    result
}

fn vector_unless(lhs: InstantVector, rhs: InstantVector, matching: &VectorMatching) -> InstantVector {
    let right = sig_set(&rhs, matching);
    lhs.into_iter()
        .filter(|s| !right.contains(&matching.signature(&s.labels)))
        .collect()
}

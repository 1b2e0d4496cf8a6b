use super::Labels;
use crate::error::EngineResult;
use promql_parser::label::{MatchOp as ParserMatchOp, Matcher as ParserMatcher};
use regex::Regex;
use std::fmt;

#[derive(Debug, Clone)]
pub enum MatchOp {
    Equal,
    NotEqual,
    RegexMatch(Regex),
    RegexNoMatch(Regex),
}

impl MatchOp {
    pub const fn as_str(&self) -> &'static str {
        match self {
            MatchOp::Equal => "=",
            MatchOp::NotEqual => "!=",
            MatchOp::RegexMatch(_) => "=~",
            MatchOp::RegexNoMatch(_) => "!~",
        }
    }

    pub fn is_regex(&self) -> bool {
        matches!(self, MatchOp::RegexMatch(_) | MatchOp::RegexNoMatch(_))
    }
}

impl PartialEq for MatchOp {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MatchOp::Equal, MatchOp::Equal) | (MatchOp::NotEqual, MatchOp::NotEqual) => true,
            (MatchOp::RegexMatch(a), MatchOp::RegexMatch(b))
            | (MatchOp::RegexNoMatch(a), MatchOp::RegexNoMatch(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

/// A compiled label matcher. Regexes are fully anchored and compiled once.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelMatcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
}

impl LabelMatcher {
    pub fn equal(name: &str, value: &str) -> Self {
        LabelMatcher {
            name: name.to_string(),
            op: MatchOp::Equal,
            value: value.to_string(),
        }
    }

    pub fn not_equal(name: &str, value: &str) -> Self {
        LabelMatcher {
            name: name.to_string(),
            op: MatchOp::NotEqual,
            value: value.to_string(),
        }
    }

    pub fn regex(name: &str, pattern: &str) -> EngineResult<Self> {
        Ok(LabelMatcher {
            name: name.to_string(),
            op: MatchOp::RegexMatch(compile_anchored(pattern)?),
            value: pattern.to_string(),
        })
    }

    pub fn not_regex(name: &str, pattern: &str) -> EngineResult<Self> {
        Ok(LabelMatcher {
            name: name.to_string(),
            op: MatchOp::RegexNoMatch(compile_anchored(pattern)?),
            value: pattern.to_string(),
        })
    }

    pub fn matches_value(&self, value: &str) -> bool {
        match &self.op {
            MatchOp::Equal => value == self.value,
            MatchOp::NotEqual => value != self.value,
            MatchOp::RegexMatch(re) => re.is_match(value),
            MatchOp::RegexNoMatch(re) => !re.is_match(value),
        }
    }

    /// A missing label matches as the empty string.
    pub fn matches(&self, labels: &Labels) -> bool {
        self.matches_value(labels.get(&self.name).unwrap_or_default())
    }

    /// True when the matcher selects series that lack the label entirely.
    pub fn matches_empty(&self) -> bool {
        self.matches_value("")
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op.as_str(), self.value)
    }
}

impl TryFrom<&ParserMatcher> for LabelMatcher {
    type Error = crate::error::EngineError;

    fn try_from(m: &ParserMatcher) -> Result<Self, Self::Error> {
        match &m.op {
            ParserMatchOp::Equal => Ok(LabelMatcher::equal(&m.name, &m.value)),
            ParserMatchOp::NotEqual => Ok(LabelMatcher::not_equal(&m.name, &m.value)),
            ParserMatchOp::Re(_) => LabelMatcher::regex(&m.name, &m.value),
            ParserMatchOp::NotRe(_) => LabelMatcher::not_regex(&m.name, &m.value),
        }
    }
}

fn compile_anchored(pattern: &str) -> EngineResult<Regex> {
    Ok(Regex::new(&format!("^(?:{pattern})$"))?)
}

pub fn matches_all(matchers: &[LabelMatcher], labels: &Labels) -> bool {
    matchers.iter().all(|m| m.matches(labels))
}

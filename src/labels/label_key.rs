use super::Labels;
use crate::common::types::Label;
use crate::common::METRIC_NAME_LABEL;
use crate::error::{EngineError, EngineResult};
use enquote::{enquote, unquote};

/// Parses the canonical series key stored with every document, e.g.
/// `labels.cluster="txy",labels.name="node-1"`. `prefix` is stripped from label names.
/// Quoted values may contain commas and escaped quotes.
pub fn parse_label_key(key: &str, prefix: &str) -> EngineResult<Labels> {
    let mut labels = Vec::new();
    for part in split_outside_quotes(key) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let Some((name, value)) = part.split_once('=') else {
            return Err(EngineError::backend(format!("malformed series key {key:?}")));
        };
        let name = name.trim();
        let name = name.strip_prefix(prefix).unwrap_or(name);
        let value = value.trim();
        let value = if value.starts_with('"') || value.starts_with('\'') {
            unquote(value)
                .map_err(|_| EngineError::backend(format!("malformed series key {key:?}")))?
        } else {
            value.to_string()
        };
        labels.push(Label::new(name, value));
    }
    Ok(Labels::new(labels))
}

/// Inverse of [`parse_label_key`]; the metric name is not part of the key.
pub fn format_label_key(labels: &Labels, prefix: &str) -> String {
    let mut key = String::new();
    for label in labels.iter().filter(|l| l.name != METRIC_NAME_LABEL) {
        if !key.is_empty() {
            key.push(',');
        }
        key.push_str(prefix);
        key.push_str(&label.name);
        key.push('=');
        key.push_str(&enquote('"', &label.value));
    }
    key
}

fn split_outside_quotes(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, ch) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (ch, quote) {
            ('\\', Some(_)) => escaped = true,
            ('"', None) | ('\'', None) => quote = Some(ch),
            (c, Some(q)) if c == q => quote = None,
            (',', None) => {
                parts.push(&s[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

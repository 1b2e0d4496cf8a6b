use crate::common::types::{Label, Timestamp};
use enquote::enquote;
use std::ops::Range;

/// Find the index of the first element of `arr` that is greater
/// or equal to `val`.
/// Assumes that `arr` is sorted.
pub fn find_first_ge_index<T>(arr: &[T], val: &T) -> usize
where
    T: Ord,
{
    if arr.len() <= 16 {
        // If the vectors are small, perform a linear search.
        return arr.iter().position(|x| x >= val).unwrap_or(arr.len());
    }
    arr.binary_search(val).unwrap_or_else(|x| x)
}

/// Returns the index range of `timestamps` falling within `[start_ts, end_ts)`.
/// Assumes `timestamps` is sorted and free of duplicates.
pub(crate) fn get_window_bounds(
    timestamps: &[Timestamp],
    start_ts: Timestamp,
    end_ts: Timestamp,
) -> Range<usize> {
    if timestamps.is_empty() || end_ts <= start_ts {
        return 0..0;
    }
    let start_idx = find_first_ge_index(timestamps, &start_ts);
    let end_idx = start_idx + find_first_ge_index(&timestamps[start_idx..], &end_ts);
    start_idx..end_idx
}

pub fn format_prometheus_metric_name_into(full_name: &mut String, name: &str, labels: &[Label]) {
    full_name.push_str(name);
    if !labels.is_empty() {
        full_name.push('{');
        for (i, label) in labels.iter().enumerate() {
            full_name.push_str(&label.name);
            full_name.push('=');
            full_name.push_str(&enquote('"', &label.value));
            if i < labels.len() - 1 {
                full_name.push(',');
            }
        }
        full_name.push('}');
    }
}

pub fn format_prometheus_metric_name(name: &str, labels: &[Label]) -> String {
    let size_hint = name.len()
        + labels
            .iter()
            .map(|l| l.name.len() + l.value.len() + 3)
            .sum::<usize>();
    let mut full_name: String = String::with_capacity(size_hint);
    format_prometheus_metric_name_into(&mut full_name, name, labels);
    full_name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_window_bounds_empty() {
        let timestamps: Vec<Timestamp> = vec![];
        assert_eq!(get_window_bounds(&timestamps, 0, 10), 0..0);
    }

    #[test]
    fn get_window_bounds_half_open() {
        let timestamps = vec![10, 20, 30, 40, 50];
        assert_eq!(get_window_bounds(&timestamps, 20, 40), 1..3);
        assert_eq!(get_window_bounds(&timestamps, 15, 41), 1..4);
        assert_eq!(get_window_bounds(&timestamps, 0, 10), 0..0);
        assert_eq!(get_window_bounds(&timestamps, 50, 60), 4..5);
        assert_eq!(get_window_bounds(&timestamps, 60, 70), 5..5);
    }

    #[test]
    fn get_window_bounds_large_input() {
        let timestamps: Vec<Timestamp> = (0..100).map(|i| i * 10).collect();
        assert_eq!(get_window_bounds(&timestamps, 205, 500), 21..50);
    }

    #[test]
    fn format_metric_name_quotes_values() {
        let labels = vec![Label::new("a", "x"), Label::new("b", "say \"hi\"")];
        assert_eq!(
            format_prometheus_metric_name("up", &labels),
            r#"up{a="x",b="say \"hi\""}"#
        );
        assert_eq!(format_prometheus_metric_name("up", &[]), "up");
    }
}

#[cfg(test)]
mod tests {
    use crate::error::EngineError;
    use crate::eval::{aggregate_step, AggregateOp, Grouping, InstantVector, StepSample};
    use crate::labels::Labels;
    use std::sync::Arc;
    use test_case::test_case;

    fn sample(pairs: &[(&str, &str)], value: f64) -> StepSample {
        StepSample::new(Arc::new(Labels::from_pairs(pairs)), value)
    }

    fn fixture() -> InstantVector {
        vec![
            sample(&[("__name__", "cpu"), ("index", "a"), ("host", "h1")], 1.0),
            sample(&[("__name__", "cpu"), ("index", "b"), ("host", "h2")], 5.0),
            sample(&[("__name__", "cpu"), ("index", "a"), ("host", "h3")], 3.0),
            sample(&[("__name__", "cpu"), ("index", "b"), ("host", "h4")], 5.0),
        ]
    }

    fn by(names: &[&str]) -> Grouping {
        Grouping {
            without: false,
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test_case(AggregateOp::Sum, 4.0, 10.0)]
    #[test_case(AggregateOp::Avg, 2.0, 5.0)]
    #[test_case(AggregateOp::Min, 1.0, 5.0)]
    #[test_case(AggregateOp::Max, 3.0, 5.0)]
    #[test_case(AggregateOp::Count, 2.0, 2.0)]
    fn test_aggregate_by(op: AggregateOp, a: f64, b: f64) {
        let result = aggregate_step(op, fixture(), &by(&["index"]), None).unwrap();
        assert_eq!(
            result,
            vec![sample(&[("index", "a")], a), sample(&[("index", "b")], b)]
        );
    }

    #[test]
    fn test_aggregate_without() {
        let grouping = Grouping {
            without: true,
            names: vec!["host".to_string()],
        };
        let result = aggregate_step(AggregateOp::Sum, fixture(), &grouping, None).unwrap();
        assert_eq!(
            result,
            vec![sample(&[("index", "a")], 4.0), sample(&[("index", "b")], 10.0)]
        );
    }

    #[test]
    fn test_aggregate_everything() {
        let result = aggregate_step(AggregateOp::Sum, fixture(), &Grouping::default(), None).unwrap();
        assert_eq!(result, vec![sample(&[], 14.0)]);
    }

    #[test]
    fn test_min_max_skip_nan() {
        let vector = vec![sample(&[("a", "1")], f64::NAN), sample(&[("a", "2")], 4.0)];
        let max = aggregate_step(AggregateOp::Max, vector.clone(), &Grouping::default(), None).unwrap();
        assert_eq!(max[0].value, 4.0);
        let min = aggregate_step(AggregateOp::Min, vector, &Grouping::default(), None).unwrap();
        assert_eq!(min[0].value, 4.0);
    }

    #[test]
    fn test_topk_keeps_labels_and_is_stable() {
        let result = aggregate_step(AggregateOp::TopK, fixture(), &Grouping::default(), Some(2.0)).unwrap();
        let hosts: Vec<_> = result.iter().map(|s| s.labels.get("host").unwrap()).collect();
        // h2 and h4 tie at 5; input order decides
        assert_eq!(hosts, vec!["h2", "h4"]);
        assert_eq!(result[0].labels.metric_name(), Some("cpu"));
    }

    #[test]
    fn test_topk_per_group() {
        let result = aggregate_step(AggregateOp::TopK, fixture(), &by(&["index"]), Some(1.0)).unwrap();
        let hosts: Vec<_> = result.iter().map(|s| s.labels.get("host").unwrap()).collect();
        assert_eq!(hosts, vec!["h3", "h2"]);
    }

    #[test]
    fn test_bottomk_sorts_nan_last() {
        let mut vector = fixture();
        vector.insert(0, sample(&[("host", "nan")], f64::NAN));
        let result = aggregate_step(AggregateOp::BottomK, vector, &Grouping::default(), Some(10.0)).unwrap();
        let hosts: Vec<_> = result.iter().map(|s| s.labels.get("host").unwrap()).collect();
        assert_eq!(hosts, vec!["h1", "h3", "h2", "h4", "nan"]);
    }

    #[test_case(0.0 ; "zero")]
    #[test_case(0.9 ; "truncated to zero")]
    #[test_case(-3.0 ; "negative")]
    fn test_topk_below_one_is_empty(k: f64) {
        let result = aggregate_step(AggregateOp::TopK, fixture(), &Grouping::default(), Some(k)).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_topk_large_k_returns_all() {
        let result = aggregate_step(AggregateOp::TopK, fixture(), &Grouping::default(), Some(1e9)).unwrap();
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn test_topk_nan_k() {
        let err = aggregate_step(AggregateOp::TopK, fixture(), &Grouping::default(), Some(f64::NAN)).unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }
}

#[cfg(test)]
mod tests {
    use crate::eval::{eval_binary, BinaryOp, Cardinality, InstantVector, StepSample, Value, VectorMatching};
    use crate::error::EngineError;
    use crate::labels::Labels;
    use std::str::FromStr;
    use std::sync::Arc;
    use test_case::test_case;

    fn sample(pairs: &[(&str, &str)], value: f64) -> StepSample {
        StepSample::new(Arc::new(Labels::from_pairs(pairs)), value)
    }

    fn single_step(value: Value) -> InstantVector {
        match value {
            Value::Vector(mut steps) => {
                assert_eq!(steps.len(), 1);
                steps.remove(0)
            }
            other => panic!("expected a vector, got {other:?}"),
        }
    }

    fn on(names: &[&str], card: Cardinality, include: &[&str]) -> VectorMatching {
        VectorMatching {
            on: true,
            names: names.iter().map(|s| s.to_string()).collect(),
            card,
            include: include.iter().map(|s| s.to_string()).collect(),
            return_bool: false,
        }
    }

    #[test_case("/", 1.0, 0.0, f64::INFINITY ; "positive over zero")]
    #[test_case("/", -1.0, 0.0, f64::NEG_INFINITY ; "negative over zero")]
    #[test_case("%", 5.0, 0.0, f64::NAN ; "modulo zero")]
    #[test_case("%", 5.0, 3.0, 2.0 ; "modulo")]
    #[test_case("^", 2.0, 10.0, 1024.0 ; "power")]
    #[test_case("^", -8.0, 1.0 / 3.0, f64::NAN ; "fractional power of negative")]
    #[test_case("-", 3.0, 5.0, -2.0 ; "subtraction")]
    fn test_scalar_arithmetic(op: &str, left: f64, right: f64, expected: f64) {
        let op = BinaryOp::from_str(op).unwrap();
        let result = eval_binary(
            op,
            Value::Scalar(vec![left]),
            Value::Scalar(vec![right]),
            &VectorMatching::default(),
        )
        .unwrap();
        let Value::Scalar(values) = result else {
            panic!("expected scalar");
        };
        if expected.is_nan() {
            assert!(values[0].is_nan());
        } else {
            assert_eq!(values[0], expected);
        }
    }

    #[test]
    fn test_zero_over_zero_is_nan() {
        assert!(BinaryOp::Div.apply(0.0, 0.0).is_nan());
    }

    #[test]
    fn test_op_names_round_trip() {
        for (name, op) in crate::eval::BINARY_OPS_MAP.entries() {
            assert_eq!(op.as_str(), *name);
            assert_eq!(op.to_string(), *name);
        }
        assert!(BinaryOp::try_from("<>").is_err());
    }

    #[test]
    fn test_vector_scalar_drops_metric_name() {
        let vector = vec![sample(&[("__name__", "cpu"), ("job", "a")], 2.0)];
        let result = eval_binary(
            BinaryOp::Mul,
            Value::Vector(vec![vector]),
            Value::Scalar(vec![10.0]),
            &VectorMatching::default(),
        )
        .unwrap();
        assert_eq!(single_step(result), vec![sample(&[("job", "a")], 20.0)]);
    }

    #[test]
    fn test_scalar_vector_comparison_filters() {
        let vector = vec![
            sample(&[("__name__", "cpu"), ("job", "a")], 2.0),
            sample(&[("__name__", "cpu"), ("job", "b")], 7.0),
        ];
        // 5 < v keeps the elements above 5 with their own values and names
        let result = eval_binary(
            BinaryOp::Lt,
            Value::Scalar(vec![5.0]),
            Value::Vector(vec![vector.clone()]),
            &VectorMatching::default(),
        )
        .unwrap();
        assert_eq!(single_step(result), vec![vector[1].clone()]);

        let matching = VectorMatching {
            return_bool: true,
            ..Default::default()
        };
        let result = eval_binary(
            BinaryOp::Lt,
            Value::Scalar(vec![5.0]),
            Value::Vector(vec![vector]),
            &matching,
        )
        .unwrap();
        assert_eq!(
            single_step(result),
            vec![sample(&[("job", "a")], 0.0), sample(&[("job", "b")], 1.0)]
        );
    }

    #[test]
    fn test_one_to_one_default_matching() {
        let lhs = vec![
            sample(&[("__name__", "a"), ("job", "x")], 10.0),
            sample(&[("__name__", "a"), ("job", "y")], 20.0),
        ];
        let rhs = vec![
            sample(&[("__name__", "b"), ("job", "y")], 4.0),
            sample(&[("__name__", "b"), ("job", "z")], 1.0),
        ];
        let result = eval_binary(
            BinaryOp::Div,
            Value::Vector(vec![lhs]),
            Value::Vector(vec![rhs]),
            &VectorMatching::default(),
        )
        .unwrap();
        assert_eq!(single_step(result), vec![sample(&[("job", "y")], 5.0)]);
    }

    #[test]
    fn test_duplicate_series_on_right() {
        let lhs = vec![sample(&[("job", "x"), ("instance", "1")], 1.0)];
        let rhs = vec![
            sample(&[("job", "x"), ("instance", "1")], 1.0),
            sample(&[("job", "x"), ("instance", "2")], 1.0),
        ];
        let err = eval_binary(
            BinaryOp::Add,
            Value::Vector(vec![lhs]),
            Value::Vector(vec![rhs]),
            &on(&["job"], Cardinality::OneToOne, &[]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            EngineError::execution(
                "found duplicate series for the match group, many-to-many only allowed for set operators"
            )
        );
    }

    #[test]
    fn test_many_to_one_requires_group_modifier() {
        let lhs = vec![
            sample(&[("__name__", "req"), ("job", "x"), ("path", "/a")], 10.0),
            sample(&[("__name__", "req"), ("job", "x"), ("path", "/b")], 30.0),
        ];
        let rhs = vec![sample(&[("__name__", "total"), ("job", "x"), ("team", "t1")], 40.0)];

        let err = eval_binary(
            BinaryOp::Div,
            Value::Vector(vec![lhs.clone()]),
            Value::Vector(vec![rhs.clone()]),
            &on(&["job"], Cardinality::OneToOne, &[]),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "multiple matches for labels: many-to-one matching must be explicit (group_left/group_right)"
        );

        let result = eval_binary(
            BinaryOp::Div,
            Value::Vector(vec![lhs]),
            Value::Vector(vec![rhs]),
            &on(&["job"], Cardinality::ManyToOne, &["team"]),
        )
        .unwrap();
        assert_eq!(
            single_step(result),
            vec![
                sample(&[("job", "x"), ("path", "/a"), ("team", "t1")], 0.25),
                sample(&[("job", "x"), ("path", "/b"), ("team", "t1")], 0.75),
            ]
        );
    }

    #[test]
    fn test_group_right_keeps_right_labels() {
        let lhs = vec![sample(&[("job", "x")], 100.0)];
        let rhs = vec![
            sample(&[("job", "x"), ("path", "/a")], 10.0),
            sample(&[("job", "x"), ("path", "/b")], 20.0),
        ];
        let result = eval_binary(
            BinaryOp::Sub,
            Value::Vector(vec![lhs]),
            Value::Vector(vec![rhs]),
            &on(&["job"], Cardinality::OneToMany, &[]),
        )
        .unwrap();
        assert_eq!(
            single_step(result),
            vec![
                sample(&[("job", "x"), ("path", "/a")], 90.0),
                sample(&[("job", "x"), ("path", "/b")], 80.0),
            ]
        );
    }

    #[test]
    fn test_set_operators() {
        let lhs = vec![sample(&[("job", "a")], 1.0), sample(&[("job", "b")], 2.0)];
        let rhs = vec![sample(&[("job", "b")], 20.0), sample(&[("job", "c")], 30.0)];
        let matching = VectorMatching {
            card: Cardinality::ManyToMany,
            ..Default::default()
        };
        let run = |op: BinaryOp| {
            single_step(
                eval_binary(
                    op,
                    Value::Vector(vec![lhs.clone()]),
                    Value::Vector(vec![rhs.clone()]),
                    &matching,
                )
                .unwrap(),
            )
        };

        assert_eq!(run(BinaryOp::And), vec![sample(&[("job", "b")], 2.0)]);
        assert_eq!(
            run(BinaryOp::Or),
            vec![
                sample(&[("job", "a")], 1.0),
                sample(&[("job", "b")], 2.0),
                sample(&[("job", "c")], 30.0),
            ]
        );
        assert_eq!(run(BinaryOp::Unless), vec![sample(&[("job", "a")], 1.0)]);
    }

    #[test]
    fn test_duplicate_labelset_after_arithmetic() {
        // dropping the metric name collapses two distinct series
        let vector = vec![
            sample(&[("__name__", "a"), ("job", "x")], 1.0),
            sample(&[("__name__", "b"), ("job", "x")], 2.0),
        ];
        let err = eval_binary(
            BinaryOp::Add,
            Value::Vector(vec![vector]),
            Value::Scalar(vec![1.0]),
            &VectorMatching::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            EngineError::execution("vector cannot contain metrics with the same labelset")
        );
    }

    #[test]
    fn test_range_vector_operand_rejected() {
        let err = eval_binary(
            BinaryOp::Add,
            Value::String("x".into()),
            Value::Scalar(vec![1.0]),
            &VectorMatching::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }
}

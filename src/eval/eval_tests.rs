#[cfg(test)]
mod tests {
    use crate::backend::TestBackend;
    use crate::common::types::Timestamp;
    use crate::config::EngineSettings;
    use crate::error::{EngineError, EngineResult};
    use crate::eval::{EvalRange, Evaluator, InstantVector, Value};
    use crate::labels::Labels;
    use crate::leaf::LeafResolver;
    use crate::pool::QueryPools;
    use promql_parser::parser;
    use std::sync::Arc;

    const SECOND: i64 = 1_000;
    // a multiple of 10s
    const BASE: i64 = 1_700_000_000_000;

    /// `http_requests_total` every 10s over two minutes, `api` growing by 1/s and `web` by
    /// 0.2/s, spread over two shards. One histogram snapshot at +120s.
    fn fixture() -> Arc<TestBackend> {
        let backend = TestBackend::new()
            .with_metric("http_requests_total", &["metrics-*"])
            .with_metric("latency_bucket", &["metrics-*"])
            .with_index("metrics-a", 2);
        for k in 0..=12 {
            let ts = BASE + k * 10 * SECOND;
            let shard = (k % 2) as u32;
            backend.add_sample("metrics-a", shard, "http_requests_total", &[("job", "api")], ts, 10.0 * k as f64);
            backend.add_sample("metrics-a", shard, "http_requests_total", &[("job", "web")], ts, 2.0 * k as f64);
        }
        for (le, count) in [("0.5", 10.0), ("1", 30.0), ("2", 40.0), ("+Inf", 40.0)] {
            backend.add_sample(
                "metrics-a",
                0,
                "latency_bucket",
                &[("job", "api"), ("le", le)],
                BASE + 120 * SECOND,
                count,
            );
        }
        Arc::new(backend)
    }

    struct Harness {
        resolver: LeafResolver,
        pools: QueryPools,
        settings: Arc<EngineSettings>,
    }

    impl Harness {
        fn new() -> Self {
            let settings = Arc::new(EngineSettings::default());
            let pools = QueryPools::new(&settings.pools);
            let resolver = LeafResolver::new(fixture(), settings.clone(), pools.clone());
            Harness {
                resolver,
                pools,
                settings,
            }
        }

        async fn instant(&self, query: &str, time: Timestamp) -> EngineResult<Value> {
            let expr = parser::parse(query).map_err(EngineError::Parse)?;
            let evaluator = Evaluator::new(&self.resolver, &self.pools, &self.settings, time, time, true);
            evaluator.eval(&expr, &EvalRange::instant(time)).await
        }

        async fn range(&self, query: &str, start: Timestamp, end: Timestamp, step: i64) -> EngineResult<Value> {
            let expr = parser::parse(query).map_err(EngineError::Parse)?;
            let evaluator = Evaluator::new(&self.resolver, &self.pools, &self.settings, start, end, false);
            evaluator.eval(&expr, &EvalRange::range(start, end, step)?).await
        }
    }

    fn steps(value: Value) -> Vec<InstantVector> {
        match value {
            Value::Vector(steps) => steps,
            other => panic!("expected an instant vector, got {}", other.type_name()),
        }
    }

    fn single(value: Value) -> (Arc<Labels>, f64) {
        let steps = steps(value);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].len(), 1, "{:?}", steps[0]);
        (steps[0][0].labels.clone(), steps[0][0].value)
    }

    fn job(name: &str) -> Arc<Labels> {
        Arc::new(Labels::from_pairs(&[("job", name)]))
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "expected {expected}, got {actual}");
    }

    const T: Timestamp = BASE + 125 * SECOND;

    #[tokio::test]
    async fn test_vector_selector_takes_latest_sample() {
        let harness = Harness::new();
        let (labels, value) = single(harness.instant(r#"http_requests_total{job="api"}"#, T).await.unwrap());
        assert_eq!(labels.metric_name(), Some("http_requests_total"));
        assert_eq!(value, 120.0);

        // a sample exactly at the evaluation time is outside the window
        let (_, value) = single(
            harness
                .instant(r#"http_requests_total{job="api"}"#, BASE + 120 * SECOND)
                .await
                .unwrap(),
        );
        assert_eq!(value, 110.0);
    }

    #[tokio::test]
    async fn test_offset_and_at_modifiers() {
        let harness = Harness::new();
        let (_, value) = single(
            harness
                .instant(r#"http_requests_total{job="api"} offset 30s"#, T)
                .await
                .unwrap(),
        );
        assert_eq!(value, 90.0);

        let (_, value) = single(
            harness
                .instant(r#"http_requests_total{job="api"} @ 1700000050"#, T)
                .await
                .unwrap(),
        );
        assert_eq!(value, 40.0);
    }

    #[tokio::test]
    async fn test_instant_rate() {
        let harness = Harness::new();
        let (labels, value) = single(harness.instant(r#"rate(http_requests_total{job="api"}[1m])"#, T).await.unwrap());
        assert_eq!(labels, job("api"));
        assert_close(value, 1.0);

        let (_, value) = single(
            harness
                .instant(r#"increase(http_requests_total{job="web"}[1m])"#, T)
                .await
                .unwrap(),
        );
        assert_close(value, 12.0);
    }

    #[tokio::test]
    async fn test_range_rate_shares_buckets() {
        let harness = Harness::new();
        let value = harness
            .range(
                "rate(http_requests_total[1m])",
                BASE + 100 * SECOND,
                BASE + 120 * SECOND,
                10 * SECOND,
            )
            .await
            .unwrap();
        let steps = steps(value);
        assert_eq!(steps.len(), 3);
        for step in steps {
            assert_eq!(step.len(), 2);
            assert_eq!(step[0].labels, job("api"));
            assert_close(step[0].value, 1.0);
            assert_eq!(step[1].labels, job("web"));
            assert_close(step[1].value, 0.2);
        }
    }

    #[tokio::test]
    async fn test_subquery() {
        let harness = Harness::new();
        // inner steps at +100s, +110s and +120s see 90, 100 and 110
        let (labels, value) = single(
            harness
                .instant(r#"max_over_time(http_requests_total{job="api"}[30s:10s])"#, T)
                .await
                .unwrap(),
        );
        assert_eq!(labels, job("api"));
        assert_eq!(value, 110.0);

        let (_, value) = single(
            harness
                .instant(r#"count_over_time(http_requests_total{job="api"}[30s:10s])"#, T)
                .await
                .unwrap(),
        );
        assert_eq!(value, 3.0);
    }

    #[tokio::test]
    async fn test_histogram_quantile() {
        let harness = Harness::new();
        let (labels, value) = single(harness.instant("histogram_quantile(0.5, latency_bucket)", T).await.unwrap());
        assert_eq!(labels, job("api"));
        assert_close(value, 0.75);
    }

    #[tokio::test]
    async fn test_time_scalar_vector() {
        let harness = Harness::new();
        assert_eq!(
            harness.instant("time()", T).await.unwrap(),
            Value::Scalar(vec![1_700_000_125.0])
        );

        assert_eq!(
            harness.instant(r#"scalar(http_requests_total{job="web"})"#, T).await.unwrap(),
            Value::Scalar(vec![24.0])
        );
        let Value::Scalar(values) = harness.instant("scalar(http_requests_total)", T).await.unwrap() else {
            panic!("expected a scalar");
        };
        assert!(values[0].is_nan());

        let (labels, value) = single(harness.instant("vector(3)", T).await.unwrap());
        assert!(labels.is_empty());
        assert_eq!(value, 3.0);
    }

    #[tokio::test]
    async fn test_unary_minus_drops_name() {
        let harness = Harness::new();
        let (labels, value) = single(harness.instant(r#"-http_requests_total{job="api"}"#, T).await.unwrap());
        assert_eq!(labels, job("api"));
        assert_eq!(value, -120.0);
    }

    #[tokio::test]
    async fn test_math_and_binary() {
        let harness = Harness::new();
        let (_, value) = single(
            harness
                .instant(
                    r#"http_requests_total{job="api"} - ignoring(job) http_requests_total{job="web"}"#,
                    T,
                )
                .await
                .unwrap(),
        );
        assert_eq!(value, 96.0);

        let (labels, value) = single(harness.instant(r#"sqrt(http_requests_total{job="web"} * 6)"#, T).await.unwrap());
        assert_eq!(labels, job("web"));
        assert_eq!(value, 12.0);
    }

    #[tokio::test]
    async fn test_unsupported_function() {
        let harness = Harness::new();
        let err = harness
            .instant("predict_linear(http_requests_total[1m], 60)", T)
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::parse("unsupported function \"predict_linear\""));
    }

    #[tokio::test]
    async fn test_unknown_metric_is_empty() {
        let harness = Harness::new();
        let steps = steps(harness.instant("missing_metric", T).await.unwrap());
        assert_eq!(steps, vec![Vec::new()]);
    }

    #[tokio::test]
    async fn test_clamp_and_label_functions() {
        let harness = Harness::new();
        let (labels, value) = single(harness.instant(r#"clamp_max(http_requests_total{job="api"}, 50)"#, T).await.unwrap());
        assert_eq!(labels, job("api"));
        assert_eq!(value, 50.0);

        let (_, value) = single(harness.instant(r#"clamp(http_requests_total{job="web"}, 30, 40)"#, T).await.unwrap());
        assert_eq!(value, 30.0);

        let (labels, _) = single(
            harness
                .instant(r#"label_replace(http_requests_total{job="api"}, "service", "svc-$1", "job", "(.*)")"#, T)
                .await
                .unwrap(),
        );
        assert_eq!(labels.get("service"), Some("svc-api"));
        assert_eq!(labels.metric_name(), Some("http_requests_total"));

        let (labels, _) = single(
            harness
                .instant(r#"label_join(http_requests_total{job="web"}, "key", ":", "job", "job")"#, T)
                .await
                .unwrap(),
        );
        assert_eq!(labels.get("key"), Some("web:web"));
    }

    #[tokio::test]
    async fn test_label_functions_reject_bad_arguments() {
        let harness = Harness::new();
        let err = harness
            .instant(r#"label_replace(http_requests_total, "job", "x", "job", ".*")"#, T)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)), "{err:?}");

        let err = harness
            .instant(r#"label_replace(http_requests_total, "job", "x", "job", "(")"#, T)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)), "{err:?}");
    }
}

#[cfg(test)]
mod tests {
    use crate::error::EngineError;
    use crate::eval::{
        eval_clamp, eval_label_join, eval_label_replace, is_valid_label_name, Function, InstantVector,
        StepSample,
    };
    use crate::labels::Labels;
    use std::sync::Arc;
    use test_case::test_case;

    fn sample(pairs: &[(&str, &str)], value: f64) -> StepSample {
        StepSample::new(Arc::new(Labels::from_pairs(pairs)), value)
    }

    fn values(vector: &InstantVector) -> Vec<f64> {
        vector.iter().map(|s| s.value).collect()
    }

    fn disk_usage() -> Vec<InstantVector> {
        vec![vec![
            sample(&[("__name__", "disk_used"), ("device", "sda1"), ("host", "db-1")], -5.0),
            sample(&[("__name__", "disk_used"), ("device", "sdb1"), ("host", "db-2")], 50.0),
            sample(&[("__name__", "disk_used"), ("device", "nvme0"), ("host", "web-1")], 500.0),
        ]]
    }

    #[test]
    fn test_clamp_bounds_and_drops_name() {
        let steps = eval_clamp(disk_usage(), Some(&[0.0][..]), Some(&[100.0][..]));
        assert_eq!(values(&steps[0]), vec![0.0, 50.0, 100.0]);
        assert_eq!(steps[0][0].labels.metric_name(), None);
        assert_eq!(steps[0][0].labels.get("device"), Some("sda1"));

        let steps = eval_clamp(disk_usage(), Some(&[10.0][..]), None);
        assert_eq!(values(&steps[0]), vec![10.0, 50.0, 500.0]);

        let steps = eval_clamp(disk_usage(), None, Some(&[10.0][..]));
        assert_eq!(values(&steps[0]), vec![-5.0, 10.0, 10.0]);
    }

    #[test]
    fn test_clamp_per_step_bounds() {
        let steps = vec![vec![sample(&[("a", "x")], 7.0)], vec![sample(&[("a", "x")], 7.0)]];
        let steps = eval_clamp(steps, Some(&[0.0, 8.0][..]), Some(&[5.0, 10.0][..]));
        assert_eq!(values(&steps[0]), vec![5.0]);
        assert_eq!(values(&steps[1]), vec![8.0]);
    }

    #[test]
    fn test_clamp_min_above_max_is_empty() {
        let steps = eval_clamp(disk_usage(), Some(&[10.0][..]), Some(&[1.0][..]));
        assert!(steps[0].is_empty());
    }

    #[test]
    fn test_clamp_keeps_nan() {
        let steps = eval_clamp(vec![vec![sample(&[("a", "x")], f64::NAN)]], Some(&[0.0][..]), Some(&[1.0][..]));
        assert!(steps[0][0].value.is_nan());
    }

    #[test]
    fn test_label_replace_captures_group() {
        let steps = eval_label_replace(disk_usage(), "role", "$1", "host", "(.*)-\\d+").unwrap();
        let roles: Vec<_> = steps[0].iter().map(|s| s.labels.get("role")).collect();
        assert_eq!(roles, vec![Some("db"), Some("db"), Some("web")]);
        // the name survives
        assert_eq!(steps[0][0].labels.metric_name(), Some("disk_used"));
        assert_eq!(values(&steps[0]), vec![-5.0, 50.0, 500.0]);
    }

    #[test]
    fn test_label_replace_named_group_and_no_match() {
        let steps = eval_label_replace(disk_usage(), "disk", "${kind}", "device", "(?P<kind>sd)[a-z]1").unwrap();
        let disks: Vec<_> = steps[0].iter().map(|s| s.labels.get("disk")).collect();
        assert_eq!(disks, vec![Some("sd"), Some("sd"), None]);
        assert_eq!(steps[0][2].labels, Arc::new(Labels::from_pairs(&[
            ("__name__", "disk_used"),
            ("device", "nvme0"),
            ("host", "web-1"),
        ])));
    }

    #[test]
    fn test_label_replace_is_anchored() {
        // "db" alone does not match "db-1" once anchored
        let steps = eval_label_replace(disk_usage(), "role", "x", "host", "db").unwrap();
        assert!(steps[0].iter().all(|s| s.labels.get("role").is_none()));
    }

    #[test]
    fn test_label_replace_empty_result_removes_label() {
        let steps = eval_label_replace(disk_usage(), "host", "", "host", "web-.*").unwrap();
        assert_eq!(steps[0][2].labels.get("host"), None);
        assert_eq!(steps[0][0].labels.get("host"), Some("db-1"));
    }

    #[test]
    fn test_label_replace_missing_source_matches_empty() {
        let steps = eval_label_replace(disk_usage(), "zone", "default", "zone", "").unwrap();
        assert!(steps[0].iter().all(|s| s.labels.get("zone") == Some("default")));
    }

    #[test]
    fn test_label_replace_duplicate_labelsets() {
        // distinct devices keep the label sets apart
        assert!(eval_label_replace(disk_usage(), "host", "same", "host", ".*").is_ok());

        let err = eval_label_replace(disk_usage(), "device", "x", "device", ".*")
            .and_then(|steps| eval_label_replace(steps, "host", "y", "host", ".*"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Execution(_)), "{err:?}");
    }

    #[test_case("role", "(" ; "invalid regex")]
    #[test_case("1role", ".*" ; "invalid destination")]
    #[test_case("", ".*" ; "empty destination")]
    fn test_label_replace_rejects(dst: &str, pattern: &str) {
        let err = eval_label_replace(disk_usage(), dst, "$1", "host", pattern).unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)), "{err:?}");
    }

    #[test]
    fn test_label_join() {
        let sources = vec!["host".to_string(), "device".to_string()];
        let steps = eval_label_join(disk_usage(), "target", "/", &sources).unwrap();
        let targets: Vec<_> = steps[0].iter().map(|s| s.labels.get("target")).collect();
        assert_eq!(targets, vec![Some("db-1/sda1"), Some("db-2/sdb1"), Some("web-1/nvme0")]);
        assert_eq!(steps[0][0].labels.metric_name(), Some("disk_used"));
    }

    #[test]
    fn test_label_join_missing_sources() {
        let sources = vec!["rack".to_string(), "zone".to_string()];
        let steps = eval_label_join(disk_usage(), "host", "-", &sources).unwrap();
        // "-" is not empty, so host is overwritten
        assert!(steps[0].iter().all(|s| s.labels.get("host") == Some("-")));

        let steps = eval_label_join(disk_usage(), "host", "", &sources).unwrap();
        assert!(steps[0].iter().all(|s| s.labels.get("host").is_none()));
    }

    #[test]
    fn test_label_join_no_sources_removes_destination() {
        // the remaining hosts still differ
        let steps = eval_label_join(disk_usage(), "device", ",", &[]).unwrap();
        assert!(steps[0].iter().all(|s| s.labels.get("device").is_none()));
    }

    #[test_case("up", true)]
    #[test_case("_private", true)]
    #[test_case("a1_b2", true)]
    #[test_case("1a", false)]
    #[test_case("a-b", false)]
    #[test_case("", false)]
    fn test_label_name_validation(name: &str, valid: bool) {
        assert_eq!(is_valid_label_name(name), valid);
    }

    #[test_case("clamp", 3, true)]
    #[test_case("clamp", 2, false)]
    #[test_case("clamp_min", 2, true)]
    #[test_case("label_replace", 5, true)]
    #[test_case("label_replace", 4, false)]
    #[test_case("label_join", 3, true)]
    #[test_case("label_join", 6, true)]
    #[test_case("label_join", 2, false)]
    #[test_case("time", 1, false)]
    fn test_function_arity(name: &str, count: usize, ok: bool) {
        let func = Function::from_name(name).unwrap();
        assert_eq!(func.check_arity(name, count).is_ok(), ok);
    }
}

use crate::{Matrix, Property, With};
use oxpoll_common::error::Error;

fn sample(keys: &[&str], metric: &str, values: &[f64]) -> Matrix {
    let mut m = Matrix::new("poller.test.obj", "obj");
    for key in keys {
        m.new_instance(*key).unwrap();
    }
    m.new_metric_float64(metric).unwrap();
    for (key, value) in keys.iter().zip(values) {
        m.set_value(metric, key, *value).unwrap();
    }
    m
}

fn assert_aligned(m: &Matrix) {
    for (key, metric) in m.get_metrics() {
        assert_eq!(
            metric.len(),
            m.instance_len(),
            "metric {key} misaligned with instances"
        );
    }
}

#[test]
fn vectors_stay_aligned_through_mutation() {
    let mut m = Matrix::new("u", "vol");
    m.new_metric_float64("read_ops").unwrap();
    m.new_instance("a").unwrap();
    assert_aligned(&m);

    m.new_instance("b").unwrap();
    m.new_metric_float64("write_ops").unwrap();
    assert_aligned(&m);

    m.set_value("read_ops", "a", 1.0).unwrap();
    m.remove_instance("a");
    assert_aligned(&m);

    m.purge_instances();
    assert_aligned(&m);
    assert_eq!(m.instance_len(), 0);
}

#[test]
fn duplicate_keys_are_rejected() {
    let mut m = Matrix::new("u", "vol");
    m.new_instance("a").unwrap();
    assert!(matches!(
        m.new_instance("a"),
        Err(Error::DuplicateInstance(_))
    ));

    m.new_metric_float64("ops").unwrap();
    assert!(matches!(
        m.new_metric_float64("ops"),
        Err(Error::DuplicateMetric(_))
    ));
}

#[test]
fn removal_compacts_and_reindexes() {
    let mut m = sample(&["a", "b", "c"], "ops", &[1.0, 2.0, 3.0]);
    assert!(m.remove_instance("b"));
    assert!(!m.remove_instance("b"));

    assert_aligned(&m);
    assert_eq!(m.value("ops", "a"), Some(1.0));
    assert_eq!(m.value("ops", "c"), Some(3.0));

    // indices must stay dense so a fresh metric aligns
    m.new_metric_float64("latency").unwrap();
    m.set_value("latency", "c", 9.0).unwrap();
    assert_eq!(m.value("latency", "c"), Some(9.0));
}

#[test]
fn unset_cells_are_invalid_not_zero() {
    let mut m = Matrix::new("u", "vol");
    m.new_instance("a").unwrap();
    m.new_metric_float64("ops").unwrap();
    assert_eq!(m.value("ops", "a"), None);

    m.set_value("ops", "a", 0.0).unwrap();
    assert_eq!(m.value("ops", "a"), Some(0.0));

    m.reset();
    assert_eq!(m.value("ops", "a"), None);
    assert_aligned(&m);
}

#[test]
fn set_value_string_rejects_malformed_input() {
    let mut m = Matrix::new("u", "vol");
    m.new_instance("a").unwrap();
    m.new_metric_float64("ops").unwrap();

    m.set_value_string("ops", "a", " 42 ").unwrap();
    assert_eq!(m.value("ops", "a"), Some(42.0));

    let err = m.set_value_string("ops", "a", "4x2").unwrap_err();
    assert!(matches!(err, Error::Parse { .. }));
    // the previous value survives a failed parse
    assert_eq!(m.value("ops", "a"), Some(42.0));
}

#[test]
fn delta_of_monotone_counter_is_difference() {
    let prev = sample(&["a", "b"], "ops", &[100.0, 200.0]);
    let mut cur = sample(&["a", "b"], "ops", &[150.0, 260.0]);

    let wraps = cur.delta("ops", &prev).unwrap();
    assert_eq!(wraps, 0);
    assert_eq!(cur.value("ops", "a"), Some(50.0));
    assert_eq!(cur.value("ops", "b"), Some(60.0));
}

#[test]
fn delta_invalidates_on_wrap() {
    // previous=[100, 200], current=[150, 50]: the second counter wrapped
    let prev = sample(&["a", "b"], "ops", &[100.0, 200.0]);
    let mut cur = sample(&["a", "b"], "ops", &[150.0, 50.0]);

    let wraps = cur.delta("ops", &prev).unwrap();
    assert_eq!(wraps, 1);
    assert_eq!(cur.value("ops", "a"), Some(50.0));
    assert_eq!(cur.value("ops", "b"), None);
}

#[test]
fn delta_skips_rows_missing_on_either_side() {
    let prev = sample(&["a"], "ops", &[100.0]);
    let mut cur = sample(&["a", "new"], "ops", &[150.0, 7.0]);

    cur.delta("ops", &prev).unwrap();
    assert_eq!(cur.value("ops", "a"), Some(50.0));
    // no previous sample for the new row: skipped this cycle
    assert_eq!(cur.value("ops", "new"), None);
}

#[test]
fn divide_invalidates_on_zero_denominator() {
    let mut m = sample(&["a", "b"], "lat", &[100.0, 100.0]);
    m.new_metric_float64("ops").unwrap();
    m.set_value("ops", "a", 4.0).unwrap();
    m.set_value("ops", "b", 0.0).unwrap();

    m.divide("lat", "ops").unwrap();
    assert_eq!(m.value("lat", "a"), Some(25.0));
    assert_eq!(m.value("lat", "b"), None);
}

#[test]
fn divide_with_threshold_floors_quiet_denominators() {
    // numerator delta=[100, 100], denominator delta=[5, 50], threshold=10
    let mut m = sample(&["a", "b"], "lat", &[100.0, 100.0]);
    m.new_metric_float64("ops").unwrap();
    m.set_value("ops", "a", 5.0).unwrap();
    m.set_value("ops", "b", 50.0).unwrap();

    m.divide_with_threshold("lat", "ops", 10.0).unwrap();
    assert_eq!(m.value("lat", "a"), Some(0.0));
    assert_eq!(m.value("lat", "b"), Some(2.0));
}

#[test]
fn percent_equals_average_times_hundred() {
    let mut avg = sample(&["a", "b"], "busy", &[30.0, 75.0]);
    avg.new_metric_float64("base").unwrap();
    avg.set_value("base", "a", 60.0).unwrap();
    avg.set_value("base", "b", 100.0).unwrap();
    let mut pct = avg.clone_with(With::all());

    avg.divide("busy", "base").unwrap();

    pct.divide("busy", "base").unwrap();
    pct.multiply_by_scalar("busy", 100.0).unwrap();

    for key in ["a", "b"] {
        let a = avg.value("busy", key).unwrap();
        let p = pct.value("busy", key).unwrap();
        assert!((p - a * 100.0).abs() < f64::EPSILON * 100.0);
    }
}

#[test]
fn clone_without_data_keeps_shape() {
    let mut m = sample(&["a", "b"], "ops", &[1.0, 2.0]);
    m.set_global_label("cluster", "c1");
    m.get_instance_mut("a").unwrap().set_label("vol", "v0");

    let empty = m.clone_with(With {
        data: false,
        metrics: true,
        instances: true,
        export_instances: true,
    });

    assert_eq!(empty.instance_len(), 2);
    assert_eq!(empty.metric_len(), 1);
    assert_eq!(empty.value("ops", "a"), None);
    assert_eq!(empty.get_instance("a").unwrap().get_label("vol"), Some("v0"));
    assert_eq!(empty.global_labels(), m.global_labels());
    assert_aligned(&empty);
}

#[test]
fn clone_without_export_instances_clears_flags() {
    let m = sample(&["a"], "ops", &[1.0]);
    let hidden = m.clone_with(With {
        data: true,
        metrics: true,
        instances: true,
        export_instances: false,
    });
    assert!(!hidden.get_instance("a").unwrap().is_exportable());
    // the source is untouched
    assert!(m.get_instance("a").unwrap().is_exportable());
}

#[test]
fn property_parses_and_displays() {
    for (text, property) in [
        ("raw", Property::Raw),
        ("delta", Property::Delta),
        ("rate", Property::Rate),
        ("average", Property::Average),
        ("percent", Property::Percent),
    ] {
        assert_eq!(text.parse::<Property>().unwrap(), property);
        assert_eq!(property.to_string(), text);
    }
    assert!("bogus".parse::<Property>().is_err());
}

use quickstep::timeseries::{
    merge_matrix, merge_vector, MatrixData, MatrixEnvelope, SamplePair, SampleStream, TagSet,
    VectorData, VectorEnvelope, VectorSample,
};

fn tags(name: &str) -> TagSet {
    let mut metric = TagSet::new();
    metric.insert("__name__".to_string(), name.to_string());
    metric
}

fn stream(name: &str, points: &[(i64, f64)]) -> SampleStream {
    SampleStream {
        metric: tags(name),
        values: points
            .iter()
            .map(|(t, v)| SamplePair::new(*t, *v))
            .collect(),
    }
}

fn matrix(status: &str, streams: Vec<SampleStream>) -> MatrixEnvelope {
    MatrixEnvelope {
        status: status.to_string(),
        data: MatrixData {
            result_type: "matrix".to_string(),
            result: streams,
        },
    }
}

fn vector(status: &str, samples: Vec<(TagSet, i64, f64)>) -> VectorEnvelope {
    VectorEnvelope {
        status: status.to_string(),
        data: VectorData {
            result_type: "vector".to_string(),
            result: samples
                .into_iter()
                .map(|(metric, t, v)| VectorSample {
                    metric,
                    value: Some(SamplePair::new(t, v)),
                })
                .collect(),
        },
    }
}

fn assert_ascending(env: &MatrixEnvelope) {
    for series in &env.data.result {
        for pair in series.values.windows(2) {
            assert!(
                pair[0].timestamp < pair[1].timestamp,
                "points out of order: {} then {}",
                pair[0].timestamp,
                pair[1].timestamp
            );
        }
    }
}

#[test]
fn test_merge_appends_newer_points() {
    // Scenario: older {100,1},{200,2} + newer {300,3} with equal tags
    let older = matrix("success", vec![stream("a", &[(100, 1.0), (200, 2.0)])]);
    let newer = matrix("success", vec![stream("a", &[(300, 3.0)])]);
    let merged = merge_matrix(newer, older);
    assert_eq!(merged.data.result.len(), 1);
    assert_eq!(
        merged.data.result[0].values,
        vec![
            SamplePair::new(100, 1.0),
            SamplePair::new(200, 2.0),
            SamplePair::new(300, 3.0)
        ]
    );
    assert_ascending(&merged);
}

#[test]
fn test_merge_discards_overlapping_older_points() {
    let older = matrix(
        "success",
        vec![stream("a", &[(100, 1.0), (200, 2.0), (300, 9.0), (400, 9.0)])],
    );
    let newer = matrix("success", vec![stream("a", &[(300, 3.0), (400, 4.0)])]);
    let merged = merge_matrix(newer, older);
    assert_eq!(
        merged.data.result[0].values,
        vec![
            SamplePair::new(100, 1.0),
            SamplePair::new(200, 2.0),
            SamplePair::new(300, 3.0),
            SamplePair::new(400, 4.0)
        ]
    );
    assert_ascending(&merged);
}

#[test]
fn test_merge_extents_span_both_inputs() {
    let older = matrix("success", vec![stream("a", &[(100, 1.0), (200, 2.0)])]);
    let newer = matrix("success", vec![stream("a", &[(300, 3.0), (500, 5.0)])]);
    let merged = merge_matrix(newer, older);
    let extents = merged.extents();
    assert_eq!(extents.start, 100);
    assert_eq!(extents.end, 500);
}

#[test]
fn test_merge_keeps_new_series() {
    let older = matrix("success", vec![stream("a", &[(100, 1.0)])]);
    let newer = matrix(
        "success",
        vec![stream("a", &[(200, 2.0)]), stream("b", &[(200, 7.0)])],
    );
    let merged = merge_matrix(newer, older);
    assert_eq!(merged.data.result.len(), 2);
    let b = merged
        .data
        .result
        .iter()
        .find(|s| s.metric == tags("b"))
        .expect("new series kept");
    assert_eq!(b.values, vec![SamplePair::new(200, 7.0)]);
}

#[test]
fn test_merge_status_fallbacks() {
    let older = matrix("success", vec![stream("a", &[(100, 1.0)])]);
    let newer = matrix("error", vec![]);
    let merged = merge_matrix(newer, older.clone());
    assert_eq!(merged, older);

    let older_failed = matrix("error", vec![]);
    let newer_ok = matrix("success", vec![stream("a", &[(100, 1.0)])]);
    let merged = merge_matrix(newer_ok.clone(), older_failed);
    assert_eq!(merged, newer_ok);

    let both_failed = merge_matrix(matrix("error", vec![]), matrix("", vec![]));
    assert_eq!(both_failed.status, "");
}

#[test]
fn test_merge_vector_appends_strictly_newer_point() {
    let base = matrix("success", vec![stream("a", &[(100_000, 1.0)])]);
    let latest = vector("success", vec![(tags("a"), 161_500, 4.2)]);
    let merged = merge_vector(base, latest);
    // Quantized down to the whole second.
    assert_eq!(
        merged.data.result[0].values,
        vec![SamplePair::new(100_000, 1.0), SamplePair::new(161_000, 4.2)]
    );
}

#[test]
fn test_merge_vector_ignores_stale_point() {
    let base = matrix("success", vec![stream("a", &[(100_000, 1.0)])]);
    let latest = vector("success", vec![(tags("a"), 100_000, 4.2)]);
    let merged = merge_vector(base, latest);
    assert_eq!(merged.data.result[0].values.len(), 1);
}

#[test]
fn test_merge_vector_never_introduces_series() {
    let base = matrix("success", vec![stream("a", &[(100_000, 1.0)])]);
    let latest = vector("success", vec![(tags("brand_new"), 161_000, 4.2)]);
    let merged = merge_vector(base, latest);
    assert_eq!(merged.data.result.len(), 1);
    assert_eq!(merged.data.result[0].metric, tags("a"));
}

#[test]
fn test_crop_trims_leading_points() {
    // Scenario: points {99,199,299}, start=200, end=300 leaves {299}
    let mut env = matrix(
        "success",
        vec![stream("a", &[(99, 1.5), (199, 1.5), (299, 1.5)])],
    );
    env.crop_to_range(200, 300);
    assert_eq!(env.data.result[0].values, vec![SamplePair::new(299, 1.5)]);
}

#[test]
fn test_crop_trims_trailing_points() {
    let mut env = matrix(
        "success",
        vec![stream("a", &[(99, 1.5), (199, 1.5), (299, 1.5)])],
    );
    env.crop_to_range(0, 200);
    assert_eq!(
        env.data.result[0].values,
        vec![SamplePair::new(99, 1.5), SamplePair::new(199, 1.5)]
    );
}

#[test]
fn test_crop_zero_bounds_leave_everything() {
    let mut env = matrix("success", vec![stream("a", &[(99, 1.5), (199, 1.5)])]);
    let before = env.clone();
    env.crop_to_range(0, 0);
    assert_eq!(env, before);
}

#[test]
fn test_crop_drops_series_outside_range() {
    let mut env = matrix(
        "success",
        vec![
            stream("early", &[(100, 1.0)]),
            stream("late", &[(5000, 1.0)]),
        ],
    );
    env.crop_to_range(1000, 2000);
    assert!(env.data.result.is_empty());
}

#[test]
fn test_crop_is_idempotent() {
    let mut env = matrix(
        "success",
        vec![stream("a", &[(100, 1.0), (200, 2.0), (300, 3.0), (400, 4.0)])],
    );
    env.crop_to_range(200, 300);
    let once = env.clone();
    env.crop_to_range(200, 300);
    assert_eq!(env, once);
}

#[test]
fn test_extents_and_value_count() {
    let env = matrix(
        "success",
        vec![
            stream("a", &[(200, 1.0), (400, 2.0)]),
            stream("b", &[(100, 1.0), (300, 2.0)]),
            stream("empty", &[]),
        ],
    );
    let extents = env.extents();
    assert_eq!(extents.start, 100);
    assert_eq!(extents.end, 400);
    assert_eq!(env.value_count(), 4);

    let empty = matrix("success", vec![stream("empty", &[])]);
    assert!(empty.extents().is_unset());
}

#[test]
fn test_sample_pair_wire_format() {
    let parsed: MatrixEnvelope = serde_json::from_str(
        r#"{"status":"success","data":{"resultType":"matrix","result":[{"metric":{"__name__":"a"},"values":[[1544004600,"1.5"],[1544004660.5,"2"]]}]}}"#,
    )
    .unwrap();
    assert_eq!(
        parsed.data.result[0].values,
        vec![
            SamplePair::new(1_544_004_600_000, 1.5),
            SamplePair::new(1_544_004_660_500, 2.0)
        ]
    );

    let out = serde_json::to_string(&parsed).unwrap();
    assert!(out.contains(r#"[1544004600,"1.5"]"#));
    assert!(out.contains("1544004660.5"));

    let reparsed: MatrixEnvelope = serde_json::from_str(&out).unwrap();
    assert_eq!(reparsed, parsed);
}

//! End-to-end pipeline coverage: multiple chunks, KPI-on-KPI dependencies,
//! window carries, deferred conditionals, and report serialization.

use std::collections::BTreeMap;

use kpiflow::{
    AggValue, BatchProcess, Chunk, Compiler, KpiDefinition, ReportValue, Sample,
};

fn samples_1hz(start_ms: i64, values: &[f64]) -> Vec<Sample> {
    values
        .iter()
        .enumerate()
        .map(|(i, &v)| Sample::new(start_ms + i as i64 * 1_000, v))
        .collect()
}

fn run_batch(
    definitions: Vec<KpiDefinition>,
    chunks: &[Chunk],
) -> BTreeMap<String, ReportValue> {
    let mut batch = BatchProcess::new(definitions, &Compiler::new()).expect("batch");
    for chunk in chunks {
        batch.process_chunk(chunk).expect("chunk");
    }
    batch.report()
}

#[test]
fn chunked_processing_matches_a_single_pass() {
    let definitions = || {
        vec![
            KpiDefinition::new("windowed_avg", "average(window(sig, '3s'))"),
            KpiDefinition::new("running_mean", "average(sig)"),
            KpiDefinition::new("peak", "max(sig)"),
        ]
    };
    let values: Vec<f64> = (0..13).map(|i| f64::from(i) * 1.5 - 4.0).collect();

    let single = run_batch(
        definitions(),
        &[Chunk::new().with_signal("sig", samples_1hz(0, &values))],
    );
    let chunked = run_batch(
        definitions(),
        &[
            Chunk::new().with_signal("sig", samples_1hz(0, &values[..4])),
            Chunk::new().with_signal("sig", samples_1hz(4_000, &values[4..5])),
            Chunk::new().with_signal("sig", samples_1hz(5_000, &values[5..])),
        ],
    );

    assert_eq!(single, chunked);
}

#[test]
fn kpis_chain_through_aggregations_and_deferred_conditionals() {
    let definitions = vec![
        KpiDefinition::new("power", "sig * sig"),
        KpiDefinition::new("Mean_Power", "average(power)"),
        KpiDefinition::new("status", "1 if MEAN_power > 10 else 0"),
    ];
    let mut batch = BatchProcess::new(definitions, &Compiler::new()).expect("batch");
    assert_eq!(batch.order(), &["power", "Mean_Power", "status"]);

    batch
        .process_chunk(&Chunk::new().with_signal("sig", samples_1hz(0, &[1.0, 2.0, 3.0])))
        .expect("chunk");
    batch
        .process_chunk(&Chunk::new().with_signal("sig", samples_1hz(3_000, &[4.0, 5.0])))
        .expect("chunk");

    let report = batch.report();
    assert_eq!(
        report["power"],
        ReportValue::Series(samples_1hz(0, &[1.0, 4.0, 9.0, 16.0, 25.0]))
    );
    // (1 + 4 + 9 + 16 + 25) / 5 = 11, so the deferred conditional resolves
    // truthy only once both chunks are in.
    let ReportValue::Scalar(AggValue::Number(mean)) = &report["Mean_Power"] else {
        panic!("expected scalar mean");
    };
    assert!((mean - 11.0).abs() < 1e-12);
    assert_eq!(report["status"], ReportValue::Scalar(AggValue::Number(1.0)));
}

#[test]
fn window_carry_flows_through_the_scheduler() {
    let definitions = || vec![KpiDefinition::new("w", "min(window(sig, '2s'))")];

    // 1s cadence, 2s windows: seven samples leave the last one carried.
    let whole = run_batch(
        definitions(),
        &[Chunk::new().with_signal(
            "sig",
            samples_1hz(0, &[6.0, 5.0, 4.0, 3.0, 2.0, 1.0, 0.0]),
        )],
    );
    let split = run_batch(
        definitions(),
        &[
            Chunk::new().with_signal("sig", samples_1hz(0, &[6.0, 5.0, 4.0])),
            Chunk::new().with_signal("sig", samples_1hz(3_000, &[3.0, 2.0, 1.0, 0.0])),
        ],
    );

    let expected = ReportValue::Series(vec![
        Sample::new(0, 5.0),
        Sample::new(2_000, 3.0),
        Sample::new(4_000, 1.0),
    ]);
    assert_eq!(whole["w"], expected);
    assert_eq!(split["w"], expected);
}

#[test]
fn conditional_skips_leave_no_trace_in_the_report() {
    let definitions = vec![
        KpiDefinition::new("enabled", "0"),
        KpiDefinition::new("optional", "average(sig) if enabled else Nothing"),
        KpiDefinition::new("always", "sum(sig)"),
    ];
    let report = run_batch(
        definitions,
        &[Chunk::new().with_signal("sig", samples_1hz(0, &[2.0, 3.0]))],
    );

    assert!(!report.contains_key("optional"));
    assert_eq!(report["enabled"], ReportValue::Scalar(AggValue::Number(0.0)));
    assert_eq!(report["always"], ReportValue::Scalar(AggValue::Number(5.0)));
}

#[test]
fn required_inputs_name_only_raw_signals() {
    let definitions = vec![
        KpiDefinition::new("smooth", "average(window(raw, width))")
            .map_text("raw", "grid_voltage")
            .map_text("width", "5m"),
        KpiDefinition::new("drift", "smooth - nominal").map_number("nominal", 230.0),
        KpiDefinition::new("unrelated", "max(other_signal)"),
    ];
    let batch = BatchProcess::new(definitions, &Compiler::new()).expect("batch");

    let inputs = batch.required_inputs(&["drift"]).expect("inputs");
    assert_eq!(
        inputs.into_iter().collect::<Vec<_>>(),
        vec!["grid_voltage".to_owned()]
    );

    let all = batch
        .required_inputs(&["drift", "unrelated"])
        .expect("inputs");
    assert_eq!(
        all.into_iter().collect::<Vec<_>>(),
        vec!["grid_voltage".to_owned(), "other_signal".to_owned()]
    );
}

#[test]
fn harmonic_distortion_reports_as_a_scalar() {
    // 50 Hz fundamental sampled at 1 kHz over one second.
    let samples: Vec<Sample> = (0..1_000)
        .map(|i| {
            let t = f64::from(i) / 1_000.0;
            Sample::new(i64::from(i), (2.0 * std::f64::consts::PI * 50.0 * t).sin())
        })
        .collect();
    let definitions = vec![KpiDefinition::new("distortion", "thd(voltage, 50)")];
    let mut batch = BatchProcess::new(definitions, &Compiler::new()).expect("batch");
    batch
        .process_chunk(&Chunk::new().with_signal("voltage", samples))
        .expect("chunk");

    let report = batch.report();
    let ReportValue::Scalar(AggValue::Number(thd)) = &report["distortion"] else {
        panic!("expected scalar THD");
    };
    assert!(thd.abs() < 1e-6, "pure sine should have near-zero THD, got {thd}");
}

#[test]
fn report_round_trips_through_json() {
    let definitions = vec![
        KpiDefinition::new("series_out", "sig + 1"),
        KpiDefinition::new("scalar_out", "min(sig)"),
    ];
    let report = run_batch(
        definitions,
        &[Chunk::new().with_signal("sig", samples_1hz(0, &[1.0, 2.0]))],
    );

    let encoded = serde_json::to_string(&report).expect("encode");
    let decoded: BTreeMap<String, ReportValue> = serde_json::from_str(&encoded).expect("decode");
    assert_eq!(decoded, report);
}

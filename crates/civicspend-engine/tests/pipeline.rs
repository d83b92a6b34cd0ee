//! Cross-stage scenarios over an in-memory store.

use civicspend_core::{PipelineConfig, RawAward, RunStatus, Severity};
use civicspend_engine::{
    DetectMethod, EngineError, EvidenceAssembler, MlDetector, Pipeline, RobustStatisticalDetector,
    TimeSeriesAggregator, VendorResolver,
};
use civicspend_store::{DuckStore, StoreError};

const VENDORS: [&str; 12] = [
    "3M Company",
    "Target Corporation",
    "Best Buy Co",
    "General Mills",
    "UnitedHealth Group",
    "US Bank",
    "Medtronic",
    "Land O'Lakes",
    "CHS Inc",
    "Ecolab",
    "Ameriprise Financial",
    "Xcel Energy",
];

const AGENCIES: [&str; 3] = [
    "Department of Defense",
    "Department of Energy",
    "General Services Administration",
];

const SPIKE_VENDOR: usize = 3;
const SPIKE_MONTH: usize = 6;

/// 200 awards, 12 vendors, 12 months of 2023. Every vendor-month gets one or
/// two awards; amounts are split so monthly totals stay within a few percent
/// of the vendor's base, except one month of one vendor at 10×.
fn synthetic_awards(run_id: &str) -> Vec<RawAward> {
    let slots: Vec<(usize, usize)> = (0..200).map(|i| (i % 12, (i / 12) % 12)).collect();
    let per_slot = |v: usize, m: usize| slots.iter().filter(|&&s| s == (v, m)).count();

    slots
        .iter()
        .enumerate()
        .map(|(i, &(v, m))| {
            let base = 10_000.0 * (v + 1) as f64;
            let mut target = base * (1.0 + 0.02 * ((v + m) % 5) as f64);
            if v == SPIKE_VENDOR && m == SPIKE_MONTH {
                target *= 10.0;
            }
            // Alternate spellings that normalise to the same string.
            let name = if i % 3 == 0 {
                format!("{}.", VENDORS[v].to_uppercase())
            } else {
                VENDORS[v].to_string()
            };
            RawAward {
                run_id: run_id.into(),
                award_id: format!("AWD-{i:04}"),
                recipient_name: name,
                recipient_strong_id: None,
                awarding_agency: Some(AGENCIES[i % AGENCIES.len()].into()),
                action_date: Some(format!("2023-{:02}-{:02}", m + 1, 1 + i % 28)),
                obligation_amount: target / per_slot(v, m) as f64,
                place_of_performance: Some("MN".into()),
            }
        })
        .collect()
}

fn seeded_store(run_id: &str) -> DuckStore {
    let store = DuckStore::open().unwrap();
    store.create_run(run_id).unwrap();
    for award in synthetic_awards(run_id) {
        store.insert_raw_award(&award).unwrap();
    }
    store
}

#[test]
fn end_to_end_spike_is_found_and_explained() {
    let store = seeded_store("r1");
    let config = PipelineConfig::default();

    let vendors = VendorResolver::new(&store, config.fuzzy_threshold)
        .resolve_run("r1")
        .unwrap();
    assert!(vendors <= 12);
    assert_eq!(vendors, 12);

    let rows = TimeSeriesAggregator::new(&store).aggregate_run("r1").unwrap();
    assert_eq!(rows, 12 * 12);

    let anomalies = RobustStatisticalDetector::new(&store, config.robust.clone())
        .detect_run("r1")
        .unwrap();
    assert_eq!(anomalies.len(), 1, "{anomalies:?}");
    let spike = &anomalies[0];
    assert_eq!(spike.vendor_name.as_deref(), Some(VENDORS[SPIKE_VENDOR]));
    assert_eq!(spike.year_month.to_string(), "2023-07");
    assert!(matches!(spike.severity, Severity::Critical | Severity::High));

    let evidence = EvidenceAssembler::new(&store)
        .build_evidence("r1", &spike.vendor_id, spike.year_month, config.evidence.top_n)
        .unwrap();
    assert!(!evidence.is_empty());
    let total: f64 = evidence.iter().map(|e| e.amount).sum();
    assert!((total - spike.value).abs() < 1e-6);
    assert!(evidence.iter().all(|e| e.pct_of_month <= 100.0 && e.pct_of_month >= 0.0));
}

#[test]
fn resolution_and_aggregation_are_idempotent() {
    let store = seeded_store("r1");
    let config = PipelineConfig::default();

    let first = VendorResolver::new(&store, config.fuzzy_threshold)
        .resolve_run("r1")
        .unwrap();
    let mapping = store.award_vendor_map("r1").unwrap();
    let second = VendorResolver::new(&store, config.fuzzy_threshold)
        .resolve_run("r1")
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(store.vendor_count().unwrap(), first);
    assert_eq!(store.award_vendor_map("r1").unwrap(), mapping);

    let agg = TimeSeriesAggregator::new(&store);
    let rows = agg.aggregate_run("r1").unwrap();
    agg.aggregate_run("r1").unwrap();
    assert_eq!(store.monthly_row_count("r1").unwrap(), rows);
}

#[test]
fn first_month_rolling_mean_is_its_own_value() {
    let store = seeded_store("r1");
    Pipeline::new(&store, PipelineConfig::default())
        .run("r1", DetectMethod::Statistical)
        .unwrap();

    let rows = store.monthly_rows("r1").unwrap();
    let mut seen = std::collections::HashSet::new();
    for (row, _) in &rows {
        if seen.insert(row.vendor_id.clone()) {
            assert_eq!(row.rolling_3m_mean, row.obligation_sum);
            assert_eq!(row.rolling_3m_mad, 0.0);
        }
    }
    assert_eq!(seen.len(), 12);
}

#[test]
fn flat_vendor_is_never_flagged() {
    let store = DuckStore::open().unwrap();
    for m in 0..12 {
        store
            .insert_raw_award(&RawAward {
                run_id: "flat".into(),
                award_id: format!("F{m}"),
                recipient_name: "Steady Supplies".into(),
                recipient_strong_id: None,
                awarding_agency: None,
                action_date: Some(format!("2023-{:02}-15", m + 1)),
                obligation_amount: 250_000_000.0,
                place_of_performance: None,
            })
            .unwrap();
    }
    let found = Pipeline::new(&store, PipelineConfig::default())
        .run("flat", DetectMethod::Statistical)
        .unwrap();
    assert_eq!(found.statistical_anomalies, 0);
}

#[test]
fn strong_id_joins_differently_named_awards() {
    let store = DuckStore::open().unwrap();
    for (award_id, name) in [("S1", "Acme Widgets LLC"), ("S2", "ACME WIDGET MANUFACTURING CO")] {
        store
            .insert_raw_award(&RawAward {
                run_id: "r1".into(),
                award_id: award_id.into(),
                recipient_name: name.into(),
                recipient_strong_id: Some("UEI123456789".into()),
                awarding_agency: None,
                action_date: Some("2023-03-01".into()),
                obligation_amount: 1000.0,
                place_of_performance: None,
            })
            .unwrap();
    }
    let vendors = VendorResolver::new(&store, 85.0).resolve_run("r1").unwrap();
    assert_eq!(vendors, 1);
    let mapping = store.award_vendor_map("r1").unwrap();
    assert_eq!(mapping["S1"], mapping["S2"]);
}

#[test]
fn ml_lifecycle_across_runs() {
    let store = seeded_store("train");
    for award in synthetic_awards("score") {
        store.insert_raw_award(&award).unwrap();
    }
    let pipeline = Pipeline::new(&store, PipelineConfig::default());
    pipeline.resolve("train").unwrap();
    pipeline.aggregate("train").unwrap();

    let untrained = MlDetector::new(&store, PipelineConfig::default().ml);
    assert!(matches!(untrained.predict("train"), Err(EngineError::ModelNotTrained)));

    assert_eq!(pipeline.train("train").unwrap(), 144);

    // The model trained on one run scores another without refitting.
    pipeline.resolve("score").unwrap();
    pipeline.aggregate("score").unwrap();
    let found = pipeline
        .detect("score", DetectMethod::Ml, Some("train"))
        .unwrap();
    assert!(found.iter().all(|a| a.run_id == "score" && a.score < 0.0));

    let mut loaded = MlDetector::new(&store, PipelineConfig::default().ml);
    loaded.load("train").unwrap();
    assert!(loaded.predict("empty-run").unwrap().is_empty());
}

#[test]
fn full_run_persists_reports() {
    let store = seeded_store("r1");
    let pipeline = Pipeline::new(&store, PipelineConfig::default());
    let summary = pipeline.run("r1", DetectMethod::Both).unwrap();
    assert_eq!(summary.raw_awards, 200);
    assert_eq!(summary.vendors, 12);
    assert_eq!(summary.statistical_anomalies, 1);
    assert!(summary.ml_anomalies.is_some());

    let reports = pipeline.reports("r1").unwrap();
    assert!(!reports.is_empty());
    for report in &reports {
        assert!(report.context.is_some());
        let narrative = report.narrative.as_deref().unwrap();
        assert!(narrative.contains("not evidence of wrongdoing"));
    }
}

#[test]
fn completed_run_stays_frozen() {
    let store = seeded_store("r1");
    let pipeline = Pipeline::new(&store, PipelineConfig::default());
    pipeline.run("r1", DetectMethod::Statistical).unwrap();

    let late = RawAward {
        award_id: "AWD-LATE".into(),
        ..synthetic_awards("r1").remove(0)
    };
    assert!(matches!(
        store.insert_raw_award(&late),
        Err(StoreError::RunFinalized { .. })
    ));
    assert!(matches!(
        pipeline.run("r1", DetectMethod::Both),
        Err(EngineError::Store(StoreError::RunFinalized { .. }))
    ));

    let run = store.run("r1").unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.row_count_raw, 200);
    assert_eq!(store.raw_award_count("r1").unwrap(), 200);
}

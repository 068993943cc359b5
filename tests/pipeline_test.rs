//! End-to-end pipeline tests: ingest -> normalize -> analyze -> export on a
//! scratch dataset root.

use std::sync::Arc;

use concentra::concentration::NON_POSITIVE_TOTAL_ERROR;
use concentra::export::Exporter;
use concentra::models::ConcentrationRequest;
use concentra::pipeline::ExportKind;
use concentra::schema::PeriodGrain;
use concentra::{EngineError, Pipeline, Settings};

const MULTI_PERIOD_CSV: &[u8] = b"entity,revenue,year,month\n\
ACME,1000,2024,1\n\
BETA,500,2024,1\n\
ACME,250,2024,2\n\
GAMMA,750,2024,2\n";

fn test_pipeline() -> (tempfile::TempDir, Pipeline) {
    let dir = tempfile::tempdir().unwrap();
    let settings = Arc::new(Settings {
        datasets_path: dir.path().to_path_buf(),
        use_llm: false,
        ..Settings::default()
    });
    (dir, Pipeline::new(settings))
}

fn request(thresholds: Option<Vec<i64>>) -> ConcentrationRequest {
    ConcentrationRequest {
        group_by: "entity".to_string(),
        value: "revenue".to_string(),
        time_column: None,
        thresholds,
        run_llm: false,
    }
}

#[tokio::test]
async fn ingest_detects_year_month_grain() {
    let (_dir, pipeline) = test_pipeline();

    let upload = pipeline
        .ingest("sales.csv", MULTI_PERIOD_CSV, None)
        .await
        .unwrap();
    assert_eq!(upload.status, "completed");
    assert_eq!(upload.rows_processed, 4);
    assert_eq!(upload.columns_processed, 4);

    let schema = pipeline.schema(&upload.dataset_id).unwrap();
    assert_eq!(schema.period_grain, PeriodGrain::YearMonth);
    assert_eq!(
        schema.period_grain_candidates,
        vec![PeriodGrain::YearMonth, PeriodGrain::Year, PeriodGrain::None]
    );
    assert!(schema.time_candidates.contains(&"year".to_string()));
    assert!(schema.time_candidates.contains(&"month".to_string()));
    assert!(schema.column("period_key").is_some());
}

#[tokio::test]
async fn columnar_round_trip_is_stable() {
    let (dir, pipeline) = test_pipeline();
    let upload = pipeline
        .ingest("sales.csv", MULTI_PERIOD_CSV, None)
        .await
        .unwrap();

    let path = dir
        .path()
        .join(&upload.dataset_id)
        .join("normalized.parquet");
    let first = concentra::storage::read_columnar(&path).unwrap();
    let second = concentra::storage::read_columnar(&path).unwrap();

    assert!(first.equals_missing(&second));
    assert_eq!(first.height(), 4);
    let names = first.get_column_names();
    assert!(names.contains(&"entity"));
    assert!(names.contains(&"revenue"));
    assert!(names.contains(&"period_key"));
}

#[tokio::test]
async fn analysis_produces_periods_totals_and_exports() {
    let (_dir, pipeline) = test_pipeline();
    let upload = pipeline
        .ingest("sales.csv", MULTI_PERIOD_CSV, None)
        .await
        .unwrap();

    let doc = pipeline
        .analyze(&upload.dataset_id, &request(Some(vec![10, 50])))
        .await
        .unwrap();

    assert_eq!(doc.thresholds, vec![10, 50]);
    assert_eq!(doc.period_grain, PeriodGrain::YearMonth);
    let periods: Vec<&str> = doc.by_period.iter().map(|p| p.period.as_str()).collect();
    assert_eq!(periods, vec!["2024-M01", "2024-M02"]);

    // January: ACME 1000, BETA 500.
    let january = &doc.by_period[0];
    assert_eq!(january.total, 1500.0);
    assert_eq!(january.concentration[&10].count, 1);
    assert_eq!(january.concentration[&10].value, 1000.0);
    assert_eq!(january.concentration[&10].pct_of_total, 66.7);

    // TOTAL: ACME 1250, GAMMA 750, BETA 500; top entity holds exactly 50%.
    assert_eq!(doc.totals.total, 2500.0);
    assert_eq!(doc.totals.total_entities, Some(3));
    assert_eq!(doc.totals.concentration[&50].count, 1);
    assert_eq!(doc.totals.concentration[&50].value, 1250.0);

    // Sum over entities equals the reported total.
    let head_sum: f64 = doc
        .totals
        .head
        .iter()
        .filter_map(|row| row.get("revenue").and_then(|v| v.as_f64()))
        .sum();
    assert!((head_sum - doc.totals.total).abs() < 1e-9);

    let links = doc.export_links.as_ref().unwrap();
    assert_eq!(links.csv, "analyses/concentration.csv");
    assert!(pipeline
        .export_path(&upload.dataset_id, ExportKind::Csv)
        .is_ok());
    assert!(pipeline
        .export_path(&upload.dataset_id, ExportKind::Xlsx)
        .is_ok());

    // Completion markers cover both periods and the total.
    assert!(doc
        .computation_log
        .contains(&"concentration_calculation_2024-M01: completed".to_string()));
    assert!(doc
        .computation_log
        .contains(&"concentration_calculation_TOTAL: completed".to_string()));
}

#[tokio::test]
async fn csv_export_round_trips_against_result_document() {
    let (_dir, pipeline) = test_pipeline();
    let upload = pipeline
        .ingest("sales.csv", MULTI_PERIOD_CSV, None)
        .await
        .unwrap();
    let doc = pipeline
        .analyze(&upload.dataset_id, &request(Some(vec![10, 50])))
        .await
        .unwrap();

    let csv_path = pipeline
        .export_path(&upload.dataset_id, ExportKind::Csv)
        .unwrap();
    let rows = Exporter::parse_flat_csv(&csv_path).unwrap();

    let mut expected = Vec::new();
    for period in doc.by_period.iter().chain(std::iter::once(&doc.totals)) {
        for (threshold, metrics) in &period.concentration {
            expected.push((
                period.period.clone(),
                *threshold,
                metrics.count,
                metrics.value,
                metrics.pct_of_total,
            ));
        }
    }

    assert_eq!(rows.len(), expected.len());
    for (row, (period, threshold, count, value, pct)) in rows.iter().zip(&expected) {
        assert_eq!(&row.period, period);
        assert_eq!(row.threshold, *threshold);
        assert_eq!(row.count, *count);
        assert!((row.value - value).abs() < 1e-9);
        assert!((row.pct_of_total - pct).abs() < 1e-9);
    }
}

#[tokio::test]
async fn non_positive_period_reports_error_without_failing() {
    let (_dir, pipeline) = test_pipeline();
    let csv = b"entity,revenue,year,month\nA,-10,2024,1\nB,-5,2024,1\nC,100,2024,2\n";
    let upload = pipeline.ingest("sales.csv", csv, None).await.unwrap();

    let doc = pipeline
        .analyze(&upload.dataset_id, &request(None))
        .await
        .unwrap();

    let january = doc
        .by_period
        .iter()
        .find(|p| p.period == "2024-M01")
        .unwrap();
    assert_eq!(january.error.as_deref(), Some(NON_POSITIVE_TOTAL_ERROR));
    assert!(january.concentration.is_empty());
    assert!(january.head.is_empty());

    let february = doc
        .by_period
        .iter()
        .find(|p| p.period == "2024-M02")
        .unwrap();
    assert!(february.error.is_none());
    assert!(!doc
        .computation_log
        .contains(&"concentration_calculation_2024-M01: completed".to_string()));
}

#[tokio::test]
async fn unknown_columns_and_bad_thresholds_are_validation_errors() {
    let (_dir, pipeline) = test_pipeline();
    let upload = pipeline
        .ingest("sales.csv", MULTI_PERIOD_CSV, None)
        .await
        .unwrap();

    let mut bad_column = request(None);
    bad_column.group_by = "nope".to_string();
    let err = pipeline
        .analyze(&upload.dataset_id, &bad_column)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(err.to_string(), "Column 'nope' not found in dataset");

    let err = pipeline
        .analyze(&upload.dataset_id, &request(Some(vec![50, 10, 10, 120])))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    // Duplicates alone are fine and come back sorted and deduplicated.
    let doc = pipeline
        .analyze(&upload.dataset_id, &request(Some(vec![50, 10, 10])))
        .await
        .unwrap();
    assert_eq!(doc.thresholds, vec![10, 50]);
}

#[tokio::test]
async fn missing_and_malformed_dataset_ids() {
    let (_dir, pipeline) = test_pipeline();

    let err = pipeline.schema("ds_aaaaaaaaaaaa").unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    let err = pipeline
        .analyze("ds_../escape", &request(None))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = pipeline.export_path("not_an_id", ExportKind::Csv).unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn lineage_records_every_stage_in_order() {
    let (_dir, pipeline) = test_pipeline();
    let upload = pipeline
        .ingest("sales.csv", MULTI_PERIOD_CSV, None)
        .await
        .unwrap();
    pipeline
        .analyze(&upload.dataset_id, &request(None))
        .await
        .unwrap();

    let lineage = pipeline.lineage(&upload.dataset_id).unwrap();
    let operations: Vec<&str> = lineage.steps.iter().map(|s| s.operation.as_str()).collect();
    assert_eq!(
        operations,
        vec!["create", "ingest", "normalize", "analyze_concentration"]
    );
    for pair in lineage.steps.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[tokio::test]
async fn insights_surface_placeholders_when_disabled() {
    let (_dir, pipeline) = test_pipeline();
    let upload = pipeline
        .ingest("sales.csv", MULTI_PERIOD_CSV, None)
        .await
        .unwrap();

    let insights = pipeline.insights(&upload.dataset_id).unwrap();
    assert_eq!(insights.functions.len(), 5);
    for value in insights.functions.values() {
        assert_eq!(value["status"], "disabled");
    }
}

#[tokio::test]
async fn advisory_task_writes_artifacts_after_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Arc::new(Settings {
        datasets_path: dir.path().to_path_buf(),
        use_llm: true,
        openai_api_key: Some("dummy-api-key".to_string()),
        ..Settings::default()
    });
    let pipeline = Pipeline::new(settings);

    let upload = pipeline
        .ingest("sales.csv", MULTI_PERIOD_CSV, None)
        .await
        .unwrap();
    let mut req = request(None);
    req.run_llm = true;
    pipeline.analyze(&upload.dataset_id, &req).await.unwrap();

    // The advisory task is detached; poll briefly for its artifacts.
    let registry = pipeline.registry();
    let mut artifacts = 0;
    for _ in 0..50 {
        artifacts = registry.llm_call_count(&upload.dataset_id).unwrap();
        if artifacts >= 5 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(artifacts, 5);

    let insights = pipeline.insights(&upload.dataset_id).unwrap();
    assert!(insights
        .functions
        .values()
        .all(|v| v["status"] == "ok"));
}

#[tokio::test]
async fn spreadsheet_ingest_matches_csv_ingest() {
    let (dir, pipeline) = test_pipeline();

    // Build a workbook fixture with the storage writer itself.
    let sheet = polars::prelude::df![
        "entity" => ["ACME", "BETA"],
        "revenue" => ["1000", "500"]
    ]
    .unwrap();
    let xlsx_path = dir.path().join("fixture.xlsx");
    concentra::storage::write_spreadsheet(&[("Sheet1".to_string(), sheet)], &xlsx_path).unwrap();
    let bytes = std::fs::read(&xlsx_path).unwrap();

    let upload = pipeline.ingest("fixture.xlsx", &bytes, None).await.unwrap();
    assert_eq!(upload.rows_processed, 2);

    let doc = pipeline
        .analyze(&upload.dataset_id, &request(Some(vec![50])))
        .await
        .unwrap();
    assert_eq!(doc.totals.total, 1500.0);
    assert!(doc.by_period.is_empty());
}

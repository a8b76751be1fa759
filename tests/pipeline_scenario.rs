//! Escenarios de extremo a extremo con proveedores deterministas.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use legacy_migrator_rag::cancel::{cancel_pair, CancelSignal};
use legacy_migrator_rag::config::PipelineSettings;
use legacy_migrator_rag::mock::{MockBuilder, MockEmbedder, MockGenerator};
use legacy_migrator_rag::models::BuildDiagnostic;
use legacy_migrator_rag::planner::{ArchitecturePlan, TargetKind};
use legacy_migrator_rag::providers::TaskKind;
use legacy_migrator_rag::refine::{FailureReason, TerminalStatus};
use legacy_migrator_rag::session::SessionStore;
use legacy_migrator_rag::{MigrationError, MigrationPipeline};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const ORDERS_FORM: &str = r#"VERSION 5.00
Begin VB.Form frmOrders
   Caption = "Pedidos"
   Begin VB.CommandButton cmdLoad
      Caption = "Cargar"
   End
End
Attribute VB_Name = "frmOrders"
Private Sub cmdLoad_Click()
   Dim rs As Object
   Set rs = cn.Execute("SELECT * FROM orders")
   MsgBox Utils.FormatTotal(0)
End Sub
"#;

const UTILS_MODULE: &str = r#"Attribute VB_Name = "Utils"
Public Function FormatTotal(ByVal value As Double) As String
   FormatTotal = Format$(value, "0.00")
End Function
"#;

const MODEL_PATH: &str = "Models/Orders.cs";

struct Fixture {
    _dir: TempDir,
    project: std::path::PathBuf,
    sessions: std::path::PathBuf,
    output: std::path::PathBuf,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("legacy");
    std::fs::create_dir_all(&project).unwrap();
    std::fs::write(project.join("Orders.frm"), ORDERS_FORM).unwrap();
    std::fs::write(project.join("Utils.bas"), UTILS_MODULE).unwrap();
    Fixture {
        project,
        sessions: dir.path().join("sessions"),
        output: dir.path().join("out"),
        _dir: dir,
    }
}

fn pipeline(
    fx: &Fixture,
    embedder: MockEmbedder,
    generator: MockGenerator,
    builder: MockBuilder,
    max_repair_attempts: u32,
) -> MigrationPipeline {
    let settings = PipelineSettings::default()
        .with_max_repair_attempts(max_repair_attempts)
        .with_generation_workers(2)
        .with_output_dir(&fx.output);
    MigrationPipeline::new(
        Arc::new(embedder),
        Arc::new(generator),
        Arc::new(builder),
        settings,
        SessionStore::new(&fx.sessions),
    )
}

fn missing_namespace() -> BuildDiagnostic {
    BuildDiagnostic::error(
        MODEL_PATH,
        "The type or namespace name 'DataAnnotations' could not be found",
    )
    .with_code("CS0246")
}

#[tokio::test]
async fn analysis_yields_single_table_and_model() {
    let fx = fixture();
    let pipeline = pipeline(&fx, MockEmbedder::new(), MockGenerator::new(), MockBuilder::passing(), 3);

    let session = pipeline.analyze_directory(&fx.project).await.unwrap();

    assert_eq!(session.records.len(), 2);
    assert_eq!(session.schema.tables.len(), 1);
    assert_eq!(session.schema.tables[0].name, "orders");
    assert_eq!(session.plan.count(TargetKind::Model), 1);
    assert!(session.plan.descriptor(MODEL_PATH).is_some());
    assert!(session.graph.contains_edge("Orders.frm", "Utils.bas"));
    assert_eq!(session.summaries.len(), 2);
}

#[tokio::test]
async fn repair_touches_only_the_diagnosed_file() {
    let fx = fixture();
    let generator = MockGenerator::new();
    let builder = MockBuilder::with_rounds(vec![vec![missing_namespace()], vec![]]);
    let pipeline = pipeline(&fx, MockEmbedder::new(), generator.clone(), builder.clone(), 3);

    let session = pipeline.analyze_directory(&fx.project).await.unwrap();
    let report = pipeline
        .migrate(&session.id, None, &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Succeeded);
    assert_eq!(report.build_invocations, 2);
    assert_eq!(builder.invocations(), 2);

    let repairs: Vec<String> = generator
        .calls()
        .into_iter()
        .filter(|r| r.task == TaskKind::RepairFile)
        .filter_map(|r| r.target_path)
        .collect();
    assert_eq!(repairs, vec![MODEL_PATH.to_string()]);

    let snapshots = builder.snapshots();
    for (before, after) in snapshots[0].iter().zip(&snapshots[1]) {
        assert_eq!(before.path, after.path);
        if before.path != MODEL_PATH {
            assert_eq!(before, after);
        }
    }
    let model = report.file(MODEL_PATH).unwrap();
    assert!(model.source.contains("reparado"));

    let out = fx.output.join(&session.id);
    let written = std::fs::read_to_string(out.join(MODEL_PATH)).unwrap();
    assert_eq!(written, model.source);
    assert!(out.join("report.json").is_file());
}

#[tokio::test]
async fn persistent_failure_stops_after_budget() {
    let fx = fixture();
    let builder = MockBuilder::with_rounds(vec![vec![missing_namespace()]]);
    let pipeline = pipeline(&fx, MockEmbedder::new(), MockGenerator::new(), builder.clone(), 2);

    let session = pipeline.analyze_directory(&fx.project).await.unwrap();
    let report = pipeline
        .migrate(&session.id, None, &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::FailedAfterRetries);
    assert_eq!(report.reason, Some(FailureReason::RetryBudgetExhausted));
    assert_eq!(report.build_invocations, 3);
    assert_eq!(builder.invocations(), 3);
    assert_eq!(report.last_diagnostics, vec![missing_namespace()]);
}

#[tokio::test]
async fn edited_plan_round_trips_to_same_targets() {
    let fx = fixture();
    let pipeline = pipeline(&fx, MockEmbedder::new(), MockGenerator::new(), MockBuilder::passing(), 3);

    let session = pipeline.analyze_directory(&fx.project).await.unwrap();
    let json = session.plan.to_json().unwrap();
    let reloaded = ArchitecturePlan::from_json(&json).unwrap();
    assert_eq!(reloaded, session.plan);

    let report = pipeline
        .migrate(&session.id, Some(reloaded), &CancelSignal::never())
        .await
        .unwrap();

    assert_eq!(report.status, TerminalStatus::Succeeded);
    let generated: BTreeSet<String> = report.files.iter().map(|f| f.path.clone()).collect();
    assert_eq!(generated, session.plan.target_paths());
}

#[tokio::test]
async fn session_survives_reload() {
    let fx = fixture();
    let pipeline = pipeline(&fx, MockEmbedder::new(), MockGenerator::new(), MockBuilder::passing(), 3);

    let session = pipeline.analyze_directory(&fx.project).await.unwrap();
    let store = SessionStore::new(&fx.sessions);
    assert!(store.exists(&session.id));

    let (loaded, snapshot) = store.load(&session.id).await.unwrap();
    assert_eq!(loaded, session);
    assert_eq!(snapshot.entries.len(), 2);
    assert_eq!(snapshot.session_id, session.id);
}

#[tokio::test]
async fn index_failure_is_fatal_and_nothing_is_persisted() {
    let fx = fixture();
    let embedder = MockEmbedder::new().failing_on("Utils.bas");
    let pipeline = pipeline(&fx, embedder, MockGenerator::new(), MockBuilder::passing(), 3);

    let err = pipeline.analyze_directory(&fx.project).await.unwrap_err();
    assert!(matches!(err, MigrationError::Index(_)));
    assert!(!has_entries(&fx.sessions));
}

fn has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[tokio::test]
async fn cancelling_generation_writes_finished_files_and_reports_cancelled() {
    let fx = fixture();
    let generator = MockGenerator::new().with_latency(Duration::from_millis(200));
    let builder = MockBuilder::passing();
    let pipeline = pipeline(&fx, MockEmbedder::new(), generator, builder.clone(), 3);
    let session = pipeline.analyze_directory(&fx.project).await.unwrap();

    let (handle, signal) = cancel_pair();
    let canceller = tokio::spawn(async move {
        // dos tandas de dos ficheros terminan antes de cancelar
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.cancel();
    });
    let report = pipeline.migrate(&session.id, None, &signal).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(report.status, TerminalStatus::Cancelled);
    assert_eq!(report.build_invocations, 0);
    assert_eq!(builder.invocations(), 0);
    assert!(!report.files.is_empty());
    assert!(report.files.len() < session.plan.files.len());

    let out = fx.output.join(&session.id);
    assert!(out.join("report.json").is_file());
    for file in &report.files {
        let written = std::fs::read_to_string(out.join(&file.path)).unwrap();
        assert_eq!(written, file.source);
    }
}

//! Bucle de compilación y reparación.
//!
//! ```text
//! Building ──sin errores──▶ Succeeded
//!    │ errores atribuibles y quedan intentos
//!    ▼
//! Repairing ──▶ Building
//!    (errores no atribuibles o sin intentos) ──▶ Failed
//! ```
//!
//! Con un presupuesto de R reparaciones se compila como mucho R+1 veces.
//! Solo se reparan los ficheros señalados por errores; el resto no cambia.

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cancel::CancelSignal;
use crate::generator::{ContextGenerator, GenerationFailure};
use crate::models::{BuildDiagnostic, GeneratedFile};
use crate::planner::{TargetFileDescriptor, TargetKind};
use crate::pool::run_pool;
use crate::providers::Builder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Succeeded,
    FailedAfterRetries,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    RetryBudgetExhausted,
    UnattributableDiagnostics,
}

/// Resumen de una vuelta del bucle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefinementRound {
    pub build: u32,
    pub errors: usize,
    /// Ficheros enviados a reparar tras esta compilación.
    pub repaired: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub status: TerminalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    pub build_invocations: u32,
    pub repair_attempts: u32,
    pub files: Vec<GeneratedFile>,
    pub last_diagnostics: Vec<BuildDiagnostic>,
    /// Ficheros que no se pudieron generar, como diagnósticos.
    pub failed_files: Vec<BuildDiagnostic>,
    pub rounds: Vec<RefinementRound>,
}

impl MigrationReport {
    /// Informe de una migración cancelada antes de compilar.
    pub fn cancelled(files: Vec<GeneratedFile>, failures: &[GenerationFailure]) -> Self {
        Self {
            status: TerminalStatus::Cancelled,
            reason: None,
            build_invocations: 0,
            repair_attempts: 0,
            files,
            last_diagnostics: Vec::new(),
            failed_files: failures.iter().map(GenerationFailure::to_diagnostic).collect(),
            rounds: Vec::new(),
        }
    }

    pub fn file(&self, path: &str) -> Option<&GeneratedFile> {
        self.files.iter().find(|f| f.path == path)
    }
}

/// Estado interno del bucle.
enum LoopState {
    Building,
    Repairing(BTreeMap<String, Vec<BuildDiagnostic>>),
    Done(TerminalStatus, Option<FailureReason>),
}

pub struct RefinementLoop {
    generator: Arc<ContextGenerator>,
    builder: Arc<dyn Builder>,
    max_repair_attempts: u32,
    workers: usize,
}

impl RefinementLoop {
    pub fn new(
        generator: Arc<ContextGenerator>,
        builder: Arc<dyn Builder>,
        max_repair_attempts: u32,
        workers: usize,
    ) -> Self {
        Self {
            generator,
            builder,
            max_repair_attempts,
            workers: workers.max(1),
        }
    }

    pub async fn run(
        &self,
        initial: Vec<GeneratedFile>,
        generation_failures: &[GenerationFailure],
        cancel: &CancelSignal,
    ) -> MigrationReport {
        let mut files: IndexMap<String, GeneratedFile> =
            initial.into_iter().map(|f| (f.path.clone(), f)).collect();
        let mut builds = 0u32;
        let mut attempts = 0u32;
        let mut rounds: Vec<RefinementRound> = Vec::new();
        let mut last_diagnostics: Vec<BuildDiagnostic> = Vec::new();
        let mut state = LoopState::Building;

        let (status, reason) = loop {
            state = match state {
                LoopState::Done(status, reason) => break (status, reason),

                LoopState::Building => {
                    if cancel.is_cancelled() {
                        LoopState::Done(TerminalStatus::Cancelled, None)
                    } else {
                        builds += 1;
                        let snapshot: Vec<GeneratedFile> = files.values().cloned().collect();
                        let outcome = tokio::select! {
                            _ = cancel.cancelled() => None,
                            result = self.builder.build(&snapshot) => Some(result),
                        };
                        match outcome {
                            None => LoopState::Done(TerminalStatus::Cancelled, None),
                            Some(result) => {
                                let diagnostics = result.unwrap_or_else(|e| {
                                    warn!("Fallo al invocar el builder: {e}");
                                    vec![BuildDiagnostic::project_error(format!("builder: {e}"))]
                                });
                                last_diagnostics = diagnostics;
                                self.after_build(&files, &last_diagnostics, builds, attempts, &mut rounds)
                            }
                        }
                    }
                }

                LoopState::Repairing(implicated) => {
                    attempts += 1;
                    if let Some(round) = rounds.last_mut() {
                        round.repaired = implicated.keys().cloned().collect();
                    }
                    info!(attempt = attempts, files = implicated.len(), "Reparando ficheros");

                    let jobs: Vec<(TargetFileDescriptor, GeneratedFile, Vec<BuildDiagnostic>)> = implicated
                        .into_iter()
                        .filter_map(|(path, diagnostics)| {
                            let current = files.get(&path)?.clone();
                            let descriptor = self
                                .generator
                                .plan()
                                .descriptor(&path)
                                .cloned()
                                .unwrap_or_else(|| fallback_descriptor(&path));
                            Some((descriptor, current, diagnostics))
                        })
                        .collect();

                    let generator = Arc::clone(&self.generator);
                    let output = run_pool(jobs, self.workers, cancel, move |(descriptor, current, diagnostics)| {
                        let generator = Arc::clone(&generator);
                        async move { generator.repair(&descriptor, &current, &diagnostics).await }
                    })
                    .await;

                    for result in output.results.into_iter().flatten() {
                        match result {
                            Ok(file) => {
                                files.insert(file.path.clone(), file);
                            }
                            Err(failure) => {
                                warn!(path = %failure.path, "Reparación fallida, se conserva el fichero: {}", failure.message);
                            }
                        }
                    }

                    if output.cancelled {
                        LoopState::Done(TerminalStatus::Cancelled, None)
                    } else {
                        LoopState::Building
                    }
                }
            };
        };

        info!(
            ?status,
            builds,
            attempts,
            "Bucle de refinamiento terminado"
        );
        MigrationReport {
            status,
            reason,
            build_invocations: builds,
            repair_attempts: attempts,
            files: files.into_values().collect(),
            last_diagnostics,
            failed_files: generation_failures
                .iter()
                .map(GenerationFailure::to_diagnostic)
                .collect(),
            rounds,
        }
    }

    /// Decide la transición tras una compilación.
    fn after_build(
        &self,
        files: &IndexMap<String, GeneratedFile>,
        diagnostics: &[BuildDiagnostic],
        build: u32,
        attempts: u32,
        rounds: &mut Vec<RefinementRound>,
    ) -> LoopState {
        let errors: Vec<&BuildDiagnostic> = diagnostics.iter().filter(|d| d.is_error()).collect();
        rounds.push(RefinementRound {
            build,
            errors: errors.len(),
            repaired: Vec::new(),
        });
        if errors.is_empty() {
            return LoopState::Done(TerminalStatus::Succeeded, None);
        }

        let mut implicated: BTreeMap<String, Vec<BuildDiagnostic>> = BTreeMap::new();
        for diagnostic in errors {
            match diagnostic.path.as_deref().and_then(|p| resolve_path(files, p)) {
                Some(path) => implicated.entry(path).or_default().push(diagnostic.clone()),
                None => {
                    warn!(message = %diagnostic.message, "Diagnóstico no atribuible a ningún fichero");
                    return LoopState::Done(
                        TerminalStatus::FailedAfterRetries,
                        Some(FailureReason::UnattributableDiagnostics),
                    );
                }
            }
        }

        if attempts >= self.max_repair_attempts {
            return LoopState::Done(
                TerminalStatus::FailedAfterRetries,
                Some(FailureReason::RetryBudgetExhausted),
            );
        }
        LoopState::Repairing(implicated)
    }
}

/// Ruta de un diagnóstico dentro del conjunto generado: exacta, sin
/// distinguir mayúsculas, o como sufijo único de una ruta absoluta.
fn resolve_path(files: &IndexMap<String, GeneratedFile>, raw: &str) -> Option<String> {
    let normalized = raw.replace('\\', "/");
    let normalized = normalized.trim_start_matches("./");
    if files.contains_key(normalized) {
        return Some(normalized.to_string());
    }
    let lower = normalized.to_lowercase();
    if let Some(path) = files.keys().find(|k| k.to_lowercase() == lower) {
        return Some(path.clone());
    }
    let mut suffixed = files
        .keys()
        .filter(|k| lower.ends_with(&format!("/{}", k.to_lowercase())));
    match (suffixed.next(), suffixed.next()) {
        (Some(path), None) => Some(path.clone()),
        _ => None,
    }
}

/// Descriptor mínimo para ficheros que no están en el plan.
fn fallback_descriptor(path: &str) -> TargetFileDescriptor {
    TargetFileDescriptor::new(path.to_string(), TargetKind::Boilerplate, String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyGraph;
    use crate::index::AnalysisIndex;
    use crate::mock::{MockBuilder, MockEmbedder, MockGenerator};
    use crate::planner::ArchitecturePlan;
    use crate::providers::TaskKind;
    use crate::schema::SchemaModel;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn generator(mock: MockGenerator) -> Arc<ContextGenerator> {
        let plan = ArchitecturePlan::from_json(
            r#"{"project_name": "P", "files": [
                {"path": "A.cs", "kind": "service"},
                {"path": "B.cs", "kind": "service"}
            ]}"#,
        )
        .unwrap();
        Arc::new(ContextGenerator::new(
            Arc::new(mock),
            Arc::new(AnalysisIndex::new("s", Arc::new(MockEmbedder::new()))),
            Arc::new(SchemaModel::default()),
            Arc::new(plan),
            &DependencyGraph::default(),
            5,
        ))
    }

    fn initial() -> Vec<GeneratedFile> {
        vec![
            GeneratedFile::new("A.cs", "class A {"),
            GeneratedFile::new("B.cs", "class B {}"),
        ]
    }

    #[tokio::test]
    async fn exhausts_budget_after_r_plus_one_builds() {
        let builder = MockBuilder::with_rounds(vec![vec![BuildDiagnostic::error("A.cs", "CS1513: } expected")]]);
        let refine = RefinementLoop::new(generator(MockGenerator::new()), Arc::new(builder.clone()), 2, 2);
        let report = refine.run(initial(), &[], &CancelSignal::never()).await;

        assert_eq!(report.status, TerminalStatus::FailedAfterRetries);
        assert_eq!(report.reason, Some(FailureReason::RetryBudgetExhausted));
        assert_eq!(report.build_invocations, 3);
        assert_eq!(report.repair_attempts, 2);
        assert_eq!(builder.invocations(), 3);
        assert_eq!(report.last_diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn succeeds_after_one_repair_and_leaves_other_files_untouched() {
        let builder = MockBuilder::with_rounds(vec![
            vec![
                BuildDiagnostic::error("A.cs", "CS1513"),
                BuildDiagnostic {
                    severity: crate::models::Severity::Warning,
                    ..BuildDiagnostic::error("B.cs", "CS0168")
                },
            ],
            vec![],
        ]);
        let mock = MockGenerator::new().with_response(TaskKind::RepairFile, "A.cs", "class A {}");
        let refine = RefinementLoop::new(generator(mock.clone()), Arc::new(builder.clone()), 3, 2);
        let report = refine.run(initial(), &[], &CancelSignal::never()).await;

        assert_eq!(report.status, TerminalStatus::Succeeded);
        assert_eq!(report.build_invocations, 2);
        assert_eq!(report.repair_attempts, 1);
        assert_eq!(report.file("A.cs").unwrap().source, "class A {}");
        assert_eq!(report.file("B.cs").unwrap().source, "class B {}");
        // las advertencias no provocan reparaciones
        assert_eq!(mock.call_count(TaskKind::RepairFile), 1);
        assert_eq!(report.rounds[0].repaired, vec!["A.cs".to_string()]);
        assert_eq!(builder.snapshots()[1][0].source, "class A {}");
    }

    #[tokio::test]
    async fn unattributable_diagnostics_fail_immediately() {
        let builder = MockBuilder::with_rounds(vec![vec![
            BuildDiagnostic::error("A.cs", "CS1513"),
            BuildDiagnostic::project_error("MSB4025: proyecto corrupto"),
        ]]);
        let refine = RefinementLoop::new(generator(MockGenerator::new()), Arc::new(builder), 3, 2);
        let report = refine.run(initial(), &[], &CancelSignal::never()).await;
        assert_eq!(report.status, TerminalStatus::FailedAfterRetries);
        assert_eq!(report.reason, Some(FailureReason::UnattributableDiagnostics));
        assert_eq!(report.build_invocations, 1);
        assert_eq!(report.repair_attempts, 0);
    }

    #[tokio::test]
    async fn unknown_paths_and_builder_errors_are_unattributable() {
        let outside = MockBuilder::with_rounds(vec![vec![BuildDiagnostic::error("Z.cs", "CS0246")]]);
        let refine = RefinementLoop::new(generator(MockGenerator::new()), Arc::new(outside), 3, 1);
        let report = refine.run(initial(), &[], &CancelSignal::never()).await;
        assert_eq!(report.reason, Some(FailureReason::UnattributableDiagnostics));

        let refine = RefinementLoop::new(generator(MockGenerator::new()), Arc::new(MockBuilder::failing()), 3, 1);
        let report = refine.run(initial(), &[], &CancelSignal::never()).await;
        assert_eq!(report.reason, Some(FailureReason::UnattributableDiagnostics));
        assert_eq!(report.build_invocations, 1);
    }

    #[tokio::test]
    async fn zero_budget_builds_once() {
        let builder = MockBuilder::with_rounds(vec![vec![BuildDiagnostic::error("A.cs", "CS1513")]]);
        let refine = RefinementLoop::new(generator(MockGenerator::new()), Arc::new(builder), 0, 1);
        let report = refine.run(initial(), &[], &CancelSignal::never()).await;
        assert_eq!(report.build_invocations, 1);
        assert_eq!(report.reason, Some(FailureReason::RetryBudgetExhausted));
    }

    #[tokio::test]
    async fn absolute_diagnostic_paths_resolve_by_suffix() {
        let builder = MockBuilder::with_rounds(vec![
            vec![BuildDiagnostic::error("C:\\work\\temp_migration\\A.cs", "CS1513")],
            vec![],
        ]);
        let refine = RefinementLoop::new(generator(MockGenerator::new()), Arc::new(builder), 1, 1);
        let report = refine.run(initial(), &[], &CancelSignal::never()).await;
        assert_eq!(report.status, TerminalStatus::Succeeded);
    }

    #[tokio::test]
    async fn cancellation_during_build_stops_loop() {
        let (handle, signal) = crate::cancel::cancel_pair();
        let builder = MockBuilder::passing().with_latency(Duration::from_secs(30));
        let refine = RefinementLoop::new(generator(MockGenerator::new()), Arc::new(builder), 3, 1);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });
        let report = refine.run(initial(), &[], &signal).await;
        assert_eq!(report.status, TerminalStatus::Cancelled);
        assert_eq!(report.files.len(), 2);
    }

    #[tokio::test]
    async fn generation_failures_are_listed() {
        let failure = GenerationFailure {
            path: "C.cs".into(),
            message: "timeout".into(),
        };
        let refine = RefinementLoop::new(generator(MockGenerator::new()), Arc::new(MockBuilder::passing()), 3, 1);
        let report = refine.run(initial(), &[failure], &CancelSignal::never()).await;
        assert_eq!(report.status, TerminalStatus::Succeeded);
        assert_eq!(report.failed_files[0].path.as_deref(), Some("C.cs"));
    }
}

//! Orquestación de extremo a extremo.
//!
//! Fase de análisis: ingesta → grafo → esquema → análisis por fichero →
//! índice → plan, y se persiste la sesión. Fase de migración: carga la
//! sesión, genera el proyecto destino, lo refina contra el compilador y
//! escribe el resultado en `output_dir/<sesión>/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::analysis::FileAnalyzer;
use crate::cancel::CancelSignal;
use crate::config::PipelineSettings;
use crate::error::Result;
use crate::generator::ContextGenerator;
use crate::graph::DependencyGraph;
use crate::index::AnalysisIndex;
use crate::ingest::ingest_directory;
use crate::models::{FileRecord, Omission};
use crate::planner::{plan_architecture, ArchitecturePlan};
use crate::providers::{Builder, Embedder, Generator};
use crate::refine::{MigrationReport, RefinementLoop};
use crate::schema::{infer_schema, QueryFragment};
use crate::session::{AnalysisSession, SessionStore};

const REPORT_FILE: &str = "report.json";

pub struct MigrationPipeline {
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    builder: Arc<dyn Builder>,
    settings: PipelineSettings,
    store: SessionStore,
}

impl MigrationPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        builder: Arc<dyn Builder>,
        settings: PipelineSettings,
        store: SessionStore,
    ) -> Self {
        Self {
            embedder,
            generator,
            builder,
            settings,
            store,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Analiza un directorio VB6 y persiste la sesión resultante.
    pub async fn analyze_directory(&self, root: &Path) -> Result<AnalysisSession> {
        let outcome = ingest_directory(root)?;
        self.analyze_records(&root.display().to_string(), outcome.records, outcome.omissions)
            .await
    }

    /// Igual que `analyze_directory` pero con registros ya ingeridos.
    /// Si el índice falla, la sesión no se guarda.
    pub async fn analyze_records(
        &self,
        project_root: &str,
        records: Vec<FileRecord>,
        mut omissions: Vec<Omission>,
    ) -> Result<AnalysisSession> {
        let graph = DependencyGraph::build(&records);
        omissions.extend(graph.omissions().iter().cloned());
        info!(
            "Grafo de dependencias: {} nodos, {} aristas",
            graph.node_count(),
            graph.edge_count()
        );

        let inference = infer_schema(&QueryFragment::collect(&records));
        omissions.extend(inference.omissions);
        let schema = inference.model;
        info!("Esquema inferido: {} tablas", schema.tables.len());

        let analyzer = FileAnalyzer::new(Arc::clone(&self.generator), &self.settings);
        let summaries = analyzer.analyze_all(&records).await;

        let id = AnalysisSession::new_id();
        let mut index = AnalysisIndex::new(&id, Arc::clone(&self.embedder));
        let indexed = index.index(&summaries).await?;
        info!("Índice de análisis: {indexed} entradas");

        let plan = plan_architecture(&records, &summaries, &schema, &graph, &self.settings);
        info!("Plan de arquitectura: {} ficheros destino", plan.files.len());

        let session = AnalysisSession {
            id,
            created_at: Utc::now(),
            project_root: project_root.to_string(),
            records,
            graph,
            schema,
            summaries,
            plan,
            omissions,
        };
        self.store.save(&session, &index.snapshot()).await?;
        Ok(session)
    }

    /// Migra una sesión guardada. `plan_override` sustituye al plan de la
    /// sesión (se valida antes de generar).
    pub async fn migrate(
        &self,
        session_id: &str,
        plan_override: Option<ArchitecturePlan>,
        cancel: &CancelSignal,
    ) -> Result<MigrationReport> {
        let (session, snapshot) = self.store.load(session_id).await?;
        let plan = match plan_override {
            Some(plan) => {
                plan.validate()?;
                info!("Usando plan editado con {} ficheros", plan.files.len());
                plan
            }
            None => session.plan.clone(),
        };

        let index = AnalysisIndex::restore(snapshot, Arc::clone(&self.embedder));
        let generator = Arc::new(ContextGenerator::new(
            Arc::clone(&self.generator),
            Arc::new(index),
            Arc::new(session.schema.clone()),
            Arc::new(plan),
            &session.graph,
            self.settings.rag_top_k,
        )
        .with_legacy_sources(&session.records));

        let workers = self.settings.generation_workers;
        let batch = generator.generate_all(workers, cancel).await;
        info!(
            "Generación: {} ficheros, {} fallidos",
            batch.files.len(),
            batch.failures.len()
        );

        let report = if batch.cancelled {
            warn!("Migración cancelada durante la generación");
            MigrationReport::cancelled(batch.files, &batch.failures)
        } else {
            RefinementLoop::new(
                generator,
                Arc::clone(&self.builder),
                self.settings.max_repair_attempts,
                workers,
            )
            .run(batch.files, &batch.failures, cancel)
            .await
        };

        let out_dir = self.write_output(&session.id, &report).await?;
        info!(status = ?report.status, "Migración terminada; resultado en {}", out_dir.display());
        Ok(report)
    }

    async fn write_output(&self, session_id: &str, report: &MigrationReport) -> Result<PathBuf> {
        let out_dir = self.settings.output_dir.join(session_id);
        for file in &report.files {
            let target = out_dir.join(&file.path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &file.source).await?;
        }
        tokio::fs::create_dir_all(&out_dir).await?;
        let json = serde_json::to_vec_pretty(report).map_err(std::io::Error::other)?;
        tokio::fs::write(out_dir.join(REPORT_FILE), json).await?;
        Ok(out_dir)
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use legacy_migrator_rag::build::DotnetBuilder;
use legacy_migrator_rag::cancel::cancel_pair;
use legacy_migrator_rag::config::AppConfig;
use legacy_migrator_rag::llm::{RigEmbedder, RigGenerator};
use legacy_migrator_rag::neo4j_client;
use legacy_migrator_rag::pipeline::MigrationPipeline;
use legacy_migrator_rag::planner::{plan_schema, ArchitecturePlan};
use legacy_migrator_rag::refine::TerminalStatus;
use legacy_migrator_rag::session::SessionStore;

#[derive(Parser)]
#[command(name = "legacy_migrator_rag")]
#[command(about = "Migra proyectos VB6 a un servicio .NET con análisis, RAG y reparación guiada por el compilador")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analiza un directorio VB6 y guarda la sesión
    Analyze {
        /// Directorio raíz del proyecto legado
        path: PathBuf,
    },
    /// Muestra (o exporta) el plan de arquitectura de una sesión
    Plan {
        session: String,
        /// Fichero donde escribir el plan en JSON
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Imprime el JSON Schema del plan de arquitectura
    PlanSchema,
    /// Genera, compila y repara el proyecto destino de una sesión
    Migrate {
        session: String,
        /// Plan editado que sustituye al de la sesión
        #[arg(short, long)]
        plan: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // 2. Cargar configuración
    let cfg = AppConfig::from_env().context("Error al cargar la configuración")?;
    let store = SessionStore::new(&cfg.sessions_dir);

    match cli.command {
        Command::PlanSchema => {
            let schema = plan_schema().context("No se pudo generar el esquema del plan")?;
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }

        Command::Plan { session, out } => {
            let (session, _) = store
                .load(&session)
                .await
                .with_context(|| format!("No se pudo cargar la sesión {session}"))?;
            let json = session.plan.to_json()?;
            match out {
                Some(path) => {
                    tokio::fs::write(&path, json)
                        .await
                        .with_context(|| format!("No se pudo escribir {}", path.display()))?;
                    info!("Plan escrito en {}", path.display());
                }
                None => println!("{json}"),
            }
        }

        Command::Analyze { path } => {
            let pipeline = build_pipeline(&cfg, store);
            let session = pipeline
                .analyze_directory(&path)
                .await
                .with_context(|| format!("Falló el análisis de {}", path.display()))?;

            for omission in &session.omissions {
                warn!("Omisión en {}: {}", omission.file, omission.detail);
            }

            if let Some(neo4j) = &cfg.neo4j {
                let graph = neo4j_client::connect(neo4j)
                    .await
                    .context("Error conectando a Neo4j")?;
                neo4j_client::ensure_schema(&graph)
                    .await
                    .context("Error asegurando el esquema de Neo4j")?;
                neo4j_client::export_session(&graph, &session)
                    .await
                    .context("Error volcando la sesión a Neo4j")?;
            }

            println!("{}", session.id);
        }

        Command::Migrate { session, plan } => {
            let plan_override = match plan {
                Some(path) => {
                    let raw = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("No se pudo leer {}", path.display()))?;
                    Some(ArchitecturePlan::from_json(&raw)?)
                }
                None => None,
            };

            // Ctrl-C cancela la migración
            let (handle, signal) = cancel_pair();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Señal de interrupción recibida, cancelando la migración");
                    handle.cancel();
                }
            });

            let pipeline = build_pipeline(&cfg, store);
            let report = pipeline
                .migrate(&session, plan_override, &signal)
                .await
                .with_context(|| format!("Falló la migración de la sesión {session}"))?;

            info!(
                "Estado final: {:?} ({} compilaciones, {} reparaciones)",
                report.status, report.build_invocations, report.repair_attempts
            );
            for diagnostic in report.last_diagnostics.iter().chain(&report.failed_files) {
                warn!(
                    "{}: {}",
                    diagnostic.path.as_deref().unwrap_or("<proyecto>"),
                    diagnostic.message
                );
            }
            if report.status != TerminalStatus::Succeeded {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn build_pipeline(cfg: &AppConfig, store: SessionStore) -> MigrationPipeline {
    MigrationPipeline::new(
        Arc::new(RigEmbedder::from_config(cfg)),
        Arc::new(RigGenerator::from_config(cfg)),
        Arc::new(DotnetBuilder::new(&cfg.build_command, &cfg.build_work_dir)),
        cfg.pipeline.clone(),
        store,
    )
}

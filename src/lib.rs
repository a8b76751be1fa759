//! Migración de proyectos VB6 a .NET: análisis estático, índice RAG,
//! planificación de arquitectura, generación contextual y bucle de
//! reparación guiado por el compilador.

pub mod analysis;
pub mod build;
pub mod cancel;
pub mod config;
pub mod error;
pub mod generator;
pub mod graph;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod mock;
pub mod models;
pub mod neo4j_client;
pub mod pipeline;
pub mod planner;
pub mod pool;
pub mod providers;
pub mod refine;
pub mod schema;
pub mod session;

pub use error::{MigrationError, Result};
pub use pipeline::MigrationPipeline;

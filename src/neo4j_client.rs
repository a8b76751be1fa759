//! Volcado opcional del grafo de análisis a Neo4j para inspección.
//!
//! Nodos `:LegacyFile` y `:Table`; relaciones `REFERENCES` (dependencias del
//! grafo) y `QUERIES` (fichero que consulta una tabla).

use anyhow::{Context, Result};
use neo4rs::{query, Graph};
use tracing::info;
use url::Url;

use crate::config::Neo4jConfig;
use crate::session::AnalysisSession;

pub async fn connect(cfg: &Neo4jConfig) -> Result<Graph> {
    let url = Url::parse(&cfg.uri).with_context(|| format!("NEO4J_URI inválida: {}", cfg.uri))?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.user, &cfg.password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

pub async fn ensure_schema(graph: &Graph) -> Result<()> {
    let statements = [
        "CREATE CONSTRAINT legacy_file_id IF NOT EXISTS
         FOR (f:LegacyFile)
         REQUIRE (f.session, f.path) IS UNIQUE",
        "CREATE CONSTRAINT table_id IF NOT EXISTS
         FOR (t:Table)
         REQUIRE (t.session, t.name) IS UNIQUE",
    ];
    for stmt in statements {
        graph.run(query(stmt)).await?;
    }
    Ok(())
}

/// Escribe la sesión completa en una sola transacción.
pub async fn export_session(graph: &Graph, session: &AnalysisSession) -> Result<()> {
    let txn = graph.start_txn().await?;

    for record in &session.records {
        txn.run(
            query(
                "MERGE (f:LegacyFile {session: $session, path: $path})
                 SET f.kind = $kind, f.routines = $routines",
            )
            .param("session", session.id.clone())
            .param("path", record.path.clone())
            .param("kind", format!("{:?}", record.kind))
            .param("routines", record.facts.routines.len() as i64),
        )
        .await?;
    }

    for (from, to) in session.graph.edges() {
        txn.run(
            query(
                "MATCH (a:LegacyFile {session: $session, path: $from})
                 MATCH (b:LegacyFile {session: $session, path: $to})
                 MERGE (a)-[:REFERENCES]->(b)",
            )
            .param("session", session.id.clone())
            .param("from", from.to_string())
            .param("to", to.to_string()),
        )
        .await?;
    }

    for table in &session.schema.tables {
        let columns: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
        txn.run(
            query(
                "MERGE (t:Table {session: $session, name: $name})
                 SET t.columns = $columns",
            )
            .param("session", session.id.clone())
            .param("name", table.name.clone())
            .param("columns", columns),
        )
        .await?;

        for file in &table.source_files {
            txn.run(
                query(
                    "MATCH (f:LegacyFile {session: $session, path: $path})
                     MATCH (t:Table {session: $session, name: $name})
                     MERGE (f)-[:QUERIES]->(t)",
                )
                .param("session", session.id.clone())
                .param("path", file.clone())
                .param("name", table.name.clone()),
            )
            .await?;
        }
    }

    txn.commit().await?;
    info!(
        "Sesión {} volcada a Neo4j: {} ficheros, {} tablas",
        session.id,
        session.records.len(),
        session.schema.tables.len()
    );
    Ok(())
}

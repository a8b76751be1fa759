//! Persistencia de sesiones de análisis en disco.
//!
//! Cada sesión vive en `<root>/<uuid>/` con dos ficheros: `analysis.json`
//! (registros, grafo, esquema, resúmenes y plan) e `index.json` (instantánea
//! del índice de embeddings).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SessionError;
use crate::graph::DependencyGraph;
use crate::index::IndexSnapshot;
use crate::models::{AnalysisSummary, FileRecord, Omission};
use crate::planner::ArchitecturePlan;
use crate::schema::SchemaModel;

const ANALYSIS_FILE: &str = "analysis.json";
const INDEX_FILE: &str = "index.json";

/// Todo lo que produce el análisis de un proyecto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub project_root: String,
    pub records: Vec<FileRecord>,
    pub graph: DependencyGraph,
    pub schema: SchemaModel,
    pub summaries: Vec<AnalysisSummary>,
    pub plan: ArchitecturePlan,
    #[serde(default)]
    pub omissions: Vec<Omission>,
}

impl AnalysisSession {
    pub fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, id: &str) -> Result<PathBuf, SessionError> {
        // un uuid válido no puede escapar del directorio raíz
        let parsed = Uuid::parse_str(id).map_err(|_| SessionError::InvalidId(id.to_string()))?;
        Ok(self.root.join(parsed.to_string()))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.session_dir(id)
            .map(|dir| dir.join(ANALYSIS_FILE).is_file())
            .unwrap_or(false)
    }

    pub async fn save(&self, session: &AnalysisSession, index: &IndexSnapshot) -> Result<PathBuf, SessionError> {
        let dir = self.session_dir(&session.id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let analysis = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(dir.join(ANALYSIS_FILE), analysis).await?;
        let snapshot = serde_json::to_vec(index)?;
        tokio::fs::write(dir.join(INDEX_FILE), snapshot).await?;

        info!("Sesión {} guardada en {}", session.id, dir.display());
        Ok(dir)
    }

    pub async fn load(&self, id: &str) -> Result<(AnalysisSession, IndexSnapshot), SessionError> {
        let dir = self.session_dir(id)?;
        let analysis_path = dir.join(ANALYSIS_FILE);
        if !tokio::fs::try_exists(&analysis_path).await.unwrap_or(false) {
            return Err(SessionError::NotFound(id.to_string()));
        }

        let bytes = tokio::fs::read(&analysis_path).await?;
        let session: AnalysisSession = serde_json::from_slice(&bytes)?;

        let index_path = dir.join(INDEX_FILE);
        let snapshot = if tokio::fs::try_exists(&index_path).await.unwrap_or(false) {
            serde_json::from_slice(&tokio::fs::read(&index_path).await?)?
        } else {
            debug!(session = id, "Sesión sin índice; se usa uno vacío");
            IndexSnapshot {
                session_id: session.id.clone(),
                ..IndexSnapshot::default()
            }
        };
        Ok((session, snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::EmbeddingEntry;
    use pretty_assertions::assert_eq;

    fn sample_session() -> AnalysisSession {
        let records: Vec<FileRecord> =
            vec![FileRecord::from_source("Utils.bas", "Public Function Total() As Long\nEnd Function\n").unwrap()];
        AnalysisSession {
            id: AnalysisSession::new_id(),
            created_at: Utc::now(),
            project_root: "/legacy".into(),
            graph: DependencyGraph::build(&records),
            records,
            schema: SchemaModel::default(),
            summaries: vec![AnalysisSummary {
                file: "Utils.bas".into(),
                purpose: "Utilidades".into(),
                ..AnalysisSummary::default()
            }],
            plan: ArchitecturePlan {
                project_name: "App".into(),
                root_namespace: "App".into(),
                files: Vec::new(),
            },
            omissions: vec![Omission::new("Utils.bas", "referencia colgante")],
        }
    }

    #[tokio::test]
    async fn round_trips_session_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let session = sample_session();
        let snapshot = IndexSnapshot {
            session_id: session.id.clone(),
            dimension: Some(2),
            entries: vec![EmbeddingEntry {
                file: "Utils.bas".into(),
                text: "Utilidades".into(),
                vector: vec![0.6, 0.8],
            }],
        };

        store.save(&session, &snapshot).await.unwrap();
        assert!(store.exists(&session.id));

        let (loaded, loaded_index) = store.load(&session.id).await.unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded_index, snapshot);
    }

    #[tokio::test]
    async fn rejects_invalid_and_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let err = store.load("../etc").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidId(_)));

        let missing = AnalysisSession::new_id();
        let err = store.load(&missing).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
        assert!(!store.exists(&missing));
    }
}

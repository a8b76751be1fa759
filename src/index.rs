//! Índice de análisis en memoria para recuperación semántica (RAG).
//!
//! Guarda un embedding por resumen de análisis y devuelve los `k` más
//! parecidos a una consulta por similitud coseno. Una instancia por sesión;
//! se persiste como `IndexSnapshot` y se restaura con otro embedder.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::IndexError;
use crate::models::AnalysisSummary;
use crate::providers::Embedder;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingEntry {
    pub file: String,
    pub text: String,
    pub vector: Vec<f64>,
}

/// Entrada recuperada con su puntuación.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedContext {
    pub file: String,
    pub text: String,
    pub score: f64,
}

/// Forma serializable del índice (sin el embedder).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub session_id: String,
    pub dimension: Option<usize>,
    pub entries: Vec<EmbeddingEntry>,
}

pub struct AnalysisIndex {
    session_id: String,
    embedder: Arc<dyn Embedder>,
    entries: Vec<EmbeddingEntry>,
    dimension: Option<usize>,
}

impl AnalysisIndex {
    pub fn new(session_id: impl Into<String>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            session_id: session_id.into(),
            embedder,
            entries: Vec::new(),
            dimension: None,
        }
    }

    pub fn restore(snapshot: IndexSnapshot, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            session_id: snapshot.session_id,
            embedder,
            entries: snapshot.entries,
            dimension: snapshot.dimension,
        }
    }

    pub fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            session_id: self.session_id.clone(),
            dimension: self.dimension,
            entries: self.entries.clone(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[EmbeddingEntry] {
        &self.entries
    }

    /// Indexa los resúmenes. Todo o nada: si un embedding falla o no cuadra
    /// la dimensión, el índice queda como estaba.
    pub async fn index(&mut self, summaries: &[AnalysisSummary]) -> Result<usize, IndexError> {
        let mut dimension = self.dimension;
        let mut batch = Vec::with_capacity(summaries.len());

        for summary in summaries {
            let text = summary.corpus_text();
            let vector = self.embedder.embed(&text).await?;
            if vector.is_empty() {
                return Err(IndexError::EmptyVector(summary.file.clone()));
            }
            match dimension {
                Some(expected) if expected != vector.len() => {
                    return Err(IndexError::DimensionMismatch {
                        file: summary.file.clone(),
                        expected,
                        found: vector.len(),
                    });
                }
                Some(_) => {}
                None => dimension = Some(vector.len()),
            }
            batch.push(EmbeddingEntry {
                file: summary.file.clone(),
                text,
                vector,
            });
        }

        let added = batch.len();
        self.entries.extend(batch);
        self.dimension = dimension;
        info!(
            session = %self.session_id,
            "Indexados {} resúmenes (total {}).",
            added,
            self.entries.len()
        );
        Ok(added)
    }

    /// Las `k` entradas más similares a `query`, de mayor a menor. Empates
    /// por orden de inserción. Con el índice vacío no se llama al embedder.
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedContext>, IndexError> {
        if self.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self.embedder.embed(query).await?;
        if let Some(expected) = self.dimension {
            if query_vec.len() != expected {
                return Err(IndexError::DimensionMismatch {
                    file: "<consulta>".to_string(),
                    expected,
                    found: query_vec.len(),
                });
            }
        }

        let mut scored: Vec<(usize, f64)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(pos, entry)| (pos, cosine_similarity(&query_vec, &entry.vector)))
            .collect();
        // sort_by es estable: a igual puntuación se mantiene el orden de inserción
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);

        debug!(query_len = query.len(), hits = scored.len(), "Recuperación RAG");
        Ok(scored
            .into_iter()
            .map(|(pos, score)| {
                let entry = &self.entries[pos];
                RetrievedContext {
                    file: entry.file.clone(),
                    text: entry.text.clone(),
                    score,
                }
            })
            .collect())
    }
}

pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockEmbedder;
    use pretty_assertions::assert_eq;

    fn summary(file: &str, purpose: &str) -> AnalysisSummary {
        AnalysisSummary {
            file: file.to_string(),
            purpose: purpose.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_index_never_calls_embedder() {
        let embedder = MockEmbedder::new();
        let index = AnalysisIndex::new("s", Arc::new(embedder.clone()));
        assert!(index.retrieve("orders", 5).await.unwrap().is_empty());
        assert_eq!(embedder.call_count(), 0);
    }

    #[tokio::test]
    async fn retrieve_is_bounded_ranked_and_stable() {
        let mut index = AnalysisIndex::new("s", Arc::new(MockEmbedder::new()));
        index
            .index(&[
                summary("Billing.bas", "invoice printing"),
                summary("Orders.frm", "orders grid customer orders"),
                summary("Utils.bas", "string helpers"),
            ])
            .await
            .unwrap();

        let first = index.retrieve("orders customer", 2).await.unwrap();
        let second = index.retrieve("orders customer", 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].file, "Orders.frm");
        assert_eq!(first, second);
        assert!(first[0].score >= first[1].score);
        assert_eq!(index.retrieve("orders", 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn ties_keep_insertion_order() {
        let mut index = AnalysisIndex::new("s", Arc::new(MockEmbedder::new()));
        index
            .index(&[summary("B.bas", "same"), summary("A.bas", "same")])
            .await
            .unwrap();
        // consulta sin palabras: vector nulo, todas las puntuaciones empatan a 0
        let hits = index.retrieve("¿?", 2).await.unwrap();
        let files: Vec<&str> = hits.iter().map(|h| h.file.as_str()).collect();
        assert_eq!(files, vec!["B.bas", "A.bas"]);
    }

    #[tokio::test]
    async fn dimension_mismatch_aborts_without_partial_entries() {
        let embedder = MockEmbedder::new().with_dimension(8).with_dimension_for("ODD", 4);
        let mut index = AnalysisIndex::new("s", Arc::new(embedder));
        index.index(&[summary("A.bas", "ok")]).await.unwrap();

        let err = index
            .index(&[summary("B.bas", "fine"), summary("C.bas", "ODD")])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { expected: 8, found: 4, .. }));
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn provider_error_is_fatal() {
        let mut index = AnalysisIndex::new("s", Arc::new(MockEmbedder::new().failing_on("BOOM")));
        let err = index.index(&[summary("A.bas", "BOOM")]).await.unwrap_err();
        assert!(matches!(err, IndexError::Embedding(_)));
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn snapshot_restores_entries() {
        let mut index = AnalysisIndex::new("abc", Arc::new(MockEmbedder::new()));
        index.index(&[summary("A.bas", "orders")]).await.unwrap();
        let json = serde_json::to_string(&index.snapshot()).unwrap();
        let snapshot: IndexSnapshot = serde_json::from_str(&json).unwrap();
        let restored = AnalysisIndex::restore(snapshot, Arc::new(MockEmbedder::new()));
        assert_eq!(restored.session_id(), "abc");
        assert_eq!(restored.entries(), index.entries());
        assert_eq!(restored.retrieve("orders", 1).await.unwrap()[0].file, "A.bas");
    }
}

//! Análisis por fichero: produce exactamente un `AnalysisSummary` por cada
//! `FileRecord`, que después alimenta el índice RAG.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::PipelineSettings;
use crate::models::{AnalysisSummary, FileKind, FileRecord};
use crate::providers::{GenerationRequest, Generator, TaskKind};

/// Caracteres de código que se guardan en el resumen como extracto.
const EXCERPT_CHARS: usize = 4000;

pub struct FileAnalyzer {
    generator: Arc<dyn Generator>,
    char_limit: usize,
    workers: usize,
}

impl FileAnalyzer {
    pub fn new(generator: Arc<dyn Generator>, settings: &PipelineSettings) -> Self {
        Self {
            generator,
            char_limit: settings.analysis_char_limit,
            workers: settings.analysis_workers.max(1),
        }
    }

    /// Analiza todos los registros conservando su orden.
    pub async fn analyze_all(&self, records: &[FileRecord]) -> Vec<AnalysisSummary> {
        let summaries: Vec<AnalysisSummary> = stream::iter(records)
            .map(|record| self.analyze(record))
            .buffered(self.workers)
            .collect()
            .await;
        info!("Análisis completado: {} resúmenes.", summaries.len());
        summaries
    }

    /// Nunca falla: ante cualquier error del proveedor se recurre al resumen
    /// heurístico construido con los hechos del fichero.
    pub async fn analyze(&self, record: &FileRecord) -> AnalysisSummary {
        if record.kind == FileKind::BinaryResource {
            return heuristic_summary(record);
        }

        let mut source = record.content.clone();
        if source.chars().count() > self.char_limit {
            debug!(file = %record.path, "Fichero largo, se resume antes de analizar");
            let request = GenerationRequest::new(
                TaskKind::SummarizeSource,
                json!({ "file": record.path, "content": record.content }),
            );
            match self.generator.generate(&request).await {
                Ok(condensed) => source = condensed,
                Err(e) => {
                    warn!(file = %record.path, "No se pudo resumir el fichero: {e}");
                    source = truncate_chars(&record.content, self.char_limit);
                }
            }
        }

        let request = GenerationRequest::new(
            TaskKind::AnalyzeFile,
            json!({
                "file": record.path,
                "kind": record.kind,
                "content": source,
                "facts": record.facts,
                "dependencies": record.dependencies,
            }),
        );

        let parsed = match self.generator.generate(&request).await {
            Ok(text) => {
                let summary = parse_summary(&text);
                if summary.is_none() {
                    warn!(file = %record.path, "Respuesta de análisis no es JSON válido; se usa el resumen heurístico");
                }
                summary
            }
            Err(e) => {
                warn!(file = %record.path, "Fallo del proveedor al analizar: {e}");
                None
            }
        };

        match parsed {
            Some(summary) => merge_with_facts(summary, record, &source),
            None => heuristic_summary(record),
        }
    }
}

/// Busca el primer objeto JSON de la respuesta (con o sin bloque ```json).
pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let unfenced = match trimmed.find("```") {
        Some(start) => {
            let after = &trimmed[start + 3..];
            let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
            let body = &after[body_start..];
            body.find("```").map(|end| &body[..end]).unwrap_or(body)
        }
        None => trimmed,
    };
    let open = unfenced.find('{')?;
    let close = unfenced.rfind('}')?;
    (close > open).then(|| &unfenced[open..=close])
}

pub fn parse_summary(text: &str) -> Option<AnalysisSummary> {
    let block = extract_json_object(text)?;
    serde_json::from_str(block).ok()
}

/// El fichero y los hechos estáticos mandan sobre lo que diga el modelo.
fn merge_with_facts(mut summary: AnalysisSummary, record: &FileRecord, source: &str) -> AnalysisSummary {
    let fallback = heuristic_summary(record);
    summary.file = record.path.clone();
    if summary.purpose.trim().is_empty() {
        summary.purpose = fallback.purpose;
    }
    if summary.functionality.trim().is_empty() {
        summary.functionality = fallback.functionality;
    }
    if summary.dependencies.is_empty() {
        summary.dependencies = fallback.dependencies;
    }
    if summary.controls.is_empty() {
        summary.controls = fallback.controls;
    }
    if summary.events.is_empty() {
        summary.events = fallback.events;
    }
    for query in fallback.queries {
        if !summary.queries.contains(&query) {
            summary.queries.push(query);
        }
    }
    for (key, value) in fallback.target_hints {
        summary.target_hints.entry(key).or_insert(value);
    }
    summary.source_excerpt = truncate_chars(source, EXCERPT_CHARS);
    summary
}

/// Resumen construido solo con los hechos extraídos en la ingesta.
pub fn heuristic_summary(record: &FileRecord) -> AnalysisSummary {
    let facts = &record.facts;
    let mut hints = BTreeMap::new();
    for control in facts.controls.iter().filter(|c| c.is_timer()) {
        hints.insert(control.name.clone(), "BackgroundService".to_string());
    }
    if record.kind.is_ui() {
        hints.insert(record.stem().to_string(), "Controller + Razor View".to_string());
    }
    if !facts.queries.is_empty() {
        hints.insert("ADODB".to_string(), "Entity Framework Core".to_string());
    }

    let routines: Vec<&str> = facts.routines.iter().map(|r| r.name.as_str()).collect();
    let functionality = if routines.is_empty() {
        format!("{} eventos, {} consultas", facts.events.len(), facts.queries.len())
    } else {
        format!("Rutinas: {}", routines.join(", "))
    };

    let controls = facts
        .controls
        .iter()
        .map(|c| format!("{} ({})", c.name, c.kind))
        .collect();

    AnalysisSummary {
        file: record.path.clone(),
        purpose: format!("{:?} {}", record.kind, record.stem()),
        functionality,
        dependencies: record.dependencies.clone(),
        target_hints: hints,
        controls,
        events: facts.events.clone(),
        queries: facts.queries.clone(),
        source_excerpt: truncate_chars(&record.content, EXCERPT_CHARS),
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGenerator;
    use pretty_assertions::assert_eq;

    const TIMER_FORM: &str = r#"VERSION 5.00
Begin VB.Form frmPoll
   Begin VB.Timer tmrPoll
      Interval        =   5000
   End
End
Private Sub tmrPoll_Timer()
   rs.Open "SELECT * FROM orders"
End Sub
"#;

    fn analyzer(generator: MockGenerator, limit: usize) -> FileAnalyzer {
        let settings = PipelineSettings::default().with_analysis_char_limit(limit);
        FileAnalyzer::new(Arc::new(generator), &settings)
    }

    #[test]
    fn json_is_found_inside_fences_and_prose() {
        let text = "Claro:\n```json\n{\"file\":\"A.bas\",\"purpose\":\"x\"}\n```\nFin.";
        assert_eq!(parse_summary(text).unwrap().purpose, "x");
        let prose = "Resultado {\"file\":\"A.bas\"} listo";
        assert_eq!(parse_summary(prose).unwrap().file, "A.bas");
        assert!(parse_summary("sin json").is_none());
    }

    #[tokio::test]
    async fn one_summary_per_record_in_order() {
        let records = vec![
            FileRecord::from_source("B.bas", "Public Sub Run()\nEnd Sub\n").unwrap(),
            FileRecord::from_source("A.frm", TIMER_FORM).unwrap(),
        ];
        let summaries = analyzer(MockGenerator::new(), 15_000)
            .analyze_all(&records)
            .await;
        let files: Vec<&str> = summaries.iter().map(|s| s.file.as_str()).collect();
        assert_eq!(files, vec!["B.bas", "A.frm"]);
        // las consultas de la ingesta se conservan aunque el modelo no las cite
        assert_eq!(summaries[1].queries, vec!["SELECT * FROM orders".to_string()]);
    }

    #[tokio::test]
    async fn provider_failure_falls_back_to_facts() {
        let record = FileRecord::from_source("A.frm", TIMER_FORM).unwrap();
        let generator = MockGenerator::new().failing_task(TaskKind::AnalyzeFile);
        let summary = analyzer(generator, 15_000).analyze(&record).await;
        assert_eq!(summary.file, "A.frm");
        assert_eq!(summary.target_hints["tmrPoll"], "BackgroundService");
        assert!(summary.events.contains(&"tmrPoll_Timer".to_string()));
    }

    #[tokio::test]
    async fn long_files_are_condensed_first() {
        let record = FileRecord::from_source("A.frm", TIMER_FORM).unwrap();
        let generator = MockGenerator::new();
        let summary = analyzer(generator.clone(), 10).analyze(&record).await;
        assert_eq!(generator.call_count(TaskKind::SummarizeSource), 1);
        assert_eq!(summary.source_excerpt, "Resumen de A.frm");
    }
}

//! Proveedores deterministas para tests y ejecuciones en seco.
//!
//! ```rust
//! use legacy_migrator_rag::mock::MockEmbedder;
//! use legacy_migrator_rag::providers::Embedder;
//!
//! # tokio_test::block_on(async {
//! let embedder = MockEmbedder::new().with_dimension(32);
//! let vector = embedder.embed("SELECT * FROM orders").await.unwrap();
//! assert_eq!(vector.len(), 32);
//! # });
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::models::{BuildDiagnostic, GeneratedFile};
use crate::providers::{Builder, Embedder, GenerationRequest, Generator, TaskKind};

/// Embeddings por "bag of words" con hashing: textos que comparten palabras
/// quedan cerca en coseno.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dimension: usize,
    fail_marker: Option<String>,
    /// (marcador, dimensión) para simular un proveedor incoherente.
    odd_dimension: Option<(String, usize)>,
    calls: Arc<Mutex<usize>>,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self {
            dimension: 64,
            fail_marker: None,
            odd_dimension: None,
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension.max(1);
        self
    }

    /// Falla cuando el texto contiene `marker`.
    pub fn failing_on(mut self, marker: impl Into<String>) -> Self {
        self.fail_marker = Some(marker.into());
        self
    }

    /// Devuelve vectores de otra dimensión cuando el texto contiene `marker`.
    pub fn with_dimension_for(mut self, marker: impl Into<String>, dimension: usize) -> Self {
        self.odd_dimension = Some((marker.into(), dimension.max(1)));
        self
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    /// Vector determinista para `text`.
    pub fn vector_for(text: &str, dimension: usize) -> Vec<f64> {
        let mut vec = vec![0.0; dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            // FNV-1a
            let mut hash: u64 = 0xcbf29ce484222325;
            for byte in word.bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x100000001b3);
            }
            vec[(hash % dimension as u64) as usize] += 1.0;
        }
        let norm = vec.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            vec.iter_mut().for_each(|x| *x /= norm);
        }
        vec
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(marker) = &self.fail_marker {
            if text.contains(marker.as_str()) {
                return Err(ProviderError::Request(format!("fallo simulado para '{marker}'")));
            }
        }
        let dimension = match &self.odd_dimension {
            Some((marker, dim)) if text.contains(marker.as_str()) => *dim,
            _ => self.dimension,
        };
        Ok(Self::vector_for(text, dimension))
    }
}

#[derive(Debug, Clone, Default)]
struct GeneratorScript {
    responses: HashMap<(TaskKind, String), String>,
    failing: HashSet<(TaskKind, String)>,
    failing_tasks: HashSet<TaskKind>,
    latency: Option<Duration>,
}

/// Generador con respuestas programables por tarea y ruta.
///
/// Sin respuesta programada devuelve un texto por defecto que incluye la
/// ruta destino; para `AnalyzeFile` devuelve un JSON mínimo válido.
#[derive(Debug, Clone, Default)]
pub struct MockGenerator {
    script: Arc<GeneratorScript>,
    calls: Arc<Mutex<Vec<GenerationRequest>>>,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, task: TaskKind, path: impl Into<String>, text: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.script)
            .responses
            .insert((task, path.into()), text.into());
        self
    }

    /// Falla para esa tarea y ruta.
    pub fn failing_for(mut self, task: TaskKind, path: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.script)
            .failing
            .insert((task, path.into()));
        self
    }

    /// Falla para todas las peticiones de esa tarea.
    pub fn failing_task(mut self, task: TaskKind) -> Self {
        Arc::make_mut(&mut self.script).failing_tasks.insert(task);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        Arc::make_mut(&mut self.script).latency = Some(latency);
        self
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, task: TaskKind) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.task == task)
            .count()
    }

    fn default_response(request: &GenerationRequest, path: &str) -> String {
        match request.task {
            TaskKind::SummarizeSource => format!("Resumen de {path}"),
            TaskKind::AnalyzeFile => {
                let file = request
                    .context
                    .get("file")
                    .and_then(|v| v.as_str())
                    .unwrap_or(path);
                serde_json::json!({
                    "file": file,
                    "purpose": format!("Lógica de {file}"),
                    "functionality": "Análisis simulado",
                })
                .to_string()
            }
            TaskKind::GenerateFile => format!("// {path}\n// generado\n"),
            TaskKind::RepairFile => format!("// {path}\n// reparado\n"),
        }
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        self.calls.lock().unwrap().push(request.clone());
        if let Some(latency) = self.script.latency {
            tokio::time::sleep(latency).await;
        }

        let path = request
            .target_path
            .clone()
            .or_else(|| {
                request
                    .context
                    .get("file")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let key = (request.task, path.clone());

        if self.script.failing_tasks.contains(&request.task) || self.script.failing.contains(&key) {
            return Err(ProviderError::Request(format!("fallo simulado para '{path}'")));
        }
        let text = self
            .script
            .responses
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Self::default_response(request, &path));
        if text.trim().is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        Ok(text)
    }
}

/// Builder con rondas de diagnósticos guionizadas. La invocación `n` devuelve
/// la ronda `n`; agotado el guion se repite la última (vacía si no hay).
#[derive(Debug, Clone, Default)]
pub struct MockBuilder {
    rounds: Arc<Vec<Vec<BuildDiagnostic>>>,
    fail_invocation: bool,
    latency: Option<Duration>,
    snapshots: Arc<Mutex<Vec<Vec<GeneratedFile>>>>,
}

impl MockBuilder {
    /// Todas las compilaciones tienen éxito.
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn with_rounds(rounds: Vec<Vec<BuildDiagnostic>>) -> Self {
        Self {
            rounds: Arc::new(rounds),
            ..Default::default()
        }
    }

    /// La invocación misma falla (herramienta ausente, proceso caído...).
    pub fn failing() -> Self {
        Self {
            fail_invocation: true,
            ..Default::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn invocations(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    /// Ficheros recibidos en cada invocación, en orden.
    pub fn snapshots(&self) -> Vec<Vec<GeneratedFile>> {
        self.snapshots.lock().unwrap().clone()
    }
}

#[async_trait]
impl Builder for MockBuilder {
    async fn build(&self, files: &[GeneratedFile]) -> Result<Vec<BuildDiagnostic>, ProviderError> {
        let invocation = {
            let mut snapshots = self.snapshots.lock().unwrap();
            snapshots.push(files.to_vec());
            snapshots.len() - 1
        };
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.fail_invocation {
            return Err(ProviderError::Request("builder no disponible".into()));
        }
        Ok(self
            .rounds
            .get(invocation)
            .or_else(|| self.rounds.last())
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embedder_is_deterministic_and_normalised() {
        let embedder = MockEmbedder::new().with_dimension(16);
        let a = embedder.embed("orders total").await.unwrap();
        let b = embedder.embed("orders total").await.unwrap();
        assert_eq!(a, b);
        let norm: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9);
        assert_eq!(embedder.call_count(), 2);
    }

    #[tokio::test]
    async fn embedder_failure_and_dimension_markers() {
        let embedder = MockEmbedder::new()
            .with_dimension(8)
            .failing_on("BOOM")
            .with_dimension_for("ODD", 3);
        assert!(embedder.embed("BOOM here").await.is_err());
        assert_eq!(embedder.embed("ODD one").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn generator_uses_scripted_responses() {
        let generator = MockGenerator::new()
            .with_response(TaskKind::GenerateFile, "Models/Order.cs", "class Order {}")
            .failing_for(TaskKind::GenerateFile, "Broken.cs")
            .with_response(TaskKind::GenerateFile, "Empty.cs", "   ");

        let request = |path: &str| {
            GenerationRequest::new(TaskKind::GenerateFile, serde_json::json!({})).for_path(path)
        };
        assert_eq!(
            generator.generate(&request("Models/Order.cs")).await.unwrap(),
            "class Order {}"
        );
        assert!(generator.generate(&request("Broken.cs")).await.is_err());
        assert!(matches!(
            generator.generate(&request("Empty.cs")).await,
            Err(ProviderError::EmptyResponse)
        ));
        assert!(generator
            .generate(&request("Other.cs"))
            .await
            .unwrap()
            .contains("Other.cs"));
        assert_eq!(generator.call_count(TaskKind::GenerateFile), 4);
    }

    #[tokio::test]
    async fn builder_replays_rounds_and_repeats_last() {
        let builder = MockBuilder::with_rounds(vec![
            vec![BuildDiagnostic::error("A.cs", "CS1002")],
            vec![],
        ]);
        let files = vec![GeneratedFile::new("A.cs", "x")];
        assert_eq!(builder.build(&files).await.unwrap().len(), 1);
        assert!(builder.build(&files).await.unwrap().is_empty());
        assert!(builder.build(&files).await.unwrap().is_empty());
        assert_eq!(builder.invocations(), 3);
    }
}

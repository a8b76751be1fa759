//! Capacidades externas del pipeline.
//!
//! El núcleo solo conoce estos tres traits; las implementaciones concretas
//! viven en `llm` (rig), `build` (dotnet) y `mock` (tests).

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ProviderError;
use crate::models::{BuildDiagnostic, GeneratedFile};

/// Convierte texto en un vector de dimensión fija.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError>;
}

/// Genera texto a partir de una petición estructurada.
///
/// Una respuesta vacía debe devolverse como `ProviderError::EmptyResponse`.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError>;
}

/// Compila un conjunto de ficheros y devuelve sus diagnósticos.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, files: &[GeneratedFile]) -> Result<Vec<BuildDiagnostic>, ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Condensar un fichero demasiado largo antes de analizarlo.
    SummarizeSource,
    /// Producir un `AnalysisSummary` en JSON.
    AnalyzeFile,
    GenerateFile,
    RepairFile,
}

impl TaskKind {
    /// Preámbulo breve que acompaña a la petición.
    pub fn preamble(self) -> &'static str {
        match self {
            Self::SummarizeSource => {
                "Resume el código VB6 conservando firmas, controles, eventos y consultas SQL."
            }
            Self::AnalyzeFile => {
                "Analiza el fichero VB6 y responde solo con un objeto JSON con las claves \
                 file, purpose, functionality, dependencies, target_hints, controls, events y queries."
            }
            Self::GenerateFile => {
                "Genera el fichero .NET 8 indicado en target_path. Responde solo con el código fuente."
            }
            Self::RepairFile => {
                "Corrige el fichero indicado en target_path usando los diagnósticos. \
                 Responde solo con el código fuente completo corregido."
            }
        }
    }
}

/// Petición única y estructurada al proveedor de generación.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub task: TaskKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    pub context: serde_json::Value,
}

impl GenerationRequest {
    pub fn new(task: TaskKind, context: serde_json::Value) -> Self {
        Self {
            task,
            target_path: None,
            context,
        }
    }

    pub fn for_path(mut self, path: impl Into<String>) -> Self {
        self.target_path = Some(path.into());
        self
    }

    /// Cuerpo del prompt: la petición serializada como JSON.
    pub fn to_prompt(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| self.context.to_string())
    }
}

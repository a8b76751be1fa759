//! Modelos de dominio: ficheros legados, resúmenes de análisis, ficheros
//! generados y diagnósticos de compilación.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tipo de fichero VB6 según su extensión.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Project,
    Workspace,
    Form,
    Module,
    Class,
    UserControl,
    PropertyPage,
    Designer,
    BinaryResource,
}

impl FileKind {
    /// Clasifica por extensión (sin distinguir mayúsculas). `None` si no es VB6.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "vbp" => Some(Self::Project),
            "vbw" => Some(Self::Workspace),
            "frm" => Some(Self::Form),
            "bas" => Some(Self::Module),
            "cls" => Some(Self::Class),
            "ctl" => Some(Self::UserControl),
            "pag" => Some(Self::PropertyPage),
            "dsr" => Some(Self::Designer),
            "frx" | "ctx" | "dsx" | "res" => Some(Self::BinaryResource),
            _ => None,
        }
    }

    /// Ficheros con interfaz de usuario (tienen bloques `Begin VB.*`).
    pub fn is_ui(self) -> bool {
        matches!(
            self,
            Self::Form | Self::UserControl | Self::PropertyPage | Self::Designer
        )
    }

    /// Ficheros con código ejecutable que se puede migrar.
    pub fn is_code(self) -> bool {
        self.is_ui() || matches!(self, Self::Module | Self::Class)
    }
}

/// Control declarado en un bloque `Begin VB.<Kind> <Name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Control {
    pub fn is_timer(&self) -> bool {
        self.kind.eq_ignore_ascii_case("Timer")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub data_type: String,
}

/// `Function` o `Sub` que no es un manejador de eventos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routine {
    pub name: String,
    pub is_function: bool,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    pub return_type: Option<String>,
}

/// Hechos estructurales extraídos del código fuente.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFacts {
    #[serde(default)]
    pub controls: Vec<Control>,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub routines: Vec<Routine>,
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default)]
    pub queries: Vec<String>,
}

impl SourceFacts {
    /// Indica si el fichero tiene un patrón temporizado (Timer o `*_Timer`).
    pub fn has_timer_evidence(&self) -> bool {
        self.controls.iter().any(Control::is_timer)
            || self
                .events
                .iter()
                .any(|e| e.to_lowercase().ends_with("_timer"))
    }

    /// Primer intervalo positivo declarado en un control Timer.
    pub fn timer_interval_ms(&self) -> Option<u64> {
        self.controls
            .iter()
            .filter(|c| c.is_timer())
            .filter_map(|c| c.properties.get("Interval"))
            .filter_map(|v| v.trim().parse::<u64>().ok())
            .find(|ms| *ms > 0)
    }
}

/// Un fichero fuente legado ya parseado. Inmutable tras la ingesta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Ruta relativa con separadores `/`; es la identidad del fichero.
    pub path: String,
    pub kind: FileKind,
    pub content: String,
    pub facts: SourceFacts,
    /// Dependencias declaradas (entradas del `.vbp`, objetos `Object = ...`).
    pub dependencies: Vec<String>,
    /// Referencias inferidas del código (`New Tipo`, `Modulo.Miembro`).
    #[serde(default)]
    pub references: Vec<String>,
}

impl FileRecord {
    /// Nombre del fichero sin directorio ni extensión.
    pub fn stem(&self) -> &str {
        file_stem(&self.path)
    }
}

/// Devuelve el "stem" de una ruta o token (`Forms\Orders.frm` → `Orders`).
pub fn file_stem(token: &str) -> &str {
    let name = token.rsplit(['/', '\\']).next().unwrap_or(token);
    match name.rfind('.') {
        Some(0) | None => name,
        Some(pos) => &name[..pos],
    }
}

/// Hueco recuperado durante el análisis (referencia colgante, consulta no
/// interpretable...). Nunca detiene el pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Omission {
    pub file: String,
    pub detail: String,
}

impl Omission {
    pub fn new(file: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            detail: detail.into(),
        }
    }
}

/// Resultado estructurado del análisis de un fichero; es el corpus del RAG.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    #[serde(alias = "file_name")]
    pub file: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub functionality: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Pistas de correspondencia con .NET (p. ej. `Timer1` → `BackgroundService`).
    #[serde(default, alias = "net_mapping", alias = "netMappings")]
    pub target_hints: BTreeMap<String, String>,
    #[serde(default)]
    pub controls: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default, alias = "ado_queries", alias = "adoQueries")]
    pub queries: Vec<String>,
    #[serde(default)]
    pub source_excerpt: String,
}

impl AnalysisSummary {
    /// Texto que se embebe en el índice.
    pub fn corpus_text(&self) -> String {
        let hints: Vec<String> = self
            .target_hints
            .iter()
            .map(|(k, v)| format!("{k} -> {v}"))
            .collect();
        format!(
            "File: {}\nPurpose: {}\nFunctionality: {}\nDependencies: {}\nTarget hints: {}\nControls: {}\nEvents: {}\nQueries: {}\n--- SOURCE ---\n{}",
            self.file,
            self.purpose,
            self.functionality,
            self.dependencies.join(", "),
            hints.join("; "),
            self.controls.join(", "),
            self.events.join(", "),
            self.queries.join(" | "),
            self.source_excerpt
        )
    }
}

/// Un fichero del proyecto destino con su texto actual.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub source: String,
}

impl GeneratedFile {
    pub fn new(path: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Diagnóstico de la herramienta de build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDiagnostic {
    /// Ruta relativa al proyecto; `None` si no es atribuible a un fichero.
    pub path: Option<String>,
    pub message: String,
    pub severity: Severity,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

impl BuildDiagnostic {
    pub fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            message: message.into(),
            severity: Severity::Error,
            code: None,
            line: None,
        }
    }

    /// Error de proyecto completo, sin fichero concreto.
    pub fn project_error(message: impl Into<String>) -> Self {
        Self {
            path: None,
            message: message.into(),
            severity: Severity::Error,
            code: None,
            line: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_stem_strips_directories_and_extension() {
        assert_eq!(file_stem("Forms\\Orders.frm"), "Orders");
        assert_eq!(file_stem("src/utils.bas"), "utils");
        assert_eq!(file_stem("Utils"), "Utils");
        assert_eq!(file_stem(".hidden"), ".hidden");
    }

    #[test]
    fn timer_interval_ignores_zero_and_non_timers() {
        let mut timer = Control {
            kind: "Timer".into(),
            name: "tmrPoll".into(),
            properties: BTreeMap::new(),
        };
        timer.properties.insert("Interval".into(), "0".into());
        let mut second = timer.clone();
        second.properties.insert("Interval".into(), "5000".into());
        let facts = SourceFacts {
            controls: vec![timer, second],
            ..Default::default()
        };
        assert!(facts.has_timer_evidence());
        assert_eq!(facts.timer_interval_ms(), Some(5000));
    }

    #[test]
    fn summary_accepts_model_aliases() {
        let json = r#"{"file_name":"Orders.frm","purpose":"p","adoQueries":["SELECT * FROM orders"]}"#;
        let summary: AnalysisSummary = serde_json::from_str(json).unwrap();
        assert_eq!(summary.file, "Orders.frm");
        assert_eq!(summary.queries.len(), 1);
        assert!(summary.corpus_text().contains("SELECT * FROM orders"));
    }
}

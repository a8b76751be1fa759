//! Carga y gestión de configuración: proveedor LLM, rutas de trabajo y
//! parámetros del pipeline de migración.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Gemini,
    Ollama,
}

impl FromStr for LlmProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            other => Err(anyhow!("Proveedor LLM no soportado: {other}")),
        }
    }
}

/// Parámetros del pipeline. La librería solo depende de esta estructura.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    pub project_name: String,
    /// Presupuesto de reparaciones R: como mucho R+1 compilaciones.
    pub max_repair_attempts: u32,
    pub generation_workers: usize,
    pub rag_top_k: usize,
    /// Intervalo por defecto de los workers sin `Interval` declarado.
    pub worker_interval_ms: u64,
    /// Por encima de este tamaño el fichero se resume antes de analizarlo.
    pub analysis_char_limit: usize,
    pub analysis_workers: usize,
    pub output_dir: PathBuf,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            project_name: "MigratedWindowsService".to_string(),
            max_repair_attempts: 3,
            generation_workers: 4,
            rag_top_k: 5,
            worker_interval_ms: 60_000,
            analysis_char_limit: 15_000,
            analysis_workers: 4,
            output_dir: PathBuf::from("migration_output"),
        }
    }
}

impl PipelineSettings {
    pub fn with_project_name(mut self, name: impl Into<String>) -> Self {
        self.project_name = name.into();
        self
    }

    pub fn with_max_repair_attempts(mut self, attempts: u32) -> Self {
        self.max_repair_attempts = attempts;
        self
    }

    pub fn with_generation_workers(mut self, workers: usize) -> Self {
        self.generation_workers = workers.max(1);
        self
    }

    pub fn with_rag_top_k(mut self, k: usize) -> Self {
        self.rag_top_k = k;
        self
    }

    pub fn with_worker_interval_ms(mut self, ms: u64) -> Self {
        self.worker_interval_ms = ms;
        self
    }

    pub fn with_analysis_char_limit(mut self, limit: usize) -> Self {
        self.analysis_char_limit = limit;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }
}

/// Conexión opcional a Neo4j para volcar el grafo de análisis.
#[derive(Clone, Debug)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub llm_provider: LlmProvider,
    pub llm_embedding_model: String,
    pub llm_chat_model: String,

    pub sessions_dir: PathBuf,
    pub build_command: String,
    pub build_work_dir: PathBuf,
    pub neo4j: Option<Neo4jConfig>,

    pub pipeline: PipelineSettings,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let llm_provider_str =
            env::var("LLM_PROVIDER").unwrap_or_else(|_| "openai".to_string());
        let llm_provider = llm_provider_str.parse::<LlmProvider>()?;

        let llm_embedding_model = env::var("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|_| "text-embedding-3-small".to_string());
        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let sessions_dir = match env::var("SESSIONS_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("legacy-migrator")
                .join("sessions"),
        };
        let build_command = env::var("BUILD_COMMAND").unwrap_or_else(|_| "dotnet".to_string());
        let build_work_dir = PathBuf::from(
            env::var("BUILD_WORK_DIR").unwrap_or_else(|_| "temp_migration".to_string()),
        );

        // Neo4j es opcional: solo se usa si está NEO4J_URI
        let neo4j = match env::var("NEO4J_URI") {
            Ok(uri) => Some(Neo4jConfig {
                uri,
                user: env::var("NEO4J_USER")
                    .map_err(|_| anyhow!("Falta NEO4J_USER en el entorno"))?,
                password: env::var("NEO4J_PASSWORD")
                    .map_err(|_| anyhow!("Falta NEO4J_PASSWORD en el entorno"))?,
            }),
            Err(_) => None,
        };

        let defaults = PipelineSettings::default();
        let pipeline = PipelineSettings {
            project_name: env::var("PROJECT_NAME").unwrap_or(defaults.project_name),
            max_repair_attempts: env_number("MAX_REPAIR_ATTEMPTS", defaults.max_repair_attempts)?,
            generation_workers: env_number("GENERATION_WORKERS", defaults.generation_workers)?
                .max(1),
            rag_top_k: env_number("RAG_TOP_K", defaults.rag_top_k)?,
            worker_interval_ms: env_number("WORKER_INTERVAL_MS", defaults.worker_interval_ms)?,
            analysis_char_limit: env_number("ANALYSIS_CHAR_LIMIT", defaults.analysis_char_limit)?,
            analysis_workers: env_number("ANALYSIS_WORKERS", defaults.analysis_workers)?.max(1),
            output_dir: env::var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
        };

        Ok(Self {
            llm_provider,
            llm_embedding_model,
            llm_chat_model,
            sessions_dir,
            build_command,
            build_work_dir,
            neo4j,
            pipeline,
        })
    }
}

fn env_number<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Valor inválido para {key}: '{raw}'")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parsing_is_case_insensitive() {
        assert_eq!("OpenAI".parse::<LlmProvider>().unwrap(), LlmProvider::OpenAI);
        assert_eq!("ollama".parse::<LlmProvider>().unwrap(), LlmProvider::Ollama);
        assert!("claude".parse::<LlmProvider>().is_err());
    }

    #[test]
    fn settings_builder_overrides_defaults() {
        let settings = PipelineSettings::default()
            .with_project_name("Billing")
            .with_max_repair_attempts(2)
            .with_generation_workers(0);
        assert_eq!(settings.project_name, "Billing");
        assert_eq!(settings.max_repair_attempts, 2);
        assert_eq!(settings.generation_workers, 1);
        assert_eq!(settings.rag_top_k, 5);
    }
}

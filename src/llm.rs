//! Proveedores basados en Rig para embeddings y generación.
//! De momento se implementa OpenAI; Gemini/Ollama quedan preparados para el futuro.

use async_trait::async_trait;
use rig::completion::Prompt;
use rig::embeddings::EmbeddingModel; // <- para .embed_texts
use tracing::debug;

use crate::config::{AppConfig, LlmProvider};
use crate::error::ProviderError;
use crate::providers::{Embedder, GenerationRequest, Generator};

const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

/// El cliente de Rig entra en pánico sin clave; se comprueba antes.
fn openai_client() -> Result<rig::providers::openai::Client, ProviderError> {
    if std::env::var("OPENAI_API_KEY").map(|k| k.trim().is_empty()).unwrap_or(true) {
        return Err(ProviderError::Request("OPENAI_API_KEY no está definida".into()));
    }
    Ok(rig::providers::openai::Client::from_env())
}

fn unsupported(provider: &LlmProvider, what: &str) -> ProviderError {
    ProviderError::Unsupported(format!("{provider:?} aún no implementado para {what}"))
}

/// Embeddings vía Rig.
#[derive(Debug, Clone)]
pub struct RigEmbedder {
    provider: LlmProvider,
    model: String,
}

impl RigEmbedder {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            provider: cfg.llm_provider.clone(),
            model: cfg.llm_embedding_model.clone(),
        }
    }

    async fn embed_with_openai(&self, text: &str) -> Result<Vec<f64>, ProviderError> {
        use rig::providers::openai::TEXT_EMBEDDING_3_SMALL;
        // Trait para client.embedding_model(...)
        use rig::client::EmbeddingsClient as _;

        let client = openai_client()?;
        let model_name = if self.model.is_empty() {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.model.as_str()
        };

        let embeddings = client
            .embedding_model(model_name)
            .embed_texts(vec![text.to_string()])
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .map(|emb| emb.vec)
            .ok_or(ProviderError::EmptyResponse)
    }
}

#[async_trait]
impl Embedder for RigEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f64>, ProviderError> {
        match self.provider {
            LlmProvider::OpenAI => self.embed_with_openai(text).await,
            ref other => Err(unsupported(other, "embeddings")),
        }
    }
}

/// Generación de texto vía un agente de Rig; el preámbulo depende de la tarea.
#[derive(Debug, Clone)]
pub struct RigGenerator {
    provider: LlmProvider,
    model: String,
}

impl RigGenerator {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            provider: cfg.llm_provider.clone(),
            model: cfg.llm_chat_model.clone(),
        }
    }

    async fn generate_with_openai(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        // Trait para client.agent(...)
        use rig::client::CompletionClient as _;

        let client = openai_client()?;
        let model_name = if self.model.is_empty() {
            DEFAULT_CHAT_MODEL
        } else {
            self.model.as_str()
        };

        let agent = client
            .agent(model_name)
            .preamble(request.task.preamble())
            .build();

        let prompt = request.to_prompt();
        debug!(task = ?request.task, chars = prompt.len(), "Petición al LLM");
        let answer = agent
            .prompt(prompt.as_str())
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        if answer.trim().is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        Ok(answer)
    }
}

#[async_trait]
impl Generator for RigGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        match self.provider {
            LlmProvider::OpenAI => self.generate_with_openai(request).await,
            ref other => Err(unsupported(other, "chat")),
        }
    }
}

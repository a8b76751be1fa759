//! Tipos de error de la librería.
//!
//! Cada etapa del pipeline tiene su propio error; `MigrationError` los agrupa
//! para quien orquesta. El binario los envuelve con `anyhow`.

use thiserror::Error;

/// Resultado con el error general del pipeline.
pub type Result<T> = std::result::Result<T, MigrationError>;

/// Fallo de un proveedor externo (embeddings, generación o build).
#[derive(Debug, Error)]
pub enum ProviderError {
    /// La llamada al proveedor falló (red, autenticación, proceso...).
    #[error("Error en la petición al proveedor: {0}")]
    Request(String),

    /// El proveedor devolvió texto vacío.
    #[error("El proveedor devolvió una respuesta vacía")]
    EmptyResponse,

    /// La respuesta no tiene el formato esperado.
    #[error("Respuesta malformada del proveedor: {0}")]
    Malformed(String),

    /// Proveedor configurado pero sin implementación.
    #[error("Proveedor no soportado: {0}")]
    Unsupported(String),
}

/// Fallos del índice de análisis. Siempre abortan la llamada a `index`.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Dimensión de embedding incompatible para '{file}': se esperaba {expected}, se obtuvo {found}")]
    DimensionMismatch {
        file: String,
        expected: usize,
        found: usize,
    },

    #[error("El embedding de '{0}' está vacío")]
    EmptyVector(String),

    #[error("Error del proveedor de embeddings: {0}")]
    Embedding(#[from] ProviderError),
}

/// Errores de validación de un plan de arquitectura.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Ruta de destino duplicada en el plan: {0}")]
    DuplicatePath(String),

    #[error("Ruta de destino no permitida: {0}")]
    UnsafePath(String),

    #[error("Plan de arquitectura inválido: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Errores de persistencia de sesiones.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Identificador de sesión inválido: {0}")]
    InvalidId(String),

    #[error("Sesión no encontrada: {0}")]
    NotFound(String),

    #[error("Error de E/S en la sesión: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error de serialización en la sesión: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error general del pipeline de migración.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("La ruta no es un directorio: {0}")]
    NotADirectory(String),

    #[error("Fallo en la etapa de análisis (índice): {0}")]
    Index(#[from] IndexError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Error de E/S: {0}")]
    Io(#[from] std::io::Error),
}

//! Generación de ficheros destino con contexto recuperado del índice.
//!
//! Por cada descriptor del plan se construye una consulta, se recuperan los
//! análisis más parecidos (reordenados con un extra por centralidad en el
//! grafo de dependencias) y se envía una única petición estructurada al
//! proveedor. Los ficheros de infraestructura conocidos se renderizan aquí
//! mismo a partir del plan.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::graph::DependencyGraph;
use crate::index::{AnalysisIndex, RetrievedContext};
use crate::models::{BuildDiagnostic, FileKind, FileRecord, GeneratedFile};
use crate::planner::{pascal_case, ArchitecturePlan, TargetFileDescriptor, TargetKind};
use crate::pool::run_pool;
use crate::providers::{GenerationRequest, Generator, TaskKind};
use crate::schema::{SchemaModel, TableDescriptor};

/// Peso de la centralidad normalizada frente a la similitud coseno.
const CENTRALITY_WEIGHT: f64 = 0.1;
/// Tope de caracteres por fuente legada incluida en la petición.
const LEGACY_SOURCE_CHARS: usize = 15_000;

/// Fallo al generar o reparar un fichero concreto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationFailure {
    pub path: String,
    pub message: String,
}

impl GenerationFailure {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// Los fallos de generación aparecen en el informe como diagnósticos.
    pub fn to_diagnostic(&self) -> BuildDiagnostic {
        BuildDiagnostic::error(&self.path, &self.message).with_code("GENERATION")
    }
}

/// Ficheros generados y fallidos de una pasada completa.
#[derive(Debug, Default)]
pub struct GenerationBatch {
    pub files: Vec<GeneratedFile>,
    pub failures: Vec<GenerationFailure>,
    pub cancelled: bool,
}

pub struct ContextGenerator {
    generator: Arc<dyn Generator>,
    index: Arc<AnalysisIndex>,
    schema: Arc<SchemaModel>,
    plan: Arc<ArchitecturePlan>,
    centrality: BTreeMap<String, f64>,
    legacy_sources: BTreeMap<String, String>,
    top_k: usize,
}

impl ContextGenerator {
    pub fn new(
        generator: Arc<dyn Generator>,
        index: Arc<AnalysisIndex>,
        schema: Arc<SchemaModel>,
        plan: Arc<ArchitecturePlan>,
        graph: &DependencyGraph,
        top_k: usize,
    ) -> Self {
        Self {
            generator,
            index,
            schema,
            plan,
            centrality: graph.centrality(),
            legacy_sources: BTreeMap::new(),
            top_k,
        }
    }

    /// Fuentes VB6 originales que acompañan a cada petición de los
    /// descriptores que las mapean. Los recursos binarios se ignoran.
    pub fn with_legacy_sources(mut self, records: &[FileRecord]) -> Self {
        self.legacy_sources = records
            .iter()
            .filter(|r| r.kind != FileKind::BinaryResource)
            .map(|r| (r.path.clone(), r.content.chars().take(LEGACY_SOURCE_CHARS).collect()))
            .collect();
        self
    }

    pub fn plan(&self) -> &ArchitecturePlan {
        &self.plan
    }

    /// Texto de consulta RAG para un descriptor.
    pub fn retrieval_query(descriptor: &TargetFileDescriptor) -> String {
        let mut parts = vec![
            descriptor.namespace.clone(),
            format!("{:?}", descriptor.kind),
            descriptor.type_name().to_string(),
            descriptor.description.clone(),
        ];
        parts.extend(descriptor.dependencies.iter().cloned());
        parts.extend(descriptor.methods.iter().map(|m| m.name.clone()));
        parts.extend(descriptor.properties.iter().map(|p| p.name.clone()));
        parts.extend(descriptor.ui_components.iter().map(|u| u.name.clone()));
        parts.extend(descriptor.source_files.iter().cloned());
        parts.retain(|p| !p.trim().is_empty());
        parts.join(" ")
    }

    /// Recupera y reordena el contexto. Un fallo del índice no bloquea la
    /// generación: se sigue sin contexto.
    async fn retrieve(&self, descriptor: &TargetFileDescriptor) -> Vec<RetrievedContext> {
        let query = Self::retrieval_query(descriptor);
        let mut hits = match self.index.retrieve(&query, self.top_k).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(path = %descriptor.path, "Recuperación RAG fallida: {e}");
                return Vec::new();
            }
        };
        let centrality = |file: &str| self.centrality.get(file).copied().unwrap_or(0.0);
        hits.sort_by(|a, b| {
            let sa = a.score + CENTRALITY_WEIGHT * centrality(&a.file);
            let sb = b.score + CENTRALITY_WEIGHT * centrality(&b.file);
            sb.total_cmp(&sa)
        });
        hits
    }

    /// Tablas relevantes: las de los ficheros de origen y las de los
    /// modelos de los que depende.
    fn relevant_tables(&self, descriptor: &TargetFileDescriptor) -> Vec<&TableDescriptor> {
        self.schema
            .tables
            .iter()
            .filter(|table| {
                let model_name = pascal_case(&table.name);
                table
                    .source_files
                    .iter()
                    .any(|f| descriptor.source_files.contains(f))
                    || descriptor.dependencies.iter().any(|d| *d == model_name)
                    || (descriptor.kind == TargetKind::Model && descriptor.type_name() == model_name)
            })
            .collect()
    }

    fn plan_outline(&self) -> Value {
        Value::Array(
            self.plan
                .files
                .iter()
                .map(|f| json!({ "path": f.path, "kind": f.kind, "namespace": f.namespace }))
                .collect(),
        )
    }

    fn legacy_sources(&self, descriptor: &TargetFileDescriptor) -> Value {
        Value::Array(
            descriptor
                .source_files
                .iter()
                .filter_map(|file| {
                    self.legacy_sources
                        .get(file)
                        .map(|content| json!({ "file": file, "content": content }))
                })
                .collect(),
        )
    }

    async fn request_context(&self, descriptor: &TargetFileDescriptor) -> Value {
        let retrieved = self.retrieve(descriptor).await;
        json!({
            "project": {
                "name": self.plan.project_name,
                "root_namespace": self.plan.root_namespace,
            },
            "descriptor": descriptor,
            "schema": self.relevant_tables(descriptor),
            "plan_outline": self.plan_outline(),
            "legacy_sources": self.legacy_sources(descriptor),
            "retrieved": retrieved,
        })
    }

    /// Genera un fichero. Respuestas vacías cuentan como fallo.
    pub async fn generate(&self, descriptor: &TargetFileDescriptor) -> Result<GeneratedFile, GenerationFailure> {
        if let Some(source) = render_boilerplate(&self.plan, descriptor) {
            debug!(path = %descriptor.path, "Fichero de infraestructura renderizado localmente");
            return Ok(GeneratedFile::new(&descriptor.path, source));
        }

        let request = GenerationRequest::new(TaskKind::GenerateFile, self.request_context(descriptor).await)
            .for_path(&descriptor.path);
        let text = self
            .generator
            .generate(&request)
            .await
            .map_err(|e| GenerationFailure::new(&descriptor.path, e.to_string()))?;
        let source = strip_code_fences(&text);
        if source.trim().is_empty() {
            return Err(GenerationFailure::new(&descriptor.path, "respuesta vacía del proveedor"));
        }
        Ok(GeneratedFile::new(&descriptor.path, source))
    }

    /// Repara un fichero con sus diagnósticos. Si la respuesta es un mapa
    /// JSON de ficheros solo se toma la ruta pedida; si no aparece, el
    /// fichero queda igual.
    pub async fn repair(
        &self,
        descriptor: &TargetFileDescriptor,
        current: &GeneratedFile,
        diagnostics: &[BuildDiagnostic],
    ) -> Result<GeneratedFile, GenerationFailure> {
        let mut context = self.request_context(descriptor).await;
        context["current_source"] = Value::String(current.source.clone());
        context["diagnostics"] = json!(diagnostics);

        let request = GenerationRequest::new(TaskKind::RepairFile, context).for_path(&current.path);
        let text = self
            .generator
            .generate(&request)
            .await
            .map_err(|e| GenerationFailure::new(&current.path, e.to_string()))?;

        match select_repaired_source(&current.path, &text) {
            RepairResponse::Source(source) if !source.trim().is_empty() => {
                Ok(GeneratedFile::new(&current.path, source))
            }
            RepairResponse::Source(_) => Err(GenerationFailure::new(&current.path, "respuesta vacía del proveedor")),
            RepairResponse::Absent => {
                debug!(path = %current.path, "La respuesta de reparación no incluye el fichero; se mantiene");
                Ok(current.clone())
            }
        }
    }

    /// Genera todos los ficheros del plan con un pool acotado. Exactamente
    /// un resultado por descriptor salvo cancelación.
    pub async fn generate_all(self: &Arc<Self>, workers: usize, cancel: &CancelSignal) -> GenerationBatch {
        let descriptors = self.plan.files.clone();
        let this = Arc::clone(self);
        let output = run_pool(descriptors, workers, cancel, move |descriptor| {
            let this = Arc::clone(&this);
            async move { this.generate(&descriptor).await }
        })
        .await;

        let mut batch = GenerationBatch {
            cancelled: output.cancelled,
            ..Default::default()
        };
        for result in output.results.into_iter().flatten() {
            match result {
                Ok(file) => batch.files.push(file),
                Err(failure) => {
                    warn!(path = %failure.path, "Fallo de generación: {}", failure.message);
                    batch.failures.push(failure);
                }
            }
        }
        info!(
            "Generación: {} ficheros, {} fallidos{}.",
            batch.files.len(),
            batch.failures.len(),
            if batch.cancelled { ", cancelada" } else { "" }
        );
        batch
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RepairResponse {
    Source(String),
    Absent,
}

fn select_repaired_source(path: &str, text: &str) -> RepairResponse {
    let body = strip_code_fences(text);
    let trimmed = body.trim();
    if trimmed.starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
            let files = match map.get("files") {
                Some(Value::Object(files)) => Some(files),
                _ if path.ends_with(".json") => None,
                _ => Some(&map),
            };
            if let Some(files) = files {
                return match files.get(path).and_then(Value::as_str) {
                    Some(source) => RepairResponse::Source(strip_code_fences(source)),
                    None => RepairResponse::Absent,
                };
            }
        }
    }
    RepairResponse::Source(body)
}

/// Quita el bloque ``` que suelen añadir los modelos.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after = &trimmed[start + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    match body.rfind("```") {
        Some(end) => body[..end].trim_end().to_string(),
        None => body.trim_end().to_string(),
    }
}

/// Plantillas de infraestructura. `None` si el descriptor no es una de ellas.
pub fn render_boilerplate(plan: &ArchitecturePlan, descriptor: &TargetFileDescriptor) -> Option<String> {
    if descriptor.kind != TargetKind::Boilerplate {
        return None;
    }
    let name = descriptor.path.rsplit('/').next().unwrap_or(&descriptor.path);
    if name.ends_with(".csproj") {
        Some(render_csproj(plan))
    } else if name == "Program.cs" {
        Some(render_program(plan))
    } else if name == "appsettings.json" {
        Some(render_appsettings(plan))
    } else if name == "_ViewImports.cshtml" {
        Some(format!(
            "@using {ns}\n@using {ns}.Models\n@addTagHelper *, Microsoft.AspNetCore.Mvc.TagHelpers\n",
            ns = plan.root_namespace
        ))
    } else if name == "_ViewStart.cshtml" {
        Some("@{\n    Layout = \"_Layout\";\n}\n".to_string())
    } else if name == "_Layout.cshtml" {
        Some(render_layout(plan))
    } else {
        None
    }
}

fn render_csproj(plan: &ArchitecturePlan) -> String {
    format!(
        r#"<Project Sdk="Microsoft.NET.Sdk.Web">
  <PropertyGroup>
    <TargetFramework>net8.0</TargetFramework>
    <Nullable>enable</Nullable>
    <ImplicitUsings>enable</ImplicitUsings>
    <RootNamespace>{ns}</RootNamespace>
  </PropertyGroup>
  <ItemGroup>
    <PackageReference Include="Microsoft.EntityFrameworkCore.SqlServer" Version="8.0.0" />
    <PackageReference Include="Microsoft.Extensions.Hosting" Version="8.0.0" />
  </ItemGroup>
</Project>
"#,
        ns = plan.root_namespace
    )
}

fn render_program(plan: &ArchitecturePlan) -> String {
    let qualified = |d: &TargetFileDescriptor| {
        if d.namespace.is_empty() {
            d.type_name().to_string()
        } else {
            format!("{}.{}", d.namespace, d.type_name())
        }
    };
    let mut registrations = Vec::new();
    for worker in plan.files.iter().filter(|f| f.kind == TargetKind::Worker) {
        registrations.push(format!("builder.Services.AddHostedService<{}>();", qualified(worker)));
    }
    for service in plan.files.iter().filter(|f| f.kind == TargetKind::Service) {
        let interface = plan
            .files
            .iter()
            .filter(|f| f.kind == TargetKind::Interface)
            .find(|i| service.dependencies.iter().any(|d| d == i.type_name()));
        match interface {
            Some(interface) => registrations.push(format!(
                "builder.Services.AddScoped<{}, {}>();",
                qualified(interface),
                qualified(service)
            )),
            None => registrations.push(format!("builder.Services.AddScoped<{}>();", qualified(service))),
        }
    }
    let has_mvc = plan.files.iter().any(|f| f.kind == TargetKind::Controller);
    if has_mvc {
        registrations.push("builder.Services.AddControllersWithViews();".to_string());
    }

    let mut program = String::from("var builder = WebApplication.CreateBuilder(args);\n\n");
    for line in &registrations {
        program.push_str(line);
        program.push('\n');
    }
    program.push_str("\nvar app = builder.Build();\n\n");
    if has_mvc {
        program.push_str("app.UseStaticFiles();\napp.UseRouting();\napp.MapDefaultControllerRoute();\n\n");
    }
    program.push_str("app.Run();\n");
    program
}

fn render_layout(plan: &ArchitecturePlan) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="es">
<head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <title>@ViewData["Title"] - {name}</title>
</head>
<body>
    <main role="main">
        @RenderBody()
    </main>
</body>
</html>
"#,
        name = plan.project_name
    )
}

fn render_appsettings(plan: &ArchitecturePlan) -> String {
    let workers: serde_json::Map<String, Value> = plan
        .files
        .iter()
        .filter(|f| f.kind == TargetKind::Worker)
        .map(|w| (w.type_name().to_string(), json!({ "IntervalMs": w.interval_ms })))
        .collect();
    let settings = json!({
        "ConnectionStrings": { "DefaultConnection": "" },
        "Logging": { "LogLevel": { "Default": "Information", "Microsoft.AspNetCore": "Warning" } },
        "Workers": workers,
        "AllowedHosts": "*",
    });
    serde_json::to_string_pretty(&settings).unwrap_or_else(|_| settings.to_string())
}

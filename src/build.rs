//! Builder real: escribe el proyecto en un directorio de trabajo y lanza
//! `dotnet build`, interpretando la salida de MSBuild.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ProviderError;
use crate::models::{BuildDiagnostic, GeneratedFile, Severity};
use crate::providers::Builder;

/// `ruta(línea,col): error CS1002: mensaje [proyecto]`
static MSBUILD_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*(?P<path>.+?)\((?P<line>\d+)(?:,\d+)?\)\s*:\s*(?P<sev>error|warning)\s+(?P<code>[A-Z]+\d+)\s*:\s*(?P<msg>.*?)(?:\s+\[[^\]]+\])?\s*$",
    )
    .unwrap()
});
/// Errores sin posición: `MSBUILD : error MSB1009: ...` o `proyecto : error NU1101: ...`
static PROJECT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?P<path>[^:(]*?)\s*:\s*(?P<sev>error|warning)\s+(?P<code>[A-Z]+\d+)\s*:\s*(?P<msg>.*?)(?:\s+\[[^\]]+\])?\s*$")
        .unwrap()
});

pub struct DotnetBuilder {
    command: String,
    work_dir: PathBuf,
}

impl DotnetBuilder {
    pub fn new(command: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            work_dir: work_dir.into(),
        }
    }

    /// Escribe los ficheros en el directorio de trabajo (limpiándolo antes).
    pub async fn write_project(&self, files: &[GeneratedFile]) -> Result<(), ProviderError> {
        if tokio::fs::try_exists(&self.work_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&self.work_dir)
                .await
                .map_err(|e| ProviderError::Request(format!("no se pudo limpiar {}: {e}", self.work_dir.display())))?;
        }
        for file in files {
            let relative = safe_relative(&file.path)
                .ok_or_else(|| ProviderError::Malformed(format!("ruta no permitida: {}", file.path)))?;
            let target = self.work_dir.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ProviderError::Request(e.to_string()))?;
            }
            tokio::fs::write(&target, &file.source)
                .await
                .map_err(|e| ProviderError::Request(format!("{}: {e}", target.display())))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Builder for DotnetBuilder {
    async fn build(&self, files: &[GeneratedFile]) -> Result<Vec<BuildDiagnostic>, ProviderError> {
        self.write_project(files).await?;
        info!("Compilando {} ficheros en {}", files.len(), self.work_dir.display());

        let output = Command::new(&self.command)
            .arg("build")
            .arg("-nologo")
            .arg("-clp:NoSummary")
            .current_dir(&self.work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProviderError::Request(format!("no se pudo ejecutar '{}': {e}", self.command)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{stdout}\n{stderr}");
        let mut diagnostics = parse_msbuild_output(&combined, &self.work_dir);
        debug!(status = ?output.status, diagnostics = diagnostics.len(), "dotnet build terminado");

        if !output.status.success() && !diagnostics.iter().any(BuildDiagnostic::is_error) {
            let tail: Vec<&str> = combined.lines().rev().filter(|l| !l.trim().is_empty()).take(5).collect();
            let message = tail.into_iter().rev().collect::<Vec<_>>().join(" | ");
            diagnostics.push(BuildDiagnostic::project_error(format!(
                "build fallido sin errores interpretables ({}): {message}",
                output.status
            )));
        }
        Ok(diagnostics)
    }
}

/// Interpreta la salida de MSBuild. Las rutas se dejan relativas a
/// `work_dir` con `/`; las líneas repetidas se eliminan.
pub fn parse_msbuild_output(output: &str, work_dir: &Path) -> Vec<BuildDiagnostic> {
    let mut seen = HashSet::new();
    let mut diagnostics = Vec::new();

    for line in output.lines() {
        let (path, line_no, caps) = if let Some(caps) = MSBUILD_LINE.captures(line) {
            let line_no = caps["line"].parse::<u32>().ok();
            (Some(relative_to(&caps["path"], work_dir)), line_no, caps)
        } else if let Some(caps) = PROJECT_LINE.captures(line) {
            let raw = caps["path"].trim();
            // MSBUILD / CSC sin fichero: error de proyecto
            let path = if raw.is_empty() || raw.eq_ignore_ascii_case("msbuild") || raw.eq_ignore_ascii_case("csc") {
                None
            } else {
                Some(relative_to(raw, work_dir))
            };
            (path, None, caps)
        } else {
            continue;
        };

        let severity = if caps["sev"].eq_ignore_ascii_case("error") {
            Severity::Error
        } else {
            Severity::Warning
        };
        let diagnostic = BuildDiagnostic {
            path,
            message: caps["msg"].trim().to_string(),
            severity,
            code: Some(caps["code"].to_string()),
            line: line_no,
        };
        let key = (
            diagnostic.path.clone(),
            diagnostic.line,
            diagnostic.code.clone(),
            diagnostic.message.clone(),
        );
        if seen.insert(key) {
            diagnostics.push(diagnostic);
        }
    }
    diagnostics
}

fn relative_to(raw: &str, work_dir: &Path) -> String {
    let normalized = raw.trim().replace('\\', "/");
    let base = work_dir.to_string_lossy().replace('\\', "/");
    let base = base.trim_end_matches('/');
    match normalized.strip_prefix(base) {
        Some(rest) if !base.is_empty() => rest.trim_start_matches('/').to_string(),
        _ => normalized.trim_start_matches("./").to_string(),
    }
}

/// Solo rutas relativas sin `..`.
fn safe_relative(path: &str) -> Option<PathBuf> {
    let candidate = Path::new(path);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

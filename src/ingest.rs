//! Ingesta de un proyecto VB6: recorre el directorio, lee cada fichero
//! reconocido y extrae sus hechos estructurales (controles, eventos, rutinas,
//! consultas SQL y dependencias).

use std::{collections::HashSet, fs, path::Path};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{MigrationError, Result};
use crate::models::{Control, FileKind, FileRecord, Omission, Parameter, Routine, SourceFacts};

static CONTROL_BEGIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Begin\s+(\w+)\.(\w+)\s+(\w+)").unwrap());
static PROPERTY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+)\s*=\s*(.+)$").unwrap());
static SUB_OR_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?im)^\s*(?:(?:Public|Private|Friend)\s+)?(?:Static\s+)?(Function|Sub)\s+(\w+)\s*\(([^)]*)\)(?:\s+As\s+([\w.]+))?",
    )
    .unwrap()
});
static CLASS_PROPERTY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*(?:(?:Public|Private|Friend)\s+)?Property\s+(?:Get|Let|Set)\s+(\w+)")
        .unwrap()
});
static SQL_STATEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:SELECT\s+[^"\r\n]+?\s+FROM\s+[\[\]\w.]+[^"\r\n]*|INSERT\s+INTO\s+[\[\]\w.]+[^"\r\n]*|UPDATE\s+[\[\]\w.]+\s+SET\s+[^"\r\n]+|DELETE\s+FROM\s+[\[\]\w.]+[^"\r\n]*)"#,
    )
    .unwrap()
});
static PROJECT_ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^(Form|Module|Class|UserControl|PropertyPage|Designer)\s*=\s*(.+?)\s*$")
        .unwrap()
});
static OBJECT_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?im)^Object\s*=\s*"?\{[^}]*\}[^;]*;\s*"?([^"\r\n]+?)"?\s*$"#).unwrap());
static NEW_INSTANCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bNew\s+(\w+)").unwrap());
static MEMBER_ACCESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Za-z]\w*)\.[A-Za-z]\w*").unwrap());

/// Identificadores del runtime de VB6 que nunca son ficheros del proyecto.
const BUILTIN_OBJECTS: &[&str] = &[
    "me", "vb", "app", "screen", "err", "debug", "printer", "clipboard", "forms", "collection",
    "string", "adodb", "dao", "scripting", "vba",
];

/// Prefijos de manejadores de eventos que no corresponden a controles.
const OWNER_EVENT_PREFIXES: &[&str] = &["form", "mdiform", "usercontrol", "propertypage", "class"];

/// Resumen de los resultados de una operación de ingesta.
#[derive(Debug, Default)]
pub struct IngestionSummary {
    pub files_scanned: u32,
    pub files_ingested: u32,
    pub files_skipped: u32,
}

impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} ficheros escaneados, {} ingeridos, {} omitidos.",
            self.files_scanned, self.files_ingested, self.files_skipped
        )
    }
}

/// Resultado de la ingesta: registros ordenados por ruta y huecos recuperados.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    pub records: Vec<FileRecord>,
    pub omissions: Vec<Omission>,
    pub summary: IngestionSummary,
}

/// Recorre recursivamente `root` y construye un `FileRecord` por cada fichero
/// VB6 reconocido. Los ficheros ilegibles se registran como omisiones.
pub fn ingest_directory(root: &Path) -> Result<IngestOutcome> {
    if !root.is_dir() {
        return Err(MigrationError::NotADirectory(root.display().to_string()));
    }

    let mut outcome = IngestOutcome::default();
    let entries: Vec<_> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .collect();

    for entry in entries {
        outcome.summary.files_scanned += 1;
        let path = entry.path();
        let relative = relative_path(root, path);

        let kind = path
            .extension()
            .and_then(std::ffi::OsStr::to_str)
            .and_then(FileKind::from_extension);
        let Some(kind) = kind else {
            outcome.summary.files_skipped += 1;
            continue;
        };

        let content = if kind == FileKind::BinaryResource {
            binary_placeholder(&relative)
        } else {
            match fs::read(path) {
                Ok(bytes) => decode_text(&bytes),
                Err(err) => {
                    warn!("No se pudo leer {}: {err}", path.display());
                    outcome.summary.files_skipped += 1;
                    outcome
                        .omissions
                        .push(Omission::new(&relative, format!("fichero ilegible: {err}")));
                    continue;
                }
            }
        };

        outcome.records.push(FileRecord::parse(relative, kind, content));
        outcome.summary.files_ingested += 1;
    }

    outcome.records.sort_by(|a, b| a.path.cmp(&b.path));
    info!("Ingesta de {} completada. {}", root.display(), outcome.summary);
    Ok(outcome)
}

impl FileRecord {
    /// Construye un registro desde memoria. `None` si la extensión no es VB6.
    pub fn from_source(path: impl Into<String>, content: impl Into<String>) -> Option<Self> {
        let path = normalize_path(&path.into());
        let kind = Path::new(&path)
            .extension()
            .and_then(std::ffi::OsStr::to_str)
            .and_then(FileKind::from_extension)?;
        Some(Self::parse(path, kind, content.into()))
    }

    fn parse(path: String, kind: FileKind, content: String) -> Self {
        let facts = if kind == FileKind::BinaryResource {
            SourceFacts::default()
        } else {
            extract_facts(kind, &content)
        };
        let dependencies = declared_dependencies(kind, &content);
        let references = if kind.is_code() {
            inferred_references(&content, &facts)
        } else {
            Vec::new()
        };
        Self {
            path,
            kind,
            content,
            facts,
            dependencies,
            references,
        }
    }
}

/// UTF-8 si es válido; si no, Latin-1 (cada byte es un carácter).
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn binary_placeholder(path: &str) -> String {
    format!("[Recurso binario: {path}. Contenido no legible.]")
}

fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    normalize_path(&rel.to_string_lossy())
}

fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches("./").to_string()
}

/// Extrae controles, eventos, rutinas, propiedades y consultas de un fichero.
pub fn extract_facts(kind: FileKind, content: &str) -> SourceFacts {
    let controls = if kind.is_ui() {
        scan_controls(content)
    } else {
        Vec::new()
    };

    let control_names: HashSet<String> = controls.iter().map(|c| c.name.to_lowercase()).collect();
    let mut events = Vec::new();
    let mut routines = Vec::new();

    for caps in SUB_OR_FUNCTION.captures_iter(content) {
        let is_function = caps[1].eq_ignore_ascii_case("Function");
        let name = caps[2].to_string();
        if !is_function && is_event_handler(&name, &control_names) {
            if !events.contains(&name) {
                events.push(name);
            }
            continue;
        }
        routines.push(Routine {
            name,
            is_function,
            parameters: parse_parameters(&caps[3]),
            return_type: caps.get(4).map(|m| m.as_str().to_string()),
        });
    }

    let mut properties = Vec::new();
    for caps in CLASS_PROPERTY.captures_iter(content) {
        let name = caps[1].to_string();
        if !properties.contains(&name) {
            properties.push(name);
        }
    }

    SourceFacts {
        controls,
        events,
        routines,
        properties,
        queries: extract_queries(content),
    }
}

fn is_event_handler(name: &str, control_names: &HashSet<String>) -> bool {
    let Some((owner, event)) = name.split_once('_') else {
        return false;
    };
    if event.is_empty() {
        return false;
    }
    let owner = owner.to_lowercase();
    OWNER_EVENT_PREFIXES.contains(&owner.as_str()) || control_names.contains(&owner)
}

/// Recorre los bloques `Begin ... End` (anidados) de la cabecera del formulario.
fn scan_controls(content: &str) -> Vec<Control> {
    // pila de índices en `controls`; `None` para bloques BeginProperty
    let mut stack: Vec<Option<usize>> = Vec::new();
    let mut controls: Vec<Control> = Vec::new();

    for raw in content.lines() {
        let line = raw.trim();
        if let Some(caps) = CONTROL_BEGIN.captures(line) {
            controls.push(Control {
                kind: caps[2].to_string(),
                name: caps[3].to_string(),
                properties: Default::default(),
            });
            stack.push(Some(controls.len() - 1));
        } else if line.starts_with("BeginProperty") {
            stack.push(None);
        } else if line == "EndProperty" || line == "End" {
            stack.pop();
            if stack.is_empty() {
                // fin de la cabecera: el resto es código
                break;
            }
        } else if let Some(Some(idx)) = stack.last() {
            if let Some(caps) = PROPERTY_LINE.captures(line) {
                let value = caps[2].trim().trim_matches('"').to_string();
                controls[*idx].properties.insert(caps[1].to_string(), value);
            }
        }
    }
    controls
}

fn parse_parameters(raw: &str) -> Vec<Parameter> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .filter_map(|p| {
            let p = p.split('=').next().unwrap_or(p).trim();
            let mut words: Vec<&str> = p
                .split_whitespace()
                .filter(|w| {
                    !matches!(
                        w.to_lowercase().as_str(),
                        "optional" | "byval" | "byref" | "paramarray"
                    )
                })
                .collect();
            if words.is_empty() {
                return None;
            }
            let name = words.remove(0).trim_end_matches("()").to_string();
            let data_type = match words.as_slice() {
                [as_kw, ty, ..] if as_kw.eq_ignore_ascii_case("as") => ty.to_string(),
                _ => "Variant".to_string(),
            };
            Some(Parameter { name, data_type })
        })
        .collect()
}

/// Sentencias SQL encontradas en líneas de código (no en comentarios).
pub fn extract_queries(content: &str) -> Vec<String> {
    let mut queries = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with('\'') || trimmed.to_lowercase().starts_with("rem ") {
            continue;
        }
        for m in SQL_STATEMENT.find_iter(line) {
            let query = m.as_str().trim().to_string();
            if !queries.contains(&query) {
                queries.push(query);
            }
        }
    }
    queries
}

fn declared_dependencies(kind: FileKind, content: &str) -> Vec<String> {
    let mut deps: Vec<String> = Vec::new();
    let mut push = |token: &str| {
        let token = token.trim().trim_matches('"').to_string();
        if !token.is_empty() && !deps.contains(&token) {
            deps.push(token);
        }
    };

    if kind == FileKind::Project {
        for caps in PROJECT_ENTRY.captures_iter(content) {
            let value = &caps[2];
            // `Module=Nombre; Fichero.bas` → nos quedamos con el fichero
            let file = value.split_once(';').map(|(_, f)| f).unwrap_or(value);
            push(file);
        }
    }
    for caps in OBJECT_REFERENCE.captures_iter(content) {
        push(&caps[1]);
    }
    deps
}

fn inferred_references(content: &str, facts: &SourceFacts) -> Vec<String> {
    let locals: HashSet<String> = facts
        .controls
        .iter()
        .map(|c| c.name.to_lowercase())
        .collect();
    let mut refs: Vec<String> = Vec::new();

    let code = content
        .lines()
        .filter(|l| {
            let t = l.trim_start();
            !t.starts_with('\'') && !t.starts_with("Attribute ") && !t.starts_with("Begin ")
        })
        .collect::<Vec<_>>()
        .join("\n");

    let candidates = NEW_INSTANCE
        .captures_iter(&code)
        .chain(MEMBER_ACCESS.captures_iter(&code))
        .map(|caps| caps[1].to_string());

    for token in candidates {
        let lower = token.to_lowercase();
        if BUILTIN_OBJECTS.contains(&lower.as_str()) || locals.contains(&lower) {
            continue;
        }
        if !refs.contains(&token) {
            refs.push(token);
        }
    }
    refs
}

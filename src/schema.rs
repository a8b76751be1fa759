//! Inferencia del esquema relacional a partir de las consultas SQL embebidas.
//!
//! Es una heurística basada en patrones, no un parser SQL: agrupa las
//! consultas por tabla, descubre columnas y deduce tipos por el uso de
//! literales y por el nombre de la columna.
//!
//! Política de conflictos: cada observación de una columna aporta un tipo y
//! un nivel de evidencia (literal > nombre > ninguna). Gana el tipo con mayor
//! nivel; a igual nivel, el más frecuente; a igual frecuencia, el primero
//! observado. `unknown` solo gana si no hay otra evidencia.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::{FileRecord, Omission};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Decimal,
    Boolean,
    DateTime,
    Text,
    Unknown,
}

impl ColumnType {
    /// Tipo C# equivalente; `unknown` se emite como `string`.
    pub fn csharp_type(self) -> &'static str {
        match self {
            Self::Integer => "int",
            Self::Decimal => "decimal",
            Self::Boolean => "bool",
            Self::DateTime => "DateTime",
            Self::Text | Self::Unknown => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    /// Ficheros legados cuyas consultas tocan la tabla.
    #[serde(default)]
    pub source_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaModel {
    pub tables: Vec<TableDescriptor>,
}

impl SchemaModel {
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Tablas referenciadas por un fichero legado.
    pub fn tables_for_file<'a>(&'a self, file: &'a str) -> impl Iterator<Item = &'a TableDescriptor> {
        self.tables
            .iter()
            .filter(move |t| t.source_files.iter().any(|f| f == file))
    }
}

/// Consulta extraída de un fichero concreto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFragment {
    pub file: String,
    pub text: String,
}

impl QueryFragment {
    /// Todas las consultas de los registros, en orden de ruta y aparición.
    pub fn collect(records: &[FileRecord]) -> Vec<Self> {
        records
            .iter()
            .flat_map(|r| {
                r.facts.queries.iter().map(move |q| Self {
                    file: r.path.clone(),
                    text: q.clone(),
                })
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct SchemaInference {
    pub model: SchemaModel,
    pub omissions: Vec<Omission>,
}

static TABLE_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(FROM|JOIN|INTO|UPDATE)\s+([\[\]\w.]+)(?:\s+(?:AS\s+)?(\w+))?").unwrap()
});
static SELECT_LIST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^\s*SELECT\s+(?:DISTINCT\s+|TOP\s+\d+\s+)?(.+?)\s+FROM\s").unwrap());
static INSERT_COLUMNS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)INSERT\s+INTO\s+[\[\]\w.]+\s*\(([^)]*)\)(?:\s*VALUES\s*\(([^)]*)\))?").unwrap()
});
static COMPARISON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)((?:[\[\]\w]+\.)?[\[\]\w]+)\s*(?:<>|<=|>=|=|<|>|\bLIKE\b)\s*('[^']*'|#[^#]*#|-?\d+\.\d+|-?\d+\b|\bTRUE\b|\bFALSE\b|\?|(?:[\[\]\w]+\.)?[\[\]\w]+)",
    )
    .unwrap()
});
static SIMPLE_COLUMN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:([\[\]\w]+)\.)?([\[\]\w]+)$").unwrap());
static AGGREGATE_ARG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\w+\(\s*(?:DISTINCT\s+)?((?:[\[\]\w]+\.)?[\[\]\w]+)\s*\)$").unwrap());
static COLUMN_ALIAS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\s+AS\s+").unwrap());
static ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^'\d{4}-\d{2}-\d{2}(?:[ T]\d{2}:\d{2}(?::\d{2})?)?'$").unwrap());

const SQL_KEYWORDS: &[&str] = &[
    "and", "or", "not", "null", "where", "set", "values", "select", "from", "on", "is", "in",
    "like", "between", "as", "by", "order", "group", "having", "join", "inner", "left", "right",
    "outer", "top", "distinct", "case", "when", "then", "else", "end", "update", "into", "insert",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Evidence {
    None = 0,
    Name = 1,
    Literal = 2,
}

#[derive(Debug, Clone, Copy)]
struct Tally {
    evidence: Evidence,
    count: usize,
    first_seen: usize,
}

#[derive(Debug, Default)]
struct ColumnAccumulator {
    name: String,
    tallies: IndexMap<ColumnType, Tally>,
}

impl ColumnAccumulator {
    fn observe(&mut self, column_type: ColumnType, evidence: Evidence, seq: usize) {
        let tally = self.tallies.entry(column_type).or_insert(Tally {
            evidence,
            count: 0,
            first_seen: seq,
        });
        tally.count += 1;
        tally.evidence = tally.evidence.max(evidence);
    }

    fn resolve(&self) -> ColumnType {
        self.tallies
            .iter()
            .filter(|(ty, _)| **ty != ColumnType::Unknown)
            .max_by(|(_, a), (_, b)| {
                a.evidence
                    .cmp(&b.evidence)
                    .then(a.count.cmp(&b.count))
                    // primero observado gana: menor `first_seen` es "mayor"
                    .then(b.first_seen.cmp(&a.first_seen))
            })
            .map(|(ty, _)| *ty)
            .unwrap_or(ColumnType::Unknown)
    }
}

#[derive(Debug, Default)]
struct TableAccumulator {
    name: String,
    columns: IndexMap<String, ColumnAccumulator>,
    source_files: Vec<String>,
}

#[derive(Default)]
struct Inferrer {
    tables: IndexMap<String, TableAccumulator>,
    seq: usize,
}

impl Inferrer {
    fn table_mut(&mut self, raw: &str, file: &str) -> &mut TableAccumulator {
        let name = clean_identifier(raw);
        let key = name.to_lowercase();
        let table = self.tables.entry(key).or_insert_with(|| TableAccumulator {
            name,
            ..Default::default()
        });
        if !table.source_files.iter().any(|f| f == file) {
            table.source_files.push(file.to_string());
        }
        table
    }

    fn observe(&mut self, table_key: &str, column: &str, literal: Option<ColumnType>) {
        let column = clean_identifier(column);
        if column.is_empty()
            || column.starts_with(|c: char| c.is_ascii_digit())
            || SQL_KEYWORDS.contains(&column.to_lowercase().as_str())
        {
            return;
        }
        self.seq += 1;
        let seq = self.seq;
        let Some(table) = self.tables.get_mut(table_key) else {
            return;
        };
        let acc = table
            .columns
            .entry(column.to_lowercase())
            .or_insert_with(|| ColumnAccumulator {
                name: column.clone(),
                ..Default::default()
            });
        match literal {
            Some(ty) => acc.observe(ty, Evidence::Literal, seq),
            None => match type_from_name(&column) {
                Some(ty) => acc.observe(ty, Evidence::Name, seq),
                None => acc.observe(ColumnType::Unknown, Evidence::None, seq),
            },
        }
    }

    /// Procesa una consulta. `false` si no se encontró ninguna tabla.
    fn ingest(&mut self, fragment: &QueryFragment) -> bool {
        let text = fragment.text.as_str();

        // alias → clave de tabla; la primera tabla es la principal
        let mut aliases: IndexMap<String, String> = IndexMap::new();
        let mut primary: Option<String> = None;
        for caps in TABLE_REF.captures_iter(text) {
            let raw = &caps[2];
            if SQL_KEYWORDS.contains(&raw.to_lowercase().as_str()) {
                continue;
            }
            let key = self.table_mut(raw, &fragment.file).name.to_lowercase();
            aliases.insert(key.clone(), key.clone());
            if let Some(alias) = caps.get(3) {
                let alias = alias.as_str().to_lowercase();
                if !SQL_KEYWORDS.contains(&alias.as_str()) {
                    aliases.insert(alias, key.clone());
                }
            }
            // el último tramo de `dbo.orders` también sirve de calificador
            if let Some(short) = raw.rsplit('.').next() {
                aliases.insert(clean_identifier(short).to_lowercase(), key.clone());
            }
            primary.get_or_insert(key);
        }
        let Some(primary) = primary else {
            return false;
        };

        let resolve_owner = |qualified: Option<&str>| -> String {
            qualified
                .and_then(|q| aliases.get(&clean_identifier(q).to_lowercase()).cloned())
                .unwrap_or_else(|| primary.clone())
        };

        let mut observations: Vec<(String, String, Option<ColumnType>)> = Vec::new();

        if let Some(caps) = SELECT_LIST.captures(text) {
            for item in split_top_level(&caps[1]) {
                let item = strip_alias(item.trim());
                let target = SIMPLE_COLUMN
                    .captures(item)
                    .or_else(|| AGGREGATE_ARG.captures(item).and_then(|c| {
                        c.get(1).and_then(|m| SIMPLE_COLUMN.captures(m.as_str()))
                    }));
                if let Some(col) = target {
                    let owner = resolve_owner(col.get(1).map(|m| m.as_str()));
                    observations.push((owner, col[2].to_string(), None));
                }
            }
        }

        if let Some(caps) = INSERT_COLUMNS.captures(text) {
            let columns: Vec<&str> = caps[1].split(',').map(str::trim).collect();
            let values: Vec<String> = caps
                .get(2)
                .map(|v| split_top_level(v.as_str()).into_iter().map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            for (i, column) in columns.iter().enumerate() {
                let literal = values.get(i).and_then(|v| literal_type(v));
                observations.push((primary.clone(), column.to_string(), literal));
            }
        }

        for caps in COMPARISON.captures_iter(text) {
            let Some(col) = SIMPLE_COLUMN.captures(&caps[1]) else {
                continue;
            };
            let owner = resolve_owner(col.get(1).map(|m| m.as_str()));
            let right = &caps[2];
            let literal = literal_type(right);
            observations.push((owner, col[2].to_string(), literal));
            // comparación entre columnas (`o.customer_id = c.id`)
            if literal.is_none() {
                if let Some(other) = SIMPLE_COLUMN.captures(right) {
                    let owner = resolve_owner(other.get(1).map(|m| m.as_str()));
                    observations.push((owner, other[2].to_string(), None));
                }
            }
        }

        for (owner, column, literal) in observations {
            self.observe(&owner, &column, literal);
        }
        true
    }

    fn finish(self) -> SchemaModel {
        let tables = self
            .tables
            .into_values()
            .map(|t| TableDescriptor {
                name: t.name,
                columns: t
                    .columns
                    .into_values()
                    .map(|c| ColumnDescriptor {
                        column_type: c.resolve(),
                        name: c.name,
                    })
                    .collect(),
                source_files: t.source_files,
            })
            .collect();
        SchemaModel { tables }
    }
}

/// Infiere el esquema. Las tablas y columnas salen en orden de primera
/// aparición; las consultas sin tabla reconocible se registran como omisiones.
pub fn infer_schema(fragments: &[QueryFragment]) -> SchemaInference {
    let mut inferrer = Inferrer::default();
    let mut omissions = Vec::new();

    for fragment in fragments {
        if !inferrer.ingest(fragment) {
            debug!(file = %fragment.file, "Consulta sin tabla reconocible: {}", fragment.text);
            omissions.push(Omission::new(
                &fragment.file,
                format!("consulta no interpretable: {}", fragment.text),
            ));
        }
    }

    let model = inferrer.finish();
    info!(
        "Esquema inferido: {} tablas a partir de {} consultas.",
        model.tables.len(),
        fragments.len()
    );
    SchemaInference { model, omissions }
}

fn clean_identifier(raw: &str) -> String {
    let last = raw.rsplit('.').next().unwrap_or(raw);
    last.trim_matches(|c| c == '[' || c == ']' || c == '`' || c == '"')
        .to_string()
}

fn strip_alias(item: &str) -> &str {
    // offsets sobre el texto original: no vale buscar en una copia en minúsculas
    match COLUMN_ALIAS.find_iter(item).last() {
        Some(m) => item[..m.start()].trim(),
        None => item,
    }
}

/// Divide por comas que no estén dentro de paréntesis ni de comillas.
fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in list.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth -= 1,
            ',' if !quoted && depth == 0 => {
                parts.push(&list[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&list[start..]);
    parts
}

fn literal_type(literal: &str) -> Option<ColumnType> {
    let lit = literal.trim();
    if lit.starts_with('#') || ISO_DATE.is_match(lit) {
        Some(ColumnType::DateTime)
    } else if lit.starts_with('\'') {
        Some(ColumnType::Text)
    } else if lit.eq_ignore_ascii_case("true") || lit.eq_ignore_ascii_case("false") {
        Some(ColumnType::Boolean)
    } else if lit.parse::<i64>().is_ok() {
        Some(ColumnType::Integer)
    } else if lit.parse::<f64>().is_ok() {
        Some(ColumnType::Decimal)
    } else {
        None
    }
}

/// Heurística por nombre de columna.
fn type_from_name(column: &str) -> Option<ColumnType> {
    let lower = column.to_lowercase();
    let ends_with_id = lower == "id"
        || lower.ends_with("_id")
        || (column.len() > 2 && column.ends_with("Id") && !column.ends_with("_Id"))
        || column.ends_with("ID");

    if ends_with_id {
        Some(ColumnType::Integer)
    } else if lower.contains("date") || lower.contains("time") || lower.ends_with("_at") {
        Some(ColumnType::DateTime)
    } else if lower.starts_with("is_")
        || lower.starts_with("has_")
        || (column.starts_with("Is") && column.chars().nth(2).is_some_and(char::is_uppercase))
        || matches!(lower.as_str(), "active" | "enabled" | "deleted")
    {
        Some(ColumnType::Boolean)
    } else if ["price", "amount", "total", "cost", "balance", "salary"]
        .iter()
        .any(|k| lower.contains(k))
    {
        Some(ColumnType::Decimal)
    } else if ["qty", "quantity", "count"].iter().any(|k| lower.contains(k)) {
        Some(ColumnType::Integer)
    } else if ["name", "email", "phone", "address", "description", "code", "title", "city"]
        .iter()
        .any(|k| lower.contains(k))
    {
        Some(ColumnType::Text)
    } else {
        None
    }
}

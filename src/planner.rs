//! Planificador de arquitectura destino (.NET 8 Worker Service + MVC).
//!
//! Reglas de correspondencia:
//! - cada tabla del esquema → un `model`;
//! - cada fichero con evidencia de temporizador → un `worker`;
//! - el resto de ficheros de código con rutinas o consultas → `interface` + `service`;
//! - los formularios restantes → `controller` + `view`;
//! - siempre: `.csproj`, `Program.cs` y `appsettings.json`.
//!
//! El plan es un documento JSON que el usuario puede editar antes de migrar.

use std::collections::{BTreeSet, HashMap, HashSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::PipelineSettings;
use crate::error::PlanError;
use crate::graph::DependencyGraph;
use crate::models::{AnalysisSummary, Control, FileRecord, Routine};
use crate::schema::SchemaModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Model,
    Interface,
    Service,
    Controller,
    View,
    Worker,
    Boilerplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(rename = "type", alias = "dataType", alias = "data_type")]
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ParameterDescriptor {
    pub name: String,
    #[serde(rename = "type", alias = "dataType", alias = "data_type")]
    pub data_type: String,
}

fn void() -> String {
    "void".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MethodDescriptor {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterDescriptor>,
    #[serde(default = "void", alias = "returnType")]
    pub return_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UiComponentDescriptor {
    pub name: String,
    /// Tipo del control VB6 (`TextBox`, `CommandButton`...).
    #[serde(alias = "legacyType")]
    pub legacy_type: String,
    /// Elemento HTML sugerido para la vista Razor.
    #[serde(default, alias = "htmlElement")]
    pub html_element: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TargetFileDescriptor {
    /// Ruta relativa dentro del proyecto destino; identidad del fichero.
    #[serde(alias = "filePath", alias = "file_path")]
    pub path: String,
    #[serde(alias = "type")]
    pub kind: TargetKind,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub description: String,
    /// Ficheros VB6 de los que procede.
    #[serde(default, alias = "sourceFiles")]
    pub source_files: Vec<String>,
    /// Tipos .NET de los que depende (interfaces, modelos).
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub properties: Vec<PropertyDescriptor>,
    #[serde(default)]
    pub methods: Vec<MethodDescriptor>,
    #[serde(default, alias = "uiComponents")]
    pub ui_components: Vec<UiComponentDescriptor>,
    #[serde(default, alias = "intervalMs", skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
}

impl TargetFileDescriptor {
    pub fn new(path: String, kind: TargetKind, namespace: String) -> Self {
        Self {
            path,
            kind,
            namespace,
            description: String::new(),
            source_files: Vec::new(),
            dependencies: Vec::new(),
            properties: Vec::new(),
            methods: Vec::new(),
            ui_components: Vec::new(),
            interval_ms: None,
        }
    }

    /// Nombre del tipo principal del fichero (el stem de la ruta).
    pub fn type_name(&self) -> &str {
        crate::models::file_stem(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArchitecturePlan {
    #[serde(alias = "projectName")]
    pub project_name: String,
    #[serde(default, alias = "rootNamespace", alias = "namespace")]
    pub root_namespace: String,
    pub files: Vec<TargetFileDescriptor>,
}

impl ArchitecturePlan {
    pub fn to_json(&self) -> Result<String, PlanError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parsea y valida un plan (por ejemplo, uno editado por el usuario).
    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        let mut plan: Self = serde_json::from_str(json)?;
        if plan.root_namespace.trim().is_empty() {
            plan.root_namespace = identifier(&plan.project_name);
        }
        plan.validate()?;
        Ok(plan)
    }

    pub fn target_paths(&self) -> BTreeSet<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    pub fn descriptor(&self, path: &str) -> Option<&TargetFileDescriptor> {
        self.files.iter().find(|f| f.path == path)
    }

    pub fn count(&self, kind: TargetKind) -> usize {
        self.files.iter().filter(|f| f.kind == kind).count()
    }

    /// Rutas relativas, sin `..`, y únicas sin distinguir mayúsculas.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut seen = HashSet::new();
        for file in &self.files {
            let normalized = file.path.replace('\\', "/");
            let unsafe_path = normalized.trim().is_empty()
                || normalized.starts_with('/')
                || normalized.chars().nth(1) == Some(':')
                || normalized.split('/').any(|part| part == ".." || part.is_empty());
            if unsafe_path {
                return Err(PlanError::UnsafePath(file.path.clone()));
            }
            if !seen.insert(normalized.to_lowercase()) {
                return Err(PlanError::DuplicatePath(file.path.clone()));
            }
        }
        Ok(())
    }
}

/// JSON Schema publicado del plan, para editores y clientes.
pub fn plan_schema() -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(schemars::schema_for!(ArchitecturePlan))
}

/// Propone el plan a partir del análisis. Determinista para una entrada fija.
pub fn plan_architecture(
    records: &[FileRecord],
    summaries: &[AnalysisSummary],
    schema: &SchemaModel,
    graph: &DependencyGraph,
    settings: &PipelineSettings,
) -> ArchitecturePlan {
    let root = identifier(&settings.project_name);
    let by_file: HashMap<&str, &AnalysisSummary> =
        summaries.iter().map(|s| (s.file.as_str(), s)).collect();
    let mut paths = PathAllocator::default();
    let mut files = Vec::new();

    // modelos
    let mut model_of_table: HashMap<String, String> = HashMap::new();
    for table in &schema.tables {
        let path = paths.claim(format!("Models/{}.cs", pascal_case(&table.name)));
        let mut model = TargetFileDescriptor::new(path, TargetKind::Model, format!("{root}.Models"));
        model.description = format!("Entidad de la tabla '{}'", table.name);
        model.source_files = table.source_files.clone();
        model.properties = table
            .columns
            .iter()
            .map(|c| PropertyDescriptor {
                name: pascal_case(&c.name),
                data_type: c.column_type.csharp_type().to_string(),
            })
            .collect();
        model_of_table.insert(table.name.to_lowercase(), model.type_name().to_string());
        files.push(model);
    }

    // qué tipo .NET representa a cada fichero legado, para las dependencias
    let mut classified = Vec::new();
    let mut primary_type: HashMap<&str, String> = HashMap::new();
    for record in records.iter().filter(|r| r.kind.is_code()) {
        let summary = by_file.get(record.path.as_str()).copied();
        let role = classify(record, summary);
        let name = type_name(record.stem());
        match role {
            Role::Service => {
                primary_type.insert(&record.path, format!("I{name}Service"));
            }
            Role::Worker | Role::Controller | Role::Skip => {}
        }
        classified.push((record, summary, role, name));
    }

    for (record, summary, role, name) in classified {
        let mut dependencies: Vec<String> = schema
            .tables_for_file(&record.path)
            .filter_map(|t| model_of_table.get(&t.name.to_lowercase()).cloned())
            .collect();
        for target in graph.successors(&record.path) {
            if let Some(ty) = primary_type.get(target) {
                if !dependencies.contains(ty) {
                    dependencies.push(ty.clone());
                }
            }
        }
        let description = summary.map(|s| s.purpose.clone()).unwrap_or_default();
        let methods: Vec<MethodDescriptor> = record.facts.routines.iter().map(method).collect();

        match role {
            Role::Worker => {
                let path = paths.claim(format!("Workers/{name}Worker.cs"));
                let mut worker = TargetFileDescriptor::new(path, TargetKind::Worker, format!("{root}.Workers"));
                worker.description = description;
                worker.source_files = vec![record.path.clone()];
                worker.dependencies = dependencies;
                worker.methods = methods;
                worker.interval_ms = Some(
                    record
                        .facts
                        .timer_interval_ms()
                        .unwrap_or(settings.worker_interval_ms),
                );
                files.push(worker);
            }
            Role::Service => {
                let interface_name = format!("I{name}Service");
                let path = paths.claim(format!("Interfaces/{interface_name}.cs"));
                let mut interface =
                    TargetFileDescriptor::new(path, TargetKind::Interface, format!("{root}.Interfaces"));
                interface.description = description.clone();
                interface.source_files = vec![record.path.clone()];
                interface.dependencies = dependencies.clone();
                interface.methods = methods.clone();
                files.push(interface);

                let path = paths.claim(format!("Services/{name}Service.cs"));
                let mut service =
                    TargetFileDescriptor::new(path, TargetKind::Service, format!("{root}.Services"));
                service.description = description;
                service.source_files = vec![record.path.clone()];
                service.dependencies = std::iter::once(interface_name)
                    .chain(dependencies)
                    .collect();
                service.methods = methods;
                service.properties = record
                    .facts
                    .properties
                    .iter()
                    .map(|p| PropertyDescriptor {
                        name: p.clone(),
                        data_type: "object".to_string(),
                    })
                    .collect();
                files.push(service);
            }
            Role::Controller => {
                let ui: Vec<UiComponentDescriptor> = record
                    .facts
                    .controls
                    .iter()
                    .filter(|c| !is_container(c))
                    .map(ui_component)
                    .collect();

                let path = paths.claim(format!("Controllers/{name}Controller.cs"));
                let mut controller =
                    TargetFileDescriptor::new(path, TargetKind::Controller, format!("{root}.Controllers"));
                controller.description = description.clone();
                controller.source_files = vec![record.path.clone()];
                controller.dependencies = dependencies;
                controller.methods = std::iter::once(MethodDescriptor {
                    name: "Index".to_string(),
                    parameters: Vec::new(),
                    return_type: "IActionResult".to_string(),
                })
                .chain(methods)
                .collect();
                controller.ui_components = ui.clone();
                files.push(controller);

                let path = paths.claim(format!("Views/{name}/Index.cshtml"));
                let mut view = TargetFileDescriptor::new(path, TargetKind::View, format!("{root}.Views"));
                view.description = description;
                view.source_files = vec![record.path.clone()];
                view.ui_components = ui;
                files.push(view);
            }
            Role::Skip => {}
        }
    }

    for (path, description) in [
        (format!("{root}.csproj"), "Proyecto .NET 8"),
        ("Program.cs".to_string(), "Host y registro de servicios"),
        ("appsettings.json".to_string(), "Configuración de la aplicación"),
    ] {
        let path = paths.claim(path);
        let mut file = TargetFileDescriptor::new(path, TargetKind::Boilerplate, root.clone());
        file.description = description.to_string();
        files.push(file);
    }
    if files.iter().any(|f| f.kind == TargetKind::View) {
        for (path, description) in [
            ("Views/_ViewImports.cshtml", "Usings y tag helpers de Razor"),
            ("Views/_ViewStart.cshtml", "Layout por defecto"),
            ("Views/Shared/_Layout.cshtml", "Layout compartido"),
        ] {
            let path = paths.claim(path.to_string());
            let mut file = TargetFileDescriptor::new(path, TargetKind::Boilerplate, format!("{root}.Views"));
            file.description = description.to_string();
            files.push(file);
        }
    }

    let plan = ArchitecturePlan {
        project_name: settings.project_name.clone(),
        root_namespace: root,
        files,
    };
    info!(
        "Plan de arquitectura: {} ficheros ({} modelos, {} workers, {} servicios, {} controladores).",
        plan.files.len(),
        plan.count(TargetKind::Model),
        plan.count(TargetKind::Worker),
        plan.count(TargetKind::Service),
        plan.count(TargetKind::Controller),
    );
    plan
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Worker,
    Service,
    Controller,
    Skip,
}

fn classify(record: &FileRecord, summary: Option<&AnalysisSummary>) -> Role {
    let summarized_timer = summary.is_some_and(|s| {
        s.controls
            .iter()
            .any(|c| c.to_lowercase().contains("timer"))
    });
    if record.facts.has_timer_evidence() || summarized_timer {
        Role::Worker
    } else if record.kind.is_ui() {
        Role::Controller
    } else if !record.facts.routines.is_empty()
        || !record.facts.queries.is_empty()
        || !record.facts.properties.is_empty()
    {
        Role::Service
    } else {
        Role::Skip
    }
}

fn is_container(control: &Control) -> bool {
    matches!(
        control.kind.to_lowercase().as_str(),
        "form" | "mdiform" | "usercontrol" | "propertypage"
    )
}

fn ui_component(control: &Control) -> UiComponentDescriptor {
    let html = match control.kind.to_lowercase().as_str() {
        "textbox" | "maskedbox" => "input",
        "commandbutton" => "button",
        "label" => "label",
        "checkbox" => "input[type=checkbox]",
        "optionbutton" => "input[type=radio]",
        "combobox" | "listbox" => "select",
        "msflexgrid" | "datagrid" | "mshflexgrid" | "listview" => "table",
        "image" | "picturebox" => "img",
        _ => "div",
    };
    UiComponentDescriptor {
        name: control.name.clone(),
        legacy_type: control.kind.clone(),
        html_element: html.to_string(),
    }
}

fn method(routine: &Routine) -> MethodDescriptor {
    MethodDescriptor {
        name: routine.name.clone(),
        parameters: routine
            .parameters
            .iter()
            .map(|p| ParameterDescriptor {
                name: p.name.clone(),
                data_type: csharp_type(&p.data_type),
            })
            .collect(),
        return_type: if routine.is_function {
            csharp_type(routine.return_type.as_deref().unwrap_or("Variant"))
        } else {
            void()
        },
    }
}

/// Tipo C# para un tipo VB6. Los tipos de usuario se conservan.
pub fn csharp_type(vb_type: &str) -> String {
    match vb_type.to_lowercase().as_str() {
        "integer" | "long" => "int",
        "string" => "string",
        "boolean" => "bool",
        "double" => "double",
        "single" => "float",
        "currency" => "decimal",
        "date" => "DateTime",
        "byte" => "byte",
        "variant" | "object" => "object",
        _ => return identifier(vb_type),
    }
    .to_string()
}

/// Quita prefijos húngaros habituales (`frmOrders` → `Orders`).
fn type_name(stem: &str) -> String {
    for prefix in ["frm", "mod", "cls", "bas", "ctl", "usr"] {
        if let Some(rest) = stem.strip_prefix(prefix) {
            if rest.chars().next().is_some_and(char::is_uppercase) {
                return identifier(rest);
            }
        }
    }
    identifier(stem)
}

/// `order_items` → `OrderItems`.
pub(crate) fn pascal_case(raw: &str) -> String {
    let words: String = raw
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect();
    identifier(&words)
}

/// Identificador C# válido (sin símbolos, sin empezar por dígito).
fn identifier(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| c.is_alphanumeric() || *c == '_').collect();
    match cleaned.chars().next() {
        None => "Unnamed".to_string(),
        Some(c) if c.is_ascii_digit() => format!("_{cleaned}"),
        Some(c) => c.to_uppercase().chain(cleaned.chars().skip(1)).collect(),
    }
}

/// Reparte rutas únicas añadiendo un sufijo numérico en caso de colisión.
#[derive(Default)]
struct PathAllocator {
    taken: HashSet<String>,
}

impl PathAllocator {
    fn claim(&mut self, path: String) -> String {
        if self.taken.insert(path.to_lowercase()) {
            return path;
        }
        let (base, ext) = match path.rfind('.') {
            Some(pos) if !path[pos..].contains('/') => (&path[..pos], &path[pos..]),
            _ => (path.as_str(), ""),
        };
        (2..)
            .map(|n| format!("{base}{n}{ext}"))
            .find(|candidate| self.taken.insert(candidate.to_lowercase()))
            .unwrap_or(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{infer_schema, QueryFragment};
    use pretty_assertions::assert_eq;

    const TIMER_FORM: &str = r#"VERSION 5.00
Begin VB.Form frmPoll
   Begin VB.Timer tmrPoll
      Interval        =   5000
   End
End
Private Sub tmrPoll_Timer()
End Sub
"#;

    const ORDERS_FORM: &str = r#"VERSION 5.00
Begin VB.Form frmOrders
   Begin VB.TextBox txtCustomer
   End
   Begin VB.CommandButton cmdSave
   End
End
Private Sub cmdSave_Click()
   Utils.SaveOrder txtCustomer.Text
End Sub
"#;

    const UTILS: &str = r#"Attribute VB_Name = "Utils"
Public Function SaveOrder(ByVal customer As String) As Boolean
   cn.Execute "INSERT INTO orders (customer_name, total) VALUES ('x', 1.5)"
End Function
"#;

    fn plan_for(sources: &[(&str, &str)]) -> ArchitecturePlan {
        let records: Vec<FileRecord> = sources
            .iter()
            .map(|(p, c)| FileRecord::from_source(*p, *c).unwrap())
            .collect();
        let schema = infer_schema(&QueryFragment::collect(&records)).model;
        let graph = DependencyGraph::build(&records);
        plan_architecture(&records, &[], &schema, &graph, &PipelineSettings::default())
    }

    #[test]
    fn maps_tables_timers_code_and_ui() {
        let plan = plan_for(&[
            ("Orders.frm", ORDERS_FORM),
            ("Poll.frm", TIMER_FORM),
            ("Utils.bas", UTILS),
        ]);

        let model = plan.descriptor("Models/Orders.cs").unwrap();
        let props: Vec<(&str, &str)> = model
            .properties
            .iter()
            .map(|p| (p.name.as_str(), p.data_type.as_str()))
            .collect();
        assert_eq!(props, vec![("CustomerName", "string"), ("Total", "decimal")]);

        let worker = plan.descriptor("Workers/PollWorker.cs").unwrap();
        assert_eq!(worker.interval_ms, Some(5000));
        assert_eq!(plan.count(TargetKind::Worker), 1);

        let service = plan.descriptor("Services/UtilsService.cs").unwrap();
        assert_eq!(service.dependencies, vec!["IUtilsService", "Orders"]);
        assert_eq!(service.methods[0].return_type, "bool");
        assert!(plan.descriptor("Interfaces/IUtilsService.cs").is_some());

        let controller = plan.descriptor("Controllers/OrdersController.cs").unwrap();
        assert_eq!(controller.dependencies, vec!["IUtilsService"]);
        let ui: Vec<&str> = controller.ui_components.iter().map(|u| u.html_element.as_str()).collect();
        assert_eq!(ui, vec!["input", "button"]);
        assert!(plan.descriptor("Views/Orders/Index.cshtml").is_some());

        for boilerplate in [
            "MigratedWindowsService.csproj",
            "Program.cs",
            "appsettings.json",
            "Views/_ViewImports.cshtml",
            "Views/_ViewStart.cshtml",
            "Views/Shared/_Layout.cshtml",
        ] {
            assert_eq!(plan.descriptor(boilerplate).unwrap().kind, TargetKind::Boilerplate);
        }
    }

    #[test]
    fn no_timer_evidence_means_no_workers() {
        let plan = plan_for(&[("Utils.bas", UTILS)]);
        assert_eq!(plan.count(TargetKind::Worker), 0);
        assert_eq!(plan.count(TargetKind::Controller), 0);
        assert!(plan.descriptor("Views/Shared/_Layout.cshtml").is_none());
    }

    #[test]
    fn colliding_paths_get_suffixes() {
        let schema = infer_schema(&[
            QueryFragment { file: "A.bas".into(), text: "SELECT a FROM order_items".into() },
            QueryFragment { file: "A.bas".into(), text: "SELECT b FROM OrderItems_".into() },
        ])
        .model;
        let plan = plan_architecture(&[], &[], &schema, &DependencyGraph::default(), &PipelineSettings::default());
        let paths = plan.target_paths();
        assert!(paths.contains("Models/OrderItems.cs"));
        assert!(paths.contains("Models/OrderItems2.cs"));
        plan.validate().unwrap();
    }

    #[test]
    fn json_round_trip_preserves_paths_and_accepts_aliases() {
        let plan = plan_for(&[("Orders.frm", ORDERS_FORM), ("Utils.bas", UTILS)]);
        let restored = ArchitecturePlan::from_json(&plan.to_json().unwrap()).unwrap();
        assert_eq!(restored.target_paths(), plan.target_paths());
        assert_eq!(restored, plan);

        let edited = r#"{
            "projectName": "Billing",
            "files": [
                {"filePath": "Models/Invoice.cs", "type": "model",
                 "properties": [{"name": "Total", "dataType": "decimal"}]},
                {"filePath": "Services/BillingService.cs", "type": "service",
                 "methods": [{"name": "Run"}]}
            ]
        }"#;
        let plan = ArchitecturePlan::from_json(edited).unwrap();
        assert_eq!(plan.root_namespace, "Billing");
        assert_eq!(plan.files[0].properties[0].data_type, "decimal");
        assert_eq!(plan.files[1].methods[0].return_type, "void");
    }

    #[test]
    fn rejects_duplicate_and_unsafe_paths() {
        let file = |path: &str| TargetFileDescriptor::new(path.to_string(), TargetKind::Model, String::new());
        let mut plan = ArchitecturePlan {
            project_name: "P".into(),
            root_namespace: "P".into(),
            files: vec![file("Models/A.cs"), file("models/a.cs")],
        };
        assert!(matches!(plan.validate(), Err(PlanError::DuplicatePath(_))));
        plan.files = vec![file("../escape.cs")];
        assert!(matches!(plan.validate(), Err(PlanError::UnsafePath(_))));
        plan.files = vec![file("/etc/passwd")];
        assert!(matches!(plan.validate(), Err(PlanError::UnsafePath(_))));
    }

    #[test]
    fn schema_is_published() {
        let schema = plan_schema().unwrap();
        let text = schema.to_string();
        assert!(text.contains("files"));
        assert!(text.contains("interval_ms"));
    }
}

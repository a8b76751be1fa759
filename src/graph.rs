//! Grafo de dependencias entre ficheros legados.
//!
//! Representación en arena: los nodos son las rutas ordenadas
//! lexicográficamente y las aristas pares de índices `(origen, destino)`
//! ordenados y sin duplicados. El código legado puede tener ciclos, así que
//! todos los recorridos son iterativos con conjunto de visitados.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{file_stem, FileRecord, Omission};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    nodes: Vec<String>,
    edges: Vec<(usize, usize)>,
    #[serde(default)]
    omissions: Vec<Omission>,
}

impl DependencyGraph {
    /// Construye el grafo. Es una función pura del conjunto de entrada: el
    /// orden de `records` no influye en el resultado.
    ///
    /// Cada token se resuelve por coincidencia exacta, sin distinguir
    /// mayúsculas, con el "stem" de un fichero. Si varios ficheros comparten
    /// stem gana la ruta lexicográficamente menor. Los tokens declarados que
    /// no resuelven se registran como omisiones; los inferidos se descartan
    /// en silencio. Las auto-referencias se eliminan.
    pub fn build(records: &[FileRecord]) -> Self {
        let mut sorted: Vec<&FileRecord> = records.iter().collect();
        sorted.sort_by(|a, b| a.path.cmp(&b.path));
        sorted.dedup_by(|a, b| a.path == b.path);

        let nodes: Vec<String> = sorted.iter().map(|r| r.path.clone()).collect();

        // stem en minúsculas → primer índice (nodes ya está ordenado)
        let mut by_stem: HashMap<String, usize> = HashMap::new();
        for (idx, path) in nodes.iter().enumerate() {
            by_stem.entry(file_stem(path).to_lowercase()).or_insert(idx);
        }

        let mut edges = BTreeSet::new();
        let mut omissions = Vec::new();

        for (from, record) in sorted.iter().enumerate() {
            let declared = record.dependencies.iter().map(|t| (t, true));
            let inferred = record.references.iter().map(|t| (t, false));
            for (token, is_declared) in declared.chain(inferred) {
                match by_stem.get(&file_stem(token).to_lowercase()) {
                    Some(&to) if to != from => {
                        edges.insert((from, to));
                    }
                    Some(_) => {}
                    None if is_declared => {
                        omissions.push(Omission::new(
                            &record.path,
                            format!("referencia sin resolver: {token}"),
                        ));
                    }
                    None => {}
                }
            }
        }

        debug!(
            nodes = nodes.len(),
            edges = edges.len(),
            omitted = omissions.len(),
            "Grafo de dependencias construido"
        );

        Self {
            nodes,
            edges: edges.into_iter().collect(),
            omissions,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Referencias que no se pudieron resolver.
    pub fn omissions(&self) -> &[Omission] {
        &self.omissions
    }

    /// Aristas `(origen, destino)` como rutas, en orden estable.
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.edges
            .iter()
            .map(|&(a, b)| (self.nodes[a].as_str(), self.nodes[b].as_str()))
    }

    pub fn contains_edge(&self, from: &str, to: &str) -> bool {
        match (self.index_of(from), self.index_of(to)) {
            (Some(a), Some(b)) => self.edges.binary_search(&(a, b)).is_ok(),
            _ => false,
        }
    }

    /// Ficheros referenciados directamente por `path`.
    pub fn successors(&self, path: &str) -> Vec<&str> {
        let Some(idx) = self.index_of(path) else {
            return Vec::new();
        };
        self.edges
            .iter()
            .filter(|(a, _)| *a == idx)
            .map(|&(_, b)| self.nodes[b].as_str())
            .collect()
    }

    pub fn in_degree(&self, path: &str) -> usize {
        self.index_of(path)
            .map(|idx| self.edges.iter().filter(|(_, b)| *b == idx).count())
            .unwrap_or(0)
    }

    /// Centralidad normalizada: aristas entrantes / máximo de aristas entrantes.
    /// Todos los nodos valen 0.0 si el grafo no tiene aristas.
    pub fn centrality(&self) -> BTreeMap<String, f64> {
        let mut incoming = vec![0usize; self.nodes.len()];
        for &(_, b) in &self.edges {
            incoming[b] += 1;
        }
        let max = incoming.iter().copied().max().unwrap_or(0);
        self.nodes
            .iter()
            .zip(incoming)
            .map(|(path, count)| {
                let score = if max == 0 {
                    0.0
                } else {
                    count as f64 / max as f64
                };
                (path.clone(), score)
            })
            .collect()
    }

    /// Todos los ficheros alcanzables desde `path` (sin incluirlo), en orden
    /// de anchura. Tolera ciclos.
    pub fn reachable_from(&self, path: &str) -> Vec<&str> {
        let Some(start) = self.index_of(path) else {
            return Vec::new();
        };
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for &(a, b) in &self.edges {
            adjacency[a].push(b);
        }

        let mut visited = vec![false; self.nodes.len()];
        visited[start] = true;
        let mut queue = VecDeque::from([start]);
        let mut order = Vec::new();
        while let Some(node) = queue.pop_front() {
            for &next in &adjacency[node] {
                if !visited[next] {
                    visited[next] = true;
                    order.push(self.nodes[next].as_str());
                    queue.push_back(next);
                }
            }
        }
        order
    }

    fn index_of(&self, path: &str) -> Option<usize> {
        self.nodes.binary_search_by(|n| n.as_str().cmp(path)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(path: &str, deps: &[&str], refs: &[&str]) -> FileRecord {
        let mut r = FileRecord::from_source(path, "").unwrap();
        r.dependencies = deps.iter().map(|s| s.to_string()).collect();
        r.references = refs.iter().map(|s| s.to_string()).collect();
        r
    }

    fn edge_set(graph: &DependencyGraph) -> Vec<(String, String)> {
        graph
            .edges()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn build_is_deterministic_and_order_independent() {
        let a = vec![
            record("Main.frm", &["Utils.bas"], &["OrderRepo"]),
            record("Utils.bas", &[], &["orderrepo"]),
            record("Classes/OrderRepo.cls", &[], &[]),
        ];
        let mut b = a.clone();
        b.reverse();

        let first = DependencyGraph::build(&a);
        let second = DependencyGraph::build(&a);
        let reversed = DependencyGraph::build(&b);

        assert_eq!(edge_set(&first), edge_set(&second));
        assert_eq!(first, reversed);
        assert_eq!(first.edge_count(), 3);
        assert!(first.contains_edge("Main.frm", "Classes/OrderRepo.cls"));
    }

    #[test]
    fn drops_self_edges_duplicates_and_dangling_references() {
        let records = vec![
            record("Main.frm", &["Main.frm", "Utils.bas", "utils.BAS", "MSCOMCTL.OCX"], &["Utils", "rs"]),
            record("Utils.bas", &[], &[]),
        ];
        let graph = DependencyGraph::build(&records);
        assert_eq!(
            edge_set(&graph),
            vec![("Main.frm".to_string(), "Utils.bas".to_string())]
        );
        // solo las dependencias declaradas dejan rastro
        assert_eq!(graph.omissions().len(), 1);
        assert!(graph.omissions()[0].detail.contains("MSCOMCTL.OCX"));
    }

    #[test]
    fn ambiguous_stem_resolves_to_first_lexical_path() {
        let records = vec![
            record("b/Helpers.bas", &[], &[]),
            record("a/Helpers.cls", &[], &[]),
            record("Main.frm", &["Helpers"], &[]),
        ];
        let graph = DependencyGraph::build(&records);
        assert_eq!(graph.successors("Main.frm"), vec!["a/Helpers.cls"]);
    }

    #[test]
    fn traversal_tolerates_cycles() {
        let records = vec![
            record("A.bas", &["B.bas"], &[]),
            record("B.bas", &["C.bas"], &[]),
            record("C.bas", &["A.bas"], &[]),
        ];
        let graph = DependencyGraph::build(&records);
        assert_eq!(graph.reachable_from("A.bas"), vec!["B.bas", "C.bas"]);
        assert!(graph.reachable_from("missing.bas").is_empty());
    }

    #[test]
    fn centrality_weights_incoming_edges() {
        let records = vec![
            record("A.frm", &["Core.bas"], &[]),
            record("B.frm", &["Core.bas", "A.frm"], &[]),
            record("Core.bas", &[], &[]),
        ];
        let graph = DependencyGraph::build(&records);
        let centrality = graph.centrality();
        assert_eq!(graph.in_degree("Core.bas"), 2);
        assert_eq!(centrality["Core.bas"], 1.0);
        assert_eq!(centrality["A.frm"], 0.5);
        assert_eq!(centrality["B.frm"], 0.0);
    }
}

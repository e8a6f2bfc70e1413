use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::program::Program;

/// Node id used for the program's entry closure.
pub const ENTRY_NODE: &str = "<entry>";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphNode {
    pub id: String,
    /// Index in program order; `None` for the entry closure.
    pub position: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    /// Local name the reference is bound to in `from`.
    pub local: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GraphExport {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

pub fn export_graph(program: &Program) -> GraphExport {
    let mut nodes = vec![GraphNode {
        id: ENTRY_NODE.to_string(),
        position: None,
    }];
    nodes.extend(program.definitions.iter().enumerate().map(|(i, e)| GraphNode {
        id: e.identity.to_string(),
        position: Some(i),
    }));

    let owners = std::iter::once((ENTRY_NODE.to_string(), &program.entry)).chain(
        program
            .definitions
            .iter()
            .map(|e| (e.identity.to_string(), &e.closure)),
    );
    let mut edges: Vec<GraphEdge> = Vec::new();
    for (from, closure) in owners {
        for (local, target) in &closure.references {
            edges.push(GraphEdge {
                from: from.clone(),
                to: target.to_string(),
                local: local.clone(),
            });
        }
    }
    edges.sort();
    edges.dedup();

    GraphExport { nodes, edges }
}

pub fn export_graph_json(program: &Program) -> Result<String> {
    let graph = export_graph(program);
    serde_json::to_string_pretty(&graph).context("serialize graph json")
}

pub fn export_graph_dot(program: &Program) -> String {
    let graph = export_graph(program);
    let mut out = String::new();
    out.push_str("digraph program {\n");
    out.push_str("  rankdir=LR;\n");

    for node in &graph.nodes {
        let label = match node.position {
            Some(pos) => format!("{pos}: {}", escape_dot(&node.id)),
            None => escape_dot(&node.id),
        };
        out.push_str(&format!(
            "  \"{}\" [label=\"{}\"];\n",
            escape_dot(&node.id),
            label
        ));
    }

    for edge in &graph.edges {
        out.push_str(&format!(
            "  \"{}\" -> \"{}\" [label=\"{}\"];\n",
            escape_dot(&edge.from),
            escape_dot(&edge.to),
            escape_dot(&edge.local)
        ));
    }

    out.push_str("}\n");
    out
}

fn escape_dot(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{identifier, string_literal, Closure};
    use crate::identity::Identity;

    fn sample_program() -> Program {
        let mut p = Program::new(
            Closure::leaf(identifier("main")).with_reference("main", Identity::new("/a", "default")),
        );
        p.push(
            Identity::new("/a", "default"),
            Closure::leaf(identifier("helper")).with_reference("helper", Identity::new("/b", "helper")),
        );
        p.push(Identity::new("/b", "helper"), Closure::leaf(string_literal("\"quoted\"")));
        p
    }

    #[test]
    fn graph_exports_are_byte_stable() {
        let program = sample_program();
        assert_eq!(
            export_graph_json(&program).unwrap(),
            export_graph_json(&program).unwrap()
        );
        let dot = export_graph_dot(&program);
        assert_eq!(dot, export_graph_dot(&program));
        assert!(dot.contains("\"/a#default\" -> \"/b#helper\" [label=\"helper\"]"));
        assert!(dot.contains("\"<entry>\" -> \"/a#default\""));
    }

    #[test]
    fn nodes_follow_program_order() {
        let graph = export_graph(&sample_program());
        let ids: Vec<_> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec![ENTRY_NODE, "/a#default", "/b#helper"]);
        assert_eq!(graph.edges.len(), 2);
    }
}

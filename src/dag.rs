//! The compiled dataflow graph (`DagSpec`) and its structural validation.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConstellationError;
use crate::value::CType;

/// Identifies a node within a `DagSpec`.
pub type NodeId = String;

/// Where a module parameter's value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum InputRef {
    /// A top-level pipeline input, by declared name.
    PipelineInput(String),
    /// The output of another node.
    NodeOutput(NodeId),
}

/// A single node in the compiled graph: which module it invokes, and where
/// each of its parameters is wired from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagNode {
    pub module_name: String,
    pub inputs: BTreeMap<String, InputRef>,
}

/// Where a declared pipeline output's final value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OutputRef {
    NodeOutput(NodeId),
    PipelineInput(String),
}

/// The compiled dataflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagSpec {
    /// Declared pipeline inputs, in declaration order.
    pub inputs: Vec<(String, CType)>,
    pub nodes: BTreeMap<NodeId, DagNode>,
    pub outputs: BTreeMap<String, OutputRef>,
}

impl DagSpec {
    /// Validate structural invariants: the node graph is acyclic, every
    /// `InputRef`/`OutputRef` resolves to a declared input or node, and at
    /// least one output is declared.
    pub fn validate(&self) -> Result<(), ConstellationError> {
        if self.outputs.is_empty() {
            return Err(ConstellationError::InvalidDag(
                "dag must declare at least one output".to_string(),
            ));
        }

        let declared_inputs: std::collections::HashSet<&str> =
            self.inputs.iter().map(|(n, _)| n.as_str()).collect();

        for (node_id, node) in &self.nodes {
            for (param, input_ref) in &node.inputs {
                match input_ref {
                    InputRef::PipelineInput(name) => {
                        if !declared_inputs.contains(name.as_str()) {
                            return Err(ConstellationError::InvalidDag(format!(
                                "node `{node_id}` param `{param}` references undeclared input `{name}`"
                            )));
                        }
                    }
                    InputRef::NodeOutput(upstream) => {
                        if !self.nodes.contains_key(upstream) {
                            return Err(ConstellationError::InvalidDag(format!(
                                "node `{node_id}` param `{param}` references unknown node `{upstream}`"
                            )));
                        }
                    }
                }
            }
        }

        for (out_name, out_ref) in &self.outputs {
            match out_ref {
                OutputRef::NodeOutput(node_id) => {
                    if !self.nodes.contains_key(node_id) {
                        return Err(ConstellationError::InvalidDag(format!(
                            "output `{out_name}` references unknown node `{node_id}`"
                        )));
                    }
                }
                OutputRef::PipelineInput(name) => {
                    if !declared_inputs.contains(name.as_str()) {
                        return Err(ConstellationError::InvalidDag(format!(
                            "output `{out_name}` references undeclared input `{name}`"
                        )));
                    }
                }
            }
        }

        self.build_graph()?;
        Ok(())
    }

    /// Build a petgraph representation and topologically sort it, failing
    /// with `InvalidDag` if a cycle is present.
    pub fn build_graph(&self) -> Result<(DiGraph<NodeId, ()>, Vec<NodeIndex>), ConstellationError> {
        let mut graph = DiGraph::<NodeId, ()>::new();
        let mut indices = BTreeMap::new();
        for node_id in self.nodes.keys() {
            indices.insert(node_id.clone(), graph.add_node(node_id.clone()));
        }
        for (node_id, node) in &self.nodes {
            for input_ref in node.inputs.values() {
                if let InputRef::NodeOutput(upstream) = input_ref {
                    if let (Some(&from), Some(&to)) = (indices.get(upstream), indices.get(node_id)) {
                        graph.add_edge(from, to, ());
                    }
                }
            }
        }
        let order = toposort(&graph, None).map_err(|cycle| {
            let node_id = graph[cycle.node_id()].clone();
            ConstellationError::InvalidDag(format!("cycle detected involving node `{node_id}`"))
        })?;
        Ok((graph, order))
    }

    /// Every node transitively upstream of `missing_inputs` (inclusive of
    /// nodes that directly consume one).
    pub fn nodes_depending_on(&self, missing_inputs: &std::collections::HashSet<String>) -> std::collections::HashSet<NodeId> {
        let mut pending = std::collections::HashSet::new();
        let mut changed = true;
        while changed {
            changed = false;
            for (node_id, node) in &self.nodes {
                if pending.contains(node_id) {
                    continue;
                }
                let depends = node.inputs.values().any(|input_ref| match input_ref {
                    InputRef::PipelineInput(name) => missing_inputs.contains(name),
                    InputRef::NodeOutput(upstream) => pending.contains(upstream),
                });
                if depends {
                    pending.insert(node_id.clone());
                    changed = true;
                }
            }
        }
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input_ref(name: &str) -> InputRef {
        InputRef::PipelineInput(name.to_string())
    }

    #[test]
    fn validates_simple_linear_dag() {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "n1".to_string(),
            DagNode {
                module_name: "add".to_string(),
                inputs: BTreeMap::from([("a".to_string(), input_ref("a")), ("b".to_string(), input_ref("b"))]),
            },
        );
        let mut outputs = BTreeMap::new();
        outputs.insert("r".to_string(), OutputRef::NodeOutput("n1".to_string()));
        let dag = DagSpec {
            inputs: vec![("a".to_string(), CType::Int64), ("b".to_string(), CType::Int64)],
            nodes,
            outputs,
        };
        assert!(dag.validate().is_ok());
    }

    #[test]
    fn rejects_cycle() {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "n1".to_string(),
            DagNode {
                module_name: "m".to_string(),
                inputs: BTreeMap::from([("x".to_string(), InputRef::NodeOutput("n2".to_string()))]),
            },
        );
        nodes.insert(
            "n2".to_string(),
            DagNode {
                module_name: "m".to_string(),
                inputs: BTreeMap::from([("x".to_string(), InputRef::NodeOutput("n1".to_string()))]),
            },
        );
        let mut outputs = BTreeMap::new();
        outputs.insert("r".to_string(), OutputRef::NodeOutput("n1".to_string()));
        let dag = DagSpec { inputs: vec![], nodes, outputs };
        let err = dag.validate().unwrap_err();
        assert_eq!(err.kind(), "InvalidDag");
    }

    #[test]
    fn rejects_unresolved_input_ref() {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "n1".to_string(),
            DagNode {
                module_name: "m".to_string(),
                inputs: BTreeMap::from([("x".to_string(), input_ref("missing"))]),
            },
        );
        let mut outputs = BTreeMap::new();
        outputs.insert("r".to_string(), OutputRef::NodeOutput("n1".to_string()));
        let dag = DagSpec { inputs: vec![], nodes, outputs };
        assert!(dag.validate().is_err());
    }

    #[test]
    fn rejects_empty_outputs() {
        let dag = DagSpec { inputs: vec![], nodes: BTreeMap::new(), outputs: BTreeMap::new() };
        assert!(dag.validate().is_err());
    }

    #[test]
    fn nodes_depending_on_transitive() {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "n1".to_string(),
            DagNode { module_name: "m".to_string(), inputs: BTreeMap::from([("x".to_string(), input_ref("secret"))]) },
        );
        nodes.insert(
            "n2".to_string(),
            DagNode { module_name: "m".to_string(), inputs: BTreeMap::from([("x".to_string(), InputRef::NodeOutput("n1".to_string()))]) },
        );
        nodes.insert(
            "n3".to_string(),
            DagNode { module_name: "m".to_string(), inputs: BTreeMap::from([("x".to_string(), input_ref("public"))]) },
        );
        let mut outputs = BTreeMap::new();
        outputs.insert("r".to_string(), OutputRef::NodeOutput("n2".to_string()));
        let dag = DagSpec { inputs: vec![], nodes, outputs };

        let missing = std::collections::HashSet::from(["secret".to_string()]);
        let pending = dag.nodes_depending_on(&missing);
        assert!(pending.contains("n1"));
        assert!(pending.contains("n2"));
        assert!(!pending.contains("n3"));
    }
}

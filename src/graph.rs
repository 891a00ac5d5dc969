use std::collections::BTreeSet;
use std::ops::Index;

use serde::{Deserialize, Serialize};

use crate::{SVec, error::SearchError};

crate::new_index_type!(pub, NodeIndex);
crate::new_index_type!(pub, ValueIndex);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    #[default]
    Activation,
    Parameter
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Value {
    pub name: String,
    pub size: u64, // in bytes, for the whole global batch if it is an activation
    #[serde(default)]
    pub kind: ValueKind,
}

/// A coarse-grained segment of the model. It reads `inputs`, writes `outputs` and owns `params`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub inputs: SVec<ValueIndex>,
    #[serde(default)]
    pub outputs: SVec<ValueIndex>,
    #[serde(default)]
    pub params: SVec<ValueIndex>,
    #[serde(default)]
    pub flops: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub producer: NodeIndex,
    pub consumer: NodeIndex,
    pub value: ValueIndex,
}

#[derive(Deserialize)]
struct GraphDesc {
    values: Vec<Value>,
    nodes: Vec<Node>,
}

#[derive(Clone, Debug, Default)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub values: Vec<Value>,
    pub edges: Vec<Edge>,

    producers: Vec<Option<NodeIndex>>,
    consumers: Vec<SVec<NodeIndex>>,
}

impl Index<NodeIndex> for Graph {
    type Output = Node;

    fn index(&self, index: NodeIndex) -> &Self::Output {
        &self.nodes[index.0]
    }
}

impl Index<ValueIndex> for Graph {
    type Output = Value;

    fn index(&self, index: ValueIndex) -> &Self::Output {
        &self.values[index.0]
    }
}

impl Graph {
    pub fn new(nodes: Vec<Node>, values: Vec<Value>) -> Result<Graph, SearchError> {
        let mut producers = vec![None; values.len()];
        let mut consumers = vec![SVec::<NodeIndex>::new(); values.len()];

        let check = |v: ValueIndex, node: &Node| {
            if v.0 >= values.len() {
                return Err(SearchError::InvalidGraph(format!("node {} refers to unknown value {}", node.name, v.0)))
            }
            Ok(())
        };

        for (i, node) in nodes.iter().enumerate() {
            for &v in node.outputs.iter() {
                check(v, node)?;
                if let Some(other) = producers[v.0].replace(NodeIndex(i)) {
                    return Err(SearchError::InvalidGraph(format!(
                        "value {} is produced by both {} and {}", values[v.0].name, nodes[other.0].name, node.name
                    )))
                }
            }
            for &v in node.inputs.iter().chain(node.params.iter()) {
                check(v, node)?;
            }
        }

        let mut edges = vec![];
        for (i, node) in nodes.iter().enumerate() {
            for &v in node.inputs.iter() {
                if !consumers[v.0].contains(&NodeIndex(i)) {
                    consumers[v.0].push(NodeIndex(i))
                }
                if let Some(producer) = producers[v.0] {
                    edges.push(Edge { producer, consumer: NodeIndex(i), value: v })
                }
            }
        }

        Ok(Graph { nodes, values, edges, producers, consumers })
    }

    pub fn from_json(s: &str) -> Result<Graph, SearchError> {
        let GraphDesc { values, nodes } = serde_json::from_str(s)?;
        Graph::new(nodes, values)
    }

    /// A linear chain where node `i` reads the activation of node `i-1` and owns one parameter.
    /// Each entry is `(flops, param_size, output_size)`; the model input has the size of the first output.
    pub fn chain(specs: &[(u64, u64, u64)]) -> Graph {
        let mut values = vec![];
        let mut nodes = vec![];

        values.push(Value { name: "input".into(), size: specs.first().map(|s| s.2).unwrap_or(0), kind: ValueKind::Activation });
        for (i, &(flops, param_size, output_size)) in specs.iter().enumerate() {
            let param = ValueIndex(values.len());
            values.push(Value { name: format!("param_{i}"), size: param_size, kind: ValueKind::Parameter });
            let output = ValueIndex(values.len());
            values.push(Value { name: format!("act_{i}"), size: output_size, kind: ValueKind::Activation });

            let input = if i == 0 { ValueIndex(0) } else { ValueIndex(output.0 - 2) };
            nodes.push(Node {
                name: format!("node_{i}"),
                inputs: smallvec::smallvec![input],
                outputs: smallvec::smallvec![output],
                params: smallvec::smallvec![param],
                flops
            })
        }

        // the chain is well-formed by construction
        match Graph::new(nodes, values) {
            Ok(g) => g,
            Err(e) => unreachable!("{e}")
        }
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn producer(&self, value: ValueIndex) -> Option<NodeIndex> {
        self.producers[value.0]
    }

    pub fn consumers(&self, value: ValueIndex) -> &[NodeIndex] {
        &self.consumers[value.0]
    }

    pub fn total_size<'s>(&self, values: impl IntoIterator<Item=&'s ValueIndex>) -> u64 {
        values.into_iter().map(|&v| self[v].size).sum()
    }

    pub fn param_size(&self, node: NodeIndex) -> u64 {
        self.total_size(&self[node].params.iter().copied().collect::<BTreeSet<_>>())
    }

    pub fn input_size(&self, node: NodeIndex) -> u64 {
        self.total_size(&self[node].inputs.iter().copied().collect::<BTreeSet<_>>())
    }

    pub fn output_size(&self, node: NodeIndex) -> u64 {
        self.total_size(&self[node].outputs.iter().copied().collect::<BTreeSet<_>>())
    }
}

//! Shading graphs resolved against the node registry.
//!
//! A [`GraphDsl`] names parameters and sockets by string. [`ShadingGraph::resolve`]
//! looks every name up once and produces typed [`ParamSlot`]s in descriptor order,
//! with connections turned into node indices. The compiler, the texture tracker
//! and the edit differ only ever walk the resolved form.

use std::collections::{BTreeSet, HashMap};

use crate::{
    codec::HostValue,
    dsl::GraphDsl,
    error::CompileError,
    registry::{NodeCategory, NodeRegistry, OUTPUT_NODE_TYPE, OutputDescriptor, RiType},
};

#[derive(Debug, Clone, PartialEq)]
pub enum SlotValue {
    Value(HostValue),
    /// Input fed by `socket` of the node at index `node`.
    Connected { node: usize, socket: String },
    /// No authored value and no usable default; the parameter is not written.
    Unset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSlot {
    pub name: String,
    pub renderer_name: String,
    pub ty: RiType,
    pub texture: bool,
    pub array: bool,
    pub value: SlotValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShadingNode {
    pub id: String,
    pub type_name: String,
    pub category: NodeCategory,
    pub slots: Vec<ParamSlot>,
    pub outputs: Vec<OutputDescriptor>,
}

impl ShadingNode {
    pub fn slot(&self, name: &str) -> Option<&ParamSlot> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// Upstream node indices in slot order (may repeat).
    pub fn inputs(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().filter_map(|s| match &s.value {
            SlotValue::Connected { node, .. } => Some(*node),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShadingGraph {
    pub name: String,
    nodes: Vec<ShadingNode>,
    index: HashMap<String, usize>,
    output: Option<usize>,
}

enum Visit {
    InProgress,
    Done,
}

impl ShadingGraph {
    pub fn resolve(name: &str, dsl: &GraphDsl, registry: &NodeRegistry) -> Result<Self, CompileError> {
        let invalid = |msg: String| CompileError::InvalidGraph(format!("graph '{name}': {msg}"));

        let mut nodes = Vec::with_capacity(dsl.nodes.len());
        let mut index = HashMap::new();
        let mut output = None;

        for n in &dsl.nodes {
            let desc = registry
                .get(&n.node_type)
                .ok_or_else(|| invalid(format!("node '{}' has unknown type '{}'", n.id, n.node_type)))?;
            if index.insert(n.id.clone(), nodes.len()).is_some() {
                return Err(invalid(format!("duplicate node id '{}'", n.id)));
            }
            if desc.name == OUTPUT_NODE_TYPE {
                if output.is_some() {
                    return Err(invalid("more than one output node".to_string()));
                }
                output = Some(nodes.len());
            }
            if let Some(unknown) = n.params.keys().find(|k| desc.param(k).is_none()) {
                return Err(invalid(format!(
                    "node '{}' ({}) has no parameter '{unknown}'",
                    n.id, n.node_type
                )));
            }

            let slots = desc
                .params
                .iter()
                .map(|p| {
                    let value = match n.params.get(&p.name) {
                        Some(v) => SlotValue::Value(HostValue::from_json(v)),
                        None if p.default.is_null() => SlotValue::Unset,
                        None => SlotValue::Value(HostValue::from_json(&p.default)),
                    };
                    ParamSlot {
                        name: p.name.clone(),
                        renderer_name: p.renderer_name.clone(),
                        ty: p.ty,
                        texture: p.texture,
                        array: p.is_array(),
                        value,
                    }
                })
                .collect();

            nodes.push(ShadingNode {
                id: n.id.clone(),
                type_name: desc.name.clone(),
                category: desc.category,
                slots,
                outputs: desc.outputs.clone(),
            });
        }

        for c in &dsl.connections {
            let (Some(&from), Some(&to)) = (index.get(&c.from.node_id), index.get(&c.to.node_id)) else {
                return Err(invalid(format!(
                    "connection references missing node: {} -> {}",
                    c.from.node_id, c.to.node_id
                )));
            };
            let out_ty = nodes[from]
                .outputs
                .iter()
                .find(|o| o.name == c.from.port_id)
                .map(|o| o.ty)
                .ok_or_else(|| {
                    invalid(format!("node '{}' has no output '{}'", c.from.node_id, c.from.port_id))
                })?;

            let from_category = nodes[from].category;
            let target = &mut nodes[to];
            if target.category == NodeCategory::Output
                && from_category.shader_socket() != Some(c.to.port_id.as_str())
            {
                return Err(invalid(format!(
                    "output socket '{}' cannot take a {from_category:?} node ('{}')",
                    c.to.port_id, c.from.node_id
                )));
            }
            let connectable = registry
                .get(&target.type_name)
                .and_then(|d| d.param(&c.to.port_id))
                .map(|p| p.connectable);
            let slot = target
                .slots
                .iter_mut()
                .find(|s| s.name == c.to.port_id)
                .ok_or_else(|| invalid(format!("node '{}' has no input '{}'", c.to.node_id, c.to.port_id)))?;
            if connectable != Some(true) {
                return Err(invalid(format!(
                    "input '{}.{}' is not connectable",
                    c.to.node_id, c.to.port_id
                )));
            }
            if !slot.ty.accepts(out_ty) {
                return Err(invalid(format!(
                    "type mismatch: {}.{} ({out_ty}) -> {}.{} ({})",
                    c.from.node_id, c.from.port_id, c.to.node_id, c.to.port_id, slot.ty
                )));
            }
            if matches!(slot.value, SlotValue::Connected { .. }) {
                return Err(invalid(format!(
                    "input '{}.{}' has more than one incoming connection",
                    c.to.node_id, c.to.port_id
                )));
            }
            slot.value = SlotValue::Connected {
                node: from,
                socket: c.from.port_id.clone(),
            };
        }

        Ok(Self {
            name: name.to_string(),
            nodes,
            index,
            output,
        })
    }

    pub fn nodes(&self) -> &[ShadingNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &ShadingNode {
        &self.nodes[idx]
    }

    pub fn find(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn output(&self) -> Option<usize> {
        self.output
    }

    /// Node feeding an output-node socket, if the graph has an output and the socket is connected.
    pub fn output_input(&self, socket: &str) -> Option<usize> {
        let out = self.node(self.output?);
        match &out.slot(socket)?.value {
            SlotValue::Connected { node, .. } => Some(*node),
            _ => None,
        }
    }

    /// Nodes reachable upstream from `roots`, dependencies first, each exactly once.
    ///
    /// Depth-first post-order. A node met again while it is still on the current path
    /// is a cycle; a node met again after it finished is skipped.
    pub fn dependency_order(&self, roots: &[usize]) -> Result<Vec<usize>, CompileError> {
        let mut state: HashMap<usize, Visit> = HashMap::new();
        let mut path: Vec<usize> = Vec::new();
        let mut order = Vec::new();
        for &root in roots {
            self.visit(root, &mut state, &mut path, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        idx: usize,
        state: &mut HashMap<usize, Visit>,
        path: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), CompileError> {
        match state.get(&idx) {
            Some(Visit::Done) => return Ok(()),
            Some(Visit::InProgress) => {
                let start = path.iter().position(|p| *p == idx).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|i| self.nodes[*i].id.clone()).collect();
                cycle.push(self.nodes[idx].id.clone());
                return Err(CompileError::CycleDetected {
                    graph: self.name.clone(),
                    path: cycle,
                });
            }
            None => {}
        }

        state.insert(idx, Visit::InProgress);
        path.push(idx);
        for up in self.nodes[idx].inputs() {
            self.visit(up, state, path, order)?;
        }
        path.pop();
        state.insert(idx, Visit::Done);
        order.push(idx);
        Ok(())
    }

    /// `seeds` plus every node that (transitively) consumes one of them.
    pub fn downstream_closure(&self, seeds: &BTreeSet<usize>) -> BTreeSet<usize> {
        let mut consumers: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, n) in self.nodes.iter().enumerate() {
            for up in n.inputs() {
                consumers.entry(up).or_default().push(i);
            }
        }

        let mut out = BTreeSet::new();
        let mut stack: Vec<usize> = seeds.iter().copied().collect();
        while let Some(n) = stack.pop() {
            if !out.insert(n) {
                continue;
            }
            if let Some(next) = consumers.get(&n) {
                stack.extend(next.iter().copied());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dsl::{Connection, Endpoint, Node},
        registry::load_default_registry,
    };

    fn node(id: &str, ty: &str) -> Node {
        Node {
            id: id.into(),
            node_type: ty.into(),
            params: Default::default(),
        }
    }

    fn link(from: &str, fp: &str, to: &str, tp: &str) -> Connection {
        Connection {
            id: String::new(),
            from: Endpoint {
                node_id: from.into(),
                port_id: fp.into(),
            },
            to: Endpoint {
                node_id: to.into(),
                port_id: tp.into(),
            },
        }
    }

    fn mix_cycle() -> GraphDsl {
        GraphDsl {
            nodes: vec![
                node("out", "Output"),
                node("bx", "PxrDiffuse"),
                node("a", "PxrMix"),
                node("b", "PxrMix"),
            ],
            connections: vec![
                link("bx", "Bxdf", "out", "Bxdf"),
                link("a", "resultRGB", "bx", "diffuseColor"),
                link("b", "resultRGB", "a", "color1"),
                link("a", "resultRGB", "b", "color1"),
            ],
        }
    }

    #[test]
    fn resolve_fills_slots_in_descriptor_order() {
        let reg = load_default_registry().unwrap();
        let mut bx = node("bx", "PxrDiffuse");
        bx.params.insert("diffuseGain".into(), serde_json::json!(0.25));
        let g = ShadingGraph::resolve(
            "m",
            &GraphDsl {
                nodes: vec![node("out", "Output"), bx],
                connections: vec![link("bx", "Bxdf", "out", "Bxdf")],
            },
            &reg,
        )
        .unwrap();
        let bx = g.node(g.find("bx").unwrap());
        let expected: Vec<&str> = reg.get("PxrDiffuse").unwrap().params.iter().map(|p| p.name.as_str()).collect();
        let got: Vec<&str> = bx.slots.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(got, expected);
        assert_eq!(bx.slot("diffuseGain").unwrap().value, SlotValue::Value(HostValue::Float(0.25)));
        assert_eq!(g.output_input("Bxdf"), g.find("bx"));
        assert_eq!(g.output_input("Light"), None);
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let reg = load_default_registry().unwrap();
        let g = ShadingGraph::resolve("m", &mix_cycle(), &reg).unwrap();
        let root = g.output_input("Bxdf").unwrap();
        match g.dependency_order(&[root]).unwrap_err() {
            CompileError::CycleDetected { graph, path } => {
                assert_eq!(graph, "m");
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&"a".to_string()) && path.contains(&"b".to_string()));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn rejects_bad_documents() {
        let reg = load_default_registry().unwrap();
        let cases = [
            (
                GraphDsl {
                    nodes: vec![node("x", "NoSuchNode")],
                    connections: vec![],
                },
                "unknown type",
            ),
            (
                GraphDsl {
                    nodes: vec![node("out", "Output"), node("out", "PxrDiffuse")],
                    connections: vec![],
                },
                "duplicate node id",
            ),
            (
                GraphDsl {
                    nodes: vec![node("o1", "Output"), node("o2", "Output")],
                    connections: vec![],
                },
                "more than one output",
            ),
            (
                GraphDsl {
                    nodes: vec![node("out", "Output")],
                    connections: vec![link("ghost", "Bxdf", "out", "Bxdf")],
                },
                "missing node",
            ),
            (
                GraphDsl {
                    nodes: vec![node("out", "Output"), node("bx", "PxrDiffuse")],
                    connections: vec![link("bx", "Bxdf", "out", "Light")],
                },
                "output socket 'Light'",
            ),
            (
                GraphDsl {
                    nodes: vec![node("m", "PxrManifold2D"), node("bx", "PxrDiffuse")],
                    connections: vec![link("m", "result", "bx", "diffuseColor")],
                },
                "type mismatch",
            ),
            (
                GraphDsl {
                    nodes: vec![node("t", "PxrMix"), node("l", "PxrStdAreaLight")],
                    connections: vec![link("t", "resultRGB", "l", "shadowColor")],
                },
                "not connectable",
            ),
        ];
        for (dsl, needle) in cases {
            let err = ShadingGraph::resolve("m", &dsl, &reg).unwrap_err().to_string();
            assert!(err.contains(needle), "{err} should mention {needle}");
        }
    }

    #[test]
    fn downstream_closure_follows_consumers() {
        let reg = load_default_registry().unwrap();
        let g = ShadingGraph::resolve(
            "m",
            &GraphDsl {
                nodes: vec![
                    node("out", "Output"),
                    node("bx", "PxrDiffuse"),
                    node("mix", "PxrMix"),
                    node("side", "PxrMix"),
                ],
                connections: vec![
                    link("bx", "Bxdf", "out", "Bxdf"),
                    link("mix", "resultRGB", "bx", "diffuseColor"),
                ],
            },
            &reg,
        )
        .unwrap();
        let seeds = BTreeSet::from([g.find("mix").unwrap()]);
        let ids: BTreeSet<&str> = g
            .downstream_closure(&seeds)
            .into_iter()
            .map(|i| g.node(i).id.as_str())
            .collect();
        assert_eq!(ids, BTreeSet::from(["mix", "bx", "out"]));
    }
}

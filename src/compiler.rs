//! Shading graph -> ordered declaration records.
//!
//! Nodes are emitted in dependency order (see [`ShadingGraph::dependency_order`]),
//! each exactly once. Connected inputs are written as symbolic references
//! `"<handle>:<socket>"`; the renderer resolves them against the declarations
//! that came before.

use std::collections::BTreeSet;

use log::debug;

use crate::{
    codec::{self, HostValue, WireValue},
    error::{CompileError, UnsupportedTypeError},
    graph::{ShadingGraph, ShadingNode, SlotValue},
    registry::{NodeCategory, OUTPUT_SOCKETS, RiType},
    wire::{DeclarationRecord, HANDLE_ID, ParamList, Verb},
};

/// Handle of a node, qualified by the graph it lives in.
pub fn node_handle(graph: &str, node_id: &str) -> String {
    format!("{graph}_{node_id}")
}

pub fn socket_reference(handle: &str, socket: &str) -> String {
    format!("{handle}:{socket}")
}

/// Compiles one resolved graph.
pub struct Compiler<'g> {
    graph: &'g ShadingGraph,
    light_handle: Option<String>,
    only: Option<BTreeSet<usize>>,
}

impl<'g> Compiler<'g> {
    pub fn new(graph: &'g ShadingGraph) -> Self {
        Self {
            graph,
            light_handle: None,
            only: None,
        }
    }

    /// Handle written into a light's reserved handle parameter. Defaults to the node handle.
    pub fn with_light_handle(mut self, handle: impl Into<String>) -> Self {
        self.light_handle = Some(handle.into());
        self
    }

    /// Restrict emission to these node indices; order is unchanged.
    pub fn only(mut self, nodes: BTreeSet<usize>) -> Self {
        self.only = Some(nodes);
        self
    }

    /// Records for everything feeding `socket` of the output node.
    pub fn compile_socket(&self, socket: &str) -> Result<Vec<DeclarationRecord>, CompileError> {
        self.compile_roots(&[socket])
    }

    /// Records for all output sockets, `Bxdf`, `Light`, `Displacement` in that order.
    /// A node shared between sockets is emitted once.
    pub fn compile_all(&self) -> Result<Vec<DeclarationRecord>, CompileError> {
        self.compile_roots(&OUTPUT_SOCKETS)
    }

    fn compile_roots(&self, sockets: &[&str]) -> Result<Vec<DeclarationRecord>, CompileError> {
        if self.graph.output().is_none() {
            debug!("shading graph '{}' has no output node; nothing to emit", self.graph.name);
            return Ok(Vec::new());
        }
        let roots: Vec<usize> = sockets
            .iter()
            .filter_map(|s| self.graph.output_input(s))
            .collect();

        let mut records = Vec::new();
        for idx in self.graph.dependency_order(&roots)? {
            if self.only.as_ref().is_some_and(|only| !only.contains(&idx)) {
                continue;
            }
            self.emit_node(self.graph.node(idx), &mut records)?;
        }
        Ok(records)
    }

    fn emit_node(&self, node: &ShadingNode, out: &mut Vec<DeclarationRecord>) -> Result<(), CompileError> {
        let handle = node_handle(&self.graph.name, &node.id);
        let mut params = self.node_params(node)?;

        let verb = match node.category {
            NodeCategory::Pattern => Verb::Pattern,
            NodeCategory::Bxdf => Verb::Bxdf,
            NodeCategory::Displacement => Verb::Displacement,
            NodeCategory::Light => {
                out.push(visibility_record());
                let id = self.light_handle.clone().unwrap_or_else(|| handle.clone());
                params.push((HANDLE_ID.to_string(), WireValue::string(id)));
                Verb::AreaLightSource
            }
            NodeCategory::Output => return Ok(()),
        };

        out.push(DeclarationRecord {
            verb,
            name: node.type_name.clone(),
            handle: Some(handle),
            params,
        });
        Ok(())
    }

    fn node_params(&self, node: &ShadingNode) -> Result<ParamList, CompileError> {
        let mut params = ParamList::with_capacity(node.slots.len());
        for slot in &node.slots {
            let wrap = |source: UnsupportedTypeError| CompileError::UnsupportedType {
                node: node.id.clone(),
                param: slot.name.clone(),
                source,
            };
            match &slot.value {
                SlotValue::Unset => {}
                SlotValue::Connected { node: up, socket } => {
                    let up_handle = node_handle(&self.graph.name, &self.graph.node(*up).id);
                    params.push((
                        codec::reference_key(slot.ty, &slot.renderer_name),
                        WireValue::string(socket_reference(&up_handle, socket)),
                    ));
                }
                // Struct inputs only carry data through connections.
                SlotValue::Value(_) if slot.ty == RiType::Struct => {}
                SlotValue::Value(value) if slot.texture => {
                    let HostValue::String(path) = value else {
                        return Err(wrap(UnsupportedTypeError {
                            found: value.kind().to_string(),
                            hint: slot.ty,
                        }));
                    };
                    params.push((
                        codec::param_key(slot.ty, &slot.renderer_name),
                        WireValue::string(codec::texture_file_name(path)),
                    ));
                }
                SlotValue::Value(value) if slot.array => {
                    let (wire, count) = codec::encode_array(value, slot.ty).map_err(wrap)?;
                    params.push((codec::array_param_key(slot.ty, count, &slot.renderer_name), wire));
                }
                SlotValue::Value(value) => {
                    let wire = codec::encode(value, slot.ty).map_err(wrap)?;
                    params.push((codec::param_key(slot.ty, &slot.renderer_name), wire));
                }
            }
        }
        Ok(params)
    }
}

/// Area lights must not light the scene through transmission or indirect paths.
fn visibility_record() -> DeclarationRecord {
    DeclarationRecord {
        verb: Verb::Attribute,
        name: "visibility".to_string(),
        handle: None,
        params: vec![
            ("int transmission".to_string(), WireValue::Ints(vec![0])),
            ("int indirect".to_string(), WireValue::Ints(vec![0])),
        ],
    }
}

/// All output sockets of `graph`.
pub fn compile(graph: &ShadingGraph) -> Result<Vec<DeclarationRecord>, CompileError> {
    Compiler::new(graph).compile_all()
}

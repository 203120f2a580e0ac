use std::{collections::HashMap, fmt, path::Path};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

const DEFAULT_NODE_REGISTRY_JSON: &str = include_str!("../assets/node-registry.json");

/// Name of the built-in output node type.
pub const OUTPUT_NODE_TYPE: &str = "Output";

/// Input sockets of the output node, in emission order.
pub const OUTPUT_SOCKETS: [&str; 3] = ["Bxdf", "Light", "Displacement"];

/// Renderer-side parameter type tag, spelled the way the wire protocol spells it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiType {
    Float,
    #[serde(alias = "integer")]
    Int,
    Color,
    Point,
    Vector,
    Normal,
    Matrix,
    String,
    Struct,
}

impl RiType {
    pub fn as_str(self) -> &'static str {
        match self {
            RiType::Float => "float",
            RiType::Int => "int",
            RiType::Color => "color",
            RiType::Point => "point",
            RiType::Vector => "vector",
            RiType::Normal => "normal",
            RiType::Matrix => "matrix",
            RiType::String => "string",
            RiType::Struct => "struct",
        }
    }

    /// Number of wire scalars making up one element of this type.
    pub fn arity(self) -> usize {
        match self {
            RiType::Color | RiType::Point | RiType::Vector | RiType::Normal => 3,
            RiType::Matrix => 16,
            _ => 1,
        }
    }

    fn is_triple(self) -> bool {
        self.arity() == 3
    }

    /// Whether an input of this type may be fed by an output of type `from`.
    pub fn accepts(self, from: RiType) -> bool {
        self == from
            || (self.is_triple() && from.is_triple())
            || (self == RiType::Float && from == RiType::Int)
    }
}

impl fmt::Display for RiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeCategory {
    Pattern,
    Bxdf,
    Displacement,
    Light,
    Output,
}

impl NodeCategory {
    /// The shader socket a node of this category exposes towards the output node.
    pub fn shader_socket(self) -> Option<&'static str> {
        match self {
            NodeCategory::Bxdf => Some("Bxdf"),
            NodeCategory::Light => Some("Light"),
            NodeCategory::Displacement => Some("Displacement"),
            NodeCategory::Pattern | NodeCategory::Output => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDescriptor {
    /// Host-side name; graph documents and connections refer to this.
    pub name: String,
    /// Name written on the wire.
    pub renderer_name: String,
    pub ty: RiType,
    pub default: serde_json::Value,
    /// File path that must go through texture preparation.
    pub texture: bool,
    /// Declared maximum for array parameters. The wire count always follows the actual value.
    pub array_size: Option<usize>,
    pub connectable: bool,
}

impl ParamDescriptor {
    pub fn is_array(&self) -> bool {
        self.array_size.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OutputDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: RiType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescriptor {
    pub name: String,
    pub category: NodeCategory,
    pub params: Vec<ParamDescriptor>,
    pub outputs: Vec<OutputDescriptor>,
}

impl NodeDescriptor {
    pub fn param(&self, name: &str) -> Option<&ParamDescriptor> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputDescriptor> {
        self.outputs.iter().find(|o| o.name == name)
    }

    fn output_node() -> Self {
        Self {
            name: OUTPUT_NODE_TYPE.to_string(),
            category: NodeCategory::Output,
            params: OUTPUT_SOCKETS
                .iter()
                .map(|s| ParamDescriptor {
                    name: s.to_string(),
                    renderer_name: s.to_string(),
                    ty: RiType::Struct,
                    default: serde_json::Value::Null,
                    texture: false,
                    array_size: None,
                    connectable: true,
                })
                .collect(),
            outputs: Vec::new(),
        }
    }
}

/// Node types known to the bridge, keyed by type name.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    nodes: HashMap<String, NodeDescriptor>,
}

impl NodeRegistry {
    pub fn get(&self, type_name: &str) -> Option<&NodeDescriptor> {
        self.nodes.get(type_name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Type names of one category, sorted.
    pub fn names_in(&self, category: NodeCategory) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .nodes
            .values()
            .filter(|d| d.category == category)
            .map(|d| d.name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: RawRegistry =
            serde_json::from_str(text).map_err(|e| anyhow!("invalid node registry json: {e}"))?;

        let mut nodes: HashMap<String, NodeDescriptor> = HashMap::new();
        let output = NodeDescriptor::output_node();
        nodes.insert(output.name.clone(), output);

        for n in raw.nodes {
            if n.category == NodeCategory::Output {
                bail!("node type '{}' cannot use the reserved output category", n.name);
            }
            let mut params = Vec::new();
            flatten_params(&n.name, n.category, n.params, &mut params)?;

            let mut outputs = n.outputs;
            if let Some(socket) = n.category.shader_socket() {
                if outputs.iter().all(|o| o.name != socket) {
                    outputs.push(OutputDescriptor {
                        name: socket.to_string(),
                        ty: RiType::Struct,
                    });
                }
            }

            let desc = NodeDescriptor {
                name: n.name.clone(),
                category: n.category,
                params,
                outputs,
            };
            if nodes.insert(n.name.clone(), desc).is_some() {
                bail!("duplicate node type '{}' in registry", n.name);
            }
        }

        Ok(Self { nodes })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawRegistry {
    #[allow(dead_code)]
    pub version: u32,
    #[serde(default)]
    pub nodes: Vec<RawNode>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawNode {
    pub name: String,
    pub category: NodeCategory,
    #[serde(default)]
    pub params: Vec<RawParamEntry>,
    #[serde(default)]
    pub outputs: Vec<OutputDescriptor>,
}

// Pages only group parameters for display; every parameter inside one is still emitted.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawParamEntry {
    Page {
        #[allow(dead_code)]
        page: String,
        params: Vec<RawParamEntry>,
    },
    Param(RawParam),
}

#[derive(Debug, Clone, Deserialize)]
struct RawParam {
    pub name: String,
    #[serde(rename = "rendererName", default)]
    pub renderer_name: Option<String>,
    #[serde(rename = "type")]
    pub ty: RiType,
    #[serde(default)]
    pub default: serde_json::Value,
    #[serde(default)]
    pub texture: bool,
    #[serde(rename = "arraySize", default)]
    pub array_size: Option<usize>,
    #[serde(default)]
    pub connectable: Option<bool>,
}

fn flatten_params(
    node_name: &str,
    category: NodeCategory,
    entries: Vec<RawParamEntry>,
    out: &mut Vec<ParamDescriptor>,
) -> Result<()> {
    for entry in entries {
        match entry {
            RawParamEntry::Page { params, .. } => {
                flatten_params(node_name, category, params, out)?;
            }
            RawParamEntry::Param(p) => {
                if out.iter().any(|q| q.name == p.name) {
                    bail!("node type '{node_name}' declares parameter '{}' twice", p.name);
                }
                if p.texture && p.ty != RiType::String {
                    bail!(
                        "node type '{node_name}' texture parameter '{}' must be a string, got {}",
                        p.name,
                        p.ty
                    );
                }
                // Light inputs are fixed values unless the descriptor opts them in.
                let connectable = p.connectable.unwrap_or(category != NodeCategory::Light);
                out.push(ParamDescriptor {
                    renderer_name: p.renderer_name.unwrap_or_else(|| p.name.clone()),
                    name: p.name,
                    ty: p.ty,
                    default: p.default,
                    texture: p.texture,
                    array_size: p.array_size,
                    connectable,
                });
            }
        }
    }
    Ok(())
}

pub fn load_default_registry() -> Result<NodeRegistry> {
    NodeRegistry::from_json_str(DEFAULT_NODE_REGISTRY_JSON)
        .context("failed to load bundled assets/node-registry.json")
}

pub fn load_registry_from_path(path: impl AsRef<Path>) -> Result<NodeRegistry> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read node registry at {}", path.display()))?;
    NodeRegistry::from_json_str(&text)
        .with_context(|| format!("failed to load node registry {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_output_and_core_nodes() {
        let reg = load_default_registry().unwrap();
        let out = reg.get(OUTPUT_NODE_TYPE).unwrap();
        assert_eq!(out.category, NodeCategory::Output);
        let names: Vec<&str> = out.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, OUTPUT_SOCKETS);

        assert!(reg.names_in(NodeCategory::Bxdf).contains(&"PxrDisney"));
        assert!(reg.names_in(NodeCategory::Pattern).contains(&"PxrTexture"));
        assert!(reg.names_in(NodeCategory::Light).contains(&"PxrStdAreaLight"));
    }

    #[test]
    fn shader_nodes_get_an_implicit_shader_socket() {
        let reg = load_default_registry().unwrap();
        let disney = reg.get("PxrDisney").unwrap();
        assert_eq!(disney.output("Bxdf").map(|o| o.ty), Some(RiType::Struct));
        let light = reg.get("PxrStdAreaLight").unwrap();
        assert!(light.output("Light").is_some());
    }

    #[test]
    fn pages_are_flattened_in_order() {
        let reg = NodeRegistry::from_json_str(
            r#"{
                "version": 1,
                "nodes": [{
                    "name": "Paged",
                    "category": "pattern",
                    "params": [
                        {"name": "a", "type": "float", "default": 1.0},
                        {"page": "Advanced", "params": [
                            {"name": "b", "type": "int", "default": 2},
                            {"page": "Nested", "params": [{"name": "c", "type": "string"}]}
                        ]},
                        {"name": "d", "type": "color", "default": [0, 0, 0]}
                    ],
                    "outputs": [{"name": "resultF", "type": "float"}]
                }]
            }"#,
        )
        .unwrap();
        let desc = reg.get("Paged").unwrap();
        let names: Vec<&str> = desc.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c", "d"]);
    }

    #[test]
    fn light_params_are_fixed_unless_opted_in() {
        let reg = load_default_registry().unwrap();
        let light = reg.get("PxrStdAreaLight").unwrap();
        assert!(light.param("intensity").unwrap().connectable);
        assert!(!light.param("enableShadows").unwrap().connectable);
    }

    #[test]
    fn duplicate_node_type_is_rejected() {
        let err = NodeRegistry::from_json_str(
            r#"{"version": 1, "nodes": [
                {"name": "A", "category": "pattern"},
                {"name": "A", "category": "bxdf"}
            ]}"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("duplicate node type 'A'"));
    }

    #[test]
    fn reserved_output_category_is_rejected() {
        let err = NodeRegistry::from_json_str(
            r#"{"version": 1, "nodes": [{"name": "Out2", "category": "output"}]}"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("reserved output category"));
    }

    #[test]
    fn type_compatibility() {
        assert!(RiType::Color.accepts(RiType::Vector));
        assert!(RiType::Float.accepts(RiType::Int));
        assert!(!RiType::Float.accepts(RiType::Color));
        assert!(!RiType::Struct.accepts(RiType::Float));
        assert!(RiType::Struct.accepts(RiType::Struct));
    }
}

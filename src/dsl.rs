use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::codec::{IDENTITY, Matrix4};

/// Scene document handed over by the host.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SceneDsl {
    #[serde(default = "default_version")]
    pub version: String,
    pub name: String,
    #[serde(default = "default_frame")]
    pub frame: u32,
    #[serde(default = "default_resolution")]
    pub resolution: [u32; 2],
    #[serde(default)]
    pub camera: CameraDsl,
    #[serde(default)]
    pub settings: RenderSettings,
    /// Shading graphs by material name.
    #[serde(default)]
    pub materials: BTreeMap<String, GraphDsl>,
    #[serde(default)]
    pub lights: Vec<LightDsl>,
    #[serde(default)]
    pub objects: Vec<ObjectDsl>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_frame() -> u32 {
    1
}

fn default_resolution() -> [u32; 2] {
    [640, 480]
}

fn default_transform() -> Matrix4 {
    IDENTITY
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CameraDsl {
    /// Vertical field of view in degrees.
    #[serde(default = "default_fov")]
    pub fov: f64,
    /// World-to-camera transform, row-major.
    #[serde(default = "default_transform")]
    pub transform: Matrix4,
}

fn default_fov() -> f64 {
    45.0
}

impl Default for CameraDsl {
    fn default() -> Self {
        Self {
            fov: default_fov(),
            transform: IDENTITY,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RenderSettings {
    #[serde(default = "default_pixel_variance")]
    pub pixel_variance: f64,
    #[serde(default = "default_integrator")]
    pub integrator: String,
    #[serde(default)]
    pub min_samples: u32,
    #[serde(default = "default_max_samples")]
    pub max_samples: u32,
}

fn default_pixel_variance() -> f64 {
    0.01
}

fn default_integrator() -> String {
    "PxrPathTracer".to_string()
}

fn default_max_samples() -> u32 {
    64
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            pixel_variance: default_pixel_variance(),
            integrator: default_integrator(),
            min_samples: 0,
            max_samples: default_max_samples(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LightDsl {
    pub name: String,
    #[serde(default = "default_transform")]
    pub transform: Matrix4,
    pub graph: GraphDsl,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ObjectDsl {
    pub name: String,
    #[serde(default = "default_transform")]
    pub transform: Matrix4,
    #[serde(default)]
    pub material: Option<String>,
    pub mesh: MeshDsl,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct MeshDsl {
    pub points: Vec<[f64; 3]>,
    /// Polygons as point indices.
    pub faces: Vec<Vec<u32>>,
}

/// A shading graph as authored: nodes with raw parameter values plus connections.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct GraphDsl {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Connection {
    #[serde(default)]
    pub id: String,
    pub from: Endpoint,
    pub to: Endpoint,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Endpoint {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(rename = "portId")]
    pub port_id: String,
}

impl SceneDsl {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("scene name must not be empty");
        }
        let mut seen = std::collections::HashSet::new();
        for o in &self.objects {
            if !seen.insert(o.name.as_str()) {
                bail!("duplicate object name '{}'", o.name);
            }
            if let Some(m) = &o.material {
                if !self.materials.contains_key(m) {
                    bail!("object '{}' uses unknown material '{m}'", o.name);
                }
            }
            let n = o.mesh.points.len() as u32;
            for face in &o.mesh.faces {
                if face.len() < 3 {
                    bail!("object '{}' has a face with fewer than 3 vertices", o.name);
                }
                if let Some(bad) = face.iter().find(|i| **i >= n) {
                    bail!("object '{}' face index {bad} out of range ({n} points)", o.name);
                }
            }
        }
        let mut lights = std::collections::HashSet::new();
        for l in &self.lights {
            if !lights.insert(l.name.as_str()) {
                bail!("duplicate light name '{}'", l.name);
            }
            if self.materials.contains_key(&l.name) {
                bail!("light '{}' has the same name as a material", l.name);
            }
        }

        // Node handles are "<graph>_<node>" and share one namespace in the renderer.
        let graphs = self
            .materials
            .iter()
            .map(|(name, g)| (name.as_str(), g))
            .chain(self.lights.iter().map(|l| (l.name.as_str(), &l.graph)));
        let mut handles = std::collections::HashMap::new();
        for (graph, g) in graphs {
            for n in &g.nodes {
                let handle = crate::compiler::node_handle(graph, &n.id);
                if let Some((other, other_id)) = handles.insert(handle.clone(), (graph, n.id.as_str())) {
                    if other != graph {
                        bail!(
                            "node handle '{handle}' is produced by both '{other}'/'{other_id}' and '{graph}'/'{}'",
                            n.id
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn parse_scene_str(text: &str) -> Result<SceneDsl> {
    let scene: SceneDsl = serde_json::from_str(text).context("invalid scene json")?;
    scene.validate()?;
    Ok(scene)
}

pub fn load_scene_from_path(path: impl AsRef<Path>) -> Result<SceneDsl> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read scene json {}", path.display()))?;
    parse_scene_str(&text).with_context(|| format!("failed to load scene {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_scene_fills_defaults() {
        let scene = parse_scene_str(r#"{"name": "empty"}"#).unwrap();
        assert_eq!(scene.frame, 1);
        assert_eq!(scene.resolution, [640, 480]);
        assert_eq!(scene.camera.transform, IDENTITY);
        assert_eq!(scene.settings.integrator, "PxrPathTracer");
        assert!(scene.materials.is_empty());
    }

    #[test]
    fn graph_endpoints_use_camel_case_ids() {
        let scene = parse_scene_str(
            r#"{
                "name": "s",
                "materials": {"wood": {
                    "nodes": [
                        {"id": "out", "type": "Output"},
                        {"id": "bx", "type": "PxrDiffuse", "params": {"diffuseGain": 0.5}}
                    ],
                    "connections": [
                        {"from": {"nodeId": "bx", "portId": "Bxdf"}, "to": {"nodeId": "out", "portId": "Bxdf"}}
                    ]
                }}
            }"#,
        )
        .unwrap();
        let g = &scene.materials["wood"];
        assert_eq!(g.connections[0].from.node_id, "bx");
        assert_eq!(g.connections[0].to.port_id, "Bxdf");
        assert_eq!(g.nodes[1].params["diffuseGain"], serde_json::json!(0.5));
    }

    #[test]
    fn unknown_material_is_rejected() {
        let err = parse_scene_str(
            r#"{"name": "s", "objects": [{"name": "a", "material": "nope",
                "mesh": {"points": [[0,0,0],[1,0,0],[0,1,0]], "faces": [[0,1,2]]}}]}"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("unknown material 'nope'"));
    }

    #[test]
    fn face_indices_are_checked() {
        let err = parse_scene_str(
            r#"{"name": "s", "objects": [{"name": "a",
                "mesh": {"points": [[0,0,0],[1,0,0],[0,1,0]], "faces": [[0,1,3]]}}]}"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("out of range"));
    }

    #[test]
    fn clashing_handles_are_rejected() {
        let graph = |id: &str| format!(r#"{{"nodes": [{{"id": "{id}", "type": "PxrMix"}}]}}"#);
        let err = parse_scene_str(&format!(
            r#"{{"name": "s", "materials": {{"a_b": {}, "a": {}}}}}"#,
            graph("c"),
            graph("b_c")
        ))
        .unwrap_err();
        assert!(format!("{err:#}").contains("node handle 'a_b_c'"), "{err:#}");

        let err = parse_scene_str(&format!(
            r#"{{"name": "s", "materials": {{"key": {}}}, "lights": [{{"name": "key", "graph": {}}}]}}"#,
            graph("x"),
            graph("y")
        ))
        .unwrap_err();
        assert!(format!("{err:#}").contains("same name as a material"), "{err:#}");
    }
}

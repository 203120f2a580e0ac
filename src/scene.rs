use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use crate::{dsl::SceneDsl, error::CompileError, graph::ShadingGraph, registry::NodeRegistry};

/// A scene document with every shading graph resolved against the registry.
#[derive(Debug, Clone)]
pub struct Scene {
    pub doc: SceneDsl,
    pub materials: BTreeMap<String, ShadingGraph>,
    /// One graph per light, in document order, named after the light.
    pub lights: Vec<ShadingGraph>,
    /// Directory relative texture paths are resolved against.
    pub base_dir: PathBuf,
}

impl Scene {
    pub fn resolve(doc: SceneDsl, registry: &NodeRegistry, base_dir: impl AsRef<Path>) -> Result<Self, CompileError> {
        let materials = doc
            .materials
            .iter()
            .map(|(name, g)| Ok((name.clone(), ShadingGraph::resolve(name, g, registry)?)))
            .collect::<Result<BTreeMap<_, _>, CompileError>>()?;
        let lights = doc
            .lights
            .iter()
            .map(|l| ShadingGraph::resolve(&l.name, &l.graph, registry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            doc,
            materials,
            lights,
            base_dir: base_dir.as_ref().to_path_buf(),
        })
    }

    pub fn name(&self) -> &str {
        &self.doc.name
    }

    pub fn light(&self, name: &str) -> Option<(&crate::dsl::LightDsl, &ShadingGraph)> {
        self.doc
            .lights
            .iter()
            .zip(&self.lights)
            .find(|(l, _)| l.name == name)
    }
}

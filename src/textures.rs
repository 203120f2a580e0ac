//! Texture reference tracking and texture preparation.
//!
//! The tracker walks the same dependency order as the compiler, so a cyclic graph
//! fails here with the same [`CompileError::CycleDetected`]. Preparation decides
//! per texture whether the external optimiser has to run, by modification time.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, info, warn};

use crate::{
    codec::{self, HostValue},
    error::{CompileError, SessionError},
    graph::{ShadingGraph, SlotValue},
    registry::OUTPUT_SOCKETS,
    scene::Scene,
};

/// A file-backed texture: the path the graph names and the name of the optimised file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TextureRef {
    pub source: String,
    pub derived: String,
}

/// Textures reachable from the output node of `graph`, deduplicated by derived name.
pub fn collect_textures(graph: &ShadingGraph) -> Result<Vec<TextureRef>, CompileError> {
    let mut found = BTreeMap::new();
    collect_into(graph, &mut found)?;
    Ok(into_refs(found))
}

/// Textures of every material and light in the scene.
pub fn collect_scene_textures(scene: &Scene) -> Result<Vec<TextureRef>, CompileError> {
    let mut found = BTreeMap::new();
    for g in scene.materials.values().chain(&scene.lights) {
        collect_into(g, &mut found)?;
    }
    Ok(into_refs(found))
}

fn collect_into(graph: &ShadingGraph, found: &mut BTreeMap<String, String>) -> Result<(), CompileError> {
    if graph.output().is_none() {
        return Ok(());
    }
    let roots: Vec<usize> = OUTPUT_SOCKETS
        .iter()
        .filter_map(|s| graph.output_input(s))
        .collect();
    for idx in graph.dependency_order(&roots)? {
        for slot in graph.node(idx).slots.iter().filter(|s| s.texture) {
            let SlotValue::Value(HostValue::String(path)) = &slot.value else {
                continue;
            };
            // Already optimised files are used as-is.
            if path.is_empty() || codec::is_optimised_texture(path) {
                continue;
            }
            found
                .entry(codec::texture_file_name(path))
                .or_insert_with(|| path.clone());
        }
    }
    Ok(())
}

fn into_refs(found: BTreeMap<String, String>) -> Vec<TextureRef> {
    found
        .into_iter()
        .map(|(derived, source)| TextureRef { source, derived })
        .collect()
}

pub trait TextureOptimiser {
    fn optimise(&self, source: &Path, target: &Path) -> Result<(), SessionError>;
}

/// Runs the renderer's texture tool as `<program> <source> <target>`.
#[derive(Debug, Clone)]
pub struct ExternalOptimiser {
    pub program: PathBuf,
    /// Exported as `RMANTREE` to the child only.
    pub rmantree: Option<PathBuf>,
}

impl TextureOptimiser for ExternalOptimiser {
    fn optimise(&self, source: &Path, target: &Path) -> Result<(), SessionError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(source).arg(target);
        if let Some(root) = &self.rmantree {
            cmd.env("RMANTREE", root);
        }
        debug!("running {:?}", cmd);
        let status = cmd.status().map_err(|source| SessionError::Texture {
            path: target.to_path_buf(),
            source,
        })?;
        if !status.success() {
            return Err(SessionError::Texture {
                path: target.to_path_buf(),
                source: std::io::Error::other(format!("{} exited with {status}", self.program.display())),
            });
        }
        Ok(())
    }
}

/// Whether `target` has to be (re)built from `source`.
///
/// A missing target or unreadable timestamps always mean yes.
pub fn needs_regeneration(source: &Path, target: &Path, always: bool) -> bool {
    if always {
        return true;
    }
    let mtime = |p: &Path| std::fs::metadata(p).and_then(|m| m.modified());
    match (mtime(source), mtime(target)) {
        (Ok(src), Ok(dst)) => src > dst,
        _ => true,
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct TexturePrepReport {
    pub converted: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Bring the texture cache up to date for `refs`.
///
/// Only failing to create `texture_dir` is an error. Missing sources and optimiser
/// failures are logged and listed in the report.
pub fn prepare_textures(
    refs: &[TextureRef],
    texture_dir: &Path,
    base_dir: &Path,
    always: bool,
    optimiser: &dyn TextureOptimiser,
) -> Result<TexturePrepReport, SessionError> {
    std::fs::create_dir_all(texture_dir).map_err(|e| {
        SessionError::io(format!("failed to create texture directory {}", texture_dir.display()), e)
    })?;

    let mut report = TexturePrepReport::default();
    for r in refs {
        let source = base_dir.join(&r.source);
        let target = texture_dir.join(&r.derived);
        if !source.is_file() {
            warn!("texture source {} not found", source.display());
            report.missing.push(source);
            continue;
        }
        if !needs_regeneration(&source, &target, always) {
            debug!("texture {} is up to date", target.display());
            report.skipped.push(target);
            continue;
        }
        match optimiser.optimise(&source, &target) {
            Ok(()) => {
                info!("converted {} -> {}", source.display(), target.display());
                report.converted.push(target);
            }
            Err(e) => {
                warn!("{e}");
                report.failed.push(target);
            }
        }
    }
    Ok(report)
}

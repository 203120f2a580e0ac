//! Scene serialization: frame and world bracketing around the compiled shading graphs.

use std::{fs::File, io::BufWriter};

use log::info;

use crate::{
    codec::{Matrix4, WireValue, column_major},
    compiler::Compiler,
    config::{DisplayDriver, SessionConfig, SessionPaths},
    dsl::{MeshDsl, ObjectDsl},
    error::SessionError,
    graph::ShadingGraph,
    scene::Scene,
    wire::{Arg, Block, Emitter, RibWriter},
};

pub const WIRE_VERSION: f64 = 3.04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportMode {
    /// Complete file, frame closed.
    Batch,
    /// Frame left open so edits can follow.
    Interactive,
}

/// Compile `graph` and write it, preceded by a graph comment. Returns the number of records.
///
/// Compilation finishes before anything is written, so a failing graph leaves no partial output.
pub fn emit_graph<E: Emitter + ?Sized>(
    graph: &ShadingGraph,
    light_handle: Option<&str>,
    emitter: &mut E,
) -> Result<usize, SessionError> {
    let mut compiler = Compiler::new(graph);
    if let Some(h) = light_handle {
        compiler = compiler.with_light_handle(h);
    }
    let records = compiler.compile_all()?;
    if records.is_empty() {
        return Ok(0);
    }
    emitter.archive_record("comment", "Shader Graph").map_err(SessionError::Export)?;
    let n = records.len();
    for r in records {
        emitter.declare(r).map_err(SessionError::Export)?;
    }
    Ok(n)
}

pub fn write_scene<E: Emitter + ?Sized>(
    scene: &Scene,
    paths: &SessionPaths,
    config: &SessionConfig,
    emitter: &mut E,
    mode: ExportMode,
) -> Result<usize, SessionError> {
    let doc = &scene.doc;
    let mut declared = 0;

    write_header(paths, config, emitter).map_err(SessionError::Export)?;
    emitter.begin(Block::Frame(doc.frame)).map_err(SessionError::Export)?;
    write_camera(scene, paths, config, emitter).map_err(SessionError::Export)?;
    emitter.begin(Block::World).map_err(SessionError::Export)?;

    for (light, graph) in doc.lights.iter().zip(&scene.lights) {
        emitter.begin(Block::Attribute).map_err(SessionError::Export)?;
        write_identity(&light.name, &light.transform, emitter).map_err(SessionError::Export)?;
        declared += emit_graph(graph, Some(&light.name), emitter)?;
        emitter.end(Block::Attribute).map_err(SessionError::Export)?;
    }

    for obj in &doc.objects {
        emitter.begin(Block::Attribute).map_err(SessionError::Export)?;
        write_identity(&obj.name, &obj.transform, emitter).map_err(SessionError::Export)?;
        if let Some(graph) = obj.material.as_ref().and_then(|m| scene.materials.get(m)) {
            declared += emit_graph(graph, None, emitter)?;
        }
        write_mesh(obj, emitter).map_err(SessionError::Export)?;
        emitter.end(Block::Attribute).map_err(SessionError::Export)?;
    }

    emitter.end(Block::World).map_err(SessionError::Export)?;
    if mode == ExportMode::Batch {
        emitter.end(Block::Frame(doc.frame)).map_err(SessionError::Export)?;
    }
    emitter.flush().map_err(SessionError::Export)?;
    Ok(declared)
}

/// Write the batch scene file at `paths.scene_file`.
pub fn export_scene_file(scene: &Scene, paths: &SessionPaths, config: &SessionConfig) -> Result<usize, SessionError> {
    let file = File::create(&paths.scene_file).map_err(SessionError::Export)?;
    let mut writer = RibWriter::new(BufWriter::new(file));
    let declared = write_scene(scene, paths, config, &mut writer, ExportMode::Batch)?;
    info!(
        "exported {} ({declared} shading declarations)",
        paths.scene_file.display()
    );
    Ok(declared)
}

fn write_header<E: Emitter + ?Sized>(paths: &SessionPaths, config: &SessionConfig, e: &mut E) -> std::io::Result<()> {
    e.archive_record("structure", "RenderMan RIB")?;
    e.call("version", vec![Arg::Float(WIRE_VERSION)], Vec::new())?;

    let mut search = vec![(
        "string texture".to_string(),
        WireValue::string(paths.texture_dir.display().to_string()),
    )];
    if !config.shader_paths.is_empty() {
        let mut shader: Vec<String> = vec!["@".to_string()];
        shader.extend(config.shader_paths.iter().map(|p| p.display().to_string()));
        search.push((
            "string shader".to_string(),
            WireValue::string(shader.join(":")),
        ));
    }
    e.call("Option", vec![Arg::Str("searchpath".into())], search)
}

fn write_camera<E: Emitter + ?Sized>(
    scene: &Scene,
    paths: &SessionPaths,
    config: &SessionConfig,
    e: &mut E,
) -> std::io::Result<()> {
    let doc = &scene.doc;
    let display = match config.display_driver {
        DisplayDriver::Buffer => vec![
            Arg::Str(paths.render_output.display().to_string()),
            Arg::Str("tiff".into()),
            Arg::Str("rgba".into()),
        ],
        DisplayDriver::It => vec![
            Arg::Str(doc.name.clone()),
            Arg::Str("it".into()),
            Arg::Str("rgba".into()),
        ],
    };
    e.call("Display", display, Vec::new())?;
    e.call(
        "Format",
        vec![
            Arg::Int(i64::from(doc.resolution[0])),
            Arg::Int(i64::from(doc.resolution[1])),
            Arg::Float(1.0),
        ],
        Vec::new(),
    )?;
    e.call("PixelVariance", vec![Arg::Float(doc.settings.pixel_variance)], Vec::new())?;
    e.call(
        "Hider",
        vec![Arg::Str("raytrace".into())],
        vec![
            (
                "int minsamples".into(),
                WireValue::Ints(vec![i64::from(doc.settings.min_samples)]),
            ),
            (
                "int maxsamples".into(),
                WireValue::Ints(vec![i64::from(doc.settings.max_samples)]),
            ),
        ],
    )?;
    e.call(
        "Integrator",
        vec![Arg::Str(doc.settings.integrator.clone()), Arg::Str("integrator".into())],
        Vec::new(),
    )?;
    e.call(
        "Projection",
        vec![Arg::Str("perspective".into())],
        vec![("float fov".into(), WireValue::Floats(vec![doc.camera.fov]))],
    )?;
    e.call(
        "Transform",
        vec![Arg::Floats(column_major(&doc.camera.transform))],
        Vec::new(),
    )
}

fn write_identity<E: Emitter + ?Sized>(
    name: &str,
    transform: &Matrix4,
    e: &mut E,
) -> std::io::Result<()> {
    e.call(
        "Attribute",
        vec![Arg::Str("identifier".into())],
        vec![("string name".into(), WireValue::string(name))],
    )?;
    e.call("Transform", vec![Arg::Floats(column_major(transform))], Vec::new())
}

fn write_mesh<E: Emitter + ?Sized>(obj: &ObjectDsl, e: &mut E) -> std::io::Result<()> {
    let MeshDsl { points, faces } = &obj.mesh;
    if faces.is_empty() {
        return Ok(());
    }
    let nverts: Vec<i64> = faces.iter().map(|f| f.len() as i64).collect();
    let verts: Vec<i64> = faces.iter().flatten().map(|i| i64::from(*i)).collect();
    let p: Vec<f64> = points.iter().flatten().copied().collect();
    e.call(
        "PointsPolygons",
        vec![Arg::Ints(nverts), Arg::Ints(verts)],
        vec![("P".into(), WireValue::Floats(p))],
    )
}

#![allow(dead_code)]

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use shading_bridge::{
    config::{DisplayDriver, SessionConfig, SessionPaths},
    dsl::parse_scene_str,
    registry::load_default_registry,
    scene::Scene,
};

static SERIAL: Mutex<()> = Mutex::new(());

/// Tests that write and then execute scripts must not overlap, or a concurrent fork can
/// keep a script open for writing while it is being executed.
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join("shading-bridge-tests")
        .join(format!("{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

pub const SCENE_JSON: &str = r#"{
    "name": "bench",
    "frame": 3,
    "resolution": [32, 24],
    "materials": {"wood": {
        "nodes": [
            {"id": "out", "type": "Output"},
            {"id": "bx", "type": "PxrDisney", "params": {"roughness": 0.4}},
            {"id": "mix", "type": "PxrMix", "params": {"mix": 0.25}}
        ],
        "connections": [
            {"from": {"nodeId": "bx", "portId": "Bxdf"}, "to": {"nodeId": "out", "portId": "Bxdf"}},
            {"from": {"nodeId": "mix", "portId": "resultRGB"}, "to": {"nodeId": "bx", "portId": "baseColor"}}
        ]
    }},
    "lights": [{"name": "key", "graph": {
        "nodes": [{"id": "out", "type": "Output"}, {"id": "l", "type": "PxrStdAreaLight", "params": {"intensity": 2.0}}],
        "connections": [{"from": {"nodeId": "l", "portId": "Light"}, "to": {"nodeId": "out", "portId": "Light"}}]
    }}],
    "objects": [
        {"name": "table", "material": "wood",
         "mesh": {"points": [[0,0,0],[1,0,0],[1,1,0],[0,1,0]], "faces": [[0,1,2,3]]}}
    ]
}"#;

pub fn scene_from(json: &str, base_dir: &Path) -> Scene {
    let doc = parse_scene_str(json).unwrap();
    Scene::resolve(doc, &load_default_registry().unwrap(), base_dir).unwrap()
}

pub fn sample_scene(base_dir: &Path) -> Scene {
    scene_from(SCENE_JSON, base_dir)
}

/// A config rendering into `dir` with the given renderer program and fast polling.
pub fn config_in(dir: &Path, renderer: &Path, driver: DisplayDriver) -> SessionConfig {
    SessionConfig {
        rmantree: Some(dir.join("rmantree")),
        renderer: renderer.display().to_string(),
        scene_output: format!("{}/out/{{scene}}.rib", dir.display()),
        texture_output: format!("{}/out/textures", dir.display()),
        display_driver: driver,
        poll_interval_ms: 20,
        always_generate_textures: false,
        ..SessionConfig::default()
    }
}

pub fn paths_for(config: &SessionConfig, scene: &Scene) -> SessionPaths {
    SessionPaths::resolve(config, scene.name(), scene.doc.frame).unwrap()
}

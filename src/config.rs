use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Environment variable naming the renderer install root.
pub const RMANTREE_ENV: &str = "RMANTREE";

/// File name of the render output inside the export directory.
pub const RENDER_OUTPUT_FILE: &str = "buffer.tif";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum DisplayDriver {
    /// Renderer writes checkpoints to the output file; the session polls it.
    #[default]
    Buffer,
    /// Renderer's own framebuffer window.
    It,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum OutputAction {
    #[default]
    ExportRender,
    ExportOnly,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub rmantree: Option<PathBuf>,
    pub renderer: String,
    pub texture_optimiser: String,
    /// `{scene}` is replaced by the scene name, runs of `#` by the padded frame number.
    pub scene_output: String,
    pub texture_output: String,
    pub shader_paths: Vec<PathBuf>,
    pub threads: i32,
    pub display_driver: DisplayDriver,
    /// Checkpoint interval in seconds.
    pub update_frequency: f64,
    pub poll_interval_ms: u64,
    pub always_generate_textures: bool,
    pub output_action: OutputAction,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rmantree: None,
            renderer: "prman".to_string(),
            texture_optimiser: "txmake".to_string(),
            scene_output: "out/{scene}.rib".to_string(),
            texture_output: "out/textures".to_string(),
            shader_paths: Vec::new(),
            threads: -1,
            display_driver: DisplayDriver::Buffer,
            update_frequency: 5.0,
            poll_interval_ms: 1000,
            always_generate_textures: true,
            output_action: OutputAction::ExportRender,
        }
    }
}

pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<SessionConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid config json {}", path.display()))
}

/// Filesystem locations of one session, resolved once from a [`SessionConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPaths {
    pub scene_file: PathBuf,
    pub export_dir: PathBuf,
    pub texture_dir: PathBuf,
    pub render_output: PathBuf,
    pub rmantree: Option<PathBuf>,
    pub renderer: PathBuf,
    pub texture_optimiser: PathBuf,
}

impl SessionPaths {
    /// Resolves templates and tool locations and creates the export directory.
    pub fn resolve(config: &SessionConfig, scene_name: &str, frame: u32) -> Result<Self, SessionError> {
        let expand = |template: &str| -> Result<PathBuf, SessionError> {
            let p = make_frame_path(&template.replace("{scene}", scene_name), frame);
            std::path::absolute(&p).map_err(|e| SessionError::io(format!("cannot resolve path {p}"), e))
        };

        let scene_file = expand(&config.scene_output)?;
        let export_dir = scene_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&export_dir).map_err(|e| {
            SessionError::io(format!("failed to create export directory {}", export_dir.display()), e)
        })?;
        let texture_dir = expand(&config.texture_output)?;

        let rmantree = config
            .rmantree
            .clone()
            .or_else(|| std::env::var_os(RMANTREE_ENV).map(PathBuf::from));
        let renderer = tool_path(rmantree.as_deref(), &config.renderer);
        let texture_optimiser = tool_path(rmantree.as_deref(), &config.texture_optimiser);

        Ok(Self {
            render_output: export_dir.join(RENDER_OUTPUT_FILE),
            scene_file,
            export_dir,
            texture_dir,
            rmantree,
            renderer,
            texture_optimiser,
        })
    }
}

fn tool_path(rmantree: Option<&Path>, name: &str) -> PathBuf {
    let p = Path::new(name);
    match rmantree {
        _ if p.is_absolute() => p.to_path_buf(),
        Some(root) => root.join("bin").join(name),
        // Left to PATH lookup.
        None => p.to_path_buf(),
    }
}

/// Replaces each run of `#` with `frame`, zero-padded to the run's length.
pub fn make_frame_path(path: &str, frame: u32) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '#' {
            out.push(c);
            continue;
        }
        let mut width = 1;
        while chars.peek() == Some(&'#') {
            chars.next();
            width += 1;
        }
        out.push_str(&format!("{frame:0width$}"));
    }
    out
}

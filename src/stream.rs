//! Scene acquisition for interactive sessions.
//!
//! Keeps a seam between where updated scenes come from (a watched file today) and
//! the session that turns them into edits.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::{Context, Result};
use log::warn;

use crate::dsl::{self, SceneDsl};

pub trait SceneSource {
    /// The next updated scene, or `None` if nothing changed since the last call.
    fn next_scene(&mut self) -> Result<Option<SceneDsl>>;
}

/// Re-reads a scene document whenever its modification time changes.
pub struct FileSceneSource {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl FileSceneSource {
    /// The file's current state counts as already seen.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let last_modified = modified(&path).ok();
        Self { path, last_modified }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn modified(path: &Path) -> std::io::Result<SystemTime> {
    std::fs::metadata(path)?.modified()
}

impl SceneSource for FileSceneSource {
    fn next_scene(&mut self) -> Result<Option<SceneDsl>> {
        let m = modified(&self.path).with_context(|| format!("failed to stat {}", self.path.display()))?;
        if self.last_modified == Some(m) {
            return Ok(None);
        }
        self.last_modified = Some(m);
        match dsl::load_scene_from_path(&self.path) {
            Ok(scene) => Ok(Some(scene)),
            // Editors save in several steps; a half-written file is picked up on its next change.
            Err(e) => {
                warn!("ignoring unreadable scene update: {e:#}");
                Ok(None)
            }
        }
    }
}

use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use image::DynamicImage;
use log::{info, warn};
use shading_bridge::{
    config::{self, OutputAction, SessionConfig, SessionPaths},
    dsl,
    error::SessionError,
    registry::{self, NodeRegistry},
    scene::Scene,
    session::{Diagnostic, RenderHost, RenderSession, SessionState, Severity},
    stream::{FileSceneSource, SceneSource},
};

#[derive(Debug, Default, Clone)]
struct Cli {
    scene: Option<PathBuf>,
    config: Option<PathBuf>,
    registry: Option<PathBuf>,
    threads: Option<i32>,
    export_only: bool,
    interactive: bool,
    output: Option<PathBuf>,
}

const USAGE: &str = "supported: --scene <scene.json>, --config <config.json>, --registry <nodes.json>, \
                     --threads <n>, --export-only, --interactive, --output <image>";

fn parse_cli(args: &[String]) -> Result<Cli> {
    let mut cli = Cli::default();
    let mut i = 0;
    let value = |i: usize, flag: &str| -> Result<&String> {
        args.get(i + 1).ok_or_else(|| anyhow!("missing value for {flag}"))
    };
    while i < args.len() {
        match args[i].as_str() {
            "--scene" => {
                cli.scene = Some(PathBuf::from(value(i, "--scene")?));
                i += 2;
            }
            "--config" => {
                cli.config = Some(PathBuf::from(value(i, "--config")?));
                i += 2;
            }
            "--registry" => {
                cli.registry = Some(PathBuf::from(value(i, "--registry")?));
                i += 2;
            }
            "--threads" => {
                let v = value(i, "--threads")?;
                cli.threads = Some(v.parse().with_context(|| format!("invalid --threads value '{v}'"))?);
                i += 2;
            }
            "--output" => {
                cli.output = Some(PathBuf::from(value(i, "--output")?));
                i += 2;
            }
            "--export-only" => {
                cli.export_only = true;
                i += 1;
            }
            "--interactive" => {
                cli.interactive = true;
                i += 1;
            }
            other => return Err(anyhow!("unknown argument: {other} ({USAGE})")),
        }
    }
    if cli.export_only && cli.interactive {
        return Err(anyhow!("--export-only and --interactive are mutually exclusive"));
    }
    Ok(cli)
}

/// Prints progress to the terminal and keeps the latest display buffer.
#[derive(Default)]
struct ConsoleHost {
    last_percent: Option<u32>,
    image: Option<DynamicImage>,
}

impl RenderHost for ConsoleHost {
    fn update_stats(&mut self, status: &str) {
        log::debug!("{status}");
    }

    fn update_progress(&mut self, fraction: f32) {
        let pct = (fraction * 100.0).round() as u32;
        if self.last_percent != Some(pct) {
            self.last_percent = Some(pct);
            println!("[render] {pct}%");
        }
    }

    fn report(&mut self, diagnostic: &Diagnostic) {
        let tag = match diagnostic.severity {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        println!("[render] {tag}: {}", diagnostic.message);
    }

    fn update_image(&mut self, image: DynamicImage) {
        self.image = Some(image);
    }
}

fn load_scene(path: &Path, registry: &NodeRegistry) -> Result<Scene> {
    let doc = dsl::load_scene_from_path(path)?;
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    Scene::resolve(doc, registry, base_dir).with_context(|| format!("failed to resolve scene {}", path.display()))
}

fn run_interactive(
    session: &mut RenderSession,
    scene: &Scene,
    scene_path: &Path,
    registry: &NodeRegistry,
    poll: Duration,
    host: &mut ConsoleHost,
) -> Result<SessionState> {
    session.start_interactive(scene)?;
    println!("[interactive] watching {} for changes", scene_path.display());

    let mut source = FileSceneSource::new(scene_path);
    let base_dir = scene_path.parent().map(Path::to_path_buf).unwrap_or_default();
    loop {
        if let Some(state) = session.poll_interactive(host)? {
            return Ok(state);
        }
        if let Some(doc) = source.next_scene()? {
            match Scene::resolve(doc, registry, &base_dir) {
                Ok(updated) => match session.issue_edits(&updated) {
                    Ok(summary) => println!(
                        "[interactive] {} edit blocks, {} declarations",
                        summary.blocks, summary.declarations
                    ),
                    // Nothing was sent; the renderer keeps the last good scene.
                    Err(SessionError::Compile(e)) => warn!("scene update rejected: {e}"),
                    Err(e) => return Err(e.into()),
                },
                Err(e) => warn!("scene update rejected: {e}"),
            }
        }
        thread::sleep(poll);
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli(&argv)?;
    let scene_path = cli
        .scene
        .clone()
        .ok_or_else(|| anyhow!("--scene <scene.json> is required ({USAGE})"))?;

    let registry = match cli.registry.as_deref() {
        Some(p) => registry::load_registry_from_path(p)?,
        None => registry::load_default_registry()?,
    };
    let mut config = match cli.config.as_deref() {
        Some(p) => config::load_config_from_path(p)?,
        None => SessionConfig::default(),
    };
    if let Some(t) = cli.threads {
        config.threads = t;
    }
    if cli.export_only {
        config.output_action = OutputAction::ExportOnly;
    }

    let scene = load_scene(&scene_path, &registry)?;
    let paths = SessionPaths::resolve(&config, scene.name(), scene.doc.frame)?;
    info!("scene '{}' -> {}", scene.name(), paths.scene_file.display());

    let poll = Duration::from_millis(config.poll_interval_ms);
    let mut session = RenderSession::new(config, paths);
    let mut host = ConsoleHost::default();

    let state = if cli.interactive {
        run_interactive(&mut session, &scene, &scene_path, &registry, poll, &mut host)?
    } else {
        session.render(&scene, &mut host)?
    };
    println!("[render] finished: {state:?}");

    if let Some(out) = cli.output.as_deref() {
        let image = host
            .image
            .as_ref()
            .ok_or_else(|| anyhow!("no image was produced; nothing to save to {}", out.display()))?;
        image
            .save(out)
            .with_context(|| format!("failed to save {}", out.display()))?;
        println!("[render] saved: {}", out.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_flags() {
        let cli = parse_cli(&args(&["--scene", "s.json", "--threads", "4", "--export-only"])).unwrap();
        assert_eq!(cli.scene, Some(PathBuf::from("s.json")));
        assert_eq!(cli.threads, Some(4));
        assert!(cli.export_only);
    }

    #[test]
    fn rejects_unknown_and_incomplete_flags() {
        assert!(parse_cli(&args(&["--bogus"])).is_err());
        assert!(parse_cli(&args(&["--scene"])).is_err());
        assert!(parse_cli(&args(&["--export-only", "--interactive"])).is_err());
    }
}

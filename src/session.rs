//! Render session: texture preparation, scene export, and the external renderer process.
//!
//! One caller thread drives everything through [`RenderSession::poll_once`]. The
//! renderer's output pipes are drained by two reader threads into a channel that
//! the poll loop empties without blocking; the render output file is re-read
//! whenever its size changes.
//!
//! The reader threads only forward lines. Parsing, host callbacks and every
//! state transition stay on the caller thread.

use std::{
    io::{BufRead, BufReader, BufWriter, Read},
    path::Path,
    process::{Child, ChildStdin, Command, ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use image::DynamicImage;
use log::{debug, error, info, warn};

use crate::{
    config::{DisplayDriver, OutputAction, RMANTREE_ENV, SessionConfig, SessionPaths},
    edit::{self, EditSummary},
    error::SessionError,
    export::{self, ExportMode},
    scene::Scene,
    textures::{self, ExternalOptimiser, TextureOptimiser, TexturePrepReport},
    wire::{Block, Emitter, RibWriter},
};

/// Token the renderer prints in front of its completion percentage.
pub const PROGRESS_MARKER: &str = "R90000";

/// Time the renderer gets to exit on its own after an interactive session is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Time spent collecting trailing output once the renderer has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Exporting,
    Launching,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Renderer running with an open edit world.
    Interactive,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A message for the user. Renderer errors are diagnostics, not session failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Progress(f32),
    Diagnostic(Diagnostic),
}

/// Classify one line of the renderer's diagnostic stream. Unrecognised lines give `None`.
pub fn classify_line(line: &str) -> Option<LineEvent> {
    if line.contains(PROGRESS_MARKER) {
        let pct = line
            .split_whitespace()
            .skip_while(|t| !t.contains(PROGRESS_MARKER))
            .find(|t| t.contains('%'))?;
        let number = pct.split('%').next()?;
        let value: f32 = number.parse().ok()?;
        return Some(LineEvent::Progress((value / 100.0).clamp(0.0, 1.0)));
    }
    let severity = if line.contains("ERROR") {
        Severity::Error
    } else if line.contains("WARNING") {
        Severity::Warning
    } else {
        return None;
    };
    Some(LineEvent::Diagnostic(Diagnostic {
        severity,
        message: line.trim_end().to_string(),
    }))
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Callbacks into whoever displays the render.
pub trait RenderHost {
    fn update_stats(&mut self, _status: &str) {}
    fn update_progress(&mut self, _fraction: f32) {}
    fn report(&mut self, _diagnostic: &Diagnostic) {}
    fn update_image(&mut self, _image: DynamicImage) {}
}

/// Clonable cancellation flag, checked once per poll.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

enum StreamLine {
    Stdout(String),
    Stderr(String),
}

struct InteractiveLink {
    writer: RibWriter<BufWriter<ChildStdin>>,
    snapshot: Scene,
}

pub struct RenderSession {
    config: SessionConfig,
    paths: SessionPaths,
    optimiser: Box<dyn TextureOptimiser>,
    state: SessionState,
    progress: f32,
    cancel: CancelToken,
    child: Option<Child>,
    lines: Option<Receiver<StreamLine>>,
    started: Option<Instant>,
    last_image_len: Option<u64>,
    waiting_polls: usize,
    last_error: Option<String>,
    interactive: Option<InteractiveLink>,
}

impl RenderSession {
    pub fn new(config: SessionConfig, paths: SessionPaths) -> Self {
        let optimiser = Box::new(ExternalOptimiser {
            program: paths.texture_optimiser.clone(),
            rmantree: paths.rmantree.clone(),
        });
        Self {
            config,
            paths,
            optimiser,
            state: SessionState::Idle,
            progress: 0.0,
            cancel: CancelToken::new(),
            child: None,
            lines: None,
            started: None,
            last_image_len: None,
            waiting_polls: 0,
            last_error: None,
            interactive: None,
        }
    }

    pub fn with_optimiser(mut self, optimiser: Box<dyn TextureOptimiser>) -> Self {
        self.optimiser = optimiser;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive.is_some()
    }

    /// Prepare textures, export, and (unless configured export-only) render to completion.
    pub fn render(&mut self, scene: &Scene, host: &mut dyn RenderHost) -> Result<SessionState, SessionError> {
        let result = self.render_inner(scene, host);
        if result.is_err() && !self.state.is_terminal() {
            self.state = SessionState::Failed;
        }
        result
    }

    fn render_inner(&mut self, scene: &Scene, host: &mut dyn RenderHost) -> Result<SessionState, SessionError> {
        self.export(scene)?;
        if self.config.output_action == OutputAction::ExportOnly {
            info!("export only; renderer not launched");
            self.state = SessionState::Completed;
            return Ok(self.state);
        }
        self.launch(false)?;
        self.run(host)
    }

    /// Texture preparation followed by writing the scene file.
    pub fn export(&mut self, scene: &Scene) -> Result<TexturePrepReport, SessionError> {
        let report = self.prepare_textures(scene)?;
        self.state = SessionState::Exporting;
        export::export_scene_file(scene, &self.paths, &self.config)?;
        Ok(report)
    }

    fn prepare_textures(&mut self, scene: &Scene) -> Result<TexturePrepReport, SessionError> {
        let refs = textures::collect_scene_textures(scene)?;
        textures::prepare_textures(
            &refs,
            &self.paths.texture_dir,
            &scene.base_dir,
            self.config.always_generate_textures,
            self.optimiser.as_ref(),
        )
    }

    /// Renderer arguments, scene argument last.
    pub fn command_args(&self, scene_arg: &str) -> Vec<String> {
        let mut args = Vec::new();
        if self.config.display_driver == DisplayDriver::Buffer {
            args.push("-checkpoint".to_string());
            args.push(format!("{:.2}s", self.config.update_frequency));
            args.push("-Progress".to_string());
        }
        args.push(format!("-t:{}", self.config.threads));
        args.push(scene_arg.to_string());
        args
    }

    fn launch(&mut self, interactive: bool) -> Result<(), SessionError> {
        self.state = SessionState::Launching;
        remove_stale_output(&self.paths.render_output);

        let scene_arg = if interactive {
            "-".to_string()
        } else {
            self.paths.scene_file.display().to_string()
        };
        let mut cmd = Command::new(&self.paths.renderer);
        cmd.args(self.command_args(&scene_arg))
            .current_dir(&self.paths.export_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if interactive { Stdio::piped() } else { Stdio::null() });
        if let Some(root) = &self.paths.rmantree {
            cmd.env(RMANTREE_ENV, root);
        }

        info!("launching {:?}", cmd);
        let mut child = cmd.spawn().map_err(|source| {
            self.state = SessionState::Failed;
            SessionError::Launch {
                program: self.paths.renderer.clone(),
                source,
            }
        })?;

        let (tx, rx) = crossbeam_channel::unbounded::<StreamLine>();
        if let Some(out) = child.stdout.take() {
            spawn_reader(out, tx.clone(), StreamLine::Stdout);
        }
        if let Some(err) = child.stderr.take() {
            spawn_reader(err, tx, StreamLine::Stderr);
        }

        self.child = Some(child);
        self.lines = Some(rx);
        self.started = Some(Instant::now());
        self.last_image_len = None;
        self.waiting_polls = 0;
        self.last_error = None;
        self.progress = 0.0;
        self.state = SessionState::Running;
        Ok(())
    }

    /// Poll until the renderer exits or the session is cancelled.
    pub fn run(&mut self, host: &mut dyn RenderHost) -> Result<SessionState, SessionError> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            if let Some(state) = self.poll_once(host)? {
                return Ok(state);
            }
            thread::sleep(interval);
        }
    }

    /// One iteration of the poll loop. Returns the final state once the session has ended.
    pub fn poll_once(&mut self, host: &mut dyn RenderHost) -> Result<Option<SessionState>, SessionError> {
        if self.child.is_none() {
            return Ok(self.state.is_terminal().then_some(self.state));
        }

        if self.cancel.is_cancelled() {
            self.kill();
            self.state = SessionState::Cancelled;
            info!("render cancelled");
            return Ok(Some(self.state));
        }

        self.drain_lines(host);

        let status = match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(status)) => status,
            Some(Err(e)) => {
                self.kill();
                self.state = SessionState::Failed;
                return Err(SessionError::io("failed to poll renderer process", e));
            }
            None => None,
        };
        if let Some(status) = status {
            return self.finish(status, host).map(Some);
        }

        self.reload_image(host, false);
        if self.last_image_len.is_none() {
            self.waiting_polls += 1;
            host.update_stats(&format!("Starting rendering{}", ".".repeat(self.waiting_polls)));
        }
        Ok(None)
    }

    fn drain_lines(&mut self, host: &mut dyn RenderHost) {
        let Some(rx) = self.lines.clone() else {
            return;
        };
        loop {
            match rx.try_recv() {
                Ok(line) => self.handle_line(line, host),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.lines = None;
                    return;
                }
            }
        }
    }

    fn drain_after_exit(&mut self, host: &mut dyn RenderHost) {
        let Some(rx) = self.lines.take() else {
            return;
        };
        loop {
            match rx.recv_timeout(DRAIN_TIMEOUT) {
                Ok(line) => self.handle_line(line, host),
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn handle_line(&mut self, line: StreamLine, host: &mut dyn RenderHost) {
        let text = match line {
            StreamLine::Stdout(text) => {
                debug!("[renderer] {text}");
                return;
            }
            StreamLine::Stderr(text) => text,
        };
        match classify_line(&text) {
            Some(LineEvent::Progress(p)) => {
                self.progress = p;
                host.update_progress(p);
            }
            Some(LineEvent::Diagnostic(d)) => {
                match d.severity {
                    Severity::Error => {
                        error!("[renderer] {}", d.message);
                        self.last_error = Some(d.message.clone());
                    }
                    Severity::Warning => warn!("[renderer] {}", d.message),
                    Severity::Info => info!("[renderer] {}", d.message),
                }
                host.report(&d);
            }
            None => debug!("[renderer] {text}"),
        }
    }

    /// Reload the render output if it changed size (or unconditionally with `force`).
    /// Missing or half-written files are retried on the next call.
    fn reload_image(&mut self, host: &mut dyn RenderHost, force: bool) {
        let Ok(meta) = std::fs::metadata(&self.paths.render_output) else {
            return;
        };
        let len = meta.len();
        if !force && self.last_image_len == Some(len) {
            return;
        }
        match image::open(&self.paths.render_output) {
            Ok(img) => {
                self.last_image_len = Some(len);
                host.update_image(img);
            }
            Err(e) => debug!("render output not readable yet: {e}"),
        }
    }

    fn finish(&mut self, status: ExitStatus, host: &mut dyn RenderHost) -> Result<SessionState, SessionError> {
        self.child = None;
        self.interactive = None;
        self.drain_after_exit(host);
        self.reload_image(host, true);

        if !status.success() {
            self.state = SessionState::Failed;
            let message = self
                .last_error
                .take()
                .unwrap_or_else(|| "renderer reported no error message".to_string());
            return Err(SessionError::Exit {
                code: status.code(),
                message,
            });
        }
        if self.config.display_driver == DisplayDriver::Buffer && !self.paths.render_output.exists() {
            self.state = SessionState::Failed;
            return Err(SessionError::Exit {
                code: status.code(),
                message: "renderer exited without producing an image".to_string(),
            });
        }

        let elapsed = self.started.map(|t| t.elapsed()).unwrap_or_default();
        let done = Diagnostic {
            severity: Severity::Info,
            message: format!("Done rendering (elapsed time: {})", format_elapsed(elapsed)),
        };
        info!("{}", done.message);
        host.report(&done);
        self.progress = 1.0;
        self.state = SessionState::Completed;
        Ok(self.state)
    }

    /// Kill the renderer and discard anything not yet read from it.
    fn kill(&mut self) {
        self.interactive = None;
        self.lines = None;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("kill renderer: {e}");
            }
            let _ = child.wait();
        }
    }

    /// Launch the renderer reading from its standard input, stream the scene, and open an edit world.
    pub fn start_interactive(&mut self, scene: &Scene) -> Result<(), SessionError> {
        let result = self.start_interactive_inner(scene);
        if result.is_err() {
            self.kill();
            self.state = SessionState::Failed;
        }
        result
    }

    fn start_interactive_inner(&mut self, scene: &Scene) -> Result<(), SessionError> {
        self.prepare_textures(scene)?;
        self.state = SessionState::Exporting;
        self.launch(true)?;

        let stdin = self
            .child
            .as_mut()
            .and_then(|c| c.stdin.take())
            .ok_or_else(|| SessionError::io("renderer stdin", std::io::Error::other("not piped")))?;
        let mut writer = RibWriter::new(BufWriter::new(stdin));
        export::write_scene(scene, &self.paths, &self.config, &mut writer, ExportMode::Interactive)?;
        writer
            .begin(Block::EditWorld(scene.name().to_string()))
            .and_then(|_| writer.flush())
            .map_err(SessionError::Export)?;

        self.interactive = Some(InteractiveLink {
            writer,
            snapshot: scene.clone(),
        });
        self.state = SessionState::Interactive;
        info!("interactive session open for '{}'", scene.name());
        Ok(())
    }

    /// Send the differences between the last sent scene and `scene`.
    pub fn issue_edits(&mut self, scene: &Scene) -> Result<EditSummary, SessionError> {
        let link = self.interactive.as_mut().ok_or(SessionError::NotInteractive)?;
        let diff = edit::diff_scenes(&link.snapshot, scene);
        if diff.is_empty() {
            return Ok(EditSummary::default());
        }
        let summary = edit::emit_edits(&diff, scene, &mut link.writer)?;
        link.writer
            .flush()
            .map_err(|e| SessionError::io("failed to send edits to renderer", e))?;
        link.snapshot = scene.clone();
        info!(
            "sent {} edit blocks ({} declarations)",
            summary.blocks, summary.declarations
        );
        Ok(summary)
    }

    /// Poll the interactive renderer. Returns the final state if it went away.
    pub fn poll_interactive(&mut self, host: &mut dyn RenderHost) -> Result<Option<SessionState>, SessionError> {
        if self.interactive.is_none() {
            return Err(SessionError::NotInteractive);
        }
        self.poll_once(host)
    }

    /// Close the edit world and frame, then wait for the renderer to exit.
    pub fn end_interactive(&mut self, host: &mut dyn RenderHost) -> Result<SessionState, SessionError> {
        let mut link = self.interactive.take().ok_or(SessionError::NotInteractive)?;
        let frame = link.snapshot.doc.frame;
        let closed = link
            .writer
            .end(Block::EditWorld(link.snapshot.name().to_string()))
            .and_then(|_| link.writer.end(Block::Frame(frame)))
            .and_then(|_| link.writer.flush());
        if let Err(e) = closed {
            warn!("renderer input closed early: {e}");
        }
        // Dropping the writer closes the renderer's stdin.
        drop(link);

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < deadline {
            self.drain_lines(host);
            let status = match self.child.as_mut().map(Child::try_wait) {
                Some(Ok(status)) => status,
                Some(Err(e)) => return Err(SessionError::io("failed to poll renderer process", e)),
                None => break,
            };
            if let Some(status) = status {
                return self.finish(status, host);
            }
            thread::sleep(Duration::from_millis(self.config.poll_interval_ms.min(100)));
        }

        if self.child.is_some() {
            warn!("renderer did not exit within {SHUTDOWN_GRACE:?}; killing it");
            self.kill();
        }
        self.reload_image(host, true);
        self.state = SessionState::Completed;
        Ok(self.state)
    }
}

impl Drop for RenderSession {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.kill();
        }
    }
}

/// Forwards each line of `pipe` until it closes or the receiver is gone.
fn spawn_reader<R: Read + Send + 'static>(pipe: R, tx: Sender<StreamLine>, wrap: fn(String) -> StreamLine) {
    thread::spawn(move || {
        for line in BufReader::new(pipe).lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(wrap(line)).is_err() {
                break;
            }
        }
    });
}

/// An old output must never be shown as the result of this render.
fn remove_stale_output(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_file(path) {
        warn!("unable to remove previous render {}: {e}", path.display());
    }
}

//! Error types for graph compilation and render sessions.
//!
//! Compilation failures ([`CompileError`]) are always fatal for the graph being
//! compiled. A graph without an output node is not an error: it compiles to an
//! empty record list. Renderer diagnostics are values ([`crate::session::Diagnostic`]),
//! not errors, because the renderer keeps going after reporting them.

use std::path::PathBuf;

use thiserror::Error;

use crate::registry::RiType;

/// The codec was handed a value it has no wire mapping for.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot encode {found} as '{hint}'")]
pub struct UnsupportedTypeError {
    /// Short description of the host value, e.g. `matrix` or `object`.
    pub found: String,
    /// The renderer type the parameter is declared with.
    pub hint: RiType,
}

#[derive(Error, Debug)]
pub enum CompileError {
    /// A connection path leads back to a node that is still being resolved.
    #[error("cycle detected in shading graph '{graph}': {}", path.join(" -> "))]
    CycleDetected { graph: String, path: Vec<String> },

    /// A parameter value could not be encoded; the enclosing node is not emitted.
    #[error("node '{node}' parameter '{param}': {source}")]
    UnsupportedType {
        node: String,
        param: String,
        #[source]
        source: UnsupportedTypeError,
    },

    /// The graph document does not match the registry (unknown types, dangling connections...).
    #[error("invalid shading graph: {0}")]
    InvalidGraph(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to launch renderer {}: {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("renderer exited unexpectedly ({}): {message}", code.map_or_else(|| "signal".to_string(), |c| format!("code {c}")))]
    Exit { code: Option<i32>, message: String },

    #[error("failed to write scene description: {0}")]
    Export(#[source] std::io::Error),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("texture optimiser failed for {}: {source}", path.display())]
    Texture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("session has no live renderer connection")]
    NotInteractive,
}

impl SessionError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

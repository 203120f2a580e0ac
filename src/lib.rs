pub mod codec;
pub mod compiler;
pub mod config;
pub mod dsl;
pub mod edit;
pub mod error;
pub mod export;
pub mod graph;
pub mod registry;
pub mod scene;
pub mod session;
pub mod stream;
pub mod textures;
pub mod wire;

//! Lumen - a Vulkan real-time 3D engine
//!
//! Scenes live in a Bevy ECS world and are drawn with ash through a small set
//! of render systems:
//! - Lit, textured meshes indexing a shared texture table
//! - Point light billboards
//! - An egui editor overlay
//!
//! Models (OBJ, glTF) are imported once and cached in a binary form, textures
//! and models are deduplicated by path in their libraries, and scenes are
//! saved as RON.

pub mod args;
pub mod assets;
pub mod editor;
pub mod engine;
pub mod error;
pub mod frame;
pub mod frame_rate;
pub mod renderer;
pub mod scene;
pub mod systems;
pub mod vulkan;
pub mod window;

use std::path::PathBuf;

// Re-export Bevy ECS prelude for users
pub use bevy_ecs::prelude::*;

pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use renderer::Renderer;
pub use scene::{Camera, Scene, SceneSerializer};
pub use window::Window;

/// Frame rate cap used unless configured otherwise
pub const DEFAULT_TARGET_FPS: f32 = 60.0;
/// Where imported models are cached unless configured otherwise
pub const DEFAULT_MODEL_CACHE_DIR: &str = "assets/models/cached";

/// Configuration for initializing the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Enable vsync
    pub vsync: bool,
    /// Enable the Khronos validation layer
    pub enable_validation: bool,
    /// Frame rate cap, `0` for none
    pub target_fps: f32,
    /// Scene file loaded at startup
    pub scene_path: Option<PathBuf>,
    /// Models for the default scene when no scene file is given
    pub models: Vec<String>,
    /// Where imported models are cached
    pub model_cache_dir: PathBuf,
    /// Show the editor overlay
    pub editor: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            title: "Lumen Engine".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            enable_validation: cfg!(debug_assertions),
            target_fps: DEFAULT_TARGET_FPS,
            scene_path: None,
            models: Vec::new(),
            model_cache_dir: PathBuf::from(DEFAULT_MODEL_CACHE_DIR),
            editor: true,
        }
    }
}

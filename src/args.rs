//! Command line arguments for the `lumen` binary.

use std::path::PathBuf;

use clap::Parser;

use crate::{EngineConfig, DEFAULT_MODEL_CACHE_DIR, DEFAULT_TARGET_FPS};

#[derive(Parser, Debug)]
#[command(
    name = "lumen",
    about = "Vulkan scene viewer with an egui editor overlay",
    long_about = "Renders a scene with lit, textured models and point light billboards.\n\n\
        EXAMPLES:\n\
          # Open a saved scene\n\
          lumen --scene assets/scenes/demo.ron\n\
        \n\
          # View a couple of models without a scene file\n\
          lumen assets/models/cube.obj assets/models/ship.glb",
    version
)]
pub struct Args {
    /// Models to place in the default scene. Ignored with --scene.
    pub models: Vec<String>,

    /// RON scene file to load at startup.
    #[arg(long)]
    pub scene: Option<PathBuf>,

    /// Initial window width in pixels.
    #[arg(long, default_value = "1280")]
    pub width: u32,

    /// Initial window height in pixels.
    #[arg(long, default_value = "720")]
    pub height: u32,

    /// Disable vertical sync (may cause tearing).
    #[arg(long)]
    pub no_vsync: bool,

    /// Frame rate cap, 0 for uncapped.
    #[arg(long, default_value_t = DEFAULT_TARGET_FPS)]
    pub fps: f32,

    /// Directory for the binary model cache.
    #[arg(long, default_value = DEFAULT_MODEL_CACHE_DIR)]
    pub model_cache_dir: PathBuf,

    /// Hide the editor overlay.
    #[arg(long)]
    pub no_editor: bool,

    /// Enable GPU validation layers (slower but helps catch bugs).
    #[arg(long, conflicts_with = "no_validation")]
    pub validation: bool,

    /// Disable GPU validation layers.
    #[arg(long, conflicts_with = "validation")]
    pub no_validation: bool,
}

impl From<Args> for EngineConfig {
    fn from(args: Args) -> Self {
        if args.scene.is_some() && !args.models.is_empty() {
            log::warn!("Model arguments are ignored when a scene file is given");
        }
        let enable_validation = args.validation || (!args.no_validation && cfg!(debug_assertions));

        Self {
            width: args.width,
            height: args.height,
            vsync: !args.no_vsync,
            enable_validation,
            target_fps: args.fps,
            scene_path: args.scene,
            models: args.models,
            model_cache_dir: args.model_cache_dir,
            editor: !args.no_editor,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_config() {
        let config = EngineConfig::from(Args::try_parse_from(["lumen"]).unwrap());
        let defaults = EngineConfig::default();
        assert_eq!(config.title, "Lumen Engine");
        assert_eq!((config.width, config.height), (defaults.width, defaults.height));
        assert_eq!((config.width, config.height), (1280, 720));
        assert!(config.vsync);
        assert!(config.editor);
        assert!(config.scene_path.is_none());
        assert_eq!(config.target_fps, 60.0);
        assert_eq!(config.target_fps, defaults.target_fps);
        assert_eq!(config.model_cache_dir, PathBuf::from("assets/models/cached"));
        assert_eq!(config.model_cache_dir, defaults.model_cache_dir);
    }

    #[test]
    fn test_model_cache_dir_flag() {
        let args = Args::try_parse_from(["lumen", "--model-cache-dir", "/tmp/lumen-cache"]).unwrap();
        assert_eq!(EngineConfig::from(args).model_cache_dir, PathBuf::from("/tmp/lumen-cache"));
    }

    #[test]
    fn test_flags() {
        let args = Args::try_parse_from([
            "lumen",
            "--scene",
            "demo.ron",
            "--no-vsync",
            "--no-editor",
            "--no-validation",
            "--fps",
            "30",
        ])
        .unwrap();
        let config = EngineConfig::from(args);
        assert_eq!(config.scene_path, Some(PathBuf::from("demo.ron")));
        assert!(!config.vsync && !config.editor && !config.enable_validation);
        assert_eq!(config.target_fps, 30.0);
    }

    #[test]
    fn test_models_are_positional() {
        let args = Args::try_parse_from(["lumen", "a.obj", "b.glb"]).unwrap();
        assert_eq!(args.models, vec!["a.obj".to_string(), "b.glb".to_string()]);
    }

    #[test]
    fn test_validation_flags_conflict() {
        assert!(Args::try_parse_from(["lumen", "--validation", "--no-validation"]).is_err());
    }
}

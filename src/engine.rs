//! Main engine orchestrator

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use glam::Vec3;

use crate::assets::{DeviceModelLoader, DeviceTextureLoader, ModelImporter, Models, Textures};
use crate::editor::Editor;
use crate::error::{EngineError, EngineResult};
use crate::frame_rate::FrameRateController;
use crate::renderer::{Renderer, RendererConfig};
use crate::scene::{Camera, ModelComponent, PointLightComponent, Scene, SceneSerializer, Transform};
use crate::vulkan::Device;
use crate::window::Window;
use crate::EngineConfig;

const FOV_Y_DEGREES: f32 = 50.0;
const NEAR_PLANE: f32 = 0.1;
const FAR_PLANE: f32 = 100.0;

/// 1x1 opaque white PNG, registered first so slot 0 is always valid
fn white_texture_png() -> EngineResult<Vec<u8>> {
    let pixel = image::RgbaImage::from_pixel(1, 1, image::Rgba([255, 255, 255, 255]));
    let mut bytes = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(pixel)
        .write_to(&mut bytes, image::ImageOutputFormat::Png)
        .map_err(|e| EngineError::Initialization(format!("Failed to encode default texture: {e}")))?;
    Ok(bytes.into_inner())
}

/// Scene used when no scene file is given: the requested models in a row, lit
/// by a ring of point lights.
pub fn default_scene(model_paths: &[String], models: &mut Models, textures: &mut Textures) -> EngineResult<Scene> {
    let mut scene = Scene::new("Default");

    let spacing = 1.5;
    let offset = (model_paths.len().saturating_sub(1)) as f32 * spacing / 2.0;
    for (i, path) in model_paths.iter().enumerate() {
        let index = models.get_model(path, textures)?;
        let name = Path::new(path)
            .file_stem()
            .map_or_else(|| path.clone(), |s| s.to_string_lossy().into_owned());
        let entity = scene.create_entity(name);
        scene.insert(entity, ModelComponent::with_index(path.clone(), index))?;
        scene.component_mut::<Transform>(entity)?.translation =
            Vec3::new(i as f32 * spacing - offset, 0.0, 0.0);
    }

    let colors = [
        Vec3::new(1.0, 0.1, 0.1),
        Vec3::new(0.1, 0.1, 1.0),
        Vec3::new(0.1, 1.0, 0.1),
        Vec3::new(1.0, 1.0, 0.1),
        Vec3::new(0.1, 1.0, 1.0),
        Vec3::new(1.0, 1.0, 1.0),
    ];
    for (i, color) in colors.iter().enumerate() {
        let angle = i as f32 * std::f32::consts::TAU / colors.len() as f32;
        let entity = scene.create_entity(format!("Light {i}"));
        scene.component_mut::<Transform>(entity)?.translation =
            Vec3::new(angle.cos(), -1.0, angle.sin());
        scene.insert(
            entity,
            PointLightComponent {
                color: *color,
                ..Default::default()
            },
        )?;
    }
    Ok(scene)
}

pub struct Engine {
    editor: Option<Editor>,
    renderer: Renderer,
    models: Models,
    textures: Textures,
    scene: Scene,
    camera: Camera,
    frame_rate: FrameRateController,
    device: Arc<Device>,
    window: Window,
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        let window = Window::new(&config.title, config.width, config.height)?;
        let device = Device::new(window.window(), &config.title, config.enable_validation)?;

        let mut textures = Textures::new(DeviceTextureLoader::new(device.clone()));
        textures.add_texture_from_memory(&white_texture_png()?)?;
        let importer = ModelImporter::new(config.model_cache_dir.clone());
        let mut models = Models::new(DeviceModelLoader::new(device.clone(), importer));

        let scene = match &config.scene_path {
            Some(path) => {
                let mut scene = Scene::default();
                SceneSerializer::deserialize(&mut scene, path, |model| {
                    models.get_model(model, &mut textures)
                })?;
                scene
            }
            None => default_scene(&config.models, &mut models, &mut textures)?,
        };

        let renderer = Renderer::new(
            device.clone(),
            &window,
            &textures,
            &RendererConfig {
                vsync: config.vsync,
                ..Default::default()
            },
        )?;
        let editor = if config.editor {
            Some(Editor::new(device.clone(), window.window(), renderer.render_pass())?)
        } else {
            None
        };

        let mut camera = Camera::default();
        camera.set_view_target(Vec3::new(0.0, -1.5, -4.0), Vec3::ZERO, Vec3::NEG_Y);

        log::info!(
            "Engine ready: scene '{}' with {} entities, {} models, {} textures",
            scene.name(),
            scene.entity_count(),
            models.len(),
            textures.len()
        );

        Ok(Self {
            editor,
            renderer,
            models,
            textures,
            scene,
            camera,
            frame_rate: FrameRateController::new(config.target_fps),
            device,
            window,
        })
    }

    /// Run until the window closes
    pub fn run(&mut self) -> EngineResult<()> {
        let Self {
            editor,
            renderer,
            models,
            textures,
            scene,
            camera,
            frame_rate,
            window,
            ..
        } = self;

        loop {
            let events = window.poll_events();
            if let Some(editor) = editor.as_mut() {
                for event in &events {
                    editor.on_window_event(window.window(), event);
                }
            }
            if window.should_close() {
                break;
            }

            let frame_time = frame_rate.wait_for_next_frame();
            camera.set_perspective_projection(
                FOV_Y_DEGREES.to_radians(),
                renderer.aspect_ratio(),
                NEAR_PLANE,
                FAR_PLANE,
            );

            match editor.as_mut() {
                Some(editor) => {
                    editor.run_frame(window.window(), scene, textures, models)?;
                    renderer.set_wireframe(editor.wireframe());
                    editor.set_render_pass(renderer.render_pass())?;
                    renderer.render(window, frame_time, scene, camera, textures, models, |cmd, extent| {
                        editor.draw(cmd, extent)
                    })?;
                }
                None => {
                    renderer.render(window, frame_time, scene, camera, textures, models, |_, _| Ok(()))?;
                }
            }
        }

        self.device.wait_idle()?;
        log::info!("Main loop finished");
        Ok(())
    }

    pub fn save_scene(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        SceneSerializer::serialize(&self.scene, path)
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(editor) = self.editor.as_mut() {
            editor.destroy();
        }
    }
}

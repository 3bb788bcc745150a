//! egui editor overlay
//!
//! Draws inside the swap chain render pass after the scene. Library textures
//! are shown through per-texture descriptor sets registered with egui as user
//! textures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ash::vk;
use bevy_ecs::entity::Entity;
use egui_ash_renderer::{Options, Renderer};
use glam::Vec3;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use winit::event::WindowEvent;
use winit::window::Window as WinitWindow;

use crate::assets::{Models, Textures, INVALID_TEXTURE_INDEX, MAX_TEXTURE_COUNT};
use crate::error::{EngineError, EngineResult};
use crate::frame::MAX_FRAMES_IN_FLIGHT;
use crate::scene::{ModelComponent, PointLightComponent, Scene, Transform};
use crate::vulkan::{DescriptorPool, DescriptorSetLayout, DescriptorWriter, Device};

const PREVIEW_SIZE: f32 = 64.0;

fn overlay_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Editor(e.to_string())
}

/// A texture as the browser panel sees it
#[derive(Debug, Clone, PartialEq)]
pub struct TextureEntry {
    pub index: u32,
    pub path: String,
    pub id: Option<egui::TextureId>,
}

/// UI state of the editor panels. Owns no GPU resources.
#[derive(Debug, Default)]
pub struct EditorPanels {
    pub selected: Option<Entity>,
    pub show_textures: bool,
    pub wireframe: bool,
    spawned: usize,
}

impl EditorPanels {
    pub fn show(
        &mut self,
        ctx: &egui::Context,
        scene: &mut Scene,
        textures: &[TextureEntry],
        models: &[(u32, String)],
    ) {
        if self.selected.is_some_and(|e| !scene.contains(e)) {
            self.selected = None;
        }

        egui::SidePanel::left("scene_panel")
            .resizable(true)
            .default_width(260.0)
            .show(ctx, |ui| {
                ui.heading(scene.name().to_string());
                ui.horizontal(|ui| {
                    if ui.button("Add entity").clicked() {
                        self.spawned += 1;
                        let entity = scene.create_entity(format!("Entity {}", self.spawned));
                        self.selected = Some(entity);
                    }
                    let delete = ui.add_enabled(self.selected.is_some(), egui::Button::new("Delete"));
                    if delete.clicked() {
                        if let Some(entity) = self.selected.take() {
                            scene.destroy_entity(entity);
                        }
                    }
                });
                ui.checkbox(&mut self.wireframe, "Wireframe");
                ui.checkbox(&mut self.show_textures, "Texture browser");
                ui.separator();

                egui::ScrollArea::vertical()
                    .max_height(240.0)
                    .auto_shrink([false, true])
                    .show(ui, |ui| {
                        for (entity, tag) in scene.tagged_entities() {
                            let selected = self.selected == Some(entity);
                            if ui.selectable_label(selected, tag).clicked() {
                                self.selected = Some(entity);
                            }
                        }
                    });

                ui.separator();
                match self.selected {
                    Some(entity) => entity_inspector(ui, scene, entity, textures),
                    None => {
                        ui.label("No entity selected");
                    }
                }

                ui.separator();
                ui.collapsing(format!("Models ({})", models.len()), |ui| {
                    for (index, path) in models {
                        ui.label(format!("{index}: {path}"));
                    }
                });
            });

        if self.show_textures {
            egui::Window::new("Textures")
                .open(&mut self.show_textures)
                .default_width(360.0)
                .show(ctx, |ui| texture_browser(ui, textures));
        }
    }
}

fn vec3_row(ui: &mut egui::Ui, label: &str, value: &mut Vec3, speed: f32) -> bool {
    let mut changed = false;
    ui.horizontal(|ui| {
        ui.label(label);
        changed |= ui.add(egui::DragValue::new(&mut value.x).speed(speed).prefix("x ")).changed();
        changed |= ui.add(egui::DragValue::new(&mut value.y).speed(speed).prefix("y ")).changed();
        changed |= ui.add(egui::DragValue::new(&mut value.z).speed(speed).prefix("z ")).changed();
    });
    changed
}

fn entity_inspector(ui: &mut egui::Ui, scene: &mut Scene, entity: Entity, textures: &[TextureEntry]) {
    if let Ok(tag) = scene.component::<crate::scene::Tag>(entity) {
        ui.strong(tag.0.clone());
    }

    match scene.component::<Transform>(entity).copied() {
        Ok(mut transform) => {
            let mut degrees = Vec3::new(
                transform.rotation.x.to_degrees(),
                transform.rotation.y.to_degrees(),
                transform.rotation.z.to_degrees(),
            );
            let mut changed = vec3_row(ui, "Position", &mut transform.translation, 0.05);
            if vec3_row(ui, "Rotation", &mut degrees, 1.0) {
                transform.rotation = Vec3::new(
                    degrees.x.to_radians(),
                    degrees.y.to_radians(),
                    degrees.z.to_radians(),
                );
                changed = true;
            }
            changed |= vec3_row(ui, "Scale", &mut transform.scale, 0.01);
            if changed {
                if let Ok(mut current) = scene.component_mut::<Transform>(entity) {
                    *current = transform;
                }
            }
        }
        Err(_) => {
            if ui.button("Add transform").clicked() {
                if let Err(e) = scene.insert(entity, Transform::default()) {
                    log::warn!("{e}");
                }
            }
        }
    }

    if let Ok(mut model) = scene.component::<ModelComponent>(entity).cloned() {
        ui.label(format!("Model: {} (#{})", model.path, model.model_index));
        let selected_text = textures
            .iter()
            .find(|t| t.index == model.fallback_texture)
            .map_or_else(|| "None".to_string(), |t| t.path.clone());
        let before = model.fallback_texture;
        egui::ComboBox::from_label("Fallback texture")
            .selected_text(selected_text)
            .show_ui(ui, |ui| {
                ui.selectable_value(&mut model.fallback_texture, INVALID_TEXTURE_INDEX, "None");
                for texture in textures {
                    ui.selectable_value(&mut model.fallback_texture, texture.index, &texture.path);
                }
            });
        if model.fallback_texture != before {
            if let Ok(mut current) = scene.component_mut::<ModelComponent>(entity) {
                current.fallback_texture = model.fallback_texture;
            }
        }
    }

    if let Ok(mut light) = scene.component::<PointLightComponent>(entity).copied() {
        let mut color = light.color.to_array();
        let mut changed = false;
        ui.horizontal(|ui| {
            ui.label("Light color");
            changed |= ui.color_edit_button_rgb(&mut color).changed();
        });
        changed |= ui
            .add(egui::Slider::new(&mut light.intensity, 0.0..=5.0).text("Intensity"))
            .changed();
        changed |= ui
            .add(egui::Slider::new(&mut light.radius, 0.01..=1.0).text("Radius"))
            .changed();
        if changed {
            light.color = Vec3::from_array(color);
            if let Ok(mut current) = scene.component_mut::<PointLightComponent>(entity) {
                *current = light;
            }
        }
    }
}

fn texture_browser(ui: &mut egui::Ui, textures: &[TextureEntry]) {
    egui::ScrollArea::vertical().show(ui, |ui| {
        ui.horizontal_wrapped(|ui| {
            for texture in textures {
                ui.vertical(|ui| {
                    match texture.id {
                        Some(id) => {
                            let size = egui::vec2(PREVIEW_SIZE, PREVIEW_SIZE);
                            ui.add(egui::Image::new(egui::load::SizedTexture::new(id, size)));
                        }
                        None => {
                            ui.label("(no preview)");
                        }
                    }
                    ui.small(format!("{}: {}", texture.index, texture.path));
                });
            }
        });
    });
}

pub struct Editor {
    ctx: egui::Context,
    winit_state: egui_winit::State,
    /// Dropped before `allocator`
    renderer: Option<Renderer>,
    allocator: Option<Arc<Mutex<Allocator>>>,
    render_pass: vk::RenderPass,
    texture_sets: HashMap<u32, vk::DescriptorSet>,
    texture_ids: HashMap<u32, egui::TextureId>,
    texture_pool: DescriptorPool,
    texture_layout: DescriptorSetLayout,
    paint_jobs: Vec<egui::ClippedPrimitive>,
    textures_delta: egui::TexturesDelta,
    panels: EditorPanels,
    device: Arc<Device>,
}

impl Editor {
    pub fn new(device: Arc<Device>, window: &WinitWindow, render_pass: vk::RenderPass) -> EngineResult<Self> {
        let ctx = egui::Context::default();
        let winit_state = egui_winit::State::new(
            ctx.clone(),
            egui::ViewportId::ROOT,
            window,
            Some(window.scale_factor() as f32),
            None,
        );

        // egui-ash-renderer wants its own std Mutex allocator
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: device.instance().clone(),
            device: device.logical().clone(),
            physical_device: device.physical_device(),
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;
        let allocator = Arc::new(Mutex::new(allocator));

        let renderer = Renderer::with_gpu_allocator(
            allocator.clone(),
            device.logical().clone(),
            render_pass,
            Options {
                in_flight_frames: MAX_FRAMES_IN_FLIGHT,
                srgb_framebuffer: true,
                ..Default::default()
            },
        )
        .map_err(overlay_error)?;

        let texture_layout = DescriptorSetLayout::builder(device.clone())
            .add_binding(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
                1,
            )
            .build()?;
        let texture_pool = DescriptorPool::builder(device.clone())
            .max_sets(MAX_TEXTURE_COUNT as u32)
            .add_pool_size(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, MAX_TEXTURE_COUNT as u32)
            .build()?;

        Ok(Self {
            ctx,
            winit_state,
            renderer: Some(renderer),
            allocator: Some(allocator),
            render_pass,
            texture_sets: HashMap::new(),
            texture_ids: HashMap::new(),
            texture_pool,
            texture_layout,
            paint_jobs: Vec::new(),
            textures_delta: egui::TexturesDelta::default(),
            panels: EditorPanels::default(),
            device,
        })
    }

    fn renderer_mut(&mut self) -> EngineResult<&mut Renderer> {
        self.renderer
            .as_mut()
            .ok_or_else(|| EngineError::Editor("editor was destroyed".into()))
    }

    /// Descriptor set showing the texture registered under `path`
    pub fn texture_descriptor_set(&mut self, textures: &Textures, path: &str) -> EngineResult<vk::DescriptorSet> {
        let index = textures.lookup(path)?;
        self.texture_descriptor_set_by_index(textures, index)
    }

    pub fn texture_descriptor_set_by_index(
        &mut self,
        textures: &Textures,
        index: u32,
    ) -> EngineResult<vk::DescriptorSet> {
        let texture = textures.texture_checked(index)?;
        if let Some(&set) = self.texture_sets.get(&index) {
            return Ok(set);
        }
        let info = [texture.descriptor_info()];
        let set = DescriptorWriter::new(&self.texture_layout)
            .write_images(0, &info)
            .build(&self.texture_pool)?;
        self.texture_sets.insert(index, set);
        Ok(set)
    }

    /// egui handle for a library texture
    pub fn texture_id(&mut self, textures: &Textures, index: u32) -> EngineResult<egui::TextureId> {
        if let Some(&id) = self.texture_ids.get(&index) {
            return Ok(id);
        }
        let set = self.texture_descriptor_set_by_index(textures, index)?;
        let id = self.renderer_mut()?.add_user_texture(set);
        self.texture_ids.insert(index, id);
        Ok(id)
    }

    /// Returns whether egui consumed the event
    pub fn on_window_event(&mut self, window: &WinitWindow, event: &WindowEvent) -> bool {
        self.winit_state.on_window_event(window, event).consumed
    }

    /// Build this frame's UI and upload any egui texture changes
    pub fn run_frame(
        &mut self,
        window: &WinitWindow,
        scene: &mut Scene,
        textures: &Textures,
        models: &Models,
    ) -> EngineResult<()> {
        let mut entries = Vec::with_capacity(textures.len());
        for (index, path, _) in textures.iter() {
            let id = if self.panels.show_textures {
                Some(self.texture_id(textures, index)?)
            } else {
                self.texture_ids.get(&index).copied()
            };
            entries.push(TextureEntry {
                index,
                path: path.to_string(),
                id,
            });
        }
        let model_list: Vec<_> = models.iter().map(|(i, path, _)| (i, path.to_string())).collect();

        let raw_input = self.winit_state.take_egui_input(window);
        let ctx = self.ctx.clone();
        let panels = &mut self.panels;
        let full_output = ctx.run(raw_input, |ctx| panels.show(ctx, scene, &entries, &model_list));

        self.winit_state
            .handle_platform_output(window, full_output.platform_output);
        self.paint_jobs = ctx.tessellate(full_output.shapes, full_output.pixels_per_point);
        self.textures_delta.append(full_output.textures_delta);

        let uploads = std::mem::take(&mut self.textures_delta.set);
        if !uploads.is_empty() {
            let queue = self.device.graphics_queue();
            let device = self.device.clone();
            let renderer = self.renderer_mut()?;
            device
                .with_command_pool(|pool| renderer.set_textures(queue, pool, &uploads))
                .map_err(overlay_error)?;
        }
        Ok(())
    }

    /// Pick up a render pass rebuilt with the swap chain
    pub fn set_render_pass(&mut self, render_pass: vk::RenderPass) -> EngineResult<()> {
        if render_pass == self.render_pass {
            return Ok(());
        }
        self.renderer_mut()?
            .set_render_pass(render_pass)
            .map_err(overlay_error)?;
        self.render_pass = render_pass;
        Ok(())
    }

    /// Record the overlay into the open swap chain render pass
    pub fn draw(&mut self, command_buffer: vk::CommandBuffer, extent: vk::Extent2D) -> EngineResult<()> {
        let pixels_per_point = self.ctx.pixels_per_point();
        let paint_jobs = std::mem::take(&mut self.paint_jobs);
        let freed = std::mem::take(&mut self.textures_delta.free);

        let renderer = self.renderer_mut()?;
        renderer
            .cmd_draw(command_buffer, extent, pixels_per_point, &paint_jobs)
            .map_err(overlay_error)?;
        if !freed.is_empty() {
            renderer.free_textures(&freed).map_err(overlay_error)?;
        }
        Ok(())
    }

    pub fn wireframe(&self) -> bool {
        self.panels.wireframe
    }

    pub fn panels(&self) -> &EditorPanels {
        &self.panels
    }

    pub fn context(&self) -> &egui::Context {
        &self.ctx
    }

    pub fn wants_keyboard_input(&self) -> bool {
        self.ctx.wants_keyboard_input()
    }

    pub fn wants_pointer_input(&self) -> bool {
        self.ctx.wants_pointer_input()
    }

    /// Release GPU resources while the device is still alive
    pub fn destroy(&mut self) {
        if self.renderer.is_none() && self.allocator.is_none() {
            return;
        }
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle before destroying editor: {e}");
        }
        self.texture_ids.clear();
        self.renderer = None;
        self.allocator = None;
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        if self.renderer.is_some() {
            log::warn!("Editor dropped without destroy(), releasing now");
            self.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(panels: &mut EditorPanels, scene: &mut Scene) {
        let ctx = egui::Context::default();
        let _ = ctx.run(egui::RawInput::default(), |ctx| {
            panels.show(ctx, scene, &[], &[(0, "cube.obj".into())]);
        });
    }

    #[test]
    fn test_panels_run_headless() {
        let mut scene = Scene::new("Headless");
        let cube = scene.create_entity("Cube");
        scene.insert(cube, ModelComponent::with_index("cube.obj", 0)).unwrap();
        scene.insert(cube, PointLightComponent::default()).unwrap();

        let mut panels = EditorPanels {
            selected: Some(cube),
            show_textures: true,
            ..Default::default()
        };
        run(&mut panels, &mut scene);
        assert_eq!(panels.selected, Some(cube));
        assert_eq!(scene.entity_count(), 1);
    }

    #[test]
    fn test_stale_selection_is_cleared() {
        let mut scene = Scene::default();
        let entity = scene.create_entity("Gone");
        scene.destroy_entity(entity);

        let mut panels = EditorPanels {
            selected: Some(entity),
            ..Default::default()
        };
        run(&mut panels, &mut scene);
        assert_eq!(panels.selected, None);
    }
}

//! Render systems
//!
//! Each system owns its pipeline layout and pipelines and records draws into
//! the swapchain render pass. The renderer runs them in a fixed order.

mod point_light;
mod simple;

pub use point_light::{write_lights, PointLightPushConstants, PointLightSystem, MAX_LIGHTS};
pub use simple::{collect_draws, resolve_texture_index, DrawCall, SimplePushConstants, SimpleRenderSystem};

use ash::vk;

use crate::assets::Models;
use crate::error::EngineResult;
use crate::renderer::GlobalUbo;
use crate::scene::{Camera, Scene};

/// Per-frame context handed to every system. Built fresh each frame.
pub struct FrameInfo<'a> {
    pub frame_index: usize,
    pub frame_time: f32,
    pub command_buffer: vk::CommandBuffer,
    pub camera: &'a Camera,
    pub global_descriptor_set: vk::DescriptorSet,
    pub scene: &'a Scene,
}

pub enum RenderSystem {
    Simple(SimpleRenderSystem),
    PointLight(PointLightSystem),
}

impl RenderSystem {
    pub fn name(&self) -> &'static str {
        match self {
            RenderSystem::Simple(_) => "simple",
            RenderSystem::PointLight(_) => "point_light",
        }
    }

    /// Contribute to the global uniform data before it is uploaded
    pub fn update(&mut self, frame: &FrameInfo, ubo: &mut GlobalUbo) {
        match self {
            RenderSystem::Simple(_) => {}
            RenderSystem::PointLight(system) => system.update(frame, ubo),
        }
    }

    pub fn render(&self, frame: &FrameInfo, models: &Models, loaded_textures: usize) -> EngineResult<()> {
        match self {
            RenderSystem::Simple(system) => system.render(frame, models, loaded_textures),
            RenderSystem::PointLight(system) => system.render(frame),
        }
    }

    pub fn as_simple_mut(&mut self) -> Option<&mut SimpleRenderSystem> {
        match self {
            RenderSystem::Simple(system) => Some(system),
            _ => None,
        }
    }
}

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec4;

use super::FrameInfo;
use crate::error::EngineResult;
use crate::renderer::{GlobalUbo, PointLightUbo};
use crate::scene::{PointLightComponent, Transform};
use crate::vulkan::{Device, Pipeline, PipelineConfig, PipelineLayout};

pub const MAX_LIGHTS: usize = 10;

const SHADER: &str = include_str!("../shaders/point_light.wgsl");

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PointLightPushConstants {
    pub position: Vec4,
    pub color: Vec4,
    pub radius: f32,
    _padding: [f32; 3],
}

impl PointLightPushConstants {
    fn new(transform: &Transform, light: &PointLightComponent) -> Self {
        Self {
            position: transform.translation.extend(1.0),
            color: light.color.extend(light.intensity),
            radius: light.radius,
            _padding: [0.0; 3],
        }
    }
}

/// Copy up to [`MAX_LIGHTS`] lights into the uniform data
pub fn write_lights(lights: &[(Transform, PointLightComponent)], ubo: &mut GlobalUbo) -> usize {
    let count = lights.len().min(MAX_LIGHTS);
    if lights.len() > MAX_LIGHTS {
        log::debug!("{} point lights in scene, only {MAX_LIGHTS} are lit", lights.len());
    }
    for (slot, (transform, light)) in ubo.point_lights.iter_mut().zip(lights) {
        *slot = PointLightUbo {
            position: transform.translation.extend(1.0),
            color: light.color.extend(light.intensity),
        };
    }
    ubo.num_lights = count as i32;
    count
}

/// Draws every point light as a camera-facing billboard
pub struct PointLightSystem {
    device: Arc<Device>,
    pipeline_layout: PipelineLayout,
    pipeline: Pipeline,
}

impl PointLightSystem {
    pub fn new(
        device: Arc<Device>,
        render_pass: vk::RenderPass,
        global_set_layout: vk::DescriptorSetLayout,
    ) -> EngineResult<Self> {
        let push_constant_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(std::mem::size_of::<PointLightPushConstants>() as u32);
        let pipeline_layout =
            PipelineLayout::new(device.clone(), &[global_set_layout], &[push_constant_range])?;

        let mut config = PipelineConfig {
            pipeline_layout: pipeline_layout.handle(),
            render_pass,
            ..Default::default()
        };
        config.enable_alpha_blending();
        let pipeline = Pipeline::new(device.clone(), SHADER, SHADER, &config)?;

        Ok(Self {
            device,
            pipeline_layout,
            pipeline,
        })
    }

    pub fn update(&mut self, frame: &FrameInfo, ubo: &mut GlobalUbo) {
        write_lights(&frame.scene.point_lights(), ubo);
    }

    pub fn render(&self, frame: &FrameInfo) -> EngineResult<()> {
        let device = self.device.logical();
        let cmd = frame.command_buffer;

        self.pipeline.bind(cmd);
        unsafe {
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout.handle(),
                0,
                &[frame.global_descriptor_set],
                &[],
            );
        }

        for (transform, light) in frame.scene.point_lights().iter().take(MAX_LIGHTS) {
            let push = PointLightPushConstants::new(transform, light);
            unsafe {
                device.cmd_push_constants(
                    cmd,
                    self.pipeline_layout.handle(),
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::bytes_of(&push),
                );
                device.cmd_draw(cmd, 6, 1, 0, 0);
            }
        }
        Ok(())
    }
}

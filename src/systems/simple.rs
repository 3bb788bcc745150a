//! Lit mesh rendering with per-draw texture selection

use std::sync::Arc;

use ash::vk;
use bevy_ecs::entity::Entity;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use super::FrameInfo;
use crate::assets::{ModelResource, Models, Vertex, INVALID_TEXTURE_INDEX};
use crate::error::EngineResult;
use crate::scene::Renderable;
use crate::vulkan::{Device, Pipeline, PipelineConfig, PipelineLayout};

const SHADER: &str = include_str!("../shaders/simple_shader.wgsl");

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SimplePushConstants {
    pub model: Mat4,
    pub normal: Mat4,
    pub texture_index: i32,
    _padding: [i32; 3],
}

impl SimplePushConstants {
    pub fn new(model: Mat4, normal: Mat4, texture_index: i32) -> Self {
        Self {
            model,
            normal,
            texture_index,
            _padding: [0; 3],
        }
    }
}

/// Shader texture index for a mesh, or `-1` to draw untextured.
///
/// The mesh's own texture wins; the entity fallback only fills in when the mesh
/// has none. Anything at or past `loaded` is a padding slot and never sampled.
pub fn resolve_texture_index(mesh_texture: u32, fallback: u32, loaded: usize) -> i32 {
    let index = if mesh_texture == INVALID_TEXTURE_INDEX {
        fallback
    } else {
        mesh_texture
    };
    if index == INVALID_TEXTURE_INDEX || index as usize >= loaded {
        -1
    } else {
        index as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawCall {
    pub entity: Entity,
    pub model_index: u32,
    pub mesh: usize,
    pub push: SimplePushConstants,
}

/// One draw per mesh of every renderable with a resolvable model
pub fn collect_draws<'m, M, F>(renderables: &[Renderable], lookup: F, loaded_textures: usize) -> Vec<DrawCall>
where
    M: ModelResource + 'm,
    F: Fn(u32) -> Option<&'m M>,
{
    let mut draws = Vec::new();
    for renderable in renderables {
        let Some(component) = &renderable.model else {
            continue;
        };
        let Some(model) = lookup(component.model_index) else {
            continue;
        };

        let model_matrix = renderable.transform.mat4();
        let normal_matrix = renderable.transform.normal_matrix();
        for mesh in 0..model.mesh_count() {
            let texture_index = resolve_texture_index(
                model.mesh_texture_index(mesh),
                component.fallback_texture,
                loaded_textures,
            );
            draws.push(DrawCall {
                entity: renderable.entity,
                model_index: component.model_index,
                mesh,
                push: SimplePushConstants::new(model_matrix, normal_matrix, texture_index),
            });
        }
    }
    draws
}

pub struct SimpleRenderSystem {
    device: Arc<Device>,
    pipeline_layout: PipelineLayout,
    pipeline: Pipeline,
    wireframe_pipeline: Option<Pipeline>,
    wireframe: bool,
}

impl SimpleRenderSystem {
    pub fn new(
        device: Arc<Device>,
        render_pass: vk::RenderPass,
        global_set_layout: vk::DescriptorSetLayout,
    ) -> EngineResult<Self> {
        let push_constant_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(std::mem::size_of::<SimplePushConstants>() as u32);
        let pipeline_layout =
            PipelineLayout::new(device.clone(), &[global_set_layout], &[push_constant_range])?;

        let mut config = PipelineConfig {
            binding_descriptions: Vertex::binding_descriptions(),
            attribute_descriptions: Vertex::attribute_descriptions(),
            pipeline_layout: pipeline_layout.handle(),
            render_pass,
            flags: vk::PipelineCreateFlags::ALLOW_DERIVATIVES,
            ..Default::default()
        };
        let pipeline = Pipeline::new(device.clone(), SHADER, SHADER, &config)?;

        let wireframe_pipeline = if device.features().fill_mode_non_solid {
            config.polygon_mode = vk::PolygonMode::LINE;
            config.derive_from(pipeline.handle());
            Some(Pipeline::new(device.clone(), SHADER, SHADER, &config)?)
        } else {
            log::warn!("fillModeNonSolid unsupported, wireframe mode disabled");
            None
        };

        Ok(Self {
            device,
            pipeline_layout,
            pipeline,
            wireframe_pipeline,
            wireframe: false,
        })
    }

    /// Switch to line rendering. Ignored when the device cannot do it.
    pub fn set_wireframe(&mut self, enabled: bool) {
        self.wireframe = enabled && self.wireframe_pipeline.is_some();
    }

    pub fn wireframe(&self) -> bool {
        self.wireframe
    }

    pub fn supports_wireframe(&self) -> bool {
        self.wireframe_pipeline.is_some()
    }

    fn active_pipeline(&self) -> &Pipeline {
        match &self.wireframe_pipeline {
            Some(pipeline) if self.wireframe => pipeline,
            _ => &self.pipeline,
        }
    }

    pub fn render(&self, frame: &FrameInfo, models: &Models, loaded_textures: usize) -> EngineResult<()> {
        let device = self.device.logical();
        let cmd = frame.command_buffer;

        self.active_pipeline().bind(cmd);
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

        let renderables = frame.scene.renderables();
        let draws = collect_draws(&renderables, |index| models.model(index), loaded_textures);
        for draw in &draws {
            let Some(mesh) = models
                .model(draw.model_index)
                .and_then(|model| model.meshes.get(draw.mesh))
            else {
                continue;
            };
            unsafe {
                device.cmd_push_constants(
                    cmd,
                    self.pipeline_layout.handle(),
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::bytes_of(&draw.push),
                );
            }
            mesh.bind(cmd);
            mesh.draw(cmd);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{ModelComponent, Scene, Transform};
    use glam::Vec3;
    use rstest::rstest;

    struct FakeModel(Vec<u32>);

    impl ModelResource for FakeModel {
        fn mesh_count(&self) -> usize {
            self.0.len()
        }

        fn mesh_texture_index(&self, mesh: usize) -> u32 {
            self.0[mesh]
        }
    }

    #[test]
    fn test_push_constant_layout() {
        // matches the WGSL struct, rounded up to 16-byte alignment
        assert_eq!(std::mem::size_of::<SimplePushConstants>(), 144);
    }

    #[rstest]
    #[case(3, INVALID_TEXTURE_INDEX, 5, 3)]
    #[case(3, 1, 5, 3)]
    #[case(INVALID_TEXTURE_INDEX, 1, 5, 1)]
    #[case(INVALID_TEXTURE_INDEX, INVALID_TEXTURE_INDEX, 5, -1)]
    #[case(7, INVALID_TEXTURE_INDEX, 5, -1)]
    #[case(INVALID_TEXTURE_INDEX, 7, 5, -1)]
    fn test_resolve_texture_index(
        #[case] mesh: u32,
        #[case] fallback: u32,
        #[case] loaded: usize,
        #[case] expected: i32,
    ) {
        assert_eq!(resolve_texture_index(mesh, fallback, loaded), expected);
    }

    #[test]
    fn test_collect_draws_skips_unresolved_models() {
        let mut scene = Scene::default();
        let cube = scene.create_entity("Cube");
        scene.insert(cube, ModelComponent::with_index("cube.obj", 0)).unwrap();
        scene.component_mut::<Transform>(cube).unwrap().translation = Vec3::X;
        let unresolved = scene.create_entity("Pending");
        scene.insert(unresolved, ModelComponent::new("pending.obj")).unwrap();
        let dangling = scene.create_entity("Dangling");
        scene.insert(dangling, ModelComponent::with_index("gone.obj", 4)).unwrap();
        scene.create_entity("Pivot");

        let models = [FakeModel(vec![1, INVALID_TEXTURE_INDEX])];
        let draws = collect_draws(&scene.renderables(), |i| models.get(i as usize), 2);

        assert_eq!(draws.len(), 2);
        assert!(draws.iter().all(|d| d.entity == cube));
        assert_eq!(draws[0].push.texture_index, 1);
        assert_eq!(draws[1].push.texture_index, -1);
        assert_eq!(draws[0].push.model, Mat4::from_translation(Vec3::X));
    }

    #[test]
    fn test_fallback_texture_applies_per_entity() {
        let mut scene = Scene::default();
        let entity = scene.create_entity("Crate");
        let mut component = ModelComponent::with_index("crate.obj", 0);
        component.fallback_texture = 2;
        scene.insert(entity, component).unwrap();

        let models = [FakeModel(vec![INVALID_TEXTURE_INDEX, 0])];
        let draws = collect_draws(&scene.renderables(), |i| models.get(i as usize), 3);
        let indices: Vec<_> = draws.iter().map(|d| d.push.texture_index).collect();
        assert_eq!(indices, vec![2, 0]);
    }
}

//! Frame orchestration
//!
//! The [`Renderer`] owns the frame loop, the global descriptor set (camera and
//! lights, the texture table, bone matrices) and the render systems. One call
//! to [`Renderer::render`] records and presents one frame.

use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use crate::assets::{Models, Textures, MAX_TEXTURE_COUNT};
use crate::error::{EngineError, EngineResult};
use crate::frame::{FrameLoop, SurfaceSource, SwapchainPresenter, MAX_FRAMES_IN_FLIGHT};
use crate::scene::{Camera, Scene};
use crate::systems::{FrameInfo, PointLightSystem, RenderSystem, SimpleRenderSystem, MAX_LIGHTS};
use crate::vulkan::{Buffer, DescriptorPool, DescriptorSetLayout, DescriptorWriter, Device};

pub const MAX_BONES: usize = 100;

pub const GLOBAL_UBO_BINDING: u32 = 0;
/// Sampled images, one per texture slot
pub const TEXTURES_BINDING: u32 = 1;
pub const BONES_BINDING: u32 = 2;
/// Samplers, indexed like [`TEXTURES_BINDING`]
pub const SAMPLERS_BINDING: u32 = 3;

/// Binding, descriptor type, stages and count of every entry in the global set
pub fn global_bindings() -> [(u32, vk::DescriptorType, vk::ShaderStageFlags, u32); 4] {
    let slots = MAX_TEXTURE_COUNT as u32;
    [
        (GLOBAL_UBO_BINDING, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::ALL_GRAPHICS, 1),
        (TEXTURES_BINDING, vk::DescriptorType::SAMPLED_IMAGE, vk::ShaderStageFlags::FRAGMENT, slots),
        (BONES_BINDING, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::ALL_GRAPHICS, 1),
        (SAMPLERS_BINDING, vk::DescriptorType::SAMPLER, vk::ShaderStageFlags::FRAGMENT, slots),
    ]
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PointLightUbo {
    pub position: Vec4,
    /// w is intensity
    pub color: Vec4,
}

/// Uniform data shared by every system, laid out to match the shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GlobalUbo {
    pub projection: Mat4,
    pub view: Mat4,
    pub inverse_view: Mat4,
    pub ambient_light_color: Vec4,
    pub point_lights: [PointLightUbo; MAX_LIGHTS],
    pub num_lights: i32,
    _padding: [i32; 3],
}

impl Default for GlobalUbo {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            inverse_view: Mat4::IDENTITY,
            ambient_light_color: Vec4::new(1.0, 1.0, 1.0, 0.02),
            point_lights: [PointLightUbo::default(); MAX_LIGHTS],
            num_lights: 0,
            _padding: [0; 3],
        }
    }
}

/// Bone palette, uploaded as-is every frame
#[derive(Debug, Clone, PartialEq)]
pub struct BonesUbo {
    pub matrices: [Mat4; MAX_BONES],
}

impl Default for BonesUbo {
    fn default() -> Self {
        Self {
            matrices: [Mat4::IDENTITY; MAX_BONES],
        }
    }
}

impl BonesUbo {
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.matrices)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RendererConfig {
    pub vsync: bool,
    pub ambient_light_color: Vec4,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            ambient_light_color: GlobalUbo::default().ambient_light_color,
        }
    }
}

/// Library index for every texture slot: loaded textures map to themselves,
/// the rest repeat texture 0.
pub fn texture_slot_indices(loaded: usize, capacity: usize) -> Vec<u32> {
    (0..capacity)
        .map(|slot| if slot < loaded { slot as u32 } else { 0 })
        .collect()
}

/// Image infos for the texture table. The same infos fill both the image and
/// the sampler binding, Vulkan ignores the sampler for one and the view for the other.
fn texture_image_infos(textures: &Textures) -> Vec<vk::DescriptorImageInfo> {
    texture_slot_indices(textures.len(), MAX_TEXTURE_COUNT)
        .into_iter()
        .filter_map(|index| textures.texture(index).map(|t| t.descriptor_info()))
        .collect()
}

pub struct Renderer {
    systems: Vec<RenderSystem>,
    global_sets: Vec<vk::DescriptorSet>,
    written_texture_counts: Vec<usize>,
    global_pool: DescriptorPool,
    global_set_layout: DescriptorSetLayout,
    ubo_buffers: Vec<Buffer>,
    bone_buffers: Vec<Buffer>,
    bones: BonesUbo,
    ambient_light_color: Vec4,
    frame_loop: FrameLoop<SwapchainPresenter>,
    device: Arc<Device>,
}

impl Renderer {
    pub fn new(
        device: Arc<Device>,
        surface: &impl SurfaceSource,
        textures: &Textures,
        config: &RendererConfig,
    ) -> EngineResult<Self> {
        if textures.is_empty() {
            return Err(EngineError::Initialization(
                "Renderer needs at least one texture to fill the texture table".into(),
            ));
        }

        let presenter = SwapchainPresenter::new(device.clone(), surface.framebuffer_extent(), config.vsync)?;
        let frame_loop = FrameLoop::new(presenter);

        let frames = MAX_FRAMES_IN_FLIGHT as u32;
        let mut pool = DescriptorPool::builder(device.clone()).max_sets(frames);
        let mut layout = DescriptorSetLayout::builder(device.clone());
        for (binding, ty, stages, count) in global_bindings() {
            pool = pool.add_pool_size(ty, frames * count);
            layout = layout.add_binding(binding, ty, stages, count);
        }
        let global_pool = pool.build()?;
        let global_set_layout = layout.build()?;

        let bones = BonesUbo::default();
        let mut ubo_buffers = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut bone_buffers = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            let mut ubo = Buffer::uniform(device.clone(), std::mem::size_of::<GlobalUbo>(), 1)?;
            ubo.map()?;
            ubo_buffers.push(ubo);

            let mut bone_buffer = Buffer::uniform(device.clone(), std::mem::size_of::<BonesUbo>(), 1)?;
            bone_buffer.map()?;
            bone_buffer.write_to_buffer(bones.as_bytes(), 0)?;
            bone_buffer.flush(vk::WHOLE_SIZE, 0)?;
            bone_buffers.push(bone_buffer);
        }

        let image_infos = texture_image_infos(textures);
        let mut global_sets = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for frame in 0..MAX_FRAMES_IN_FLIGHT {
            let ubo_info = [ubo_buffers[frame].descriptor_info(vk::WHOLE_SIZE, 0)];
            let bones_info = [bone_buffers[frame].descriptor_info(vk::WHOLE_SIZE, 0)];
            let set = DescriptorWriter::new(&global_set_layout)
                .write_buffer(GLOBAL_UBO_BINDING, &ubo_info)
                .write_images(TEXTURES_BINDING, &image_infos)
                .write_buffer(BONES_BINDING, &bones_info)
                .write_images(SAMPLERS_BINDING, &image_infos)
                .build(&global_pool)?;
            global_sets.push(set);
        }

        let render_pass = frame_loop.presenter().render_pass();
        let systems = vec![
            RenderSystem::Simple(SimpleRenderSystem::new(
                device.clone(),
                render_pass,
                global_set_layout.handle(),
            )?),
            RenderSystem::PointLight(PointLightSystem::new(
                device.clone(),
                render_pass,
                global_set_layout.handle(),
            )?),
        ];

        log::info!(
            "Renderer ready: {} textures bound, {} systems",
            textures.len(),
            systems.len()
        );

        Ok(Self {
            systems,
            global_sets,
            written_texture_counts: vec![textures.len(); MAX_FRAMES_IN_FLIGHT],
            global_pool,
            global_set_layout,
            ubo_buffers,
            bone_buffers,
            bones,
            ambient_light_color: config.ambient_light_color,
            frame_loop,
            device,
        })
    }

    fn refresh_textures(&mut self, frame: usize, textures: &Textures) -> EngineResult<()> {
        if self.written_texture_counts[frame] == textures.len() {
            return Ok(());
        }
        let image_infos = texture_image_infos(textures);
        DescriptorWriter::new(&self.global_set_layout)
            .write_images(TEXTURES_BINDING, &image_infos)
            .write_images(SAMPLERS_BINDING, &image_infos)
            .overwrite(self.global_sets[frame])?;
        log::debug!(
            "Frame {frame}: texture table {} -> {} entries",
            self.written_texture_counts[frame],
            textures.len()
        );
        self.written_texture_counts[frame] = textures.len();
        Ok(())
    }

    /// Record and present one frame.
    ///
    /// `overlay` records into the open render pass after the systems. Returns
    /// `Ok(false)` when no frame was drawn because the swap chain was rebuilt.
    #[allow(clippy::too_many_arguments)]
    pub fn render<F>(
        &mut self,
        surface: &mut impl SurfaceSource,
        frame_time: f32,
        scene: &Scene,
        camera: &Camera,
        textures: &Textures,
        models: &Models,
        overlay: F,
    ) -> EngineResult<bool>
    where
        F: FnOnce(vk::CommandBuffer, vk::Extent2D) -> EngineResult<()>,
    {
        let Some(command_buffer) = self.frame_loop.begin_frame(surface)? else {
            return Ok(false);
        };
        let frame_index = self.frame_loop.frame_index()?;
        self.refresh_textures(frame_index, textures)?;

        let frame = FrameInfo {
            frame_index,
            frame_time,
            command_buffer,
            camera,
            global_descriptor_set: self.global_sets[frame_index],
            scene,
        };

        let mut ubo = GlobalUbo {
            projection: camera.projection(),
            view: camera.view(),
            inverse_view: camera.inverse_view(),
            ambient_light_color: self.ambient_light_color,
            ..Default::default()
        };
        for system in &mut self.systems {
            system.update(&frame, &mut ubo);
        }

        let ubo_buffer = &mut self.ubo_buffers[frame_index];
        ubo_buffer.write_object(&ubo)?;
        ubo_buffer.flush(vk::WHOLE_SIZE, 0)?;
        let bone_buffer = &mut self.bone_buffers[frame_index];
        bone_buffer.write_to_buffer(self.bones.as_bytes(), 0)?;
        bone_buffer.flush(vk::WHOLE_SIZE, 0)?;

        self.frame_loop.begin_render_pass(command_buffer)?;
        for system in &self.systems {
            system.render(&frame, models, textures.len())?;
        }
        overlay(command_buffer, self.extent())?;
        self.frame_loop.end_render_pass(command_buffer)?;
        self.frame_loop.end_frame(surface)?;
        Ok(true)
    }

    pub fn set_wireframe(&mut self, enabled: bool) {
        for system in &mut self.systems {
            if let Some(simple) = system.as_simple_mut() {
                simple.set_wireframe(enabled);
            }
        }
    }

    pub fn bones_mut(&mut self) -> &mut BonesUbo {
        &mut self.bones
    }

    pub fn set_ambient_light(&mut self, color: Vec4) {
        self.ambient_light_color = color;
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.frame_loop.aspect_ratio()
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.frame_loop.presenter().swapchain().extent()
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.frame_loop.presenter().render_pass()
    }

    pub fn global_set_layout(&self) -> vk::DescriptorSetLayout {
        self.global_set_layout.handle()
    }

    pub fn frame_index(&self) -> EngineResult<usize> {
        self.frame_loop.frame_index()
    }

    pub fn is_frame_in_progress(&self) -> bool {
        self.frame_loop.is_frame_in_progress()
    }

    pub fn global_pool(&self) -> &DescriptorPool {
        &self.global_pool
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle on renderer drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ubo_layout_matches_shader() {
        assert_eq!(std::mem::size_of::<PointLightUbo>(), 32);
        assert_eq!(std::mem::size_of::<GlobalUbo>(), 544);
        assert_eq!(std::mem::size_of::<BonesUbo>(), MAX_BONES * 64);
        assert_eq!(BonesUbo::default().as_bytes().len(), MAX_BONES * 64);
    }

    #[test]
    fn test_texture_slots_pad_with_first_texture() {
        let slots = texture_slot_indices(3, 6);
        assert_eq!(slots, vec![0, 1, 2, 0, 0, 0]);
        assert_eq!(texture_slot_indices(0, 2), vec![0, 0]);
        assert_eq!(texture_slot_indices(4, 4), vec![0, 1, 2, 3]);
    }

    fn shader_bindings(source: &str) -> Vec<(u32, vk::DescriptorType, u32)> {
        use naga::{ArraySize, TypeInner};

        let module = naga::front::wgsl::parse_str(source).unwrap();
        let kind = |inner: &TypeInner| match inner {
            TypeInner::Image { .. } => vk::DescriptorType::SAMPLED_IMAGE,
            TypeInner::Sampler { .. } => vk::DescriptorType::SAMPLER,
            _ => vk::DescriptorType::UNIFORM_BUFFER,
        };
        let mut bindings: Vec<_> = module
            .global_variables
            .iter()
            .filter_map(|(_, var)| {
                let binding = var.binding.as_ref()?;
                assert_eq!(binding.group, 0);
                let (ty, count) = match &module.types[var.ty].inner {
                    TypeInner::BindingArray { base, size } => {
                        let count = match size {
                            ArraySize::Constant(n) => n.get(),
                            other => panic!("unsized binding array: {other:?}"),
                        };
                        (kind(&module.types[*base].inner), count)
                    }
                    inner => (kind(inner), 1),
                };
                Some((binding.binding, ty, count))
            })
            .collect();
        bindings.sort_by_key(|b| b.0);
        bindings
    }

    #[rstest::rstest]
    #[case::lit_meshes(include_str!("shaders/simple_shader.wgsl"))]
    #[case::light_billboards(include_str!("shaders/point_light.wgsl"))]
    fn test_shader_bindings_match_global_layout(#[case] source: &str) {
        let layout = global_bindings();
        let bindings = shader_bindings(source);

        let mut seen: Vec<_> = bindings.iter().map(|b| b.0).collect();
        seen.dedup();
        assert_eq!(seen.len(), bindings.len(), "two globals share a binding");
        for (binding, ty, count) in bindings {
            let entry = layout.iter().find(|e| e.0 == binding).unwrap();
            assert_eq!((entry.1, entry.3), (ty, count), "binding {binding}");
        }
    }

    #[test]
    fn test_default_ubo_has_no_lights() {
        let ubo = GlobalUbo::default();
        assert_eq!(ubo.num_lights, 0);
        assert_eq!(ubo.projection, Mat4::IDENTITY);
    }
}

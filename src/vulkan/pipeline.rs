//! Graphics pipelines built from WGSL sources.
//!
//! Shaders are compiled at pipeline creation: naga parses and validates the
//! WGSL and writes SPIR-V, which is then wrapped in a `vk::ShaderModule`.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;

use super::device::Device;
use crate::error::{EngineError, EngineResult};

const VERTEX_ENTRY: &CStr = c"vs_main";
const FRAGMENT_ENTRY: &CStr = c"fs_main";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    fn entry_point(self) -> &'static CStr {
        match self {
            ShaderStage::Vertex => VERTEX_ENTRY,
            ShaderStage::Fragment => FRAGMENT_ENTRY,
        }
    }

    fn naga(self) -> naga::ShaderStage {
        match self {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
        }
    }

    fn vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// Compile WGSL to SPIR-V words for the stage's entry point.
pub fn compile_wgsl(source: &str, stage: ShaderStage) -> EngineResult<Vec<u32>> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| EngineError::ShaderCompilation(format!("WGSL parse error: {e}")))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|e| EngineError::ShaderCompilation(format!("Validation error: {e:?}")))?;

    let entry_point = stage
        .entry_point()
        .to_str()
        .map_err(|e| EngineError::ShaderCompilation(e.to_string()))?;
    if !module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry_point && ep.stage == stage.naga())
    {
        return Err(EngineError::ShaderCompilation(format!(
            "Entry point '{entry_point}' not found for stage {stage:?}"
        )));
    }

    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        flags: naga::back::spv::WriterFlags::empty(),
        capabilities: None,
        bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
        binding_map: Default::default(),
        debug_info: None,
        zero_initialize_workgroup_memory: naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: stage.naga(),
        entry_point: entry_point.to_string(),
    };

    naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| EngineError::ShaderCompilation(format!("SPIR-V generation error: {e}")))
}

fn create_shader_module(device: &Device, code: &[u32]) -> EngineResult<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);
    unsafe { device.logical().create_shader_module(&create_info, None) }
        .map_err(EngineError::vk("create shader module"))
}

/// Fixed-function state for a graphics pipeline.
#[derive(Clone)]
pub struct PipelineConfig {
    pub binding_descriptions: Vec<vk::VertexInputBindingDescription>,
    pub attribute_descriptions: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
    pub color_blend_attachment: vk::PipelineColorBlendAttachmentState,
    pub dynamic_states: Vec<vk::DynamicState>,
    pub pipeline_layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub flags: vk::PipelineCreateFlags,
    pub base_pipeline: vk::Pipeline,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            binding_descriptions: Vec::new(),
            attribute_descriptions: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare_op: vk::CompareOp::LESS,
            color_blend_attachment: vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(false)
                .src_color_blend_factor(vk::BlendFactor::ONE)
                .dst_color_blend_factor(vk::BlendFactor::ZERO)
                .color_blend_op(vk::BlendOp::ADD)
                .src_alpha_blend_factor(vk::BlendFactor::ONE)
                .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                .alpha_blend_op(vk::BlendOp::ADD),
            dynamic_states: vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            pipeline_layout: vk::PipelineLayout::null(),
            render_pass: vk::RenderPass::null(),
            subpass: 0,
            flags: vk::PipelineCreateFlags::empty(),
            base_pipeline: vk::Pipeline::null(),
        }
    }
}

impl PipelineConfig {
    /// Standard alpha blending over the framebuffer.
    pub fn enable_alpha_blending(&mut self) {
        self.color_blend_attachment = self
            .color_blend_attachment
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD);
    }

    /// Turn this config into a derivative of `base`.
    pub fn derive_from(&mut self, base: vk::Pipeline) {
        self.flags = (self.flags & !vk::PipelineCreateFlags::ALLOW_DERIVATIVES)
            | vk::PipelineCreateFlags::DERIVATIVE;
        self.base_pipeline = base;
    }
}

pub struct Pipeline {
    device: Arc<Device>,
    pipeline: vk::Pipeline,
}

impl Pipeline {
    pub fn new(
        device: Arc<Device>,
        vertex_source: &str,
        fragment_source: &str,
        config: &PipelineConfig,
    ) -> EngineResult<Self> {
        if config.pipeline_layout == vk::PipelineLayout::null() {
            return Err(EngineError::MissingDescriptorSetLayout);
        }
        if config.render_pass == vk::RenderPass::null() {
            return Err(EngineError::Initialization(
                "Cannot create graphics pipeline: no render pass provided in config".into(),
            ));
        }

        let vertex_code = compile_wgsl(vertex_source, ShaderStage::Vertex)?;
        let fragment_code = compile_wgsl(fragment_source, ShaderStage::Fragment)?;
        let vertex_module = create_shader_module(&device, &vertex_code)?;
        let fragment_module = match create_shader_module(&device, &fragment_code) {
            Ok(module) => module,
            Err(e) => {
                unsafe { device.logical().destroy_shader_module(vertex_module, None) };
                return Err(e);
            }
        };

        let result = Self::create_pipeline(&device, vertex_module, fragment_module, config);
        unsafe {
            device.logical().destroy_shader_module(vertex_module, None);
            device.logical().destroy_shader_module(fragment_module, None);
        }
        let pipeline = result?;

        log::info!("Created graphics pipeline ({:?})", config.polygon_mode);
        Ok(Self { device, pipeline })
    }

    fn create_pipeline(
        device: &Device,
        vertex_module: vk::ShaderModule,
        fragment_module: vk::ShaderModule,
        config: &PipelineConfig,
    ) -> EngineResult<vk::Pipeline> {
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(ShaderStage::Vertex.vk())
                .module(vertex_module)
                .name(ShaderStage::Vertex.entry_point()),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(ShaderStage::Fragment.vk())
                .module(fragment_module)
                .name(ShaderStage::Fragment.entry_point()),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&config.binding_descriptions)
            .vertex_attribute_descriptions(&config.attribute_descriptions);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(config.topology)
            .primitive_restart_enable(false);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(config.polygon_mode)
            .line_width(1.0)
            .cull_mode(config.cull_mode)
            .front_face(config.front_face)
            .depth_bias_enable(false);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false)
            .min_sample_shading(1.0);
        let blend_attachments = [config.color_blend_attachment];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&blend_attachments);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(config.depth_test)
            .depth_write_enable(config.depth_write)
            .depth_compare_op(config.depth_compare_op)
            .depth_bounds_test_enable(false)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
            .stencil_test_enable(false);
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&config.dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .flags(config.flags)
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .depth_stencil_state(&depth_stencil)
            .dynamic_state(&dynamic_state)
            .layout(config.pipeline_layout)
            .render_pass(config.render_pass)
            .subpass(config.subpass)
            .base_pipeline_handle(config.base_pipeline)
            .base_pipeline_index(-1);

        let pipelines = unsafe {
            device.logical().create_graphics_pipelines(
                vk::PipelineCache::null(),
                &[pipeline_info],
                None,
            )
        }
        .map_err(|(_, e)| EngineError::vk("create graphics pipeline")(e))?;
        Ok(pipelines[0])
    }

    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device.logical().cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline,
            )
        };
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe { self.device.logical().destroy_pipeline(self.pipeline, None) };
    }
}

/// Owned `vk::PipelineLayout` with the device that created it.
pub struct PipelineLayout {
    device: Arc<Device>,
    layout: vk::PipelineLayout,
}

impl PipelineLayout {
    pub fn new(
        device: Arc<Device>,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> EngineResult<Self> {
        if set_layouts.iter().any(|layout| *layout == vk::DescriptorSetLayout::null()) {
            return Err(EngineError::MissingDescriptorSetLayout);
        }
        let push_size = push_constant_ranges
            .iter()
            .map(|range| range.offset + range.size)
            .max()
            .unwrap_or(0);
        let limit = device.properties().limits.max_push_constants_size;
        if push_size > limit {
            return Err(EngineError::Initialization(format!(
                "Push constants need {push_size} bytes, device allows {limit}"
            )));
        }

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        let layout = unsafe { device.logical().create_pipeline_layout(&layout_info, None) }
            .map_err(EngineError::vk("create pipeline layout"))?;
        Ok(Self { device, layout })
    }

    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe { self.device.logical().destroy_pipeline_layout(self.layout, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(include_str!("../shaders/simple_shader.wgsl"), ShaderStage::Vertex)]
    #[case(include_str!("../shaders/simple_shader.wgsl"), ShaderStage::Fragment)]
    #[case(include_str!("../shaders/point_light.wgsl"), ShaderStage::Vertex)]
    #[case(include_str!("../shaders/point_light.wgsl"), ShaderStage::Fragment)]
    fn test_builtin_shaders_compile(#[case] source: &str, #[case] stage: ShaderStage) {
        let words = compile_wgsl(source, stage).unwrap();
        // SPIR-V magic number
        assert_eq!(words[0], 0x0723_0203);
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = compile_wgsl("fn broken( {", ShaderStage::Vertex).unwrap_err();
        assert!(matches!(err, EngineError::ShaderCompilation(_)));
    }

    #[test]
    fn test_missing_entry_point() {
        let source = "@fragment fn fs_main() -> @location(0) vec4<f32> { return vec4<f32>(1.0); }";
        let err = compile_wgsl(source, ShaderStage::Vertex).unwrap_err();
        assert!(err.to_string().contains("vs_main"));
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.depth_compare_op, vk::CompareOp::LESS);
        assert!(config.depth_test && config.depth_write);
        assert_eq!(config.cull_mode, vk::CullModeFlags::NONE);
        assert_eq!(config.color_blend_attachment.blend_enable, vk::FALSE);
        assert_eq!(
            config.dynamic_states,
            vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR]
        );
    }

    #[test]
    fn test_derivative_flags() {
        let mut config = PipelineConfig {
            flags: vk::PipelineCreateFlags::ALLOW_DERIVATIVES,
            ..Default::default()
        };
        config.derive_from(vk::Pipeline::null());
        assert!(config.flags.contains(vk::PipelineCreateFlags::DERIVATIVE));
        assert!(!config.flags.contains(vk::PipelineCreateFlags::ALLOW_DERIVATIVES));

        config.enable_alpha_blending();
        assert_eq!(config.color_blend_attachment.blend_enable, vk::TRUE);
    }
}

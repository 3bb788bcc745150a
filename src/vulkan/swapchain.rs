//! Swap chain images, depth buffer, render pass, framebuffers and per-frame sync.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;

use super::device::Device;
use crate::error::{EngineError, EngineResult};
use crate::frame::MAX_FRAMES_IN_FLIGHT;

/// Color and depth formats of a swap chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainFormats {
    pub color: vk::Format,
    pub depth: vk::Format,
}

impl SwapchainFormats {
    /// A rebuilt swap chain must keep both formats, pipelines are baked against them.
    pub fn ensure_matches(&self, new: &SwapchainFormats) -> EngineResult<()> {
        if self != new {
            return Err(EngineError::SwapchainFormatChanged {
                old: (self.color, self.depth),
                new: (new.color, new.depth),
            });
        }
        Ok(())
    }
}

/// Outcome of acquiring the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

/// Outcome of submitting and presenting a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentResult {
    Presented,
    NeedsRecreate,
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if !vsync && modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: window.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// `min + 1`, bounded by the surface maximum, and never fewer than the frames in flight.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = (capabilities.min_image_count + 1).max(MAX_FRAMES_IN_FLIGHT as u32);
    if capabilities.max_image_count > 0 {
        count = count.min(capabilities.max_image_count);
    }
    count
}

/// Create `count` handles. If one fails, the ones already made are destroyed
/// before the error is returned.
fn create_all<T, E>(
    count: usize,
    mut create: impl FnMut() -> Result<T, E>,
    mut destroy: impl FnMut(T),
) -> Result<Vec<T>, E> {
    let mut created = Vec::with_capacity(count);
    for _ in 0..count {
        match create() {
            Ok(handle) => created.push(handle),
            Err(e) => {
                created.into_iter().for_each(&mut destroy);
                return Err(e);
            }
        }
    }
    Ok(created)
}

struct DepthResources {
    image: vk::Image,
    allocation: Option<Allocation>,
    view: vk::ImageView,
}

pub struct Swapchain {
    device: Arc<Device>,
    swapchain: vk::SwapchainKHR,
    formats: SwapchainFormats,
    extent: vk::Extent2D,
    image_views: Vec<vk::ImageView>,
    depth: Vec<DepthResources>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,

    image_available: Vec<vk::Semaphore>,
    render_finished: Vec<vk::Semaphore>,
    in_flight: Vec<vk::Fence>,
    images_in_flight: Vec<vk::Fence>,
}

impl Swapchain {
    pub fn new(
        device: Arc<Device>,
        window_extent: vk::Extent2D,
        old: Option<&Swapchain>,
        vsync: bool,
    ) -> EngineResult<Self> {
        let support = device.swapchain_support()?;
        let surface_format = choose_surface_format(&support.formats)
            .ok_or_else(|| EngineError::Initialization("Surface reports no formats".into()))?;
        let present_mode = choose_present_mode(&support.present_modes, vsync);
        let extent = choose_extent(&support.capabilities, window_extent);
        let image_count = choose_image_count(&support.capabilities);

        // Queried up front so nothing needs unwinding if it fails.
        let depth_format = device.find_depth_format()?;

        let families = device.queue_families();
        let family_indices = [families.graphics, families.present];
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(device.surface())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.map_or(vk::SwapchainKHR::null(), |s| s.swapchain));
        create_info = if families.is_shared() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        };

        let swapchain = unsafe { device.swapchain_fn().create_swapchain(&create_info, None) }
            .map_err(EngineError::vk("create swap chain"))?;

        // From here on, Drop releases whatever has been created so far.
        let mut this = Self {
            device: device.clone(),
            swapchain,
            formats: SwapchainFormats {
                color: surface_format.format,
                depth: depth_format,
            },
            extent,
            image_views: Vec::new(),
            depth: Vec::new(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            image_available: Vec::new(),
            render_finished: Vec::new(),
            in_flight: Vec::new(),
            images_in_flight: Vec::new(),
        };

        this.create_image_views()?;
        this.create_render_pass()?;
        this.create_depth_resources()?;
        this.create_framebuffers()?;
        this.create_sync_objects()?;

        log::info!(
            "Created swap chain {}x{} with {} images ({:?}, {:?})",
            extent.width,
            extent.height,
            this.image_views.len(),
            present_mode,
            this.formats.color
        );
        Ok(this)
    }

    fn create_image_views(&mut self) -> EngineResult<()> {
        let images = unsafe { self.device.swapchain_fn().get_swapchain_images(self.swapchain) }
            .map_err(EngineError::vk("get swap chain images"))?;

        for image in images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.formats.color)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            let view = unsafe { self.device.logical().create_image_view(&view_info, None) }
                .map_err(EngineError::vk("create swap chain image view"))?;
            self.image_views.push(view);
        }
        self.images_in_flight = vec![vk::Fence::null(); self.image_views.len()];
        Ok(())
    }

    fn create_render_pass(&mut self) -> EngineResult<()> {
        let attachments = [
            vk::AttachmentDescription::default()
                .format(self.formats.color)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
            vk::AttachmentDescription::default()
                .format(self.formats.depth)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        ];

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };
        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref)];

        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let dependencies = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .dst_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )];

        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        self.render_pass = unsafe { self.device.logical().create_render_pass(&render_pass_info, None) }
            .map_err(EngineError::vk("create render pass"))?;
        Ok(())
    }

    fn create_depth_resources(&mut self) -> EngineResult<()> {
        for _ in 0..self.image_views.len() {
            let image_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .extent(vk::Extent3D {
                    width: self.extent.width,
                    height: self.extent.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .format(self.formats.depth)
                .tiling(vk::ImageTiling::OPTIMAL)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
                .samples(vk::SampleCountFlags::TYPE_1)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            let (image, allocation) =
                self.device
                    .create_image(&image_info, MemoryLocation::GpuOnly, "depth image")?;

            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.formats.depth)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::DEPTH)
                        .level_count(1)
                        .layer_count(1),
                );
            let view = unsafe { self.device.logical().create_image_view(&view_info, None) };
            let view = match view {
                Ok(view) => view,
                Err(e) => {
                    unsafe { self.device.logical().destroy_image(image, None) };
                    self.device.free_allocation(allocation);
                    return Err(EngineError::vk("create depth image view")(e));
                }
            };

            self.depth.push(DepthResources {
                image,
                allocation: Some(allocation),
                view,
            });
        }
        Ok(())
    }

    fn create_framebuffers(&mut self) -> EngineResult<()> {
        for (color, depth) in self.image_views.iter().zip(&self.depth) {
            let attachments = [*color, depth.view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            let framebuffer =
                unsafe { self.device.logical().create_framebuffer(&framebuffer_info, None) }
                    .map_err(EngineError::vk("create framebuffer"))?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    fn create_sync_objects(&mut self) -> EngineResult<()> {
        let device = self.device.logical();
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        let create_semaphore = || unsafe { device.create_semaphore(&semaphore_info, None) };
        let destroy_semaphore = |semaphore: vk::Semaphore| unsafe { device.destroy_semaphore(semaphore, None) };
        self.image_available = create_all(MAX_FRAMES_IN_FLIGHT, create_semaphore, destroy_semaphore)
            .map_err(EngineError::vk("create image-available semaphore"))?;
        self.render_finished = create_all(MAX_FRAMES_IN_FLIGHT, create_semaphore, destroy_semaphore)
            .map_err(EngineError::vk("create render-finished semaphore"))?;
        self.in_flight = create_all(
            MAX_FRAMES_IN_FLIGHT,
            || unsafe { device.create_fence(&fence_info, None) },
            |fence| unsafe { device.destroy_fence(fence, None) },
        )
        .map_err(EngineError::vk("create in-flight fence"))?;
        Ok(())
    }

    /// Wait for `frame`'s fence, then acquire the next image.
    pub fn acquire_next_image(&self, frame: usize) -> EngineResult<AcquireResult> {
        unsafe {
            self.device
                .logical()
                .wait_for_fences(&[self.in_flight[frame]], true, u64::MAX)
                .map_err(EngineError::vk("wait for in-flight fence"))?;

            match self.device.swapchain_fn().acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.image_available[frame],
                vk::Fence::null(),
            ) {
                Ok((index, suboptimal)) => Ok(AcquireResult::Acquired { index, suboptimal }),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
                Err(e) => Err(EngineError::vk("acquire swap chain image")(e)),
            }
        }
    }

    /// Submit `command_buffer` for `image` and present it.
    pub fn submit_command_buffer(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image: u32,
        frame: usize,
    ) -> EngineResult<PresentResult> {
        let device = self.device.logical();
        let image_fence = self.images_in_flight[image as usize];
        unsafe {
            if image_fence != vk::Fence::null() {
                device
                    .wait_for_fences(&[image_fence], true, u64::MAX)
                    .map_err(EngineError::vk("wait for image fence"))?;
            }
            self.images_in_flight[image as usize] = self.in_flight[frame];

            let wait_semaphores = [self.image_available[frame]];
            let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let signal_semaphores = [self.render_finished[frame]];
            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::default()
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores);

            device
                .reset_fences(&[self.in_flight[frame]])
                .map_err(EngineError::vk("reset in-flight fence"))?;
            device
                .queue_submit(
                    self.device.graphics_queue(),
                    &[submit_info],
                    self.in_flight[frame],
                )
                .map_err(EngineError::vk("submit draw command buffer"))?;

            let swapchains = [self.swapchain];
            let image_indices = [image];
            let present_info = vk::PresentInfoKHR::default()
                .wait_semaphores(&signal_semaphores)
                .swapchains(&swapchains)
                .image_indices(&image_indices);

            match self
                .device
                .swapchain_fn()
                .queue_present(self.device.present_queue(), &present_info)
            {
                Ok(false) => Ok(PresentResult::Presented),
                Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentResult::NeedsRecreate),
                Err(e) => Err(EngineError::vk("present swap chain image")(e)),
            }
        }
    }

    pub fn formats(&self) -> SwapchainFormats {
        self.formats
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height as f32
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffer(&self, index: u32) -> vk::Framebuffer {
        self.framebuffers[index as usize]
    }

    pub fn image_count(&self) -> usize {
        self.image_views.len()
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let device = self.device.logical();
        unsafe {
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            self.device.swapchain_fn().destroy_swapchain(self.swapchain, None);

            for depth in &mut self.depth {
                device.destroy_image_view(depth.view, None);
                device.destroy_image(depth.image, None);
                if let Some(allocation) = depth.allocation.take() {
                    self.device.free_allocation(allocation);
                }
            }
            for &framebuffer in &self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            device.destroy_render_pass(self.render_pass, None);

            for &semaphore in self.image_available.iter().chain(&self.render_finished) {
                device.destroy_semaphore(semaphore, None);
            }
            for &fence in &self.in_flight {
                device.destroy_fence(fence, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn capabilities(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[rstest]
    #[case(2, 0, 3)]
    #[case(2, 3, 3)]
    #[case(3, 3, 3)]
    #[case(1, 0, 2)]
    fn test_image_count(#[case] min: u32, #[case] max: u32, #[case] expected: u32) {
        assert_eq!(choose_image_count(&capabilities(min, max)), expected);
    }

    #[test]
    fn test_extent_clamped_when_surface_is_flexible() {
        let extent = choose_extent(
            &capabilities(2, 0),
            vk::Extent2D {
                width: 8000,
                height: 600,
            },
        );
        assert_eq!((extent.width, extent.height), (4096, 600));
    }

    #[test]
    fn test_extent_follows_surface_when_fixed() {
        let mut caps = capabilities(2, 0);
        caps.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let extent = choose_extent(&caps, vk::Extent2D { width: 1, height: 1 });
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn test_present_mode() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_surface_format_prefers_srgb() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[unorm, srgb]), Some(srgb));
        assert_eq!(choose_surface_format(&[unorm]), Some(unorm));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn test_format_change_is_rejected() {
        let old = SwapchainFormats {
            color: vk::Format::B8G8R8A8_SRGB,
            depth: vk::Format::D32_SFLOAT,
        };
        assert!(old.ensure_matches(&old).is_ok());

        let new = SwapchainFormats {
            depth: vk::Format::D24_UNORM_S8_UINT,
            ..old
        };
        assert!(matches!(
            old.ensure_matches(&new),
            Err(EngineError::SwapchainFormatChanged { .. })
        ));
    }

    #[rstest]
    #[case::first_fails(0)]
    #[case::last_fails(1)]
    fn test_partial_creation_is_unwound(#[case] failing: usize) {
        let mut made = 0;
        let mut destroyed = Vec::new();
        let result = create_all(
            MAX_FRAMES_IN_FLIGHT,
            || {
                if made == failing {
                    return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
                }
                made += 1;
                Ok(made)
            },
            |handle| destroyed.push(handle),
        );

        assert_eq!(result, Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert_eq!(destroyed, (1..=failing).collect::<Vec<_>>());
    }

    #[test]
    fn test_full_creation_destroys_nothing() {
        let mut destroyed = 0;
        let handles = create_all(3, || Ok::<_, vk::Result>(7u64), |_| destroyed += 1).unwrap();
        assert_eq!(handles, vec![7, 7, 7]);
        assert_eq!(destroyed, 0);
    }
}

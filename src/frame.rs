//! Frame lifecycle: acquire, record, submit, present and swap chain recreation.
//!
//! [`FrameLoop`] owns the state machine and is generic over a [`Presenter`] so
//! that the rules below hold no matter what does the actual GPU work:
//!
//! - a frame is begun at most once before it is ended,
//! - the swap chain render pass is begun at most once per frame, always on
//!   the frame's own command buffer, and is closed before the frame ends,
//! - the frame index advances after every ended frame, presented or not,
//! - recreation waits out a zero-area surface before touching the swap chain.

use std::sync::Arc;

use ash::vk;

use crate::error::{EngineError, EngineResult};
use crate::vulkan::swapchain::Swapchain;
use crate::vulkan::Device;

pub use crate::vulkan::swapchain::{AcquireResult, PresentResult};

pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

pub const CLEAR_COLOR: [f32; 4] = [0.01, 0.01, 0.01, 1.0];

/// Where the drawable size comes from.
pub trait SurfaceSource {
    fn framebuffer_extent(&self) -> vk::Extent2D;
    /// Block until at least one window event arrives.
    fn wait_events(&mut self);
    /// Report and clear the "framebuffer resized" flag.
    fn take_resized(&mut self) -> bool;
}

/// GPU side of the frame loop.
pub trait Presenter {
    fn extent(&self) -> vk::Extent2D;
    fn acquire(&mut self, frame: usize) -> EngineResult<AcquireResult>;
    /// Reset and begin recording the command buffer for `frame`.
    fn begin_commands(&mut self, frame: usize) -> EngineResult<vk::CommandBuffer>;
    /// End recording, submit and present.
    fn submit_and_present(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image: u32,
        frame: usize,
    ) -> EngineResult<PresentResult>;
    fn recreate(&mut self, extent: vk::Extent2D) -> EngineResult<()>;
    fn begin_render_pass(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image: u32,
        viewport: vk::Viewport,
        scissor: vk::Rect2D,
    );
    fn end_render_pass(&mut self, command_buffer: vk::CommandBuffer);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    Acquiring,
    Recording {
        image: u32,
        command_buffer: vk::CommandBuffer,
        render_pass_open: bool,
    },
}

pub struct FrameLoop<P: Presenter> {
    presenter: P,
    state: FrameState,
    frame_index: usize,
}

impl<P: Presenter> FrameLoop<P> {
    pub fn new(presenter: P) -> Self {
        Self {
            presenter,
            state: FrameState::Idle,
            frame_index: 0,
        }
    }

    /// Start a frame. `Ok(None)` means the swap chain was out of date and has been rebuilt.
    pub fn begin_frame(
        &mut self,
        surface: &mut impl SurfaceSource,
    ) -> EngineResult<Option<vk::CommandBuffer>> {
        if self.state != FrameState::Idle {
            return Err(EngineError::FrameAlreadyInProgress);
        }

        self.state = FrameState::Acquiring;
        let acquired = self.presenter.acquire(self.frame_index);
        let image = match acquired {
            Ok(AcquireResult::Acquired { index, .. }) => index,
            Ok(AcquireResult::OutOfDate) => {
                self.state = FrameState::Idle;
                log::warn!("Swap chain out of date on acquire, recreating");
                self.recreate(surface)?;
                return Ok(None);
            }
            Err(e) => {
                self.state = FrameState::Idle;
                return Err(e);
            }
        };

        let command_buffer = match self.presenter.begin_commands(self.frame_index) {
            Ok(cmd) => cmd,
            Err(e) => {
                self.state = FrameState::Idle;
                return Err(e);
            }
        };

        self.state = FrameState::Recording {
            image,
            command_buffer,
            render_pass_open: false,
        };
        Ok(Some(command_buffer))
    }

    pub fn end_frame(&mut self, surface: &mut impl SurfaceSource) -> EngineResult<()> {
        let FrameState::Recording {
            image,
            command_buffer,
            render_pass_open,
        } = self.state
        else {
            return Err(EngineError::FrameNotInProgress);
        };
        if render_pass_open {
            return Err(EngineError::RenderPassStillOpen);
        }

        self.state = FrameState::Idle;
        let frame = self.frame_index;
        self.frame_index = (self.frame_index + 1) % MAX_FRAMES_IN_FLIGHT;

        let presented = self
            .presenter
            .submit_and_present(command_buffer, image, frame)?;
        let resized = surface.take_resized();
        if presented == PresentResult::NeedsRecreate || resized {
            self.recreate(surface)?;
        }
        Ok(())
    }

    /// Rebuild the swap chain for the current surface size, waiting while it is zero-area.
    pub fn recreate(&mut self, surface: &mut impl SurfaceSource) -> EngineResult<()> {
        let mut extent = surface.framebuffer_extent();
        while extent.width == 0 || extent.height == 0 {
            surface.wait_events();
            extent = surface.framebuffer_extent();
        }
        self.presenter.recreate(extent)
    }

    /// Begin the swap chain render pass on the frame's command buffer.
    ///
    /// Viewport and scissor cover the full extent and are set on every call.
    pub fn begin_render_pass(&mut self, command_buffer: vk::CommandBuffer) -> EngineResult<vk::Viewport> {
        let FrameState::Recording {
            image,
            command_buffer: current,
            render_pass_open,
        } = &mut self.state
        else {
            return Err(EngineError::FrameNotInProgress);
        };
        if *current != command_buffer {
            return Err(EngineError::ForeignCommandBuffer);
        }
        if *render_pass_open {
            return Err(EngineError::RenderPassAlreadyBegun);
        }
        *render_pass_open = true;
        let image = *image;

        let extent = self.presenter.extent();
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        self.presenter
            .begin_render_pass(command_buffer, image, viewport, scissor);
        Ok(viewport)
    }

    pub fn end_render_pass(&mut self, command_buffer: vk::CommandBuffer) -> EngineResult<()> {
        let FrameState::Recording {
            command_buffer: current,
            render_pass_open,
            ..
        } = &mut self.state
        else {
            return Err(EngineError::FrameNotInProgress);
        };
        if *current != command_buffer {
            return Err(EngineError::ForeignCommandBuffer);
        }
        if !*render_pass_open {
            return Err(EngineError::RenderPassNotBegun);
        }
        *render_pass_open = false;
        self.presenter.end_render_pass(command_buffer);
        Ok(())
    }

    pub fn frame_index(&self) -> EngineResult<usize> {
        match self.state {
            FrameState::Recording { .. } => Ok(self.frame_index),
            _ => Err(EngineError::FrameNotInProgress),
        }
    }

    pub fn current_command_buffer(&self) -> EngineResult<vk::CommandBuffer> {
        match self.state {
            FrameState::Recording { command_buffer, .. } => Ok(command_buffer),
            _ => Err(EngineError::FrameNotInProgress),
        }
    }

    pub fn is_frame_in_progress(&self) -> bool {
        matches!(self.state, FrameState::Recording { .. })
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn aspect_ratio(&self) -> f32 {
        let extent = self.presenter.extent();
        extent.width as f32 / extent.height.max(1) as f32
    }

    pub fn presenter(&self) -> &P {
        &self.presenter
    }
}

/// Vulkan [`Presenter`]: a swap chain plus one command buffer per frame in flight.
pub struct SwapchainPresenter {
    device: Arc<Device>,
    swapchain: Swapchain,
    command_buffers: Vec<vk::CommandBuffer>,
    vsync: bool,
}

impl SwapchainPresenter {
    pub fn new(device: Arc<Device>, extent: vk::Extent2D, vsync: bool) -> EngineResult<Self> {
        let swapchain = Swapchain::new(device.clone(), extent, None, vsync)?;

        let command_buffers = device
            .with_command_pool(|pool| {
                let alloc_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(MAX_FRAMES_IN_FLIGHT as u32);
                unsafe { device.logical().allocate_command_buffers(&alloc_info) }
            })
            .map_err(EngineError::vk("allocate frame command buffers"))?;

        Ok(Self {
            device,
            swapchain,
            command_buffers,
            vsync,
        })
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.swapchain.render_pass()
    }
}

impl Presenter for SwapchainPresenter {
    fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    fn acquire(&mut self, frame: usize) -> EngineResult<AcquireResult> {
        self.swapchain.acquire_next_image(frame)
    }

    fn begin_commands(&mut self, frame: usize) -> EngineResult<vk::CommandBuffer> {
        let command_buffer = self.command_buffers[frame];
        let device = self.device.logical();
        unsafe {
            device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(EngineError::vk("reset frame command buffer"))?;
            device
                .begin_command_buffer(command_buffer, &vk::CommandBufferBeginInfo::default())
                .map_err(EngineError::vk("begin recording command buffer"))?;
        }
        Ok(command_buffer)
    }

    fn submit_and_present(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image: u32,
        frame: usize,
    ) -> EngineResult<PresentResult> {
        unsafe { self.device.logical().end_command_buffer(command_buffer) }
            .map_err(EngineError::vk("record command buffer"))?;
        self.swapchain.submit_command_buffer(command_buffer, image, frame)
    }

    fn recreate(&mut self, extent: vk::Extent2D) -> EngineResult<()> {
        self.device.wait_idle()?;
        let replacement = Swapchain::new(self.device.clone(), extent, Some(&self.swapchain), self.vsync)?;
        self.swapchain.formats().ensure_matches(&replacement.formats())?;
        // The old swap chain is retired only after the new one exists.
        self.swapchain = replacement;
        Ok(())
    }

    fn begin_render_pass(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image: u32,
        viewport: vk::Viewport,
        scissor: vk::Rect2D,
    ) {
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: CLEAR_COLOR,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.swapchain.render_pass())
            .framebuffer(self.swapchain.framebuffer(image))
            .render_area(scissor)
            .clear_values(&clear_values);

        let device = self.device.logical();
        unsafe {
            device.cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE);
            device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(command_buffer, 0, &[scissor]);
        }
    }

    fn end_render_pass(&mut self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.logical().cmd_end_render_pass(command_buffer) };
    }
}

impl Drop for SwapchainPresenter {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        self.device.with_command_pool(|pool| unsafe {
            self.device
                .logical()
                .free_command_buffers(pool, &self.command_buffers)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use rstest::rstest;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct FakePresenter {
        extent: (u32, u32),
        acquires: VecDeque<AcquireResult>,
        presents: VecDeque<PresentResult>,
        recreated: Vec<(u32, u32)>,
        submitted: Vec<(u32, usize)>,
        render_passes: usize,
        /// Color format the next recreation comes back with
        recreated_color_format: Option<vk::Format>,
    }

    impl Presenter for FakePresenter {
        fn extent(&self) -> vk::Extent2D {
            vk::Extent2D {
                width: self.extent.0,
                height: self.extent.1,
            }
        }

        fn acquire(&mut self, _frame: usize) -> EngineResult<AcquireResult> {
            Ok(self.acquires.pop_front().unwrap_or(AcquireResult::Acquired {
                index: 0,
                suboptimal: false,
            }))
        }

        fn begin_commands(&mut self, frame: usize) -> EngineResult<vk::CommandBuffer> {
            Ok(vk::CommandBuffer::from_raw(100 + frame as u64))
        }

        fn submit_and_present(
            &mut self,
            _command_buffer: vk::CommandBuffer,
            image: u32,
            frame: usize,
        ) -> EngineResult<PresentResult> {
            self.submitted.push((image, frame));
            Ok(self.presents.pop_front().unwrap_or(PresentResult::Presented))
        }

        fn recreate(&mut self, extent: vk::Extent2D) -> EngineResult<()> {
            if let Some(color) = self.recreated_color_format {
                let depth = vk::Format::D32_SFLOAT;
                return Err(EngineError::SwapchainFormatChanged {
                    old: (vk::Format::B8G8R8A8_SRGB, depth),
                    new: (color, depth),
                });
            }
            self.extent = (extent.width, extent.height);
            self.recreated.push(self.extent);
            Ok(())
        }

        fn begin_render_pass(&mut self, _: vk::CommandBuffer, _: u32, _: vk::Viewport, _: vk::Rect2D) {
            self.render_passes += 1;
        }

        fn end_render_pass(&mut self, _: vk::CommandBuffer) {}
    }

    struct FakeSurface {
        extents: VecDeque<(u32, u32)>,
        current: (u32, u32),
        resized: bool,
        waits: usize,
    }

    impl FakeSurface {
        fn new(width: u32, height: u32) -> Self {
            Self {
                extents: VecDeque::new(),
                current: (width, height),
                resized: false,
                waits: 0,
            }
        }
    }

    impl SurfaceSource for FakeSurface {
        fn framebuffer_extent(&self) -> vk::Extent2D {
            vk::Extent2D {
                width: self.current.0,
                height: self.current.1,
            }
        }

        fn wait_events(&mut self) {
            self.waits += 1;
            if let Some(next) = self.extents.pop_front() {
                self.current = next;
            }
        }

        fn take_resized(&mut self) -> bool {
            std::mem::take(&mut self.resized)
        }
    }

    fn frame_loop() -> FrameLoop<FakePresenter> {
        FrameLoop::new(FakePresenter {
            extent: (800, 600),
            ..Default::default()
        })
    }

    #[test]
    fn test_double_begin_is_rejected() {
        let mut frames = frame_loop();
        let mut surface = FakeSurface::new(800, 600);

        assert!(frames.begin_frame(&mut surface).unwrap().is_some());
        assert!(matches!(
            frames.begin_frame(&mut surface),
            Err(EngineError::FrameAlreadyInProgress)
        ));
    }

    #[test]
    fn test_accessors_require_open_frame() {
        let mut frames = frame_loop();
        assert!(matches!(frames.frame_index(), Err(EngineError::FrameNotInProgress)));
        assert!(matches!(
            frames.current_command_buffer(),
            Err(EngineError::FrameNotInProgress)
        ));
        assert!(matches!(
            frames.end_frame(&mut FakeSurface::new(800, 600)),
            Err(EngineError::FrameNotInProgress)
        ));
    }

    #[test]
    fn test_render_pass_rules() {
        let mut frames = frame_loop();
        let mut surface = FakeSurface::new(800, 600);
        let cmd = frames.begin_frame(&mut surface).unwrap().unwrap();

        let foreign = vk::CommandBuffer::from_raw(7);
        assert!(matches!(
            frames.begin_render_pass(foreign),
            Err(EngineError::ForeignCommandBuffer)
        ));
        assert!(matches!(
            frames.end_render_pass(cmd),
            Err(EngineError::RenderPassNotBegun)
        ));

        let viewport = frames.begin_render_pass(cmd).unwrap();
        assert_eq!((viewport.width, viewport.height), (800.0, 600.0));
        assert!(matches!(
            frames.begin_render_pass(cmd),
            Err(EngineError::RenderPassAlreadyBegun)
        ));
        assert!(matches!(
            frames.end_frame(&mut surface),
            Err(EngineError::RenderPassStillOpen)
        ));

        frames.end_render_pass(cmd).unwrap();
        frames.end_frame(&mut surface).unwrap();
        assert_eq!(frames.presenter().render_passes, 1);
    }

    #[test]
    fn test_out_of_date_acquire_recreates() {
        let mut frames = frame_loop();
        frames.presenter.acquires.push_back(AcquireResult::OutOfDate);
        let mut surface = FakeSurface::new(1024, 768);

        assert!(frames.begin_frame(&mut surface).unwrap().is_none());
        assert_eq!(frames.state(), FrameState::Idle);
        assert_eq!(frames.presenter().recreated, vec![(1024, 768)]);
        assert!(frames.begin_frame(&mut surface).unwrap().is_some());
    }

    #[test]
    fn test_frame_index_advances_even_when_recreating() {
        let mut frames = frame_loop();
        frames.presenter.presents.push_back(PresentResult::NeedsRecreate);
        let mut surface = FakeSurface::new(800, 600);

        let mut seen = Vec::new();
        for _ in 0..3 {
            frames.begin_frame(&mut surface).unwrap();
            seen.push(frames.frame_index().unwrap());
            frames.end_frame(&mut surface).unwrap();
        }
        assert_eq!(seen, vec![0, 1, 0]);
        assert_eq!(frames.presenter().recreated.len(), 1);
    }

    #[test]
    fn test_recreate_waits_for_nonzero_extent() {
        let mut frames = frame_loop();
        let mut surface = FakeSurface::new(0, 0);
        surface.extents.extend([(0, 0), (0, 600), (800, 600)]);

        frames.recreate(&mut surface).unwrap();
        assert_eq!(surface.waits, 3);
        assert_eq!(frames.presenter().recreated, vec![(800, 600)]);
        assert_eq!(frames.aspect_ratio(), 800.0 / 600.0);
    }

    #[rstest]
    #[case::on_acquire(true)]
    #[case::after_present(false)]
    fn test_format_change_on_recreate_is_fatal(#[case] on_acquire: bool) {
        let mut frames = frame_loop();
        frames.presenter.recreated_color_format = Some(vk::Format::R8G8B8A8_UNORM);
        let mut surface = FakeSurface::new(800, 600);

        let err = if on_acquire {
            frames.presenter.acquires.push_back(AcquireResult::OutOfDate);
            frames.begin_frame(&mut surface).unwrap_err()
        } else {
            frames.presenter.presents.push_back(PresentResult::NeedsRecreate);
            let cmd = frames.begin_frame(&mut surface).unwrap().unwrap();
            frames.begin_render_pass(cmd).unwrap();
            frames.end_render_pass(cmd).unwrap();
            frames.end_frame(&mut surface).unwrap_err()
        };

        assert!(
            matches!(err, EngineError::SwapchainFormatChanged { new: (vk::Format::R8G8B8A8_UNORM, _), .. }),
            "{err}"
        );
        assert_eq!(frames.state(), FrameState::Idle);
        assert!(!frames.is_frame_in_progress());
        assert!(frames.presenter().recreated.is_empty());
    }
}

//! The winit window and its event loop
//!
//! The loop is pumped from the engine's own frame loop instead of
//! handing control to winit.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use winit::{
    dpi::PhysicalSize,
    event::{Event, WindowEvent},
    event_loop::EventLoop,
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window as WinitWindow, WindowBuilder},
};

use crate::error::{EngineError, EngineResult};
use crate::frame::SurfaceSource;

/// How long `wait_events` blocks per pump
const WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Size, resize and close bookkeeping, kept apart from the event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowState {
    width: u32,
    height: u32,
    resized: bool,
    close_requested: bool,
}

impl WindowState {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            resized: false,
            close_requested: false,
        }
    }

    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            _ => {}
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Owns the event loop, so it must stay on the main thread.
pub struct Window {
    window: Arc<WinitWindow>,
    event_loop: EventLoop<()>,
    state: WindowState,
    pending: Vec<WindowEvent>,
}

impl Window {
    pub fn new(title: &str, width: u32, height: u32) -> EngineResult<Self> {
        let event_loop = EventLoop::new()
            .map_err(|e| EngineError::Initialization(format!("Failed to create event loop: {e}")))?;
        let window = WindowBuilder::new()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height))
            .build(&event_loop)
            .map_err(|e| EngineError::Initialization(format!("Failed to create window: {e}")))?;

        let size = window.inner_size();
        log::info!("Created window '{title}' ({}x{})", size.width, size.height);
        Ok(Self {
            window: Arc::new(window),
            event_loop,
            state: WindowState::new(size.width, size.height),
            pending: Vec::new(),
        })
    }

    fn pump(&mut self, timeout: Option<Duration>) {
        let Self {
            event_loop,
            state,
            pending,
            ..
        } = self;
        let status = event_loop.pump_events(timeout, |event, _| {
            if let Event::WindowEvent { event, .. } = event {
                state.handle_event(&event);
                pending.push(event);
            }
        });
        if let PumpStatus::Exit(code) = status {
            log::info!("Event loop exited with code {code}");
            self.state.close_requested = true;
        }
    }

    /// Process pending events and return the window events seen since the last call
    pub fn poll_events(&mut self) -> Vec<WindowEvent> {
        self.pump(Some(Duration::ZERO));
        std::mem::take(&mut self.pending)
    }

    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    pub fn window_arc(&self) -> Arc<WinitWindow> {
        Arc::clone(&self.window)
    }

    /// Last size reported by the window system, in physical pixels
    pub fn dimensions(&self) -> (u32, u32) {
        self.state.dimensions()
    }

    /// Check if window was resized since the flag was last taken
    pub fn was_resized(&self) -> bool {
        self.state.resized
    }

    pub fn should_close(&self) -> bool {
        self.state.close_requested
    }

    pub fn set_title(&self, title: &str) {
        self.window.set_title(title);
    }
}

impl SurfaceSource for Window {
    fn framebuffer_extent(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    fn wait_events(&mut self) {
        self.pump(Some(WAIT_TIMEOUT));
    }

    fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.state.resized)
    }
}

//! Shared fakes for tests that run without a GPU.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;

use ash::vk;
use ash::vk::Handle;

use lumen_engine::assets::{ModelLoader, ModelResource, TextureLibrary, TextureLoader, INVALID_TEXTURE_INDEX};
use lumen_engine::frame::{AcquireResult, PresentResult, Presenter, SurfaceSource};
use lumen_engine::EngineResult;

/// Fresh, empty scratch directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lumen-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Texture "loaded" as its own name.
#[derive(Default)]
pub struct NameLoader {
    pub file_loads: usize,
}

impl TextureLoader for NameLoader {
    type Texture = String;

    fn load_file(&mut self, path: &str) -> EngineResult<String> {
        self.file_loads += 1;
        Ok(path.to_string())
    }

    fn load_memory(&mut self, name: &str, _bytes: &[u8]) -> EngineResult<String> {
        Ok(name.to_string())
    }
}

/// Model with a texture index per mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct FakeModel {
    pub path: String,
    pub mesh_textures: Vec<u32>,
}

impl ModelResource for FakeModel {
    fn mesh_count(&self) -> usize {
        self.mesh_textures.len()
    }

    fn mesh_texture_index(&self, mesh: usize) -> u32 {
        self.mesh_textures.get(mesh).copied().unwrap_or(INVALID_TEXTURE_INDEX)
    }
}

/// Loads a two-mesh model: one textured with `<stem>.png`, one untextured.
#[derive(Default)]
pub struct FakeModelLoader {
    pub loads: Vec<String>,
}

impl ModelLoader for FakeModelLoader {
    type Model = FakeModel;
    type Textures = NameLoader;

    fn load(&mut self, path: &str, textures: &mut TextureLibrary<NameLoader>) -> EngineResult<FakeModel> {
        self.loads.push(path.to_string());
        let stem = path.rsplit_once('.').map_or(path, |(stem, _)| stem);
        let texture = textures.get_or_add_texture(&format!("{stem}.png"))?;
        Ok(FakeModel {
            path: path.to_string(),
            mesh_textures: vec![texture, INVALID_TEXTURE_INDEX],
        })
    }
}

#[derive(Default)]
pub struct FakePresenter {
    pub extent: (u32, u32),
    pub acquires: VecDeque<AcquireResult>,
    pub presents: VecDeque<PresentResult>,
    pub recreated: Vec<(u32, u32)>,
    pub submitted: Vec<(u32, usize)>,
}

impl FakePresenter {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            extent: (width, height),
            ..Default::default()
        }
    }
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
        Ok(vk::CommandBuffer::from_raw(0x100 + frame as u64))
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
        self.extent = (extent.width, extent.height);
        self.recreated.push(self.extent);
        Ok(())
    }

    fn begin_render_pass(&mut self, _: vk::CommandBuffer, _: u32, _: vk::Viewport, _: vk::Rect2D) {}

    fn end_render_pass(&mut self, _: vk::CommandBuffer) {}
}

/// Surface whose size changes only when events are waited on.
pub struct FakeSurface {
    pub pending_sizes: VecDeque<(u32, u32)>,
    pub size: (u32, u32),
    pub resized: bool,
    pub waits: usize,
}

impl FakeSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            pending_sizes: VecDeque::new(),
            size: (width, height),
            resized: false,
            waits: 0,
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.size = (width, height);
        self.resized = true;
    }
}

impl SurfaceSource for FakeSurface {
    fn framebuffer_extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.size.0,
            height: self.size.1,
        }
    }

    fn wait_events(&mut self) {
        self.waits += 1;
        if let Some(size) = self.pending_sizes.pop_front() {
            self.size = size;
        }
    }

    fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }
}

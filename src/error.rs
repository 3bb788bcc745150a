//! Engine error type
//!
//! Every fallible operation in the engine returns [`EngineResult`]. Recoverable
//! situations (out-of-date swapchain, minimized window, unresolved model index at
//! draw time) are handled where they happen and never reach this type.

use ash::vk;
use thiserror::Error;

/// Engine error type
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to initialize engine: {0}")]
    Initialization(String),
    #[error("Vulkan call failed while trying to {context}: {result:?}")]
    Vulkan {
        context: &'static str,
        result: vk::Result,
    },
    #[error("GPU allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),
    #[error("Swap chain image (or depth) format has changed: {old:?} -> {new:?}")]
    SwapchainFormatChanged {
        old: (vk::Format, vk::Format),
        new: (vk::Format, vk::Format),
    },
    #[error("Failed to compile shader: {0}")]
    ShaderCompilation(String),
    #[error("Cannot create pipeline before its descriptor set layout")]
    MissingDescriptorSetLayout,
    #[error("Buffer is not mapped")]
    BufferNotMapped,
    #[error("Write of {len} bytes at offset {offset} overflows buffer of {size} bytes")]
    BufferWriteOutOfRange { offset: u64, len: u64, size: u64 },

    #[error("Texture count exceeded maximum of {capacity}")]
    TextureCapacityExceeded { capacity: usize },
    #[error("Model count exceeded maximum of {capacity}")]
    ModelCapacityExceeded { capacity: usize },
    #[error("Failed to load model '{path}': {reason}")]
    ModelImport { path: String, reason: String },
    #[error("Failed to decode image '{path}': {source}")]
    ImageDecode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("Texture '{0}' is not registered")]
    TextureNotFound(String),
    #[error("Texture index {index} is out of range (library holds {len})")]
    TextureIndexOutOfRange { index: u32, len: usize },

    #[error("Can't call begin_frame while a frame is already in progress")]
    FrameAlreadyInProgress,
    #[error("No frame is in progress")]
    FrameNotInProgress,
    #[error("The swap chain render pass was already begun this frame")]
    RenderPassAlreadyBegun,
    #[error("The swap chain render pass has not been begun")]
    RenderPassNotBegun,
    #[error("The swap chain render pass is still open")]
    RenderPassStillOpen,
    #[error("Command buffer does not belong to the current frame")]
    ForeignCommandBuffer,

    #[error("Entity {entity} has no {component} component")]
    ComponentAbsent {
        entity: String,
        component: &'static str,
    },
    #[error("Editor overlay error: {0}")]
    Editor(String),
    #[error("Scene file error: {0}")]
    SceneFormat(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Build a `map_err` adapter that tags a raw Vulkan result with what was attempted.
    pub fn vk(context: &'static str) -> impl FnOnce(vk::Result) -> EngineError {
        move |result| EngineError::Vulkan { context, result }
    }

    pub fn model_import(path: impl Into<String>, reason: impl ToString) -> Self {
        EngineError::ModelImport {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error comes from misusing the frame API rather than from the GPU.
    pub fn is_frame_misuse(&self) -> bool {
        matches!(
            self,
            EngineError::FrameAlreadyInProgress
                | EngineError::FrameNotInProgress
                | EngineError::RenderPassAlreadyBegun
                | EngineError::RenderPassNotBegun
                | EngineError::RenderPassStillOpen
                | EngineError::ForeignCommandBuffer
        )
    }
}

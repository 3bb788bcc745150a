//! Thin RAII wrappers over the Vulkan objects the engine uses.

pub mod buffer;
pub mod descriptors;
pub mod device;
pub mod instance;
pub mod pipeline;
pub mod swapchain;
pub mod texture;

pub use buffer::Buffer;
pub use descriptors::{DescriptorPool, DescriptorSetLayout, DescriptorWriter};
pub use device::Device;
pub use pipeline::{Pipeline, PipelineConfig, PipelineLayout};
pub use swapchain::{Swapchain, SwapchainFormats};
pub use texture::Texture;

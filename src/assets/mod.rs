//! Texture and model libraries, and model import.

pub mod import;
pub mod model;
pub mod model_library;
pub mod texture_library;

pub use import::{resolve_texture_path, set_vertex_bone_data, BoneInfo, MeshData, ModelData, ModelImporter, TextureSource, Vertex};
pub use model::{register_texture, DeviceModelLoader, Material, Mesh, Model, ModelResource};
pub use model_library::{ModelLibrary, ModelLoader, INVALID_MODEL_INDEX, MAX_MODEL_COUNT};
pub use texture_library::{DeviceTextureLoader, TextureCheckpoint, TextureLibrary, TextureLoader, INVALID_TEXTURE_INDEX, MAX_TEXTURE_COUNT};

/// Texture library backed by the GPU.
pub type Textures = TextureLibrary<DeviceTextureLoader>;
/// Model library backed by the GPU.
pub type Models = ModelLibrary<DeviceModelLoader>;

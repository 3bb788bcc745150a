use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use ash::vk;

use super::import::{BoneInfo, MeshData, ModelImporter, TextureSource, Vertex};
use super::model_library::ModelLoader;
use super::texture_library::{DeviceTextureLoader, TextureLibrary, TextureLoader, INVALID_TEXTURE_INDEX};
use crate::error::EngineResult;
use crate::vulkan::{Buffer, Device};

/// What the draw path needs to know about a loaded model.
pub trait ModelResource {
    fn mesh_count(&self) -> usize;
    /// Texture library index of a mesh, or [`INVALID_TEXTURE_INDEX`].
    fn mesh_texture_index(&self, mesh: usize) -> u32;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub diffuse_texture: Option<String>,
    pub shininess: f32,
}

/// Register a mesh's diffuse texture and return its library index.
///
/// Embedded images always get a fresh `BAKED_IN_<n>` entry. External files are
/// shared by path, and a file that does not exist is skipped with a warning.
pub fn register_texture<L: TextureLoader>(
    textures: &mut TextureLibrary<L>,
    source: &TextureSource,
) -> EngineResult<u32> {
    match source {
        TextureSource::Embedded(bytes) => textures.add_texture_from_memory(bytes),
        TextureSource::External(path) => {
            if !Path::new(path).exists() {
                log::warn!("Texture '{path}' not found, mesh will be untextured");
                return Ok(INVALID_TEXTURE_INDEX);
            }
            textures.get_or_add_texture(path)
        }
    }
}

pub struct Mesh {
    device: Arc<Device>,
    vertex_buffer: Buffer,
    index_buffer: Option<Buffer>,
    vertex_count: u32,
    index_count: u32,
    pub texture_index: u32,
    pub material: Material,
}

impl Mesh {
    pub fn new(device: Arc<Device>, data: &MeshData, texture_index: u32, material: Material) -> EngineResult<Self> {
        let vertex_count = data.vertices.len() as u32;
        let vertex_buffer = Buffer::upload_via_staging(
            device.clone(),
            bytemuck::cast_slice(&data.vertices),
            std::mem::size_of::<Vertex>() as vk::DeviceSize,
            vertex_count.max(1),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;

        let index_count = data.indices.len() as u32;
        let index_buffer = if index_count > 0 {
            Some(Buffer::upload_via_staging(
                device.clone(),
                bytemuck::cast_slice(&data.indices),
                std::mem::size_of::<u32>() as vk::DeviceSize,
                index_count,
                vk::BufferUsageFlags::INDEX_BUFFER,
            )?)
        } else {
            None
        };

        Ok(Self {
            device,
            vertex_buffer,
            index_buffer,
            vertex_count,
            index_count,
            texture_index,
            material,
        })
    }

    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        let device = self.device.logical();
        unsafe {
            device.cmd_bind_vertex_buffers(command_buffer, 0, &[self.vertex_buffer.handle()], &[0]);
            if let Some(index_buffer) = &self.index_buffer {
                device.cmd_bind_index_buffer(command_buffer, index_buffer.handle(), 0, vk::IndexType::UINT32);
            }
        }
    }

    pub fn draw(&self, command_buffer: vk::CommandBuffer) {
        let device = self.device.logical();
        unsafe {
            if self.index_buffer.is_some() {
                device.cmd_draw_indexed(command_buffer, self.index_count, 1, 0, 0, 0);
            } else {
                device.cmd_draw(command_buffer, self.vertex_count, 1, 0, 0);
            }
        }
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

pub struct Model {
    path: String,
    pub meshes: Vec<Mesh>,
    pub bones: HashMap<String, BoneInfo>,
}

impl Model {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl ModelResource for Model {
    fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    fn mesh_texture_index(&self, mesh: usize) -> u32 {
        self.meshes
            .get(mesh)
            .map_or(INVALID_TEXTURE_INDEX, |mesh| mesh.texture_index)
    }
}

/// Imports models and uploads their meshes.
pub struct DeviceModelLoader {
    device: Arc<Device>,
    importer: ModelImporter,
}

impl DeviceModelLoader {
    pub fn new(device: Arc<Device>, importer: ModelImporter) -> Self {
        Self { device, importer }
    }
}

impl ModelLoader for DeviceModelLoader {
    type Model = Model;
    type Textures = DeviceTextureLoader;

    fn load(&mut self, path: &str, textures: &mut TextureLibrary<DeviceTextureLoader>) -> EngineResult<Model> {
        let data = self.importer.import(Path::new(path))?;

        let mut meshes = Vec::with_capacity(data.meshes.len());
        for mesh in &data.meshes {
            let texture_index = match &mesh.texture {
                Some(source) => register_texture(textures, source)?,
                None => INVALID_TEXTURE_INDEX,
            };
            let material = Material {
                diffuse_texture: textures.path_of(texture_index).map(str::to_string),
                shininess: mesh.shininess,
            };
            meshes.push(Mesh::new(self.device.clone(), mesh, texture_index, material)?);
        }

        log::info!("Loaded model '{}' ({} meshes)", path, meshes.len());
        Ok(Model {
            path: path.to_string(),
            meshes,
            bones: data.bones,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NameLoader;

    impl TextureLoader for NameLoader {
        type Texture = String;

        fn load_file(&mut self, path: &str) -> EngineResult<String> {
            Ok(path.to_string())
        }

        fn load_memory(&mut self, name: &str, _bytes: &[u8]) -> EngineResult<String> {
            Ok(name.to_string())
        }
    }

    #[test]
    fn test_embedded_textures_are_baked_in() {
        let mut textures = TextureLibrary::new(NameLoader);
        let source = TextureSource::Embedded(vec![1, 2, 3]);

        assert_eq!(register_texture(&mut textures, &source).unwrap(), 0);
        assert_eq!(register_texture(&mut textures, &source).unwrap(), 1);
        assert_eq!(textures.path_of(1), Some("BAKED_IN_1"));
    }

    #[test]
    fn test_missing_external_texture_is_skipped() {
        let mut textures = TextureLibrary::new(NameLoader);
        let source = TextureSource::External("does/not/exist/diffuse.png".into());

        assert_eq!(register_texture(&mut textures, &source).unwrap(), INVALID_TEXTURE_INDEX);
        assert!(textures.is_empty());
    }

    #[test]
    fn test_external_textures_are_shared() {
        let dir = std::env::temp_dir().join(format!("lumen-register-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("shared.png");
        std::fs::write(&file, b"png").unwrap();
        let source = TextureSource::External(file.to_string_lossy().into_owned());

        let mut textures = TextureLibrary::new(NameLoader);
        let first = register_texture(&mut textures, &source).unwrap();
        let second = register_texture(&mut textures, &source).unwrap();
        assert_eq!(first, second);
        assert_eq!(textures.len(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}

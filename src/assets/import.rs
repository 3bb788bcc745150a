//! CPU-side model import: OBJ through tobj, glTF/GLB through gltf, with a
//! bincode cache of the imported data.

use std::collections::HashMap;
use std::fs;
use std::mem::offset_of;
use std::path::{Path, PathBuf};

use ash::vk;
use glam::{Mat3, Mat4, Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Bumped whenever the cached layout changes.
const CACHE_VERSION: u32 = 1;

pub const MAX_BONE_INFLUENCE: usize = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable, Serialize, Deserialize)]
pub struct Vertex {
    pub position: Vec3,
    pub color: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    /// -1 marks an unused slot.
    pub bone_ids: [i32; MAX_BONE_INFLUENCE],
    pub weights: [f32; MAX_BONE_INFLUENCE],
}

impl Default for Vertex {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            color: Vec3::ONE,
            normal: Vec3::ZERO,
            uv: Vec2::ZERO,
            bone_ids: [-1; MAX_BONE_INFLUENCE],
            weights: [0.0; MAX_BONE_INFLUENCE],
        }
    }
}

impl Vertex {
    pub fn binding_descriptions() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        let attribute = |location, format, offset: usize| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset: offset as u32,
        };
        vec![
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, position)),
            attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, color)),
            attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, normal)),
            attribute(3, vk::Format::R32G32_SFLOAT, offset_of!(Vertex, uv)),
            attribute(4, vk::Format::R32G32B32A32_SINT, offset_of!(Vertex, bone_ids)),
            attribute(5, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Vertex, weights)),
        ]
    }
}

/// Put `(bone_id, weight)` in the first free influence slot. Returns false when all slots are taken.
pub fn set_vertex_bone_data(vertex: &mut Vertex, bone_id: i32, weight: f32) -> bool {
    match vertex.bone_ids.iter().position(|&id| id < 0) {
        Some(slot) => {
            vertex.bone_ids[slot] = bone_id;
            vertex.weights[slot] = weight;
            true
        }
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoneInfo {
    pub id: i32,
    /// Mesh space to bone space.
    pub offset: Mat4,
}

/// Where a mesh's diffuse texture comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TextureSource {
    /// Encoded image bytes stored inside the model file.
    Embedded(Vec<u8>),
    /// Resolved path to an image on disk.
    External(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub texture: Option<TextureSource>,
    pub shininess: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelData {
    pub meshes: Vec<MeshData>,
    pub bones: HashMap<String, BoneInfo>,
}

impl ModelData {
    /// Register a bone by name, returning its id. Known names keep their id.
    pub fn add_bone(&mut self, name: &str, offset: Mat4) -> i32 {
        if let Some(bone) = self.bones.get(name) {
            return bone.id;
        }
        let id = self.bones.len() as i32;
        self.bones.insert(name.to_string(), BoneInfo { id, offset });
        id
    }
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    model: ModelData,
}

/// Build the on-disk path of a texture referenced by a model in `directory`.
///
/// Leading `.`, `/` and `\` are dropped. Unless the reference or the directory
/// already mention `textures`, the file is looked up in `directory/textures/`.
pub fn resolve_texture_path(texture: &str, directory: &str) -> String {
    let texture = texture.trim_start_matches(['.', '/', '\\']);
    if !texture.contains("textures") && !directory.contains("textures") {
        format!("{directory}/textures/{texture}")
    } else {
        format!("{directory}/{texture}")
    }
}

fn model_directory(path: &Path) -> String {
    path.parent()
        .map(|dir| dir.to_string_lossy().replace('\\', "/"))
        .filter(|dir| !dir.is_empty())
        .unwrap_or_else(|| ".".to_string())
}

pub struct ModelImporter {
    cache_dir: PathBuf,
}

impl ModelImporter {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// `<cache_dir>/<stem>.<ext>.bin`
    pub fn cache_path(&self, path: &Path) -> PathBuf {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        self.cache_dir.join(format!("{file_name}.bin"))
    }

    /// Import `path`, going through the cache.
    pub fn import(&self, path: &Path) -> EngineResult<ModelData> {
        let cache_path = self.cache_path(path);
        if let Some(model) = self.read_cache(&cache_path) {
            log::debug!("Model cache hit for {}", path.display());
            return Ok(model);
        }
        log::debug!("Model cache miss for {}", path.display());

        let model = self.import_uncached(path)?;
        if let Err(e) = self.write_cache(&cache_path, &model) {
            log::warn!("Failed to write model cache {}: {e}", cache_path.display());
        }
        Ok(model)
    }

    /// Import `path` from its source format, ignoring the cache.
    pub fn import_uncached(&self, path: &Path) -> EngineResult<ModelData> {
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let model = match extension.as_str() {
            "obj" => import_obj(path)?,
            "gltf" | "glb" => import_gltf(path)?,
            other => {
                return Err(EngineError::model_import(
                    path.display().to_string(),
                    format!("unsupported model format '{other}'"),
                ))
            }
        };
        let model = drop_empty_meshes(path, model)?;

        log::info!(
            "Imported model {} ({} meshes, {} bones)",
            path.display(),
            model.meshes.len(),
            model.bones.len()
        );
        Ok(model)
    }

    fn read_cache(&self, cache_path: &Path) -> Option<ModelData> {
        let bytes = fs::read(cache_path).ok()?;
        match bincode::deserialize::<CacheFile>(&bytes) {
            Ok(cache) if cache.version == CACHE_VERSION && has_geometry(&cache.model) => Some(cache.model),
            Ok(cache) => {
                log::debug!(
                    "Ignoring model cache {} (version {}, {} meshes)",
                    cache_path.display(),
                    cache.version,
                    cache.model.meshes.len()
                );
                None
            }
            Err(e) => {
                log::warn!("Ignoring corrupt model cache {}: {e}", cache_path.display());
                None
            }
        }
    }

    fn write_cache(&self, cache_path: &Path, model: &ModelData) -> EngineResult<()> {
        fs::create_dir_all(&self.cache_dir)?;
        let cache = CacheFile {
            version: CACHE_VERSION,
            model: model.clone(),
        };
        let bytes = bincode::serialize(&cache).map_err(|e| {
            EngineError::model_import(cache_path.display().to_string(), e)
        })?;
        fs::write(cache_path, bytes)?;
        Ok(())
    }
}

fn has_geometry(model: &ModelData) -> bool {
    model.meshes.iter().any(|mesh| !mesh.vertices.is_empty())
}

/// Meshes without vertices are dropped. A model with none left is an import error.
fn drop_empty_meshes(path: &Path, mut model: ModelData) -> EngineResult<ModelData> {
    if !has_geometry(&model) {
        return Err(EngineError::model_import(path.display().to_string(), "model contains no geometry"));
    }
    let before = model.meshes.len();
    model.meshes.retain(|mesh| !mesh.vertices.is_empty());
    if model.meshes.len() < before {
        log::warn!(
            "Dropped {} empty meshes from {}",
            before - model.meshes.len(),
            path.display()
        );
    }
    Ok(model)
}

fn import_obj(path: &Path) -> EngineResult<ModelData> {
    let display = path.display().to_string();
    let (models, materials) = tobj::load_obj(
        path,
        &tobj::LoadOptions {
            triangulate: true,
            single_index: true,
            ..Default::default()
        },
    )
    .map_err(|e| EngineError::model_import(&display, e))?;

    let materials = materials.unwrap_or_else(|e| {
        log::warn!("Failed to load materials for {display}: {e}");
        Vec::new()
    });
    let directory = model_directory(path);

    let mut data = ModelData::default();
    for model in models {
        let mesh = &model.mesh;
        let vertex_count = mesh.positions.len() / 3;
        let has_normals = mesh.normals.len() == vertex_count * 3;
        let has_uvs = mesh.texcoords.len() == vertex_count * 2;
        let has_colors = mesh.vertex_color.len() == vertex_count * 3;

        let vertices = (0..vertex_count)
            .map(|i| Vertex {
                position: Vec3::from_slice(&mesh.positions[i * 3..i * 3 + 3]),
                color: if has_colors {
                    Vec3::from_slice(&mesh.vertex_color[i * 3..i * 3 + 3])
                } else {
                    Vec3::ONE
                },
                normal: if has_normals {
                    Vec3::from_slice(&mesh.normals[i * 3..i * 3 + 3]).normalize_or_zero()
                } else {
                    Vec3::ZERO
                },
                // OBJ has v pointing up, Vulkan samples top-down.
                uv: if has_uvs {
                    Vec2::new(mesh.texcoords[i * 2], 1.0 - mesh.texcoords[i * 2 + 1])
                } else {
                    Vec2::ZERO
                },
                ..Default::default()
            })
            .collect();

        let material = mesh.material_id.and_then(|id| materials.get(id));
        data.meshes.push(MeshData {
            vertices,
            indices: mesh.indices.clone(),
            texture: material
                .and_then(|m| m.diffuse_texture.as_deref())
                .filter(|tex| !tex.is_empty())
                .map(|tex| TextureSource::External(resolve_texture_path(tex, &directory))),
            shininess: material.and_then(|m| m.shininess).unwrap_or(0.0),
        });
    }

    Ok(data)
}

struct GltfContext<'a> {
    path: &'a str,
    directory: String,
    buffers: &'a [gltf::buffer::Data],
}

fn import_gltf(path: &Path) -> EngineResult<ModelData> {
    let display = path.display().to_string();
    let gltf::Gltf { document, blob } =
        gltf::Gltf::open(path).map_err(|e| EngineError::model_import(&display, e))?;
    let buffers = gltf::import_buffers(&document, path.parent(), blob)
        .map_err(|e| EngineError::model_import(&display, e))?;

    let scene = document
        .default_scene()
        .or_else(|| document.scenes().next())
        .ok_or_else(|| EngineError::model_import(&display, "document has no scene"))?;
    if scene.nodes().next().is_none() {
        return Err(EngineError::model_import(&display, "scene has no root nodes"));
    }

    let context = GltfContext {
        path: &display,
        directory: model_directory(path),
        buffers: &buffers,
    };
    let mut data = ModelData::default();
    for node in scene.nodes() {
        process_node(&context, &node, Mat4::IDENTITY, &mut data)?;
    }
    Ok(data)
}

fn process_node(
    context: &GltfContext<'_>,
    node: &gltf::Node<'_>,
    parent: Mat4,
    data: &mut ModelData,
) -> EngineResult<()> {
    let world = parent * Mat4::from_cols_array_2d(&node.transform().matrix());

    if let Some(mesh) = node.mesh() {
        let joint_bones = node.skin().map(|skin| register_skin(context, &skin, data));
        for primitive in mesh.primitives() {
            if primitive.mode() != gltf::mesh::Mode::Triangles {
                log::warn!(
                    "Skipping non-triangle primitive in {} ({:?})",
                    context.path,
                    primitive.mode()
                );
                continue;
            }
            let mesh_data = process_primitive(context, &primitive, world, joint_bones.as_deref())?;
            data.meshes.push(mesh_data);
        }
    }

    for child in node.children() {
        process_node(context, &child, world, data)?;
    }
    Ok(())
}

/// Register a skin's joints as bones, returning the bone id of each joint slot.
fn register_skin(context: &GltfContext<'_>, skin: &gltf::Skin<'_>, data: &mut ModelData) -> Vec<i32> {
    let reader = skin.reader(|buffer| Some(&context.buffers[buffer.index()].0[..]));
    let inverse_binds: Vec<Mat4> = reader
        .read_inverse_bind_matrices()
        .map(|matrices| matrices.map(|m| Mat4::from_cols_array_2d(&m)).collect())
        .unwrap_or_default();

    skin.joints()
        .enumerate()
        .map(|(slot, joint)| {
            let name = joint
                .name()
                .map(str::to_string)
                .unwrap_or_else(|| format!("joint_{}", joint.index()));
            let offset = inverse_binds.get(slot).copied().unwrap_or(Mat4::IDENTITY);
            data.add_bone(&name, offset)
        })
        .collect()
}

fn process_primitive(
    context: &GltfContext<'_>,
    primitive: &gltf::Primitive<'_>,
    world: Mat4,
    joint_bones: Option<&[i32]>,
) -> EngineResult<MeshData> {
    let reader = primitive.reader(|buffer| Some(&context.buffers[buffer.index()].0[..]));

    let positions: Vec<Vec3> = reader
        .read_positions()
        .ok_or_else(|| EngineError::model_import(context.path, "primitive has no positions"))?
        .map(Vec3::from)
        .collect();

    let mut vertices: Vec<Vertex> = positions
        .iter()
        .map(|&position| Vertex {
            position,
            ..Default::default()
        })
        .collect();

    if let Some(normals) = reader.read_normals() {
        for (vertex, normal) in vertices.iter_mut().zip(normals) {
            vertex.normal = Vec3::from(normal).normalize_or_zero();
        }
    }
    if let Some(uvs) = reader.read_tex_coords(0) {
        for (vertex, uv) in vertices.iter_mut().zip(uvs.into_f32()) {
            vertex.uv = Vec2::from(uv);
        }
    }
    if let Some(colors) = reader.read_colors(0) {
        for (vertex, color) in vertices.iter_mut().zip(colors.into_rgb_f32()) {
            vertex.color = Vec3::from(color);
        }
    }

    // Skinned vertices stay in mesh space, the bone matrices place them.
    match joint_bones {
        Some(bones) => {
            if let (Some(joints), Some(weights)) = (reader.read_joints(0), reader.read_weights(0)) {
                for (vertex, (joint, weight)) in vertices
                    .iter_mut()
                    .zip(joints.into_u16().zip(weights.into_f32()))
                {
                    for (slot, w) in joint.iter().zip(weight) {
                        if w <= 0.0 {
                            continue;
                        }
                        if let Some(&bone) = bones.get(*slot as usize) {
                            set_vertex_bone_data(vertex, bone, w);
                        }
                    }
                }
            }
        }
        None => {
            let normal_matrix = Mat3::from_mat4(world).inverse().transpose();
            for vertex in &mut vertices {
                vertex.position = world.transform_point3(vertex.position);
                vertex.normal = (normal_matrix * vertex.normal).normalize_or_zero();
            }
        }
    }

    let indices = match reader.read_indices() {
        Some(indices) => indices.into_u32().collect(),
        None => Vec::new(),
    };

    let material = primitive.material();
    let texture = material
        .pbr_metallic_roughness()
        .base_color_texture()
        .and_then(|info| texture_source(context, &info.texture()));
    // glTF has no shininess; map roughness onto the Blinn exponent range.
    let roughness = material.pbr_metallic_roughness().roughness_factor();
    let shininess = (1.0 - roughness).clamp(0.0, 1.0) * 128.0;

    Ok(MeshData {
        vertices,
        indices,
        texture,
        shininess,
    })
}

fn texture_source(context: &GltfContext<'_>, texture: &gltf::Texture<'_>) -> Option<TextureSource> {
    match texture.source().source() {
        gltf::image::Source::View { view, .. } => {
            let buffer = &context.buffers[view.buffer().index()].0;
            let start = view.offset();
            let end = start + view.length();
            match buffer.get(start..end) {
                Some(bytes) => Some(TextureSource::Embedded(bytes.to_vec())),
                None => {
                    log::warn!("Embedded texture in {} points outside its buffer", context.path);
                    None
                }
            }
        }
        gltf::image::Source::Uri { uri, .. } => {
            if uri.starts_with("data:") {
                log::warn!("Skipping data URI texture in {}", context.path);
                None
            } else {
                Some(TextureSource::External(resolve_texture_path(uri, &context.directory)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("diffuse.png", "assets/models/crate", "assets/models/crate/textures/diffuse.png")]
    #[case("./diffuse.png", "assets/models/crate", "assets/models/crate/textures/diffuse.png")]
    #[case(".\\diffuse.png", "assets/models", "assets/models/textures/diffuse.png")]
    #[case("textures/diffuse.png", "assets/models", "assets/models/textures/diffuse.png")]
    #[case("diffuse.png", "assets/textures", "assets/textures/diffuse.png")]
    fn test_resolve_texture_path(#[case] texture: &str, #[case] dir: &str, #[case] expected: &str) {
        assert_eq!(resolve_texture_path(texture, dir), expected);
    }

    #[test]
    fn test_vertex_defaults() {
        let vertex = Vertex::default();
        assert_eq!(vertex.color, Vec3::ONE);
        assert_eq!(vertex.bone_ids, [-1; 4]);
        assert_eq!(vertex.weights, [0.0; 4]);
    }

    #[test]
    fn test_bone_slots_fill_in_order() {
        let mut vertex = Vertex::default();
        for bone in 0..4 {
            assert!(set_vertex_bone_data(&mut vertex, bone, 0.25));
        }
        assert!(!set_vertex_bone_data(&mut vertex, 9, 0.5));
        assert_eq!(vertex.bone_ids, [0, 1, 2, 3]);
        assert_eq!(vertex.weights, [0.25; 4]);
    }

    #[test]
    fn test_add_bone_keeps_ids() {
        let mut model = ModelData::default();
        assert_eq!(model.add_bone("hip", Mat4::IDENTITY), 0);
        assert_eq!(model.add_bone("knee", Mat4::IDENTITY), 1);
        assert_eq!(model.add_bone("hip", Mat4::ZERO), 0);
        assert_eq!(model.bones["hip"].offset, Mat4::IDENTITY);
    }

    #[test]
    fn test_vertex_layout() {
        let attributes = Vertex::attribute_descriptions();
        assert_eq!(attributes.len(), 6);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[3].offset, 36);
        assert_eq!(attributes[4].offset, 44);
        assert_eq!(Vertex::binding_descriptions()[0].stride, 76);
    }

    #[test]
    fn test_cache_path_keeps_extension() {
        let importer = ModelImporter::new("cache");
        assert_eq!(
            importer.cache_path(Path::new("assets/models/a.obj")),
            PathBuf::from("cache/a.obj.bin")
        );
        assert_ne!(
            importer.cache_path(Path::new("a.obj")),
            importer.cache_path(Path::new("a.glb"))
        );
    }

    #[test]
    fn test_unsupported_extension() {
        let importer = ModelImporter::new("cache");
        let err = importer.import_uncached(Path::new("thing.fbx")).unwrap_err();
        assert!(matches!(err, EngineError::ModelImport { .. }));
    }
}

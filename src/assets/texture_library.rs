use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::vulkan::{Device, Texture};

pub const MAX_TEXTURE_COUNT: usize = 250;
/// Returned for "no texture": duplicate registrations and lookups that miss.
pub const INVALID_TEXTURE_INDEX: u32 = 999;

const BAKED_IN_PREFIX: &str = "BAKED_IN_";

/// Turns paths or encoded bytes into textures.
pub trait TextureLoader {
    type Texture;

    fn load_file(&mut self, path: &str) -> EngineResult<Self::Texture>;
    fn load_memory(&mut self, name: &str, bytes: &[u8]) -> EngineResult<Self::Texture>;
}

/// Uploads textures to the GPU.
pub struct DeviceTextureLoader {
    device: Arc<Device>,
}

impl DeviceTextureLoader {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }
}

impl TextureLoader for DeviceTextureLoader {
    type Texture = Texture;

    fn load_file(&mut self, path: &str) -> EngineResult<Texture> {
        Texture::from_file(self.device.clone(), path)
    }

    fn load_memory(&mut self, name: &str, bytes: &[u8]) -> EngineResult<Texture> {
        Texture::from_memory(self.device.clone(), name, bytes)
    }
}

/// Table length and baked-in counter at some point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureCheckpoint {
    len: usize,
    baked_in_count: u32,
}

/// Indexed texture table. Indices are dense and never reused, so they can go
/// straight into a descriptor array.
pub struct TextureLibrary<L: TextureLoader> {
    loader: L,
    textures: Vec<L::Texture>,
    paths: Vec<String>,
    indices: HashMap<String, u32>,
    baked_in_count: u32,
    capacity: usize,
}

impl<L: TextureLoader> TextureLibrary<L> {
    pub fn new(loader: L) -> Self {
        Self::with_capacity(loader, MAX_TEXTURE_COUNT)
    }

    pub fn with_capacity(loader: L, capacity: usize) -> Self {
        Self {
            loader,
            textures: Vec::new(),
            paths: Vec::new(),
            indices: HashMap::new(),
            baked_in_count: 0,
            capacity,
        }
    }

    fn ensure_room(&self) -> EngineResult<()> {
        if self.textures.len() >= self.capacity {
            return Err(EngineError::TextureCapacityExceeded {
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn register(&mut self, path: String, texture: L::Texture) -> u32 {
        let index = self.textures.len() as u32;
        self.indices.insert(path.clone(), index);
        self.paths.push(path);
        self.textures.push(texture);
        index
    }

    /// Load and register `path`. A path that is already registered yields
    /// [`INVALID_TEXTURE_INDEX`] and leaves the library untouched.
    pub fn add_texture(&mut self, path: &str) -> EngineResult<u32> {
        self.ensure_room()?;
        if self.indices.contains_key(path) {
            return Ok(INVALID_TEXTURE_INDEX);
        }

        let texture = self.loader.load_file(path)?;
        Ok(self.register(path.to_string(), texture))
    }

    /// Decode and register an in-memory image under a generated `BAKED_IN_<n>` name.
    pub fn add_texture_from_memory(&mut self, bytes: &[u8]) -> EngineResult<u32> {
        self.ensure_room()?;
        let name = format!("{BAKED_IN_PREFIX}{}", self.baked_in_count);
        let texture = self.loader.load_memory(&name, bytes)?;
        self.baked_in_count += 1;
        Ok(self.register(name, texture))
    }

    /// Marks the current end of the table for [`rollback`](Self::rollback).
    pub fn checkpoint(&self) -> TextureCheckpoint {
        TextureCheckpoint {
            len: self.textures.len(),
            baked_in_count: self.baked_in_count,
        }
    }

    /// Drop every texture registered after `checkpoint`. Only valid while no
    /// descriptor has been written for the dropped indices.
    pub fn rollback(&mut self, checkpoint: TextureCheckpoint) {
        if checkpoint.len >= self.textures.len() {
            return;
        }
        for path in self.paths.drain(checkpoint.len..) {
            self.indices.remove(&path);
        }
        self.textures.truncate(checkpoint.len);
        self.baked_in_count = checkpoint.baked_in_count;
        log::debug!("Rolled texture library back to {} entries", checkpoint.len);
    }

    pub fn get_or_add_texture(&mut self, path: &str) -> EngineResult<u32> {
        match self.indices.get(path) {
            Some(&index) => Ok(index),
            None => self.add_texture(path),
        }
    }

    pub fn get_texture(&self, path: &str) -> u32 {
        self.indices
            .get(path)
            .copied()
            .unwrap_or(INVALID_TEXTURE_INDEX)
    }

    /// Like [`get_texture`](Self::get_texture) but a miss is an error.
    pub fn lookup(&self, path: &str) -> EngineResult<u32> {
        self.indices
            .get(path)
            .copied()
            .ok_or_else(|| EngineError::TextureNotFound(path.to_string()))
    }

    pub fn texture(&self, index: u32) -> Option<&L::Texture> {
        self.textures.get(index as usize)
    }

    pub fn texture_checked(&self, index: u32) -> EngineResult<&L::Texture> {
        self.texture(index).ok_or(EngineError::TextureIndexOutOfRange {
            index,
            len: self.textures.len(),
        })
    }

    pub fn path_of(&self, index: u32) -> Option<&str> {
        self.paths.get(index as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Textures in index order, with their registered path.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &str, &L::Texture)> {
        self.paths
            .iter()
            .zip(&self.textures)
            .enumerate()
            .map(|(i, (path, texture))| (i as u32, path.as_str(), texture))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CORRUPT: &[u8] = b"corrupt";

    /// Loader that hands back the name it was asked for.
    #[derive(Default)]
    struct NameLoader {
        loads: usize,
    }

    impl TextureLoader for NameLoader {
        type Texture = String;

        fn load_file(&mut self, path: &str) -> EngineResult<String> {
            self.loads += 1;
            Ok(path.to_string())
        }

        fn load_memory(&mut self, name: &str, bytes: &[u8]) -> EngineResult<String> {
            self.loads += 1;
            if bytes == CORRUPT {
                return Err(EngineError::TextureNotFound(name.to_string()));
            }
            Ok(name.to_string())
        }
    }

    #[test]
    fn test_duplicate_returns_sentinel() {
        let mut library = TextureLibrary::new(NameLoader::default());
        assert_eq!(library.add_texture("a.png").unwrap(), 0);
        assert_eq!(library.add_texture("b.png").unwrap(), 1);
        assert_eq!(library.add_texture("a.png").unwrap(), INVALID_TEXTURE_INDEX);
        assert_eq!(library.len(), 2);
        assert_eq!(library.loader.loads, 2);
    }

    #[test]
    fn test_capacity_is_enforced_without_mutation() {
        let mut library = TextureLibrary::with_capacity(NameLoader::default(), 2);
        library.add_texture("a.png").unwrap();
        library.add_texture_from_memory(&[]).unwrap();

        assert!(matches!(
            library.add_texture("c.png"),
            Err(EngineError::TextureCapacityExceeded { capacity: 2 })
        ));
        assert!(matches!(
            library.add_texture_from_memory(&[]),
            Err(EngineError::TextureCapacityExceeded { .. })
        ));
        assert_eq!(library.len(), 2);
        assert_eq!(library.get_texture("c.png"), INVALID_TEXTURE_INDEX);
    }

    #[test]
    fn test_baked_in_names_count_up() {
        let mut library = TextureLibrary::new(NameLoader::default());
        library.add_texture("x.png").unwrap();
        assert_eq!(library.add_texture_from_memory(b"one").unwrap(), 1);
        assert_eq!(library.add_texture_from_memory(b"two").unwrap(), 2);

        assert_eq!(library.path_of(1), Some("BAKED_IN_0"));
        assert_eq!(library.get_texture("BAKED_IN_1"), 2);
        assert_eq!(library.texture(2).map(String::as_str), Some("BAKED_IN_1"));
    }

    #[test]
    fn test_lookup_misses() {
        let mut library = TextureLibrary::new(NameLoader::default());
        library.add_texture("a.png").unwrap();

        assert_eq!(library.lookup("a.png").unwrap(), 0);
        assert!(matches!(library.lookup("nope.png"), Err(EngineError::TextureNotFound(_))));
        assert!(matches!(
            library.texture_checked(5),
            Err(EngineError::TextureIndexOutOfRange { index: 5, len: 1 })
        ));
    }

    #[test]
    fn test_get_or_add_is_idempotent() {
        let mut library = TextureLibrary::new(NameLoader::default());
        let first = library.get_or_add_texture("a.png").unwrap();
        let second = library.get_or_add_texture("a.png").unwrap();
        assert_eq!(first, second);
        assert_eq!(library.len(), 1);

        let listed: Vec<_> = library.iter().map(|(i, path, _)| (i, path.to_string())).collect();
        assert_eq!(listed, vec![(0, "a.png".to_string())]);
    }

    #[test]
    fn test_failed_decode_keeps_baked_in_numbering() {
        let mut library = TextureLibrary::new(NameLoader::default());
        assert_eq!(library.add_texture_from_memory(b"one").unwrap(), 0);
        assert!(library.add_texture_from_memory(CORRUPT).is_err());
        assert_eq!(library.add_texture_from_memory(b"two").unwrap(), 1);

        assert_eq!(library.path_of(1), Some("BAKED_IN_1"));
        assert_eq!(library.get_texture("BAKED_IN_2"), INVALID_TEXTURE_INDEX);
    }

    #[test]
    fn test_rollback_forgets_later_textures() {
        let mut library = TextureLibrary::new(NameLoader::default());
        library.add_texture("kept.png").unwrap();
        let checkpoint = library.checkpoint();

        library.add_texture("dropped.png").unwrap();
        library.add_texture_from_memory(b"embedded").unwrap();
        library.rollback(checkpoint);

        assert_eq!(library.len(), 1);
        assert_eq!(library.get_texture("kept.png"), 0);
        assert_eq!(library.get_texture("dropped.png"), INVALID_TEXTURE_INDEX);
        assert_eq!(library.get_texture("BAKED_IN_0"), INVALID_TEXTURE_INDEX);

        // Freed slots and names are handed out again.
        assert_eq!(library.add_texture("dropped.png").unwrap(), 1);
        assert_eq!(library.add_texture_from_memory(b"embedded").unwrap(), 2);
        assert_eq!(library.path_of(2), Some("BAKED_IN_0"));
    }

    #[test]
    fn test_rollback_to_current_end_is_a_no_op() {
        let mut library = TextureLibrary::new(NameLoader::default());
        library.add_texture_from_memory(b"one").unwrap();
        library.rollback(library.checkpoint());
        assert_eq!(library.len(), 1);
        assert_eq!(library.add_texture_from_memory(b"two").unwrap(), 1);
        assert_eq!(library.path_of(1), Some("BAKED_IN_1"));
    }
}

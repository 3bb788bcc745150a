use std::collections::HashMap;

use super::texture_library::{TextureLibrary, TextureLoader};
use crate::error::{EngineError, EngineResult};

pub const MAX_MODEL_COUNT: usize = 100;
pub const INVALID_MODEL_INDEX: u32 = 9999;

/// Turns a model path into a loaded model, registering its textures.
pub trait ModelLoader {
    type Model;
    type Textures: TextureLoader;

    fn load(
        &mut self,
        path: &str,
        textures: &mut TextureLibrary<Self::Textures>,
    ) -> EngineResult<Self::Model>;
}

pub struct ModelLibrary<L: ModelLoader> {
    loader: L,
    models: Vec<L::Model>,
    paths: Vec<String>,
    indices: HashMap<String, u32>,
    capacity: usize,
}

impl<L: ModelLoader> ModelLibrary<L> {
    pub fn new(loader: L) -> Self {
        Self::with_capacity(loader, MAX_MODEL_COUNT)
    }

    pub fn with_capacity(loader: L, capacity: usize) -> Self {
        Self {
            loader,
            models: Vec::new(),
            paths: Vec::new(),
            indices: HashMap::new(),
            capacity,
        }
    }

    /// Load and register `path`; [`INVALID_MODEL_INDEX`] if it is already registered.
    /// A failed load leaves both libraries as they were.
    pub fn add_model(
        &mut self,
        path: &str,
        textures: &mut TextureLibrary<L::Textures>,
    ) -> EngineResult<u32> {
        if self.models.len() >= self.capacity {
            return Err(EngineError::ModelCapacityExceeded {
                capacity: self.capacity,
            });
        }
        if self.indices.contains_key(path) {
            return Ok(INVALID_MODEL_INDEX);
        }

        // Textures a failed load registered would otherwise stay orphaned.
        let checkpoint = textures.checkpoint();
        let model = match self.loader.load(path, textures) {
            Ok(model) => model,
            Err(e) => {
                textures.rollback(checkpoint);
                return Err(e);
            }
        };
        let index = self.models.len() as u32;
        self.indices.insert(path.to_string(), index);
        self.paths.push(path.to_string());
        self.models.push(model);
        Ok(index)
    }

    /// Index of `path`, loading it first if needed.
    pub fn get_model(
        &mut self,
        path: &str,
        textures: &mut TextureLibrary<L::Textures>,
    ) -> EngineResult<u32> {
        match self.indices.get(path) {
            Some(&index) => Ok(index),
            None => self.add_model(path, textures),
        }
    }

    pub fn find_model(&self, path: &str) -> u32 {
        self.indices.get(path).copied().unwrap_or(INVALID_MODEL_INDEX)
    }

    pub fn model(&self, index: u32) -> Option<&L::Model> {
        self.models.get(index as usize)
    }

    pub fn path_of(&self, index: u32) -> Option<&str> {
        self.paths.get(index as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str, &L::Model)> {
        self.paths
            .iter()
            .zip(&self.models)
            .enumerate()
            .map(|(i, (path, model))| (i as u32, path.as_str(), model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::INVALID_TEXTURE_INDEX;

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

    /// Each model registers a texture named after it plus one embedded texture.
    /// Paths starting with `broken` fail after that.
    #[derive(Default)]
    struct CountingLoader {
        loads: usize,
    }

    impl ModelLoader for CountingLoader {
        type Model = String;
        type Textures = NameLoader;

        fn load(&mut self, path: &str, textures: &mut TextureLibrary<NameLoader>) -> EngineResult<String> {
            self.loads += 1;
            textures.get_or_add_texture(&format!("{path}.png"))?;
            textures.add_texture_from_memory(path.as_bytes())?;
            if path.starts_with("broken") {
                return Err(EngineError::model_import(path, "mesh upload failed"));
            }
            Ok(path.to_string())
        }
    }

    #[test]
    fn test_get_model_is_idempotent() {
        let mut textures = TextureLibrary::new(NameLoader);
        let mut models = ModelLibrary::new(CountingLoader::default());

        let first = models.get_model("cube.obj", &mut textures).unwrap();
        assert_eq!(first, 0);
        assert_eq!(models.get_model("cube.obj", &mut textures).unwrap(), first);
        assert_eq!(models.get_model("ship.glb", &mut textures).unwrap(), 1);

        assert_eq!(models.len(), 2);
        assert_eq!(models.loader.loads, 2);
        // One file texture and one embedded texture per model.
        assert_eq!(textures.len(), 4);
    }

    #[test]
    fn test_add_duplicate_and_find() {
        let mut textures = TextureLibrary::new(NameLoader);
        let mut models = ModelLibrary::new(CountingLoader::default());

        assert_eq!(models.add_model("cube.obj", &mut textures).unwrap(), 0);
        assert_eq!(models.add_model("cube.obj", &mut textures).unwrap(), INVALID_MODEL_INDEX);
        assert_eq!(models.find_model("cube.obj"), 0);
        assert_eq!(models.find_model("missing.obj"), INVALID_MODEL_INDEX);
        assert_eq!(models.model(0).map(String::as_str), Some("cube.obj"));
        assert!(models.model(1).is_none());
    }

    #[test]
    fn test_capacity() {
        let mut textures = TextureLibrary::new(NameLoader);
        let mut models = ModelLibrary::with_capacity(CountingLoader::default(), 1);

        models.get_model("a.obj", &mut textures).unwrap();
        assert!(matches!(
            models.get_model("b.obj", &mut textures),
            Err(EngineError::ModelCapacityExceeded { capacity: 1 })
        ));
        // Known paths still resolve at capacity.
        assert_eq!(models.get_model("a.obj", &mut textures).unwrap(), 0);
        assert_eq!(models.len(), 1);
    }

    #[test]
    fn test_failed_load_leaves_no_textures_behind() {
        let mut textures = TextureLibrary::new(NameLoader);
        let mut models = ModelLibrary::new(CountingLoader::default());
        models.get_model("cube.obj", &mut textures).unwrap();
        assert_eq!(textures.len(), 2);

        let err = models.get_model("broken.obj", &mut textures).unwrap_err();
        assert!(matches!(err, EngineError::ModelImport { .. }));
        assert_eq!(models.len(), 1);
        assert_eq!(models.find_model("broken.obj"), INVALID_MODEL_INDEX);
        assert_eq!(textures.len(), 2);
        assert_eq!(textures.get_texture("broken.obj.png"), INVALID_TEXTURE_INDEX);

        // The next embedded texture reuses the name the failed load had taken.
        assert_eq!(models.get_model("ship.glb", &mut textures).unwrap(), 1);
        assert_eq!(textures.path_of(3), Some("BAKED_IN_1"));
    }
}

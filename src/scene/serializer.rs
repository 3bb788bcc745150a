//! RON scene files
//!
//! Only tagged entities are written. Models are stored by path and resolved
//! back to library indices on load.

use std::path::Path;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::{ModelComponent, PointLightComponent, Scene, Transform};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneFile {
    pub scene: String,
    #[serde(default)]
    pub entities: Vec<EntityRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity: String,
    #[serde(default)]
    pub transform: Option<TransformRecord>,
    #[serde(default)]
    pub model: Option<ModelRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light: Option<LightRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformRecord {
    pub translation: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightRecord {
    pub color: Vec3,
    pub intensity: f32,
    pub radius: f32,
}

impl From<&Transform> for TransformRecord {
    fn from(t: &Transform) -> Self {
        Self {
            translation: t.translation,
            rotation: t.rotation,
            scale: t.scale,
        }
    }
}

impl From<TransformRecord> for Transform {
    fn from(r: TransformRecord) -> Self {
        Transform::new(r.translation, r.rotation, r.scale)
    }
}

impl From<&PointLightComponent> for LightRecord {
    fn from(l: &PointLightComponent) -> Self {
        Self {
            color: l.color,
            intensity: l.intensity,
            radius: l.radius,
        }
    }
}

impl From<LightRecord> for PointLightComponent {
    fn from(r: LightRecord) -> Self {
        Self {
            color: r.color,
            intensity: r.intensity,
            radius: r.radius,
        }
    }
}

pub struct SceneSerializer;

impl SceneSerializer {
    /// Snapshot `scene` into its file representation
    pub fn to_file(scene: &Scene) -> SceneFile {
        let entities = scene
            .tagged_entities()
            .into_iter()
            .map(|(entity, tag)| EntityRecord {
                entity: tag,
                transform: scene.component::<Transform>(entity).ok().map(Into::into),
                model: scene
                    .component::<ModelComponent>(entity)
                    .ok()
                    .map(|m| ModelRecord {
                        model_path: m.path.clone(),
                    }),
                light: scene
                    .component::<PointLightComponent>(entity)
                    .ok()
                    .map(Into::into),
            })
            .collect();

        SceneFile {
            scene: scene.name().to_string(),
            entities,
        }
    }

    pub fn to_ron(scene: &Scene) -> EngineResult<String> {
        ron::ser::to_string_pretty(&Self::to_file(scene), ron::ser::PrettyConfig::default())
            .map_err(|e| EngineError::SceneFormat(e.to_string()))
    }

    pub fn serialize(scene: &Scene, path: impl AsRef<Path>) -> EngineResult<()> {
        let path = path.as_ref();
        let text = Self::to_ron(scene)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        log::info!("Saved scene '{}' to {}", scene.name(), path.display());
        Ok(())
    }

    /// Replace the contents of `scene` with `file`.
    ///
    /// `resolve_model` maps a model path to a library index.
    pub fn load_file<F>(scene: &mut Scene, file: SceneFile, mut resolve_model: F) -> EngineResult<()>
    where
        F: FnMut(&str) -> EngineResult<u32>,
    {
        scene.clear_entities();
        scene.set_name(file.scene);

        for record in file.entities {
            let entity = match record.transform {
                Some(transform) => {
                    let entity = scene.create_entity(record.entity);
                    scene.insert(entity, Transform::from(transform))?;
                    entity
                }
                None => scene.create_empty_entity(record.entity),
            };

            if let Some(model) = record.model {
                let index = resolve_model(&model.model_path)?;
                scene.insert(entity, ModelComponent::with_index(model.model_path, index))?;
            }
            if let Some(light) = record.light {
                scene.insert(entity, PointLightComponent::from(light))?;
            }
        }
        Ok(())
    }

    pub fn from_ron<F>(scene: &mut Scene, text: &str, resolve_model: F) -> EngineResult<()>
    where
        F: FnMut(&str) -> EngineResult<u32>,
    {
        let file: SceneFile =
            ron::from_str(text).map_err(|e| EngineError::SceneFormat(e.to_string()))?;
        Self::load_file(scene, file, resolve_model)
    }

    pub fn deserialize<F>(scene: &mut Scene, path: impl AsRef<Path>, resolve_model: F) -> EngineResult<()>
    where
        F: FnMut(&str) -> EngineResult<u32>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_ron(scene, &text, resolve_model)?;
        log::info!(
            "Loaded scene '{}' ({} entities) from {}",
            scene.name(),
            scene.entity_count(),
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_scene() -> Scene {
        let mut scene = Scene::new("Sample");
        let cube = scene.create_entity("Cube");
        scene
            .component_mut::<Transform>(cube)
            .unwrap()
            .translation = Vec3::new(1.0, 2.0, 3.0);
        scene.insert(cube, ModelComponent::with_index("cube.obj", 0)).unwrap();
        let light = scene.create_entity("Light");
        scene.insert(light, PointLightComponent::default()).unwrap();
        scene.create_empty_entity("Marker");
        scene
    }

    #[test]
    fn test_to_file_shape() {
        let file = SceneSerializer::to_file(&sample_scene());
        assert_eq!(file.scene, "Sample");
        assert_eq!(file.entities.len(), 3);
        assert_eq!(file.entities[0].entity, "Cube");
        assert_eq!(
            file.entities[0].model,
            Some(ModelRecord {
                model_path: "cube.obj".into()
            })
        );
        assert!(file.entities[1].light.is_some());
        assert!(file.entities[2].transform.is_none());
    }

    #[test]
    fn test_load_clears_and_resolves_models() {
        let text = SceneSerializer::to_ron(&sample_scene()).unwrap();

        let mut scene = Scene::new("Other");
        scene.create_entity("Stale");
        let mut resolved = Vec::new();
        SceneSerializer::from_ron(&mut scene, &text, |path| {
            resolved.push(path.to_string());
            Ok(7)
        })
        .unwrap();

        assert_eq!(scene.name(), "Sample");
        assert!(scene.find_by_tag("Stale").is_none());
        assert_eq!(resolved, vec!["cube.obj".to_string()]);

        let cube = scene.find_by_tag("Cube").unwrap();
        assert_eq!(scene.component::<ModelComponent>(cube).unwrap().model_index, 7);
        assert_eq!(
            scene.component::<Transform>(cube).unwrap().translation,
            Vec3::new(1.0, 2.0, 3.0)
        );
        let marker = scene.find_by_tag("Marker").unwrap();
        assert!(!scene.has::<Transform>(marker));
    }

    #[test]
    fn test_malformed_input() {
        let mut scene = Scene::default();
        let err = SceneSerializer::from_ron(&mut scene, "SceneFile(scene: ", |_| Ok(0)).unwrap_err();
        assert!(matches!(err, EngineError::SceneFormat(_)));
    }

    #[test]
    fn test_resolver_error_propagates() {
        let text = SceneSerializer::to_ron(&sample_scene()).unwrap();
        let mut scene = Scene::default();
        let err = SceneSerializer::from_ron(&mut scene, &text, |path| {
            Err(EngineError::model_import(path, "missing"))
        })
        .unwrap_err();
        assert!(matches!(err, EngineError::ModelImport { .. }));
    }
}

//! Scene management
//!
//! A [`Scene`] is a named `bevy_ecs` world. Entities carry a [`Tag`] and
//! usually a [`Transform`]; renderable ones add a [`ModelComponent`] and
//! lights a [`PointLightComponent`].

mod camera;
mod components;
mod serializer;

pub use camera::*;
pub use components::*;
pub use serializer::*;

use bevy_ecs::prelude::*;
use bevy_ecs::world::EntityRef;

use crate::error::{EngineError, EngineResult};

/// Snapshot of what the render systems need from one entity
#[derive(Debug, Clone, PartialEq)]
pub struct Renderable {
    pub entity: Entity,
    pub transform: Transform,
    pub model: Option<ModelComponent>,
}

/// Spawn sequence number. Entity indices get recycled after a despawn, so
/// they can't stand in for creation order.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct CreationOrder(u64);

pub struct Scene {
    name: String,
    world: World,
    next_order: u64,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new("Untitled")
    }
}

/// Sort key for creation order. Entities spawned straight into the world
/// have no sequence number and come last, by index.
fn creation_key(entity: &EntityRef<'_>) -> (u64, u32) {
    let order = entity.get::<CreationOrder>().map_or(u64::MAX, |order| order.0);
    (order, entity.id().index())
}

fn short_type_name<T>() -> &'static str {
    let name = std::any::type_name::<T>();
    name.rsplit("::").next().unwrap_or(name)
}

impl Scene {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            world: World::new(),
            next_order: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    fn next_order(&mut self) -> CreationOrder {
        let order = CreationOrder(self.next_order);
        self.next_order += 1;
        order
    }

    /// Spawn an entity with a tag and a default transform
    pub fn create_entity(&mut self, tag: impl Into<String>) -> Entity {
        let order = self.next_order();
        self.world
            .spawn((Tag(tag.into()), Transform::default(), order))
            .id()
    }

    /// Spawn an entity that only carries a tag
    pub fn create_empty_entity(&mut self, tag: impl Into<String>) -> Entity {
        let order = self.next_order();
        self.world.spawn((Tag(tag.into()), order)).id()
    }

    pub fn destroy_entity(&mut self, entity: Entity) -> bool {
        self.world.despawn(entity)
    }

    pub fn clear_entities(&mut self) {
        self.world.clear_entities();
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.world.entities().contains(entity)
    }

    /// Add or replace a component
    pub fn insert<C: Component>(&mut self, entity: Entity, component: C) -> EngineResult<()> {
        if !self.contains(entity) {
            return Err(EngineError::ComponentAbsent {
                entity: format!("{entity:?}"),
                component: short_type_name::<C>(),
            });
        }
        self.world.entity_mut(entity).insert(component);
        Ok(())
    }

    pub fn has<C: Component>(&self, entity: Entity) -> bool {
        self.world.get::<C>(entity).is_some()
    }

    pub fn component<C: Component>(&self, entity: Entity) -> EngineResult<&C> {
        self.world
            .get::<C>(entity)
            .ok_or_else(|| EngineError::ComponentAbsent {
                entity: format!("{entity:?}"),
                component: short_type_name::<C>(),
            })
    }

    pub fn component_mut<C: Component>(&mut self, entity: Entity) -> EngineResult<Mut<'_, C>> {
        self.world
            .get_mut::<C>(entity)
            .ok_or_else(|| EngineError::ComponentAbsent {
                entity: format!("{entity:?}"),
                component: short_type_name::<C>(),
            })
    }

    pub fn entity_count(&self) -> usize {
        self.world.entities().len() as usize
    }

    /// Tagged entities in creation order
    pub fn tagged_entities(&self) -> Vec<(Entity, String)> {
        let mut entities: Vec<_> = self
            .world
            .iter_entities()
            .filter_map(|entity| {
                let tag = entity.get::<Tag>()?;
                Some((creation_key(&entity), entity.id(), tag.0.clone()))
            })
            .collect();
        entities.sort_by_key(|(key, ..)| *key);
        entities
            .into_iter()
            .map(|(_, entity, tag)| (entity, tag))
            .collect()
    }

    pub fn find_by_tag(&self, tag: &str) -> Option<Entity> {
        self.tagged_entities()
            .into_iter()
            .find(|(_, t)| t == tag)
            .map(|(entity, _)| entity)
    }

    /// Every entity with a transform, in creation order
    pub fn renderables(&self) -> Vec<Renderable> {
        let mut renderables: Vec<_> = self
            .world
            .iter_entities()
            .filter_map(|entity| {
                let transform = *entity.get::<Transform>()?;
                let renderable = Renderable {
                    entity: entity.id(),
                    transform,
                    model: entity.get::<ModelComponent>().cloned(),
                };
                Some((creation_key(&entity), renderable))
            })
            .collect();
        renderables.sort_by_key(|(key, _)| *key);
        renderables.into_iter().map(|(_, renderable)| renderable).collect()
    }

    pub fn point_lights(&self) -> Vec<(Transform, PointLightComponent)> {
        let mut lights: Vec<_> = self
            .world
            .iter_entities()
            .filter_map(|entity| {
                let transform = *entity.get::<Transform>()?;
                let light = *entity.get::<PointLightComponent>()?;
                Some((creation_key(&entity), transform, light))
            })
            .collect();
        lights.sort_by_key(|(key, ..)| *key);
        lights
            .into_iter()
            .map(|(_, transform, light)| (transform, light))
            .collect()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_create_entities() {
        let mut scene = Scene::new("Test");
        let full = scene.create_entity("Cube");
        let empty = scene.create_empty_entity("Marker");

        assert!(scene.has::<Transform>(full));
        assert!(!scene.has::<Transform>(empty));
        assert_eq!(scene.component::<Tag>(empty).unwrap().0, "Marker");
        assert_eq!(scene.entity_count(), 2);
        assert_eq!(scene.find_by_tag("Cube"), Some(full));
    }

    #[test]
    fn test_missing_component_is_an_error() {
        let mut scene = Scene::default();
        let entity = scene.create_empty_entity("Marker");

        let err = scene.component::<ModelComponent>(entity).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ComponentAbsent {
                component: "ModelComponent",
                ..
            }
        ));
        assert!(scene.component_mut::<Transform>(entity).is_err());
    }

    #[test]
    fn test_component_mut_edits_in_place() {
        let mut scene = Scene::default();
        let entity = scene.create_entity("Cube");
        scene.component_mut::<Transform>(entity).unwrap().translation = Vec3::X;
        assert_eq!(scene.component::<Transform>(entity).unwrap().translation, Vec3::X);
    }

    #[test]
    fn test_renderables_and_lights() {
        let mut scene = Scene::default();
        let cube = scene.create_entity("Cube");
        scene.insert(cube, ModelComponent::with_index("cube.obj", 0)).unwrap();
        scene.create_entity("Pivot");
        let light = scene.create_entity("Light");
        scene.insert(light, PointLightComponent::default()).unwrap();
        scene.create_empty_entity("Marker");

        let renderables = scene.renderables();
        assert_eq!(renderables.len(), 3);
        assert_eq!(renderables[0].entity, cube);
        assert_eq!(renderables[0].model.as_ref().map(|m| m.model_index), Some(0));
        assert!(renderables[1].model.is_none());
        assert_eq!(scene.point_lights().len(), 1);
    }

    #[test]
    fn test_destroy_and_clear() {
        let mut scene = Scene::default();
        let a = scene.create_entity("A");
        scene.create_entity("B");

        assert!(scene.destroy_entity(a));
        assert!(!scene.destroy_entity(a));
        assert!(scene.insert(a, Tag("again".into())).is_err());

        scene.clear_entities();
        assert_eq!(scene.entity_count(), 0);
        assert!(scene.tagged_entities().is_empty());
    }

    #[test]
    fn test_recycled_index_keeps_creation_order() {
        let mut scene = Scene::default();
        let first = scene.create_entity("First");
        let second = scene.create_entity("Second");
        assert!(scene.destroy_entity(first));

        // The freed slot is handed to the newest entity.
        let third = scene.create_entity("Third");
        assert_eq!(third.index(), first.index());

        let tags: Vec<_> = scene.tagged_entities().into_iter().map(|(_, tag)| tag).collect();
        assert_eq!(tags, ["Second", "Third"]);
        let order: Vec<_> = scene.renderables().iter().map(|r| r.entity).collect();
        assert_eq!(order, [second, third]);
    }

    #[test]
    fn test_unsequenced_entities_sort_last() {
        let mut scene = Scene::default();
        let raw = scene.world_mut().spawn((Tag("Raw".into()), Transform::default())).id();
        let made = scene.create_entity("Made");

        let order: Vec<_> = scene.renderables().iter().map(|r| r.entity).collect();
        assert_eq!(order, [made, raw]);
    }
}

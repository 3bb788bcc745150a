//! Descriptor set layouts, pools and a small writer for filling sets.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;

use super::device::Device;
use crate::error::{EngineError, EngineResult};

pub struct DescriptorSetLayout {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
    bindings: BTreeMap<u32, vk::DescriptorSetLayoutBinding<'static>>,
}

pub struct DescriptorSetLayoutBuilder {
    device: Arc<Device>,
    bindings: BTreeMap<u32, vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            bindings: BTreeMap::new(),
        }
    }

    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
        count: u32,
    ) -> Self {
        debug_assert!(!self.bindings.contains_key(&binding), "binding {binding} already in use");
        self.bindings.insert(
            binding,
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    pub fn build(self) -> EngineResult<DescriptorSetLayout> {
        let bindings: Vec<_> = self.bindings.values().copied().collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe {
            self.device
                .logical()
                .create_descriptor_set_layout(&layout_info, None)
        }
        .map_err(EngineError::vk("create descriptor set layout"))?;

        Ok(DescriptorSetLayout {
            device: self.device,
            layout,
            bindings: self.bindings,
        })
    }
}

impl DescriptorSetLayout {
    pub fn builder(device: Arc<Device>) -> DescriptorSetLayoutBuilder {
        DescriptorSetLayoutBuilder::new(device)
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    fn binding(&self, binding: u32) -> Option<&vk::DescriptorSetLayoutBinding<'static>> {
        self.bindings.get(&binding)
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .logical()
                .destroy_descriptor_set_layout(self.layout, None)
        };
    }
}

pub struct DescriptorPool {
    device: Arc<Device>,
    pool: vk::DescriptorPool,
}

pub struct DescriptorPoolBuilder {
    device: Arc<Device>,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    max_sets: u32,
    flags: vk::DescriptorPoolCreateFlags,
}

impl DescriptorPoolBuilder {
    pub fn add_pool_size(mut self, ty: vk::DescriptorType, count: u32) -> Self {
        self.pool_sizes.push(vk::DescriptorPoolSize {
            ty,
            descriptor_count: count,
        });
        self
    }

    pub fn pool_flags(mut self, flags: vk::DescriptorPoolCreateFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn max_sets(mut self, count: u32) -> Self {
        self.max_sets = count;
        self
    }

    pub fn build(self) -> EngineResult<DescriptorPool> {
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&self.pool_sizes)
            .max_sets(self.max_sets)
            .flags(self.flags);
        let pool = unsafe { self.device.logical().create_descriptor_pool(&pool_info, None) }
            .map_err(EngineError::vk("create descriptor pool"))?;
        Ok(DescriptorPool {
            device: self.device,
            pool,
        })
    }
}

impl DescriptorPool {
    pub fn builder(device: Arc<Device>) -> DescriptorPoolBuilder {
        DescriptorPoolBuilder {
            device,
            pool_sizes: Vec::new(),
            max_sets: 1000,
            flags: vk::DescriptorPoolCreateFlags::empty(),
        }
    }

    pub fn allocate(&self, layout: &DescriptorSetLayout) -> EngineResult<vk::DescriptorSet> {
        let layouts = [layout.handle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.logical().allocate_descriptor_sets(&alloc_info) }
            .map_err(EngineError::vk("allocate descriptor set"))?;
        Ok(sets[0])
    }

    /// Only valid for pools built with `FREE_DESCRIPTOR_SET`.
    pub fn free(&self, sets: &[vk::DescriptorSet]) -> EngineResult<()> {
        unsafe { self.device.logical().free_descriptor_sets(self.pool, sets) }
            .map_err(EngineError::vk("free descriptor sets"))
    }

    pub fn reset(&self) -> EngineResult<()> {
        unsafe {
            self.device
                .logical()
                .reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())
        }
        .map_err(EngineError::vk("reset descriptor pool"))
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe { self.device.logical().destroy_descriptor_pool(self.pool, None) };
    }
}

enum PendingWrite<'a> {
    Buffer(u32, &'a [vk::DescriptorBufferInfo]),
    Image(u32, &'a [vk::DescriptorImageInfo]),
}

/// Collects writes against a layout and applies them to one set.
pub struct DescriptorWriter<'a> {
    layout: &'a DescriptorSetLayout,
    writes: Vec<PendingWrite<'a>>,
}

impl<'a> DescriptorWriter<'a> {
    pub fn new(layout: &'a DescriptorSetLayout) -> Self {
        Self {
            layout,
            writes: Vec::new(),
        }
    }

    pub fn write_buffer(mut self, binding: u32, infos: &'a [vk::DescriptorBufferInfo]) -> Self {
        self.writes.push(PendingWrite::Buffer(binding, infos));
        self
    }

    pub fn write_images(mut self, binding: u32, infos: &'a [vk::DescriptorImageInfo]) -> Self {
        self.writes.push(PendingWrite::Image(binding, infos));
        self
    }

    /// Allocate a set from `pool` and fill it.
    pub fn build(self, pool: &DescriptorPool) -> EngineResult<vk::DescriptorSet> {
        let set = pool.allocate(self.layout)?;
        self.overwrite(set)?;
        Ok(set)
    }

    /// Apply the collected writes to an existing set.
    pub fn overwrite(self, set: vk::DescriptorSet) -> EngineResult<()> {
        let mut writes = Vec::with_capacity(self.writes.len());
        for pending in &self.writes {
            let (binding, count) = match pending {
                PendingWrite::Buffer(b, infos) => (*b, infos.len()),
                PendingWrite::Image(b, infos) => (*b, infos.len()),
            };
            let description = self.layout.binding(binding).ok_or_else(|| {
                EngineError::Initialization(format!("Layout has no binding {binding}"))
            })?;
            if count as u32 > description.descriptor_count {
                return Err(EngineError::Initialization(format!(
                    "Binding {binding} holds {} descriptors, got {count}",
                    description.descriptor_count
                )));
            }

            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding)
                .descriptor_type(description.descriptor_type);
            writes.push(match pending {
                PendingWrite::Buffer(_, infos) => write.buffer_info(infos),
                PendingWrite::Image(_, infos) => write.image_info(infos),
            });
        }

        unsafe {
            self.layout
                .device
                .logical()
                .update_descriptor_sets(&writes, &[])
        };
        Ok(())
    }
}

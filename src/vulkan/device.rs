//! Vulkan device context
//!
//! [`Device`] owns the instance, surface, physical and logical device, the
//! graphics/present queues, the shared command pool and the GPU memory
//! allocator. It is created once, wrapped in an `Arc`, and every GPU resource
//! keeps a clone so the device is always the last thing to go.

use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use ash::khr::{surface, swapchain};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::{Mutex, MutexGuard};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use super::instance::{self, DebugMessenger};
use crate::error::{EngineError, EngineResult};

/// Queue family indices used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

impl QueueFamilies {
    pub fn is_shared(&self) -> bool {
        self.graphics == self.present
    }

    /// Pick queue families from `(supports_graphics, supports_present)` flags per family.
    ///
    /// A single family that can do both wins; otherwise the first of each is used.
    pub fn select(families: &[(bool, bool)]) -> Option<Self> {
        if let Some(index) = families.iter().position(|&(g, p)| g && p) {
            return Some(Self {
                graphics: index as u32,
                present: index as u32,
            });
        }
        let graphics = families.iter().position(|&(g, _)| g)?;
        let present = families.iter().position(|&(_, p)| p)?;
        Some(Self {
            graphics: graphics as u32,
            present: present as u32,
        })
    }
}

/// Optional device features that were actually enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnabledFeatures {
    pub sampler_anisotropy: bool,
    pub fill_mode_non_solid: bool,
}

/// Surface capabilities, formats and present modes.
pub struct SwapchainSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// The Vulkan device context.
pub struct Device {
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<DebugMessenger>,
    surface_fn: surface::Instance,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    features: EnabledFeatures,
    device: ash::Device,
    swapchain_fn: swapchain::Device,
    queue_families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    command_pool: Mutex<vk::CommandPool>,
    allocator: ManuallyDrop<Mutex<Allocator>>,
}

impl Device {
    /// Create the device context for a window.
    pub fn new<W>(window: &W, app_name: &str, enable_validation: bool) -> EngineResult<Arc<Self>>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| EngineError::Initialization(format!("Failed to load Vulkan: {e}")))?;

        let display = window
            .display_handle()
            .map_err(|e| EngineError::Initialization(e.to_string()))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| EngineError::Initialization(e.to_string()))?
            .as_raw();

        let (instance, debug_messenger) =
            instance::create_instance(&entry, app_name, display, enable_validation)?;

        let surface_fn = surface::Instance::new(&entry, &instance);
        let surface =
            unsafe { ash_window::create_surface(&entry, &instance, display, window_handle, None) }
                .map_err(EngineError::vk("create window surface"))?;

        let (physical_device, queue_families) =
            select_physical_device(&instance, &surface_fn, surface)?;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let supported = unsafe { instance.get_physical_device_features(physical_device) };

        let features = EnabledFeatures {
            sampler_anisotropy: supported.sampler_anisotropy == vk::TRUE,
            fill_mode_non_solid: supported.fill_mode_non_solid == vk::TRUE,
        };
        if supported.shader_sampled_image_array_dynamic_indexing == vk::FALSE {
            log::warn!("GPU lacks dynamic indexing of sampled image arrays; texture lookups may misbehave");
        }

        let device = create_logical_device(&instance, physical_device, queue_families, &supported)?;
        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };
        let swapchain_fn = swapchain::Device::new(&instance, &device);

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_families.graphics)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }
            .map_err(EngineError::vk("create command pool"))?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!(
            "Created Vulkan device on {:?} (graphics family {}, present family {})",
            device_name,
            queue_families.graphics,
            queue_families.present
        );

        Ok(Arc::new(Self {
            _entry: entry,
            instance,
            debug_messenger,
            surface_fn,
            surface,
            physical_device,
            properties,
            features,
            device,
            swapchain_fn,
            queue_families,
            graphics_queue,
            present_queue,
            command_pool: Mutex::new(command_pool),
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
        }))
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// The logical device function table.
    pub fn logical(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    pub fn swapchain_fn(&self) -> &swapchain::Device {
        &self.swapchain_fn
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.present_queue
    }

    pub fn queue_families(&self) -> QueueFamilies {
        self.queue_families
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn features(&self) -> EnabledFeatures {
        self.features
    }

    /// Lock the shared allocator.
    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    /// Run `f` with exclusive access to the command pool.
    pub fn with_command_pool<R>(&self, f: impl FnOnce(vk::CommandPool) -> R) -> R {
        let pool = self.command_pool.lock();
        f(*pool)
    }

    pub fn swapchain_support(&self) -> EngineResult<SwapchainSupport> {
        query_swapchain_support(&self.surface_fn, self.physical_device, self.surface)
    }

    pub fn format_properties(&self, format: vk::Format) -> vk::FormatProperties {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format)
        }
    }

    /// First candidate format whose tiling supports `features`.
    pub fn find_supported_format(
        &self,
        candidates: &[vk::Format],
        tiling: vk::ImageTiling,
        features: vk::FormatFeatureFlags,
    ) -> EngineResult<vk::Format> {
        candidates
            .iter()
            .copied()
            .find(|&format| {
                let props = self.format_properties(format);
                match tiling {
                    vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
                    vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
                    _ => false,
                }
            })
            .ok_or_else(|| EngineError::Initialization("Failed to find supported format".into()))
    }

    pub fn find_depth_format(&self) -> EngineResult<vk::Format> {
        self.find_supported_format(
            &[
                vk::Format::D32_SFLOAT,
                vk::Format::D32_SFLOAT_S8_UINT,
                vk::Format::D24_UNORM_S8_UINT,
            ],
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )
    }

    /// Create a buffer and bind freshly allocated memory to it.
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> EngineResult<(vk::Buffer, Allocation)> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(EngineError::vk("create buffer"))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = self.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.free_allocation(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(EngineError::vk("bind buffer memory")(e));
        }

        Ok((buffer, allocation))
    }

    /// Create an image and bind freshly allocated memory to it.
    pub fn create_image(
        &self,
        image_info: &vk::ImageCreateInfo<'_>,
        location: MemoryLocation,
        name: &str,
    ) -> EngineResult<(vk::Image, Allocation)> {
        let image = unsafe { self.device.create_image(image_info, None) }
            .map_err(EngineError::vk("create image"))?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = self.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: image_info.tiling == vk::ImageTiling::LINEAR,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e.into());
            }
        };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            self.free_allocation(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(EngineError::vk("bind image memory")(e));
        }

        Ok((image, allocation))
    }

    /// Return an allocation to the allocator.
    pub fn free_allocation(&self, allocation: Allocation) {
        if let Err(e) = self.allocator().free(allocation) {
            log::warn!("Failed to free GPU allocation: {e}");
        }
    }

    /// Allocate and begin a one-shot primary command buffer.
    pub fn begin_single_time_commands(&self) -> EngineResult<vk::CommandBuffer> {
        let command_buffer = self.with_command_pool(|pool| {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            unsafe { self.device.allocate_command_buffers(&alloc_info) }
        })
        .map_err(EngineError::vk("allocate single-time command buffer"))?[0];

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
            .map_err(EngineError::vk("begin single-time command buffer"))?;

        Ok(command_buffer)
    }

    /// End, submit and wait for a one-shot command buffer, then free it.
    pub fn end_single_time_commands(&self, command_buffer: vk::CommandBuffer) -> EngineResult<()> {
        self.with_command_pool(|pool| {
            let result = unsafe {
                self.device
                    .end_command_buffer(command_buffer)
                    .map_err(EngineError::vk("end single-time command buffer"))
                    .and_then(|_| {
                        let command_buffers = [command_buffer];
                        let submit_info =
                            vk::SubmitInfo::default().command_buffers(&command_buffers);
                        self.device
                            .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())
                            .map_err(EngineError::vk("submit single-time command buffer"))
                    })
                    .and_then(|_| {
                        self.device
                            .queue_wait_idle(self.graphics_queue)
                            .map_err(EngineError::vk("wait for graphics queue"))
                    })
            };
            unsafe { self.device.free_command_buffers(pool, &[command_buffer]) };
            result
        })
    }

    /// Record commands with `record` and run them synchronously on the graphics queue.
    pub fn one_time_submit(&self, record: impl FnOnce(vk::CommandBuffer)) -> EngineResult<()> {
        let command_buffer = self.begin_single_time_commands()?;
        record(command_buffer);
        self.end_single_time_commands(command_buffer)
    }

    pub fn copy_buffer(
        &self,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) -> EngineResult<()> {
        self.one_time_submit(|cmd| {
            let region = vk::BufferCopy::default().size(size);
            unsafe { self.device.cmd_copy_buffer(cmd, src, dst, &[region]) };
        })
    }

    /// Copy tightly packed pixels from `buffer` into mip 0 of `image` (in TRANSFER_DST layout).
    pub fn copy_buffer_to_image(
        &self,
        buffer: vk::Buffer,
        image: vk::Image,
        width: u32,
        height: u32,
        layer_count: u32,
    ) -> EngineResult<()> {
        self.one_time_submit(|cmd| {
            let region = vk::BufferImageCopy::default()
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(layer_count),
                )
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                });
            unsafe {
                self.device.cmd_copy_buffer_to_image(
                    cmd,
                    buffer,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                )
            };
        })
    }

    pub fn wait_idle(&self) -> EngineResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(EngineError::vk("wait for device idle"))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            // The allocator frees its memory blocks through the device, so it goes first.
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_command_pool(*self.command_pool.get_mut(), None);
            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            if let Some(messenger) = &self.debug_messenger {
                messenger.destroy();
            }
            self.instance.destroy_instance(None);
        }
        log::info!("Vulkan device destroyed");
    }
}

fn query_swapchain_support(
    surface_fn: &surface::Instance,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> EngineResult<SwapchainSupport> {
    unsafe {
        Ok(SwapchainSupport {
            capabilities: surface_fn
                .get_physical_device_surface_capabilities(physical_device, surface)
                .map_err(EngineError::vk("query surface capabilities"))?,
            formats: surface_fn
                .get_physical_device_surface_formats(physical_device, surface)
                .map_err(EngineError::vk("query surface formats"))?,
            present_modes: surface_fn
                .get_physical_device_surface_present_modes(physical_device, surface)
                .map_err(EngineError::vk("query surface present modes"))?,
        })
    }
}

fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    surface_fn: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Option<QueueFamilies> {
    let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let flags: Vec<(bool, bool)> = families
        .iter()
        .enumerate()
        .map(|(index, family)| {
            let graphics = family.queue_count > 0
                && family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let present = unsafe {
                surface_fn
                    .get_physical_device_surface_support(physical_device, index as u32, surface)
                    .unwrap_or(false)
            };
            (graphics, present)
        })
        .collect();
    QueueFamilies::select(&flags)
}

fn supports_swapchain_extension(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> bool {
    let Ok(extensions) =
        (unsafe { instance.enumerate_device_extension_properties(physical_device) })
    else {
        return false;
    };
    extensions.iter().any(|ext| {
        let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
        name == swapchain::NAME
    })
}

/// Pick the highest scoring GPU that can render and present to `surface`.
fn select_physical_device(
    instance: &ash::Instance,
    surface_fn: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> EngineResult<(vk::PhysicalDevice, QueueFamilies)> {
    let devices = unsafe { instance.enumerate_physical_devices() }
        .map_err(EngineError::vk("enumerate physical devices"))?;
    if devices.is_empty() {
        return Err(EngineError::Initialization(
            "No Vulkan-capable GPU found".to_string(),
        ));
    }

    let mut best: Option<(u32, vk::PhysicalDevice, QueueFamilies)> = None;
    for physical_device in devices {
        let Some(families) = find_queue_families(instance, physical_device, surface_fn, surface)
        else {
            continue;
        };
        if !supports_swapchain_extension(instance, physical_device) {
            continue;
        }
        let adequate = query_swapchain_support(surface_fn, physical_device, surface)
            .map(|support| !support.formats.is_empty() && !support.present_modes.is_empty())
            .unwrap_or(false);
        if !adequate {
            continue;
        }

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let mut score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        };
        score += properties.limits.max_image_dimension2_d / 1024;

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!(
            "Found GPU: {:?} (type: {:?}, score: {})",
            device_name,
            properties.device_type,
            score
        );

        if best.map_or(true, |(best_score, ..)| score > best_score) {
            best = Some((score, physical_device, families));
        }
    }

    best.map(|(_, physical_device, families)| (physical_device, families))
        .ok_or_else(|| EngineError::Initialization("No suitable GPU found".to_string()))
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: QueueFamilies,
    supported: &vk::PhysicalDeviceFeatures,
) -> EngineResult<ash::Device> {
    let queue_priorities = [1.0f32];
    let mut queue_infos = vec![vk::DeviceQueueCreateInfo::default()
        .queue_family_index(families.graphics)
        .queue_priorities(&queue_priorities)];
    if !families.is_shared() {
        queue_infos.push(
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(families.present)
                .queue_priorities(&queue_priorities),
        );
    }

    #[allow(unused_mut)]
    let mut device_extensions = vec![swapchain::NAME.as_ptr()];
    #[cfg(target_os = "macos")]
    device_extensions.push(ash::khr::portability_subset::NAME.as_ptr());

    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(supported.sampler_anisotropy == vk::TRUE)
        .fill_mode_non_solid(supported.fill_mode_non_solid == vk::TRUE)
        .shader_sampled_image_array_dynamic_indexing(
            supported.shader_sampled_image_array_dynamic_indexing == vk::TRUE,
        );

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&device_extensions)
        .enabled_features(&features);

    unsafe { instance.create_device(physical_device, &create_info, None) }
        .map_err(EngineError::vk("create logical device"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_family_prefers_shared_family() {
        let families = [(true, false), (false, true), (true, true)];
        let selected = QueueFamilies::select(&families).unwrap();
        assert_eq!(selected.graphics, 2);
        assert_eq!(selected.present, 2);
        assert!(selected.is_shared());
    }

    #[test]
    fn test_queue_family_falls_back_to_separate_families() {
        let families = [(false, true), (true, false)];
        let selected = QueueFamilies::select(&families).unwrap();
        assert_eq!(selected.graphics, 1);
        assert_eq!(selected.present, 0);
        assert!(!selected.is_shared());
    }

    #[test]
    fn test_queue_family_requires_both_capabilities() {
        assert!(QueueFamilies::select(&[(true, false)]).is_none());
        assert!(QueueFamilies::select(&[(false, true)]).is_none());
        assert!(QueueFamilies::select(&[]).is_none());
    }
}

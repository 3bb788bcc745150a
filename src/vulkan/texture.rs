//! Sampled 2D textures with a full mip chain.

use std::path::Path;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use image::DynamicImage;

use super::buffer::Buffer;
use super::device::Device;
use crate::error::{EngineError, EngineResult};

const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Number of mip levels for a `width` x `height` image.
pub fn mip_levels_for(width: u32, height: u32) -> u32 {
    width.max(height).max(1).ilog2() + 1
}

/// Decoded RGBA8 pixels ready for upload.
#[derive(Debug)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let image = image::open(path).map_err(|source| EngineError::ImageDecode {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::from_image(image))
    }

    pub fn from_memory(name: &str, bytes: &[u8]) -> EngineResult<Self> {
        let image = image::load_from_memory(bytes).map_err(|source| EngineError::ImageDecode {
            path: name.to_string(),
            source,
        })?;
        Ok(Self::from_image(image))
    }

    fn from_image(image: DynamicImage) -> Self {
        let rgba = image.to_rgba8();
        Self {
            width: rgba.width(),
            height: rgba.height(),
            pixels: rgba.into_raw(),
        }
    }
}

/// A GPU image with view and sampler, immutable once built.
pub struct Texture {
    device: Arc<Device>,
    path: String,
    image: vk::Image,
    allocation: Option<Allocation>,
    view: vk::ImageView,
    sampler: vk::Sampler,
    width: u32,
    height: u32,
    mip_levels: u32,
}

impl Texture {
    pub fn from_file(device: Arc<Device>, path: &str) -> EngineResult<Self> {
        let data = TextureData::from_file(Path::new(path))?;
        Self::from_data(device, path, &data)
    }

    pub fn from_memory(device: Arc<Device>, name: &str, bytes: &[u8]) -> EngineResult<Self> {
        let data = TextureData::from_memory(name, bytes)?;
        Self::from_data(device, name, &data)
    }

    /// Upload decoded pixels, build the mip chain and create the view and sampler.
    pub fn from_data(device: Arc<Device>, path: &str, data: &TextureData) -> EngineResult<Self> {
        let mip_levels = mip_levels_for(data.width, data.height);

        let mut staging = Buffer::new(
            device.clone(),
            data.pixels.len() as vk::DeviceSize,
            1,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            1,
        )?;
        staging.map()?;
        staging.write_to_buffer(&data.pixels, 0)?;
        staging.flush(vk::WHOLE_SIZE, 0)?;

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: data.width,
                height: data.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(1)
            .format(TEXTURE_FORMAT)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(
                vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
            )
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let (image, allocation) = device.create_image(&image_info, MemoryLocation::GpuOnly, path)?;

        // From here on the texture owns the image, so early returns clean up through Drop.
        let mut texture = Self {
            device: device.clone(),
            path: path.to_string(),
            image,
            allocation: Some(allocation),
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            width: data.width,
            height: data.height,
            mip_levels,
        };

        texture.transition_to_transfer_dst()?;
        device.copy_buffer_to_image(staging.handle(), image, data.width, data.height, 1)?;
        texture.generate_mipmaps()?;
        texture.view = texture.create_view()?;
        texture.sampler = texture.create_sampler()?;

        log::info!(
            "Loaded texture '{}' ({}x{}, {} mips)",
            path,
            data.width,
            data.height,
            mip_levels
        );
        Ok(texture)
    }

    fn subresource_range(&self, base_mip_level: u32, level_count: u32) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(base_mip_level)
            .level_count(level_count)
            .base_array_layer(0)
            .layer_count(1)
    }

    fn transition_to_transfer_dst(&self) -> EngineResult<()> {
        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(self.subresource_range(0, self.mip_levels))
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE);

        self.device.one_time_submit(|cmd| unsafe {
            self.device.logical().cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        })
    }

    /// Blit each level from the previous one and leave every level in SHADER_READ_ONLY.
    fn generate_mipmaps(&self) -> EngineResult<()> {
        let props = self.device.format_properties(TEXTURE_FORMAT);
        if !props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        {
            return Err(EngineError::Initialization(
                "texture image format does not support linear blitting".into(),
            ));
        }

        let device = self.device.logical();
        self.device.one_time_submit(|cmd| unsafe {
            let mut mip_width = self.width as i32;
            let mut mip_height = self.height as i32;

            for level in 1..self.mip_levels {
                let to_src = vk::ImageMemoryBarrier::default()
                    .image(self.image)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .subresource_range(self.subresource_range(level - 1, 1))
                    .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                    .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::TRANSFER_READ);
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_src],
                );

                let next_width = (mip_width / 2).max(1);
                let next_height = (mip_height / 2).max(1);
                let blit = vk::ImageBlit::default()
                    .src_offsets([
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: mip_width,
                            y: mip_height,
                            z: 1,
                        },
                    ])
                    .src_subresource(
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .mip_level(level - 1)
                            .base_array_layer(0)
                            .layer_count(1),
                    )
                    .dst_offsets([
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D {
                            x: next_width,
                            y: next_height,
                            z: 1,
                        },
                    ])
                    .dst_subresource(
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .mip_level(level)
                            .base_array_layer(0)
                            .layer_count(1),
                    );
                device.cmd_blit_image(
                    cmd,
                    self.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );

                let to_shader = vk::ImageMemoryBarrier::default()
                    .image(self.image)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .subresource_range(self.subresource_range(level - 1, 1))
                    .old_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                    .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .src_access_mask(vk::AccessFlags::TRANSFER_READ)
                    .dst_access_mask(vk::AccessFlags::SHADER_READ);
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_shader],
                );

                mip_width = next_width;
                mip_height = next_height;
            }

            let last = vk::ImageMemoryBarrier::default()
                .image(self.image)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .subresource_range(self.subresource_range(self.mip_levels - 1, 1))
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[last],
            );
        })
    }

    fn create_view(&self) -> EngineResult<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(TEXTURE_FORMAT)
            .subresource_range(self.subresource_range(0, self.mip_levels));
        unsafe { self.device.logical().create_image_view(&view_info, None) }
            .map_err(EngineError::vk("create texture image view"))
    }

    fn create_sampler(&self) -> EngineResult<vk::Sampler> {
        let anisotropy = self.device.features().sampler_anisotropy;
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(anisotropy)
            .max_anisotropy(if anisotropy {
                self.device.properties().limits.max_sampler_anisotropy
            } else {
                1.0
            })
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(self.mip_levels as f32);
        unsafe { self.device.logical().create_sampler(&sampler_info, None) }
            .map_err(EngineError::vk("create texture sampler"))
    }

    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn image_view(&self) -> vk::ImageView {
        self.view
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        let device = self.device.logical();
        unsafe {
            device.destroy_sampler(self.sampler, None);
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            self.device.free_allocation(allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_levels() {
        assert_eq!(mip_levels_for(1, 1), 1);
        assert_eq!(mip_levels_for(2, 1), 2);
        assert_eq!(mip_levels_for(512, 512), 10);
        assert_eq!(mip_levels_for(1024, 300), 11);
        assert_eq!(mip_levels_for(300, 1023), 10);
    }

    #[test]
    fn test_decode_from_memory() {
        let mut bytes = Vec::new();
        let image = image::RgbaImage::from_pixel(4, 2, image::Rgba([255, 0, 0, 255]));
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
            .unwrap();

        let data = TextureData::from_memory("BAKED_IN_0", &bytes).unwrap();
        assert_eq!((data.width, data.height), (4, 2));
        assert_eq!(data.pixels.len(), 4 * 2 * 4);
        assert_eq!(&data.pixels[..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_decode_garbage_reports_name() {
        let err = TextureData::from_memory("BAKED_IN_7", b"not an image").unwrap_err();
        assert!(err.to_string().contains("BAKED_IN_7"));
    }
}

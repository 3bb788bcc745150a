//! GPU buffer with a fixed element layout.
//!
//! A [`Buffer`] holds `instance_count` elements of `instance_size` bytes, each
//! padded to `alignment_size` so that individual elements can be bound as
//! dynamic offsets or flushed on their own.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;

use super::device::Device;
use crate::error::{EngineError, EngineResult};

/// RAII wrapper over a `vk::Buffer` and its allocation.
pub struct Buffer {
    device: Arc<Device>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    mapped: bool,
    instance_size: vk::DeviceSize,
    instance_count: u32,
    alignment_size: vk::DeviceSize,
    buffer_size: vk::DeviceSize,
}

impl Buffer {
    /// Smallest multiple of `min_offset_alignment` that fits `instance_size`.
    pub fn get_alignment(
        instance_size: vk::DeviceSize,
        min_offset_alignment: vk::DeviceSize,
    ) -> vk::DeviceSize {
        if min_offset_alignment > 0 {
            (instance_size + min_offset_alignment - 1) & !(min_offset_alignment - 1)
        } else {
            instance_size
        }
    }

    pub fn new(
        device: Arc<Device>,
        instance_size: vk::DeviceSize,
        instance_count: u32,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        min_offset_alignment: vk::DeviceSize,
    ) -> EngineResult<Self> {
        let alignment_size = Self::get_alignment(instance_size, min_offset_alignment);
        let buffer_size = alignment_size * instance_count as vk::DeviceSize;
        let (buffer, allocation) = device.create_buffer(buffer_size, usage, location, "buffer")?;

        Ok(Self {
            device,
            buffer,
            allocation: Some(allocation),
            mapped: false,
            instance_size,
            instance_count,
            alignment_size,
            buffer_size,
        })
    }

    /// A uniform buffer per element, aligned to the device's UBO offset alignment.
    pub fn uniform(device: Arc<Device>, instance_size: usize, instance_count: u32) -> EngineResult<Self> {
        let alignment = device.properties().limits.min_uniform_buffer_offset_alignment;
        Self::new(
            device,
            instance_size as vk::DeviceSize,
            instance_count,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
            alignment,
        )
    }

    /// Create a device-local buffer filled from `bytes` through a staging buffer.
    pub fn upload_via_staging(
        device: Arc<Device>,
        bytes: &[u8],
        instance_size: vk::DeviceSize,
        instance_count: u32,
        usage: vk::BufferUsageFlags,
    ) -> EngineResult<Self> {
        let mut staging = Self::new(
            device.clone(),
            instance_size,
            instance_count,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            1,
        )?;
        staging.map()?;
        staging.write_to_buffer(bytes, 0)?;
        staging.flush(vk::WHOLE_SIZE, 0)?;

        let target = Self::new(
            device.clone(),
            instance_size,
            instance_count,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            1,
        )?;
        device.copy_buffer(staging.handle(), target.handle(), target.buffer_size)?;
        Ok(target)
    }

    /// Expose the persistently mapped range for writes.
    pub fn map(&mut self) -> EngineResult<()> {
        let host_visible = self
            .allocation
            .as_ref()
            .is_some_and(|allocation| allocation.mapped_ptr().is_some());
        if !host_visible {
            return Err(EngineError::BufferNotMapped);
        }
        self.mapped = true;
        Ok(())
    }

    pub fn unmap(&mut self) {
        self.mapped = false;
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    fn mapped_slice(&mut self) -> EngineResult<&mut [u8]> {
        if !self.mapped {
            return Err(EngineError::BufferNotMapped);
        }
        self.allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or(EngineError::BufferNotMapped)
    }

    /// Copy `data` into the mapped range starting at `offset`.
    pub fn write_to_buffer(&mut self, data: &[u8], offset: vk::DeviceSize) -> EngineResult<()> {
        let size = self.buffer_size;
        let end = offset + data.len() as vk::DeviceSize;
        if end > size {
            return Err(EngineError::BufferWriteOutOfRange {
                offset,
                len: data.len() as u64,
                size,
            });
        }
        let slice = self.mapped_slice()?;
        slice[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// Write one element at `index * alignment_size`.
    pub fn write_to_index(&mut self, data: &[u8], index: u32) -> EngineResult<()> {
        self.write_to_buffer(data, index as vk::DeviceSize * self.alignment_size)
    }

    pub fn write_object<T: bytemuck::Pod>(&mut self, value: &T) -> EngineResult<()> {
        self.write_to_buffer(bytemuck::bytes_of(value), 0)
    }

    fn mapped_memory_range(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> EngineResult<vk::MappedMemoryRange<'static>> {
        let allocation = self.allocation.as_ref().ok_or(EngineError::BufferNotMapped)?;
        let atom = self.device.properties().limits.non_coherent_atom_size;
        let (offset, size) = aligned_range(allocation.offset(), self.buffer_size, offset, size, atom);
        // SAFETY: the memory handle is owned by the allocator and outlives this buffer
        let memory = unsafe { allocation.memory() };
        Ok(vk::MappedMemoryRange::default()
            .memory(memory)
            .offset(offset)
            .size(size))
    }

    /// Make host writes visible to the device.
    pub fn flush(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> EngineResult<()> {
        let range = self.mapped_memory_range(size, offset)?;
        unsafe { self.device.logical().flush_mapped_memory_ranges(&[range]) }
            .map_err(EngineError::vk("flush mapped memory"))
    }

    /// Make device writes visible to the host.
    pub fn invalidate(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> EngineResult<()> {
        let range = self.mapped_memory_range(size, offset)?;
        unsafe { self.device.logical().invalidate_mapped_memory_ranges(&[range]) }
            .map_err(EngineError::vk("invalidate mapped memory"))
    }

    pub fn flush_index(&self, index: u32) -> EngineResult<()> {
        self.flush(self.alignment_size, index as vk::DeviceSize * self.alignment_size)
    }

    pub fn invalidate_index(&self, index: u32) -> EngineResult<()> {
        self.invalidate(self.alignment_size, index as vk::DeviceSize * self.alignment_size)
    }

    pub fn descriptor_info(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer,
            offset,
            range: size,
        }
    }

    pub fn descriptor_info_for_index(&self, index: u32) -> vk::DescriptorBufferInfo {
        self.descriptor_info(self.alignment_size, index as vk::DeviceSize * self.alignment_size)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn instance_size(&self) -> vk::DeviceSize {
        self.instance_size
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn alignment_size(&self) -> vk::DeviceSize {
        self.alignment_size
    }

    pub fn buffer_size(&self) -> vk::DeviceSize {
        self.buffer_size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.mapped = false;
        if let Some(allocation) = self.allocation.take() {
            self.device.free_allocation(allocation);
        }
        unsafe { self.device.logical().destroy_buffer(self.buffer, None) };
    }
}

/// Translate a buffer-relative range into a memory-object range aligned to `atom`.
///
/// `WHOLE_SIZE` covers the rest of the buffer, never the rest of the shared memory block.
fn aligned_range(
    allocation_offset: vk::DeviceSize,
    buffer_size: vk::DeviceSize,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    atom: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let size = if size == vk::WHOLE_SIZE {
        buffer_size.saturating_sub(offset)
    } else {
        size
    };
    let atom = atom.max(1);
    let start = allocation_offset + offset;
    let end = start + size;
    let aligned_start = start / atom * atom;
    let aligned_end = end.div_ceil(atom) * atom;
    (aligned_start, aligned_end - aligned_start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(100, 0, 100)]
    #[case(100, 1, 100)]
    #[case(100, 64, 128)]
    #[case(256, 256, 256)]
    #[case(257, 256, 512)]
    #[case(6400, 64, 6400)]
    fn test_alignment(#[case] size: u64, #[case] min_align: u64, #[case] expected: u64) {
        assert_eq!(Buffer::get_alignment(size, min_align), expected);
    }

    #[test]
    fn test_whole_size_range_is_clamped_to_buffer() {
        let (offset, size) = aligned_range(512, 300, 0, vk::WHOLE_SIZE, 64);
        assert_eq!(offset, 512);
        assert_eq!(size, 320);
    }

    #[test]
    fn test_partial_range_is_atom_aligned() {
        let (offset, size) = aligned_range(1000, 4096, 10, 20, 64);
        assert_eq!(offset % 64, 0);
        assert!(offset <= 1010);
        assert!(offset + size >= 1030);
        assert_eq!(size % 64, 0);
    }
}

//! Native API seam
//!
//! [`Driver`] is the one interface every native GPU/compute API implements.
//! Only one driver is active per process, so backends are generic over it
//! rather than dispatching through trait objects.

#[cfg(not(target_arch = "wasm32"))]
pub mod wgpu;
#[cfg(any(test, feature = "synthetic"))]
pub mod synthetic;

use crate::caps::CapabilitySet;
use crate::error::DriverError;
use crate::{ApiVersion, PhysicalDeviceType};
use std::fmt;
use std::ops::BitOr;
use std::ptr::NonNull;
use std::slice;

/// Capabilities and layers enabled on instance creation.
#[derive(Debug, Clone, Default)]
pub struct InstanceDesc {
    pub application_name: &'static str,
    pub extensions: CapabilitySet,
    pub layers: CapabilitySet,
    pub enumerate_portability: bool,
}

/// Static properties of a physical device.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceProperties {
    pub name: String,
    pub vendor_id: u32,
    pub device_type: PhysicalDeviceType,
    pub api_version: ApiVersion,
    /// Bitmask of supported framebuffer color sample counts (`1 << log2(n)`).
    pub color_sample_counts: u32,
    pub depth_sample_counts: u32,
}

/// Roles a queue family can serve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamily {
    pub graphics: bool,
    pub compute: bool,
    pub present: bool,
    pub queue_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: u64,
    pub device_local: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryPropertyFlags(u32);

impl MemoryPropertyFlags {
    pub const DEVICE_LOCAL: Self = Self(1 << 0);
    pub const HOST_VISIBLE: Self = Self(1 << 1);
    pub const HOST_COHERENT: Self = Self(1 << 2);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MemoryPropertyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryType {
    pub flags: MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryProperties {
    pub heaps: Vec<MemoryHeap>,
    pub types: Vec<MemoryType>,
}

/// Logical device creation parameters.
#[derive(Debug, Clone)]
pub struct DeviceDesc {
    /// One queue is created per unique family.
    pub queue_families: Vec<u32>,
    pub extensions: CapabilitySet,
    pub layers: CapabilitySet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
    UniformBuffer,
    StorageBuffer,
    UniformBufferDynamic,
    StorageBufferDynamic,
    InputAttachment,
}

impl DescriptorType {
    pub const ALL: [DescriptorType; 11] = [
        DescriptorType::Sampler,
        DescriptorType::CombinedImageSampler,
        DescriptorType::SampledImage,
        DescriptorType::StorageImage,
        DescriptorType::UniformTexelBuffer,
        DescriptorType::StorageTexelBuffer,
        DescriptorType::UniformBuffer,
        DescriptorType::StorageBuffer,
        DescriptorType::UniformBufferDynamic,
        DescriptorType::StorageBufferDynamic,
        DescriptorType::InputAttachment,
    ];
}

#[derive(Debug, Clone)]
pub struct DescriptorPoolDesc {
    pub sizes: Vec<(DescriptorType, u32)>,
    pub max_sets: u32,
    /// Sets may be released individually instead of only by resetting the pool.
    pub free_individual_sets: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub transfer_src: bool,
    pub transfer_dst: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub type_bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPoolDesc {
    pub queue_family: u32,
    pub transient: bool,
    pub reset_individual_buffers: bool,
}

/// One tool attached to the runtime (profiler, debugger, monitor...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolProperties {
    pub name: String,
    pub monitoring: bool,
}

/// Resolved tool-introspection entry point for one physical device.
pub trait ToolingQuery: Send {
    fn tool_properties(&self) -> Result<Vec<ToolProperties>, DriverError>;
}

/// A native GPU/compute API.
///
/// Creation calls return owned handles; the matching `destroy_*`/`free_*`
/// call consumes them. Callers are responsible for ordering teardown.
pub trait Driver {
    type PhysicalDevice: Clone;
    type Device;
    type Queue: Clone;
    type DescriptorPool;
    type Buffer;
    type Memory;
    type CommandPool;
    type CommandBuffer;
    type Fence;
    type DebugCallback;

    /// Short label used as the log prefix, e.g. `WGPU`.
    fn name(&self) -> &'static str;

    fn instance_extensions(&self) -> Result<CapabilitySet, DriverError>;
    fn instance_layers(&self) -> Result<CapabilitySet, DriverError>;
    fn create_instance(&mut self, desc: &InstanceDesc) -> Result<(), DriverError>;
    fn destroy_instance(&mut self);

    /// Forwards driver validation messages to the log.
    fn create_debug_callback(&mut self) -> Result<Self::DebugCallback, DriverError>;
    fn destroy_debug_callback(&mut self, callback: Self::DebugCallback);

    fn enumerate_physical_devices(&self) -> Result<Vec<Self::PhysicalDevice>, DriverError>;
    fn device_extensions(&self, physical: &Self::PhysicalDevice) -> CapabilitySet;
    fn properties(&self, physical: &Self::PhysicalDevice) -> PhysicalDeviceProperties;
    fn queue_families(&self, physical: &Self::PhysicalDevice) -> Vec<QueueFamily>;
    fn memory_properties(&self, physical: &Self::PhysicalDevice) -> MemoryProperties;

    /// `None` when the runtime lacks tool introspection or the entry point does not resolve.
    fn tooling_query(&self, physical: &Self::PhysicalDevice) -> Option<Box<dyn ToolingQuery>>;

    fn create_device(
        &mut self,
        physical: &Self::PhysicalDevice,
        desc: &DeviceDesc,
    ) -> Result<Self::Device, DriverError>;
    fn device_queue(&self, device: &Self::Device, family: u32) -> Self::Queue;
    fn destroy_device(&mut self, device: Self::Device);

    fn create_descriptor_pool(
        &self,
        device: &Self::Device,
        desc: &DescriptorPoolDesc,
    ) -> Result<Self::DescriptorPool, DriverError>;
    fn destroy_descriptor_pool(&self, device: &Self::Device, pool: Self::DescriptorPool);

    fn create_buffer(&self, device: &Self::Device, desc: &BufferDesc) -> Result<Self::Buffer, DriverError>;
    fn buffer_memory_requirements(&self, device: &Self::Device, buffer: &Self::Buffer) -> MemoryRequirements;
    fn allocate_memory(
        &self,
        device: &Self::Device,
        size: u64,
        type_index: u32,
    ) -> Result<Self::Memory, DriverError>;
    fn bind_buffer_memory(
        &self,
        device: &Self::Device,
        buffer: &Self::Buffer,
        memory: &Self::Memory,
    ) -> Result<(), DriverError>;
    /// The pointer stays valid for `size` bytes until [`Driver::unmap_memory`].
    fn map_memory(
        &self,
        device: &Self::Device,
        memory: &mut Self::Memory,
        size: u64,
    ) -> Result<NonNull<u8>, DriverError>;
    fn unmap_memory(&self, device: &Self::Device, memory: &mut Self::Memory);
    /// Makes host writes to a mapped range visible to the device. Coherent
    /// memory needs nothing, which is the default.
    fn flush_mapped_range(
        &self,
        _device: &Self::Device,
        _buffer: &Self::Buffer,
        _memory: &Self::Memory,
        _offset: u64,
        _len: u64,
    ) -> Result<(), DriverError> {
        Ok(())
    }
    fn destroy_buffer(&self, device: &Self::Device, buffer: Self::Buffer);
    fn free_memory(&self, device: &Self::Device, memory: Self::Memory);

    fn create_command_pool(
        &self,
        device: &Self::Device,
        desc: &CommandPoolDesc,
    ) -> Result<Self::CommandPool, DriverError>;
    fn allocate_command_buffer(
        &self,
        device: &Self::Device,
        pool: &Self::CommandPool,
    ) -> Result<Self::CommandBuffer, DriverError>;
    fn begin_command_buffer(
        &self,
        device: &Self::Device,
        buffer: &mut Self::CommandBuffer,
    ) -> Result<(), DriverError>;
    fn end_command_buffer(&self, buffer: &mut Self::CommandBuffer) -> Result<(), DriverError>;
    fn reset_command_buffer(&self, buffer: &mut Self::CommandBuffer) -> Result<(), DriverError>;
    fn free_command_buffer(
        &self,
        device: &Self::Device,
        pool: &Self::CommandPool,
        buffer: Self::CommandBuffer,
    );
    fn destroy_command_pool(&self, device: &Self::Device, pool: Self::CommandPool);

    fn create_fence(&self, device: &Self::Device) -> Result<Self::Fence, DriverError>;
    fn queue_submit(
        &self,
        queue: &Self::Queue,
        buffer: &mut Self::CommandBuffer,
        fence: &mut Self::Fence,
    ) -> Result<(), DriverError>;
    fn wait_for_fence(&self, device: &Self::Device, fence: &Self::Fence) -> Result<(), DriverError>;
    fn reset_fence(&self, device: &Self::Device, fence: &mut Self::Fence) -> Result<(), DriverError>;
    fn destroy_fence(&self, device: &Self::Device, fence: Self::Fence);
}

/// Zeroed host bytes owned through a raw pointer.
///
/// Moving the owner does not invalidate pointers previously returned by
/// [`HostAllocation::as_ptr`].
pub struct HostAllocation {
    ptr: NonNull<[u8]>,
}

// SAFETY: the allocation is uniquely owned, exactly like a `Box<[u8]>`.
unsafe impl Send for HostAllocation {}
// SAFETY: shared access only reads; writes go through mapped pointers whose
// synchronisation is the mapper's responsibility.
unsafe impl Sync for HostAllocation {}

impl HostAllocation {
    pub fn zeroed(len: usize) -> Self {
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice());
        // SAFETY: `Box::into_raw` never returns null.
        let ptr = unsafe { NonNull::new_unchecked(raw) };
        Self { ptr }
    }

    pub fn len(&self) -> usize {
        self.ptr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr.cast()
    }

    /// Callers must not hold this across writes through [`HostAllocation::as_ptr`].
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` came from a live boxed slice of `len` initialised bytes.
        unsafe { slice::from_raw_parts(self.as_ptr().as_ptr(), self.len()) }
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from `Box::into_raw` and is released only here.
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
    }
}

impl fmt::Debug for HostAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostAllocation").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_allocation_outlives_moves_of_its_owner() {
        let allocation = HostAllocation::zeroed(8);
        let mapped = allocation.as_ptr();
        let owners = vec![allocation];
        let allocation = owners.into_iter().next().unwrap();
        // SAFETY: offset 5 is inside the 8-byte allocation, which is still alive.
        unsafe { mapped.as_ptr().add(5).write(0xAB) };
        assert_eq!(allocation.as_slice()[5], 0xAB);
        assert_eq!(allocation.len(), 8);
        assert!(HostAllocation::zeroed(0).is_empty());
    }

    #[test]
    fn memory_flags_combine() {
        let flags = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
        assert!(flags.contains(MemoryPropertyFlags::HOST_VISIBLE));
        assert!(flags.contains(MemoryPropertyFlags::HOST_COHERENT));
        assert!(!flags.contains(MemoryPropertyFlags::DEVICE_LOCAL));
        assert!(flags.contains(MemoryPropertyFlags::empty()));
    }
}

//! wgpu driver
//!
//! wgpu hides most of the explicit API this crate was shaped around, so a
//! few concepts are emulated:
//! - one queue family serving every role;
//! - memory types are "device" or "host"; host memory is a shadow copy that
//!   `flush_mapped_range` uploads through the queue;
//! - descriptor pools are capacity budgets;
//! - fences wrap a submission index and wait by polling the device.

use super::{
    BufferDesc, CommandPoolDesc, DescriptorPoolDesc, DescriptorType, DeviceDesc, Driver, HostAllocation, InstanceDesc,
    MemoryHeap, MemoryProperties, MemoryPropertyFlags, MemoryRequirements, MemoryType, PhysicalDeviceProperties,
    QueueFamily, ToolingQuery,
};
use crate::caps::{self, capability_set, names, CapabilitySet};
use crate::error::DriverError;
use crate::ApiVersion;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

const DEVICE_MEMORY_TYPE: u32 = 0;
const HOST_MEMORY_TYPE: u32 = 1;

const SAMPLE_COUNTS: [u32; 7] = [1, 2, 4, 8, 16, 32, 64];

/// Sample mask in the `bit n set = count n supported` layout.
fn sample_mask(supported: impl Fn(u32) -> bool) -> u32 {
    SAMPLE_COUNTS
        .iter()
        .copied()
        .filter(|&count| supported(count))
        .fold(0, |mask, count| mask | count)
}

/// Heap layout. Unified devices get a single device-local heap the size of
/// system RAM; discrete ones report the largest buffer as a lower bound,
/// capped at system RAM since some backends advertise no real limit.
fn memory_layout(unified: bool, max_buffer_size: u64, host_ram: u64) -> MemoryProperties {
    let heaps = if unified {
        vec![MemoryHeap {
            size: host_ram,
            device_local: true,
        }]
    } else {
        vec![
            MemoryHeap {
                size: if host_ram > 0 { max_buffer_size.min(host_ram) } else { max_buffer_size },
                device_local: true,
            },
            MemoryHeap {
                size: host_ram,
                device_local: false,
            },
        ]
    };
    let host_heap = if unified { 0 } else { 1 };
    MemoryProperties {
        heaps,
        types: vec![
            MemoryType {
                flags: MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            },
            MemoryType {
                flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
                heap_index: host_heap,
            },
        ],
    }
}

/// Rounds `offset..offset + len` out to copy alignment, capped at `limit`.
fn aligned_range(offset: u64, len: u64, limit: u64) -> (u64, u64) {
    let align = ::wgpu::COPY_BUFFER_ALIGNMENT;
    let start = offset - offset % align;
    let end = offset.saturating_add(len).next_multiple_of(align).min(limit);
    (start, end)
}

/// Runs `f` inside validation and out-of-memory error scopes.
fn scoped<T>(device: &::wgpu::Device, call: &'static str, f: impl FnOnce() -> T) -> Result<T, DriverError> {
    device.push_error_scope(::wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(::wgpu::ErrorFilter::Validation);
    let value = f();
    let validation = pollster::block_on(device.pop_error_scope());
    let memory = pollster::block_on(device.pop_error_scope());
    match validation.or(memory) {
        Some(err) => Err(DriverError::new(call, err.to_string())),
        None => Ok(value),
    }
}

/// Descriptor pool stand-in: tracks capacity so over-allocation fails like
/// an exhausted pool would.
#[derive(Debug, Clone)]
pub struct DescriptorBudget {
    capacity: HashMap<DescriptorType, u32>,
    remaining: HashMap<DescriptorType, u32>,
    sets_remaining: u32,
    max_sets: u32,
    free_individual_sets: bool,
}

impl DescriptorBudget {
    pub fn new(desc: &DescriptorPoolDesc) -> Self {
        let capacity: HashMap<_, _> = desc.sizes.iter().copied().collect();
        Self {
            remaining: capacity.clone(),
            capacity,
            sets_remaining: desc.max_sets,
            max_sets: desc.max_sets,
            free_individual_sets: desc.free_individual_sets,
        }
    }

    pub fn sets_in_use(&self) -> u32 {
        self.max_sets - self.sets_remaining
    }

    pub fn remaining(&self, ty: DescriptorType) -> u32 {
        self.remaining.get(&ty).copied().unwrap_or(0)
    }

    /// Takes one set holding `counts` descriptors.
    pub fn allocate(&mut self, counts: &[(DescriptorType, u32)]) -> Result<(), DriverError> {
        if self.sets_remaining == 0 {
            return Err(DriverError::new("allocate_descriptor_set", "pool has no sets left"));
        }
        if let Some((ty, _)) = counts.iter().find(|&&(ty, count)| count > self.remaining(ty)) {
            return Err(DriverError::new("allocate_descriptor_set", format!("{ty:?} descriptors exhausted")));
        }
        for &(ty, count) in counts {
            if let Some(left) = self.remaining.get_mut(&ty) {
                *left -= count;
            }
        }
        self.sets_remaining -= 1;
        Ok(())
    }

    /// Returns one set. Only pools created for individual release allow this.
    pub fn free(&mut self, counts: &[(DescriptorType, u32)]) -> Result<(), DriverError> {
        if !self.free_individual_sets {
            return Err(DriverError::new("free_descriptor_set", "pool only supports reset"));
        }
        if self.sets_remaining == self.max_sets {
            return Err(DriverError::new("free_descriptor_set", "no sets allocated"));
        }
        for &(ty, count) in counts {
            let cap = self.capacity.get(&ty).copied().unwrap_or(0);
            if let Some(left) = self.remaining.get_mut(&ty) {
                *left = left.saturating_add(count).min(cap);
            }
        }
        self.sets_remaining += 1;
        Ok(())
    }
}

pub struct WgpuDevice {
    device: Arc<::wgpu::Device>,
    queue: Arc<::wgpu::Queue>,
}

impl WgpuDevice {
    pub fn device(&self) -> &::wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &::wgpu::Queue {
        &self.queue
    }
}

/// Host-side storage standing in for device memory.
pub struct WgpuMemory {
    shadow: HostAllocation,
    host_visible: bool,
}

pub struct WgpuCommandPool {
    pub queue_family: u32,
}

#[derive(Default)]
pub struct WgpuCommandBuffer {
    encoder: Option<::wgpu::CommandEncoder>,
    finished: Option<::wgpu::CommandBuffer>,
}

impl WgpuCommandBuffer {
    /// The open encoder between begin and end.
    pub fn encoder(&mut self) -> Option<&mut ::wgpu::CommandEncoder> {
        self.encoder.as_mut()
    }
}

#[derive(Default)]
pub struct WgpuFence {
    submission: Option<::wgpu::SubmissionIndex>,
}

pub struct WgpuDebugCallback {
    _private: (),
}

/// [`Driver`] over wgpu.
///
/// wgpu offers no per-instance extension query, so the instance extensions
/// are fixed and each one maps onto something wgpu does expose: platform
/// surfaces are always available, `DEBUG_REPORT` switches on verbose device
/// error logging, and `PORTABILITY_ENUMERATION` widens adapter enumeration
/// from the primary backends to all of them. wgpu has no tool introspection,
/// so [`Driver::tooling_query`] is always `None` and telemetry falls back to
/// NVML or nothing.
pub struct WgpuDriver {
    instance: Option<::wgpu::Instance>,
    backends: ::wgpu::Backends,
    verbose_errors: Arc<AtomicBool>,
}

impl Default for WgpuDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl WgpuDriver {
    pub fn new() -> Self {
        Self {
            instance: None,
            backends: ::wgpu::Backends::PRIMARY,
            verbose_errors: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn instance(&self) -> Option<&::wgpu::Instance> {
        self.instance.as_ref()
    }
}

impl Driver for WgpuDriver {
    type PhysicalDevice = Arc<::wgpu::Adapter>;
    type Device = WgpuDevice;
    type Queue = Arc<::wgpu::Queue>;
    type DescriptorPool = DescriptorBudget;
    type Buffer = ::wgpu::Buffer;
    type Memory = WgpuMemory;
    type CommandPool = WgpuCommandPool;
    type CommandBuffer = WgpuCommandBuffer;
    type Fence = WgpuFence;
    type DebugCallback = WgpuDebugCallback;

    fn name(&self) -> &'static str {
        "WGPU"
    }

    fn instance_extensions(&self) -> Result<CapabilitySet, DriverError> {
        let mut available = capability_set(caps::platform_surface_extensions());
        available.insert(names::DEBUG_REPORT.to_string());
        // Secondary (GL) backends stand in for non-conformant implementations.
        available.insert(names::PORTABILITY_ENUMERATION.to_string());
        Ok(available)
    }

    fn instance_layers(&self) -> Result<CapabilitySet, DriverError> {
        Ok(caps::validation_layers())
    }

    fn create_instance(&mut self, desc: &InstanceDesc) -> Result<(), DriverError> {
        let mut flags = ::wgpu::InstanceFlags::empty();
        if desc.layers.contains(names::VALIDATION_LAYER) {
            flags |= ::wgpu::InstanceFlags::VALIDATION | ::wgpu::InstanceFlags::DEBUG;
        }
        self.backends = if desc.enumerate_portability {
            ::wgpu::Backends::all()
        } else {
            ::wgpu::Backends::PRIMARY
        };
        debug!("Creating wgpu instance for '{}' with {:?}", desc.application_name, self.backends);
        self.instance = Some(::wgpu::Instance::new(::wgpu::InstanceDescriptor {
            backends: self.backends,
            flags,
            ..Default::default()
        }));
        Ok(())
    }

    fn destroy_instance(&mut self) {
        self.instance = None;
    }

    fn create_debug_callback(&mut self) -> Result<WgpuDebugCallback, DriverError> {
        self.verbose_errors.store(true, Ordering::Relaxed);
        Ok(WgpuDebugCallback { _private: () })
    }

    fn destroy_debug_callback(&mut self, _callback: WgpuDebugCallback) {
        self.verbose_errors.store(false, Ordering::Relaxed);
    }

    fn enumerate_physical_devices(&self) -> Result<Vec<Self::PhysicalDevice>, DriverError> {
        let instance = self
            .instance
            .as_ref()
            .ok_or_else(|| DriverError::new("enumerate_adapters", "instance not created"))?;
        Ok(instance
            .enumerate_adapters(self.backends)
            .into_iter()
            .map(Arc::new)
            .collect())
    }

    fn device_extensions(&self, _physical: &Self::PhysicalDevice) -> CapabilitySet {
        let mut available = capability_set([names::SWAPCHAIN]);
        if cfg!(any(target_os = "macos", target_os = "ios")) {
            available.insert(names::PORTABILITY_SUBSET.to_string());
        }
        available
    }

    fn properties(&self, physical: &Self::PhysicalDevice) -> PhysicalDeviceProperties {
        let info = physical.get_info();
        let supports = |format| {
            let features = physical.get_texture_format_features(format);
            move |count| features.flags.sample_count_supported(count)
        };
        PhysicalDeviceProperties {
            name: info.name,
            vendor_id: info.vendor,
            device_type: info.device_type.into(),
            api_version: ApiVersion::parse_leading(&info.driver_info).unwrap_or_default(),
            color_sample_counts: sample_mask(supports(::wgpu::TextureFormat::Rgba8Unorm)),
            depth_sample_counts: sample_mask(supports(::wgpu::TextureFormat::Depth32Float)),
        }
    }

    fn queue_families(&self, physical: &Self::PhysicalDevice) -> Vec<QueueFamily> {
        let compute = physical
            .get_downlevel_capabilities()
            .flags
            .contains(::wgpu::DownlevelFlags::COMPUTE_SHADERS);
        vec![QueueFamily {
            graphics: true,
            compute,
            present: true,
            queue_count: 1,
        }]
    }

    fn memory_properties(&self, physical: &Self::PhysicalDevice) -> MemoryProperties {
        let unified = matches!(
            physical.get_info().device_type,
            ::wgpu::DeviceType::IntegratedGpu | ::wgpu::DeviceType::Cpu
        );
        let host_ram = sluice_env::Host::detect().total_ram;
        memory_layout(unified, physical.limits().max_buffer_size, host_ram)
    }

    fn tooling_query(&self, _physical: &Self::PhysicalDevice) -> Option<Box<dyn ToolingQuery>> {
        None
    }

    fn create_device(&mut self, physical: &Self::PhysicalDevice, desc: &DeviceDesc) -> Result<WgpuDevice, DriverError> {
        debug!("Requesting device with {:?}", desc.extensions);
        let (device, queue) = pollster::block_on(physical.request_device(
            &::wgpu::DeviceDescriptor {
                label: Some("Sluice Device"),
                required_features: ::wgpu::Features::empty(),
                required_limits: physical.limits(),
                memory_hints: ::wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|err| DriverError::new("request_device", err.to_string()))?;

        let verbose = Arc::clone(&self.verbose_errors);
        device.on_uncaptured_error(Box::new(move |err| {
            if verbose.load(Ordering::Relaxed) {
                error!("Device error: {err:?}");
            } else {
                error!("Device error: {err}");
            }
        }));

        Ok(WgpuDevice {
            device: Arc::new(device),
            queue: Arc::new(queue),
        })
    }

    fn device_queue(&self, device: &WgpuDevice, _family: u32) -> Self::Queue {
        Arc::clone(&device.queue)
    }

    fn destroy_device(&mut self, device: WgpuDevice) {
        device.device.destroy();
    }

    fn create_descriptor_pool(&self, _device: &WgpuDevice, desc: &DescriptorPoolDesc) -> Result<DescriptorBudget, DriverError> {
        Ok(DescriptorBudget::new(desc))
    }

    fn destroy_descriptor_pool(&self, _device: &WgpuDevice, _pool: DescriptorBudget) {}

    fn create_buffer(&self, device: &WgpuDevice, desc: &BufferDesc) -> Result<::wgpu::Buffer, DriverError> {
        let mut usage = ::wgpu::BufferUsages::empty();
        if desc.transfer_src {
            usage |= ::wgpu::BufferUsages::COPY_SRC;
        }
        if desc.transfer_dst {
            usage |= ::wgpu::BufferUsages::COPY_DST;
        }
        let size = desc.size.next_multiple_of(::wgpu::COPY_BUFFER_ALIGNMENT);
        scoped(&device.device, "create_buffer", || {
            device.device.create_buffer(&::wgpu::BufferDescriptor {
                label: Some("Sluice Staging"),
                size,
                usage,
                mapped_at_creation: false,
            })
        })
    }

    fn buffer_memory_requirements(&self, _device: &WgpuDevice, buffer: &::wgpu::Buffer) -> MemoryRequirements {
        MemoryRequirements {
            size: buffer.size(),
            type_bits: (1 << DEVICE_MEMORY_TYPE) | (1 << HOST_MEMORY_TYPE),
        }
    }

    fn allocate_memory(&self, _device: &WgpuDevice, size: u64, type_index: u32) -> Result<WgpuMemory, DriverError> {
        let host_visible = type_index == HOST_MEMORY_TYPE;
        // Device memory lives inside the wgpu buffer itself.
        let len = if host_visible {
            usize::try_from(size).map_err(|_| DriverError::new("allocate_memory", "size exceeds address space"))?
        } else {
            0
        };
        Ok(WgpuMemory {
            shadow: HostAllocation::zeroed(len),
            host_visible,
        })
    }

    fn bind_buffer_memory(&self, _device: &WgpuDevice, buffer: &::wgpu::Buffer, memory: &WgpuMemory) -> Result<(), DriverError> {
        if memory.host_visible && (memory.shadow.len() as u64) < buffer.size() {
            return Err(DriverError::new("bind_buffer_memory", "allocation smaller than buffer"));
        }
        Ok(())
    }

    fn map_memory(&self, _device: &WgpuDevice, memory: &mut WgpuMemory, size: u64) -> Result<NonNull<u8>, DriverError> {
        if !memory.host_visible {
            return Err(DriverError::new("map_memory", "memory is not host visible"));
        }
        if size > memory.shadow.len() as u64 {
            return Err(DriverError::new("map_memory", "range exceeds allocation"));
        }
        Ok(memory.shadow.as_ptr())
    }

    fn unmap_memory(&self, _device: &WgpuDevice, _memory: &mut WgpuMemory) {}

    fn flush_mapped_range(
        &self,
        device: &WgpuDevice,
        buffer: &::wgpu::Buffer,
        memory: &WgpuMemory,
        offset: u64,
        len: u64,
    ) -> Result<(), DriverError> {
        let (start, end) = aligned_range(offset, len, buffer.size().min(memory.shadow.len() as u64));
        if start >= end {
            return Ok(());
        }
        device
            .queue
            .write_buffer(buffer, start, &memory.shadow.as_slice()[start as usize..end as usize]);
        Ok(())
    }

    fn destroy_buffer(&self, _device: &WgpuDevice, buffer: ::wgpu::Buffer) {
        buffer.destroy();
    }

    fn free_memory(&self, _device: &WgpuDevice, memory: WgpuMemory) {
        drop(memory);
    }

    fn create_command_pool(&self, _device: &WgpuDevice, desc: &CommandPoolDesc) -> Result<WgpuCommandPool, DriverError> {
        Ok(WgpuCommandPool {
            queue_family: desc.queue_family,
        })
    }

    fn allocate_command_buffer(&self, _device: &WgpuDevice, _pool: &WgpuCommandPool) -> Result<WgpuCommandBuffer, DriverError> {
        Ok(WgpuCommandBuffer::default())
    }

    fn begin_command_buffer(&self, device: &WgpuDevice, buffer: &mut WgpuCommandBuffer) -> Result<(), DriverError> {
        buffer.finished = None;
        buffer.encoder = Some(device.device.create_command_encoder(&::wgpu::CommandEncoderDescriptor {
            label: Some("Sluice One-Shot"),
        }));
        Ok(())
    }

    fn end_command_buffer(&self, buffer: &mut WgpuCommandBuffer) -> Result<(), DriverError> {
        let encoder = buffer
            .encoder
            .take()
            .ok_or_else(|| DriverError::new("end_command_buffer", "not recording"))?;
        buffer.finished = Some(encoder.finish());
        Ok(())
    }

    fn reset_command_buffer(&self, buffer: &mut WgpuCommandBuffer) -> Result<(), DriverError> {
        buffer.encoder = None;
        buffer.finished = None;
        Ok(())
    }

    fn free_command_buffer(&self, _device: &WgpuDevice, _pool: &WgpuCommandPool, _buffer: WgpuCommandBuffer) {}

    fn destroy_command_pool(&self, _device: &WgpuDevice, _pool: WgpuCommandPool) {}

    fn create_fence(&self, _device: &WgpuDevice) -> Result<WgpuFence, DriverError> {
        Ok(WgpuFence::default())
    }

    fn queue_submit(
        &self,
        queue: &Self::Queue,
        buffer: &mut WgpuCommandBuffer,
        fence: &mut WgpuFence,
    ) -> Result<(), DriverError> {
        let commands = buffer
            .finished
            .take()
            .ok_or_else(|| DriverError::new("queue_submit", "command buffer was not ended"))?;
        fence.submission = Some(queue.submit(std::iter::once(commands)));
        Ok(())
    }

    fn wait_for_fence(&self, device: &WgpuDevice, fence: &WgpuFence) -> Result<(), DriverError> {
        let index = fence
            .submission
            .clone()
            .ok_or_else(|| DriverError::new("wait_for_fence", "fence was never submitted"))?;
        let _ = device.device.poll(::wgpu::Maintain::WaitForSubmissionIndex(index));
        Ok(())
    }

    fn reset_fence(&self, _device: &WgpuDevice, fence: &mut WgpuFence) -> Result<(), DriverError> {
        fence.submission = None;
        Ok(())
    }

    fn destroy_fence(&self, _device: &WgpuDevice, _fence: WgpuFence) {}
}

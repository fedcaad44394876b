//! In-memory driver
//!
//! Scripted devices, injectable failures and an event log of every
//! create/destroy call. Mapped memory is plain host memory.

use super::*;
use crate::caps::{capability_set, names};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const GIB: u64 = 1024 * 1024 * 1024;

/// Shared, cloneable record of driver calls in call order.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    fn push(&self, event: &str) {
        if let Ok(mut events) = self.0.lock() {
            events.push(event.to_string());
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.events().iter().any(|e| e == event)
    }

    /// Index of the first occurrence of `event`.
    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

/// A scripted physical device.
#[derive(Debug, Clone)]
pub struct SyntheticDevice {
    pub name: String,
    pub vendor_id: u32,
    pub device_type: PhysicalDeviceType,
    pub api_version: ApiVersion,
    pub extensions: CapabilitySet,
    pub queue_families: Vec<QueueFamily>,
    pub memory: MemoryProperties,
    pub color_sample_counts: u32,
    pub depth_sample_counts: u32,
    /// `None` means the device exposes no tool introspection.
    pub tools: Option<Vec<ToolProperties>>,
}

impl SyntheticDevice {
    /// A discrete device with one all-purpose queue family, a device-local
    /// heap, a host heap and sample counts 1 through 8.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vendor_id: 0x1002,
            device_type: PhysicalDeviceType::Discrete,
            api_version: ApiVersion::new(1, 3, 0),
            extensions: capability_set([names::SWAPCHAIN]),
            queue_families: vec![QueueFamily {
                graphics: true,
                compute: true,
                present: true,
                queue_count: 1,
            }],
            memory: MemoryProperties {
                heaps: vec![
                    MemoryHeap {
                        size: 8 * GIB,
                        device_local: true,
                    },
                    MemoryHeap {
                        size: 16 * GIB,
                        device_local: false,
                    },
                ],
                types: vec![
                    MemoryType {
                        flags: MemoryPropertyFlags::DEVICE_LOCAL,
                        heap_index: 0,
                    },
                    MemoryType {
                        flags: MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT,
                        heap_index: 1,
                    },
                ],
            },
            color_sample_counts: 0b1111,
            depth_sample_counts: 0b1111,
            tools: None,
        }
    }

    pub fn with_vendor(mut self, vendor_id: u32) -> Self {
        self.vendor_id = vendor_id;
        self
    }

    pub fn with_type(mut self, device_type: PhysicalDeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = capability_set(extensions.iter().copied());
        self
    }

    pub fn with_queue_families(mut self, families: Vec<QueueFamily>) -> Self {
        self.queue_families = families;
        self
    }

    pub fn with_memory(mut self, memory: MemoryProperties) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_sample_counts(mut self, color: u32, depth: u32) -> Self {
        self.color_sample_counts = color;
        self.depth_sample_counts = depth;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolProperties>) -> Self {
        self.tools = Some(tools);
        self
    }
}

#[derive(Debug)]
pub struct Handle(u64);

impl Handle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticQueue {
    pub family: u32,
}

#[derive(Debug)]
pub struct SyntheticMemory {
    id: u64,
    bytes: HostAllocation,
    mapped: bool,
}

impl SyntheticMemory {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }
}

#[derive(Debug)]
pub struct SyntheticCommandBuffer {
    id: u64,
    recording: bool,
    pub submissions: u32,
}

impl SyntheticCommandBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }
}

#[derive(Debug)]
pub struct SyntheticFence {
    id: u64,
    signaled: bool,
}

impl SyntheticFence {
    pub fn is_signaled(&self) -> bool {
        self.signaled
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

struct SyntheticTools {
    tools: Vec<ToolProperties>,
    fail: bool,
}

impl ToolingQuery for SyntheticTools {
    fn tool_properties(&self) -> Result<Vec<ToolProperties>, DriverError> {
        if self.fail {
            return Err(DriverError::new("tool_properties", "injected failure"));
        }
        Ok(self.tools.clone())
    }
}

pub struct SyntheticDriver {
    instance_extensions: CapabilitySet,
    instance_layers: CapabilitySet,
    devices: Vec<SyntheticDevice>,
    failures: BTreeSet<&'static str>,
    log: EventLog,
    next_id: AtomicU64,
    instance: Option<InstanceDesc>,
    device_desc: Option<DeviceDesc>,
    active: Option<usize>,
}

impl Default for SyntheticDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDriver {
    /// No devices; every instance capability and the validation layer available.
    pub fn new() -> Self {
        let mut instance_extensions = capability_set(crate::caps::platform_surface_extensions());
        instance_extensions.extend(capability_set([
            names::DEBUG_REPORT,
            names::PORTABILITY_ENUMERATION,
            names::TOOLING_INFO,
        ]));
        Self {
            instance_extensions,
            instance_layers: crate::caps::validation_layers(),
            devices: Vec::new(),
            failures: BTreeSet::new(),
            log: EventLog::default(),
            next_id: AtomicU64::new(1),
            instance: None,
            device_desc: None,
            active: None,
        }
    }

    pub fn with_device(mut self, device: SyntheticDevice) -> Self {
        self.devices.push(device);
        self
    }

    pub fn with_instance_extensions(mut self, extensions: &[&str]) -> Self {
        self.instance_extensions = capability_set(extensions.iter().copied());
        self
    }

    pub fn with_instance_layers(mut self, layers: &[&str]) -> Self {
        self.instance_layers = capability_set(layers.iter().copied());
        self
    }

    /// Makes every call of the named driver operation fail.
    pub fn fail_on(mut self, call: &'static str) -> Self {
        self.failures.insert(call);
        self
    }

    pub fn log(&self) -> EventLog {
        self.log.clone()
    }

    /// Parameters of the live instance, if one exists.
    pub fn instance_desc(&self) -> Option<&InstanceDesc> {
        self.instance.as_ref()
    }

    /// Parameters of the last created device.
    pub fn device_desc(&self) -> Option<&DeviceDesc> {
        self.device_desc.as_ref()
    }

    fn check(&self, call: &'static str) -> Result<(), DriverError> {
        if self.failures.contains(call) {
            return Err(DriverError::new(call, "injected failure"));
        }
        Ok(())
    }

    fn create(&self, call: &'static str) -> Result<u64, DriverError> {
        self.check(call)?;
        self.log.push(call);
        Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn device(&self, physical: &usize) -> &SyntheticDevice {
        &self.devices[*physical]
    }
}

impl Driver for SyntheticDriver {
    type PhysicalDevice = usize;
    type Device = Handle;
    type Queue = SyntheticQueue;
    type DescriptorPool = Handle;
    type Buffer = Handle;
    type Memory = SyntheticMemory;
    type CommandPool = Handle;
    type CommandBuffer = SyntheticCommandBuffer;
    type Fence = SyntheticFence;
    type DebugCallback = Handle;

    fn name(&self) -> &'static str {
        "Synthetic"
    }

    fn instance_extensions(&self) -> Result<CapabilitySet, DriverError> {
        self.check("instance_extensions")?;
        Ok(self.instance_extensions.clone())
    }

    fn instance_layers(&self) -> Result<CapabilitySet, DriverError> {
        self.check("instance_layers")?;
        Ok(self.instance_layers.clone())
    }

    fn create_instance(&mut self, desc: &InstanceDesc) -> Result<(), DriverError> {
        self.create("create_instance")?;
        self.instance = Some(desc.clone());
        Ok(())
    }

    fn destroy_instance(&mut self) {
        self.log.push("destroy_instance");
        self.instance = None;
    }

    fn create_debug_callback(&mut self) -> Result<Handle, DriverError> {
        self.create("create_debug_callback").map(Handle)
    }

    fn destroy_debug_callback(&mut self, _callback: Handle) {
        self.log.push("destroy_debug_callback");
    }

    fn enumerate_physical_devices(&self) -> Result<Vec<usize>, DriverError> {
        self.check("enumerate_physical_devices")?;
        Ok((0..self.devices.len()).collect())
    }

    fn device_extensions(&self, physical: &usize) -> CapabilitySet {
        self.device(physical).extensions.clone()
    }

    fn properties(&self, physical: &usize) -> PhysicalDeviceProperties {
        let device = self.device(physical);
        PhysicalDeviceProperties {
            name: device.name.clone(),
            vendor_id: device.vendor_id,
            device_type: device.device_type,
            api_version: device.api_version,
            color_sample_counts: device.color_sample_counts,
            depth_sample_counts: device.depth_sample_counts,
        }
    }

    fn queue_families(&self, physical: &usize) -> Vec<QueueFamily> {
        self.device(physical).queue_families.clone()
    }

    fn memory_properties(&self, physical: &usize) -> MemoryProperties {
        self.device(physical).memory.clone()
    }

    fn tooling_query(&self, physical: &usize) -> Option<Box<dyn ToolingQuery>> {
        let tools = self.device(physical).tools.clone()?;
        Some(Box::new(SyntheticTools {
            tools,
            fail: self.failures.contains("tool_properties"),
        }))
    }

    fn create_device(&mut self, physical: &usize, desc: &DeviceDesc) -> Result<Handle, DriverError> {
        let id = self.create("create_device")?;
        self.device_desc = Some(desc.clone());
        self.active = Some(*physical);
        Ok(Handle(id))
    }

    fn device_queue(&self, _device: &Handle, family: u32) -> SyntheticQueue {
        SyntheticQueue { family }
    }

    fn destroy_device(&mut self, _device: Handle) {
        self.log.push("destroy_device");
    }

    fn create_descriptor_pool(&self, _device: &Handle, desc: &DescriptorPoolDesc) -> Result<Handle, DriverError> {
        if desc.sizes.is_empty() || desc.max_sets == 0 {
            return Err(DriverError::new("create_descriptor_pool", "empty pool"));
        }
        self.create("create_descriptor_pool").map(Handle)
    }

    fn destroy_descriptor_pool(&self, _device: &Handle, _pool: Handle) {
        self.log.push("destroy_descriptor_pool");
    }

    fn create_buffer(&self, _device: &Handle, desc: &BufferDesc) -> Result<Handle, DriverError> {
        if desc.size == 0 {
            return Err(DriverError::new("create_buffer", "zero-sized buffer"));
        }
        self.create("create_buffer").map(Handle)
    }

    fn buffer_memory_requirements(&self, _device: &Handle, _buffer: &Handle) -> MemoryRequirements {
        // Every type is compatible; callers pick by property flags.
        let types = self
            .active
            .and_then(|index| self.devices.get(index))
            .map_or(0, |d| d.memory.types.len() as u32);
        MemoryRequirements {
            size: 0,
            type_bits: if types >= 32 { u32::MAX } else { (1 << types) - 1 },
        }
    }

    fn allocate_memory(&self, _device: &Handle, size: u64, _type_index: u32) -> Result<SyntheticMemory, DriverError> {
        let id = self.create("allocate_memory")?;
        let len = usize::try_from(size).map_err(|_| DriverError::new("allocate_memory", "size exceeds address space"))?;
        Ok(SyntheticMemory {
            id,
            bytes: HostAllocation::zeroed(len),
            mapped: false,
        })
    }

    fn bind_buffer_memory(&self, _device: &Handle, _buffer: &Handle, _memory: &SyntheticMemory) -> Result<(), DriverError> {
        self.check("bind_buffer_memory")?;
        self.log.push("bind_buffer_memory");
        Ok(())
    }

    fn map_memory(&self, _device: &Handle, memory: &mut SyntheticMemory, size: u64) -> Result<NonNull<u8>, DriverError> {
        self.check("map_memory")?;
        if size > memory.bytes.len() as u64 {
            return Err(DriverError::new("map_memory", "range exceeds allocation"));
        }
        memory.mapped = true;
        self.log.push("map_memory");
        Ok(memory.bytes.as_ptr())
    }

    fn unmap_memory(&self, _device: &Handle, memory: &mut SyntheticMemory) {
        memory.mapped = false;
        self.log.push("unmap_memory");
    }

    fn flush_mapped_range(
        &self,
        _device: &Handle,
        _buffer: &Handle,
        memory: &SyntheticMemory,
        offset: u64,
        len: u64,
    ) -> Result<(), DriverError> {
        self.check("flush_mapped_range")?;
        if !memory.mapped || offset.saturating_add(len) > memory.bytes.len() as u64 {
            return Err(DriverError::new("flush_mapped_range", "range not mapped"));
        }
        self.log.push("flush_mapped_range");
        Ok(())
    }

    fn destroy_buffer(&self, _device: &Handle, _buffer: Handle) {
        self.log.push("destroy_buffer");
    }

    fn free_memory(&self, _device: &Handle, memory: SyntheticMemory) {
        drop(memory);
        self.log.push("free_memory");
    }

    fn create_command_pool(&self, _device: &Handle, _desc: &CommandPoolDesc) -> Result<Handle, DriverError> {
        self.create("create_command_pool").map(Handle)
    }

    fn allocate_command_buffer(&self, _device: &Handle, _pool: &Handle) -> Result<SyntheticCommandBuffer, DriverError> {
        let id = self.create("allocate_command_buffer")?;
        Ok(SyntheticCommandBuffer {
            id,
            recording: false,
            submissions: 0,
        })
    }

    fn begin_command_buffer(&self, _device: &Handle, buffer: &mut SyntheticCommandBuffer) -> Result<(), DriverError> {
        self.check("begin_command_buffer")?;
        buffer.recording = true;
        Ok(())
    }

    fn end_command_buffer(&self, buffer: &mut SyntheticCommandBuffer) -> Result<(), DriverError> {
        if !buffer.recording {
            return Err(DriverError::new("end_command_buffer", "not recording"));
        }
        buffer.recording = false;
        Ok(())
    }

    fn reset_command_buffer(&self, buffer: &mut SyntheticCommandBuffer) -> Result<(), DriverError> {
        buffer.recording = false;
        Ok(())
    }

    fn free_command_buffer(&self, _device: &Handle, _pool: &Handle, _buffer: SyntheticCommandBuffer) {
        self.log.push("free_command_buffer");
    }

    fn destroy_command_pool(&self, _device: &Handle, _pool: Handle) {
        self.log.push("destroy_command_pool");
    }

    fn create_fence(&self, _device: &Handle) -> Result<SyntheticFence, DriverError> {
        let id = self.create("create_fence")?;
        Ok(SyntheticFence { id, signaled: false })
    }

    fn queue_submit(
        &self,
        _queue: &SyntheticQueue,
        buffer: &mut SyntheticCommandBuffer,
        fence: &mut SyntheticFence,
    ) -> Result<(), DriverError> {
        self.check("queue_submit")?;
        if buffer.recording {
            return Err(DriverError::new("queue_submit", "command buffer still recording"));
        }
        buffer.submissions += 1;
        fence.signaled = true;
        self.log.push("queue_submit");
        Ok(())
    }

    fn wait_for_fence(&self, _device: &Handle, fence: &SyntheticFence) -> Result<(), DriverError> {
        if !fence.signaled {
            return Err(DriverError::new("wait_for_fence", "fence was never submitted"));
        }
        Ok(())
    }

    fn reset_fence(&self, _device: &Handle, fence: &mut SyntheticFence) -> Result<(), DriverError> {
        fence.signaled = false;
        Ok(())
    }

    fn destroy_fence(&self, _device: &Handle, _fence: SyntheticFence) {
        self.log.push("destroy_fence");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_failures_name_the_call() {
        let driver = SyntheticDriver::new().fail_on("enumerate_physical_devices");
        let err = driver.enumerate_physical_devices().unwrap_err();
        assert_eq!(err.call, "enumerate_physical_devices");
    }

    #[test]
    fn mapped_memory_is_writable() {
        let driver = SyntheticDriver::new().with_device(SyntheticDevice::new("gpu"));
        let device = Handle(0);
        let mut memory = driver.allocate_memory(&device, 16, 1).unwrap();
        let ptr = driver.map_memory(&device, &mut memory, 16).unwrap();
        unsafe { ptr.as_ptr().add(3).write(7) };
        assert_eq!(memory.bytes()[3], 7);
        assert_eq!(driver.log().events(), ["allocate_memory", "map_memory"]);
    }
}

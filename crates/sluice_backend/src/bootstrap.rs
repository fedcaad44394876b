//! Shared resource bootstrap
//!
//! Creates, in order: logical device and queues, descriptor pool, staging
//! buffer, one-shot command pool and buffer, fence. [`Resources::release`]
//! destroys them in reverse. A failure part-way releases whatever was
//! already created before returning the error.

use crate::caps::CapabilitySet;
use crate::driver::{
    BufferDesc, CommandPoolDesc, DescriptorPoolDesc, DescriptorType, DeviceDesc, Driver, MemoryProperties,
    MemoryPropertyFlags,
};
use crate::error::{BackendError, DriverError};
use crate::select::QueueRoles;
use bytemuck::Pod;
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Per-type capacity of the shared descriptor pool.
pub const DESCRIPTOR_POOL_CAPACITY: u32 = 1000;

/// Supported sample counts, largest first. Bit `n` of a sample mask is set
/// when count `n` is supported, so each count doubles as its own flag.
const SAMPLE_LADDER: [u32; 7] = [64, 32, 16, 8, 4, 2, 1];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleNegotiation {
    pub count: u32,
    /// The requested count was unsupported and got replaced.
    pub clamped: bool,
}

/// Largest supported count not above `requested`, falling back to 1.
pub fn negotiate_sample_count(supported_mask: u32, requested: u32) -> SampleNegotiation {
    let count = SAMPLE_LADDER
        .iter()
        .copied()
        .find(|&count| count <= requested && supported_mask & count != 0)
        .unwrap_or(1);
    let clamped = count != requested;
    if clamped {
        warn!("Requested multisample count {requested} is not supported; using {count}.");
    }
    SampleNegotiation { count, clamped }
}

/// Fixed capacity for every descriptor type; sets are freed individually.
pub fn descriptor_pool_desc() -> DescriptorPoolDesc {
    DescriptorPoolDesc {
        sizes: DescriptorType::ALL
            .iter()
            .map(|&ty| (ty, DESCRIPTOR_POOL_CAPACITY))
            .collect(),
        max_sets: DESCRIPTOR_POOL_CAPACITY,
        free_individual_sets: true,
    }
}

/// First memory type allowed by `type_bits` that has every `required` flag.
pub fn find_memory_type(
    properties: &MemoryProperties,
    type_bits: u32,
    required: MemoryPropertyFlags,
) -> Result<u32, BackendError> {
    properties
        .types
        .iter()
        .enumerate()
        .take(32)
        .find(|(index, ty)| type_bits & (1 << index) != 0 && ty.flags.contains(required))
        .map(|(index, _)| index as u32)
        .ok_or(BackendError::NoCompatibleMemoryType { type_bits, required })
}

/// Host-visible, coherent buffer mapped once for its whole lifetime.
pub struct StagingBuffer<D: Driver> {
    buffer: D::Buffer,
    memory: D::Memory,
    mapped: NonNull<u8>,
    size: u64,
}

// The mapping is owned exclusively by this buffer.
unsafe impl<D: Driver> Send for StagingBuffer<D>
where
    D::Buffer: Send,
    D::Memory: Send,
{
}

impl<D: Driver> StagingBuffer<D> {
    pub fn create(
        driver: &D,
        device: &D::Device,
        memory_properties: &MemoryProperties,
        size: u64,
    ) -> Result<Self, BackendError> {
        let desc = BufferDesc {
            size,
            transfer_src: true,
            transfer_dst: true,
        };
        let buffer = driver
            .create_buffer(device, &desc)
            .map_err(BackendError::driver("create staging buffer"))?;

        let requirements = driver.buffer_memory_requirements(device, &buffer);
        let host_memory = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
        let memory_type = match find_memory_type(memory_properties, requirements.type_bits, host_memory) {
            Ok(index) => index,
            Err(err) => {
                driver.destroy_buffer(device, buffer);
                return Err(err);
            }
        };

        let mut memory = match driver.allocate_memory(device, requirements.size.max(size), memory_type) {
            Ok(memory) => memory,
            Err(err) => {
                driver.destroy_buffer(device, buffer);
                return Err(BackendError::driver("allocate staging memory")(err));
            }
        };

        let mapped = driver
            .bind_buffer_memory(device, &buffer, &memory)
            .map_err(BackendError::driver("bind staging memory"))
            .and_then(|()| {
                driver
                    .map_memory(device, &mut memory, size)
                    .map_err(BackendError::driver("map staging memory"))
            });
        let mapped = match mapped {
            Ok(ptr) => ptr,
            Err(err) => {
                driver.destroy_buffer(device, buffer);
                driver.free_memory(device, memory);
                return Err(err);
            }
        };

        debug!("Staging buffer: {size} bytes, memory type {memory_type}");
        Ok(Self {
            buffer,
            memory,
            mapped,
            size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn buffer(&self) -> &D::Buffer {
        &self.buffer
    }

    pub fn memory(&self) -> &D::Memory {
        &self.memory
    }

    /// The whole mapped range.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: `mapped` points at `size` bytes that stay mapped until
        // `release`, and `&mut self` makes this the only live view.
        unsafe { std::slice::from_raw_parts_mut(self.mapped.as_ptr(), self.size as usize) }
    }

    /// Copies `values` to `offset`; the range must fit inside the buffer.
    pub fn write_pod<T: Pod>(&mut self, offset: u64, values: &[T]) -> Result<(), BackendError> {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let len = bytes.len() as u64;
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.size)
            .ok_or(BackendError::StagingOverflow {
                offset,
                len,
                size: self.size,
            })?;
        self.bytes_mut()[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }

    /// Publishes host writes in `offset..offset + len` to the device.
    pub fn flush(&self, driver: &D, device: &D::Device, offset: u64, len: u64) -> Result<(), BackendError> {
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(BackendError::StagingOverflow {
                offset,
                len,
                size: self.size,
            });
        }
        driver
            .flush_mapped_range(device, &self.buffer, &self.memory, offset, len)
            .map_err(BackendError::driver("flush staging buffer"))
    }

    /// Unmaps, then destroys the buffer before freeing its memory.
    pub fn release(mut self, driver: &D, device: &D::Device) {
        driver.unmap_memory(device, &mut self.memory);
        driver.destroy_buffer(device, self.buffer);
        driver.free_memory(device, self.memory);
    }
}

/// Queue handle per role. Roles sharing a family share a handle.
#[derive(Debug, Clone)]
pub struct Queues<Q> {
    pub graphics: Q,
    pub compute: Q,
    pub present: Option<Q>,
}

/// What [`bootstrap`] needs beyond the physical device.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapRequest<'a> {
    pub queues: QueueRoles,
    pub extensions: &'a CapabilitySet,
    pub layers: &'a CapabilitySet,
    pub memory: &'a MemoryProperties,
    pub staging_size: u64,
}

/// Everything the backend shares with its consumers.
pub struct Resources<D: Driver> {
    pub device: D::Device,
    pub queues: Queues<D::Queue>,
    pub descriptor_pool: D::DescriptorPool,
    pub staging: StagingBuffer<D>,
    pub command_pool: D::CommandPool,
    pub command_buffer: D::CommandBuffer,
    pub fence: D::Fence,
}

pub fn bootstrap<D: Driver>(
    driver: &mut D,
    physical: &D::PhysicalDevice,
    request: &BootstrapRequest<'_>,
) -> Result<Resources<D>, BackendError> {
    let roles = request.queues;
    let desc = DeviceDesc {
        queue_families: roles.unique(),
        extensions: request.extensions.clone(),
        layers: request.layers.clone(),
    };
    let device = driver
        .create_device(physical, &desc)
        .map_err(BackendError::driver("create logical device"))?;

    let queues = Queues {
        graphics: driver.device_queue(&device, roles.graphics),
        compute: driver.device_queue(&device, roles.compute),
        present: roles.present.map(|family| driver.device_queue(&device, family)),
    };

    let descriptor_pool = match driver.create_descriptor_pool(&device, &descriptor_pool_desc()) {
        Ok(pool) => pool,
        Err(err) => {
            driver.destroy_device(device);
            return Err(BackendError::driver("create descriptor pool")(err));
        }
    };

    let staging = match StagingBuffer::create(driver, &device, request.memory, request.staging_size) {
        Ok(staging) => staging,
        Err(err) => {
            driver.destroy_descriptor_pool(&device, descriptor_pool);
            driver.destroy_device(device);
            return Err(err);
        }
    };

    let pool_desc = CommandPoolDesc {
        queue_family: roles.compute,
        transient: true,
        reset_individual_buffers: true,
    };
    let command_pool = match driver.create_command_pool(&device, &pool_desc) {
        Ok(pool) => pool,
        Err(err) => {
            staging.release(driver, &device);
            driver.destroy_descriptor_pool(&device, descriptor_pool);
            driver.destroy_device(device);
            return Err(BackendError::driver("create command pool")(err));
        }
    };

    let command_buffer = match driver.allocate_command_buffer(&device, &command_pool) {
        Ok(buffer) => buffer,
        Err(err) => {
            driver.destroy_command_pool(&device, command_pool);
            staging.release(driver, &device);
            driver.destroy_descriptor_pool(&device, descriptor_pool);
            driver.destroy_device(device);
            return Err(BackendError::driver("allocate command buffer")(err));
        }
    };

    let fence = match driver.create_fence(&device) {
        Ok(fence) => fence,
        Err(err) => {
            driver.free_command_buffer(&device, &command_pool, command_buffer);
            driver.destroy_command_pool(&device, command_pool);
            staging.release(driver, &device);
            driver.destroy_descriptor_pool(&device, descriptor_pool);
            driver.destroy_device(device);
            return Err(BackendError::driver("create fence")(err));
        }
    };

    Ok(Resources {
        device,
        queues,
        descriptor_pool,
        staging,
        command_pool,
        command_buffer,
        fence,
    })
}

impl<D: Driver> Resources<D> {
    /// Records with `record`, submits on the compute queue and blocks until done.
    pub fn submit_one_shot<F>(&mut self, driver: &D, record: F) -> Result<(), BackendError>
    where
        F: FnOnce(&mut D::CommandBuffer) -> Result<(), DriverError>,
    {
        one_shot(
            driver,
            &self.device,
            &self.queues.compute,
            &mut self.command_buffer,
            &mut self.fence,
            record,
        )
        .map_err(BackendError::driver("submit one-shot commands"))
    }

    /// Releases everything created on the device, in reverse creation
    /// order, and hands the device back for the caller to destroy.
    pub fn into_device(self, driver: &D) -> D::Device {
        let Resources {
            device,
            descriptor_pool,
            staging,
            command_pool,
            command_buffer,
            fence,
            ..
        } = self;
        driver.destroy_fence(&device, fence);
        driver.free_command_buffer(&device, &command_pool, command_buffer);
        driver.destroy_command_pool(&device, command_pool);
        staging.release(driver, &device);
        driver.destroy_descriptor_pool(&device, descriptor_pool);
        device
    }

    /// Reverse creation order; the device goes last.
    pub fn release(self, driver: &mut D) {
        let device = self.into_device(driver);
        driver.destroy_device(device);
    }
}

fn one_shot<D: Driver, F>(
    driver: &D,
    device: &D::Device,
    queue: &D::Queue,
    buffer: &mut D::CommandBuffer,
    fence: &mut D::Fence,
    record: F,
) -> Result<(), DriverError>
where
    F: FnOnce(&mut D::CommandBuffer) -> Result<(), DriverError>,
{
    driver.reset_command_buffer(buffer)?;
    driver.begin_command_buffer(device, buffer)?;
    record(buffer)?;
    driver.end_command_buffer(buffer)?;
    driver.reset_fence(device, fence)?;
    driver.queue_submit(queue, buffer, fence)?;
    driver.wait_for_fence(device, fence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::synthetic::{SyntheticDevice, SyntheticDriver};
    use crate::driver::{MemoryHeap, MemoryType};

    fn roles() -> QueueRoles {
        QueueRoles {
            graphics: 0,
            compute: 0,
            present: None,
        }
    }

    fn run(driver: &mut SyntheticDriver, staging_size: u64) -> Result<Resources<SyntheticDriver>, BackendError> {
        let memory = driver.memory_properties(&0);
        let none = CapabilitySet::new();
        let request = BootstrapRequest {
            queues: roles(),
            extensions: &none,
            layers: &none,
            memory: &memory,
            staging_size,
        };
        bootstrap(driver, &0, &request)
    }

    #[test]
    fn sample_count_walks_down_the_ladder() {
        let up_to_8 = 1 | 2 | 4 | 8;
        assert_eq!(
            negotiate_sample_count(up_to_8, 64),
            SampleNegotiation { count: 8, clamped: true }
        );
        let up_to_16 = up_to_8 | 16;
        assert_eq!(
            negotiate_sample_count(up_to_16, 4),
            SampleNegotiation { count: 4, clamped: false }
        );
        assert_eq!(negotiate_sample_count(1 | 4, 2).count, 1);
        assert_eq!(negotiate_sample_count(0, 8).count, 1);
    }

    #[test]
    fn descriptor_pool_covers_every_type() {
        let desc = descriptor_pool_desc();
        assert_eq!(desc.sizes.len(), DescriptorType::ALL.len());
        assert!(desc.sizes.iter().all(|&(_, count)| count == DESCRIPTOR_POOL_CAPACITY));
        assert!(desc.free_individual_sets);
    }

    #[test]
    fn memory_type_honours_type_bits() {
        let host = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
        let properties = MemoryProperties {
            heaps: vec![MemoryHeap {
                size: 1 << 30,
                device_local: true,
            }],
            types: vec![
                MemoryType {
                    flags: host,
                    heap_index: 0,
                },
                MemoryType {
                    flags: host | MemoryPropertyFlags::DEVICE_LOCAL,
                    heap_index: 0,
                },
            ],
        };
        assert_eq!(find_memory_type(&properties, 0b11, host).unwrap(), 0);
        assert_eq!(find_memory_type(&properties, 0b10, host).unwrap(), 1);
        assert!(matches!(
            find_memory_type(&properties, 0b01, MemoryPropertyFlags::DEVICE_LOCAL),
            Err(BackendError::NoCompatibleMemoryType { .. })
        ));
    }

    #[test]
    fn resources_release_in_reverse_order() {
        let mut driver = SyntheticDriver::new().with_device(SyntheticDevice::new("gpu"));
        let log = driver.log();
        let resources = run(&mut driver, 256).unwrap();
        assert_eq!(resources.staging.size(), 256);
        assert_eq!(driver.device_desc().unwrap().queue_families, vec![0]);

        resources.release(&mut driver);
        let events = log.events();
        let teardown: Vec<&str> = events
            .iter()
            .skip_while(|e| *e != "destroy_fence")
            .map(String::as_str)
            .collect();
        assert_eq!(
            teardown,
            [
                "destroy_fence",
                "free_command_buffer",
                "destroy_command_pool",
                "unmap_memory",
                "destroy_buffer",
                "free_memory",
                "destroy_descriptor_pool",
                "destroy_device",
            ]
        );
    }

    #[test]
    fn staging_is_mapped_exactly_once() {
        let mut driver = SyntheticDriver::new().with_device(SyntheticDevice::new("gpu"));
        let log = driver.log();
        let mut resources = run(&mut driver, 64).unwrap();

        resources.staging.write_pod(0, &[1u32, 2, 3]).unwrap();
        resources.staging.write_pod(60, &[9u32]).unwrap();
        resources.staging.flush(&driver, &resources.device, 0, 64).unwrap();
        assert_eq!(&resources.staging.bytes_mut()[4..8], &2u32.to_ne_bytes());
        assert_eq!(&resources.staging.memory().bytes()[60..64], &9u32.to_ne_bytes());

        resources.release(&mut driver);
        assert_eq!(log.count("map_memory"), 1);
        assert_eq!(log.count("unmap_memory"), 1);
    }

    #[test]
    fn staging_mapping_survives_moving_the_resources() {
        let mut driver = SyntheticDriver::new().with_device(SyntheticDevice::new("gpu"));
        let resources = run(&mut driver, 32).unwrap();

        let boxed = Box::new(resources);
        let mut shelf = vec![*boxed];
        let mut resources = shelf.pop().unwrap();

        resources.staging.write_pod(8, &[0xDEAD_BEEFu32]).unwrap();
        assert_eq!(&resources.staging.memory().bytes()[8..12], &0xDEAD_BEEFu32.to_ne_bytes());
        resources.staging.bytes_mut()[31] = 5;
        assert_eq!(resources.staging.memory().bytes()[31], 5);
        resources.release(&mut driver);
    }

    #[test]
    fn staging_writes_are_bounds_checked() {
        let mut driver = SyntheticDriver::new().with_device(SyntheticDevice::new("gpu"));
        let mut resources = run(&mut driver, 8).unwrap();
        let err = resources.staging.write_pod(4, &[0u64]).unwrap_err();
        assert!(matches!(err, BackendError::StagingOverflow { offset: 4, len: 8, size: 8 }));
        assert!(resources.staging.write_pod(u64::MAX, &[0u8]).is_err());
        assert!(resources.staging.flush(&driver, &resources.device, 4, 8).is_err());
        resources.release(&mut driver);
    }

    #[test]
    fn failed_step_releases_earlier_resources() {
        let mut driver = SyntheticDriver::new()
            .with_device(SyntheticDevice::new("gpu"))
            .fail_on("allocate_command_buffer");
        let log = driver.log();
        let err = run(&mut driver, 64).err().unwrap();
        assert!(matches!(err, BackendError::Driver { action: "allocate command buffer", .. }));

        for (created, destroyed) in [
            ("create_device", "destroy_device"),
            ("create_descriptor_pool", "destroy_descriptor_pool"),
            ("create_buffer", "destroy_buffer"),
            ("allocate_memory", "free_memory"),
            ("create_command_pool", "destroy_command_pool"),
        ] {
            assert_eq!(log.count(created), log.count(destroyed), "{created} leaked");
        }
        assert!(!log.contains("create_fence"));
    }

    #[test]
    fn staging_without_host_memory_fails() {
        let device_only = MemoryProperties {
            heaps: vec![MemoryHeap {
                size: 1 << 30,
                device_local: true,
            }],
            types: vec![MemoryType {
                flags: MemoryPropertyFlags::DEVICE_LOCAL,
                heap_index: 0,
            }],
        };
        let mut driver = SyntheticDriver::new().with_device(SyntheticDevice::new("gpu").with_memory(device_only));
        let log = driver.log();
        let err = run(&mut driver, 64).err().unwrap();
        assert!(matches!(err, BackendError::NoCompatibleMemoryType { .. }));
        assert_eq!(log.count("create_buffer"), log.count("destroy_buffer"));
        assert!(log.contains("destroy_device"));
    }

    #[test]
    fn one_shot_submission_waits_on_the_fence() {
        let mut driver = SyntheticDriver::new().with_device(SyntheticDevice::new("gpu"));
        let mut resources = run(&mut driver, 64).unwrap();

        let mut recorded = false;
        resources
            .submit_one_shot(&driver, |buffer| {
                recorded = buffer.is_recording();
                Ok(())
            })
            .unwrap();
        assert!(recorded);
        assert_eq!(resources.command_buffer.submissions, 1);
        assert!(resources.fence.is_signaled());
        resources.release(&mut driver);
    }
}

//! Driver entry points used for timestamp profiling.

use crate::HashMap;
use ash::{prelude::VkResult, vk};
use parking_lot::Mutex;
use std::{fmt, ptr};

/// The device-level driver functionality needed for recording and reading
/// back timestamp queries.
///
/// The profiler never calls into the driver directly, so that the dispatch
/// table of the intercepted device (or a simulation of it) can be injected.
pub trait DeviceDispatch: fmt::Debug + Send + Sync {
    /// Creates a query pool holding `query_count` timestamp queries.
    fn create_timestamp_query_pool(&self, query_count: u32) -> VkResult<vk::QueryPool>;

    fn destroy_query_pool(&self, query_pool: vk::QueryPool);

    /// Resets the given range of queries from the host. The queries must not
    /// be in use by any pending command buffer.
    fn reset_query_pool(&self, query_pool: vk::QueryPool, first_query: u32, query_count: u32);

    /// Records a reset of the given range of queries into the command buffer.
    fn cmd_reset_query_pool(
        &self,
        command_buffer: vk::CommandBuffer,
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    );

    fn cmd_write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        query_pool: vk::QueryPool,
        query: u32,
    );

    /// Records a copy of the 64-bit results of the given range of queries
    /// into `dst_buffer`, starting at byte `dst_offset`. The copy waits for
    /// the queries to become available.
    fn cmd_copy_query_pool_results(
        &self,
        command_buffer: vk::CommandBuffer,
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
        dst_buffer: vk::Buffer,
        dst_offset: vk::DeviceSize,
    );

    /// Reads the 64-bit results of `results.len()` queries starting at
    /// `first_query`, blocking until all of them are available.
    fn get_query_pool_results(
        &self,
        query_pool: vk::QueryPool,
        first_query: u32,
        results: &mut [u64],
    ) -> VkResult<()>;

    /// Creates a host-readable buffer of `size` bytes that query results can
    /// be copied into.
    fn create_readback_buffer(&self, size: vk::DeviceSize) -> VkResult<vk::Buffer>;

    fn destroy_readback_buffer(&self, buffer: vk::Buffer);

    /// Copies `data.len()` bytes starting at byte `offset` out of a buffer
    /// created with [`Self::create_readback_buffer`].
    fn read_readback_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &mut [u8],
    ) -> VkResult<()>;
}

/// [`DeviceDispatch`] implementation calling into an [`ash::Device`].
pub struct AshDevice {
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    readback_memory: Mutex<HashMap<vk::Buffer, vk::DeviceMemory>>,
}

impl AshDevice {
    /// Wraps the given logical device. `memory_properties` are used to pick a
    /// host-visible memory type for readback buffers.
    ///
    /// # Safety
    /// `device` must be a valid logical device created from the physical
    /// device that `memory_properties` were queried from, with the
    /// `hostQueryReset` feature enabled. It must stay alive for as long as
    /// the returned value and every query pool or buffer created through it.
    pub unsafe fn new(
        device: ash::Device,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
    ) -> Self {
        Self {
            device,
            memory_properties,
            readback_memory: Mutex::new(HashMap::default()),
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn find_readback_memory_type(&self, memory_type_bits: u32) -> Option<u32> {
        let required =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let n_memory_types = self.memory_properties.memory_type_count as usize;

        self.memory_properties.memory_types[..n_memory_types]
            .iter()
            .zip(0_u32..)
            .find(|(memory_type, idx)| {
                memory_type_bits & (1 << idx) != 0 && memory_type.property_flags.contains(required)
            })
            .map(|(_, idx)| idx)
    }
}

impl DeviceDispatch for AshDevice {
    fn create_timestamp_query_pool(&self, query_count: u32) -> VkResult<vk::QueryPool> {
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(query_count);
        unsafe { self.device.create_query_pool(&create_info, None) }
    }

    fn destroy_query_pool(&self, query_pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(query_pool, None) };
    }

    fn reset_query_pool(&self, query_pool: vk::QueryPool, first_query: u32, query_count: u32) {
        unsafe {
            self.device
                .reset_query_pool(query_pool, first_query, query_count);
        }
    }

    fn cmd_reset_query_pool(
        &self,
        command_buffer: vk::CommandBuffer,
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    ) {
        unsafe {
            self.device
                .cmd_reset_query_pool(command_buffer, query_pool, first_query, query_count);
        }
    }

    fn cmd_write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        query_pool: vk::QueryPool,
        query: u32,
    ) {
        unsafe {
            self.device
                .cmd_write_timestamp(command_buffer, stage, query_pool, query);
        }
    }

    fn cmd_copy_query_pool_results(
        &self,
        command_buffer: vk::CommandBuffer,
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
        dst_buffer: vk::Buffer,
        dst_offset: vk::DeviceSize,
    ) {
        unsafe {
            self.device.cmd_copy_query_pool_results(
                command_buffer,
                query_pool,
                first_query,
                query_count,
                dst_buffer,
                dst_offset,
                size_of::<u64>() as vk::DeviceSize,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            );
        }
    }

    fn get_query_pool_results(
        &self,
        query_pool: vk::QueryPool,
        first_query: u32,
        results: &mut [u64],
    ) -> VkResult<()> {
        if results.is_empty() {
            return Ok(());
        }
        unsafe {
            self.device.get_query_pool_results(
                query_pool,
                first_query,
                results,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
        }
    }

    fn create_readback_buffer(&self, size: vk::DeviceSize) -> VkResult<vk::Buffer> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&create_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let Some(memory_type_index) = self.find_readback_memory_type(requirements.memory_type_bits)
        else {
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        };

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { self.device.allocate_memory(&allocate_info, None) } {
            Ok(memory) => memory,
            Err(result) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(result);
            }
        };

        if let Err(result) = unsafe { self.device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
            }
            return Err(result);
        }

        self.readback_memory.lock().insert(buffer, memory);
        Ok(buffer)
    }

    fn destroy_readback_buffer(&self, buffer: vk::Buffer) {
        let memory = self.readback_memory.lock().remove(&buffer);
        unsafe {
            self.device.destroy_buffer(buffer, None);
            if let Some(memory) = memory {
                self.device.free_memory(memory, None);
            }
        }
    }

    fn read_readback_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &mut [u8],
    ) -> VkResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let memory = self
            .readback_memory
            .lock()
            .get(&buffer)
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)?;

        unsafe {
            let mapped = self.device.map_memory(
                memory,
                offset,
                data.len() as vk::DeviceSize,
                vk::MemoryMapFlags::empty(),
            )?;
            ptr::copy_nonoverlapping(mapped.cast::<u8>(), data.as_mut_ptr(), data.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }
}

impl fmt::Debug for AshDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AshDevice")
            .field("device", &self.device.handle())
            .field("n_readback_buffers", &self.readback_memory.lock().len())
            .finish_non_exhaustive()
    }
}

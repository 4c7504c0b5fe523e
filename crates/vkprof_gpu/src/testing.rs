//! CPU simulation of the driver entry points used for profiling.

use crate::{HashMap, device::DeviceDispatch};
use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};
use parking_lot::Mutex;
use std::{thread, time::Duration};

/// Value of the simulated device clock before any timestamp is written.
pub const SIMULATED_CLOCK_START: u64 = 1000;

/// Number of ticks the simulated device clock advances for every timestamp
/// written.
pub const SIMULATED_TICKS_PER_TIMESTAMP: u64 = 10;

/// A query-related command recorded into a simulated command buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SimulatedCommand {
    ResetQueries {
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    },
    WriteTimestamp {
        query_pool: vk::QueryPool,
        query: u32,
        stage: vk::PipelineStageFlags,
    },
    CopyQueryResults {
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
        dst_buffer: vk::Buffer,
        dst_offset: vk::DeviceSize,
    },
    ExecuteCommands(Vec<vk::CommandBuffer>),
}

/// A [`DeviceDispatch`] that records query commands per command buffer and
/// executes them on demand against a clock that advances by
/// [`SIMULATED_TICKS_PER_TIMESTAMP`] for every timestamp write.
///
/// Failures can be injected for query pool creation, result reads and
/// readback buffer creation. Result reads can be made to block for a while,
/// like waiting for a busy device would.
#[derive(Debug)]
pub struct SimulatedDevice {
    state: Mutex<SimulatedDeviceState>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QuerySlot {
    Undefined,
    Reset,
    Written(u64),
}

#[derive(Debug)]
struct SimulatedDeviceState {
    next_handle: u64,
    clock: u64,
    query_pools: HashMap<vk::QueryPool, Vec<QuerySlot>>,
    readback_buffers: HashMap<vk::Buffer, Vec<u8>>,
    command_buffers: HashMap<vk::CommandBuffer, Vec<SimulatedCommand>>,
    remaining_query_pool_creations: Option<usize>,
    fail_result_reads: bool,
    fail_buffer_creation: bool,
    result_read_delay: Option<Duration>,
    n_result_reads: usize,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimulatedDeviceState {
                next_handle: 1,
                clock: SIMULATED_CLOCK_START,
                query_pools: HashMap::default(),
                readback_buffers: HashMap::default(),
                command_buffers: HashMap::default(),
                remaining_query_pool_creations: None,
                fail_result_reads: false,
                fail_buffer_creation: false,
                result_read_delay: None,
                n_result_reads: 0,
            }),
        }
    }

    /// Returns a new unique command buffer handle.
    pub fn allocate_command_buffer(&self) -> vk::CommandBuffer {
        self.state.lock().allocate_handle()
    }

    /// Returns a new unique command pool handle.
    pub fn allocate_command_pool(&self) -> vk::CommandPool {
        self.state.lock().allocate_handle()
    }

    /// Discards everything recorded into the command buffer, like beginning
    /// a new recording does.
    pub fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        self.state.lock().command_buffers.remove(&command_buffer);
    }

    pub fn cmd_execute_commands(
        &self,
        command_buffer: vk::CommandBuffer,
        secondary_command_buffers: &[vk::CommandBuffer],
    ) {
        self.state.lock().record(
            command_buffer,
            SimulatedCommand::ExecuteCommands(secondary_command_buffers.to_vec()),
        );
    }

    /// Executes the commands recorded into the given command buffer,
    /// including those of any secondary command buffers it executes.
    ///
    /// # Panics
    /// If a timestamp is written to a query that has not been reset since it
    /// was created or last written.
    pub fn execute(&self, command_buffer: vk::CommandBuffer) {
        self.state.lock().execute(command_buffer);
    }

    pub fn recorded_commands(&self, command_buffer: vk::CommandBuffer) -> Vec<SimulatedCommand> {
        self.state
            .lock()
            .command_buffers
            .get(&command_buffer)
            .cloned()
            .unwrap_or_default()
    }

    /// Makes query pool creation fail after `n_creations` more pools have
    /// been created.
    pub fn limit_query_pool_creations(&self, n_creations: usize) {
        self.state.lock().remaining_query_pool_creations = Some(n_creations);
    }

    pub fn set_fail_result_reads(&self, fail: bool) {
        self.state.lock().fail_result_reads = fail;
    }

    pub fn set_fail_buffer_creation(&self, fail: bool) {
        self.state.lock().fail_buffer_creation = fail;
    }

    /// Makes every subsequent result read sleep for `delay` before
    /// returning. The device state stays unlocked while sleeping.
    pub fn set_result_read_delay(&self, delay: Duration) {
        self.state.lock().result_read_delay = Some(delay);
    }

    fn wait_for_result_read(&self) {
        let delay = self.state.lock().result_read_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
    }

    /// Returns the number of host reads of query results performed so far.
    pub fn result_read_count(&self) -> usize {
        self.state.lock().n_result_reads
    }

    pub fn live_query_pool_count(&self) -> usize {
        self.state.lock().query_pools.len()
    }

    pub fn live_readback_buffer_count(&self) -> usize {
        self.state.lock().readback_buffers.len()
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDeviceState {
    fn allocate_handle<H: Handle>(&mut self) -> H {
        let handle = H::from_raw(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn record(&mut self, command_buffer: vk::CommandBuffer, command: SimulatedCommand) {
        self.command_buffers
            .entry(command_buffer)
            .or_default()
            .push(command);
    }

    fn execute(&mut self, command_buffer: vk::CommandBuffer) {
        let commands = self
            .command_buffers
            .get(&command_buffer)
            .cloned()
            .unwrap_or_default();

        for command in commands {
            match command {
                SimulatedCommand::ResetQueries {
                    query_pool,
                    first_query,
                    query_count,
                } => {
                    self.reset_queries(query_pool, first_query, query_count);
                }
                SimulatedCommand::WriteTimestamp {
                    query_pool, query, ..
                } => {
                    self.clock += SIMULATED_TICKS_PER_TIMESTAMP;
                    let clock = self.clock;
                    let slot = &mut self.query_pools.get_mut(&query_pool).unwrap()[query as usize];
                    assert_eq!(
                        *slot,
                        QuerySlot::Reset,
                        "Timestamp written to query {query} of {query_pool:?} without reset"
                    );
                    *slot = QuerySlot::Written(clock);
                }
                SimulatedCommand::CopyQueryResults {
                    query_pool,
                    first_query,
                    query_count,
                    dst_buffer,
                    dst_offset,
                } => {
                    let slots = &self.query_pools[&query_pool];
                    let buffer = self.readback_buffers.get_mut(&dst_buffer).unwrap();
                    let mut offset = dst_offset as usize;
                    for slot in &slots[first_query as usize..(first_query + query_count) as usize]
                    {
                        let value = match *slot {
                            QuerySlot::Written(value) => value,
                            QuerySlot::Undefined | QuerySlot::Reset => 0,
                        };
                        buffer[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
                        offset += 8;
                    }
                }
                SimulatedCommand::ExecuteCommands(secondary_command_buffers) => {
                    for secondary in secondary_command_buffers {
                        self.execute(secondary);
                    }
                }
            }
        }
    }

    fn reset_queries(&mut self, query_pool: vk::QueryPool, first_query: u32, query_count: u32) {
        let slots = self.query_pools.get_mut(&query_pool).unwrap();
        slots[first_query as usize..(first_query + query_count) as usize].fill(QuerySlot::Reset);
    }
}

impl DeviceDispatch for SimulatedDevice {
    fn create_timestamp_query_pool(&self, query_count: u32) -> VkResult<vk::QueryPool> {
        let mut state = self.state.lock();
        if let Some(remaining) = &mut state.remaining_query_pool_creations {
            if *remaining == 0 {
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
            *remaining -= 1;
        }
        let query_pool = state.allocate_handle();
        state
            .query_pools
            .insert(query_pool, vec![QuerySlot::Undefined; query_count as usize]);
        Ok(query_pool)
    }

    fn destroy_query_pool(&self, query_pool: vk::QueryPool) {
        self.state.lock().query_pools.remove(&query_pool);
    }

    fn reset_query_pool(&self, query_pool: vk::QueryPool, first_query: u32, query_count: u32) {
        self.state
            .lock()
            .reset_queries(query_pool, first_query, query_count);
    }

    fn cmd_reset_query_pool(
        &self,
        command_buffer: vk::CommandBuffer,
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    ) {
        self.state.lock().record(
            command_buffer,
            SimulatedCommand::ResetQueries {
                query_pool,
                first_query,
                query_count,
            },
        );
    }

    fn cmd_write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        query_pool: vk::QueryPool,
        query: u32,
    ) {
        self.state.lock().record(
            command_buffer,
            SimulatedCommand::WriteTimestamp {
                query_pool,
                query,
                stage,
            },
        );
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
        self.state.lock().record(
            command_buffer,
            SimulatedCommand::CopyQueryResults {
                query_pool,
                first_query,
                query_count,
                dst_buffer,
                dst_offset,
            },
        );
    }

    fn get_query_pool_results(
        &self,
        query_pool: vk::QueryPool,
        first_query: u32,
        results: &mut [u64],
    ) -> VkResult<()> {
        self.wait_for_result_read();
        let mut state = self.state.lock();
        state.n_result_reads += 1;

        if state.fail_result_reads {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }

        let slots = state
            .query_pools
            .get(&query_pool)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;

        for (result, slot) in results.iter_mut().zip(&slots[first_query as usize..]) {
            match *slot {
                QuerySlot::Written(value) => *result = value,
                QuerySlot::Undefined | QuerySlot::Reset => return Err(vk::Result::NOT_READY),
            }
        }
        Ok(())
    }

    fn create_readback_buffer(&self, size: vk::DeviceSize) -> VkResult<vk::Buffer> {
        let mut state = self.state.lock();
        if state.fail_buffer_creation {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let buffer = state.allocate_handle();
        state.readback_buffers.insert(buffer, vec![0; size as usize]);
        Ok(buffer)
    }

    fn destroy_readback_buffer(&self, buffer: vk::Buffer) {
        self.state.lock().readback_buffers.remove(&buffer);
    }

    fn read_readback_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &mut [u8],
    ) -> VkResult<()> {
        self.wait_for_result_read();
        let mut state = self.state.lock();
        state.n_result_reads += 1;

        if state.fail_result_reads {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }

        let bytes = state
            .readback_buffers
            .get(&buffer)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let offset = offset as usize;
        data.copy_from_slice(&bytes[offset..offset + data.len()]);
        Ok(())
    }
}

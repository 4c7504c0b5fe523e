//! Frame-scoped storage for copied timestamp query results.

use crate::{HashMap, device::DeviceDispatch, query::CommandBufferQueryPool};
use ash::vk;
use std::{num::NonZeroU32, sync::Arc};
use thiserror::Error;

/// Number of bytes occupied by each query result.
pub const QUERY_RESULT_SIZE: vk::DeviceSize = size_of::<u64>() as vk::DeviceSize;

/// Opaque key identifying the owner of a range of results in a
/// [`QueryDataBuffer`], typically derived from a command buffer handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryDataContext(u64);

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum QueryDataBufferError {
    #[error("query data buffer has room for {available} more results, but {requested} were requested")]
    CapacityExceeded { requested: u32, available: u32 },
    #[error("query data for {0:?} was already recorded this frame")]
    DuplicateContext(QueryDataContext),
}

/// Buffer that the timestamp query results of many command buffers can be
/// copied into during a frame, so that they can all be read with a single
/// blocking operation.
///
/// If a device buffer can be created, results are copied into it by commands
/// recorded with [`Self::record_query_pool_copies`]. Otherwise the buffer
/// falls back to reading every recorded range from its query slabs on the
/// host when [`Self::fetch`] is called.
#[derive(Debug)]
pub struct QueryDataBuffer {
    dispatch: Arc<dyn DeviceDispatch>,
    storage: QueryDataStorage,
    capacity: NonZeroU32,
    ranges: HashMap<QueryDataContext, QueryDataRange>,
    n_reserved_results: u32,
    timestamps: Vec<u64>,
    fetched: bool,
}

#[derive(Clone, Copy, Debug)]
enum QueryDataStorage {
    Device { buffer: vk::Buffer },
    Host,
}

#[derive(Clone, Debug)]
struct QueryDataRange {
    first_result: u32,
    n_results: u32,
    slabs: Vec<(vk::QueryPool, u32)>,
}

impl QueryDataContext {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn from_handle(handle: impl vk::Handle) -> Self {
        Self(handle.as_raw())
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl QueryDataBuffer {
    /// Creates a buffer with room for `capacity` query results. If no device
    /// buffer of that size can be created, the buffer operates in host
    /// fallback mode, where the capacity is not enforced.
    pub fn new(dispatch: Arc<dyn DeviceDispatch>, capacity: NonZeroU32) -> Self {
        let size = vk::DeviceSize::from(capacity.get()) * QUERY_RESULT_SIZE;

        let storage = match dispatch.create_readback_buffer(size) {
            Ok(buffer) => QueryDataStorage::Device { buffer },
            Err(result) => {
                vkprof_log::warn!(
                    "Could not create {} byte query data buffer, falling back to host reads: {}",
                    size,
                    result
                );
                QueryDataStorage::Host
            }
        };

        Self {
            dispatch,
            storage,
            capacity,
            ranges: HashMap::default(),
            n_reserved_results: 0,
            timestamps: Vec::new(),
            fetched: false,
        }
    }

    /// Whether results are copied into a device buffer rather than read from
    /// the query slabs on the host.
    pub fn is_device_backed(&self) -> bool {
        matches!(self.storage, QueryDataStorage::Device { .. })
    }

    pub fn capacity(&self) -> NonZeroU32 {
        self.capacity
    }

    /// Returns the number of results reserved by the contexts recorded this
    /// frame.
    pub fn reserved_result_count(&self) -> u32 {
        self.n_reserved_results
    }

    pub fn contains_context(&self, context: QueryDataContext) -> bool {
        self.ranges.contains_key(&context)
    }

    /// Reserves a range of results for `context` covering every query
    /// written into `pool` in its current epoch. When device-backed, one
    /// copy per written slab is recorded into `command_buffer`, which must
    /// execute after the command buffer that wrote the queries.
    ///
    /// # Errors
    /// Returns an error if `context` already has a range this frame, or if
    /// the device buffer has no room for the results.
    pub fn record_query_pool_copies(
        &mut self,
        command_buffer: vk::CommandBuffer,
        context: QueryDataContext,
        pool: &CommandBufferQueryPool,
    ) -> Result<(), QueryDataBufferError> {
        if self.ranges.contains_key(&context) {
            return Err(QueryDataBufferError::DuplicateContext(context));
        }

        let n_results = pool.query_count();

        if let QueryDataStorage::Device { buffer } = self.storage {
            let available = self.capacity.get() - self.n_reserved_results;
            if n_results > available {
                return Err(QueryDataBufferError::CapacityExceeded {
                    requested: n_results,
                    available,
                });
            }

            let mut dst_result = self.n_reserved_results;
            for (slab, n_slab_results) in pool.written_slabs() {
                self.dispatch.cmd_copy_query_pool_results(
                    command_buffer,
                    slab,
                    0,
                    n_slab_results,
                    buffer,
                    vk::DeviceSize::from(dst_result) * QUERY_RESULT_SIZE,
                );
                dst_result += n_slab_results;
            }
        }

        self.ranges.insert(
            context,
            QueryDataRange {
                first_result: self.n_reserved_results,
                n_results,
                slabs: pool.written_slabs().collect(),
            },
        );
        self.n_reserved_results += n_results;
        self.fetched = false;

        Ok(())
    }

    /// Reads every result recorded this frame to the host, blocking until
    /// they are available. Results that can not be read are zeroed.
    pub fn fetch(&mut self) {
        vkprof_log::with_trace_logging!(
            "Fetching {} query results", self.n_reserved_results;
            self.fetch_results()
        );
        self.fetched = true;
    }

    /// Returns the results recorded for `context`, or [`None`] if the
    /// context has no range or [`Self::fetch`] has not been called since the
    /// range was recorded.
    pub fn context_data(&self, context: QueryDataContext) -> Option<&[u64]> {
        if !self.fetched {
            return None;
        }
        let range = self.ranges.get(&context)?;
        let start = range.first_result as usize;
        Some(&self.timestamps[start..start + range.n_results as usize])
    }

    /// Forgets every range recorded this frame so that the buffer can be
    /// reused.
    pub fn reset(&mut self) {
        self.ranges.clear();
        self.n_reserved_results = 0;
        self.timestamps.clear();
        self.fetched = false;
    }

    fn fetch_results(&mut self) {
        self.timestamps.clear();
        self.timestamps
            .resize(self.n_reserved_results as usize, 0);

        match self.storage {
            QueryDataStorage::Device { buffer } => {
                if self.timestamps.is_empty() {
                    return;
                }
                let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut self.timestamps);
                if let Err(result) = self.dispatch.read_readback_buffer(buffer, 0, bytes) {
                    vkprof_log::warn!("Could not read query data buffer: {}", result);
                    self.timestamps.fill(0);
                }
            }
            QueryDataStorage::Host => {
                for range in self.ranges.values() {
                    let mut start = range.first_result as usize;
                    for &(slab, n_slab_results) in &range.slabs {
                        let end = start + n_slab_results as usize;
                        let segment = &mut self.timestamps[start..end];
                        if let Err(result) = self.dispatch.get_query_pool_results(slab, 0, segment)
                        {
                            vkprof_log::warn!(
                                "Could not read {} timestamp queries from {:?}: {}",
                                n_slab_results,
                                slab,
                                result
                            );
                            segment.fill(0);
                        }
                        start = end;
                    }
                }
            }
        }
    }
}

impl Drop for QueryDataBuffer {
    fn drop(&mut self) {
        if let QueryDataStorage::Device { buffer } = self.storage {
            self.dispatch.destroy_readback_buffer(buffer);
        }
    }
}

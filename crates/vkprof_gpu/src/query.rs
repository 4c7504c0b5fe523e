//! Timestamp query slots for a single command buffer.

use crate::device::DeviceDispatch;
use ash::vk;
use std::{num::NonZeroU32, sync::Arc};
use thiserror::Error;

/// Number of timestamp queries in each slab unless configured otherwise.
pub const DEFAULT_QUERY_SLAB_CAPACITY: NonZeroU32 = NonZeroU32::new(32768).unwrap();

/// Fraction of the current slab that must be filled before
/// [`CommandBufferQueryPool::grow_if_almost_full`] allocates a spare slab,
/// unless configured otherwise.
pub const DEFAULT_SLAB_GROWTH_THRESHOLD: f32 = 0.85;

/// How the queries of a slab are reset before they are written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueryResetMode {
    /// Resets are recorded into the command buffer. New slabs can not be
    /// opened while a render pass is open.
    #[default]
    CommandBuffer,
    /// Resets are performed on the host. Used for command buffers whose
    /// whole recording lies within a render pass.
    Host,
}

/// Location of a written timestamp query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueryIndex {
    pub slab: u32,
    pub query: u32,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum QueryPoolError {
    #[error("could not create timestamp query slab: {0}")]
    SlabCreation(vk::Result),
    #[error("timestamp query capacity exhausted while a render pass is open")]
    CapacityExhausted,
    #[error("timestamp queries are disabled for the rest of the recording")]
    Disabled,
}

/// Growable set of timestamp query slabs owned by one command buffer.
///
/// Queries are handed out in strictly increasing order across the slabs
/// within each recording (epoch). Calling [`Self::begin`] starts a new epoch
/// that reuses the existing slabs after resetting them. Once a query can not
/// be provided, the pool refuses further writes until the next epoch.
#[derive(Debug)]
pub struct CommandBufferQueryPool {
    dispatch: Arc<dyn DeviceDispatch>,
    slab_capacity: NonZeroU32,
    slabs: Vec<vk::QueryPool>,
    current_slab: usize,
    n_queries_in_current_slab: u32,
    reset_mode: QueryResetMode,
    render_pass_open: bool,
    disabled: bool,
}

impl CommandBufferQueryPool {
    /// Creates a pool whose slabs will hold `slab_capacity` queries each. No
    /// slabs are created until [`Self::begin`] is called.
    pub fn new(dispatch: Arc<dyn DeviceDispatch>, slab_capacity: NonZeroU32) -> Self {
        Self {
            dispatch,
            slab_capacity,
            slabs: Vec::new(),
            current_slab: 0,
            n_queries_in_current_slab: 0,
            reset_mode: QueryResetMode::default(),
            render_pass_open: false,
            disabled: false,
        }
    }

    pub fn slab_capacity(&self) -> NonZeroU32 {
        self.slab_capacity
    }

    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// Whether writes are refused for the rest of the current epoch.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the number of queries written in the current epoch.
    pub fn query_count(&self) -> u32 {
        if self.slabs.is_empty() {
            0
        } else {
            self.current_slab as u32 * self.slab_capacity.get() + self.n_queries_in_current_slab
        }
    }

    /// Informs the pool of whether the command buffer currently has an open
    /// render pass, which determines whether new slabs can be opened.
    pub fn set_render_pass_open(&mut self, open: bool) {
        self.render_pass_open = open;
    }

    /// Starts a new epoch for a recording into `command_buffer`.
    ///
    /// On the first call a slab is created. Otherwise, every existing slab is
    /// reset for reuse, either by recording a reset into the command buffer
    /// or on the host, depending on `reset_mode`.
    ///
    /// # Errors
    /// Returns an error if the first slab could not be created, in which
    /// case the pool is disabled for the epoch.
    pub fn begin(
        &mut self,
        command_buffer: vk::CommandBuffer,
        reset_mode: QueryResetMode,
    ) -> Result<(), QueryPoolError> {
        self.reset_mode = reset_mode;
        self.render_pass_open = false;
        self.disabled = false;
        self.current_slab = 0;
        self.n_queries_in_current_slab = 0;

        if self.slabs.is_empty() {
            return self.create_slab(command_buffer);
        }

        for &slab in &self.slabs {
            self.reset_slab(command_buffer, slab);
        }
        Ok(())
    }

    /// Records a write of the device timestamp at `stage` into the next
    /// free query, opening a new slab if the current one is full.
    ///
    /// # Errors
    /// Returns an error if the pool is disabled, or if a new slab was needed
    /// but could not be opened. The pool is disabled for the rest of the
    /// epoch in the latter case.
    pub fn write_timestamp(
        &mut self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
    ) -> Result<QueryIndex, QueryPoolError> {
        if self.disabled {
            return Err(QueryPoolError::Disabled);
        }

        if self.slabs.is_empty() || self.n_queries_in_current_slab == self.slab_capacity.get() {
            self.advance_slab(command_buffer)?;
        }

        let query = self.n_queries_in_current_slab;
        self.n_queries_in_current_slab += 1;

        self.dispatch.cmd_write_timestamp(
            command_buffer,
            stage,
            self.slabs[self.current_slab],
            query,
        );

        Ok(QueryIndex {
            slab: self.current_slab as u32,
            query,
        })
    }

    /// Makes sure a spare slab is ready if more than the `threshold` fraction
    /// of the current slab has been written. Must be called before a render
    /// pass begins, since slabs reset through the command buffer can not be
    /// opened inside one.
    ///
    /// # Errors
    /// Returns an error if a spare slab was needed but could not be created,
    /// in which case the pool is disabled for the epoch.
    pub fn grow_if_almost_full(
        &mut self,
        command_buffer: vk::CommandBuffer,
        threshold: f32,
    ) -> Result<(), QueryPoolError> {
        if self.disabled || !self.can_open_slab() {
            return Ok(());
        }

        if self.slabs.is_empty() {
            return self.create_slab(command_buffer);
        }

        let has_spare_slab = self.current_slab + 1 < self.slabs.len();
        let filled_fraction = f64::from(self.n_queries_in_current_slab)
            / f64::from(self.slab_capacity.get());

        if !has_spare_slab && filled_fraction > f64::from(threshold) {
            self.create_slab(command_buffer)?;
        }
        Ok(())
    }

    /// Returns each slab holding queries written in the current epoch
    /// together with the number of written queries in it, in write order.
    pub fn written_slabs(&self) -> impl Iterator<Item = (vk::QueryPool, u32)> + '_ {
        let n_written_slabs = if self.slabs.is_empty() {
            0
        } else {
            self.current_slab + 1
        };
        self.slabs[..n_written_slabs]
            .iter()
            .enumerate()
            .map(|(idx, &slab)| {
                let n_queries = if idx == self.current_slab {
                    self.n_queries_in_current_slab
                } else {
                    self.slab_capacity.get()
                };
                (slab, n_queries)
            })
            .filter(|&(_, n_queries)| n_queries > 0)
    }

    /// Reads the values of all queries written in the current epoch, blocking
    /// until they are available. The values are returned contiguously in
    /// write order.
    ///
    /// A slab whose results can not be read contributes zeros.
    pub fn read_back(&self) -> Vec<u64> {
        let mut timestamps = Vec::with_capacity(self.query_count() as usize);

        for (slab, n_queries) in self.written_slabs() {
            let start = timestamps.len();
            timestamps.resize(start + n_queries as usize, 0);
            let segment = &mut timestamps[start..];

            if let Err(result) = self.dispatch.get_query_pool_results(slab, 0, segment) {
                vkprof_log::warn!(
                    "Could not read {} timestamp queries from {:?}: {}",
                    n_queries,
                    slab,
                    result
                );
                segment.fill(0);
            }
        }

        timestamps
    }

    fn can_open_slab(&self) -> bool {
        !self.render_pass_open || self.reset_mode == QueryResetMode::Host
    }

    fn advance_slab(&mut self, command_buffer: vk::CommandBuffer) -> Result<(), QueryPoolError> {
        let next_slab = if self.slabs.is_empty() {
            0
        } else {
            self.current_slab + 1
        };

        if next_slab == self.slabs.len() {
            if !self.can_open_slab() {
                self.disabled = true;
                vkprof_log::warn!(
                    "Timestamp query capacity of {} queries exhausted inside a render pass, \
                     dropping remaining queries of the recording",
                    self.query_count()
                );
                return Err(QueryPoolError::CapacityExhausted);
            }
            self.create_slab(command_buffer)?;
        }

        self.current_slab = next_slab;
        self.n_queries_in_current_slab = 0;
        Ok(())
    }

    fn create_slab(&mut self, command_buffer: vk::CommandBuffer) -> Result<(), QueryPoolError> {
        match self
            .dispatch
            .create_timestamp_query_pool(self.slab_capacity.get())
        {
            Ok(slab) => {
                self.reset_slab(command_buffer, slab);
                self.slabs.push(slab);
                Ok(())
            }
            Err(result) => {
                self.disabled = true;
                vkprof_log::warn!(
                    "Could not create timestamp query slab, dropping remaining queries of the recording: {}",
                    result
                );
                Err(QueryPoolError::SlabCreation(result))
            }
        }
    }

    fn reset_slab(&self, command_buffer: vk::CommandBuffer, slab: vk::QueryPool) {
        match self.reset_mode {
            QueryResetMode::CommandBuffer => self.dispatch.cmd_reset_query_pool(
                command_buffer,
                slab,
                0,
                self.slab_capacity.get(),
            ),
            QueryResetMode::Host => {
                self.dispatch
                    .reset_query_pool(slab, 0, self.slab_capacity.get());
            }
        }
    }
}

impl Drop for CommandBufferQueryPool {
    fn drop(&mut self) {
        for slab in self.slabs.drain(..) {
            self.dispatch.destroy_query_pool(slab);
        }
    }
}

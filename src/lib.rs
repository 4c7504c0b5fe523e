//! GPU command buffer profiling for Vulkan.
//!
//! Shadows the commands recorded into command buffers as trees of commands,
//! writes timestamp queries around the profiled commands, and resolves the
//! query results into immutable snapshots once the command buffers have been
//! submitted and executed.

pub mod command_buffer;
pub mod config;
pub mod profiler;
pub mod submission;

pub use ash;
pub use vkprof_commands as commands;
pub use vkprof_gpu as gpu;

use rustc_hash::FxBuildHasher;

pub(crate) type HashMap<K, V> = hashbrown::HashMap<K, V, FxBuildHasher>;

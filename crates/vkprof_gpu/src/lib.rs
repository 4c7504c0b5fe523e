//! GPU resources for timestamp profiling of command buffers.

pub mod device;
pub mod query;
pub mod query_data;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use ash::vk;

use rustc_hash::FxBuildHasher;

pub(crate) type HashMap<K, V> = hashbrown::HashMap<K, V, FxBuildHasher>;

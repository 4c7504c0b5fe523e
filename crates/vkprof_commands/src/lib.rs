//! Shadow recording of command buffers as trees of commands, and resolution
//! of GPU timestamps onto those trees.

pub mod builder;
pub mod command;
pub mod resolve;
pub mod snapshot;
pub mod stats;
pub mod tree;
pub mod visitor;

pub use ash::vk;

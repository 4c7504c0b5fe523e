//! Configuration of the profiler.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{env, fs, num::NonZeroU32, path::Path};
use vkprof_gpu::query::{DEFAULT_QUERY_SLAB_CAPACITY, DEFAULT_SLAB_GROWTH_THRESHOLD};

/// Environment variable holding the path of a RON file to load the
/// configuration from.
pub const CONFIG_PATH_ENV_VAR: &str = "VKPROF_CONFIG";

/// Number of query results a frame's query data buffer has room for unless
/// configured otherwise.
pub const DEFAULT_QUERY_DATA_BUFFER_CAPACITY: NonZeroU32 = NonZeroU32::new(65536).unwrap();

/// Which commands get timestamp queries written around them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingMode {
    /// Every draw, dispatch, transfer, clear and barrier, as well as the
    /// beginning and end of every render pass.
    #[default]
    PerCommand,
    /// Every run of draws or dispatches sharing a bound pipeline as a whole,
    /// and every other command as in [`Self::PerCommand`].
    PerPipeline,
    /// Only the beginning and end of render passes, and the commands
    /// recorded outside of render passes.
    PerRenderPass,
    /// Only the whole recording of each command buffer.
    PerCommandBuffer,
}

/// Configuration parameters for the profiler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    pub sampling_mode: SamplingMode,
    /// Number of timestamp queries in each query slab of a command buffer.
    pub query_slab_capacity: NonZeroU32,
    /// Fraction of the current query slab that must be used for a spare
    /// slab to be created before a render pass begins.
    pub slab_growth_threshold: f32,
    /// Number of query results that a [`QueryDataBuffer`] created with
    /// [`DeviceProfiler::create_query_data_buffer`] has room for.
    ///
    /// [`QueryDataBuffer`]: vkprof_gpu::query_data::QueryDataBuffer
    /// [`DeviceProfiler::create_query_data_buffer`]: crate::profiler::DeviceProfiler::create_query_data_buffer
    pub query_data_buffer_capacity: NonZeroU32,
}

impl ProfilerConfig {
    /// Parses the configuration from the RON file at the given path.
    ///
    /// # Errors
    /// Returns an error if the file can not be read or parsed, or if the
    /// configuration is invalid.
    pub fn from_ron_file(file_path: impl AsRef<Path>) -> Result<Self> {
        let file_path = file_path.as_ref();

        let text = fs::read_to_string(file_path)
            .with_context(|| format!("Could not read {}", file_path.display()))?;

        let config: Self = ron::from_str(&text)
            .with_context(|| format!("Invalid profiler configuration in {}", file_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration to a RON file at the given path, creating
    /// any missing parent directories.
    ///
    /// # Errors
    /// Returns an error if the file can not be written.
    pub fn save_to_ron_file(&self, file_path: impl AsRef<Path>) -> Result<()> {
        let file_path = file_path.as_ref();
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;

        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(file_path, text)
            .with_context(|| format!("Could not write {}", file_path.display()))
    }

    /// Loads the configuration from the file named by the
    /// [`CONFIG_PATH_ENV_VAR`] environment variable, or returns the default
    /// configuration if the variable is not set or the file can not be
    /// loaded.
    pub fn load() -> Self {
        let Some(file_path) = env::var_os(CONFIG_PATH_ENV_VAR) else {
            return Self::default();
        };
        match Self::from_ron_file(&file_path) {
            Ok(config) => {
                vkprof_log::info!(
                    "Loaded profiler configuration from {}",
                    Path::new(&file_path).display()
                );
                config
            }
            Err(error) => {
                vkprof_log::warn!("Using default profiler configuration: {:#}", error);
                Self::default()
            }
        }
    }

    /// # Errors
    /// Returns an error if the slab growth threshold is not a fraction
    /// between zero and one.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.slab_growth_threshold) {
            bail!(
                "Slab growth threshold must be between 0 and 1, got {}",
                self.slab_growth_threshold
            );
        }
        Ok(())
    }
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            sampling_mode: SamplingMode::default(),
            query_slab_capacity: DEFAULT_QUERY_SLAB_CAPACITY,
            slab_growth_threshold: DEFAULT_SLAB_GROWTH_THRESHOLD,
            query_data_buffer_capacity: DEFAULT_QUERY_DATA_BUFFER_CAPACITY,
        }
    }
}

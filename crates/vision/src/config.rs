//! Run-wide detector configuration.
//!
//! Built once at startup (normally from the CLI) and shared read-only by every
//! replica and the transform service.

use std::path::PathBuf;

use clap::ValueEnum;
use thiserror::Error;

/// Backend used for colour conversion and resizing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Accel2d {
    /// CPU path through the `image` crate (or OpenCL when enabled).
    Software,
    /// Rockchip RGA 2D engine.
    #[default]
    Rga,
}

/// How buffers are handed to the 2D engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum MemoryMapping {
    /// Wrap host buffers by virtual address for each call.
    #[default]
    Direct,
    /// Import both buffers first and release the handles afterwards.
    Imported,
}

#[derive(Clone, Debug)]
pub struct DetectorConfig {
    /// Number of model replicas and worker threads.
    pub replicas: usize,
    pub accel: Accel2d,
    pub mapping: MemoryMapping,
    pub model_path: PathBuf,
    /// Route software resizes through OpenCL (needs the `opencl` feature).
    pub opencl: bool,
    /// Fall back to the software path when the engine rejects a layout.
    pub software_fallback: bool,
    pub conf_threshold: f32,
    pub nms_threshold: f32,
}

impl DetectorConfig {
    pub const DEFAULT_CONF_THRESHOLD: f32 = 0.25;
    pub const DEFAULT_NMS_THRESHOLD: f32 = 0.45;

    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            replicas: 1,
            accel: Accel2d::default(),
            mapping: MemoryMapping::default(),
            model_path: model_path.into(),
            opencl: false,
            software_fallback: true,
            conf_threshold: Self::DEFAULT_CONF_THRESHOLD,
            nms_threshold: Self::DEFAULT_NMS_THRESHOLD,
        }
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_accel(mut self, accel: Accel2d, mapping: MemoryMapping) -> Self {
        self.accel = accel;
        self.mapping = mapping;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.replicas == 0 {
            return Err(ConfigError::NoReplicas);
        }
        for (name, value) in [
            ("confidence", self.conf_threshold),
            ("nms", self.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Threshold { name, value });
            }
        }
        if self.opencl && !cfg!(feature = "opencl") {
            return Err(ConfigError::OpenClUnavailable);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs for tracing output.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Default log filter when `RUST_LOG` is unset.
    pub default_filter: Option<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("at least one replica is required")]
    NoReplicas,
    #[error("{name} threshold {value} is outside [0, 1]")]
    Threshold { name: &'static str, value: f32 },
    #[error("OpenCL resize requested but this build lacks the `opencl` feature")]
    OpenClUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = DetectorConfig::new("model.rknn");
        assert_eq!(config.replicas, 1);
        assert_eq!(config.accel, Accel2d::Rga);
        assert!(config.software_fallback);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_replicas_and_wild_thresholds() {
        let config = DetectorConfig::new("m").with_replicas(0);
        assert_eq!(config.validate(), Err(ConfigError::NoReplicas));

        let mut config = DetectorConfig::new("m");
        config.nms_threshold = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Threshold { name: "nms", .. })
        ));
    }
}

//! Fabric manager configuration.
//!
//! The configuration file is YAML. Every field carries a default so a partial
//! (or empty) document yields a usable configuration; [`FmConfig::validate`]
//! rejects combinations the engines cannot run with.
//!
//! ```yaml
//! log:
//!   level: debug
//! pm:
//!   total_images: 10
//!   freeze_frame_images: 5
//!   short_term_history:
//!     enable: true
//! qos:
//!   use_fixed_scvl_maps: true
//!   min_supported_vls: 8
//! ```

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FmConfig {
    /// Logging configuration.
    pub log: LogConfig,
    /// Performance Manager configuration.
    pub pm: PmConfig,
    /// Subnet Manager QoS configuration.
    pub qos: QosConfig,
}

impl FmConfig {
    /// Parses and validates a YAML document.
    pub fn from_yaml_str(doc: &str) -> ConfigResult<Self> {
        let config: FmConfig = serde_yaml::from_str(doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a YAML file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&doc)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.pm.validate()?;
        self.qos.validate()
    }
}

/// Logging configuration consumed by [`crate::telemetry::init_tracing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Performance Manager image store and query configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PmConfig {
    /// Number of slots in the sweep image ring.
    pub total_images: usize,
    /// Number of freeze-frame slots (and cached composite slots).
    pub freeze_frame_images: usize,
    /// Seconds after which an unrenewed freeze frame may be reclaimed.
    pub freeze_frame_lease_secs: u64,
    /// Largest fabric the PM is sized for; bounds focus query ranges.
    pub subnet_size: u32,
    /// Whether per-VL counters are collected (required by VF queries).
    pub process_vl_counters: bool,
    /// Seconds between sweeps.
    pub sweep_interval_secs: u32,
    pub short_term_history: ShortTermHistoryConfig,
    pub integrity_weights: IntegrityWeights,
    pub congestion_weights: CongestionWeights,
    pub thresholds: ErrorThresholds,
}

impl Default for PmConfig {
    fn default() -> Self {
        Self {
            total_images: 10,
            freeze_frame_images: 5,
            freeze_frame_lease_secs: 60,
            subnet_size: 2560,
            process_vl_counters: true,
            sweep_interval_secs: 10,
            short_term_history: ShortTermHistoryConfig::default(),
            integrity_weights: IntegrityWeights::default(),
            congestion_weights: CongestionWeights::default(),
            thresholds: ErrorThresholds::default(),
        }
    }
}

impl PmConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.total_images < 3 || self.total_images > 255 {
            return Err(ConfigError::invalid(
                "pm.total_images",
                format!("{} is outside 3..=255", self.total_images),
            ));
        }
        // The writer needs one slot that is neither frozen nor the live image.
        if self.freeze_frame_images == 0 || self.freeze_frame_images + 2 > self.total_images {
            return Err(ConfigError::invalid(
                "pm.freeze_frame_images",
                format!(
                    "{} must be nonzero and at most total_images - 2 ({})",
                    self.freeze_frame_images,
                    self.total_images.saturating_sub(2)
                ),
            ));
        }
        if self.subnet_size == 0 {
            return Err(ConfigError::invalid("pm.subnet_size", "must be nonzero"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "pm.sweep_interval_secs",
                "must be nonzero",
            ));
        }
        if self.short_term_history.images_per_composite == 0 {
            return Err(ConfigError::invalid(
                "pm.short_term_history.images_per_composite",
                "must be nonzero",
            ));
        }
        Ok(())
    }
}

/// Short-term history (composite image) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShortTermHistoryConfig {
    pub enable: bool,
    /// Sweep images folded into one composite before it is written out.
    pub images_per_composite: u32,
    /// Compress composite divisions with zlib.
    pub compress: bool,
    /// Number of independently compressed divisions per composite.
    pub divisions: u16,
}

impl Default for ShortTermHistoryConfig {
    fn default() -> Self {
        Self {
            enable: false,
            images_per_composite: 3,
            compress: true,
            divisions: 4,
        }
    }
}

/// Weights applied to link integrity counters when scoring a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityWeights {
    pub local_link_integrity_errors: u8,
    pub port_rcv_errors: u8,
    pub excessive_buffer_overruns: u8,
    pub link_error_recovery: u8,
    pub link_downed: u8,
    pub uncorrectable_errors: u8,
    pub fm_config_errors: u8,
    pub link_quality_indicator: u8,
    pub link_width_downgrade: u8,
}

impl Default for IntegrityWeights {
    fn default() -> Self {
        Self {
            local_link_integrity_errors: 0,
            port_rcv_errors: 100,
            excessive_buffer_overruns: 100,
            link_error_recovery: 0,
            link_downed: 25,
            uncorrectable_errors: 100,
            fm_config_errors: 100,
            link_quality_indicator: 40,
            link_width_downgrade: 100,
        }
    }
}

/// Weights applied to congestion counters when scoring a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CongestionWeights {
    pub port_xmit_wait_pct: u8,
    pub sw_port_congestion: u8,
    pub port_rcv_fecn_pct: u8,
    pub port_rcv_becn_pct: u8,
    pub port_xmit_time_cong_pct: u8,
    pub port_mark_fecn_pct: u8,
}

impl Default for CongestionWeights {
    fn default() -> Self {
        Self {
            port_xmit_wait_pct: 10,
            sw_port_congestion: 25,
            port_rcv_fecn_pct: 5,
            port_rcv_becn_pct: 1,
            port_xmit_time_cong_pct: 25,
            port_mark_fecn_pct: 25,
        }
    }
}

/// Per-category thresholds used to bucket group error statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorThresholds {
    pub integrity: u32,
    pub congestion: u32,
    pub sma_congestion: u32,
    pub bubble: u32,
    pub security: u32,
    pub routing: u32,
}

impl Default for ErrorThresholds {
    fn default() -> Self {
        Self {
            integrity: 100,
            congestion: 100,
            sma_congestion: 100,
            bubble: 100,
            security: 10,
            routing: 100,
        }
    }
}

/// Subnet Manager QoS configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// Use the static SC:VL table instead of per-VL-count allocation.
    pub use_fixed_scvl_maps: bool,
    /// VL count every port is expected to support in fixed-map mode.
    pub min_supported_vls: u8,
    /// Dedicated buffer multiplier (MTU-sized packets per data VL).
    pub dedicated_vl_mem_multi: u8,
    /// Percentage of port buffer memory reserved as shared.
    pub min_shared_vl_mem: u8,
    /// Write arbitration tables even when they match the port's tables.
    pub force_attribute_rewrite: bool,
    /// Hardware arbitration table capacity used when a port reports none.
    pub vlarb_cap: u8,
    /// Wire depth in bytes. Unset uses the port's wire depth; 0 ignores it.
    pub wire_depth_override: Option<u32>,
    /// Replay buffer depth in bytes. Unset uses the port's buffer depth; 0
    /// ignores it. The effective depth is the smaller of the two terms.
    pub replay_depth_override: Option<u32>,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            use_fixed_scvl_maps: false,
            min_supported_vls: 8,
            dedicated_vl_mem_multi: 2,
            min_shared_vl_mem: 0,
            force_attribute_rewrite: false,
            vlarb_cap: 16,
            wire_depth_override: None,
            replay_depth_override: None,
        }
    }
}

impl QosConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.min_supported_vls == 0 || self.min_supported_vls > 31 {
            return Err(ConfigError::invalid(
                "qos.min_supported_vls",
                format!("{} is outside 1..=31", self.min_supported_vls),
            ));
        }
        if self.min_shared_vl_mem > 100 {
            return Err(ConfigError::invalid(
                "qos.min_shared_vl_mem",
                format!("{}% exceeds 100%", self.min_shared_vl_mem),
            ));
        }
        if self.vlarb_cap == 0 {
            return Err(ConfigError::invalid("qos.vlarb_cap", "must be nonzero"));
        }
        Ok(())
    }
}

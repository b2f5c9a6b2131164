//! Common infrastructure for the fabric manager crates.
//!
//! This crate provides the ambient pieces shared by the Performance Manager
//! access layer (`pm-access`) and the Subnet Manager QoS engine (`sm-qos`):
//!
//! - [`error`]: Configuration error types
//! - [`config`]: YAML configuration with per-field defaults
//! - [`audit`]: Structured audit records and the `audit_log!` macro
//! - [`telemetry`]: `tracing` subscriber bootstrap
//!
//! # Example
//!
//! ```ignore
//! use fm_common::{config::FmConfig, telemetry};
//!
//! let config = FmConfig::load("/etc/fm/fm.yaml")?;
//! telemetry::init_tracing(&config.log);
//! ```

pub mod audit;
pub mod config;
pub mod error;
pub mod telemetry;

// Re-export commonly used items at crate root
pub use audit::{AuditCategory, AuditOutcome, AuditRecord};
pub use config::{
    CongestionWeights, ErrorThresholds, FmConfig, IntegrityWeights, LogConfig, PmConfig,
    QosConfig, ShortTermHistoryConfig,
};
pub use error::{ConfigError, ConfigResult};

//! Error types for QoS map computation.

use thiserror::Error;

/// Result type alias for QoS operations.
pub type Result<T> = std::result::Result<T, QosError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QosError {
    /// Data VL counts run from 1 to 31.
    #[error("Invalid number of data VLs: {0}")]
    InvalidVlCount(u8),

    /// The fixed SC space cannot hold this many high-priority VFs per VL.
    #[error("Oversubscribed VLs, too many HP/LP VFs: HPVF {high}, LPVF {low}, VLs {vls}")]
    Oversubscribed { high: usize, low: usize, vls: u8 },

    /// Fixed SC:VL maps support a single routing SC per VF.
    #[error("Virtual fabric {vf} uses {scs} routing SCs, fixed maps require 1")]
    RoutingScs { vf: String, scs: u8 },

    /// Buffer control fell back to the worst-case rule; some data VLs have
    /// no dedicated memory and may not make forward progress.
    #[error("Buffer control applied rule C, forward progress is not guaranteed")]
    BufferRuleC,

    /// Port buffer attributes that no allocation can satisfy.
    #[error("Invalid port buffer parameters: {reason}")]
    InvalidPort { reason: String },
}

impl QosError {
    pub fn invalid_port(reason: impl Into<String>) -> Self {
        Self::InvalidPort {
            reason: reason.into(),
        }
    }
}

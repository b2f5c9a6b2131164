//! Performance Manager access layer.
//!
//! The PM sweeps the fabric periodically and records each sweep as an
//! [`image::ImageData`] in a fixed ring owned by [`PmStore`]. This crate
//! serves read-only queries against those images:
//!
//! - [`image_id`]: opaque 64-bit image ids and their resolution rules
//! - [`store`]: the image ring, busy accounting and sweep commit
//! - [`freeze`]: client-pinned freeze frames with lease expiry
//! - [`history`]: short-term history records and their reconstitution
//! - [`metrics`]: per-port utilization and error-category metrics
//! - [`query`]: group, port, VF, focus and image-summary queries
//!
//! # Example
//!
//! ```ignore
//! use pm_access::{ImageIdQuery, PmStore};
//!
//! let store = PmStore::new(config.pm.clone())?;
//! store.commit_sweep(image)?;
//! let (groups, returned) = store.get_group_list(&ImageIdQuery::live())?;
//! ```

pub mod counters;
pub mod error;
mod freeze;
pub mod history;
pub mod image;
pub mod image_id;
pub mod metrics;
pub mod query;
pub mod store;

#[cfg(test)]
mod test_support;

pub use counters::{CounterSelect, PortCounters, PortTotals, VlCounterSelect, VlCounters};
pub use error::{PaError, PaStatusCode, Result};
pub use history::{HistorySource, MemoryHistorySource, ReconstituteOutcome};
pub use image::{ImageData, NodeIdentity, NodeType, PmNode, PmPort, PortRef, QueryStatus};
pub use image_id::{ImageId, ImageIdQuery, ReturnedImageId};
pub use store::{Clock, PmStore, SystemClock};

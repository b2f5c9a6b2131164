//! Subnet Manager QoS engine.
//!
//! Turns the configured virtual fabrics into what every port needs to carry
//! them: an SC to VL map with per-VL bandwidth, VL arbitration tables and
//! transmit buffer limits.
//!
//! - [`allocator`]: bandwidth-proportional SC to VL allocation per VL count
//! - [`fixed_map`]: the static SC:VL table and SL to SC assignment
//! - [`vlvf`]: which fabrics share each VL
//! - [`vlarb`]: high and low priority arbitration tables
//! - [`buffer`]: dedicated and shared buffer limits per VL
//!
//! # Example
//!
//! ```ignore
//! use sm_qos::{fill_vlarb_table, setup_sc2vl, ScSlMaps, SlBandwidth};
//!
//! let sl_bw = SlBandwidth::from_vfs(&vfs);
//! let table = setup_sc2vl(&vfs, &ScSlMaps::identity(), &sl_bw)?;
//! let tables = fill_vlarb_table(table.get(port_vls), &port, &config.qos);
//! ```

pub mod allocator;
pub mod buffer;
pub mod error;
pub mod fixed_map;
pub mod types;
pub mod vlarb;
pub mod vlvf;

pub use allocator::{allocate_vl, setup_sc2vl, QosTable, ScVlMode};
pub use buffer::{
    initialize_port_buffer_control, setup_buffer_control, BufferAllocation, BufferControlTable,
    BufferRule, PortBufferInfo,
};
pub use error::{QosError, Result};
pub use fixed_map::{setup_sc2vl_fixed_map, FixedMap};
pub use types::{
    BitSet32, Qos, ScSlMaps, SlBandwidth, VfPriority, VirtualFabric, VirtualFabrics,
};
pub use vlarb::{
    fill_low_rr, fill_vlarb_table, fill_vlarb_table_default, PortArbInfo, VlArbElement,
    VlArbTables, VlArbUpdate,
};
pub use vlvf::{setup_vlvf_map, VlVfMap};

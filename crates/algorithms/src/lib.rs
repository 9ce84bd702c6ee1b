//! # demflow Algorithms
//!
//! Hydrological analysis algorithms for demflow.
//!
//! ## Available Algorithms
//!
//! - **hydrology**: D8 flow direction and Barnes-Lehman-Mulla flat
//!   resolution (synthetic drainage gradients across flat terrain)

pub mod hydrology;

pub(crate) mod maybe_rayon;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::hydrology::{
        barnes_flat_resolution_d8, d8_flats_alter_dem, d8_flow_flats, flow_direction,
        resolve_flats, FlatResolution, FlatResolutionParams, FlowDirection, FLOWDIR_NODATA,
        NO_FLOW,
    };
    pub use demflow_core::prelude::*;
}

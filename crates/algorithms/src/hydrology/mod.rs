//! Hydrological analysis algorithms
//!
//! Algorithms for hydrological modeling from Digital Elevation Models:
//! - Flow direction: D8 single flow direction
//! - Flat resolution: synthetic drainage gradients across flat terrain
//!   (Barnes, Lehman & Mulla 2014), with an optional DEM-altering variant

pub(crate) mod flat_resolution;
pub(crate) mod flow_direction;

pub use flat_resolution::{
    barnes_flat_resolution_d8, d8_flats_alter_dem, d8_flow_flats, resolve_flats, FlatResolution,
    FlatResolutionParams, ALTER_POISON,
};
pub use flow_direction::{flow_direction, FlowDirection, FLOWDIR_NODATA, NO_FLOW};

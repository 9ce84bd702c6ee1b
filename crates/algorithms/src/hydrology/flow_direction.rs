//! D8 flow direction algorithm
//!
//! Calculates the direction of flow from each cell to its steepest
//! downslope neighbor using the D8 (deterministic eight-node) method.
//!
//! Flow direction encoding:
//! ```text
//!   4  3  2
//!   5  0  1
//!   6  7  8
//! ```
//! 0 = pit/flat (no outflow), 1-8 = direction to steepest neighbor,
//! 255 = NoData. Pits and flats are left for the flat resolver; NoData is
//! kept distinct from them so the resolver can tell "no gradient" apart
//! from "no terrain".

use crate::maybe_rayon::*;
use demflow_core::raster::{d8, Raster, RasterElement};
use demflow_core::{Algorithm, Error, Result};
use ndarray::Array2;

/// Direction code for cells with no strictly lower neighbor
pub const NO_FLOW: u8 = 0;

/// NoData sentinel for flow-direction rasters
pub const FLOWDIR_NODATA: u8 = 255;

/// Flow direction algorithm (D8)
#[derive(Debug, Clone, Default)]
pub struct FlowDirection;

impl Algorithm for FlowDirection {
    type Input = Raster<f64>;
    type Output = Raster<u8>;
    type Params = ();
    type Error = Error;

    fn name(&self) -> &'static str {
        "Flow Direction (D8)"
    }

    fn description(&self) -> &'static str {
        "Calculate D8 flow direction from a DEM"
    }

    fn execute(&self, input: Self::Input, _params: Self::Params) -> Result<Self::Output> {
        flow_direction(&input)
    }
}

/// Calculate D8 flow direction from a DEM.
///
/// Each valid cell is assigned the direction of its steepest downslope
/// neighbor, with the drop divided by the travel distance (cardinal = cell
/// size, diagonal = cell size × √2). A cell with no strictly lower neighbor
/// receives [`NO_FLOW`]; NoData cells receive [`FLOWDIR_NODATA`].
///
/// # Arguments
/// * `dem` - Input DEM (single or double precision)
///
/// # Returns
/// Raster<u8> with flow direction codes
pub fn flow_direction<T: RasterElement>(dem: &Raster<T>) -> Result<Raster<u8>> {
    let (rows, cols) = dem.shape();
    let cell_size = dem.cell_size();

    let output_data: Vec<u8> = (0..rows)
        .into_par_iter()
        .flat_map(|row| {
            let mut row_data = vec![NO_FLOW; cols];

            for col in 0..cols {
                let center = unsafe { dem.get_unchecked(row, col) };

                if dem.is_nodata(center) {
                    row_data[col] = FLOWDIR_NODATA;
                    continue;
                }
                let center = match center.to_f64() {
                    Some(v) => v,
                    None => {
                        row_data[col] = FLOWDIR_NODATA;
                        continue;
                    }
                };

                let mut max_drop = 0.0_f64;
                let mut best_dir: u8 = NO_FLOW;

                for dir in 1..=8u8 {
                    let (dr, dc) = d8::OFFSETS[dir as usize];
                    let nr = row as isize + dr;
                    let nc = col as isize + dc;

                    if !dem.in_grid(nr, nc) {
                        continue;
                    }

                    let neighbor = unsafe { dem.get_unchecked(nr as usize, nc as usize) };

                    if dem.is_nodata(neighbor) {
                        continue;
                    }
                    let neighbor = match neighbor.to_f64() {
                        Some(v) => v,
                        None => continue,
                    };

                    // Drop = (center - neighbor) / distance
                    let distance = d8::DISTANCES[dir as usize] * cell_size;
                    let drop = (center - neighbor) / distance;

                    if drop > max_drop {
                        max_drop = drop;
                        best_dir = dir;
                    }
                }

                row_data[col] = best_dir;
            }

            row_data
        })
        .collect();

    let mut output = dem.with_same_meta::<u8>(rows, cols);
    output.set_nodata(Some(FLOWDIR_NODATA));
    *output.data_mut() = Array2::from_shape_vec((rows, cols), output_data)
        .map_err(|e| Error::Other(e.to_string()))?;

    Ok(output)
}

//! Flat resolution for D8 flow routing
//!
//! Assigns drainage directions across flats (connected regions of equal
//! elevation with no local gradient) by superposing two breadth-first
//! gradients: one growing away from the flat's high edges, one growing away
//! from its low edges. The combination yields an integer "flat mask" that
//! drains every flat toward its outlets while steering flow away from
//! higher surrounding terrain.
//!
//! The mask can be consumed two ways: [`d8_flow_flats`] assigns D8
//! directions directly from it, and [`d8_flats_alter_dem`] instead raises
//! the DEM by per-cell counts of representable-float increments so a plain
//! D8 pass on the altered DEM produces the same drainage.
//!
//! Reference:
//! Barnes, R., Lehman, C., & Mulla, D. (2014). An efficient assignment of
//! drainage direction over flat surfaces in raster digital elevation models.
//! *Computers & Geosciences*, 62, 128–135.

use std::collections::VecDeque;

use ndarray::Array2;
use tracing::{debug, warn};

use crate::maybe_rayon::*;
use demflow_core::raster::{d8, NextUp, Raster, RasterElement};
use demflow_core::{Algorithm, Error, Result};

use super::flow_direction::{flow_direction, FLOWDIR_NODATA, NO_FLOW};

/// Transitional fill for the flow-direction raster while the DEM is being
/// altered. If this code survives to the output, a stage read state it
/// should not have.
pub const ALTER_POISON: u8 = 155;

/// Queue entry marking the end of a BFS level.
const LEVEL_MARKER: (isize, isize) = (-1, -1);

/// Parameters for flat resolution
#[derive(Debug, Clone, Default)]
pub struct FlatResolutionParams {
    /// Resolve by altering the DEM instead of assigning directions from the
    /// flat mask. The altered DEM is re-run through the D8 kernel.
    pub alter: bool,
}

/// Flat resolution algorithm (Barnes-Lehman-Mulla)
#[derive(Debug, Clone, Default)]
pub struct FlatResolution;

impl Algorithm for FlatResolution {
    type Input = Raster<f64>;
    type Output = Raster<u8>;
    type Params = FlatResolutionParams;
    type Error = Error;

    fn name(&self) -> &'static str {
        "Flat Resolution (Barnes)"
    }

    fn description(&self) -> &'static str {
        "Assign D8 flow directions across flats using a synthetic drainage gradient"
    }

    fn execute(&self, input: Self::Input, params: Self::Params) -> Result<Self::Output> {
        let mut dem = input;
        let (rows, cols) = dem.shape();
        let mut flowdirs = dem.with_same_meta::<u8>(rows, cols);
        flowdirs.set_nodata(Some(FLOWDIR_NODATA));
        barnes_flat_resolution_d8(&mut dem, &mut flowdirs, params.alter)?;
        Ok(flowdirs)
    }
}

/// Identify the edge cells of flats.
///
/// A *low edge* is a draining cell (`F != NO_FLOW`) with a same-elevation
/// neighbor that does not drain: the flat's outlet as seen from outside.
/// A *high edge* is a non-draining cell with a strictly higher neighbor.
/// A cell enters each queue at most once.
fn find_flat_edges<T: RasterElement>(
    flowdirs: &Raster<u8>,
    elevations: &Raster<T>,
) -> (VecDeque<(isize, isize)>, VecDeque<(isize, isize)>) {
    let (rows, cols) = flowdirs.shape();
    let mut low_edges = VecDeque::new();
    let mut high_edges = VecDeque::new();
    let mut cells_without_flow = 0usize;

    for row in 0..rows {
        for col in 0..cols {
            let dir = unsafe { flowdirs.get_unchecked(row, col) };
            if dir == FLOWDIR_NODATA {
                continue;
            }
            if dir == NO_FLOW {
                cells_without_flow += 1;
            }
            let elev = unsafe { elevations.get_unchecked(row, col) };

            for n in 1..=8usize {
                let (dr, dc) = d8::OFFSETS[n];
                let nr = row as isize + dr;
                let nc = col as isize + dc;

                if !flowdirs.in_grid(nr, nc) {
                    continue;
                }
                let ndir = unsafe { flowdirs.get_unchecked(nr as usize, nc as usize) };
                if ndir == FLOWDIR_NODATA {
                    continue;
                }
                let nelev = unsafe { elevations.get_unchecked(nr as usize, nc as usize) };

                if dir != NO_FLOW && ndir == NO_FLOW && nelev == elev {
                    low_edges.push_back((row as isize, col as isize));
                    break;
                } else if dir == NO_FLOW && elev < nelev {
                    high_edges.push_back((row as isize, col as isize));
                    break;
                }
            }
        }
    }

    debug!(
        cells_without_flow,
        low_edges = low_edges.len(),
        high_edges = high_edges.len(),
        "searched for flat edges"
    );
    (low_edges, high_edges)
}

/// Flood-fill one flat with a label.
///
/// Absorbs every cell 8-connected to the seed through cells of the seed's
/// elevation that are still unlabeled.
fn label_this<T: RasterElement>(
    row0: usize,
    col0: usize,
    label: i32,
    labels: &mut Raster<i32>,
    elevations: &Raster<T>,
) {
    let target_elevation = unsafe { elevations.get_unchecked(row0, col0) };
    let mut to_fill = VecDeque::new();
    to_fill.push_back((row0, col0));

    while let Some((row, col)) = to_fill.pop_front() {
        if unsafe { elevations.get_unchecked(row, col) } != target_elevation {
            continue;
        }
        if unsafe { labels.get_unchecked(row, col) } > 0 {
            continue;
        }
        unsafe { labels.set_unchecked(row, col, label) };

        for n in 1..=8usize {
            let (dr, dc) = d8::OFFSETS[n];
            let nr = row as isize + dr;
            let nc = col as isize + dc;
            if labels.in_grid(nr, nc) {
                to_fill.push_back((nr as usize, nc as usize));
            }
        }
    }
}

/// Build a gradient away from the high edges of the flats.
///
/// Level-synchronous BFS from the (filtered) high-edge queue. Each cell
/// receives its BFS level in `flat_mask` (1 for the edges themselves), and
/// `flat_height` tracks the maximum level seen per label. `flat_mask > 0`
/// doubles as the visited check.
fn build_away_gradient(
    flowdirs: &Raster<u8>,
    flat_mask: &mut Raster<i32>,
    mut edges: VecDeque<(isize, isize)>,
    flat_height: &mut [i32],
    labels: &Raster<i32>,
) {
    let mut level = 1i32;
    edges.push_back(LEVEL_MARKER);

    // Only the level marker is left in the end
    while edges.len() > 1 {
        let (row, col) = match edges.pop_front() {
            Some(cell) => cell,
            None => break,
        };

        if (row, col) == LEVEL_MARKER {
            level += 1;
            edges.push_back(LEVEL_MARKER);
            continue;
        }
        let (row, col) = (row as usize, col as usize);

        if unsafe { flat_mask.get_unchecked(row, col) } > 0 {
            continue; // already incremented
        }
        unsafe { flat_mask.set_unchecked(row, col, level) };
        let label = unsafe { labels.get_unchecked(row, col) };
        flat_height[label as usize] = level;

        for n in 1..=8usize {
            let (dr, dc) = d8::OFFSETS[n];
            let nr = row as isize + dr;
            let nc = col as isize + dc;
            if labels.in_grid(nr, nc)
                && unsafe { labels.get_unchecked(nr as usize, nc as usize) } == label
                && unsafe { flowdirs.get_unchecked(nr as usize, nc as usize) } == NO_FLOW
            {
                edges.push_back((nr, nc));
            }
        }
    }
}

/// Build the gradient toward the low edges and superpose both gradients.
///
/// The existing away-gradient is negated in place first, so a negative value
/// marks "has an away-gradient, not yet combined" and positive marks done.
/// A visited cell becomes `(flat_height[label] + away) + 2*level` where
/// `away` is the stored negative value; cells the away pass never reached
/// become `2*level`. Doubling the level term keeps the combined mask
/// strictly decreasing along every path to a low edge, with the inverted
/// away-gradient as a secondary slope off the flat's high walls.
fn build_toward_combined_gradient(
    flowdirs: &Raster<u8>,
    flat_mask: &mut Raster<i32>,
    mut edges: VecDeque<(isize, isize)>,
    flat_height: &[i32],
    labels: &Raster<i32>,
) {
    let mut level = 1i32;

    flat_mask.data_mut().mapv_inplace(|v| -v);

    edges.push_back(LEVEL_MARKER);
    while edges.len() > 1 {
        let (row, col) = match edges.pop_front() {
            Some(cell) => cell,
            None => break,
        };

        if (row, col) == LEVEL_MARKER {
            level += 1;
            edges.push_back(LEVEL_MARKER);
            continue;
        }
        let (row, col) = (row as usize, col as usize);

        let mask = unsafe { flat_mask.get_unchecked(row, col) };
        if mask > 0 {
            continue; // already combined
        }
        let label = unsafe { labels.get_unchecked(row, col) };

        let combined = if mask != 0 {
            // mask < 0 here: the stored away-gradient
            (flat_height[label as usize] + mask) + 2 * level
        } else {
            2 * level
        };
        unsafe { flat_mask.set_unchecked(row, col, combined) };

        for n in 1..=8usize {
            let (dr, dc) = d8::OFFSETS[n];
            let nr = row as isize + dr;
            let nc = col as isize + dc;
            if labels.in_grid(nr, nc)
                && unsafe { labels.get_unchecked(nr as usize, nc as usize) } == label
                && unsafe { flowdirs.get_unchecked(nr as usize, nc as usize) } == NO_FLOW
            {
                edges.push_back((nr, nc));
            }
        }
    }
}

/// Resolve flats into a drainage mask and a label raster.
///
/// Classifies flat edges, labels each drainable flat (flats reachable from a
/// low edge through cells of equal elevation), and builds the combined
/// gradient mask. Returns `(flat_mask, labels)`:
///
/// - `flat_mask` is `>= 0` everywhere; `0` outside flats, and decreasing
///   toward each flat's outlets inside them. Its NoData value is `-1`.
/// - `labels` is `0` outside drainable flats and a dense id from 1 upward
///   inside them.
///
/// Flats with no outlet are left unlabeled and reported through the log
/// sink; the returned rasters are still consistent.
///
/// # Errors
/// Fails if the rasters disagree in shape or in NoData coverage.
pub fn resolve_flats<T: RasterElement>(
    elevations: &Raster<T>,
    flowdirs: &Raster<u8>,
) -> Result<(Raster<i32>, Raster<i32>)> {
    let (rows, cols) = elevations.shape();
    if flowdirs.shape() != (rows, cols) {
        return Err(Error::SizeMismatch {
            er: rows,
            ec: cols,
            ar: flowdirs.rows(),
            ac: flowdirs.cols(),
        });
    }
    for row in 0..rows {
        for col in 0..cols {
            let e_nodata = elevations.is_nodata(unsafe { elevations.get_unchecked(row, col) });
            let f_nodata = unsafe { flowdirs.get_unchecked(row, col) } == FLOWDIR_NODATA;
            if e_nodata != f_nodata {
                return Err(Error::NodataMismatch { row, col });
            }
        }
    }

    let mut labels = elevations.with_same_meta::<i32>(rows, cols);
    labels.set_nodata(Some(0));

    let mut flat_mask = elevations.with_same_meta::<i32>(rows, cols);
    flat_mask.set_nodata(Some(-1));

    let (low_edges, mut high_edges) = find_flat_edges(flowdirs, elevations);

    if low_edges.is_empty() {
        if !high_edges.is_empty() {
            warn!("there were flats, but none of them had outlets");
        } else {
            debug!("no flats found");
        }
        return Ok((flat_mask, labels));
    }

    // Label flats from their outlets; a flat touched by several low edges
    // keeps the label of the first one seen.
    let mut group_number = 1i32;
    for &(row, col) in &low_edges {
        let (row, col) = (row as usize, col as usize);
        if unsafe { labels.get_unchecked(row, col) } == 0 {
            label_this(row, col, group_number, &mut labels, elevations);
            group_number += 1;
        }
    }
    debug!(flats = group_number - 1, "labeled flats");

    // High edges in unlabeled flats have no path to any outlet; drop them.
    let found = high_edges.len();
    high_edges
        .retain(|&(row, col)| unsafe { labels.get_unchecked(row as usize, col as usize) } != 0);
    if high_edges.len() < found {
        warn!("not all flats have outlets; the DEM contains sinks/pits/depressions");
    }

    let mut flat_height = vec![0i32; group_number as usize];

    build_away_gradient(flowdirs, &mut flat_mask, high_edges, &mut flat_height, &labels);
    build_toward_combined_gradient(flowdirs, &mut flat_mask, low_edges, &flat_height, &labels);

    Ok((flat_mask, labels))
}

/// Pick a cell's flow direction from the flat mask.
///
/// Chooses the same-label neighbor with the lowest mask. On equal masks a
/// cardinal direction replaces a previously chosen diagonal one. Interior
/// cells only; callers guarantee all eight neighbors are in-grid.
fn masked_flow_dir(
    flat_mask: &Raster<i32>,
    labels: &Raster<i32>,
    row: usize,
    col: usize,
) -> u8 {
    let mut minimum_mask = unsafe { flat_mask.get_unchecked(row, col) };
    let label = unsafe { labels.get_unchecked(row, col) };
    let mut flowdir = NO_FLOW;

    for n in 1..=8u8 {
        let (dr, dc) = d8::OFFSETS[n as usize];
        let nr = (row as isize + dr) as usize;
        let nc = (col as isize + dc) as usize;

        if unsafe { labels.get_unchecked(nr, nc) } != label {
            continue;
        }
        let mask = unsafe { flat_mask.get_unchecked(nr, nc) };
        if mask < minimum_mask
            || (mask == minimum_mask
                && flowdir != NO_FLOW
                && !d8::is_cardinal(flowdir)
                && d8::is_cardinal(n))
        {
            minimum_mask = mask;
            flowdir = n;
        }
    }

    flowdir
}

/// Assign D8 flow directions inside resolved flats.
///
/// Every interior cell still marked [`NO_FLOW`] receives the direction of
/// its lowest-mask same-label neighbor. Cells with no lower-mask neighbor
/// (non-drainable flats) keep [`NO_FLOW`].
///
/// # Errors
/// Fails if the rasters disagree in shape.
pub fn d8_flow_flats(
    flat_mask: &Raster<i32>,
    labels: &Raster<i32>,
    flowdirs: &mut Raster<u8>,
) -> Result<()> {
    let (rows, cols) = flowdirs.shape();
    if flat_mask.shape() != (rows, cols) || labels.shape() != (rows, cols) {
        return Err(Error::SizeMismatch {
            er: rows,
            ec: cols,
            ar: flat_mask.rows(),
            ac: flat_mask.cols(),
        });
    }
    if rows < 3 || cols < 3 {
        return Ok(()); // no interior
    }

    let updated: Vec<u8> = (0..rows)
        .into_par_iter()
        .flat_map(|row| {
            let mut row_data: Vec<u8> = (0..cols)
                .map(|col| unsafe { flowdirs.get_unchecked(row, col) })
                .collect();
            if row == 0 || row + 1 == rows {
                return row_data;
            }
            for col in 1..cols - 1 {
                let mask = unsafe { flat_mask.get_unchecked(row, col) };
                if flat_mask.is_nodata(mask) {
                    continue;
                }
                if row_data[col] == NO_FLOW {
                    row_data[col] = masked_flow_dir(flat_mask, labels, row, col);
                }
            }
            row_data
        })
        .collect();

    *flowdirs.data_mut() = Array2::from_shape_vec((rows, cols), updated)
        .map_err(|e| Error::Other(e.to_string()))?;

    Ok(())
}

/// Alter the DEM so that resolved flats drain under a plain D8 pass.
///
/// Each interior flat cell is raised by `flat_mask` applications of the
/// next-representable-value successor for the elevation type. Afterward,
/// any different-label neighbor the raised cell now equals or exceeds must
/// have been strictly lower before the raise; violations are reported per
/// cell through the log sink but do not abort.
///
/// # Errors
/// Fails if the rasters disagree in shape.
pub fn d8_flats_alter_dem<T: NextUp>(
    flat_mask: &Raster<i32>,
    labels: &Raster<i32>,
    elevations: &mut Raster<T>,
) -> Result<()> {
    let (rows, cols) = elevations.shape();
    if flat_mask.shape() != (rows, cols) || labels.shape() != (rows, cols) {
        return Err(Error::SizeMismatch {
            er: rows,
            ec: cols,
            ar: flat_mask.rows(),
            ac: flat_mask.cols(),
        });
    }
    if rows < 3 || cols < 3 {
        return Ok(());
    }

    for row in 1..rows - 1 {
        for col in 1..cols - 1 {
            let label = unsafe { labels.get_unchecked(row, col) };
            if label == 0 {
                continue;
            }

            let center = unsafe { elevations.get_unchecked(row, col) };
            let mut higher = [false; 9];
            for n in 1..=8usize {
                let (dr, dc) = d8::OFFSETS[n];
                let neighbor = unsafe {
                    elevations.get_unchecked((row as isize + dr) as usize, (col as isize + dc) as usize)
                };
                higher[n] = center > neighbor;
            }

            let mut raised = center;
            let increments = unsafe { flat_mask.get_unchecked(row, col) };
            for _ in 0..increments {
                raised = raised.next_up();
            }
            unsafe { elevations.set_unchecked(row, col, raised) };

            for n in 1..=8usize {
                let (dr, dc) = d8::OFFSETS[n];
                let nr = (row as isize + dr) as usize;
                let nc = (col as isize + dc) as usize;
                if unsafe { labels.get_unchecked(nr, nc) } == label {
                    continue;
                }
                if raised < unsafe { elevations.get_unchecked(nr, nc) } {
                    continue;
                }
                if !higher[n] {
                    warn!(row, col, "raising the cell made an invalid alteration of the DEM");
                }
            }
        }
    }

    Ok(())
}

/// Run the whole flat-resolution pipeline.
///
/// Computes D8 directions, resolves flats, and finishes either by assigning
/// directions from the flat mask (`alter = false`) or by altering the DEM
/// and re-running the D8 kernel on it (`alter = true`). `flowdirs` is
/// overwritten either way.
pub fn barnes_flat_resolution_d8<T: NextUp>(
    elevations: &mut Raster<T>,
    flowdirs: &mut Raster<u8>,
    alter: bool,
) -> Result<()> {
    *flowdirs = flow_direction(elevations)?;

    let (flat_mask, labels) = resolve_flats(elevations, flowdirs)?;

    if alter {
        // If ALTER_POISON appears downstream, a transitional state leaked
        flowdirs.fill(ALTER_POISON);
        d8_flats_alter_dem(&flat_mask, &labels, elevations)?;
        *flowdirs = flow_direction(elevations)?;
    } else {
        d8_flow_flats(&flat_mask, &labels, flowdirs)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use demflow_core::GeoTransform;

    /// 5x5 DEM: 3x3 plateau at elevation 5, rim at 10, one low outlet cell
    /// in the middle of the east rim.
    ///
    /// ```text
    /// 10 10 10 10 10
    /// 10  5  5  5 10
    /// 10  5  5  5  3
    /// 10  5  5  5 10
    /// 10 10 10 10 10
    /// ```
    fn plateau_with_outlet() -> Raster<f64> {
        let mut dem = Raster::filled(5, 5, 10.0);
        dem.set_transform(GeoTransform::new(0.0, 5.0, 1.0, -1.0));
        for row in 1..4 {
            for col in 1..4 {
                dem.set(row, col, 5.0).unwrap();
            }
        }
        dem.set(2, 4, 3.0).unwrap();
        dem
    }

    /// 5x5 DEM: 3x3 plateau at 5 fully enclosed by a rim at 10.
    fn closed_depression() -> Raster<f64> {
        let mut dem = Raster::filled(5, 5, 10.0);
        dem.set_transform(GeoTransform::new(0.0, 5.0, 1.0, -1.0));
        for row in 1..4 {
            for col in 1..4 {
                dem.set(row, col, 5.0).unwrap();
            }
        }
        dem
    }

    /// 5x9 DEM: two 3x3 plateaus at 5 separated by a ridge. The west one
    /// drains through a notch in the west rim; the east one is sealed.
    ///
    /// ```text
    /// 10 10 10 10 10 10 10 10 10
    /// 10  5  5  5 10  5  5  5 10
    ///  3  5  5  5 10  5  5  5 10
    /// 10  5  5  5 10  5  5  5 10
    /// 10 10 10 10 10 10 10 10 10
    /// ```
    fn twin_plateaus_one_sealed() -> Raster<f64> {
        let mut dem = Raster::filled(5, 9, 10.0);
        dem.set_transform(GeoTransform::new(0.0, 5.0, 1.0, -1.0));
        for row in 1..4 {
            for col in 1..4 {
                dem.set(row, col, 5.0).unwrap();
            }
            for col in 5..8 {
                dem.set(row, col, 5.0).unwrap();
            }
        }
        dem.set(2, 0, 3.0).unwrap();
        dem
    }

    #[test]
    fn test_find_flat_edges_plateau() {
        let dem = plateau_with_outlet();
        let fdir = flow_direction(&dem).unwrap();
        let (low, high) = find_flat_edges(&fdir, &dem);

        // The col-3 plateau cells drain into the outlet and see flat
        // neighbors of their own elevation.
        let low: Vec<_> = low.into_iter().collect();
        assert_eq!(low.len(), 3);
        for cell in [(1, 3), (2, 3), (3, 3)] {
            assert!(low.contains(&cell), "missing low edge {:?}", cell);
        }

        // The six non-draining plateau cells plus the outlet pit all touch
        // higher terrain.
        let high: Vec<_> = high.into_iter().collect();
        assert_eq!(high.len(), 7);
        for cell in [(1, 1), (2, 1), (3, 1), (1, 2), (2, 2), (3, 2), (2, 4)] {
            assert!(high.contains(&cell), "missing high edge {:?}", cell);
        }
    }

    #[test]
    fn test_labels_cover_flat() {
        let dem = plateau_with_outlet();
        let fdir = flow_direction(&dem).unwrap();
        let (_, labels) = resolve_flats(&dem, &fdir).unwrap();

        // One flat: the nine plateau cells, outlet seen from inside included
        for row in 1..4 {
            for col in 1..4 {
                assert_eq!(labels.get(row, col).unwrap(), 1, "({row},{col})");
            }
        }
        // The pit below the plateau is a different elevation: unlabeled
        assert_eq!(labels.get(2, 4).unwrap(), 0);
        assert_eq!(labels.get(0, 0).unwrap(), 0);
    }

    #[test]
    fn test_flat_mask_gradient_values() {
        let dem = plateau_with_outlet();
        let fdir = flow_direction(&dem).unwrap();
        let (mask, _) = resolve_flats(&dem, &fdir).unwrap();

        // Away pass: one level from the rim (all six NO_FLOW cells touch it).
        // Toward pass: levels 1..3 from the outlet column, doubled, with the
        // inverted away term folded in.
        for row in 1..4 {
            assert_eq!(mask.get(row, 1).unwrap(), 6, "col 1, row {row}");
            assert_eq!(mask.get(row, 2).unwrap(), 4, "col 2, row {row}");
            assert_eq!(mask.get(row, 3).unwrap(), 2, "col 3, row {row}");
        }
        // Non-flat cells stay zero
        assert_eq!(mask.get(0, 0).unwrap(), 0);
        assert_eq!(mask.get(2, 4).unwrap(), 0);
    }

    #[test]
    fn test_mask_nonnegative_and_idempotent() {
        let dem = plateau_with_outlet();
        let fdir = flow_direction(&dem).unwrap();
        let (mask1, labels1) = resolve_flats(&dem, &fdir).unwrap();

        for &m in mask1.data().iter() {
            assert!(m >= 0, "mask must be nonnegative, got {m}");
        }

        let (mask2, labels2) = resolve_flats(&dem, &fdir).unwrap();
        assert_eq!(mask1.data(), mask2.data());
        assert_eq!(labels1.data(), labels2.data());
    }

    #[test]
    fn test_d8_flow_flats_assigns_descent() {
        let dem = plateau_with_outlet();
        let mut fdir = flow_direction(&dem).unwrap();
        let (mask, labels) = resolve_flats(&dem, &fdir).unwrap();
        d8_flow_flats(&mask, &labels, &mut fdir).unwrap();

        // Every previously undrained plateau cell now drains east toward
        // the outlet column.
        for row in 1..4 {
            for col in 1..3 {
                assert_eq!(fdir.get(row, col).unwrap(), 1, "({row},{col}) should flow E");
            }
        }

        // Descent monotonicity: each assigned direction lowers the mask
        // without leaving the flat.
        for row in 1..4 {
            for col in 1..4 {
                let dir = fdir.get(row, col).unwrap();
                if labels.get(row, col).unwrap() == 0 || dir == NO_FLOW {
                    continue;
                }
                let (dr, dc) = d8::OFFSETS[dir as usize];
                let (nr, nc) = ((row as isize + dr) as usize, (col as isize + dc) as usize);
                if labels.get(nr, nc).unwrap() == labels.get(row, col).unwrap() {
                    assert!(
                        mask.get(nr, nc).unwrap() < mask.get(row, col).unwrap(),
                        "({row},{col}) -> ({nr},{nc}) does not descend"
                    );
                }
            }
        }
    }

    #[test]
    fn test_masked_flow_dir_prefers_cardinal_on_tie() {
        let mut mask: Raster<i32> = Raster::filled(3, 3, 9);
        let labels: Raster<i32> = Raster::filled(3, 3, 1);
        mask.set(1, 1, 5).unwrap();
        mask.set(0, 2, 1).unwrap(); // NE of center (diagonal, code 2)
        mask.set(0, 1, 1).unwrap(); // N of center (cardinal, code 3)

        // NE is scanned first and wins on value; N then ties and takes over
        // by parity.
        assert_eq!(masked_flow_dir(&mask, &labels, 1, 1), 3);
    }

    #[test]
    fn test_masked_flow_dir_ignores_other_labels() {
        let mut mask: Raster<i32> = Raster::filled(3, 3, 9);
        let mut labels: Raster<i32> = Raster::filled(3, 3, 1);
        mask.set(1, 1, 5).unwrap();
        mask.set(1, 2, 1).unwrap();
        labels.set(1, 2, 2).unwrap(); // lowest neighbor is in another flat

        assert_eq!(masked_flow_dir(&mask, &labels, 1, 1), NO_FLOW);
    }

    #[test]
    fn test_no_flats_on_ramp() {
        // Monotone ramp: no drainable flats anywhere
        let mut dem: Raster<f64> = Raster::new(5, 5);
        dem.set_transform(GeoTransform::new(0.0, 5.0, 1.0, -1.0));
        for row in 0..5 {
            for col in 0..5 {
                dem.set(row, col, (row + col) as f64).unwrap();
            }
        }

        let fdir = flow_direction(&dem).unwrap();
        let (mask, labels) = resolve_flats(&dem, &fdir).unwrap();

        assert!(mask.data().iter().all(|&m| m == 0));
        assert!(labels.data().iter().all(|&l| l == 0));
    }

    #[test]
    fn test_closed_depression_left_unresolved() {
        let dem = closed_depression();
        let mut fdir = flow_direction(&dem).unwrap();
        let before = fdir.clone();
        let (mask, labels) = resolve_flats(&dem, &fdir).unwrap();

        // No outlet: nothing labeled, no gradient built
        assert!(mask.data().iter().all(|&m| m == 0));
        assert!(labels.data().iter().all(|&l| l == 0));

        // And the direction sweep leaves the raster untouched
        d8_flow_flats(&mask, &labels, &mut fdir).unwrap();
        assert_eq!(fdir.data(), before.data());
    }

    #[test]
    fn test_partial_coverage_drops_sealed_flat() {
        let dem = twin_plateaus_one_sealed();
        let fdir = flow_direction(&dem).unwrap();

        // Both plateaus contribute high edges (5 on the west ring, 8 on the
        // east ring, plus the notch pit); only the west one has low edges.
        let (low, high) = find_flat_edges(&fdir, &dem);
        assert_eq!(low.len(), 3);
        assert_eq!(high.len(), 14);
        for cell in [(1, 1), (2, 1), (3, 1)] {
            assert!(low.contains(&cell), "missing low edge {:?}", cell);
        }

        let (mask, labels) = resolve_flats(&dem, &fdir).unwrap();

        // The west flat keeps its label and gradient; the sealed east
        // flat's high edges were dropped, so it stays unlabeled with no
        // gradient at all.
        for row in 1..4 {
            for col in 1..4 {
                assert_eq!(labels.get(row, col).unwrap(), 1, "({row},{col})");
                assert!(mask.get(row, col).unwrap() > 0, "({row},{col})");
            }
            for col in 5..8 {
                assert_eq!(labels.get(row, col).unwrap(), 0, "({row},{col})");
                assert_eq!(mask.get(row, col).unwrap(), 0, "({row},{col})");
            }
        }
    }

    #[test]
    fn test_resolve_flats_shape_mismatch() {
        let dem: Raster<f64> = Raster::new(5, 5);
        let fdir: Raster<u8> = Raster::new(4, 5);
        assert!(matches!(
            resolve_flats(&dem, &fdir),
            Err(Error::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_resolve_flats_nodata_mismatch() {
        let mut dem: Raster<f64> = Raster::filled(3, 3, 5.0);
        dem.set(1, 1, f64::NAN).unwrap();
        // A flow raster that claims every cell is valid
        let fdir: Raster<u8> = Raster::filled(3, 3, NO_FLOW);

        assert!(matches!(
            resolve_flats(&dem, &fdir),
            Err(Error::NodataMismatch { row: 1, col: 1 })
        ));
    }

    #[test]
    fn test_alter_dem_builds_monotone_microrelief() {
        let dem = plateau_with_outlet();
        let fdir = flow_direction(&dem).unwrap();
        let (mask, labels) = resolve_flats(&dem, &fdir).unwrap();

        let mut altered = dem.clone();
        d8_flats_alter_dem(&mask, &labels, &mut altered).unwrap();

        // The raise count follows the mask, so elevations now descend
        // toward the outlet column while staying within ulps of 5.0.
        for row in 1..4 {
            let a = altered.get(row, 1).unwrap();
            let b = altered.get(row, 2).unwrap();
            let c = altered.get(row, 3).unwrap();
            assert!(a > b && b > c, "row {row} not monotone: {a} {b} {c}");
            assert!(c > 5.0 && a < 5.0 + 1e-9);
        }

        // Unlabeled terrain is untouched
        assert_eq!(altered.get(0, 0).unwrap(), 10.0);
        assert_eq!(altered.get(2, 4).unwrap(), 3.0);
    }

    #[test]
    fn test_alter_dem_f32_uses_single_precision_steps() {
        let mut dem: Raster<f32> = Raster::filled(5, 5, 10.0);
        dem.set_transform(GeoTransform::new(0.0, 5.0, 1.0, -1.0));
        for row in 1..4 {
            for col in 1..4 {
                dem.set(row, col, 5.0).unwrap();
            }
        }
        dem.set(2, 4, 3.0).unwrap();

        let fdir = flow_direction(&dem).unwrap();
        let (mask, labels) = resolve_flats(&dem, &fdir).unwrap();

        let mut altered = dem.clone();
        d8_flats_alter_dem(&mask, &labels, &mut altered).unwrap();

        let a = altered.get(2, 1).unwrap();
        let c = altered.get(2, 3).unwrap();
        assert!(a > c && c > 5.0);
        // Six f32 successor steps from 5.0 are still far below the next
        // integer representable gap
        assert!(a < 5.0 + 1e-4);
    }

    #[test]
    fn test_orchestrator_flat_and_alter_paths_agree() {
        let dem = plateau_with_outlet();

        let mut dem_a = dem.clone();
        let mut fdir_a = dem.with_same_meta::<u8>(5, 5);
        barnes_flat_resolution_d8(&mut dem_a, &mut fdir_a, false).unwrap();

        let mut dem_b = dem.clone();
        let mut fdir_b = dem.with_same_meta::<u8>(5, 5);
        barnes_flat_resolution_d8(&mut dem_b, &mut fdir_b, true).unwrap();

        // The altered DEM must reproduce the mask-resolved directions on
        // the cells that were flat.
        let original_fdir = flow_direction(&dem).unwrap();
        for row in 0..5 {
            for col in 0..5 {
                if original_fdir.get(row, col).unwrap() != NO_FLOW {
                    continue;
                }
                assert_eq!(
                    fdir_a.get(row, col).unwrap(),
                    fdir_b.get(row, col).unwrap(),
                    "paths disagree at ({row},{col})"
                );
            }
        }

        // No transitional state leaks
        assert!(fdir_b.data().iter().all(|&d| d != ALTER_POISON));
    }
}

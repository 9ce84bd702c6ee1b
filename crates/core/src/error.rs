//! Error types for demflow

use thiserror::Error;

/// Main error type for demflow operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid raster dimensions: {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },

    #[error("Index out of bounds: ({row}, {col}) in raster of size ({rows}, {cols})")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Raster size mismatch: expected ({er}, {ec}), got ({ar}, {ac})")]
    SizeMismatch { er: usize, ec: usize, ar: usize, ac: usize },

    #[error("NoData masks disagree at ({row}, {col})")]
    NodataMismatch { row: usize, col: usize },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for demflow operations
pub type Result<T> = std::result::Result<T, Error>;

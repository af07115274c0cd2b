//! Raster processing for ecosystem-service analyses: GeoTIFF I/O, grid
//! alignment, an expression-driven raster calculator, masking, density
//! conversion, percentiles, reclassification and zonal statistics, plus the
//! download, hashing and phase-running plumbing the command-line tools share.

pub mod align;
pub mod calc;
pub mod config;
pub mod coords;
pub mod density;
pub mod download;
pub mod ecoshard;
pub mod error;
pub mod expr;
pub mod geotiff;
pub mod logging;
pub mod mask;
pub mod percentile;
pub mod pipeline;
pub mod raster;
pub mod reclass;
pub mod zonal;

pub use error::{EcocalcError, Result};
pub use raster::{DataType, Raster, RasterInfo};

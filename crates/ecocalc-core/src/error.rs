//! Error type shared by every ecocalc-core operation.

use std::path::PathBuf;

use thiserror::Error;

use crate::coords::Projection;
use crate::expr::ExprError;

pub type Result<T> = std::result::Result<T, EcocalcError>;

#[derive(Debug, Error)]
pub enum EcocalcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("GeoJSON error: {0}")]
    GeoJson(#[from] geojson::Error),

    #[error("HTTP client error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status} while downloading {url}")]
    Http { url: String, status: u16 },

    #[error("expression error: {0}")]
    Expr(#[from] ExprError),

    #[error("symbol '{0}' is used in the expression but has no entry in the symbol map")]
    UnknownSymbol(String),

    #[error("calculation has no raster inputs, only constants")]
    NoRasterInputs,

    #[error("rasters are not on the same grid: {0}")]
    GridMismatch(String),

    #[error("cannot reproject from {from} to {to}")]
    ProjectionMismatch { from: Projection, to: Projection },

    #[error("bounding boxes do not intersect")]
    EmptyIntersection,

    #[error("raster {0} has no nodata value defined")]
    MissingNodata(String),

    #[error("raster has no valid pixels")]
    NoValidPixels,

    #[error("column '{column}' not found in {path}")]
    MissingColumn { column: String, path: PathBuf },

    #[error("unsupported pixel type in {0}")]
    UnsupportedPixelType(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("job '{job}' failed: {source}")]
    JobFailed {
        job: String,
        #[source]
        source: Box<EcocalcError>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_failure_keeps_source_message() {
        let err = EcocalcError::JobFailed {
            job: "warp dem".into(),
            source: Box::new(EcocalcError::NoValidPixels),
        };
        let msg = err.to_string();
        assert!(msg.contains("warp dem"));
        assert!(msg.contains("no valid pixels"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EcocalcError = io.into();
        assert!(matches!(err, EcocalcError::Io(_)));
    }
}

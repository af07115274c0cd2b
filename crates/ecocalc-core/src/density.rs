//! Conversion between per-pixel totals and per-m² densities.
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::coords::{latitude_m2_area_column, projection_or_wgs84};
use crate::raster::Raster;

/// How pixel area is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AreaModel {
    /// Degrees; area varies with latitude.
    Geographic,
    /// Linear units; every pixel has the same area.
    Projected,
}

impl AreaModel {
    /// Geographic when the raster is in a lat/lon system (or has none).
    pub fn for_raster(raster: &Raster) -> AreaModel {
        if projection_or_wgs84(raster.projection, "density raster").is_geographic() {
            AreaModel::Geographic
        } else {
            AreaModel::Projected
        }
    }
}

/// Pixel area in m² (or squared map units) for every row, north to south.
fn row_areas(raster: &Raster, model: AreaModel) -> Vec<f64> {
    let gt = &raster.geotransform;
    match model {
        AreaModel::Projected => vec![(gt.pixel_width * gt.pixel_height).abs(); raster.height],
        AreaModel::Geographic => {
            let lat_max = raster.bounding_box().ymax;
            latitude_m2_area_column(lat_max, gt.pixel_height, gt.pixel_width, raster.height)
        }
    }
}

fn scale_rows(raster: &Raster, model: AreaModel, op: impl Fn(f64, f64) -> f64 + Sync) -> Raster {
    let areas = row_areas(raster, model);
    let mut out = raster.clone();
    let width = raster.width.max(1);
    out.data
        .par_chunks_mut(width)
        .zip(areas.par_iter())
        .for_each(|(row, &area)| {
            for v in row.iter_mut() {
                if !raster.is_nodata(*v) {
                    *v = op(*v, area);
                }
            }
        });
    out
}

/// Divide every valid pixel by its area.
pub fn value_to_density(raster: &Raster, model: AreaModel) -> Raster {
    scale_rows(raster, model, |v, area| v / area)
}

/// Multiply every valid pixel by its area.
pub fn density_to_value(raster: &Raster, model: AreaModel) -> Raster {
    scale_rows(raster, model, |v, area| v * area)
}

use std::path::Path;

use rayon::prelude::*;
use tracing::debug;

use crate::error::{EcocalcError, Result};
use crate::geotiff::read_raster;
use crate::raster::Raster;

/// Percentiles of the valid pixels of `raster`, one per entry of `percentiles`.
///
/// Uses the lower-rank rule: the p-th percentile of `n` sorted values is the
/// value at index `floor(p / 100 * (n - 1))`.
pub fn raster_band_percentile(raster: &Raster, percentiles: &[f64]) -> Result<Vec<f64>> {
    if let Some(bad) = percentiles.iter().find(|p| !(0.0..=100.0).contains(*p)) {
        return Err(EcocalcError::InvalidArgument(format!(
            "percentile {bad} is outside [0, 100]"
        )));
    }
    let mut values: Vec<f64> = raster.valid_values().collect();
    if values.is_empty() {
        return Err(EcocalcError::NoValidPixels);
    }
    values.par_sort_unstable_by(f64::total_cmp);
    let n = values.len();
    debug!(valid = n, "sorted pixels for percentile");

    Ok(percentiles
        .iter()
        .map(|p| {
            let rank = ((p / 100.0) * (n - 1) as f64).floor() as usize;
            values[rank.min(n - 1)]
        })
        .collect())
}

pub fn raster_path_percentile(path: &Path, percentiles: &[f64]) -> Result<Vec<f64>> {
    raster_band_percentile(&read_raster(path)?, percentiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::GeoTransform;

    fn ramp(n: usize) -> Raster {
        let gt = GeoTransform::new(0.0, 1.0, 1.0, -1.0);
        Raster::new(n, 1, gt, 0.0).with_data((0..n).map(|i| i as f64).collect())
    }

    #[test]
    fn ramp_percentiles() {
        let r = ramp(101);
        let p = raster_band_percentile(&r, &[0.0, 50.0, 99.0, 100.0]).unwrap();
        assert_eq!(p, vec![0.0, 50.0, 99.0, 100.0]);
    }

    #[test]
    fn rank_rounds_down() {
        let r = ramp(10);
        // 0.5 * 9 = 4.5 → index 4.
        assert_eq!(raster_band_percentile(&r, &[50.0]).unwrap(), vec![4.0]);
    }

    #[test]
    fn nodata_is_excluded() {
        let r = ramp(5).with_nodata(Some(4.0));
        assert_eq!(raster_band_percentile(&r, &[100.0]).unwrap(), vec![3.0]);
    }

    #[test]
    fn out_of_range_percentile() {
        assert!(matches!(
            raster_band_percentile(&ramp(3), &[101.0]),
            Err(EcocalcError::InvalidArgument(_))
        ));
    }

    #[test]
    fn all_nodata_fails() {
        let r = ramp(3).with_data(vec![f64::NAN; 3]);
        assert!(matches!(raster_band_percentile(&r, &[50.0]), Err(EcocalcError::NoValidPixels)));
    }
}

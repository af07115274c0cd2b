use std::path::Path;

use rayon::prelude::*;
use tracing::info;

use crate::error::{EcocalcError, Result};
use crate::geotiff::{read_raster, write_raster};
use crate::raster::Raster;

/// Set every pixel of `base` where `mask` is nodata to the base nodata value.
/// Other pixels are left untouched. Both rasters must share a grid.
pub fn mask_raster(base: &Raster, mask: &Raster) -> Result<Raster> {
    if !base.same_grid(mask) {
        return Err(EcocalcError::GridMismatch(format!(
            "base is {}x{}, mask is {}x{}",
            base.width, base.height, mask.width, mask.height
        )));
    }
    let nodata = base
        .nodata
        .ok_or_else(|| EcocalcError::MissingNodata("base raster".into()))?;

    let mut out = base.clone();
    out.data
        .par_iter_mut()
        .zip(mask.data.par_iter())
        .for_each(|(v, &m)| {
            if mask.is_nodata(m) {
                *v = nodata;
            }
        });
    Ok(out)
}

pub fn mask_raster_path(base: &Path, mask: &Path, target: &Path) -> Result<()> {
    info!(base = %base.display(), mask = %mask.display(), "mask raster");
    let base_raster = read_raster(base)?;
    let mask_raster_data = read_raster(mask)?;
    let out = mask_raster(&base_raster, &mask_raster_data).map_err(|e| match e {
        EcocalcError::MissingNodata(_) => EcocalcError::MissingNodata(base.display().to_string()),
        other => other,
    })?;
    write_raster(target, &out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::GeoTransform;

    fn grid() -> GeoTransform {
        GeoTransform::new(0.0, 1.0, 2.0, -1.0)
    }

    #[test]
    fn mask_nodata_becomes_base_nodata() {
        let base = Raster::new(2, 2, grid(), 0.0)
            .with_data(vec![1.0, 2.0, 3.0, 4.0])
            .with_nodata(Some(-1.0));
        let mask = Raster::new(2, 2, grid(), 0.0)
            .with_data(vec![1.0, 255.0, 0.0, 255.0])
            .with_nodata(Some(255.0));
        let out = mask_raster(&base, &mask).unwrap();
        assert_eq!(out.data, vec![1.0, -1.0, 3.0, -1.0]);
        assert_eq!(out.nodata, Some(-1.0));
    }

    #[test]
    fn mask_without_nodata_only_masks_nan() {
        let base = Raster::new(2, 1, grid(), 5.0).with_nodata(Some(0.0));
        let mask = Raster::new(2, 1, grid(), 0.0).with_data(vec![0.0, f64::NAN]);
        let out = mask_raster(&base, &mask).unwrap();
        assert_eq!(out.data, vec![5.0, 0.0]);
    }

    #[test]
    fn base_without_nodata_is_an_error() {
        let base = Raster::new(2, 2, grid(), 1.0);
        let mask = Raster::new(2, 2, grid(), 1.0);
        assert!(matches!(mask_raster(&base, &mask), Err(EcocalcError::MissingNodata(_))));
    }

    #[test]
    fn grids_must_match() {
        let base = Raster::new(2, 2, grid(), 1.0).with_nodata(Some(0.0));
        let mask = Raster::new(3, 2, grid(), 1.0);
        assert!(matches!(mask_raster(&base, &mask), Err(EcocalcError::GridMismatch(_))));
    }
}

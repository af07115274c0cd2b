//! Reclassify a categorical raster with a lookup table, picking one of two
//! target codes per pixel depending on a threshold raster.
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::align::{align_raster_paths, BoundingBoxMode, ResampleMethod};
use crate::error::{EcocalcError, Result};
use crate::geotiff::{read_info, read_raster, write_raster};
use crate::raster::Raster;

/// Base code → `(leq_target, gt_target)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclassTable {
    entries: HashMap<i64, (f64, f64)>,
}

/// Integral pixel values map to table keys; anything else has no entry.
fn code_of(v: f64) -> Option<i64> {
    (v.fract() == 0.0 && v.is_finite()).then_some(v as i64)
}

impl ReclassTable {
    pub fn from_entries(entries: impl IntoIterator<Item = (i64, f64, f64)>) -> Self {
        Self { entries: entries.into_iter().map(|(k, leq, gt)| (k, (leq, gt))).collect() }
    }

    /// Load from a CSV with a header row. `fields` names the base, `<=` and `>` columns.
    pub fn from_csv(path: &Path, fields: [&str; 3]) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let mut idx = [0usize; 3];
        for (slot, field) in idx.iter_mut().zip(fields) {
            *slot = headers
                .iter()
                .position(|h| h.trim() == field)
                .ok_or_else(|| EcocalcError::MissingColumn {
                    column: field.to_string(),
                    path: path.to_path_buf(),
                })?;
        }

        let mut entries = HashMap::new();
        for record in reader.records() {
            let record = record?;
            let num = |i: usize| -> Result<f64> {
                let raw = record.get(i).unwrap_or("").trim();
                raw.parse::<f64>().map_err(|_| {
                    EcocalcError::InvalidArgument(format!("non-numeric value '{raw}' in {}", path.display()))
                })
            };
            let base = num(idx[0])?;
            let code = code_of(base).ok_or_else(|| {
                EcocalcError::InvalidArgument(format!("base code {base} is not an integer"))
            })?;
            entries.insert(code, (num(idx[1])?, num(idx[2])?));
        }
        debug!(rows = entries.len(), path = %path.display(), "loaded reclass table");
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, code: f64) -> Option<(f64, f64)> {
        code_of(code).and_then(|c| self.entries.get(&c).copied())
    }
}

/// Reclassify `base` using `table`, choosing the `<=` target where
/// `threshold <= threshold_value` and the `>` target otherwise.
/// Codes not in the table and nodata pixels pass through unchanged.
pub fn reclassify(base: &Raster, threshold: &Raster, table: &ReclassTable, threshold_value: f64) -> Result<Raster> {
    if !base.same_grid(threshold) {
        return Err(EcocalcError::GridMismatch(format!(
            "base is {}x{}, threshold is {}x{}",
            base.width, base.height, threshold.width, threshold.height
        )));
    }
    let mut out = base.clone();
    out.data
        .par_iter_mut()
        .zip(threshold.data.par_iter())
        .for_each(|(v, &t)| {
            if base.is_nodata(*v) || threshold.is_nodata(t) {
                return;
            }
            if let Some((leq, gt)) = table.lookup(*v) {
                *v = if t <= threshold_value { leq } else { gt };
            }
        });
    Ok(out)
}

/// Align the base and threshold rasters to the base pixel size, then reclassify.
/// Aligned copies are written to `aligned_dir` under their own file names; a
/// threshold raster sharing the base's name is written as `threshold_<name>`.
pub fn reclassify_paths(
    base_path: &Path,
    threshold_path: &Path,
    table: &ReclassTable,
    threshold_value: f64,
    target_path: &Path,
    aligned_dir: &Path,
) -> Result<()> {
    info!(
        base = %base_path.display(),
        threshold = %threshold_path.display(),
        threshold_value,
        "reclassify by threshold"
    );
    fs::create_dir_all(aligned_dir)?;
    let file_name = |p: &Path| p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let base_name = file_name(base_path);
    let mut threshold_name = file_name(threshold_path);
    if threshold_name == base_name {
        threshold_name = format!("threshold_{threshold_name}");
    }
    let aligned_base = aligned_dir.join(base_name);
    let aligned_threshold = aligned_dir.join(threshold_name);

    let pixel_size = read_info(base_path)?.pixel_size();
    align_raster_paths(
        &[base_path, threshold_path],
        &[aligned_base.as_path(), aligned_threshold.as_path()],
        &[ResampleMethod::Near, ResampleMethod::Near],
        pixel_size,
        BoundingBoxMode::Intersection,
        None,
    )?;

    let base = read_raster(&aligned_base)?;
    let threshold = read_raster(&aligned_threshold)?;
    let out = reclassify(&base, &threshold, table, threshold_value)?;
    write_raster(target_path, &out)?;
    info!(target = %target_path.display(), "reclassification complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::GeoTransform;
    use std::io::Write;

    fn grid() -> GeoTransform {
        GeoTransform::new(0.0, 1.0, 2.0, -1.0)
    }

    fn table() -> ReclassTable {
        ReclassTable::from_entries([(10, 100.0, 200.0), (20, 110.0, 210.0)])
    }

    #[test]
    fn threshold_selects_target_column() {
        let base = Raster::new(2, 2, grid(), 0.0).with_data(vec![10.0, 10.0, 20.0, 20.0]);
        let thr = Raster::new(2, 2, grid(), 0.0).with_data(vec![0.5, 0.9, 0.7, 0.71]);
        let out = reclassify(&base, &thr, &table(), 0.7).unwrap();
        assert_eq!(out.data, vec![100.0, 200.0, 110.0, 210.0]);
    }

    #[test]
    fn unknown_codes_and_nodata_pass_through() {
        let base = Raster::new(3, 1, grid(), 0.0)
            .with_data(vec![30.0, 10.0, -1.0])
            .with_nodata(Some(-1.0));
        let thr = Raster::new(3, 1, grid(), 0.0)
            .with_data(vec![0.0, -9.0, 0.0])
            .with_nodata(Some(-9.0));
        let out = reclassify(&base, &thr, &table(), 1.0).unwrap();
        assert_eq!(out.data, vec![30.0, 10.0, -1.0]);
    }

    #[test]
    fn csv_table_with_named_columns() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "lucode,name,restore_low,restore_high").unwrap();
        writeln!(f, "10,forest,100,200").unwrap();
        writeln!(f, "20.0,crop,110,210").unwrap();
        let t = ReclassTable::from_csv(f.path(), ["lucode", "restore_low", "restore_high"]).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.lookup(20.0), Some((110.0, 210.0)));
        assert_eq!(t.lookup(20.5), None);
    }

    #[test]
    fn missing_column_is_reported() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "lucode,a").unwrap();
        let err = ReclassTable::from_csv(f.path(), ["lucode", "a", "b"]).unwrap_err();
        assert!(matches!(err, EcocalcError::MissingColumn { ref column, .. } if column == "b"));
    }

    #[test]
    fn paths_align_then_reclassify() {
        let dir = tempfile::tempdir().unwrap();
        let base = Raster::new(2, 2, grid(), 0.0).with_data(vec![10.0, 20.0, 10.0, 30.0]);
        // Threshold is twice as fine; nearest picks the fine cell whose corner
        // sits on each base pixel centre.
        let fine = GeoTransform::new(0.0, 0.5, 2.0, -0.5);
        let mut thr = Raster::new(4, 4, fine, 0.0);
        thr.set(1, 1, 5.0);
        let base_path = dir.path().join("base.tif");
        let thr_path = dir.path().join("thr.tif");
        write_raster(&base_path, &base).unwrap();
        write_raster(&thr_path, &thr).unwrap();

        let target = dir.path().join("out.tif");
        reclassify_paths(&base_path, &thr_path, &table(), 1.0, &target, &dir.path().join("aligned")).unwrap();
        let out = read_raster(&target).unwrap();
        assert_eq!(out.width, 2);
        assert_eq!(out.data, vec![200.0, 110.0, 100.0, 30.0]);
        assert!(dir.path().join("aligned").join("base.tif").exists());
        assert!(dir.path().join("aligned").join("thr.tif").exists());
    }

    #[test]
    fn same_named_inputs_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let gt = GeoTransform::new(0.0, 1.0, 2.0, -1.0);
        let base = Raster::new(2, 2, gt, 0.0).with_data(vec![10.0, 20.0, 10.0, 9.0]).with_nodata(Some(-1.0));
        let thr = Raster::new(2, 2, gt, 0.0).with_data(vec![0.0, 5.0, 5.0, 5.0]);
        for sub in ["a", "b"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        let base_path = dir.path().join("a").join("layer.tif");
        let thr_path = dir.path().join("b").join("layer.tif");
        write_raster(&base_path, &base).unwrap();
        write_raster(&thr_path, &thr).unwrap();

        let aligned = dir.path().join("aligned");
        let target = dir.path().join("out.tif");
        reclassify_paths(&base_path, &thr_path, &table(), 1.0, &target, &aligned).unwrap();
        assert!(aligned.join("layer.tif").exists());
        assert!(aligned.join("threshold_layer.tif").exists());
        let out = read_raster(&target).unwrap();
        assert_eq!(out.data, vec![100.0, 210.0, 200.0, 9.0]);
    }
}

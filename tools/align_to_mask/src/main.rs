//! Download rasters and bring each onto the grid of a mask raster, optionally
//! masking it and converting per-pixel totals through density so area-based
//! values survive the resampling. Final products are copied into the
//! workspace under their md5-hashed names.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, info};

use ecocalc_core::align::{warp_raster, ResampleMethod, WarpOptions};
use ecocalc_core::config::{AlignConfig, AlignRaster, Workspace};
use ecocalc_core::density::{density_to_value, value_to_density, AreaModel};
use ecocalc_core::download::{download_url, url_file_name};
use ecocalc_core::ecoshard::copy_and_rehash;
use ecocalc_core::geotiff::{read_info, read_raster, write_raster};
use ecocalc_core::logging;
use ecocalc_core::mask::mask_raster;
use ecocalc_core::pipeline::{Job, Phase, Runner};

const WARPED_SUFFIX: &str = "_WARPED";
const MASKED_SUFFIX: &str = "_MASKED";
const PERAREA_SUFFIX: &str = "_PERAREA";
const RESCALED_VALUE_SUFFIX: &str = "_AREA_SCALED_VALUE";

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "align_to_mask", about = "Align rasters to the grid of a mask raster")]
struct Args {
    /// JSON configuration listing the mask and the rasters to align.
    config: PathBuf,

    /// Override the configured workspace directory.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Worker threads (<= 0 uses all CPUs).
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    n_workers: i32,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

// ── Layout ────────────────────────────────────────────────────────────────────

/// `dir/<stem><suffix><ext>` for `path`.
fn with_suffix(dir: &Path, path: &Path, suffix: &str) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    dir.join(format!("{stem}{suffix}{ext}"))
}

#[derive(Debug, Clone)]
struct Dirs {
    root: PathBuf,
    ecoshards: PathBuf,
    per_area: PathBuf,
    mask: PathBuf,
    warped: PathBuf,
}

impl Dirs {
    fn new(ws: &Workspace) -> Self {
        Self {
            root: ws.root.clone(),
            ecoshards: ws.ecoshard_dir(),
            per_area: ws.working_dir("per_area_rasters"),
            mask: ws.working_dir("mask"),
            warped: ws.working_dir("warped"),
        }
    }

    fn create(&self) -> Result<()> {
        for d in [&self.root, &self.ecoshards, &self.per_area, &self.mask, &self.warped] {
            std::fs::create_dir_all(d).with_context(|| format!("creating {}", d.display()))?;
        }
        Ok(())
    }
}

// ── Per-raster chain ──────────────────────────────────────────────────────────

/// Density, warp, mask, rehash and back to values for one raster. Each step
/// is skipped when its output already exists.
fn process_raster(
    entry: &AlignRaster,
    source: &Path,
    mask_path: &Path,
    method: ResampleMethod,
    dirs: &Dirs,
) -> ecocalc_core::Result<()> {
    let mut current = source.to_path_buf();

    if entry.per_area {
        let density_path = with_suffix(&dirs.per_area, &current, PERAREA_SUFFIX);
        if !density_path.exists() {
            let model = if entry.wgs84 { AreaModel::Geographic } else { AreaModel::Projected };
            let raster = read_raster(&current)?;
            write_raster(&density_path, &value_to_density(&raster, model))?;
        }
        current = density_path;
    }

    let warped_path = with_suffix(&dirs.warped, &current, &format!("{WARPED_SUFFIX}_{method}"));
    if !warped_path.exists() {
        let mask_info = read_info(mask_path)?;
        let opts = WarpOptions {
            pixel_size: mask_info.pixel_size(),
            bounding_box: Some(mask_info.bounding_box()),
            projection: mask_info.projection,
            method,
        };
        write_raster(&warped_path, &warp_raster(&read_raster(&current)?, &opts)?)?;
    }
    current = warped_path;

    if entry.mask {
        let masked_path = with_suffix(&dirs.mask, &current, MASKED_SUFFIX);
        if !masked_path.exists() {
            let masked = mask_raster(&read_raster(&current)?, &read_raster(mask_path)?)?;
            write_raster(&masked_path, &masked)?;
        }
        current = masked_path;
    }

    if let Some(final_path) = copy_and_rehash(&current, &dirs.root)? {
        info!(path = %final_path.display(), "final raster");
    }

    if entry.per_area {
        let value_path = with_suffix(&dirs.per_area, &current, RESCALED_VALUE_SUFFIX);
        if !value_path.exists() {
            let density = read_raster(&current)?;
            let model = AreaModel::for_raster(&density);
            write_raster(&value_path, &density_to_value(&density, model))?;
        }
        if let Some(final_path) = copy_and_rehash(&value_path, &dirs.root)? {
            info!(path = %final_path.display(), "final area-scaled raster");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let config = AlignConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let workspace = Workspace::new(args.workspace.clone().unwrap_or_else(|| config.workspace_dir.clone()));
    let dirs = Dirs::new(&workspace);
    dirs.create()?;
    let runner = Runner::new(args.n_workers)?;

    let mask_name = url_file_name(&config.mask_url).context("mask URL has no file name")?;
    let mask_path = dirs.ecoshards.join(mask_name);

    // Downloads first: every later step reads the mask.
    let mut downloads = Phase::new("download");
    {
        let (url, target) = (config.mask_url.clone(), mask_path.clone());
        downloads.push(Job::new(format!("download {mask_name}"), vec![target.clone()], move || {
            download_url(&url, &target, true)
        }));
    }
    let mut sources = Vec::with_capacity(config.rasters.len());
    for entry in &config.rasters {
        let url = config.url_for(entry);
        let target = dirs.ecoshards.join(&entry.file);
        debug!(url = %url, target = %target.display(), "queue download");
        sources.push(target.clone());
        downloads.push(Job::new(format!("download {}", entry.file), vec![target.clone()], move || {
            download_url(&url, &target, true)
        }));
    }
    runner.run_phase(downloads)?;

    let mut align = Phase::new("align");
    for (entry, source) in config.rasters.iter().cloned().zip(sources) {
        let (mask_path, dirs) = (mask_path.clone(), dirs.clone());
        let method = config.resample_method;
        align.push(Job::new(format!("align {}", entry.file), vec![], move || {
            process_raster(&entry, &source, &mask_path, method, &dirs)
        }));
    }
    let report = runner.run_phase(align)?;
    info!(rasters = report.ran.len(), workspace = %workspace.root.display(), "all rasters aligned");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecocalc_core::coords::{GeoTransform, Projection};
    use ecocalc_core::Raster;

    #[test]
    fn suffix_goes_before_extension() {
        let p = with_suffix(Path::new("ws/warped"), Path::new("a/pop_md5_ab.tif"), "_WARPED_near");
        assert_eq!(p, PathBuf::from("ws/warped/pop_md5_ab_WARPED_near.tif"));
    }

    #[test]
    fn chain_warps_masks_and_rehashes() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path().join("ws"));
        let dirs = Dirs::new(&ws);
        dirs.create().unwrap();

        let mask = Raster::new(2, 2, GeoTransform::new(0.0, 1.0, 2.0, -1.0), 1.0)
            .with_data(vec![1.0, 0.0, 1.0, 1.0])
            .with_nodata(Some(0.0))
            .with_projection(Some(Projection::WGS84));
        let mask_path = dirs.ecoshards.join("mask.tif");
        write_raster(&mask_path, &mask).unwrap();

        let fine = Raster::new(4, 4, GeoTransform::new(0.0, 0.5, 2.0, -0.5), 3.0)
            .with_nodata(Some(-1.0))
            .with_projection(Some(Projection::WGS84));
        let source = dirs.ecoshards.join("svc.tif");
        write_raster(&source, &fine).unwrap();

        let entry = AlignRaster { file: "svc.tif".into(), mask: true, per_area: false, wgs84: true };
        process_raster(&entry, &source, &mask_path, ResampleMethod::Average, &dirs).unwrap();

        let masked = read_raster(&dirs.mask.join("svc_WARPED_average_MASKED.tif")).unwrap();
        assert_eq!(masked.width, 2);
        assert_eq!(masked.data, vec![3.0, -1.0, 3.0, 3.0]);
        let hashed = std::fs::read_dir(&dirs.root)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("_md5_"));
        assert!(hashed);
    }
}

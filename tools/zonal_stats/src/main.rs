//! Zonal statistics of every raster matching a glob pattern over the
//! polygons of a GeoJSON layer, one timestamped CSV table per raster.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::{info, warn};

use ecocalc_core::geotiff::{read_raster, write_raster};
use ecocalc_core::logging;
use ecocalc_core::zonal::{label_raster, write_stats_csv, zonal_statistics, OverlapMode, VectorLayer};

#[derive(Parser, Debug)]
#[command(name = "zonal_stats", about = "Per-polygon raster statistics as CSV tables")]
struct Args {
    /// Raster path or glob pattern.
    raster_pattern: String,

    /// GeoJSON polygon layer in the rasters' coordinate system.
    vector_path: PathBuf,

    /// Vector field to include next to the fid.
    #[arg(long = "field_name")]
    field_name: Option<String>,

    /// Keep the working directory with the burned label grids.
    #[arg(long = "keep_working_dir")]
    keep_working_dir: bool,

    /// Polygons overlap; collect statistics for each one independently.
    #[arg(long = "polygons_overlap")]
    polygons_overlap: bool,

    #[arg(long, default_value = "zonal_stats_workspace")]
    workspace: PathBuf,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// UTC timestamp with `-`, `:`, `.` and spaces replaced by `_`.
fn time_str(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d %H:%M:%S%.6f")
        .to_string()
        .replace(['-', ':', '.', ' '], "_")
}

fn table_path(workspace: &Path, raster_path: &Path, now: DateTime<Utc>) -> PathBuf {
    let basename = raster_path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    workspace.join(format!("{basename}_{}.csv", time_str(now)))
}

fn process(raster_path: &Path, layer: &VectorLayer, args: &Args, working_dir: &Path) -> Result<PathBuf> {
    let raster = read_raster(raster_path).with_context(|| format!("reading {}", raster_path.display()))?;
    let mode = if args.polygons_overlap { OverlapMode::Overlapping } else { OverlapMode::Disjoint };

    if mode == OverlapMode::Disjoint && args.keep_working_dir {
        let stem = raster_path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let labels_path = working_dir.join(format!("{stem}_fid_labels.tif"));
        write_raster(&labels_path, &label_raster(&raster, layer))?;
    }
    let stats = zonal_statistics(&raster, layer, mode);

    let table = table_path(&args.workspace, raster_path, Utc::now());
    info!(table = %table.display(), "building table");
    let file = File::create(&table).with_context(|| format!("creating {}", table.display()))?;
    write_stats_csv(
        BufWriter::new(file),
        &raster_path.display().to_string(),
        &args.vector_path.display().to_string(),
        args.field_name.as_deref(),
        &stats,
        layer,
    )?;
    Ok(table)
}

/// Cleanup failure is not fatal; the tables are already written.
fn remove_working_dir(dir: &Path) -> bool {
    match fs::remove_dir_all(dir) {
        Ok(()) => true,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "could not remove working directory");
            false
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    info!(pattern = %args.raster_pattern, vector = %args.vector_path.display(), "calculating zonal stats");
    let working_dir = args.workspace.join("zonal_stats");
    fs::create_dir_all(&working_dir).with_context(|| format!("creating {}", working_dir.display()))?;

    let layer = VectorLayer::from_geojson(&args.vector_path)
        .with_context(|| format!("reading {}", args.vector_path.display()))?;

    let mut n_tables = 0;
    for entry in glob::glob(&args.raster_pattern).context("invalid raster pattern")? {
        let raster_path = entry?;
        let table = process(&raster_path, &layer, &args, &working_dir)?;
        info!(table = %table.display(), "table written");
        n_tables += 1;
    }
    if n_tables == 0 {
        warn!(pattern = %args.raster_pattern, "no rasters matched");
    }

    if !args.keep_working_dir {
        remove_working_dir(&working_dir);
    }
    info!(tables = n_tables, "all done");
    Ok(())
}

//! Table-driven reclassification gated by a threshold raster: each base code
//! in the table flips to its `<=` or `>` target depending on the threshold.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use ecocalc_core::logging;
use ecocalc_core::reclass::{reclassify_paths, ReclassTable};

#[derive(Parser, Debug)]
#[command(name = "reclassify", about = "Reclassify a raster by table, triggered by a threshold raster")]
struct Args {
    /// Integer raster whose codes are looked up in the table.
    #[arg(long = "base_raster_path")]
    base_raster_path: PathBuf,

    /// Raster compared against --threshold_value.
    #[arg(long = "threshold_raster_path")]
    threshold_raster_path: PathBuf,

    /// Threshold pixels <= this use the second table column, > use the third.
    #[arg(long = "threshold_value", allow_hyphen_values = true)]
    threshold_value: f64,

    /// CSV table with a header row.
    #[arg(long = "reclassify_table_path")]
    reclassify_table_path: PathBuf,

    /// Column names: base code, target when <= threshold, target when > threshold.
    #[arg(long = "csv_table_fields", num_args = 3, required = true, value_names = ["BASE", "LEQ", "GT"])]
    csv_table_fields: Vec<String>,

    /// Output raster; defaults to `<base>_reclassified.tif` next to the base.
    #[arg(long = "target_raster_path")]
    target_raster_path: Option<PathBuf>,

    /// Directory for the aligned copies of the inputs.
    #[arg(long = "aligned_dir", default_value = "reclass_aligned_dir")]
    aligned_dir: PathBuf,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn default_target(base: &Path) -> PathBuf {
    let stem = base.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    base.with_file_name(format!("{stem}_reclassified.tif"))
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let fields = [
        args.csv_table_fields[0].as_str(),
        args.csv_table_fields[1].as_str(),
        args.csv_table_fields[2].as_str(),
    ];
    let table = ReclassTable::from_csv(&args.reclassify_table_path, fields)
        .with_context(|| format!("reading table {}", args.reclassify_table_path.display()))?;
    info!(codes = table.len(), fields = ?fields, "loaded reclassification table");

    let target = args
        .target_raster_path
        .clone()
        .unwrap_or_else(|| default_target(&args.base_raster_path));
    reclassify_paths(
        &args.base_raster_path,
        &args.threshold_raster_path,
        &table,
        args.threshold_value,
        &target,
        &args.aligned_dir,
    )
    .with_context(|| format!("reclassifying {}", args.base_raster_path.display()))?;
    info!(target = %target.display(), "done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_original_flag_names() {
        let args = Args::try_parse_from([
            "reclassify",
            "--base_raster_path", "lulc.tif",
            "--threshold_raster_path", "prob.tif",
            "--threshold_value", "0.5",
            "--reclassify_table_path", "table.csv",
            "--csv_table_fields", "lucode", "low", "high",
        ])
        .unwrap();
        assert_eq!(args.csv_table_fields, vec!["lucode", "low", "high"]);
        assert_eq!(args.threshold_value, 0.5);
        assert_eq!(args.aligned_dir, PathBuf::from("reclass_aligned_dir"));
        assert!(args.target_raster_path.is_none());
    }

    #[test]
    fn table_fields_need_three_names() {
        let res = Args::try_parse_from([
            "reclassify",
            "--base_raster_path", "a.tif",
            "--threshold_raster_path", "b.tif",
            "--threshold_value", "1",
            "--reclassify_table_path", "t.csv",
            "--csv_table_fields", "x", "y",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn default_target_sits_next_to_base() {
        assert_eq!(default_target(Path::new("d/lulc.tif")), PathBuf::from("d/lulc_reclassified.tif"));
    }
}

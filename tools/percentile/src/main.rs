//! Print percentiles of a raster's valid pixels.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use ecocalc_core::logging;
use ecocalc_core::percentile::raster_path_percentile;

#[derive(Parser, Debug)]
#[command(name = "percentile", about = "List percentiles of a raster band")]
struct Args {
    raster: PathBuf,

    /// Percentiles to report; every integer 0..=100 when omitted.
    #[arg(short, long, num_args = 1.., value_delimiter = ',')]
    percentiles: Vec<f64>,

    /// Emit a JSON array of {percentile, value} objects instead of text.
    #[arg(long)]
    json: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn requested(percentiles: Vec<f64>) -> Vec<f64> {
    if percentiles.is_empty() {
        (0..=100).map(f64::from).collect()
    } else {
        percentiles
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let percentiles = requested(args.percentiles);
    let values = raster_path_percentile(&args.raster, &percentiles)
        .with_context(|| format!("computing percentiles of {}", args.raster.display()))?;

    if args.json {
        let rows: Vec<serde_json::Value> = percentiles
            .iter()
            .zip(&values)
            .map(|(p, v)| serde_json::json!({ "percentile": p, "value": v }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for (p, v) in percentiles.iter().zip(&values) {
            println!("{p:>7}  {v}");
        }
    }
    Ok(())
}

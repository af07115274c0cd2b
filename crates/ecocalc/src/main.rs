//! Run raster calculation plans and inspect rasters.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use ecocalc_core::align::{warp_raster_path, ResampleMethod, WarpOptions};
use ecocalc_core::calc::{evaluate_calculation, Calculation};
use ecocalc_core::config::{Plan, Workspace};
use ecocalc_core::coords::{BoundingBox, Projection};
use ecocalc_core::ecoshard::hash_file;
use ecocalc_core::geotiff::read_info;
use ecocalc_core::logging;
use ecocalc_core::percentile::raster_path_percentile;
use ecocalc_core::pipeline::{Job, Phase, Runner};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "ecocalc", version, about = "Raster calculator for ecosystem-service layers")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every phase of a calculation plan.
    Run {
        /// Plan JSON file.
        plan: PathBuf,
        /// Override the plan's workspace directory.
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Override the plan's worker count (<= 0 uses all CPUs).
        #[arg(long, allow_hyphen_values = true)]
        n_workers: Option<i32>,
    },
    /// Evaluate a single calculation JSON file.
    Eval {
        calculation: PathBuf,
        #[arg(long, default_value = "CNC_workspace")]
        workspace: PathBuf,
    },
    /// Print raster metadata as JSON.
    Info { raster: PathBuf },
    /// Resample one raster onto a new pixel size and extent.
    Warp {
        base: PathBuf,
        target: PathBuf,
        /// Target pixel size: x y.
        #[arg(long, required = true, num_args = 2, value_names = ["X", "Y"], allow_hyphen_values = true)]
        pixel_size: Vec<f64>,
        #[arg(long, default_value = "near")]
        method: ResampleMethod,
        /// Target extent: xmin ymin xmax ymax.
        #[arg(long, num_args = 4, allow_hyphen_values = true)]
        bounding_box: Option<Vec<f64>>,
        /// Target projection, e.g. EPSG:4326. Must match the source.
        #[arg(long)]
        projection: Option<Projection>,
    },
    /// Print the md5 of each file, optionally renaming it to its hashed name.
    Hash {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long)]
        rename: bool,
    },
    /// Print percentiles of a raster's valid pixels.
    Percentile {
        raster: PathBuf,
        #[arg(required = true)]
        percentiles: Vec<f64>,
    },
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn calculation_job(calc: Calculation, workspace: &Workspace) -> Job {
    let target = workspace.resolve_target(&calc.target_raster_path);
    let name = target.display().to_string();
    let ws = workspace.clone();
    Job::new(name, vec![target], move || evaluate_calculation(&calc, &ws).map(|_| ()))
}

fn run_plan(path: &Path, workspace: Option<PathBuf>, n_workers: Option<i32>) -> Result<()> {
    let plan = Plan::load(path).with_context(|| format!("loading plan {}", path.display()))?;
    let workspace = Workspace::new(workspace.unwrap_or(plan.workspace_dir));
    workspace
        .ensure()
        .with_context(|| format!("creating workspace {}", workspace.root.display()))?;
    let runner = Runner::new(n_workers.unwrap_or(plan.n_workers))?;
    info!(
        phases = plan.phases.len(),
        workers = runner.n_workers(),
        workspace = %workspace.root.display(),
        "running plan"
    );

    for plan_phase in plan.phases {
        let mut phase = Phase::new(plan_phase.name.clone());
        for calc in plan_phase.calculations {
            phase.push(calculation_job(calc, &workspace));
        }
        let report = runner
            .run_phase(phase)
            .with_context(|| format!("phase '{}'", plan_phase.name))?;
        info!(phase = %report.phase, ran = report.ran.len(), skipped = report.skipped.len(), "done");
    }
    Ok(())
}

fn eval_one(path: &Path, workspace: PathBuf) -> Result<()> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let calc: Calculation =
        serde_json::from_str(&text).with_context(|| format!("parsing calculation {}", path.display()))?;
    let workspace = Workspace::new(workspace);
    workspace.ensure()?;
    let target = evaluate_calculation(&calc, &workspace)?;
    println!("{}", target.display());
    Ok(())
}

fn bounding_box_arg(values: Option<Vec<f64>>) -> Option<BoundingBox> {
    values.map(|v| BoundingBox::new(v[0], v[1], v[2], v[3]))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command {
        Command::Run { plan, workspace, n_workers } => run_plan(&plan, workspace, n_workers)?,
        Command::Eval { calculation, workspace } => eval_one(&calculation, workspace)?,
        Command::Info { raster } => {
            let info = read_info(&raster).with_context(|| format!("reading {}", raster.display()))?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Warp { base, target, pixel_size, method, bounding_box, projection } => {
            let opts = WarpOptions {
                pixel_size: (pixel_size[0], pixel_size[1]),
                bounding_box: bounding_box_arg(bounding_box),
                projection,
                method,
            };
            warp_raster_path(&base, &target, &opts)
                .with_context(|| format!("warping {} to {}", base.display(), target.display()))?;
        }
        Command::Hash { files, rename } => {
            for file in files {
                let digest = hash_file(&file, rename).with_context(|| format!("hashing {}", file.display()))?;
                println!("{digest}  {}", file.display());
            }
        }
        Command::Percentile { raster, percentiles } => {
            let values = raster_path_percentile(&raster, &percentiles)
                .with_context(|| format!("percentiles of {}", raster.display()))?;
            for (p, v) in percentiles.iter().zip(values) {
                println!("{p}\t{v}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_warp_arguments() {
        let cli = Cli::try_parse_from([
            "ecocalc", "warp", "a.tif", "b.tif", "--pixel-size", "0.5", "-0.5", "--method", "average",
            "--bounding-box", "-10", "0", "10", "20",
        ])
        .unwrap();
        let Command::Warp { pixel_size, method, bounding_box, .. } = cli.command else {
            panic!("expected warp");
        };
        assert_eq!(pixel_size, vec![0.5, -0.5]);
        assert_eq!(method, ResampleMethod::Average);
        assert_eq!(bounding_box_arg(bounding_box), Some(BoundingBox::new(-10.0, 0.0, 10.0, 20.0)));
    }

    #[test]
    fn run_accepts_negative_workers() {
        let cli = Cli::try_parse_from(["ecocalc", "-v", "run", "plan.json", "--n-workers", "-1"]).unwrap();
        assert_eq!(cli.verbose, 1);
        assert!(matches!(cli.command, Command::Run { n_workers: Some(-1), .. }));
    }

    #[test]
    fn calculation_job_targets_workspace() {
        let ws = Workspace::new("ws");
        let job = calculation_job(Calculation::new("a", -1.0, "out.tif"), &ws);
        assert_eq!(job.targets, vec![PathBuf::from("ws/out.tif")]);
    }
}

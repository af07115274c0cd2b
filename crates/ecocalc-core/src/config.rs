//! Workspaces and the JSON documents that drive the binaries.
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::align::ResampleMethod;
use crate::calc::Calculation;
use crate::error::Result;

// ── Workspace ─────────────────────────────────────────────────────────────────

/// Root directory for downloads, intermediates and relative outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where downloaded rasters are cached.
    pub fn ecoshard_dir(&self) -> PathBuf {
        self.root.join("ecoshards")
    }

    pub fn working_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Relative paths are placed under the workspace root.
    pub fn resolve_target(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.ecoshard_dir())?;
        Ok(())
    }
}

// ── Calculation plan ──────────────────────────────────────────────────────────

fn default_plan_workspace() -> PathBuf {
    PathBuf::from("CNC_workspace")
}

fn default_n_workers() -> i32 {
    -1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPhase {
    pub name: String,
    #[serde(default)]
    pub calculations: Vec<Calculation>,
}

/// Phases of raster calculations. Phases run in order; the calculations
/// inside a phase run in parallel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default = "default_plan_workspace")]
    pub workspace_dir: PathBuf,
    #[serde(default = "default_n_workers")]
    pub n_workers: i32,
    #[serde(default)]
    pub phases: Vec<PlanPhase>,
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

// ── align_to_mask configuration ───────────────────────────────────────────────

fn default_align_workspace() -> PathBuf {
    PathBuf::from("align_to_mask_workspace")
}

/// One raster to bring onto the mask grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignRaster {
    /// File name under `url_prefix`.
    pub file: String,
    /// Apply the mask after alignment.
    #[serde(default)]
    pub mask: bool,
    /// Values are per-pixel totals; convert to density before warping.
    #[serde(default)]
    pub per_area: bool,
    /// Source is in WGS84 degrees.
    #[serde(default)]
    pub wgs84: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignConfig {
    pub mask_url: String,
    pub url_prefix: String,
    #[serde(default)]
    pub resample_method: ResampleMethod,
    #[serde(default = "default_align_workspace")]
    pub workspace_dir: PathBuf,
    pub rasters: Vec<AlignRaster>,
}

impl AlignConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Full URL of a raster listed in the config.
    pub fn url_for(&self, raster: &AlignRaster) -> String {
        format!("{}/{}", self.url_prefix.trim_end_matches('/'), raster.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_targets_land_in_workspace() {
        let ws = Workspace::new("ws");
        assert_eq!(ws.resolve_target(Path::new("out.tif")), PathBuf::from("ws/out.tif"));
        assert_eq!(ws.resolve_target(Path::new("/tmp/out.tif")), PathBuf::from("/tmp/out.tif"));
        assert_eq!(ws.ecoshard_dir(), PathBuf::from("ws/ecoshards"));
    }

    #[test]
    fn plan_defaults() {
        let plan: Plan = serde_json::from_str(
            r#"{"phases": [{"name": "clamp", "calculations": [{
                "expression": "(val >= 0) * val",
                "symbol_to_path_map": {"val": "raw.tif"},
                "target_nodata": -1,
                "target_raster_path": "clamped.tif",
                "build_overview": true
            }]}]}"#,
        )
        .unwrap();
        assert_eq!(plan.workspace_dir, PathBuf::from("CNC_workspace"));
        assert_eq!(plan.n_workers, -1);
        assert_eq!(plan.phases[0].calculations.len(), 1);
    }

    #[test]
    fn align_config_parses() {
        let cfg: AlignConfig = serde_json::from_str(
            r#"{
                "mask_url": "https://h/b/mask.tif",
                "url_prefix": "https://h/b/",
                "resample_method": "average",
                "rasters": [{"file": "pop.tif", "per_area": true, "wgs84": true}]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.resample_method, ResampleMethod::Average);
        assert_eq!(cfg.workspace_dir, PathBuf::from("align_to_mask_workspace"));
        assert!(!cfg.rasters[0].mask);
        assert_eq!(cfg.url_for(&cfg.rasters[0]), "https://h/b/pop.tif");
    }

    #[test]
    fn ensure_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path().join("w"));
        ws.ensure().unwrap();
        assert!(ws.ecoshard_dir().is_dir());
    }
}

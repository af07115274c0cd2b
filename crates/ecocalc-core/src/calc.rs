//! Raster calculator: evaluate an expression over named rasters and write the
//! result as a new raster.
use std::collections::BTreeMap;
use std::path::PathBuf;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::align::{align_and_resize_raster_stack, BoundingBoxMode, ResampleMethod};
use crate::config::Workspace;
use crate::coords::{projection_or_wgs84, Projection};
use crate::download::{download_url, is_url, url_file_name};
use crate::error::{EcocalcError, Result};
use crate::expr::{parse, Env, Expr};
use crate::geotiff::{read_raster, write_raster};
use crate::percentile::raster_band_percentile;
use crate::raster::{DataType, Raster};

/// Where a symbol's values come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SymbolSource {
    Constant(f64),
    /// Local path or http(s) URL.
    Path(String),
}

/// One raster calculation as written in a plan file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calculation {
    pub expression: String,
    pub symbol_to_path_map: BTreeMap<String, SymbolSource>,
    pub target_nodata: f64,
    pub target_raster_path: PathBuf,
    #[serde(default)]
    pub target_pixel_size: Option<(f64, f64)>,
    #[serde(default)]
    pub resample_method: ResampleMethod,
    #[serde(default, alias = "target_sr_wkt")]
    pub target_projection: Option<Projection>,
    /// Replacement for NaN results, e.g. from 0/0.
    #[serde(default)]
    pub default_nan: Option<f64>,
    /// Replacement for infinite results.
    #[serde(default)]
    pub default_inf: Option<f64>,
    #[serde(default)]
    pub bounding_box_mode: BoundingBoxMode,
    #[serde(default)]
    pub datatype: DataType,
}

impl Calculation {
    pub fn new(expression: impl Into<String>, target_nodata: f64, target_raster_path: impl Into<PathBuf>) -> Self {
        Self {
            expression: expression.into(),
            symbol_to_path_map: BTreeMap::new(),
            target_nodata,
            target_raster_path: target_raster_path.into(),
            target_pixel_size: None,
            resample_method: ResampleMethod::default(),
            target_projection: None,
            default_nan: None,
            default_inf: None,
            bounding_box_mode: BoundingBoxMode::default(),
            datatype: DataType::default(),
        }
    }

    pub fn symbol(mut self, name: impl Into<String>, source: SymbolSource) -> Self {
        self.symbol_to_path_map.insert(name.into(), source);
        self
    }
}

/// A symbol after its source has been loaded.
#[derive(Debug, Clone)]
pub enum Operand {
    Raster(Raster),
    Constant(f64),
}

// ── Per-pixel environment ─────────────────────────────────────────────────────

struct PixelEnv<'a> {
    names: &'a [String],
    values: &'a [f64],
    /// `(symbol, percentile, value)`.
    percentiles: &'a [(String, f64, f64)],
}

impl Env for PixelEnv<'_> {
    fn symbol(&self, name: &str) -> Option<f64> {
        self.names.iter().position(|n| n == name).map(|i| self.values[i])
    }

    fn percentile(&self, name: &str, percentile: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|(s, p, _)| s == name && *p == percentile)
            .map(|(_, _, v)| *v)
    }
}

// ── Evaluation ────────────────────────────────────────────────────────────────

fn check_symbols(expr: &Expr, calc: &Calculation) -> Result<()> {
    match expr.symbols().into_iter().find(|s| !calc.symbol_to_path_map.contains_key(s)) {
        Some(missing) => Err(EcocalcError::UnknownSymbol(missing)),
        None => Ok(()),
    }
}

/// Evaluate `calc` over already-loaded operands. Rasters are aligned first;
/// the result is on the aligned grid with `target_nodata` as nodata.
pub fn evaluate_operands(calc: &Calculation, operands: BTreeMap<String, Operand>) -> Result<Raster> {
    let expr = parse(&calc.expression)?;
    check_symbols(&expr, calc)?;
    let used = expr.symbols();

    let mut names = Vec::new();
    let mut rasters = Vec::new();
    let mut constants = Vec::new();
    for (name, op) in operands.into_iter().filter(|(n, _)| used.contains(n)) {
        match op {
            Operand::Raster(r) => {
                names.push(name);
                rasters.push(r);
            }
            Operand::Constant(c) => constants.push((name, c)),
        }
    }
    let first = rasters.first().ok_or(EcocalcError::NoRasterInputs)?;

    let pixel_size = calc.target_pixel_size.unwrap_or_else(|| first.pixel_size());
    let projection = calc
        .target_projection
        .unwrap_or_else(|| projection_or_wgs84(first.projection, &names[0]));
    let methods = vec![calc.resample_method; rasters.len()];
    let aligned = align_and_resize_raster_stack(
        &rasters,
        &methods,
        pixel_size,
        calc.bounding_box_mode,
        Some(projection),
    )?;
    drop(rasters);

    // Percentiles are computed once per symbol over the aligned raster.
    let mut percentiles = Vec::new();
    let mut wanted: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for (sym, p) in expr.percentile_requests() {
        wanted.entry(sym).or_default().push(p);
    }
    for (sym, ps) in wanted {
        let values = match names.iter().position(|n| *n == sym) {
            Some(i) => raster_band_percentile(&aligned[i], &ps)?,
            None => {
                let c = constants.iter().find(|(n, _)| *n == sym).map_or(f64::NAN, |(_, c)| *c);
                vec![c; ps.len()]
            }
        };
        for (p, v) in ps.iter().zip(values) {
            debug!(symbol = %sym, percentile = p, value = v, "percentile");
            percentiles.push((sym.clone(), *p, v));
        }
    }

    let grid = &aligned[0];
    let (width, height) = (grid.width, grid.height);
    let mut env_names = names.clone();
    env_names.extend(constants.iter().map(|(n, _)| n.clone()));
    let n_rasters = names.len();

    let mut data = vec![calc.target_nodata; width * height];
    data.par_chunks_mut(width.max(1)).enumerate().for_each(|(row, out_row)| {
        let mut values: Vec<f64> = vec![0.0; env_names.len()];
        for (i, (_, c)) in constants.iter().enumerate() {
            values[n_rasters + i] = *c;
        }
        for (col, out) in out_row.iter_mut().enumerate() {
            let idx = row * width + col;
            let mut any_nodata = false;
            for (slot, r) in aligned.iter().enumerate() {
                let v = r.data[idx];
                if r.is_nodata(v) {
                    any_nodata = true;
                    break;
                }
                values[slot] = v;
            }
            if any_nodata {
                continue;
            }
            let env = PixelEnv { names: &env_names, values: &values, percentiles: &percentiles };
            let v = expr.eval(&env);
            *out = if v.is_nan() {
                calc.default_nan.unwrap_or(v)
            } else if v.is_infinite() {
                calc.default_inf.unwrap_or(v)
            } else {
                v
            };
        }
    });

    Ok(Raster {
        data,
        width,
        height,
        geotransform: grid.geotransform,
        nodata: Some(calc.target_nodata),
        datatype: calc.datatype,
        projection: Some(projection),
    })
}

/// Load a symbol's source, downloading URLs into the workspace cache.
fn load_operand(source: &SymbolSource, workspace: &Workspace) -> Result<Operand> {
    match source {
        SymbolSource::Constant(c) => Ok(Operand::Constant(*c)),
        SymbolSource::Path(p) if is_url(p) => {
            let name = url_file_name(p)
                .ok_or_else(|| EcocalcError::InvalidArgument(format!("URL '{p}' has no file name")))?;
            let local = workspace.ecoshard_dir().join(name);
            download_url(p, &local, true)?;
            Ok(Operand::Raster(read_raster(&local)?))
        }
        SymbolSource::Path(p) => Ok(Operand::Raster(read_raster(p.as_ref())?)),
    }
}

/// Run one calculation end to end and return the path of the written raster.
/// A relative `target_raster_path` is placed in the workspace.
pub fn evaluate_calculation(calc: &Calculation, workspace: &Workspace) -> Result<PathBuf> {
    info!(expression = %calc.expression, target = %calc.target_raster_path.display(), "evaluate calculation");
    let expr = parse(&calc.expression)?;
    check_symbols(&expr, calc)?;

    let mut operands = BTreeMap::new();
    for name in expr.symbols() {
        let source = &calc.symbol_to_path_map[&name];
        operands.insert(name, load_operand(source, workspace)?);
    }

    let result = evaluate_operands(calc, operands)?;
    let target = workspace.resolve_target(&calc.target_raster_path);
    write_raster(&target, &result)?;
    info!(target = %target.display(), "calculation complete");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::GeoTransform;
    use approx::assert_relative_eq;

    fn grid() -> GeoTransform {
        GeoTransform::new(0.0, 1.0, 2.0, -1.0)
    }

    fn raster(data: Vec<f64>, nodata: f64) -> Raster {
        Raster::new(2, 2, grid(), 0.0)
            .with_data(data)
            .with_nodata(Some(nodata))
            .with_projection(Some(Projection::WGS84))
    }

    fn operands(pairs: Vec<(&str, Operand)>) -> BTreeMap<String, Operand> {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn output_nodata_is_target_nodata() {
        let calc = Calculation::new("a * 2", -9999.0, "out.tif")
            .symbol("a", SymbolSource::Path("a.tif".into()));
        let a = raster(vec![1.0, -1.0, 3.0, 4.0], -1.0);
        let out = evaluate_operands(&calc, operands(vec![("a", Operand::Raster(a))])).unwrap();
        assert_eq!(out.nodata, Some(-9999.0));
        assert_eq!(out.data, vec![2.0, -9999.0, 6.0, 8.0]);
    }

    #[test]
    fn constants_and_two_rasters() {
        let calc = Calculation::new("(a > k) * b", -1.0, "out.tif")
            .symbol("a", SymbolSource::Path("a.tif".into()))
            .symbol("b", SymbolSource::Path("b.tif".into()))
            .symbol("k", SymbolSource::Constant(2.0));
        let a = raster(vec![1.0, 2.0, 3.0, 4.0], -9.0);
        let b = raster(vec![10.0, 20.0, 30.0, 40.0], -9.0);
        let out = evaluate_operands(
            &calc,
            operands(vec![("a", Operand::Raster(a)), ("b", Operand::Raster(b)), ("k", Operand::Constant(2.0))]),
        )
        .unwrap();
        assert_eq!(out.data, vec![0.0, 0.0, 30.0, 40.0]);
    }

    #[test]
    fn nan_and_inf_defaults() {
        let mut calc = Calculation::new("a / b", -1.0, "out.tif")
            .symbol("a", SymbolSource::Path("a".into()))
            .symbol("b", SymbolSource::Path("b".into()));
        calc.default_nan = Some(0.0);
        calc.default_inf = Some(100.0);
        let a = raster(vec![0.0, 1.0, 4.0, 1.0], -9.0);
        let b = raster(vec![0.0, 0.0, 2.0, 4.0], -9.0);
        let out = evaluate_operands(&calc, operands(vec![("a", Operand::Raster(a)), ("b", Operand::Raster(b))]))
            .unwrap();
        assert_eq!(out.data, vec![0.0, 100.0, 2.0, 0.25]);
    }

    #[test]
    fn percentile_normalisation() {
        let calc = Calculation::new("service / percentile(service, 100)", -1.0, "out.tif")
            .symbol("service", SymbolSource::Path("s.tif".into()));
        let s = raster(vec![1.0, 2.0, 4.0, 8.0], -9.0);
        let out = evaluate_operands(&calc, operands(vec![("service", Operand::Raster(s))])).unwrap();
        assert_relative_eq!(out.get(1, 1), 1.0);
        assert_relative_eq!(out.get(0, 0), 0.125);
    }

    #[test]
    fn unknown_symbol_is_rejected() {
        let calc = Calculation::new("a + z", -1.0, "out.tif").symbol("a", SymbolSource::Constant(1.0));
        let err = evaluate_operands(&calc, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, EcocalcError::UnknownSymbol(ref s) if s == "z"));
    }

    #[test]
    fn constants_only_is_rejected() {
        let calc = Calculation::new("a + 1", -1.0, "out.tif").symbol("a", SymbolSource::Constant(1.0));
        let err = evaluate_operands(&calc, operands(vec![("a", Operand::Constant(1.0))])).unwrap_err();
        assert!(matches!(err, EcocalcError::NoRasterInputs));
    }

    #[test]
    fn wkt_target_projection_is_accepted() {
        let wkt = r#"GEOGCS[\"WGS 84\",DATUM[\"WGS_1984\",SPHEROID[\"WGS 84\",6378137,298.257223563,AUTHORITY[\"EPSG\",\"7030\"]],AUTHORITY[\"EPSG\",\"6326\"]],PRIMEM[\"Greenwich\",0],UNIT[\"degree\",0.0174532925199433],AUTHORITY[\"EPSG\",\"4326\"]]"#;
        let json = format!(
            r#"{{"expression": "x", "symbol_to_path_map": {{"x": "x.tif"}}, "target_nodata": -1,
                "target_raster_path": "y.tif", "target_sr_wkt": "{wkt}"}}"#
        );
        let calc: Calculation = serde_json::from_str(&json).unwrap();
        assert_eq!(calc.target_projection, Some(Projection::WGS84));
    }

    #[test]
    fn plan_entry_deserialises_with_aliases() {
        let calc: Calculation = serde_json::from_str(
            r#"{
                "expression": "x",
                "symbol_to_path_map": {"x": "https://h/b/x.tif", "k": 3},
                "target_nodata": -1,
                "target_raster_path": "x.tif",
                "target_pixel_size": [0.5, -0.5],
                "resample_method": "average",
                "target_sr_wkt": "EPSG:4326",
                "build_overview": true
            }"#,
        )
        .unwrap();
        assert_eq!(calc.target_projection, Some(Projection::WGS84));
        assert_eq!(calc.symbol_to_path_map["k"], SymbolSource::Constant(3.0));
        assert_eq!(calc.target_pixel_size, Some((0.5, -0.5)));
        assert_eq!(calc.resample_method, ResampleMethod::Average);
    }

    #[test]
    fn end_to_end_writes_into_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.tif");
        write_raster(&input, &raster(vec![1.0, 2.0, -1.0, 4.0], -1.0)).unwrap();
        let ws = Workspace::new(dir.path().join("ws"));
        let calc = Calculation::new("(val >= 2) * val", 0.0, "clamped.tif")
            .symbol("val", SymbolSource::Path(input.to_string_lossy().into_owned()));

        let target = evaluate_calculation(&calc, &ws).unwrap();
        assert_eq!(target, dir.path().join("ws").join("clamped.tif"));
        let out = read_raster(&target).unwrap();
        assert_eq!(out.nodata, Some(0.0));
        assert_eq!(out.data, vec![0.0, 2.0, 0.0, 4.0]);
    }
}

//! Resampling rasters onto a target grid and aligning stacks of rasters so
//! they share one grid.
//!
//! Only same-CRS warps are supported: a target projection that differs from
//! the source fails with `ProjectionMismatch`. A source with no projection is
//! assumed to be WGS84.
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::coords::{projection_or_wgs84, BoundingBox, GeoTransform, Projection};
use crate::error::{EcocalcError, Result};
use crate::geotiff::{read_raster, write_raster};
use crate::raster::Raster;

// ── Methods ───────────────────────────────────────────────────────────────────

/// Resampling kernel, named after the GDAL resampling algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResampleMethod {
    #[default]
    #[serde(alias = "nearest")]
    Near,
    Bilinear,
    Average,
    Mode,
    Min,
    Max,
    Sum,
}

impl ResampleMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Near => "near",
            Self::Bilinear => "bilinear",
            Self::Average => "average",
            Self::Mode => "mode",
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
        }
    }
}

impl fmt::Display for ResampleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResampleMethod {
    type Err = EcocalcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "near" | "nearest" => Ok(Self::Near),
            "bilinear" => Ok(Self::Bilinear),
            "average" => Ok(Self::Average),
            "mode" => Ok(Self::Mode),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "sum" => Ok(Self::Sum),
            other => Err(EcocalcError::InvalidArgument(format!("unknown resample method '{other}'"))),
        }
    }
}

/// How the target extent of an aligned stack is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BoundingBoxMode {
    #[default]
    Intersection,
    Union,
    /// Use the extent of the raster at this index.
    Raster(usize),
    Explicit(BoundingBox),
}

#[derive(Debug, Clone, Copy)]
pub struct WarpOptions {
    /// Target `(x, y)` pixel size. Signs are normalised so rows run north to south.
    pub pixel_size: (f64, f64),
    /// Target extent; the source extent when `None`.
    pub bounding_box: Option<BoundingBox>,
    /// Target projection; the source projection when `None`.
    pub projection: Option<Projection>,
    pub method: ResampleMethod,
}

// ── Target grid ───────────────────────────────────────────────────────────────

/// Cells needed to cover `extent` with `step`, tolerating floating-point slop.
fn cells_to_cover(extent: f64, step: f64) -> usize {
    let n = extent / step.abs();
    ((n - 1e-6).ceil() as usize).max(1)
}

fn target_grid(bb: &BoundingBox, pixel_size: (f64, f64)) -> (GeoTransform, usize, usize) {
    let pw = pixel_size.0.abs();
    let ph = -pixel_size.1.abs();
    let gt = GeoTransform::from_bounding_box(bb, pw, ph);
    (gt, cells_to_cover(bb.width(), pw), cells_to_cover(bb.height(), ph))
}

// ── Kernels ───────────────────────────────────────────────────────────────────

fn sample_near(src: &Raster, x: f64, y: f64) -> Option<f64> {
    let (cf, rf) = src.geotransform.pixel_of(x, y);
    if cf < 0.0 || rf < 0.0 {
        return None;
    }
    let (c, r) = (cf.floor() as usize, rf.floor() as usize);
    if c >= src.width || r >= src.height {
        return None;
    }
    let v = src.get(r, c);
    (!src.is_nodata(v)).then_some(v)
}

/// Bilinear interpolation between source pixel centres. Nodata neighbours are
/// dropped and the remaining weights renormalised.
fn sample_bilinear(src: &Raster, x: f64, y: f64) -> Option<f64> {
    let (cf, rf) = src.geotransform.pixel_of(x, y);
    if cf < 0.0 || rf < 0.0 || cf > src.width as f64 || rf > src.height as f64 {
        return None;
    }
    let fx = (cf - 0.5).clamp(0.0, (src.width - 1) as f64);
    let fy = (rf - 0.5).clamp(0.0, (src.height - 1) as f64);
    let x0 = fx.floor() as usize;
    let y0 = fy.floor() as usize;
    let x1 = (x0 + 1).min(src.width - 1);
    let y1 = (y0 + 1).min(src.height - 1);
    let tx = fx - x0 as f64;
    let ty = fy - y0 as f64;

    let taps = [
        (y0, x0, (1.0 - tx) * (1.0 - ty)),
        (y0, x1, tx * (1.0 - ty)),
        (y1, x0, (1.0 - tx) * ty),
        (y1, x1, tx * ty),
    ];
    let mut acc = 0.0;
    let mut wsum = 0.0;
    for (r, c, w) in taps {
        let v = src.get(r, c);
        if w > 0.0 && !src.is_nodata(v) {
            acc += v * w;
            wsum += w;
        }
    }
    (wsum > 0.0).then(|| acc / wsum)
}

/// Valid source values overlapping the target footprint, with overlap fraction.
fn footprint(src: &Raster, bb: &BoundingBox) -> Vec<(f64, f64)> {
    let gt = &src.geotransform;
    let (ca, ra) = gt.pixel_of(bb.xmin, bb.ymax);
    let (cb, rb) = gt.pixel_of(bb.xmax, bb.ymin);
    let c0 = ca.min(cb).floor().max(0.0) as usize;
    let c1 = (ca.max(cb).ceil().max(0.0) as usize).min(src.width);
    let r0 = ra.min(rb).floor().max(0.0) as usize;
    let r1 = (ra.max(rb).ceil().max(0.0) as usize).min(src.height);

    let cell_area = (gt.pixel_width * gt.pixel_height).abs();
    let mut out = Vec::new();
    for r in r0..r1 {
        let ya = gt.origin_y + r as f64 * gt.pixel_height;
        let yb = ya + gt.pixel_height;
        let oy = yb.max(ya).min(bb.ymax) - yb.min(ya).max(bb.ymin);
        if oy <= 0.0 {
            continue;
        }
        for c in c0..c1 {
            let xa = gt.origin_x + c as f64 * gt.pixel_width;
            let xb = xa + gt.pixel_width;
            let ox = xb.max(xa).min(bb.xmax) - xb.min(xa).max(bb.xmin);
            if ox <= 0.0 {
                continue;
            }
            let v = src.get(r, c);
            if !src.is_nodata(v) {
                out.push((v, ox * oy / cell_area));
            }
        }
    }
    out
}

/// Most frequent value; ties resolve to the smallest value.
fn mode_of(values: &mut [(f64, f64)]) -> f64 {
    values.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut best = values[0].0;
    let mut best_count = 0usize;
    let mut i = 0;
    while i < values.len() {
        let mut j = i;
        while j < values.len() && values[j].0 == values[i].0 {
            j += 1;
        }
        if j - i > best_count {
            best_count = j - i;
            best = values[i].0;
        }
        i = j;
    }
    best
}

fn sample_area(src: &Raster, bb: &BoundingBox, method: ResampleMethod) -> Option<f64> {
    let mut vals = footprint(src, bb);
    if vals.is_empty() {
        return None;
    }
    let v = match method {
        ResampleMethod::Average => {
            let wsum: f64 = vals.iter().map(|(_, w)| w).sum();
            vals.iter().map(|(v, w)| v * w).sum::<f64>() / wsum
        }
        ResampleMethod::Sum => vals.iter().map(|(v, w)| v * w).sum(),
        ResampleMethod::Min => vals.iter().map(|(v, _)| *v).fold(f64::INFINITY, f64::min),
        ResampleMethod::Max => vals.iter().map(|(v, _)| *v).fold(f64::NEG_INFINITY, f64::max),
        ResampleMethod::Mode => mode_of(&mut vals),
        ResampleMethod::Near | ResampleMethod::Bilinear => unreachable!("point kernels are sampled directly"),
    };
    Some(v)
}

// ── Warp ──────────────────────────────────────────────────────────────────────

/// Resample `src` onto the grid described by `opts`.
pub fn warp_raster(src: &Raster, opts: &WarpOptions) -> Result<Raster> {
    let src_proj = projection_or_wgs84(src.projection, "source raster");
    if let Some(target) = opts.projection {
        if target != src_proj {
            return Err(EcocalcError::ProjectionMismatch { from: src_proj, to: target });
        }
    }

    let bb = opts.bounding_box.unwrap_or_else(|| src.bounding_box());
    if bb.is_empty() {
        return Err(EcocalcError::EmptyIntersection);
    }
    let (gt, width, height) = target_grid(&bb, opts.pixel_size);
    let fill = src.fill_value();
    let method = opts.method;

    let mut data = vec![fill; width * height];
    data.par_chunks_mut(width).enumerate().for_each(|(row, out_row)| {
        for (col, out) in out_row.iter_mut().enumerate() {
            let (x, y) = gt.pixel_center(row, col);
            let v = match method {
                ResampleMethod::Near => sample_near(src, x, y),
                ResampleMethod::Bilinear => sample_bilinear(src, x, y),
                _ => {
                    let cell = BoundingBox::new(
                        x - gt.pixel_width / 2.0,
                        y + gt.pixel_height / 2.0,
                        x + gt.pixel_width / 2.0,
                        y - gt.pixel_height / 2.0,
                    );
                    sample_area(src, &cell, method)
                }
            };
            if let Some(v) = v {
                *out = v;
            }
        }
    });

    debug!(width, height, ?method, "warped raster");
    Ok(Raster {
        data,
        width,
        height,
        geotransform: gt,
        nodata: src.nodata,
        datatype: src.datatype,
        projection: Some(src_proj),
    })
}

/// Read, warp and write a single raster.
pub fn warp_raster_path(base: &Path, target: &Path, opts: &WarpOptions) -> Result<()> {
    info!(base = %base.display(), target = %target.display(), method = ?opts.method, "warp raster");
    let src = read_raster(base)?;
    let warped = warp_raster(&src, opts)?;
    write_raster(target, &warped)
}

// ── Stack alignment ───────────────────────────────────────────────────────────

fn stack_bounding_box(rasters: &[Raster], mode: BoundingBoxMode) -> Result<BoundingBox> {
    let first = rasters
        .first()
        .ok_or_else(|| EcocalcError::InvalidArgument("no rasters to align".into()))?;
    let bb = match mode {
        BoundingBoxMode::Intersection => rasters
            .iter()
            .skip(1)
            .fold(first.bounding_box(), |acc, r| acc.intersection(&r.bounding_box())),
        BoundingBoxMode::Union => rasters
            .iter()
            .skip(1)
            .fold(first.bounding_box(), |acc, r| acc.union(&r.bounding_box())),
        BoundingBoxMode::Raster(i) => rasters
            .get(i)
            .ok_or_else(|| EcocalcError::InvalidArgument(format!("raster index {i} out of range")))?
            .bounding_box(),
        BoundingBoxMode::Explicit(bb) => bb,
    };
    if bb.is_empty() {
        return Err(EcocalcError::EmptyIntersection);
    }
    Ok(bb)
}

/// Resample every raster onto one shared grid. Rasters already on that grid
/// are passed through untouched.
pub fn align_and_resize_raster_stack(
    rasters: &[Raster],
    methods: &[ResampleMethod],
    pixel_size: (f64, f64),
    mode: BoundingBoxMode,
    projection: Option<Projection>,
) -> Result<Vec<Raster>> {
    if rasters.len() != methods.len() {
        return Err(EcocalcError::InvalidArgument(format!(
            "{} rasters but {} resample methods",
            rasters.len(),
            methods.len()
        )));
    }
    let bb = stack_bounding_box(rasters, mode)?;
    let (gt, width, height) = target_grid(&bb, pixel_size);

    rasters
        .par_iter()
        .zip(methods.par_iter())
        .map(|(r, &method)| {
            let on_grid = r.width == width && r.height == height && {
                let target = Raster::new(width, height, gt, 0.0);
                r.same_grid(&target)
            };
            let proj_ok = projection.is_none() || projection == r.projection;
            if on_grid && proj_ok {
                return Ok(r.clone());
            }
            warp_raster(
                r,
                &WarpOptions {
                    pixel_size,
                    bounding_box: Some(bb),
                    projection,
                    method,
                },
            )
        })
        .collect()
}

/// Path-level stack alignment: read every base raster, align, write targets.
pub fn align_raster_paths(
    base_paths: &[&Path],
    target_paths: &[&Path],
    methods: &[ResampleMethod],
    pixel_size: (f64, f64),
    mode: BoundingBoxMode,
    projection: Option<Projection>,
) -> Result<()> {
    if base_paths.len() != target_paths.len() {
        return Err(EcocalcError::InvalidArgument("base and target path lists differ in length".into()));
    }
    info!(count = base_paths.len(), "aligning raster stack");
    let rasters = base_paths
        .iter()
        .map(|p| read_raster(p))
        .collect::<Result<Vec<_>>>()?;
    let aligned = align_and_resize_raster_stack(&rasters, methods, pixel_size, mode, projection)?;
    for (raster, path) in aligned.iter().zip(target_paths) {
        write_raster(path, raster)?;
    }
    Ok(())
}

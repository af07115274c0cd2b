//! Per-polygon statistics over a raster.
//!
//! Polygons are read from GeoJSON and must already be in the raster's
//! coordinate system. A pixel belongs to a polygon when its centre is inside
//! it under the even-odd rule, so holes are excluded.
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use geojson::{GeoJson, Value};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::coords::BoundingBox;
use crate::error::Result;
use crate::raster::{DataType, Raster};

// ── Vector layer ──────────────────────────────────────────────────────────────

type Ring = Vec<(f64, f64)>;

#[derive(Debug, Clone)]
pub struct Feature {
    pub fid: i64,
    /// Each polygon is an exterior ring followed by its holes.
    pub polygons: Vec<Vec<Ring>>,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl Feature {
    pub fn bounding_box(&self) -> BoundingBox {
        let mut bb = BoundingBox::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in self.polygons.iter().flatten().flatten() {
            bb.xmin = bb.xmin.min(*x);
            bb.ymin = bb.ymin.min(*y);
            bb.xmax = bb.xmax.max(*x);
            bb.ymax = bb.ymax.max(*y);
        }
        bb
    }

    /// Even-odd containment, tested against each polygon separately.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.polygons.iter().any(|rings| {
            rings.iter().fold(false, |inside, ring| inside ^ ring_crosses(ring, x, y))
        })
    }

    /// Property value rendered for a CSV cell.
    pub fn field(&self, name: &str) -> String {
        match self.properties.get(name) {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

/// True when a ray cast from `(x, y)` crosses `ring` an odd number of times.
fn ring_crosses(ring: &Ring, x: f64, y: f64) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn to_ring(positions: &[Vec<f64>]) -> Ring {
    positions.iter().filter(|p| p.len() >= 2).map(|p| (p[0], p[1])).collect()
}

#[derive(Debug, Clone, Default)]
pub struct VectorLayer {
    pub features: Vec<Feature>,
}

impl VectorLayer {
    pub fn from_geojson(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let gj: GeoJson = text.parse()?;
        let features = match gj {
            GeoJson::FeatureCollection(fc) => fc.features,
            GeoJson::Feature(f) => vec![f],
            GeoJson::Geometry(g) => vec![geojson::Feature {
                bbox: None,
                geometry: Some(g),
                id: None,
                properties: None,
                foreign_members: None,
            }],
        };

        let mut out = Vec::with_capacity(features.len());
        for (index, f) in features.into_iter().enumerate() {
            let fid = match &f.id {
                Some(geojson::feature::Id::Number(n)) => n.as_i64().unwrap_or(index as i64),
                _ => index as i64,
            };
            let polygons = match f.geometry.as_ref().map(|g| &g.value) {
                Some(Value::Polygon(rings)) => vec![rings.iter().map(|r| to_ring(r)).collect()],
                Some(Value::MultiPolygon(polys)) => polys
                    .iter()
                    .map(|rings| rings.iter().map(|r| to_ring(r)).collect())
                    .collect(),
                _ => {
                    warn!(fid, "feature has no polygon geometry, skipping");
                    continue;
                }
            };
            out.push(Feature { fid, polygons, properties: f.properties.unwrap_or_default() });
        }
        debug!(features = out.len(), path = %path.display(), "loaded vector layer");
        Ok(Self { features: out })
    }
}

// ── Statistics ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZonalStats {
    pub count: u64,
    pub max: Option<f64>,
    pub min: Option<f64>,
    pub nodata_count: u64,
    pub sum: f64,
}

impl Default for ZonalStats {
    fn default() -> Self {
        Self { count: 0, max: None, min: None, nodata_count: 0, sum: 0.0 }
    }
}

impl ZonalStats {
    pub fn mean(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            f64::NAN
        }
    }

    fn add(&mut self, raster: &Raster, v: f64) {
        if raster.is_nodata(v) {
            self.nodata_count += 1;
            return;
        }
        self.count += 1;
        self.sum += v;
        self.max = Some(self.max.map_or(v, |m| m.max(v)));
        self.min = Some(self.min.map_or(v, |m| m.min(v)));
    }

    fn merge(&mut self, other: &ZonalStats) {
        self.count += other.count;
        self.nodata_count += other.nodata_count;
        self.sum += other.sum;
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

/// How features relate to each other on the raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapMode {
    /// Burn all features into one label grid; later features win shared pixels.
    Disjoint,
    /// Every feature collects its own pixels.
    Overlapping,
}

/// Row/column window of the raster covered by `bb`, clamped to the grid.
fn pixel_window(raster: &Raster, bb: &BoundingBox) -> Option<(usize, usize, usize, usize)> {
    let gt = &raster.geotransform;
    let (ca, ra) = gt.pixel_of(bb.xmin, bb.ymax);
    let (cb, rb) = gt.pixel_of(bb.xmax, bb.ymin);
    let c0 = ca.min(cb).floor().max(0.0) as usize;
    let r0 = ra.min(rb).floor().max(0.0) as usize;
    let c1 = ((ca.max(cb).ceil().max(0.0)) as usize).min(raster.width);
    let r1 = ((ra.max(rb).ceil().max(0.0)) as usize).min(raster.height);
    (c0 < c1 && r0 < r1).then_some((r0, r1, c0, c1))
}

/// Pixels whose centre lies inside the feature.
fn covered_pixels(raster: &Raster, feature: &Feature) -> Vec<usize> {
    let Some((r0, r1, c0, c1)) = pixel_window(raster, &feature.bounding_box()) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for r in r0..r1 {
        for c in c0..c1 {
            let (x, y) = raster.geotransform.pixel_center(r, c);
            if feature.contains(x, y) {
                out.push(r * raster.width + c);
            }
        }
    }
    out
}

/// Stats over every pixel touching the feature's bounding box. Used for
/// features too small to contain any pixel centre.
fn bounding_box_stats(raster: &Raster, feature: &Feature) -> ZonalStats {
    let mut stats = ZonalStats::default();
    if let Some((r0, r1, c0, c1)) = pixel_window(raster, &feature.bounding_box()) {
        for r in r0..r1 {
            for c in c0..c1 {
                stats.add(raster, raster.get(r, c));
            }
        }
    }
    stats
}

/// Feature index per pixel, later features overwriting earlier ones.
fn burn_labels(raster: &Raster, layer: &VectorLayer) -> Vec<Option<usize>> {
    let mut labels = vec![None; raster.width * raster.height];
    for (idx, feature) in layer.features.iter().enumerate() {
        for p in covered_pixels(raster, feature) {
            labels[p] = Some(idx);
        }
    }
    labels
}

/// The label grid as a raster of feature ids, nodata -1.
pub fn label_raster(raster: &Raster, layer: &VectorLayer) -> Raster {
    let data = burn_labels(raster, layer)
        .into_iter()
        .map(|l| l.map_or(-1.0, |i| layer.features[i].fid as f64))
        .collect();
    Raster::from_info(&raster.info(), -1.0)
        .with_data(data)
        .with_nodata(Some(-1.0))
        .with_datatype(DataType::I32)
}

/// Statistics per feature id. Every feature in `layer` has an entry.
pub fn zonal_statistics(raster: &Raster, layer: &VectorLayer, mode: OverlapMode) -> BTreeMap<i64, ZonalStats> {
    info!(features = layer.features.len(), ?mode, "zonal statistics");
    let per_feature: Vec<ZonalStats> = match mode {
        OverlapMode::Overlapping => layer
            .features
            .par_iter()
            .map(|f| {
                let pixels = covered_pixels(raster, f);
                if pixels.is_empty() {
                    return bounding_box_stats(raster, f);
                }
                let mut s = ZonalStats::default();
                for p in pixels {
                    s.add(raster, raster.data[p]);
                }
                s
            })
            .collect(),
        OverlapMode::Disjoint => {
            let labels = burn_labels(raster, layer);
            let mut stats = vec![ZonalStats::default(); layer.features.len()];
            let mut hit = vec![false; layer.features.len()];
            for (p, label) in labels.iter().enumerate() {
                if let Some(idx) = *label {
                    hit[idx] = true;
                    stats[idx].add(raster, raster.data[p]);
                }
            }
            for (idx, f) in layer.features.iter().enumerate() {
                if !hit[idx] {
                    debug!(fid = f.fid, "no pixel centres in feature, using bounding box");
                    stats[idx] = bounding_box_stats(raster, f);
                }
            }
            stats
        }
    };

    let mut out: BTreeMap<i64, ZonalStats> = BTreeMap::new();
    for (f, s) in layer.features.iter().zip(per_feature) {
        out.entry(f.fid).or_default().merge(&s);
    }
    out
}

// ── CSV output ────────────────────────────────────────────────────────────────

fn opt_cell(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}

/// Write the stats table: raster path, vector path, header, one row per feature.
pub fn write_stats_csv<W: Write>(
    writer: W,
    raster_path: &str,
    vector_path: &str,
    field_name: Option<&str>,
    stats: &BTreeMap<i64, ZonalStats>,
    layer: &VectorLayer,
) -> Result<()> {
    let mut w = csv::WriterBuilder::new().flexible(true).from_writer(writer);
    w.write_record([raster_path])?;
    w.write_record([vector_path])?;

    let mut header = vec!["fid".to_string()];
    if let Some(field) = field_name {
        header.push(field.to_string());
    }
    header.extend(["count", "max", "min", "nodata_count", "sum", "mean"].map(String::from));
    w.write_record(&header)?;

    for (fid, s) in stats {
        let mut row = vec![fid.to_string()];
        if let Some(field) = field_name {
            let value = layer
                .features
                .iter()
                .find(|f| f.fid == *fid)
                .map(|f| f.field(field))
                .unwrap_or_default();
            row.push(value);
        }
        row.push(s.count.to_string());
        row.push(opt_cell(s.max));
        row.push(opt_cell(s.min));
        row.push(s.nodata_count.to_string());
        row.push(s.sum.to_string());
        let mean = s.mean();
        row.push(if mean.is_nan() { "NaN".into() } else { mean.to_string() });
        w.write_record(&row)?;
    }
    w.flush()?;
    Ok(())
}

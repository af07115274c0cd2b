/// Grid geometry: affine transforms, bounding boxes, projections and the
/// per-latitude pixel area used for density conversion.
/// All coordinate math uses f64.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EcocalcError;

// ── WGS84 ellipsoid ───────────────────────────────────────────────────────────

const WGS84_A: f64 = 6_378_137.0;
const WGS84_B: f64 = 6_356_752.3142;

// ── Projection ────────────────────────────────────────────────────────────────

/// Coordinate reference system, identified by EPSG code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Projection {
    Epsg(u32),
}

impl Projection {
    pub const WGS84: Projection = Projection::Epsg(4326);

    pub fn epsg(self) -> u32 {
        match self {
            Projection::Epsg(code) => code,
        }
    }

    /// Geographic (lat/lon) systems live in the EPSG 4000–4999 range.
    pub fn is_geographic(self) -> bool {
        (4000..5000).contains(&self.epsg())
    }
}

/// Projection of a layer, assuming WGS84 with a warning when it is undefined.
pub fn projection_or_wgs84(projection: Option<Projection>, layer: &str) -> Projection {
    projection.unwrap_or_else(|| {
        warn!("{layer} has undefined projection, assuming WGS84");
        Projection::WGS84
    })
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

impl FromStr for Projection {
    type Err = EcocalcError;

    /// Accepts `EPSG:4326`, `epsg:4326`, a bare `4326`, or OGC WKT carrying
    /// an EPSG authority on its root node.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if is_wkt(trimmed) {
            return wkt_epsg(trimmed).map(Projection::Epsg).ok_or_else(|| {
                EcocalcError::InvalidArgument(format!("WKT has no EPSG authority: '{s}'"))
            });
        }
        let code = match trimmed.split_once(':') {
            Some((auth, code)) if auth.eq_ignore_ascii_case("epsg") => code,
            Some(_) => {
                return Err(EcocalcError::InvalidArgument(format!(
                    "unsupported projection '{s}', expected EPSG:<code>"
                )))
            }
            None => trimmed,
        };
        code.trim()
            .parse::<u32>()
            .map(Projection::Epsg)
            .map_err(|_| EcocalcError::InvalidArgument(format!("invalid EPSG code in '{s}'")))
    }
}

fn starts_with_ignore_case(bytes: &[u8], prefix: &str) -> bool {
    bytes.len() >= prefix.len() && bytes[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn is_wkt(s: &str) -> bool {
    ["GEOGCS[", "PROJCS[", "GEOGCS(", "PROJCS("]
        .iter()
        .any(|head| starts_with_ignore_case(s.as_bytes(), head))
}

/// EPSG code of the last `AUTHORITY["EPSG","<n>"]` directly under the root
/// node. Nested authorities (datum, spheroid, base GEOGCS) are ignored.
fn wkt_epsg(wkt: &str) -> Option<u32> {
    const KEY: &str = "AUTHORITY";
    let bytes = wkt.as_bytes();
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut found = None;
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => in_quote = !in_quote,
            _ if in_quote => {}
            b'[' | b'(' => depth += 1,
            b']' | b')' => depth = depth.saturating_sub(1),
            _ if depth == 1 && starts_with_ignore_case(&bytes[i..], KEY) => found = Some(i + KEY.len()),
            _ => {}
        }
    }
    let rest = wkt[found?..].trim_start().strip_prefix(['[', '('])?;
    let body = &rest[..rest.find([']', ')'])?];
    let mut parts = body.split(',').map(|p| p.trim().trim_matches('"'));
    let authority = parts.next()?;
    if !authority.eq_ignore_ascii_case("EPSG") {
        return None;
    }
    parts.next()?.parse().ok()
}

impl TryFrom<String> for Projection {
    type Error = EcocalcError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Projection> for String {
    fn from(p: Projection) -> Self {
        p.to_string()
    }
}

// ── Bounding box ──────────────────────────────────────────────────────────────

/// Axis-aligned extent in projection units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl BoundingBox {
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self { xmin, ymin, xmax, ymax }
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    pub fn is_empty(&self) -> bool {
        self.width() <= 0.0 || self.height() <= 0.0
    }

    pub fn intersection(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            xmin: self.xmin.max(other.xmin),
            ymin: self.ymin.max(other.ymin),
            xmax: self.xmax.min(other.xmax),
            ymax: self.ymax.min(other.ymax),
        }
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            xmin: self.xmin.min(other.xmin),
            ymin: self.ymin.min(other.ymin),
            xmax: self.xmax.max(other.xmax),
            ymax: self.ymax.max(other.ymax),
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.xmin && x <= self.xmax && y >= self.ymin && y <= self.ymax
    }
}

// ── Geotransform ──────────────────────────────────────────────────────────────

/// North-up affine transform. `pixel_height` is negative for rasters stored
/// north to south, which is what every writer in this crate produces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub origin_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, pixel_width: f64, origin_y: f64, pixel_height: f64) -> Self {
        Self { origin_x, pixel_width, origin_y, pixel_height }
    }

    /// Transform whose origin is the top-left corner of `bb`.
    pub fn from_bounding_box(bb: &BoundingBox, pixel_width: f64, pixel_height: f64) -> Self {
        let origin_y = if pixel_height < 0.0 { bb.ymax } else { bb.ymin };
        Self::new(bb.xmin, pixel_width, origin_y, pixel_height)
    }

    pub fn bounding_box(&self, width: usize, height: usize) -> BoundingBox {
        let x1 = self.origin_x + self.pixel_width * width as f64;
        let y1 = self.origin_y + self.pixel_height * height as f64;
        BoundingBox {
            xmin: self.origin_x.min(x1),
            ymin: self.origin_y.min(y1),
            xmax: self.origin_x.max(x1),
            ymax: self.origin_y.max(y1),
        }
    }

    /// Projected coordinates of the centre of cell `(row, col)`.
    #[inline]
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.pixel_width,
            self.origin_y + (row as f64 + 0.5) * self.pixel_height,
        )
    }

    /// Fractional `(col, row)` of a projected point.
    #[inline]
    pub fn pixel_of(&self, x: f64, y: f64) -> (f64, f64) {
        ((x - self.origin_x) / self.pixel_width, (y - self.origin_y) / self.pixel_height)
    }
}

// ── Pixel area ────────────────────────────────────────────────────────────────

/// Authalic area (m²) of the WGS84 ellipsoid between the equator and latitude `lat_deg`,
/// scaled to a full 360° band.
fn zone_area(lat_deg: f64) -> f64 {
    let e = (1.0 - (WGS84_B / WGS84_A).powi(2)).sqrt();
    let sin_phi = lat_deg.to_radians().sin();
    let zm = 1.0 - e * sin_phi;
    let zp = 1.0 + e * sin_phi;
    std::f64::consts::PI * WGS84_B * WGS84_B * ((zp / zm).ln() / (2.0 * e) + sin_phi / (zp * zm))
}

/// Area in m² of a geographic pixel centred at `center_lat` with the given extents in degrees.
pub fn area_of_pixel(center_lat: f64, pixel_width_deg: f64, pixel_height_deg: f64) -> f64 {
    let half = pixel_height_deg.abs() / 2.0;
    let upper = zone_area(center_lat + half);
    let lower = zone_area(center_lat - half);
    (pixel_width_deg.abs() / 360.0 * (upper - lower)).abs()
}

/// Per-row pixel area in m² for a geographic raster whose top edge is at `lat_max`.
/// Element 0 is the northernmost row.
pub fn latitude_m2_area_column(
    lat_max: f64,
    pixel_height_deg: f64,
    pixel_width_deg: f64,
    n_rows: usize,
) -> Vec<f64> {
    let step = pixel_height_deg.abs();
    (0..n_rows)
        .map(|row| {
            let center_lat = lat_max - (row as f64 + 0.5) * step;
            area_of_pixel(center_lat, pixel_width_deg, step)
        })
        .collect()
}

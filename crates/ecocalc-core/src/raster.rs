use serde::{Deserialize, Serialize};

use crate::coords::{BoundingBox, GeoTransform, Projection};

/// On-disk storage type of a raster band. All computation happens in f64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U8,
    U16,
    I16,
    U32,
    I32,
    #[default]
    F32,
    F64,
}

impl DataType {
    pub fn is_integer(self) -> bool {
        !matches!(self, DataType::F32 | DataType::F64)
    }

    /// Clamp and round `v` to the representable range of this type.
    pub fn cast(self, v: f64) -> f64 {
        let (lo, hi) = match self {
            DataType::U8 => (u8::MIN as f64, u8::MAX as f64),
            DataType::U16 => (u16::MIN as f64, u16::MAX as f64),
            DataType::I16 => (i16::MIN as f64, i16::MAX as f64),
            DataType::U32 => (u32::MIN as f64, u32::MAX as f64),
            DataType::I32 => (i32::MIN as f64, i32::MAX as f64),
            DataType::F32 => return v as f32 as f64,
            DataType::F64 => return v,
        };
        v.round().clamp(lo, hi)
    }
}

/// numpy.isclose with default tolerances.
#[inline]
pub fn isclose(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    (a - b).abs() <= 1e-8 + 1e-5 * b.abs()
}

/// Everything about a raster except its pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterInfo {
    pub width: usize,
    pub height: usize,
    pub geotransform: GeoTransform,
    pub nodata: Option<f64>,
    pub datatype: DataType,
    pub projection: Option<Projection>,
}

impl RasterInfo {
    pub fn pixel_size(&self) -> (f64, f64) {
        (self.geotransform.pixel_width, self.geotransform.pixel_height)
    }

    pub fn bounding_box(&self) -> BoundingBox {
        self.geotransform.bounding_box(self.width, self.height)
    }
}

/// A single-band raster held in memory, row-major, row 0 = north.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub data: Vec<f64>,
    pub width: usize,
    pub height: usize,
    pub geotransform: GeoTransform,
    pub nodata: Option<f64>,
    pub datatype: DataType,
    pub projection: Option<Projection>,
}

impl Raster {
    /// Create a raster filled with `fill`.
    pub fn new(width: usize, height: usize, geotransform: GeoTransform, fill: f64) -> Self {
        Self {
            data: vec![fill; width * height],
            width,
            height,
            geotransform,
            nodata: None,
            datatype: DataType::F32,
            projection: None,
        }
    }

    /// Create a raster with the same grid and metadata as `info`, filled with `fill`.
    pub fn from_info(info: &RasterInfo, fill: f64) -> Self {
        Self {
            data: vec![fill; info.width * info.height],
            width: info.width,
            height: info.height,
            geotransform: info.geotransform,
            nodata: info.nodata,
            datatype: info.datatype,
            projection: info.projection,
        }
    }

    /// Replace the pixel buffer. `data.len()` must equal `width * height`.
    pub fn with_data(mut self, data: Vec<f64>) -> Self {
        debug_assert_eq!(data.len(), self.width * self.height);
        self.data = data;
        self
    }

    pub fn with_nodata(mut self, nodata: Option<f64>) -> Self {
        self.nodata = nodata;
        self
    }

    pub fn with_datatype(mut self, datatype: DataType) -> Self {
        self.datatype = datatype;
        self
    }

    pub fn with_projection(mut self, projection: Option<Projection>) -> Self {
        self.projection = projection;
        self
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.width + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f64) {
        self.data[row * self.width + col] = val;
    }

    pub fn info(&self) -> RasterInfo {
        RasterInfo {
            width: self.width,
            height: self.height,
            geotransform: self.geotransform,
            nodata: self.nodata,
            datatype: self.datatype,
            projection: self.projection,
        }
    }

    pub fn pixel_size(&self) -> (f64, f64) {
        (self.geotransform.pixel_width, self.geotransform.pixel_height)
    }

    pub fn bounding_box(&self) -> BoundingBox {
        self.geotransform.bounding_box(self.width, self.height)
    }

    /// NaN is always nodata; otherwise compare against the nodata value with isclose.
    #[inline]
    pub fn is_nodata(&self, v: f64) -> bool {
        v.is_nan() || self.nodata.is_some_and(|nd| isclose(v, nd))
    }

    /// Iterate over the values that are not nodata.
    pub fn valid_values(&self) -> impl Iterator<Item = f64> + '_ {
        self.data.iter().copied().filter(move |&v| !self.is_nodata(v))
    }

    pub fn valid_count(&self) -> usize {
        self.valid_values().count()
    }

    /// The value used to fill cells that carry no data.
    pub fn fill_value(&self) -> f64 {
        self.nodata.unwrap_or(f64::NAN)
    }

    /// True when both rasters have the same size and geotransform.
    pub fn same_grid(&self, other: &Raster) -> bool {
        self.width == other.width
            && self.height == other.height
            && isclose(self.geotransform.origin_x, other.geotransform.origin_x)
            && isclose(self.geotransform.origin_y, other.geotransform.origin_y)
            && isclose(self.geotransform.pixel_width, other.geotransform.pixel_width)
            && isclose(self.geotransform.pixel_height, other.geotransform.pixel_height)
    }

    pub fn min_value(&self) -> Option<f64> {
        self.valid_values().reduce(f64::min)
    }

    pub fn max_value(&self) -> Option<f64> {
        self.valid_values().reduce(f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> GeoTransform {
        GeoTransform::new(0.0, 1.0, 4.0, -1.0)
    }

    #[test]
    fn nodata_uses_isclose_and_nan() {
        let r = Raster::new(2, 2, grid(), 0.0).with_nodata(Some(-9999.0));
        assert!(r.is_nodata(-9999.0));
        assert!(r.is_nodata(-9999.00001));
        assert!(r.is_nodata(f64::NAN));
        assert!(!r.is_nodata(-9998.0));
    }

    #[test]
    fn nan_is_nodata_without_nodata_value() {
        let r = Raster::new(2, 2, grid(), 0.0);
        assert!(r.is_nodata(f64::NAN));
        assert!(!r.is_nodata(0.0));
    }

    #[test]
    fn valid_values_skip_nodata() {
        let mut r = Raster::new(3, 1, grid(), 1.0).with_nodata(Some(-1.0));
        r.set(0, 1, -1.0);
        assert_eq!(r.valid_count(), 2);
        assert_eq!(r.min_value(), Some(1.0));
        assert_eq!(r.max_value(), Some(1.0));
    }

    #[test]
    fn integer_cast_rounds_and_clamps() {
        assert_eq!(DataType::U8.cast(300.0), 255.0);
        assert_eq!(DataType::U8.cast(-3.0), 0.0);
        assert_eq!(DataType::I16.cast(12.6), 13.0);
        assert_eq!(DataType::F64.cast(0.1), 0.1);
    }

    #[test]
    fn same_grid_detects_shift() {
        let a = Raster::new(4, 4, grid(), 0.0);
        let mut b = a.clone();
        assert!(a.same_grid(&b));
        b.geotransform.origin_x = 0.5;
        assert!(!a.same_grid(&b));
    }
}

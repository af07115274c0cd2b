//! Single-band GeoTIFF reading and writing on top of the `tiff` crate.
//!
//! Georeferencing is carried by ModelPixelScale + ModelTiepoint (or
//! ModelTransformation when present), the EPSG code lives in the
//! GeoKeyDirectory, and nodata in the GDAL_NODATA ASCII tag.
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder, TiffValue};
use tiff::tags::Tag;
use tiff::ColorType;
use tracing::debug;

use crate::coords::{GeoTransform, Projection};
use crate::error::{EcocalcError, Result};
use crate::raster::{DataType, Raster, RasterInfo};

// ── GeoKey ids ────────────────────────────────────────────────────────────────

const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const GEOGRAPHIC_TYPE: u16 = 2048;
const PROJECTED_CS_TYPE: u16 = 3072;

const MODEL_TYPE_PROJECTED: u16 = 1;
const MODEL_TYPE_GEOGRAPHIC: u16 = 2;
const RASTER_PIXEL_IS_AREA: u16 = 1;
const RASTER_PIXEL_IS_POINT: u16 = 2;

// ── Reading ───────────────────────────────────────────────────────────────────

fn open_decoder(path: &Path) -> Result<Decoder<BufReader<File>>> {
    let file = File::open(path)?;
    Ok(Decoder::new(BufReader::new(file))?.with_limits(Limits::unlimited()))
}

/// Storage type from the decoder's colour type and SampleFormat tag.
fn datatype_of<R: Read + Seek>(decoder: &mut Decoder<R>, path: &Path) -> Result<DataType> {
    let bits = match decoder.colortype()? {
        ColorType::Gray(bits) => bits,
        _ => return Err(EcocalcError::UnsupportedPixelType(path.display().to_string())),
    };
    // SampleFormat: 1 = unsigned, 2 = signed, 3 = float. Absent means unsigned.
    let format = decoder
        .find_tag(Tag::SampleFormat)?
        .map(|v| v.into_u32_vec())
        .transpose()?
        .and_then(|v| v.first().copied())
        .unwrap_or(1);
    let dt = match (format, bits) {
        (1, 8) => DataType::U8,
        (1, 16) => DataType::U16,
        (1, 32) => DataType::U32,
        (2, 8) | (2, 16) => DataType::I16,
        (2, 32) => DataType::I32,
        (3, 32) => DataType::F32,
        (3, 64) | (1, 64) | (2, 64) => DataType::F64,
        _ => return Err(EcocalcError::UnsupportedPixelType(path.display().to_string())),
    };
    Ok(dt)
}

fn read_geotransform<R: Read + Seek>(decoder: &mut Decoder<R>, pixel_is_point: bool) -> Result<GeoTransform> {
    if let Some(m) = decoder
        .find_tag(Tag::ModelTransformationTag)?
        .map(|v| v.into_f64_vec())
        .transpose()?
    {
        if m.len() >= 8 {
            return Ok(GeoTransform::new(m[3], m[0], m[7], m[5]));
        }
    }

    let scale = decoder
        .find_tag(Tag::ModelPixelScaleTag)?
        .map(|v| v.into_f64_vec())
        .transpose()?;
    let tiepoint = decoder
        .find_tag(Tag::ModelTiepointTag)?
        .map(|v| v.into_f64_vec())
        .transpose()?;

    let gt = match (scale, tiepoint) {
        (Some(s), Some(t)) if s.len() >= 2 && t.len() >= 6 => {
            // Tiepoint maps raster (i, j) to model (x, y).
            let (i, j, x, y) = (t[0], t[1], t[3], t[4]);
            GeoTransform::new(x - i * s[0], s[0], y + j * s[1], -s[1])
        }
        // Ungeoreferenced TIFF: unit pixels anchored at the origin.
        _ => GeoTransform::new(0.0, 1.0, 0.0, -1.0),
    };

    if pixel_is_point {
        Ok(GeoTransform::new(
            gt.origin_x - gt.pixel_width / 2.0,
            gt.pixel_width,
            gt.origin_y - gt.pixel_height / 2.0,
            gt.pixel_height,
        ))
    } else {
        Ok(gt)
    }
}

/// Parse the GeoKeyDirectory into `(key id, value)` pairs for keys stored inline.
fn read_geokeys<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Vec<(u16, u32)>> {
    let Some(dir) = decoder
        .find_tag(Tag::GeoKeyDirectoryTag)?
        .map(|v| v.into_u32_vec())
        .transpose()?
    else {
        return Ok(Vec::new());
    };
    if dir.len() < 4 {
        return Ok(Vec::new());
    }
    let n_keys = dir[3] as usize;
    let keys = dir[4..]
        .chunks_exact(4)
        .take(n_keys)
        // Location 0 means the value is stored in the entry itself.
        .filter(|entry| entry[1] == 0)
        .map(|entry| (entry[0] as u16, entry[3]))
        .collect();
    Ok(keys)
}

fn projection_from_keys(keys: &[(u16, u32)]) -> Option<Projection> {
    let lookup = |id: u16| keys.iter().find(|(k, _)| *k == id).map(|(_, v)| *v);
    // 32767 is the GeoTIFF "user defined" marker, which carries no EPSG code.
    lookup(PROJECTED_CS_TYPE)
        .filter(|&code| code != 0 && code != 32767)
        .or_else(|| lookup(GEOGRAPHIC_TYPE).filter(|&code| code != 0 && code != 32767))
        .map(Projection::Epsg)
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<f64>> {
    let text = decoder
        .find_tag(Tag::GdalNodata)?
        .map(|v| v.into_string())
        .transpose()?;
    Ok(text.and_then(|s| {
        let trimmed = s.trim_matches(char::from(0)).trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "nan" | "-nan" => Some(f64::NAN),
            _ => trimmed.parse::<f64>().ok(),
        }
    }))
}

fn read_header<R: Read + Seek>(decoder: &mut Decoder<R>, path: &Path) -> Result<RasterInfo> {
    let (width, height) = decoder.dimensions()?;
    let datatype = datatype_of(decoder, path)?;
    let keys = read_geokeys(decoder)?;
    let pixel_is_point = keys
        .iter()
        .any(|&(k, v)| k == GT_RASTER_TYPE && v == RASTER_PIXEL_IS_POINT as u32);
    let geotransform = read_geotransform(decoder, pixel_is_point)?;
    let nodata = read_nodata(decoder)?;
    Ok(RasterInfo {
        width: width as usize,
        height: height as usize,
        geotransform,
        nodata,
        datatype,
        projection: projection_from_keys(&keys),
    })
}

/// Read raster metadata without decoding pixels.
pub fn read_info(path: &Path) -> Result<RasterInfo> {
    let mut decoder = open_decoder(path)?;
    read_header(&mut decoder, path)
}

/// Read band 1 of a GeoTIFF into memory as f64.
pub fn read_raster(path: &Path) -> Result<Raster> {
    let mut decoder = open_decoder(path)?;
    let info = read_header(&mut decoder, path)?;

    let data: Vec<f64> = match decoder.read_image()? {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f64).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
        #[allow(unreachable_patterns)]
        _ => return Err(EcocalcError::UnsupportedPixelType(path.display().to_string())),
    };

    if data.len() != info.width * info.height {
        return Err(EcocalcError::UnsupportedPixelType(format!(
            "{} (expected {} samples, decoded {})",
            path.display(),
            info.width * info.height,
            data.len()
        )));
    }

    debug!(path = %path.display(), width = info.width, height = info.height, "read raster");
    Ok(Raster::from_info(&info, 0.0).with_data(data))
}

// ── Writing ───────────────────────────────────────────────────────────────────

struct GeoTags {
    pixel_scale: [f64; 3],
    tiepoint: [f64; 6],
    geokeys: Vec<u16>,
    nodata: Option<String>,
}

impl GeoTags {
    fn for_raster(raster: &Raster) -> Self {
        let gt = raster.geotransform;
        let mut keys: Vec<[u16; 4]> = vec![[GT_RASTER_TYPE, 0, 1, RASTER_PIXEL_IS_AREA]];
        if let Some(p) = raster.projection {
            // EPSG codes that do not fit in a short cannot be expressed as GeoKeys.
            if let Ok(code) = u16::try_from(p.epsg()) {
                if p.is_geographic() {
                    keys.insert(0, [GT_MODEL_TYPE, 0, 1, MODEL_TYPE_GEOGRAPHIC]);
                    keys.push([GEOGRAPHIC_TYPE, 0, 1, code]);
                } else {
                    keys.insert(0, [GT_MODEL_TYPE, 0, 1, MODEL_TYPE_PROJECTED]);
                    keys.push([PROJECTED_CS_TYPE, 0, 1, code]);
                }
            }
        }
        let mut geokeys = vec![1, 1, 0, keys.len() as u16];
        geokeys.extend(keys.into_iter().flatten());

        Self {
            pixel_scale: [gt.pixel_width.abs(), gt.pixel_height.abs(), 0.0],
            tiepoint: [0.0, 0.0, 0.0, gt.origin_x, gt.origin_y, 0.0],
            geokeys,
            nodata: raster.nodata.map(format_nodata),
        }
    }
}

fn format_nodata(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

fn write_band<C, W>(
    encoder: &mut TiffEncoder<W>,
    width: u32,
    height: u32,
    tags: &GeoTags,
    data: &[C::Inner],
) -> Result<()>
where
    C: colortype::ColorType,
    [C::Inner]: TiffValue,
    W: Write + Seek,
{
    let mut image = encoder.new_image::<C>(width, height)?;
    let dir = image.encoder();
    dir.write_tag(Tag::ModelPixelScaleTag, &tags.pixel_scale[..])?;
    dir.write_tag(Tag::ModelTiepointTag, &tags.tiepoint[..])?;
    dir.write_tag(Tag::GeoKeyDirectoryTag, &tags.geokeys[..])?;
    if let Some(nodata) = &tags.nodata {
        dir.write_tag(Tag::GdalNodata, nodata.as_str())?;
    }
    image.write_data(data)?;
    Ok(())
}

/// Samples cast to the raster's storage type. NaN cells in integer rasters
/// become the nodata value (or 0 when there is none).
fn storage_values(raster: &Raster) -> impl Iterator<Item = f64> + '_ {
    let dt = raster.datatype;
    let fill = raster.nodata.filter(|v| !v.is_nan()).unwrap_or(0.0);
    raster.data.iter().map(move |&v| {
        if dt.is_integer() && v.is_nan() {
            dt.cast(fill)
        } else {
            dt.cast(v)
        }
    })
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// Write `raster` as a single-band GeoTIFF. The file is assembled next to the
/// target and renamed into place, so `path` never holds a partial raster.
pub fn write_raster(path: &Path, raster: &Raster) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = part_path(path);
    let tags = GeoTags::for_raster(raster);
    let (w, h) = (raster.width as u32, raster.height as u32);

    {
        let file = File::create(&tmp)?;
        let mut encoder = TiffEncoder::new(BufWriter::new(file))?;
        let values = storage_values(raster);
        match raster.datatype {
            DataType::U8 => {
                let buf: Vec<u8> = values.map(|v| v as u8).collect();
                write_band::<colortype::Gray8, _>(&mut encoder, w, h, &tags, &buf)?
            }
            DataType::U16 => {
                let buf: Vec<u16> = values.map(|v| v as u16).collect();
                write_band::<colortype::Gray16, _>(&mut encoder, w, h, &tags, &buf)?
            }
            DataType::I16 => {
                let buf: Vec<i16> = values.map(|v| v as i16).collect();
                write_band::<colortype::GrayI16, _>(&mut encoder, w, h, &tags, &buf)?
            }
            DataType::U32 => {
                let buf: Vec<u32> = values.map(|v| v as u32).collect();
                write_band::<colortype::Gray32, _>(&mut encoder, w, h, &tags, &buf)?
            }
            DataType::I32 => {
                let buf: Vec<i32> = values.map(|v| v as i32).collect();
                write_band::<colortype::GrayI32, _>(&mut encoder, w, h, &tags, &buf)?
            }
            DataType::F32 => {
                let buf: Vec<f32> = values.map(|v| v as f32).collect();
                write_band::<colortype::Gray32Float, _>(&mut encoder, w, h, &tags, &buf)?
            }
            DataType::F64 => {
                let buf: Vec<f64> = values.collect();
                write_band::<colortype::Gray64Float, _>(&mut encoder, w, h, &tags, &buf)?
            }
        }
    }

    fs::rename(&tmp, path)?;
    debug!(path = %path.display(), datatype = ?raster.datatype, "wrote raster");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample(datatype: DataType) -> Raster {
        let gt = GeoTransform::new(-120.0, 0.25, 45.0, -0.25);
        let mut r = Raster::new(4, 3, gt, 0.0)
            .with_nodata(Some(-9999.0))
            .with_datatype(datatype)
            .with_projection(Some(Projection::WGS84));
        for row in 0..3 {
            for col in 0..4 {
                r.set(row, col, (row * 4 + col) as f64 * 1.5);
            }
        }
        r.set(1, 2, -9999.0);
        r
    }

    #[test]
    fn float_raster_survives_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.tif");
        let r = sample(DataType::F32);
        write_raster(&path, &r).unwrap();

        let back = read_raster(&path).unwrap();
        assert_eq!(back.width, 4);
        assert_eq!(back.height, 3);
        assert_eq!(back.datatype, DataType::F32);
        assert_eq!(back.projection, Some(Projection::WGS84));
        assert_eq!(back.nodata, Some(-9999.0));
        assert_relative_eq!(back.geotransform.origin_x, -120.0);
        assert_relative_eq!(back.geotransform.origin_y, 45.0);
        assert_relative_eq!(back.geotransform.pixel_height, -0.25);
        assert_eq!(back.data, r.data);
        assert!(!path.with_file_name("sample.tif.part").exists());
    }

    #[test]
    fn integer_raster_rounds_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codes.tif");
        let mut r = sample(DataType::I16);
        r.set(0, 0, f64::NAN);
        write_raster(&path, &r).unwrap();

        let back = read_raster(&path).unwrap();
        assert_eq!(back.datatype, DataType::I16);
        assert_eq!(back.get(0, 1), 2.0); // 1.5 rounds to 2
        assert_eq!(back.get(0, 0), -9999.0); // NaN stored as nodata
    }

    #[test]
    fn read_info_matches_written_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("projected.tif");
        let r = sample(DataType::U16).with_projection(Some(Projection::Epsg(32633))).with_nodata(None);
        write_raster(&path, &r).unwrap();

        let info = read_info(&path).unwrap();
        assert_eq!(info.projection, Some(Projection::Epsg(32633)));
        assert_eq!(info.datatype, DataType::U16);
        assert_eq!(info.nodata, None);
        assert_eq!(info.pixel_size(), (0.25, -0.25));
    }

    #[test]
    fn missing_projection_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.tif");
        write_raster(&path, &sample(DataType::F64).with_projection(None)).unwrap();
        assert_eq!(read_info(&path).unwrap().projection, None);
    }

    #[test]
    fn nodata_formatting() {
        assert_eq!(format_nodata(-9999.0), "-9999");
        assert_eq!(format_nodata(0.5), "0.5");
        assert_eq!(format_nodata(f64::NAN), "nan");
    }
}

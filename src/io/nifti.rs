//! Minimal NIfTI-1 single-file codec (`.nii` and `.nii.gz`).
//!
//! Only 3D volumes are handled. The original 348-byte header is carried
//! along untouched so orientation (qform/sform), pixel sizes and
//! descriptions survive a read/write cycle; only the fields that describe
//! the voxel buffer are rewritten.

use crate::utils::error::{HarmonizeError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::path::Path;

pub const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;

const OFF_DIM: usize = 40;
const OFF_DATATYPE: usize = 70;
const OFF_BITPIX: usize = 72;
const OFF_PIXDIM: usize = 76;
const OFF_VOX_OFFSET: usize = 108;
const OFF_SCL_SLOPE: usize = 112;
const OFF_SCL_INTER: usize = 116;
const OFF_CAL_MAX: usize = 124;
const OFF_CAL_MIN: usize = 128;
const OFF_MAGIC: usize = 344;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    U8,
    I16,
    I32,
    F32,
    F64,
    I8,
    U16,
    U32,
}

impl DataType {
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            2 => Some(Self::U8),
            4 => Some(Self::I16),
            8 => Some(Self::I32),
            16 => Some(Self::F32),
            64 => Some(Self::F64),
            256 => Some(Self::I8),
            512 => Some(Self::U16),
            768 => Some(Self::U32),
            _ => None,
        }
    }

    pub fn code(self) -> i16 {
        match self {
            Self::U8 => 2,
            Self::I16 => 4,
            Self::I32 => 8,
            Self::F32 => 16,
            Self::F64 => 64,
            Self::I8 => 256,
            Self::U16 => 512,
            Self::U32 => 768,
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// A 3D volume, x varying fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiImage {
    header: Vec<u8>,
    big_endian: bool,
    pub dims: [usize; 3],
    pub data: Vec<f64>,
}

struct Endian(bool);

impl Endian {
    fn i16(&self, b: &[u8], off: usize) -> i16 {
        let raw = [b[off], b[off + 1]];
        if self.0 {
            i16::from_be_bytes(raw)
        } else {
            i16::from_le_bytes(raw)
        }
    }

    fn i32(&self, b: &[u8], off: usize) -> i32 {
        let raw = [b[off], b[off + 1], b[off + 2], b[off + 3]];
        if self.0 {
            i32::from_be_bytes(raw)
        } else {
            i32::from_le_bytes(raw)
        }
    }

    fn f32(&self, b: &[u8], off: usize) -> f32 {
        f32::from_bits(self.i32(b, off) as u32)
    }

    fn put_i16(&self, b: &mut [u8], off: usize, v: i16) {
        let raw = if self.0 { v.to_be_bytes() } else { v.to_le_bytes() };
        b[off..off + 2].copy_from_slice(&raw);
    }

    fn put_f32(&self, b: &mut [u8], off: usize, v: f32) {
        let raw = if self.0 { v.to_be_bytes() } else { v.to_le_bytes() };
        b[off..off + 4].copy_from_slice(&raw);
    }

    fn put_i32(&self, b: &mut [u8], off: usize, v: i32) {
        let raw = if self.0 { v.to_be_bytes() } else { v.to_le_bytes() };
        b[off..off + 4].copy_from_slice(&raw);
    }
}

fn nifti_error(path: &str, message: impl Into<String>) -> HarmonizeError {
    HarmonizeError::NiftiError {
        path: path.to_string(),
        message: message.into(),
    }
}

pub fn is_gzip_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("gz"))
        .unwrap_or(false)
}

impl NiftiImage {
    /// Creates an all-zero little-endian volume with identity scaling.
    pub fn new_3d(dims: [usize; 3], voxel_size: [f32; 3]) -> Self {
        let mut header = vec![0u8; HEADER_SIZE];
        let e = Endian(false);
        e.put_i32(&mut header, 0, HEADER_SIZE as i32);
        e.put_i16(&mut header, OFF_DIM, 3);
        for (i, &d) in dims.iter().enumerate() {
            e.put_i16(&mut header, OFF_DIM + 2 * (i + 1), d as i16);
        }
        for i in 4..8 {
            e.put_i16(&mut header, OFF_DIM + 2 * i, 1);
        }
        e.put_f32(&mut header, OFF_PIXDIM, 1.0);
        for (i, &s) in voxel_size.iter().enumerate() {
            e.put_f32(&mut header, OFF_PIXDIM + 4 * (i + 1), s);
        }
        header[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(b"n+1\0");

        Self {
            header,
            big_endian: false,
            dims,
            data: vec![0.0; dims[0] * dims[1] * dims[2]],
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let bytes = if raw.starts_with(&[0x1f, 0x8b]) {
            let mut decoded = Vec::new();
            GzDecoder::new(raw.as_slice())
                .read_to_end(&mut decoded)
                .map_err(|e| nifti_error(&path.display().to_string(), format!("gzip: {}", e)))?;
            decoded
        } else {
            raw
        };
        Self::from_bytes(&bytes, &path.display().to_string())
    }

    pub fn from_bytes(bytes: &[u8], origin: &str) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(nifti_error(origin, "file is shorter than a NIfTI-1 header"));
        }

        let big_endian = if i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == 348 {
            false
        } else if i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == 348 {
            true
        } else {
            return Err(nifti_error(
                origin,
                "sizeof_hdr is not 348 (NIfTI-2 and Analyze files are not supported)",
            ));
        };
        let e = Endian(big_endian);

        if &bytes[OFF_MAGIC..OFF_MAGIC + 3] != b"n+1" {
            return Err(nifti_error(
                origin,
                "not a single-file NIfTI-1 image (magic is not 'n+1')",
            ));
        }

        let ndim = e.i16(bytes, OFF_DIM);
        if !(1..=7).contains(&ndim) {
            return Err(nifti_error(origin, format!("invalid dim[0] = {}", ndim)));
        }
        let dim = |i: usize| -> i16 {
            if i as i16 <= ndim {
                e.i16(bytes, OFF_DIM + 2 * i)
            } else {
                1
            }
        };
        for i in 4..=ndim as usize {
            if dim(i) > 1 {
                return Err(nifti_error(
                    origin,
                    format!(
                        "image has {} volumes along dimension {}; split it into 3D images first",
                        dim(i),
                        i
                    ),
                ));
            }
        }
        let mut dims = [0usize; 3];
        for (i, d) in dims.iter_mut().enumerate() {
            let v = dim(i + 1);
            if v < 1 {
                return Err(nifti_error(origin, format!("invalid dim[{}] = {}", i + 1, v)));
            }
            *d = v as usize;
        }

        let code = e.i16(bytes, OFF_DATATYPE);
        let datatype = DataType::from_code(code)
            .ok_or_else(|| nifti_error(origin, format!("unsupported datatype code {}", code)))?;

        let vox_offset = e.f32(bytes, OFF_VOX_OFFSET);
        let offset = if vox_offset.is_finite() && vox_offset >= HEADER_SIZE as f32 {
            vox_offset as usize
        } else {
            VOX_OFFSET
        };

        let n_voxels = dims[0] * dims[1] * dims[2];
        let needed = offset + n_voxels * datatype.bytes();
        if bytes.len() < needed {
            return Err(nifti_error(
                origin,
                format!("expected {} bytes of image data, file has {}", needed, bytes.len()),
            ));
        }

        let slope = e.f32(bytes, OFF_SCL_SLOPE) as f64;
        let inter = e.f32(bytes, OFF_SCL_INTER) as f64;
        let scaled = slope != 0.0 && slope.is_finite() && !(slope == 1.0 && inter == 0.0);

        let body = &bytes[offset..needed];
        let data = body
            .chunks_exact(datatype.bytes())
            .map(|c| {
                let v = decode_voxel(c, datatype, big_endian);
                if scaled {
                    v * slope + inter
                } else {
                    v
                }
            })
            .collect();

        Ok(Self {
            header: bytes[..HEADER_SIZE].to_vec(),
            big_endian,
            dims,
            data,
        })
    }

    pub fn n_voxels(&self) -> usize {
        self.data.len()
    }

    /// Voxel size in mm, read from the header.
    pub fn voxel_size(&self) -> [f32; 3] {
        let e = Endian(self.big_endian);
        [
            e.f32(&self.header, OFF_PIXDIM + 4),
            e.f32(&self.header, OFF_PIXDIM + 8),
            e.f32(&self.header, OFF_PIXDIM + 12),
        ]
    }

    /// A volume with this image's geometry and new voxel values.
    pub fn with_data(&self, data: Vec<f64>) -> Result<Self> {
        if data.len() != self.n_voxels() {
            return Err(HarmonizeError::ProcessingError {
                message: format!(
                    "volume needs {} voxels, got {}",
                    self.n_voxels(),
                    data.len()
                ),
            });
        }
        Ok(Self {
            header: self.header.clone(),
            big_endian: self.big_endian,
            dims: self.dims,
            data,
        })
    }

    pub fn same_geometry(&self, other: &NiftiImage) -> bool {
        self.dims == other.dims
    }

    /// Serializes the volume with the given voxel type; scaling is reset.
    pub fn to_bytes(&self, datatype: DataType) -> Vec<u8> {
        let e = Endian(self.big_endian);
        let mut header = self.header.clone();

        e.put_i16(&mut header, OFF_DIM, 3);
        for (i, &d) in self.dims.iter().enumerate() {
            e.put_i16(&mut header, OFF_DIM + 2 * (i + 1), d as i16);
        }
        for i in 4..8 {
            e.put_i16(&mut header, OFF_DIM + 2 * i, 1);
        }
        e.put_i16(&mut header, OFF_DATATYPE, datatype.code());
        e.put_i16(&mut header, OFF_BITPIX, (datatype.bytes() * 8) as i16);
        e.put_f32(&mut header, OFF_VOX_OFFSET, VOX_OFFSET as f32);
        e.put_f32(&mut header, OFF_SCL_SLOPE, 1.0);
        e.put_f32(&mut header, OFF_SCL_INTER, 0.0);
        e.put_f32(&mut header, OFF_CAL_MAX, 0.0);
        e.put_f32(&mut header, OFF_CAL_MIN, 0.0);
        header[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(b"n+1\0");

        let mut out = Vec::with_capacity(VOX_OFFSET + self.data.len() * datatype.bytes());
        out.extend_from_slice(&header);
        // 不保留 header extension
        out.extend_from_slice(&[0u8; VOX_OFFSET - HEADER_SIZE]);
        for &v in &self.data {
            encode_voxel(&mut out, v, datatype, self.big_endian);
        }
        out
    }

    /// Like [`to_bytes`](Self::to_bytes), gzip-compressed when `gzip` is set.
    pub fn encode(&self, datatype: DataType, gzip: bool) -> Result<Vec<u8>> {
        let raw = self.to_bytes(datatype);
        if !gzip {
            return Ok(raw);
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    }
}

fn decode_voxel(c: &[u8], datatype: DataType, big_endian: bool) -> f64 {
    macro_rules! num {
        ($t:ty, $n:expr) => {{
            let mut raw = [0u8; $n];
            raw.copy_from_slice(c);
            if big_endian {
                <$t>::from_be_bytes(raw) as f64
            } else {
                <$t>::from_le_bytes(raw) as f64
            }
        }};
    }
    match datatype {
        DataType::U8 => c[0] as f64,
        DataType::I8 => c[0] as i8 as f64,
        DataType::I16 => num!(i16, 2),
        DataType::U16 => num!(u16, 2),
        DataType::I32 => num!(i32, 4),
        DataType::U32 => num!(u32, 4),
        DataType::F32 => num!(f32, 4),
        DataType::F64 => num!(f64, 8),
    }
}

fn encode_voxel(out: &mut Vec<u8>, v: f64, datatype: DataType, big_endian: bool) {
    macro_rules! put {
        ($value:expr) => {{
            let value = $value;
            if big_endian {
                out.extend_from_slice(&value.to_be_bytes());
            } else {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }};
    }
    match datatype {
        DataType::U8 => out.push(v.round().clamp(0.0, u8::MAX as f64) as u8),
        DataType::I8 => out.push(v.round().clamp(i8::MIN as f64, i8::MAX as f64) as i8 as u8),
        DataType::I16 => put!(v.round() as i16),
        DataType::U16 => put!(v.round() as u16),
        DataType::I32 => put!(v.round() as i32),
        DataType::U32 => put!(v.round() as u32),
        DataType::F32 => put!(v as f32),
        DataType::F64 => put!(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(dims: [usize; 3]) -> NiftiImage {
        let img = NiftiImage::new_3d(dims, [2.0, 2.0, 2.5]);
        let data = (0..img.n_voxels()).map(|i| i as f64 * 0.5).collect();
        img.with_data(data).unwrap()
    }

    #[test]
    fn test_float_volume_survives_encode_decode() {
        let img = ramp([4, 3, 2]);
        let bytes = img.encode(DataType::F32, true).unwrap();
        let decoded = {
            let mut raw = Vec::new();
            GzDecoder::new(bytes.as_slice()).read_to_end(&mut raw).unwrap();
            NiftiImage::from_bytes(&raw, "ramp.nii.gz").unwrap()
        };
        assert_eq!(decoded.dims, [4, 3, 2]);
        assert_eq!(decoded.data, img.data);
        assert_eq!(decoded.voxel_size(), [2.0, 2.0, 2.5]);
    }

    #[test]
    fn test_scaled_integer_volume() {
        let img = NiftiImage::new_3d([2, 1, 1], [1.0, 1.0, 1.0])
            .with_data(vec![3.0, 7.0])
            .unwrap();
        let mut bytes = img.to_bytes(DataType::I16);
        let e = Endian(false);
        e.put_f32(&mut bytes, OFF_SCL_SLOPE, 2.0);
        e.put_f32(&mut bytes, OFF_SCL_INTER, 1.0);
        let decoded = NiftiImage::from_bytes(&bytes, "scaled.nii").unwrap();
        assert_eq!(decoded.data, vec![7.0, 15.0]);
    }

    #[test]
    fn test_big_endian_header_is_detected() {
        let img = ramp([2, 2, 1]);
        let mut big = img.clone();
        big.big_endian = true;
        let e = Endian(true);
        e.put_i32(&mut big.header, 0, HEADER_SIZE as i32);
        e.put_i16(&mut big.header, OFF_DIM, 3);
        let bytes = big.to_bytes(DataType::F64);
        let decoded = NiftiImage::from_bytes(&bytes, "big.nii").unwrap();
        assert_eq!(decoded.data, img.data);
    }

    #[test]
    fn test_four_dimensional_image_is_rejected() {
        let img = ramp([2, 2, 2]);
        let mut bytes = img.to_bytes(DataType::F32);
        let e = Endian(false);
        e.put_i16(&mut bytes, OFF_DIM, 4);
        e.put_i16(&mut bytes, OFF_DIM + 8, 3);
        let err = NiftiImage::from_bytes(&bytes, "merged_4d.nii").unwrap_err();
        assert!(err.to_string().contains("split"));
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let bytes = ramp([4, 4, 4]).to_bytes(DataType::F32);
        assert!(NiftiImage::from_bytes(&bytes[..400], "short.nii").is_err());
        assert!(NiftiImage::from_bytes(&bytes[..100], "tiny.nii").is_err());
    }

    #[test]
    fn test_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub-1001.nii.gz");
        let img = ramp([3, 3, 3]);
        std::fs::write(&path, img.encode(DataType::F32, is_gzip_path(&path)).unwrap()).unwrap();
        let decoded = NiftiImage::read(&path).unwrap();
        assert_eq!(decoded.data, img.data);
    }
}

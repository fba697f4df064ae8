//! Read/write boundary for images and vector fields.
//!
//! The engine only ever hands an in-memory field and a name across this
//! boundary; the format behind it is an implementation detail. The
//! default implementation persists NIfTI-1 volumes (gzip-compressed when
//! the filename asks for it), with scalar fields stored as 3D volumes
//! and multi-component data as a 4D volume.

use std::fs;
use std::io::{Cursor, Write as IoWrite};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiObject};

use crate::error::{ClaireError, Result};
use crate::grid::GridSize;

/// Persistence boundary consumed by the engine.
pub trait ReadWrite {
    /// Persist a field under the given name. The component count is
    /// inferred from the data length.
    fn write(&mut self, data: &[f64], name: &str) -> Result<()>;

    /// Load a field into the provided buffer.
    fn read(&mut self, data: &mut [f64], name: &str) -> Result<()>;

    /// Persist the (deformed) template image.
    fn write_template(&mut self, data: &[f64], name: &str, _multichannel: bool) -> Result<()> {
        log::info!("writing template image: {}", name);
        self.write(data, name)
    }

    /// Persist the reference image.
    fn write_reference(&mut self, data: &[f64], name: &str, _multichannel: bool) -> Result<()> {
        log::info!("writing reference image: {}", name);
        self.write(data, name)
    }
}

/// NIfTI-1 file backend for the read/write boundary.
pub struct NiftiReadWrite {
    dir: PathBuf,
    grid: GridSize,
}

impl NiftiReadWrite {
    pub fn new(dir: impl Into<PathBuf>, grid: GridSize) -> Self {
        Self {
            dir: dir.into(),
            grid,
        }
    }

    /// Resolve a field name to a path; names without an extension get
    /// the compressed default.
    fn path(&self, name: &str) -> PathBuf {
        let has_ext = name.ends_with(".nii") || name.ends_with(".nii.gz");
        if has_ext {
            self.dir.join(name)
        } else {
            self.dir.join(format!("{}.nii.gz", name))
        }
    }
}

impl ReadWrite for NiftiReadWrite {
    fn write(&mut self, data: &[f64], name: &str) -> Result<()> {
        let nl = self.grid.nl();
        if nl == 0 || data.len() % nl != 0 {
            return Err(ClaireError::DimensionMismatch {
                expected: nl,
                actual: data.len(),
            });
        }
        let nvol = data.len() / nl;

        let bytes = encode_nifti(data, self.grid, nvol)?;
        let path = self.path(name);
        let bytes = if path.extension().map_or(false, |e| e == "gz") {
            let mut enc = GzEncoder::new(Vec::new(), Compression::default());
            enc.write_all(&bytes)
                .and_then(|_| enc.finish())
                .map_err(|e| ClaireError::io(format!("gzip failed: {}", e)))?
        } else {
            bytes
        };
        log::debug!("writing {} ({} volumes)", path.display(), nvol);
        fs::write(&path, bytes)
            .map_err(|e| ClaireError::io(format!("write {} failed: {}", path.display(), e)))
    }

    fn read(&mut self, data: &mut [f64], name: &str) -> Result<()> {
        let path = self.path(name);
        let bytes = fs::read(&path)
            .map_err(|e| ClaireError::io(format!("read {} failed: {}", path.display(), e)))?;
        let volume = decode_nifti(&bytes, &path)?;
        if volume.len() != data.len() {
            return Err(ClaireError::DimensionMismatch {
                expected: data.len(),
                actual: volume.len(),
            });
        }
        data.copy_from_slice(&volume);
        Ok(())
    }
}

/// Serialize a field into uncompressed NIfTI-1 bytes: 348-byte header,
/// 4-byte extension flag, float32 data in Fortran order.
fn encode_nifti(data: &[f64], grid: GridSize, nvol: usize) -> Result<Vec<u8>> {
    let [nx, ny, nz] = grid.nx;
    let h = grid.spacing();
    let mut header = [0u8; 348];

    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    let ndim: i16 = if nvol > 1 { 4 } else { 3 };
    let dim: [i16; 8] = [
        ndim,
        nx as i16,
        ny as i16,
        nz as i16,
        nvol.max(1) as i16,
        1,
        1,
        1,
    ];
    for (i, &d) in dim.iter().enumerate() {
        let off = 40 + i * 2;
        header[off..off + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype FLOAT32, bitpix 32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    let pixdim: [f32; 8] = [1.0, h[0] as f32, h[1] as f32, h[2] as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let off = 76 + i * 4;
        header[off..off + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset, scl_slope, scl_inter
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform: voxel scaling on the diagonal
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    let srow: [[f32; 4]; 3] = [
        [h[0] as f32, 0.0, 0.0, 0.0],
        [0.0, h[1] as f32, 0.0, 0.0],
        [0.0, 0.0, h[2] as f32, 0.0],
    ];
    for (r, row) in srow.iter().enumerate() {
        for (c, &v) in row.iter().enumerate() {
            let off = 280 + r * 16 + c * 4;
            header[off..off + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    header[344..348].copy_from_slice(b"n+1\0");

    let mut buf = Vec::with_capacity(352 + data.len() * 4);
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&[0u8; 4]);
    for &v in data {
        buf.extend_from_slice(&(v as f32).to_le_bytes());
    }
    Ok(buf)
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Parse NIfTI bytes (gzip auto-detected) into a flat Fortran-order
/// volume; 4D inputs are flattened volume-major.
fn decode_nifti(bytes: &[u8], path: &Path) -> Result<Vec<f64>> {
    let obj: InMemNiftiObject = if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes)))
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes))
    }
    .map_err(|e| ClaireError::io(format!("parse {} failed: {}", path.display(), e)))?;

    let array: Array<f64, _> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| ClaireError::io(format!("decode {} failed: {}", path.display(), e)))?;

    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(ClaireError::io(format!(
            "{}: expected at least a 3D volume, got {}D",
            path.display(),
            shape.len()
        )));
    }
    let (n0, n1, n2) = (shape[0], shape[1], shape[2]);
    let nvol = if shape.len() >= 4 { shape[3] } else { 1 };

    let mut data = Vec::with_capacity(n0 * n1 * n2 * nvol);
    for t in 0..nvol {
        for k in 0..n2 {
            for j in 0..n1 {
                for i in 0..n0 {
                    data.push(if shape.len() >= 4 {
                        array[[i, j, k, t]]
                    } else {
                        array[[i, j, k]]
                    });
                }
            }
        }
    }
    Ok(data)
}

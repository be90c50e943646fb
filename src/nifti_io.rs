//! NIfTI file I/O
//!
//! Loads 3D/4D volumes (copes, varcopes, masks) into flat buffers and writes
//! statistical maps back out with the geometry of a reference image.
//! Statistics are written as FLOAT64, boolean masks as UINT8.

use std::io::Cursor;
use std::path::Path;

use flate2::read::GzDecoder;
use ndarray::{Array, IxDyn};
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{Error, Result};

/// NIfTI data loaded from bytes
#[derive(Debug, Clone)]
pub struct NiftiData {
    /// Volume data as f64, Fortran order, volumes stacked along t
    pub data: Vec<f64>,
    /// Spatial dimensions (nx, ny, nz)
    pub dims: (usize, usize, usize),
    /// Number of volumes along the fourth dimension (1 for 3D images)
    pub n_volumes: usize,
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Affine transformation matrix (4x4, row-major)
    pub affine: [f64; 16],
    /// Data scaling slope
    pub scl_slope: f64,
    /// Data scaling intercept
    pub scl_inter: f64,
}

impl NiftiData {
    /// Number of voxels in one 3D volume
    pub fn volume_len(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    /// Borrow a single 3D volume
    pub fn volume(&self, t: usize) -> &[f64] {
        let n = self.volume_len();
        &self.data[t * n..(t + 1) * n]
    }

    /// Geometry of this image squeezed to 3D
    pub fn geometry(&self) -> Geometry {
        Geometry {
            dims: self.dims,
            voxel_size: self.voxel_size,
            affine: self.affine,
        }
    }
}

/// Spatial geometry shared by all output maps of a sweep
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub dims: (usize, usize, usize),
    pub voxel_size: (f64, f64, f64),
    pub affine: [f64; 16],
}

impl Geometry {
    pub fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }
}

/// On-disk data type of a written map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    /// DT_UINT8, used for boolean masks
    Uint8,
    /// DT_FLOAT64, used for statistics
    Float64,
}

impl Datatype {
    fn code(self) -> i16 {
        match self {
            Datatype::Uint8 => 2,
            Datatype::Float64 => 64,
        }
    }

    fn bitpix(self) -> i16 {
        match self {
            Datatype::Uint8 => 8,
            Datatype::Float64 => 64,
        }
    }
}

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Get header info for diagnostics
fn get_header_info(bytes: &[u8]) -> String {
    if bytes.len() < 348 {
        return format!("File too small ({} bytes, need at least 348)", bytes.len());
    }

    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);

    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

/// Load a NIfTI image from bytes
///
/// Supports both .nii and .nii.gz content (gzip is auto-detected) and
/// 3D or 4D images. Singleton trailing dimensions are squeezed away.
pub fn load_nifti(bytes: &[u8]) -> Result<NiftiData> {
    let obj: InMemNiftiObject = if is_gzip(bytes) {
        let decoder = GzDecoder::new(Cursor::new(bytes));
        InMemNiftiObject::from_reader(decoder).map_err(|e| {
            let mut decoder = GzDecoder::new(Cursor::new(bytes));
            let mut decompressed = Vec::new();
            let info = if std::io::Read::read_to_end(&mut decoder, &mut decompressed).is_ok() {
                get_header_info(&decompressed)
            } else {
                "Could not decompress".to_string()
            };
            Error::Nifti(format!("Failed to read gzipped NIfTI: {} ({})", e, info))
        })?
    } else {
        let info = get_header_info(bytes);
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| Error::Nifti(format!("Failed to read NIfTI: {} ({})", e, info)))?
    };

    let header = obj.header();
    let ndim = header.dim[0] as usize;
    if ndim < 3 {
        return Err(Error::Nifti(format!("Expected at least 3D volume, got {}D", ndim)));
    }

    let vsx = header.pixdim[1] as f64;
    let vsy = header.pixdim[2] as f64;
    let vsz = header.pixdim[3] as f64;
    let scl_slope = if header.scl_slope == 0.0 { 1.0 } else { header.scl_slope as f64 };
    let scl_inter = header.scl_inter as f64;
    let affine = get_affine(header);

    let array: Array<f64, IxDyn> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| Error::Nifti(format!("Failed to convert to ndarray: {}", e)))?;

    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(Error::Nifti(format!("Expected at least 3D array, got {}D", shape.len())));
    }
    if shape[4.min(shape.len())..].iter().any(|&d| d > 1) {
        return Err(Error::Nifti(format!("Images with more than 4 dimensions are not supported: {:?}", shape)));
    }

    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
    let nt = if shape.len() >= 4 { shape[3] } else { 1 };

    // x varies fastest, then y, z and t
    let mut data = Vec::with_capacity(nx * ny * nz * nt);
    let mut index = vec![0usize; shape.len()];
    for t in 0..nt {
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    index[0] = i;
                    index[1] = j;
                    index[2] = k;
                    if index.len() > 3 {
                        index[3] = t;
                    }
                    data.push(array[index.as_slice()]);
                }
            }
        }
    }

    Ok(NiftiData {
        data,
        dims: (nx, ny, nz),
        n_volumes: nt,
        voxel_size: (vsx, vsy, vsz),
        affine,
        scl_slope,
        scl_inter,
    })
}

/// Get affine transformation matrix from header
fn get_affine(header: &NiftiHeader) -> [f64; 16] {
    // Prefer sform if available (sform_code > 0)
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        let vsx = header.pixdim[1] as f64;
        let vsy = header.pixdim[2] as f64;
        let vsz = header.pixdim[3] as f64;
        [
            vsx, 0.0, 0.0, 0.0,
            0.0, vsy, 0.0, 0.0,
            0.0, 0.0, vsz, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

/// Encode a 3D or 4D volume as NIfTI-1 bytes
///
/// # Arguments
/// * `data` - Volume data in Fortran order, length nx*ny*nz*nt
/// * `geometry` - Spatial dimensions, voxel size and affine of the map
/// * `n_volumes` - Length of the fourth dimension (1 writes a 3D image)
/// * `datatype` - On-disk element type
///
/// # Returns
/// Uncompressed .nii bytes
pub fn save_nifti(
    data: &[f64],
    geometry: &Geometry,
    n_volumes: usize,
    datatype: Datatype,
) -> Result<Vec<u8>> {
    use std::io::Write;

    let (nx, ny, nz) = geometry.dims;
    let (vsx, vsy, vsz) = geometry.voxel_size;
    let nt = n_volumes.max(1);

    if data.len() != nx * ny * nz * nt {
        return Err(Error::Nifti(format!(
            "Data length {} does not match shape {}x{}x{}x{}",
            data.len(), nx, ny, nz, nt
        )));
    }
    for &d in &[nx, ny, nz, nt] {
        if d > i16::MAX as usize {
            return Err(Error::Nifti(format!("Dimension {} exceeds NIfTI-1 limits", d)));
        }
    }

    let mut header = [0u8; 348];

    // sizeof_hdr = 348
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    let ndim: i16 = if nt > 1 { 4 } else { 3 };
    let dim: [i16; 8] = [ndim, nx as i16, ny as i16, nz as i16, nt as i16, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    header[70..72].copy_from_slice(&datatype.code().to_le_bytes());
    header[72..74].copy_from_slice(&datatype.bitpix().to_le_bytes());

    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352 (header + 4 bytes extension)
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // xyzt_units: mm
    header[123] = 2;

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    for row in 0..3 {
        for col in 0..4 {
            let offset = 280 + row * 16 + col * 4;
            header[offset..offset + 4].copy_from_slice(&(geometry.affine[row * 4 + col] as f32).to_le_bytes());
        }
    }

    // magic = "n+1\0" for NIfTI-1 single file
    header[344..348].copy_from_slice(b"n+1\0");

    let bytes_per_voxel = datatype.bitpix() as usize / 8;
    let mut buffer = Vec::with_capacity(352 + data.len() * bytes_per_voxel);
    buffer.write_all(&header).map_err(|e| Error::Nifti(format!("Write header failed: {}", e)))?;
    buffer.write_all(&[0u8; 4]).map_err(|e| Error::Nifti(format!("Write extension failed: {}", e)))?;

    match datatype {
        Datatype::Float64 => {
            for &val in data {
                buffer.extend_from_slice(&val.to_le_bytes());
            }
        }
        Datatype::Uint8 => {
            buffer.extend(data.iter().map(|&val| if val != 0.0 && !val.is_nan() { 1u8 } else { 0u8 }));
        }
    }

    Ok(buffer)
}

/// Encode a volume as gzipped NIfTI bytes (.nii.gz)
pub fn save_nifti_gz(
    data: &[f64],
    geometry: &Geometry,
    n_volumes: usize,
    datatype: Datatype,
) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let uncompressed = save_nifti(data, geometry, n_volumes, datatype)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&uncompressed)
        .map_err(|e| Error::Nifti(format!("Gzip compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Nifti(format!("Gzip finish failed: {}", e)))
}

/// Read a NIfTI file from a filesystem path
pub fn read_nifti_file(path: &Path) -> Result<NiftiData> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    load_nifti(&bytes).map_err(|e| match e {
        Error::Nifti(msg) => Error::Nifti(format!("'{}': {}", path.display(), msg)),
        other => other,
    })
}

/// Save a volume to a file
///
/// If the path ends with .nii.gz, the file is gzip compressed.
/// Otherwise it is saved as uncompressed .nii.
pub fn save_nifti_to_file(
    path: &Path,
    data: &[f64],
    geometry: &Geometry,
    n_volumes: usize,
    datatype: Datatype,
) -> Result<()> {
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        save_nifti_gz(data, geometry, n_volumes, datatype)?
    } else {
        save_nifti(data, geometry, n_volumes, datatype)?
    };

    std::fs::write(path, &bytes).map_err(|e| Error::io(path, e))
}

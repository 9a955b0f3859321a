//! Minimal NumPy `.npy` codec for dense little-endian f64 matrices
//!
//! Writes format version 1.0; reads 1.0 and 2.0. Only `<f8` in C order is
//! supported, which is all the store ever writes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use emg_core::{EmgError, EmgResult, SignalMatrix};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

const MAGIC: &[u8; 6] = b"\x93NUMPY";
/// Magic, version and 2-byte header length
const PREAMBLE_V1: usize = 10;
const ALIGNMENT: usize = 64;

fn header_dict(rows: usize, channels: usize) -> String {
    format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': ({}, {}), }}",
        rows, channels
    )
}

pub fn write_npy<W: Write>(writer: &mut W, matrix: &SignalMatrix) -> EmgResult<()> {
    let (rows, channels) = matrix.shape();
    let mut header = header_dict(rows, channels);

    // header is padded with spaces and terminated by '\n' so data starts aligned
    let unpadded = PREAMBLE_V1 + header.len() + 1;
    let padding = (ALIGNMENT - unpadded % ALIGNMENT) % ALIGNMENT;
    header.extend(std::iter::repeat(' ').take(padding));
    header.push('\n');

    let header_len = u16::try_from(header.len())
        .map_err(|_| EmgError::storage("npy header too long"))?;

    writer.write_all(MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_u16::<LittleEndian>(header_len)?;
    writer.write_all(header.as_bytes())?;
    for &value in matrix.data() {
        writer.write_f64::<LittleEndian>(value)?;
    }
    Ok(())
}

pub fn read_npy<R: Read>(reader: &mut R) -> EmgResult<SignalMatrix> {
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(EmgError::storage("not an npy file"));
    }

    let major = reader.read_u8()?;
    let _minor = reader.read_u8()?;
    let header_len = match major {
        1 => reader.read_u16::<LittleEndian>()? as usize,
        2 | 3 => reader.read_u32::<LittleEndian>()? as usize,
        other => return Err(EmgError::storage(format!("unsupported npy version {}", other))),
    };

    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header)?;
    let header = String::from_utf8(header)
        .map_err(|_| EmgError::storage("npy header is not valid text"))?;
    let (rows, channels) = parse_header(&header)?;

    let len = rows
        .checked_mul(channels)
        .filter(|len| len.checked_mul(8).is_some())
        .ok_or_else(|| EmgError::storage(format!("npy shape ({}, {}) is too large", rows, channels)))?;

    // grow with the bytes actually present rather than trusting the header
    let mut bytes = Vec::new();
    reader.by_ref().take(len as u64 * 8).read_to_end(&mut bytes)?;
    if bytes.len() != len * 8 {
        return Err(EmgError::storage(format!(
            "npy data holds {} bytes, header promises {}",
            bytes.len(),
            len * 8
        )));
    }
    let mut data = vec![0.0f64; len];
    bytes.as_slice().read_f64_into::<LittleEndian>(&mut data)?;

    if channels == 0 {
        return Ok(SignalMatrix::empty(0));
    }
    SignalMatrix::new(data, channels)
}

/// Extract `(rows, channels)`, rejecting anything but `<f8` in C order
fn parse_header(header: &str) -> EmgResult<(usize, usize)> {
    let compact: String = header.chars().filter(|c| !c.is_whitespace()).collect();

    if !compact.contains("'descr':'<f8'") {
        return Err(EmgError::storage(format!("unsupported npy dtype in header {:?}", header.trim())));
    }
    if !compact.contains("'fortran_order':False") {
        return Err(EmgError::storage("fortran-ordered npy arrays are not supported"));
    }

    let shape = compact
        .split("'shape':(")
        .nth(1)
        .and_then(|rest| rest.split(')').next())
        .ok_or_else(|| EmgError::storage("npy header has no shape"))?;

    let dims = shape
        .split(',')
        .filter(|d| !d.is_empty())
        .map(|d| d.parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EmgError::storage(format!("bad npy shape {:?}: {}", shape, e)))?;

    match dims.as_slice() {
        [rows] => Ok((*rows, 1)),
        [rows, channels] => Ok((*rows, *channels)),
        _ => Err(EmgError::storage(format!("expected a 1-D or 2-D array, got shape ({})", shape))),
    }
}

/// Write into a temporary file in `dir`; nothing is visible until [`persist_to`]
pub fn write_npy_temp(dir: &Path, matrix: &SignalMatrix) -> EmgResult<NamedTempFile> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        write_npy(&mut writer, matrix)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

/// Rename a temporary file over `path`
pub fn persist_to(tmp: NamedTempFile, path: &Path) -> EmgResult<()> {
    tmp.persist(path)
        .map(|_| ())
        .map_err(|e| EmgError::storage(format!("cannot write {}: {}", path.display(), e)))
}

/// Write to a temporary file beside `path`, then rename over it
pub fn write_npy_atomic(path: &Path, matrix: &SignalMatrix) -> EmgResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| EmgError::storage(format!("{} has no parent directory", path.display())))?;
    persist_to(write_npy_temp(dir, matrix)?, path)
}

pub fn read_npy_file(path: &Path) -> EmgResult<SignalMatrix> {
    let file = File::open(path)?;
    read_npy(&mut BufReader::new(file))
}

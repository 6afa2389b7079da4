//! Config-drive image encoder.
//!
//! Produces a minimal ISO-9660 image holding exactly one file in the root
//! directory. The guest agent mounts it read-only to pick up its
//! environment before it has any network access.
//!
//! ## Layout (2048-byte sectors)
//!
//! ```text
//! 0..16   system area (zeros)
//! 16      primary volume descriptor
//! 17      volume descriptor set terminator
//! 18      path table, little-endian (root entry only)
//! 19      path table, big-endian (root entry only)
//! 20      root directory: ".", "..", the file record
//! 21..    file data, zero-padded to a whole sector
//! ```
//!
//! Fields the format stores in both byte orders go through
//! [`put_both_u16`]/[`put_both_u32`] so the two copies cannot disagree.

use chrono::{DateTime, Datelike, Timelike, Utc};

pub const SECTOR_SIZE: usize = 2048;
pub const MAX_LABEL_LEN: usize = 32;

const SYSTEM_AREA_SECTORS: u32 = 16;
const PVD_SECTOR: u32 = 16;
const TERMINATOR_SECTOR: u32 = 17;
const L_PATH_TABLE_SECTOR: u32 = 18;
const M_PATH_TABLE_SECTOR: u32 = 19;
const ROOT_DIR_SECTOR: u32 = 20;
const DATA_SECTOR: u32 = 21;

const PATH_TABLE_SIZE: u32 = 10;
const ROOT_RECORD_LEN: usize = 34;
const FLAG_DIRECTORY: u8 = 0x02;

const STANDARD_ID: &[u8; 5] = b"CD001";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigDriveError {
    #[error("volume label '{0}' must be non-empty and contain only A-Z, 0-9, '_' and '.'")]
    InvalidLabel(String),

    #[error("payload of {0} bytes does not fit a 32-bit extent")]
    PayloadTooLarge(usize),

    #[error("malformed image: {0}")]
    Malformed(String),
}

/// Encode `payload` as file `label` on a volume labelled `label`, stamped
/// with the current time.
pub fn encode(label: &str, payload: &[u8]) -> Result<Vec<u8>, ConfigDriveError> {
    encode_at(label, payload, Utc::now())
}

/// Deterministic variant of [`encode`].
pub fn encode_at(
    label: &str,
    payload: &[u8],
    now: DateTime<Utc>,
) -> Result<Vec<u8>, ConfigDriveError> {
    let label = normalize_label(label)?;
    let size = u32::try_from(payload.len())
        .map_err(|_| ConfigDriveError::PayloadTooLarge(payload.len()))?;

    let data_sectors = size.div_ceil(SECTOR_SIZE as u32);
    let total_sectors = DATA_SECTOR + data_sectors;

    let mut image = vec![0u8; total_sectors as usize * SECTOR_SIZE];

    write_primary_descriptor(sector_mut(&mut image, PVD_SECTOR), &label, total_sectors, now);
    write_terminator(sector_mut(&mut image, TERMINATOR_SECTOR));
    write_path_table(sector_mut(&mut image, L_PATH_TABLE_SECTOR), Endian::Little);
    write_path_table(sector_mut(&mut image, M_PATH_TABLE_SECTOR), Endian::Big);
    write_root_directory(sector_mut(&mut image, ROOT_DIR_SECTOR), &label, size, now);

    let data_start = DATA_SECTOR as usize * SECTOR_SIZE;
    image[data_start..data_start + payload.len()].copy_from_slice(payload);

    Ok(image)
}

/// Truncate to [`MAX_LABEL_LEN`] and check the d-character set.
fn normalize_label(label: &str) -> Result<String, ConfigDriveError> {
    let truncated: String = label.chars().take(MAX_LABEL_LEN).collect();
    let valid = !truncated.is_empty()
        && truncated
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '.');
    if !valid {
        return Err(ConfigDriveError::InvalidLabel(label.to_string()));
    }
    Ok(truncated)
}

fn sector_mut(image: &mut [u8], sector: u32) -> &mut [u8] {
    let start = sector as usize * SECTOR_SIZE;
    &mut image[start..start + SECTOR_SIZE]
}

// ---------------------------------------------------------------------------
// Field writers
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Endian {
    Little,
    Big,
}

fn put_both_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    buf[offset + 2..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn put_both_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    buf[offset + 4..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// Space-padded fixed-width string field.
fn put_str(buf: &mut [u8], offset: usize, width: usize, value: &str) {
    let field = &mut buf[offset..offset + width];
    field.fill(b' ');
    let bytes = value.as_bytes();
    let n = bytes.len().min(width);
    field[..n].copy_from_slice(&bytes[..n]);
}

/// 17-byte "dec-datetime": 16 ASCII digits then a GMT offset byte.
fn put_dec_datetime(buf: &mut [u8], offset: usize, at: Option<DateTime<Utc>>) {
    let digits = match at {
        Some(t) => format!(
            "{:04}{:02}{:02}{:02}{:02}{:02}00",
            t.year(),
            t.month(),
            t.day(),
            t.hour(),
            t.minute(),
            t.second()
        ),
        None => "0".repeat(16),
    };
    buf[offset..offset + 16].copy_from_slice(digits.as_bytes());
    buf[offset + 16] = 0;
}

/// 7-byte directory record timestamp.
fn record_datetime(t: DateTime<Utc>) -> [u8; 7] {
    [
        u8::try_from(t.year() - 1900).unwrap_or(0),
        t.month() as u8,
        t.day() as u8,
        t.hour() as u8,
        t.minute() as u8,
        t.second() as u8,
        0,
    ]
}

/// Write one directory record at `offset`, returning its padded length.
fn put_dir_record(
    buf: &mut [u8],
    offset: usize,
    identifier: &[u8],
    extent: u32,
    size: u32,
    flags: u8,
    at: DateTime<Utc>,
) -> usize {
    let mut len = 33 + identifier.len();
    if len % 2 == 1 {
        len += 1;
    }

    let rec = &mut buf[offset..offset + len];
    rec[0] = len as u8;
    rec[1] = 0;
    put_both_u32(rec, 2, extent);
    put_both_u32(rec, 10, size);
    rec[18..25].copy_from_slice(&record_datetime(at));
    rec[25] = flags;
    rec[26] = 0;
    rec[27] = 0;
    put_both_u16(rec, 28, 1);
    rec[32] = identifier.len() as u8;
    rec[33..33 + identifier.len()].copy_from_slice(identifier);
    len
}

fn write_primary_descriptor(s: &mut [u8], label: &str, total_sectors: u32, now: DateTime<Utc>) {
    s[0] = 1;
    s[1..6].copy_from_slice(STANDARD_ID);
    s[6] = 1;
    put_str(s, 8, 32, "");
    put_str(s, 40, 32, label);
    put_both_u32(s, 80, total_sectors);
    put_both_u16(s, 120, 1);
    put_both_u16(s, 124, 1);
    put_both_u16(s, 128, SECTOR_SIZE as u16);
    put_both_u32(s, 132, PATH_TABLE_SIZE);
    s[140..144].copy_from_slice(&L_PATH_TABLE_SECTOR.to_le_bytes());
    s[148..152].copy_from_slice(&M_PATH_TABLE_SECTOR.to_be_bytes());

    let root_len = put_dir_record(
        s,
        156,
        &[0],
        ROOT_DIR_SECTOR,
        SECTOR_SIZE as u32,
        FLAG_DIRECTORY,
        now,
    );
    debug_assert_eq!(root_len, ROOT_RECORD_LEN);

    put_str(s, 190, 128, ""); // volume set
    put_str(s, 318, 128, ""); // publisher
    put_str(s, 446, 128, ""); // data preparer
    put_str(s, 574, 128, ""); // application
    put_str(s, 702, 37, ""); // copyright file
    put_str(s, 739, 37, ""); // abstract file
    put_str(s, 776, 37, ""); // bibliographic file
    put_dec_datetime(s, 813, Some(now));
    put_dec_datetime(s, 830, Some(now));
    put_dec_datetime(s, 847, None);
    put_dec_datetime(s, 864, None);
    s[881] = 1;
}

fn write_terminator(s: &mut [u8]) {
    s[0] = 0xFF;
    s[1..6].copy_from_slice(STANDARD_ID);
    s[6] = 1;
}

fn write_path_table(s: &mut [u8], endian: Endian) {
    s[0] = 1; // identifier length
    s[1] = 0;
    match endian {
        Endian::Little => {
            s[2..6].copy_from_slice(&ROOT_DIR_SECTOR.to_le_bytes());
            s[6..8].copy_from_slice(&1u16.to_le_bytes());
        }
        Endian::Big => {
            s[2..6].copy_from_slice(&ROOT_DIR_SECTOR.to_be_bytes());
            s[6..8].copy_from_slice(&1u16.to_be_bytes());
        }
    }
    s[8] = 0;
    s[9] = 0;
}

fn write_root_directory(s: &mut [u8], label: &str, size: u32, now: DateTime<Utc>) {
    let dir_size = SECTOR_SIZE as u32;
    let mut offset = 0;
    offset += put_dir_record(s, offset, &[0], ROOT_DIR_SECTOR, dir_size, FLAG_DIRECTORY, now);
    offset += put_dir_record(s, offset, &[1], ROOT_DIR_SECTOR, dir_size, FLAG_DIRECTORY, now);
    put_dir_record(s, offset, label.as_bytes(), DATA_SECTOR, size, 0, now);
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Contents of an image produced by [`encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub label: String,
    pub file_name: String,
    pub payload: Vec<u8>,
}

/// Read back the volume label and the single root file.
pub fn decode(image: &[u8]) -> Result<Decoded, ConfigDriveError> {
    let malformed = |msg: &str| ConfigDriveError::Malformed(msg.to_string());

    if image.len() < (SYSTEM_AREA_SECTORS as usize + 2) * SECTOR_SIZE {
        return Err(malformed("image shorter than the descriptor area"));
    }
    let pvd = sector(image, PVD_SECTOR).ok_or_else(|| malformed("missing descriptor"))?;
    if pvd[0] != 1 || &pvd[1..6] != STANDARD_ID {
        return Err(malformed("no primary volume descriptor at sector 16"));
    }

    let label = String::from_utf8_lossy(&pvd[40..72]).trim_end().to_string();
    let total = read_both_u32(pvd, 80)?;
    if total as usize * SECTOR_SIZE > image.len() {
        return Err(malformed("volume size exceeds image length"));
    }

    let root_extent = read_both_u32(pvd, 156 + 2)?;
    let root = sector(image, root_extent).ok_or_else(|| malformed("root extent out of range"))?;

    let mut offset = 0;
    while offset < SECTOR_SIZE {
        let len = root[offset] as usize;
        if len == 0 {
            break;
        }
        if offset + len > SECTOR_SIZE || len < 34 {
            return Err(malformed("directory record overruns the sector"));
        }
        let rec = &root[offset..offset + len];
        let id_len = rec[32] as usize;
        let id = rec
            .get(33..33 + id_len)
            .ok_or_else(|| malformed("identifier overruns the record"))?;

        if rec[25] & FLAG_DIRECTORY == 0 {
            let extent = read_both_u32(rec, 2)? as usize;
            let size = read_both_u32(rec, 10)? as usize;
            let start = extent * SECTOR_SIZE;
            let payload = image
                .get(start..start + size)
                .ok_or_else(|| malformed("file extent out of range"))?;
            return Ok(Decoded {
                label,
                file_name: String::from_utf8_lossy(id).into_owned(),
                payload: payload.to_vec(),
            });
        }
        offset += len;
    }

    Err(malformed("root directory holds no file"))
}

fn sector(image: &[u8], n: u32) -> Option<&[u8]> {
    let start = n as usize * SECTOR_SIZE;
    image.get(start..start + SECTOR_SIZE)
}

fn read_both_u32(buf: &[u8], offset: usize) -> Result<u32, ConfigDriveError> {
    let mut le = [0u8; 4];
    let mut be = [0u8; 4];
    le.copy_from_slice(&buf[offset..offset + 4]);
    be.copy_from_slice(&buf[offset + 4..offset + 8]);
    let (le, be) = (u32::from_le_bytes(le), u32::from_be_bytes(be));
    if le != be {
        return Err(ConfigDriveError::Malformed(format!(
            "both-endian field at {offset} disagrees ({le} vs {be})"
        )));
    }
    Ok(le)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

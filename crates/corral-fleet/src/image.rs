//! Intel HEX to binary image conversion.
//!
//! Firmware uploads arrive either as raw binary or as Intel HEX records.
//! Devices flash raw binary, so HEX payloads are converted to a contiguous
//! image before checksumming and storage: the image spans the lowest to the
//! highest addressed byte, with interior gaps filled with `0xFF` (erased
//! flash). The conversion is deterministic — the same records always produce
//! the same image.

use crate::error::{FleetError, FleetResult};

/// Record type: data bytes at an address.
const TYPE_DATA: u8 = 0x00;
/// Record type: end of file.
const TYPE_EOF: u8 = 0x01;
/// Record type: extended segment address (bits 4..=19 of the base).
const TYPE_EXT_SEGMENT: u8 = 0x02;
/// Record type: start segment address (CS:IP); carries no image data.
const TYPE_START_SEGMENT: u8 = 0x03;
/// Record type: extended linear address (upper 16 bits of the base).
const TYPE_EXT_LINEAR: u8 = 0x04;
/// Record type: start linear address (EIP); carries no image data.
const TYPE_START_LINEAR: u8 = 0x05;

/// Fill byte for unaddressed gaps inside the image.
const GAP_FILL: u8 = 0xFF;

/// Upper bound on the assembled image size. A sparse HEX file can address
/// the full 32-bit space; no real firmware for this fleet comes close.
const MAX_IMAGE_BYTES: u64 = 64 * 1024 * 1024;

/// Convert Intel HEX source text into a contiguous binary image.
///
/// Start-address records are accepted and ignored; they describe the entry
/// point, not image contents. Input with no data records yields an empty
/// image. Records after an EOF record are rejected.
pub fn binary_image(source: &str) -> FleetResult<Vec<u8>> {
    let mut base: u32 = 0;
    let mut chunks: Vec<(u32, Vec<u8>)> = Vec::new();
    let mut seen_eof = false;

    for (line_no, line) in source.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if seen_eof {
            return Err(malformed(line_no, "record after end-of-file record"));
        }

        let record = parse_record(line).map_err(|detail| malformed(line_no, &detail))?;

        match record.record_type {
            TYPE_DATA => {
                let address = base + u32::from(record.offset);
                chunks.push((address, record.data));
            }
            TYPE_EOF => seen_eof = true,
            TYPE_EXT_SEGMENT => {
                base = u32::from(address_field(&record, line_no)?) << 4;
            }
            TYPE_EXT_LINEAR => {
                base = u32::from(address_field(&record, line_no)?) << 16;
            }
            TYPE_START_SEGMENT | TYPE_START_LINEAR => {}
            other => {
                return Err(malformed(line_no, &format!("unknown record type {other:#04x}")));
            }
        }
    }

    assemble(chunks)
}

struct Record {
    offset: u16,
    record_type: u8,
    data: Vec<u8>,
}

fn malformed(line_no: usize, detail: &str) -> FleetError {
    FleetError::Serialisation(format!("malformed hex record on line {}: {detail}", line_no + 1))
}

/// Parse one `:LLAAAATT[DD..]CC` record and verify its checksum.
fn parse_record(line: &str) -> Result<Record, String> {
    let body = line
        .strip_prefix(':')
        .ok_or_else(|| "missing ':' start code".to_owned())?;

    if !body.is_ascii() {
        return Err("invalid hex digit".to_owned());
    }
    if body.len() % 2 != 0 {
        return Err("odd number of hex digits".to_owned());
    }
    let bytes: Vec<u8> = (0..body.len() / 2)
        .map(|i| u8::from_str_radix(&body[i * 2..i * 2 + 2], 16))
        .collect::<Result<_, _>>()
        .map_err(|_| "invalid hex digit".to_owned())?;

    // length + offset(2) + type + checksum
    if bytes.len() < 5 {
        return Err("record too short".to_owned());
    }

    let length = usize::from(bytes[0]);
    if bytes.len() != length + 5 {
        return Err(format!(
            "length field says {length} data bytes, record has {}",
            bytes.len() - 5
        ));
    }

    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        return Err("checksum mismatch".to_owned());
    }

    Ok(Record {
        offset: u16::from_be_bytes([bytes[1], bytes[2]]),
        record_type: bytes[3],
        data: bytes[4..4 + length].to_vec(),
    })
}

/// Extract the 16-bit payload of an extended-address record.
fn address_field(record: &Record, line_no: usize) -> FleetResult<u16> {
    let data: [u8; 2] = record
        .data
        .as_slice()
        .try_into()
        .map_err(|_| malformed(line_no, "extended address record must carry 2 bytes"))?;
    Ok(u16::from_be_bytes(data))
}

/// Lay data chunks into a single image from the lowest to the highest
/// addressed byte, later records overwriting earlier ones.
fn assemble(chunks: Vec<(u32, Vec<u8>)>) -> FleetResult<Vec<u8>> {
    let Some(start) = chunks
        .iter()
        .filter(|(_, data)| !data.is_empty())
        .map(|(addr, _)| *addr)
        .min()
    else {
        return Ok(Vec::new());
    };

    let end = chunks
        .iter()
        .filter(|(_, data)| !data.is_empty())
        .map(|(addr, data)| u64::from(*addr) + data.len() as u64)
        .max()
        .unwrap_or(u64::from(start));

    let size = end - u64::from(start);
    if size > MAX_IMAGE_BYTES {
        return Err(FleetError::Serialisation(format!(
            "hex records span {size} bytes, more than the {MAX_IMAGE_BYTES} byte limit"
        )));
    }

    let mut image = vec![GAP_FILL; size as usize];
    for (addr, data) in chunks {
        if data.is_empty() {
            continue;
        }
        let from = (addr - start) as usize;
        image[from..from + data.len()].copy_from_slice(&data);
    }
    Ok(image)
}

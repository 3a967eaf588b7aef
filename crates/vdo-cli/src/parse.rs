#![forbid(unsafe_code)]
//! Size and memory-class parsing for the CLI.

use vdo_error::{Result, VdoError};
use vdo_geometry::IndexMemoryClass;
use vdo_types::VDO_BLOCK_SIZE_U64;

/// Binary exponent of a size-unit code. Each successive code is another
/// factor of 2^10 bytes.
fn binary_exponent(unit_code: char) -> Option<u32> {
    match unit_code.to_ascii_uppercase() {
        'B' => Some(0),
        'K' => Some(10),
        'M' => Some(20),
        'G' => Some(30),
        'T' => Some(40),
        'P' => Some(50),
        _ => None,
    }
}

/// Parse a size string such as `"10G"` into bytes.
///
/// Without a unit, SI mode reads bytes and LVM mode reads megabytes.
/// Scaling is overflow-checked.
pub fn parse_size(arg: &str, lvm_mode: bool) -> Result<u64> {
    let digits_end = arg
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit())
        .map_or(arg.len(), |(index, _)| index);
    let (digits, suffix) = arg.split_at(digits_end);

    let size: u64 = digits
        .parse()
        .map_err(|_| VdoError::OutOfRange(format!("invalid size '{arg}'")))?;

    let mut suffix_chars = suffix.chars();
    let exponent = match (suffix_chars.next(), suffix_chars.next()) {
        // No units: SI mode defaults to bytes, LVM mode to megabytes.
        (None, _) => {
            if lvm_mode {
                20
            } else {
                0
            }
        }
        (Some(code), None) => binary_exponent(code)
            .ok_or_else(|| VdoError::OutOfRange(format!("invalid size unit '{code}'")))?,
        _ => {
            return Err(VdoError::OutOfRange(format!("invalid size '{arg}'")));
        }
    };

    let scaled = size
        .checked_shl(exponent)
        .filter(|scaled| scaled >> exponent == size)
        .ok_or_else(|| VdoError::OutOfRange(format!("size '{arg}' overflows")))?;
    Ok(scaled)
}

/// Parse a size string into whole blocks.
pub fn parse_size_blocks(arg: &str, lvm_mode: bool) -> Result<u64> {
    let bytes = parse_size(arg, lvm_mode)?;
    if bytes % VDO_BLOCK_SIZE_U64 != 0 {
        return Err(VdoError::OutOfRange(format!(
            "size '{arg}' is not a multiple of the {VDO_BLOCK_SIZE_U64}-byte block size"
        )));
    }
    Ok(bytes / VDO_BLOCK_SIZE_U64)
}

/// Parse an index memory size: `0.25`, `0.5`, `0.75`, or a gigabyte
/// count.
pub fn parse_mem(arg: &str) -> Result<IndexMemoryClass> {
    match arg {
        "0.25" => Ok(IndexMemoryClass::Mem256Mb),
        "0.5" => Ok(IndexMemoryClass::Mem512Mb),
        "0.75" => Ok(IndexMemoryClass::Mem768Mb),
        _ => {
            let gigabytes: u32 = arg
                .parse()
                .map_err(|_| VdoError::OutOfRange(format!("invalid index memory '{arg}'")))?;
            IndexMemoryClass::gigabytes(gigabytes)
        }
    }
}

#![forbid(unsafe_code)]
//! Header and checksum codecs shared by all versioned VDO metadata.
//!
//! Every on-disk record carries a 16-byte header `{id, major, minor,
//! size}`, little-endian. Decoding validates the component id, the
//! version tuple, and the declared size before any payload is trusted.
//! Block checksums are CRC-32C (Castagnoli, reflected, init and xorout
//! `0xFFFFFFFF`), covering the bytes that follow the checksum field.

use vdo_error::{Result, VdoError};
use vdo_types::{CURRENT_RELEASE_VERSION, put_le_u32, read_le_u32};

/// Encoded size of a component header.
pub const ENCODED_HEADER_SIZE: usize = 16;

/// The registry of component ids used in headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentId {
    SuperBlock = 0,
    FixedLayout = 1,
    RecoveryJournal = 2,
    SlabDepot = 3,
    BlockMap = 4,
    GeometryBlock = 5,
}

impl ComponentId {
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// A two-part version number for versioned on-disk structures.
///
/// A format change needing no upgrade step bumps the minor version; an
/// incompatible change bumps the major version and resets the minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionNumber {
    pub major: u32,
    pub minor: u32,
}

impl VersionNumber {
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

/// The header prefix carried by every versioned record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: ComponentId,
    pub version: VersionNumber,
    pub size: u32,
}

impl Header {
    pub fn encode_into(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        put_le_u32(buf, offset, self.id.as_u32())?;
        put_le_u32(buf, offset + 4, self.version.major)?;
        put_le_u32(buf, offset + 8, self.version.minor)?;
        put_le_u32(buf, offset + 12, self.size)?;
        Ok(())
    }

    /// Decode a header, validating it against `expected`.
    ///
    /// Field order of failure matters: a wrong component id reports
    /// `IncorrectComponent`, a wrong version `UnsupportedVersion`, and a
    /// wrong size `BadLength`, so callers can gate versions before any
    /// checksum is consulted.
    pub fn decode_validated(
        buf: &[u8],
        offset: usize,
        expected: &Header,
        component: &'static str,
    ) -> Result<Header> {
        let id = read_le_u32(buf, offset)?;
        let major = read_le_u32(buf, offset + 4)?;
        let minor = read_le_u32(buf, offset + 8)?;
        let size = read_le_u32(buf, offset + 12)?;

        if id != expected.id.as_u32() {
            return Err(VdoError::IncorrectComponent {
                expected: expected.id.as_u32(),
                actual: id,
            });
        }
        if major != expected.version.major || minor > expected.version.minor {
            return Err(VdoError::UnsupportedVersion {
                component,
                major,
                minor,
            });
        }
        if size != expected.size {
            return Err(VdoError::BadLength {
                component,
                declared: size as usize,
                actual: expected.size as usize,
            });
        }

        Ok(Header {
            id: expected.id,
            version: VersionNumber::new(major, minor),
            size,
        })
    }
}

/// Validate that two version tuples match exactly.
///
/// The super block uses this strict gate: only the exact (major, minor)
/// pairs in the recognised table load.
pub fn validate_version_exact(
    expected: VersionNumber,
    actual: VersionNumber,
    component: &'static str,
) -> Result<()> {
    if expected != actual {
        return Err(VdoError::UnsupportedVersion {
            component,
            major: actual.major,
            minor: actual.minor,
        });
    }
    Ok(())
}

/// Validate a release version against the recognised table.
pub fn validate_release_version(version: u32) -> Result<()> {
    if version != CURRENT_RELEASE_VERSION {
        return Err(VdoError::UnsupportedVersion {
            component: "release version",
            major: version,
            minor: 0,
        });
    }
    Ok(())
}

/// CRC-32C over a metadata region.
#[must_use]
pub fn block_checksum(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}

/// Check a stored checksum against the covered region.
pub fn verify_checksum(stored: u32, covered: &[u8]) -> Result<()> {
    let computed = block_checksum(covered);
    if stored != computed {
        return Err(VdoError::BadChecksum { stored, computed });
    }
    Ok(())
}

/// Require an exact buffer length before decoding a block-sized record.
pub fn require_block_len(buf: &[u8], len: usize, component: &'static str) -> Result<()> {
    if buf.len() != len {
        return Err(VdoError::BadLength {
            component,
            declared: len,
            actual: buf.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GEOMETRY_HEADER: Header = Header {
        id: ComponentId::GeometryBlock,
        version: VersionNumber::new(5, 0),
        size: 84,
    };

    #[test]
    fn header_round_trip() {
        let mut buf = [0_u8; ENCODED_HEADER_SIZE];
        GEOMETRY_HEADER.encode_into(&mut buf, 0).expect("encode");
        let decoded = Header::decode_validated(&buf, 0, &GEOMETRY_HEADER, "geometry")
            .expect("decode");
        assert_eq!(decoded, GEOMETRY_HEADER);
    }

    #[test]
    fn wrong_component_id() {
        let mut buf = [0_u8; ENCODED_HEADER_SIZE];
        let wrong = Header {
            id: ComponentId::SlabDepot,
            ..GEOMETRY_HEADER
        };
        wrong.encode_into(&mut buf, 0).expect("encode");
        assert!(matches!(
            Header::decode_validated(&buf, 0, &GEOMETRY_HEADER, "geometry"),
            Err(VdoError::IncorrectComponent {
                expected: 5,
                actual: 3
            })
        ));
    }

    #[test]
    fn major_mismatch_is_unsupported() {
        let mut buf = [0_u8; ENCODED_HEADER_SIZE];
        let future = Header {
            version: VersionNumber::new(6, 0),
            ..GEOMETRY_HEADER
        };
        future.encode_into(&mut buf, 0).expect("encode");
        assert!(matches!(
            Header::decode_validated(&buf, 0, &GEOMETRY_HEADER, "geometry"),
            Err(VdoError::UnsupportedVersion { major: 6, .. })
        ));
    }

    #[test]
    fn newer_minor_is_unsupported_but_older_loads() {
        let expected = Header {
            version: VersionNumber::new(5, 2),
            ..GEOMETRY_HEADER
        };

        let mut buf = [0_u8; ENCODED_HEADER_SIZE];
        let newer = Header {
            version: VersionNumber::new(5, 3),
            ..GEOMETRY_HEADER
        };
        newer.encode_into(&mut buf, 0).expect("encode");
        assert!(matches!(
            Header::decode_validated(&buf, 0, &expected, "geometry"),
            Err(VdoError::UnsupportedVersion { major: 5, minor: 3, .. })
        ));

        let older = Header {
            version: VersionNumber::new(5, 1),
            ..GEOMETRY_HEADER
        };
        older.encode_into(&mut buf, 0).expect("encode");
        let decoded =
            Header::decode_validated(&buf, 0, &expected, "geometry").expect("older minor");
        assert_eq!(decoded.version, VersionNumber::new(5, 1));
    }

    #[test]
    fn size_mismatch_is_bad_length() {
        let mut buf = [0_u8; ENCODED_HEADER_SIZE];
        let resized = Header {
            size: 80,
            ..GEOMETRY_HEADER
        };
        resized.encode_into(&mut buf, 0).expect("encode");
        assert!(matches!(
            Header::decode_validated(&buf, 0, &GEOMETRY_HEADER, "geometry"),
            Err(VdoError::BadLength {
                declared: 80,
                actual: 84,
                ..
            })
        ));
    }

    #[test]
    fn exact_version_gate() {
        let v12 = VersionNumber::new(12, 0);
        assert!(validate_version_exact(v12, v12, "super block").is_ok());
        assert!(matches!(
            validate_version_exact(v12, VersionNumber::new(12, 1), "super block"),
            Err(VdoError::UnsupportedVersion { .. })
        ));
        assert!(matches!(
            validate_version_exact(v12, VersionNumber::new(11, 0), "super block"),
            Err(VdoError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn release_version_table() {
        assert!(validate_release_version(CURRENT_RELEASE_VERSION).is_ok());
        assert!(matches!(
            validate_release_version(CURRENT_RELEASE_VERSION + 1),
            Err(VdoError::UnsupportedVersion { .. })
        ));
    }

    // CRC-32C (Castagnoli) pinned vectors: the standard check value for
    // "123456789" and the empty string.
    #[test]
    fn crc32c_known_vectors() {
        assert_eq!(block_checksum(b"123456789"), 0xE306_9283);
        assert_eq!(block_checksum(b""), 0);
    }

    #[test]
    fn verify_checksum_reports_both_values() {
        let covered = b"some metadata payload";
        let good = block_checksum(covered);
        assert!(verify_checksum(good, covered).is_ok());
        match verify_checksum(good ^ 1, covered) {
            Err(VdoError::BadChecksum { stored, computed }) => {
                assert_eq!(stored, good ^ 1);
                assert_eq!(computed, good);
            }
            other => panic!("expected BadChecksum, got {other:?}"),
        }
    }
}

//! Fixed-size header and trailer framing.
//!
//! The header occupies the first [`HEADER_SIZE`] bytes of an archive, the
//! trailer the last [`TRAILER_SIZE`]. Both carry the magic, and both record
//! the metadata region's location so an archive can be recognized and opened
//! from either end. All integers are little-endian.
//!
//! ```text
//! Header layout:                     Trailer layout:
//!   0..8   magic                       0..8   magic
//!   8..10  version (u16)               8..16  metadata_offset (u64)
//!  10..12  flags (u16)                16..24  metadata_len (u64)
//!  12..20  metadata_offset (u64)      24..32  reserved (zeros)
//!  20..28  metadata_len (u64)
//!  28..36  content_offset (u64)
//!  36..52  metadata_digest (16 bytes)
//!  52..64  reserved (zeros)
//! ```

use clip_common::hash::ContentHasher;

use crate::error::FormatError;

/// Magic bytes at both ends of every archive.
pub const MAGIC: [u8; 8] = *b"CLIP\x00\x01\x00\x00";

/// Current format version.
pub const FORMAT_VERSION: u16 = 1;

/// Encoded header size in bytes.
pub const HEADER_SIZE: usize = 64;

/// Encoded trailer size in bytes.
pub const TRAILER_SIZE: usize = 32;

/// The archive header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipHeader {
    pub version: u16,
    pub flags: u16,
    /// Absolute byte offset of the metadata region.
    pub metadata_offset: u64,
    /// Length of the metadata region in bytes.
    pub metadata_len: u64,
    /// Absolute byte offset of the content region.
    pub content_offset: u64,
    /// XXH3-128 digest of the metadata region bytes.
    pub metadata_digest: [u8; 16],
}

impl ClipHeader {
    /// Encode into the fixed wire representation.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf: [u8; HEADER_SIZE] = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..10].copy_from_slice(&self.version.to_le_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.metadata_offset.to_le_bytes());
        buf[20..28].copy_from_slice(&self.metadata_len.to_le_bytes());
        buf[28..36].copy_from_slice(&self.content_offset.to_le_bytes());
        buf[36..52].copy_from_slice(&self.metadata_digest);
        buf
    }

    /// Decode and validate a header.
    ///
    /// # Errors
    /// `CorruptArchive` on short input, magic mismatch, or an unsupported
    /// version.
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_SIZE {
            return Err(FormatError::corrupt(format!(
                "header truncated: {} bytes",
                buf.len()
            )));
        }
        if buf[0..8] != MAGIC {
            return Err(FormatError::corrupt("bad magic bytes"));
        }

        let version: u16 = u16::from_le_bytes([buf[8], buf[9]]);
        if version != FORMAT_VERSION {
            return Err(FormatError::corrupt(format!(
                "unsupported format version {}",
                version
            )));
        }

        let mut metadata_digest: [u8; 16] = [0u8; 16];
        metadata_digest.copy_from_slice(&buf[36..52]);

        Ok(Self {
            version,
            flags: u16::from_le_bytes([buf[10], buf[11]]),
            metadata_offset: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            metadata_len: u64::from_le_bytes(buf[20..28].try_into().unwrap()),
            content_offset: u64::from_le_bytes(buf[28..36].try_into().unwrap()),
            metadata_digest,
        })
    }

    /// Stable identity of the archive, used to key block cache entries.
    ///
    /// A digest of the encoded header: two archives with identical bytes
    /// share an identity, and any change to the metadata region changes it.
    pub fn archive_id(&self) -> String {
        let mut hasher: ContentHasher = ContentHasher::new();
        hasher.update(&self.encode());
        hasher.finish_hex()
    }

    /// Length of the content region.
    pub fn content_len(&self) -> u64 {
        self.metadata_offset.saturating_sub(self.content_offset)
    }

    /// Check that the recorded offsets describe an archive of exactly
    /// `archive_len` bytes.
    ///
    /// # Errors
    /// `CorruptArchive` if any region falls outside the archive or the
    /// regions do not tile it.
    pub fn validate_bounds(&self, archive_len: u64) -> Result<(), FormatError> {
        if self.content_offset != HEADER_SIZE as u64 {
            return Err(FormatError::corrupt("content region does not follow header"));
        }
        if self.metadata_offset < self.content_offset {
            return Err(FormatError::corrupt("metadata region overlaps content"));
        }
        let end: u64 = self
            .metadata_offset
            .checked_add(self.metadata_len)
            .and_then(|v: u64| v.checked_add(TRAILER_SIZE as u64))
            .ok_or_else(|| FormatError::corrupt("metadata offsets overflow"))?;
        if end != archive_len {
            return Err(FormatError::corrupt(format!(
                "metadata region out of range: ends at {}, archive is {} bytes",
                end, archive_len
            )));
        }
        Ok(())
    }
}

/// The archive trailer: magic plus a repeat of the metadata location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipTrailer {
    pub metadata_offset: u64,
    pub metadata_len: u64,
}

impl ClipTrailer {
    pub fn encode(&self) -> [u8; TRAILER_SIZE] {
        let mut buf: [u8; TRAILER_SIZE] = [0u8; TRAILER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..16].copy_from_slice(&self.metadata_offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.metadata_len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < TRAILER_SIZE {
            return Err(FormatError::corrupt(format!(
                "trailer truncated: {} bytes",
                buf.len()
            )));
        }
        if buf[0..8] != MAGIC {
            return Err(FormatError::corrupt("bad trailer magic bytes"));
        }
        Ok(Self {
            metadata_offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            metadata_len: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        })
    }

    /// Check agreement with the header's metadata location.
    pub fn matches(&self, header: &ClipHeader) -> bool {
        self.metadata_offset == header.metadata_offset && self.metadata_len == header.metadata_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> ClipHeader {
        ClipHeader {
            version: FORMAT_VERSION,
            flags: 0,
            metadata_offset: 4096,
            metadata_len: 512,
            content_offset: HEADER_SIZE as u64,
            metadata_digest: [7u8; 16],
        }
    }

    #[test]
    fn test_header_round_trip() {
        let header: ClipHeader = sample_header();
        let decoded: ClipHeader = ClipHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut buf: [u8; HEADER_SIZE] = sample_header().encode();
        buf[0] = b'X';
        assert!(matches!(
            ClipHeader::decode(&buf),
            Err(FormatError::CorruptArchive { .. })
        ));
    }

    #[test]
    fn test_header_rejects_unknown_version() {
        let mut buf: [u8; HEADER_SIZE] = sample_header().encode();
        buf[8..10].copy_from_slice(&99u16.to_le_bytes());
        assert!(matches!(
            ClipHeader::decode(&buf),
            Err(FormatError::CorruptArchive { .. })
        ));
    }

    #[test]
    fn test_header_rejects_truncation() {
        let buf: [u8; HEADER_SIZE] = sample_header().encode();
        assert!(ClipHeader::decode(&buf[..10]).is_err());
    }

    #[test]
    fn test_trailer_round_trip() {
        let trailer: ClipTrailer = ClipTrailer {
            metadata_offset: 4096,
            metadata_len: 512,
        };
        let decoded: ClipTrailer = ClipTrailer::decode(&trailer.encode()).unwrap();
        assert_eq!(decoded, trailer);
        assert!(decoded.matches(&sample_header()));
    }

    #[test]
    fn test_trailer_disagreement() {
        let trailer: ClipTrailer = ClipTrailer {
            metadata_offset: 8192,
            metadata_len: 512,
        };
        assert!(!trailer.matches(&sample_header()));
    }

    #[test]
    fn test_archive_id_tracks_digest() {
        let a: ClipHeader = sample_header();
        let mut b: ClipHeader = sample_header();
        b.metadata_digest = [8u8; 16];
        assert_ne!(a.archive_id(), b.archive_id());
        assert_eq!(a.archive_id(), sample_header().archive_id());
    }
}

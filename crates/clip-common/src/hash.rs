//! Content digest computation.
//!
//! All content addressing in clip uses XXH3-128: file content hashes in the
//! node index, the metadata-region digest in the archive header, and the
//! archive identity used to key block cache entries.

use std::io::Read;
use std::path::Path;

use xxhash_rust::xxh3::Xxh3;

/// Compute the XXH3-128 digest of a byte slice.
///
/// # Returns
/// 32-character lowercase hex string (128 bits).
pub fn hash_bytes(data: &[u8]) -> String {
    let digest: u128 = xxhash_rust::xxh3::xxh3_128(data);
    format!("{:032x}", digest)
}

/// Compute the XXH3-128 digest of a file, reading it in chunks.
///
/// # Errors
/// Returns the underlying error if the file cannot be read.
pub fn hash_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file: std::fs::File = std::fs::File::open(path)?;
    let mut hasher: ContentHasher = ContentHasher::new();
    let mut buffer: Vec<u8> = vec![0u8; 64 * 1024];

    loop {
        let n: usize = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finish_hex())
}

/// Streaming XXH3-128 hasher.
///
/// The archiver feeds file bytes through this while copying them into the
/// content region, so content hashes come for free with the write.
pub struct ContentHasher {
    inner: Xxh3,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self { inner: Xxh3::new() }
    }

    /// Feed additional bytes into the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalize as a raw 16-byte little-endian digest.
    ///
    /// Used for the fixed-width digest field in the archive header.
    pub fn finish_bytes(&self) -> [u8; 16] {
        self.inner.digest128().to_le_bytes()
    }

    /// Finalize as a 32-character lowercase hex string.
    pub fn finish_hex(&self) -> String {
        format!("{:032x}", self.inner.digest128())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}

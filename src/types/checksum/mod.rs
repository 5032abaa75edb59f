#![forbid(unsafe_code)]

/// Incremental checksum over a sequence of byte slices.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

/// CRC-32 (IEEE) backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum of a heap page image, bound to the relation and block it belongs
/// to so that a page written to the wrong place fails verification.
pub fn page_crc32(rel: u32, block: u32, image: &[u8]) -> u32 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&rel.to_be_bytes());
    hasher.update(&block.to_be_bytes());
    hasher.update(image);
    hasher.finalize()
}

/// Checksum over several disjoint slices, used for log frames.
pub fn crc32_of(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

//! Per-mount configuration.

use clip_common::DEFAULT_KERNEL_TTL_SECS;

/// Options controlling one mount.
///
/// # Example
///
/// ```ignore
/// let options = MountOptions::default().with_verbose(true);
/// let vfs = ClipVfs::new(backend, Some(cache), options)?;
/// ```
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Log every kernel operation at debug level.
    pub verbose: bool,
    /// How long the kernel may cache attributes (seconds).
    pub attr_ttl_secs: u64,
    /// How long the kernel may cache entry lookups (seconds).
    pub entry_ttl_secs: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            attr_ttl_secs: DEFAULT_KERNEL_TTL_SECS,
            entry_ttl_secs: DEFAULT_KERNEL_TTL_SECS,
        }
    }
}

impl MountOptions {
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set both kernel cache timeouts.
    ///
    /// The archive never changes under the kernel, so long timeouts only
    /// reduce redundant `getattr`/`lookup` traffic.
    pub fn with_kernel_ttl(mut self, secs: u64) -> Self {
        self.attr_ttl_secs = secs;
        self.entry_ttl_secs = secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options: MountOptions = MountOptions::default();
        assert!(!options.verbose);
        assert_eq!(options.attr_ttl_secs, 60);
        assert_eq!(options.entry_ttl_secs, 60);
    }

    #[test]
    fn test_builder() {
        let options: MountOptions = MountOptions::default()
            .with_verbose(true)
            .with_kernel_ttl(600);
        assert!(options.verbose);
        assert_eq!(options.attr_ttl_secs, 600);
        assert_eq!(options.entry_ttl_secs, 600);
    }
}

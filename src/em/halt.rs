//! Cooperative cancellation, checked once per iteration.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Asks a running training loop to stop after the current iteration.
///
/// Halting is requested either through the shared flag or by creating the
/// sentinel file, if one is configured. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct HaltSignal {
    flag: Arc<AtomicBool>,
    sentinel: Option<PathBuf>,
}

impl HaltSignal {
    /// A signal that only responds to [`HaltSignal::request`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Also halt when `path` exists.
    pub fn with_sentinel(mut self, path: impl AsRef<Path>) -> Self {
        self.sentinel = Some(path.as_ref().to_path_buf());
        self
    }

    /// Request a halt.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Clear a previous request.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// Whether a halt has been requested.
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.sentinel.as_deref().is_some_and(Path::exists)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_flag() {
        let a = HaltSignal::new();
        let b = a.clone();
        assert!(!b.is_requested());
        a.request();
        assert!(b.is_requested());
        b.reset();
        assert!(!a.is_requested());
    }

    #[test]
    fn test_sentinel_file() {
        let path = std::env::temp_dir().join(format!("tiermix-halt-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let sig = HaltSignal::new().with_sentinel(&path);
        assert!(!sig.is_requested());
        std::fs::write(&path, b"").unwrap();
        assert!(sig.is_requested());
        std::fs::remove_file(&path).unwrap();
    }
}

use std::path::{Path, PathBuf};

use dashmap::DashSet;

/// Per-binding tracker of paths with work in flight.
///
/// `processing` holds paths whose stability probe is running; `enqueued`
/// holds paths queued for upload or being uploaded. Together they guarantee
/// a path is enqueued at most once at any instant, without serializing the
/// watcher behind a coarse lock.
#[derive(Debug, Default)]
pub struct InFlightSet {
    processing: DashSet<PathBuf>,
    enqueued: DashSet<PathBuf>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a path for probing. Returns false if a probe is already running.
    pub fn begin_processing(&self, path: &Path) -> bool {
        self.processing.insert(path.to_path_buf())
    }

    pub fn end_processing(&self, path: &Path) {
        self.processing.remove(path);
    }

    /// Claim a path for upload. Returns false if it is already enqueued.
    pub fn mark_enqueued(&self, path: &Path) -> bool {
        self.enqueued.insert(path.to_path_buf())
    }

    /// Release a path after a successful upload (or a dropped dispatch) so a
    /// future write to the same name is picked up again.
    pub fn clear_enqueued(&self, path: &Path) {
        self.enqueued.remove(path);
    }

    pub fn is_enqueued(&self, path: &Path) -> bool {
        self.enqueued.contains(path)
    }

    /// True if the path is in either set.
    pub fn is_tracked(&self, path: &Path) -> bool {
        self.enqueued.contains(path) || self.processing.contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn processing_claim_is_exclusive() {
        let set = InFlightSet::new();
        let p = Path::new("/w/a");

        assert!(set.begin_processing(p));
        assert!(!set.begin_processing(p));
        set.end_processing(p);
        assert!(set.begin_processing(p));
    }

    #[test]
    fn enqueued_claim_is_exclusive_until_cleared() {
        let set = InFlightSet::new();
        let p = Path::new("/w/a");

        assert!(set.mark_enqueued(p));
        assert!(!set.mark_enqueued(p));
        assert!(set.is_tracked(p));

        set.clear_enqueued(p);
        assert!(!set.is_tracked(p));
        assert!(set.mark_enqueued(p));
    }

    #[test]
    fn tracked_covers_both_sets() {
        let set = InFlightSet::new();
        assert!(!set.is_tracked(Path::new("/w/x")));

        set.begin_processing(Path::new("/w/x"));
        assert!(set.is_tracked(Path::new("/w/x")));
        assert!(!set.is_enqueued(Path::new("/w/x")));
    }
}

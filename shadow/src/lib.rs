use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use models::ShadowConfig;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use utilities::FileSystem;

/// Microsecond-resolution stamp, e.g. `20250101-120000.000000`.
const STAMP_FORMAT: &[FormatItem<'_>] =
    format_description!("[year][month][day]-[hour][minute][second].[subsecond digits:6]");

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Retention-managed archive of successfully uploaded files.
///
/// Entries are named `<stamp>-<basename>`. `store` is serialized so that two
/// concurrent callers can never draw the same stamp; everything else runs
/// lock-free.
pub struct Archiver {
    cfg: ShadowConfig,
    fs: Arc<dyn FileSystem>,
    last_stamp: Mutex<String>,
}

impl Archiver {
    /// Failing to create the archive root is fatal to the launcher.
    pub fn new(cfg: ShadowConfig, fs: Arc<dyn FileSystem>) -> Result<Self> {
        if cfg.enabled {
            fs.create_dir_all(&cfg.path).with_context(|| {
                format!("failed to create shadow directory {}", cfg.path.display())
            })?;
        }
        Ok(Self {
            cfg,
            fs,
            last_stamp: Mutex::new(String::new()),
        })
    }

    pub fn enabled(&self) -> bool {
        self.cfg.enabled
    }

    /// Copy `source` into the archive under a fresh timestamped name.
    /// Returns the archive path, or `None` when shadowing is disabled.
    pub fn store(&self, source: &Path) -> Result<Option<PathBuf>> {
        if !self.cfg.enabled {
            return Ok(None);
        }

        let base = source
            .file_name()
            .with_context(|| format!("source has no basename: {}", source.display()))?
            .to_string_lossy()
            .into_owned();

        let mut last = self.last_stamp.lock().unwrap();
        let stamp = loop {
            let stamp = OffsetDateTime::now_utc()
                .format(STAMP_FORMAT)
                .context("failed to format archive stamp")?;
            if stamp != *last {
                *last = stamp.clone();
                break stamp;
            }
            // Two callers landed in the same microsecond; nudge the clock.
            std::thread::sleep(Duration::from_micros(1));
        };

        let dest = self.cfg.path.join(format!("{stamp}-{base}"));
        if let Some(parent) = dest.parent() {
            self.fs.create_dir_all(parent).with_context(|| {
                format!("failed to create shadow subdirectory {}", parent.display())
            })?;
        }
        self.fs
            .copy_file(source, &dest)
            .with_context(|| format!("failed to copy {} to shadow", source.display()))?;
        drop(last);

        info!("shadow: copied {} -> {}", source.display(), dest.display());
        Ok(Some(dest))
    }

    /// Delete archive files older than the retention window. Directories are
    /// left intact; per-file failures are logged and skipped.
    pub fn sweep(&self) -> Result<usize> {
        if !self.cfg.enabled {
            return Ok(0);
        }

        let cutoff = SystemTime::now() - self.cfg.retention();
        let mut removed = 0usize;

        let mut stack = vec![self.cfg.path.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match self.fs.read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("shadow sweep: failed to read {}: {e}", dir.display());
                    continue;
                }
            };
            for entry in entries {
                if entry.metadata.is_dir {
                    stack.push(entry.path);
                    continue;
                }
                if !entry.metadata.is_file {
                    continue;
                }
                let expired = entry
                    .metadata
                    .modified
                    .map(|m| m < cutoff)
                    .unwrap_or(false);
                if !expired {
                    continue;
                }
                match self.fs.remove_file(&entry.path) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        warn!("shadow sweep: failed to remove {}: {e}", entry.path.display())
                    }
                }
            }
        }

        info!(
            "shadow sweep: removed {} files older than {:?}",
            removed,
            self.cfg.retention()
        );
        Ok(removed)
    }

    /// Sweep on an hourly cadence until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, token: CancellationToken) {
        if !self.cfg.enabled {
            return;
        }
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.reset();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {}
            }
            if let Err(e) = self.sweep() {
                error!("shadow sweep error: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use utilities::VirtualFileSystem;

    fn enabled_cfg(path: &str, retention_hours: u64) -> ShadowConfig {
        ShadowConfig {
            enabled: true,
            path: PathBuf::from(path),
            retention_hours,
        }
    }

    #[test]
    fn disabled_archiver_is_a_no_op() {
        let fs = Arc::new(VirtualFileSystem::new());
        let cfg = ShadowConfig {
            enabled: false,
            path: PathBuf::from("/never-created"),
            retention_hours: 1,
        };
        let archiver = Archiver::new(cfg, Arc::clone(&fs) as Arc<dyn FileSystem>).unwrap();

        assert_eq!(archiver.store(Path::new("/missing")).unwrap(), None);
        assert_eq!(archiver.sweep().unwrap(), 0);
        assert!(fs.metadata(Path::new("/never-created")).is_err());
    }

    #[test]
    fn stored_entry_carries_a_timestamped_name() {
        let fs = Arc::new(VirtualFileSystem::new());
        fs.write(Path::new("/data/report.pdf"), b"bytes").unwrap();
        let archiver = Archiver::new(enabled_cfg("/arch", 24), Arc::clone(&fs) as Arc<dyn FileSystem>).unwrap();

        let dest = archiver
            .store(Path::new("/data/report.pdf"))
            .unwrap()
            .unwrap();
        let name = dest.file_name().unwrap().to_string_lossy().into_owned();

        // <YYYYMMDD-HHMMSS.uuuuuu>-report.pdf
        assert!(name.ends_with("-report.pdf"), "{name}");
        let stamp = &name[..name.len() - "-report.pdf".len()];
        assert_eq!(stamp.len(), 22, "{stamp}");
        assert_eq!(&stamp[8..9], "-");
        assert_eq!(&stamp[15..16], ".");
        assert!(stamp[..8].bytes().all(|b| b.is_ascii_digit()));
        assert!(stamp[9..15].bytes().all(|b| b.is_ascii_digit()));
        assert!(stamp[16..].bytes().all(|b| b.is_ascii_digit()));

        assert_eq!(fs.read(&dest).unwrap(), b"bytes");
    }

    #[test]
    fn concurrent_stores_draw_distinct_names() {
        let fs = Arc::new(VirtualFileSystem::new());
        fs.write(Path::new("/data/same.bin"), b"x").unwrap();
        let archiver = Arc::new(Archiver::new(enabled_cfg("/arch", 24), fs).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let archiver = Arc::clone(&archiver);
            handles.push(std::thread::spawn(move || {
                archiver.store(Path::new("/data/same.bin")).unwrap().unwrap()
            }));
        }

        let names: HashSet<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(names.len(), 8);
    }

    #[test]
    fn sweep_removes_only_expired_files() {
        let fs = Arc::new(VirtualFileSystem::new());
        let archiver = Archiver::new(enabled_cfg("/arch", 1), Arc::clone(&fs) as Arc<dyn FileSystem>).unwrap();

        fs.write(Path::new("/arch/old.bin"), b"o").unwrap();
        fs.write(Path::new("/arch/fresh.bin"), b"f").unwrap();
        fs.write(Path::new("/arch/sub/older.bin"), b"s").unwrap();
        fs.set_modified(
            Path::new("/arch/old.bin"),
            SystemTime::now() - Duration::from_secs(2 * 3600),
        );
        fs.set_modified(
            Path::new("/arch/sub/older.bin"),
            SystemTime::now() - Duration::from_secs(3 * 3600),
        );

        let removed = archiver.sweep().unwrap();
        assert_eq!(removed, 2);
        assert!(fs.read(Path::new("/arch/old.bin")).is_err());
        assert!(fs.read(Path::new("/arch/sub/older.bin")).is_err());
        assert_eq!(fs.read(Path::new("/arch/fresh.bin")).unwrap(), b"f");
        // The subdirectory survives the sweep.
        assert!(fs.metadata(Path::new("/arch/sub")).unwrap().is_dir);
    }
}

use std::path::Path;
use std::time::SystemTime;

use models::StabilityConfig;
use tokio::time::Instant;
use tracing::warn;
use utilities::FileSystem;

/// Outcome of a stability probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub stable: bool,
    /// Stability was assumed because the budget expired; the file may still
    /// be written to and its source must not be deleted downstream.
    pub timed_out: bool,
}

impl Probe {
    pub const DISAPPEARED: Probe = Probe {
        stable: false,
        timed_out: false,
    };
}

/// Block until the file's size and mtime have been constant across enough
/// consecutive samples, the file disappears, or the wait budget runs out.
///
/// The streak counter starts at 1 on the first sample (or whenever a sample
/// differs from the previous one) and the file is considered stable once the
/// counter reaches `required_stable_checks`. Probing takes no locks on the
/// file; other processes may still be writing it.
pub async fn probe(fs: &dyn FileSystem, path: &Path, policy: &StabilityConfig) -> Probe {
    let interval = policy.confirmation_interval();
    let max_wait = policy.max_wait();
    let start = Instant::now();

    let mut last: Option<(u64, Option<SystemTime>)> = None;
    let mut streak: u32 = 0;

    loop {
        if start.elapsed() > max_wait {
            warn!(
                "stability check timeout for {}: assuming stable after {:?} (file may still be writing)",
                path.display(),
                max_wait
            );
            return Probe {
                stable: true,
                timed_out: true,
            };
        }

        let md = match fs.metadata(path) {
            Ok(md) => md,
            Err(_) => return Probe::DISAPPEARED,
        };
        let sample = (md.len, md.modified);

        if streak > 0 && last.as_ref() == Some(&sample) {
            streak += 1;
            if streak >= policy.required_stable_checks {
                return Probe {
                    stable: true,
                    timed_out: false,
                };
            }
        } else {
            streak = 1;
            last = Some(sample);
        }

        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use utilities::VirtualFileSystem;

    fn policy(interval_ms: u64, checks: u32, max_wait_ms: u64) -> StabilityConfig {
        StabilityConfig {
            confirmation_interval_ms: interval_ms,
            required_stable_checks: checks,
            max_wait_ms,
        }
    }

    #[tokio::test]
    async fn settled_file_confirms_within_budget() {
        let fs = VirtualFileSystem::new();
        let path = PathBuf::from("/w/a.txt");
        fs.write(&path, b"done").unwrap();

        let started = Instant::now();
        let probe = probe(&fs, &path, &policy(10, 3, 2_000)).await;

        assert_eq!(probe.stable, true);
        assert_eq!(probe.timed_out, false);
        // 3 samples at 10ms spacing plus slack.
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn continuous_writer_hits_the_timeout_arm() {
        let fs = Arc::new(VirtualFileSystem::new());
        let path = PathBuf::from("/w/log");
        fs.write(&path, b"0").unwrap();

        let writer_fs = Arc::clone(&fs);
        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            let mut body = Vec::new();
            for _ in 0..60 {
                body.push(b'x');
                writer_fs.write(&writer_path, &body).unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let started = Instant::now();
        let probe = probe(fs.as_ref(), &path, &policy(20, 5, 200)).await;
        writer.abort();

        assert_eq!(probe.stable, true);
        assert_eq!(probe.timed_out, true);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn disappearing_file_reports_unstable() {
        let fs = Arc::new(VirtualFileSystem::new());
        let path = PathBuf::from("/w/gone");
        fs.write(&path, b"short-lived").unwrap();

        let remover_fs = Arc::clone(&fs);
        let remover_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            remover_fs.remove_file(&remover_path).unwrap();
        });

        let probe = probe(fs.as_ref(), &path, &policy(15, 50, 5_000)).await;
        assert_eq!(probe, Probe::DISAPPEARED);
    }
}

//! Archiving of delivered files into time-bucketed trees, or plain deletion.
//! Bucket: `<work>/archive/<host>/<user>/<job_id>/<YYYYMMDDHH>/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};

pub struct Archiver {
    root: PathBuf,
    archive_unit: u64,
}

impl Archiver {
    pub fn new(root: PathBuf, archive_unit: u64) -> Archiver {
        Archiver { root, archive_unit }
    }

    /// Hour bucket name for a send time.
    pub fn bucket_name(send_time: i64) -> String {
        match DateTime::<Utc>::from_timestamp(send_time, 0) {
            Some(dt) => dt.format("%Y%m%d%H").to_string(),
            None => "0000000000".to_string(),
        }
    }

    /// Epoch seconds of the start of a `YYYYMMDDHH` bucket.
    fn bucket_epoch(name: &str) -> Option<i64> {
        let dt = NaiveDateTime::parse_from_str(&format!("{}0000", name), "%Y%m%d%H%M%S").ok()?;
        Some(dt.and_utc().timestamp())
    }

    /// Epoch after which the archived copy may be reaped.
    pub fn retention_epoch(&self, send_time: i64, archive_time: i32) -> i64 {
        send_time + (self.archive_unit as i64) * (archive_time.max(0) as i64)
    }

    pub fn bucket_dir(&self, host: &str, user: &str, job_id: u32, send_time: i64) -> PathBuf {
        let user = if user.is_empty() { "none" } else { user };
        self.root
            .join(host)
            .join(user)
            .join(format!("{:x}", job_id))
            .join(Self::bucket_name(send_time))
    }

    /// Move a delivered source file into its archive bucket. The bucket is
    /// created lazily; rename falls back to copy+unlink across filesystems.
    pub fn archive(
        &self,
        src: &Path,
        host: &str,
        user: &str,
        job_id: u32,
        send_time: i64,
    ) -> Result<PathBuf> {
        let dir = self.bucket_dir(host, user, job_id, send_time);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("无法创建归档桶: {}", dir.display()))?;
        let file_name = src
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("归档源没有文件名: {}", src.display()))?;
        let dst = dir.join(file_name);
        match std::fs::rename(src, &dst) {
            Ok(()) => Ok(dst),
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                std::fs::copy(src, &dst)
                    .with_context(|| format!("跨文件系统归档复制失败: {}", dst.display()))?;
                std::fs::remove_file(src)
                    .with_context(|| format!("归档后删除源失败: {}", src.display()))?;
                Ok(dst)
            }
            Err(e) => {
                Err(e).with_context(|| format!("归档移动失败: {} -> {}", src.display(), dst.display()))
            }
        }
    }

    /// Reap buckets whose retention epoch has passed. `archive_time_of`
    /// resolves a job id to its configured retention units; jobs no longer
    /// in the rule database keep their buckets (conservative). A bucket is
    /// aged from its last possible send time (bucket start + one hour), so
    /// nothing is ever reaped early. Returns the number of buckets removed.
    pub fn purge_expired<F>(&self, now: i64, archive_time_of: F) -> Result<usize>
    where
        F: Fn(u32) -> Option<i32>,
    {
        let mut removed = 0usize;
        if !self.root.is_dir() {
            return Ok(removed);
        }
        for host_ent in read_dirs(&self.root) {
            for user_ent in read_dirs(&host_ent) {
                for job_ent in read_dirs(&user_ent) {
                    let job_name = job_ent
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    let Ok(job_id) = u32::from_str_radix(&job_name, 16) else {
                        continue;
                    };
                    let Some(archive_time) = archive_time_of(job_id) else {
                        continue;
                    };
                    if archive_time <= 0 {
                        // archiving switched off for this job: keep what is
                        // already there
                        continue;
                    }
                    for bucket_ent in read_dirs(&job_ent) {
                        let bucket = bucket_ent
                            .file_name()
                            .map(|n| n.to_string_lossy().to_string())
                            .unwrap_or_default();
                        let Some(start) = Self::bucket_epoch(&bucket) else {
                            continue;
                        };
                        if now >= self.retention_epoch(start + 3600, archive_time) {
                            match std::fs::remove_dir_all(&bucket_ent) {
                                Ok(()) => {
                                    tracing::info!(
                                        "[fd] 归档桶过期移除: {}",
                                        bucket_ent.display()
                                    );
                                    removed += 1;
                                }
                                Err(e) => {
                                    tracing::warn!(
                                        "[fd] 归档桶移除失败 {}: {}",
                                        bucket_ent.display(),
                                        e
                                    );
                                }
                            }
                        }
                    }
                    let _ = std::fs::remove_dir(&job_ent); // only if empty
                }
                let _ = std::fs::remove_dir(&user_ent);
            }
            let _ = std::fs::remove_dir(&host_ent);
        }
        Ok(removed)
    }
}

fn read_dirs(path: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(path)
        .map(|rd| {
            rd.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bucket_name_is_hourly() {
        // 2026-08-01 13:05:00 UTC
        let t = chrono::Utc.with_ymd_and_hms(2026, 8, 1, 13, 5, 0).unwrap().timestamp();
        assert_eq!(Archiver::bucket_name(t), "2026080113");
    }

    #[test]
    fn archive_moves_into_lazy_bucket() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let arch = Archiver::new(tmp.path().join("archive"), 86400);
        let src = tmp.path().join("a.bin");
        std::fs::write(&src, b"payload").unwrap();
        let t = chrono::Utc.with_ymd_and_hms(2026, 8, 1, 13, 5, 0).unwrap().timestamp();
        let dst = arch.archive(&src, "alpha", "feed", 0x2a, t).expect("archive");
        assert!(!src.exists());
        assert!(dst.ends_with("alpha/feed/2a/2026080113/a.bin"));
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
        // retention epoch: 2 units of one day
        assert_eq!(arch.retention_epoch(t, 2), t + 2 * 86400);
    }

    #[test]
    fn purge_reaps_only_expired_buckets() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let arch = Archiver::new(tmp.path().join("archive"), 86400);
        let t = chrono::Utc.with_ymd_and_hms(2026, 8, 1, 13, 5, 0).unwrap().timestamp();
        for name in ["a.bin", "b.bin"] {
            let src = tmp.path().join(name);
            std::fs::write(&src, b"x").unwrap();
            arch.archive(&src, "alpha", "feed", 0x2a, t).expect("archive");
        }
        let bucket = arch.bucket_dir("alpha", "feed", 0x2a, t);

        // one retention unit: expires a day after the bucket's last hour
        let lookup = |job_id: u32| if job_id == 0x2a { Some(1) } else { None };
        let before = arch.purge_expired(t + 3600, lookup).expect("purge");
        assert_eq!(before, 0);
        assert!(bucket.exists());
        let after = arch.purge_expired(t + 2 * 86400, lookup).expect("purge");
        assert_eq!(after, 1);
        assert!(!bucket.exists());

        // a job missing from the lookup keeps its buckets
        let src = tmp.path().join("c.bin");
        std::fs::write(&src, b"x").unwrap();
        arch.archive(&src, "alpha", "feed", 0x99, t).expect("archive");
        let kept = arch.purge_expired(t + 10 * 86400, lookup).expect("purge");
        assert_eq!(kept, 0);
        assert!(arch.bucket_dir("alpha", "feed", 0x99, t).exists());
    }
}

//! JID: the job-id catalogue. Every rule in the database gets one record
//! here; message names embed the job id and the dispatcher refuses staging
//! directories whose id is no longer catalogued.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result};

use super::{LockKind, MappedRegion, RecordLock, fixed_str, set_fixed_str};

pub const JID_MAGIC: u32 = 0x4a49_4401;
pub const JID_VERSION: u8 = 2;

pub const JID_ALIAS_LEN: usize = 40;
pub const JID_RECIPIENT_LEN: usize = 160;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct JobRecord {
    pub job_id: u32,
    pub dir_id: u32,
    pub dir_no: u32,
    pub host_id: u32,
    pub priority: u8,
    pub scheme: u8,
    _pad: [u8; 2],
    pub no_of_files: i32,
    pub host_alias: [u8; JID_ALIAS_LEN],
    pub recipient: [u8; JID_RECIPIENT_LEN],
}

impl JobRecord {
    pub fn host_alias(&self) -> &str {
        fixed_str(&self.host_alias)
    }

    pub fn recipient(&self) -> &str {
        fixed_str(&self.recipient)
    }
}

#[derive(Debug, Clone)]
pub struct JobSeed {
    pub job_id: u32,
    pub dir_id: u32,
    pub dir_no: u32,
    pub host_id: u32,
    pub priority: u8,
    pub scheme: u8,
    pub no_of_files: i32,
    pub host_alias: String,
    pub recipient: String,
}

pub struct Jid {
    region: MappedRegion<JobRecord>,
}

impl Jid {
    pub fn create(path: &Path, jobs: &[JobSeed]) -> Result<Jid> {
        let region =
            MappedRegion::<JobRecord>::create(path, jobs.len() as u32, JID_MAGIC, JID_VERSION)?;
        for (i, seed) in jobs.iter().enumerate() {
            region.with_mut(i, |j| {
                j.job_id = seed.job_id;
                j.dir_id = seed.dir_id;
                j.dir_no = seed.dir_no;
                j.host_id = seed.host_id;
                j.priority = seed.priority;
                j.scheme = seed.scheme;
                j.no_of_files = seed.no_of_files;
                set_fixed_str(&mut j.host_alias, &seed.host_alias);
                set_fixed_str(&mut j.recipient, &seed.recipient);
            })?;
        }
        Ok(Jid { region })
    }

    pub fn attach(path: &Path) -> Result<Jid> {
        Ok(Jid { region: MappedRegion::attach(path, JID_MAGIC, JID_VERSION)? })
    }

    pub fn len(&self) -> usize {
        self.region.element_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn check_generation(&self) -> Result<(), crate::StateError> {
        self.region.check_generation()
    }

    pub fn reattach(&mut self) -> Result<()> {
        self.region.reattach()
    }

    pub fn contains(&self, job_id: u32) -> bool {
        self.lookup(job_id).is_some()
    }

    pub fn lookup(&self, job_id: u32) -> Option<JobRecord> {
        (0..self.len())
            .filter_map(|i| self.region.read(i).ok())
            .find(|j| j.job_id == job_id)
    }

    pub fn lookup_at(&self, idx: usize) -> Option<JobRecord> {
        self.region.read(idx).ok()
    }
}

/// Next value of the monotonic unique counter persisted in
/// `fifodir/jid_number`. Whole-file write lock makes the increment safe
/// across processes; wraps inside u32 like the message-name grammar expects.
pub fn next_unique(path: &Path) -> Result<u32> {
    let f = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("无法打开计数器文件: {}", path.display()))?;
    let _g = RecordLock::acquire(&f, 0, 0, LockKind::Write)
        .with_context(|| format!("计数器加锁失败: {}", path.display()))?;
    let mut buf = String::new();
    (&f).read_to_string(&mut buf)
        .with_context(|| format!("读取计数器失败: {}", path.display()))?;
    let current: u32 = buf.trim().parse().unwrap_or(0);
    let next = current.wrapping_add(1);
    (&f).seek(SeekFrom::Start(0))?;
    f.set_len(0)?;
    write!(&f, "{}", next).with_context(|| format!("写入计数器失败: {}", path.display()))?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(job_id: u32) -> JobSeed {
        JobSeed {
            job_id,
            dir_id: 10,
            dir_no: 0,
            host_id: 20,
            priority: b'5',
            scheme: 1,
            no_of_files: 1,
            host_alias: "alpha".to_string(),
            recipient: "sftp://user@alpha/in".to_string(),
        }
    }

    #[test]
    fn catalogue_lookup() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("jid");
        let jid = Jid::create(&p, &[seed(0xaa), seed(0xbb)]).expect("create");
        assert!(jid.contains(0xbb));
        assert!(!jid.contains(0xcc));
        let j = jid.lookup(0xaa).expect("hit");
        assert_eq!(j.recipient(), "sftp://user@alpha/in");
    }

    #[test]
    fn unique_counter_increments_and_persists() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("jid_number");
        assert_eq!(next_unique(&p).expect("first"), 1);
        assert_eq!(next_unique(&p).expect("second"), 2);
        assert_eq!(next_unique(&p).expect("third"), 3);
    }
}

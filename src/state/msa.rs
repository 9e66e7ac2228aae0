//! MSA: records for remote engines a monitor process keeps an eye on.
//! Read-mostly; only the monitor side updates them.

use std::path::Path;

use anyhow::Result;

use super::{MappedRegion, fixed_str, set_fixed_str};

pub const MSA_MAGIC: u32 = 0x4d53_4101;
pub const MSA_VERSION: u8 = 1;

pub const MON_ALIAS_LEN: usize = 40;

// status values
pub const MON_UNKNOWN: u8 = 0;
pub const MON_UP: u8 = 1;
pub const MON_DOWN: u8 = 2;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MonEntry {
    pub afd_alias: [u8; MON_ALIAS_LEN],
    pub afd_id: u32,
    pub status: u8,
    _pad: [u8; 3],
    pub no_of_hosts: i32,
    pub no_of_dirs: i32,
    pub last_data_time: i64,
    pub files_received: u64,
    pub bytes_received: u64,
}

impl MonEntry {
    pub fn alias(&self) -> &str {
        fixed_str(&self.afd_alias)
    }
}

pub struct Msa {
    region: MappedRegion<MonEntry>,
}

impl Msa {
    pub fn create(path: &Path, aliases: &[String]) -> Result<Msa> {
        let region =
            MappedRegion::<MonEntry>::create(path, aliases.len() as u32, MSA_MAGIC, MSA_VERSION)?;
        for (i, alias) in aliases.iter().enumerate() {
            region.with_mut(i, |m| {
                set_fixed_str(&mut m.afd_alias, alias);
                m.afd_id = crc32fast::hash(alias.as_bytes());
                m.status = MON_UNKNOWN;
            })?;
        }
        Ok(Msa { region })
    }

    pub fn attach(path: &Path) -> Result<Msa> {
        Ok(Msa { region: MappedRegion::attach(path, MSA_MAGIC, MSA_VERSION)? })
    }

    pub fn len(&self) -> usize {
        self.region.element_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_entry(&self, idx: usize) -> Result<MonEntry, crate::StateError> {
        self.region.read(idx)
    }

    pub fn note_heartbeat(
        &self,
        idx: usize,
        status: u8,
        now: i64,
    ) -> Result<(), crate::StateError> {
        self.region.with_mut(idx, |m| {
            m.status = status;
            m.last_data_time = now;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_updates_status() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("msa");
        let msa = Msa::create(&p, &["edge-1".to_string()]).expect("create");
        msa.note_heartbeat(0, MON_UP, 123).expect("beat");
        let m = msa.read_entry(0).expect("read");
        assert_eq!(m.status, MON_UP);
        assert_eq!(m.last_data_time, 123);
        assert_eq!(m.alias(), "edge-1");
    }
}

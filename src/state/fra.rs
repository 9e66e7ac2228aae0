//! FRA: per-watched-directory records (policy knobs plus live scan state).

use std::path::Path;

use anyhow::Result;

use super::{MappedRegion, fixed_str, set_fixed_str};
use crate::StateError;

pub const FRA_MAGIC: u32 = 0x4652_4101;
pub const FRA_VERSION: u8 = 2;

pub const MAX_DIR_ALIAS_LEN: usize = 40;
pub const MAX_URL_LEN: usize = 160;
pub const MAX_WAIT_FOR_LEN: usize = 64;

// dir_status values
pub const DIR_NORMAL: u8 = 0;
pub const DIR_WARN: u8 = 1;
pub const DIR_ERROR: u8 = 2;
pub const DIR_DISABLED: u8 = 3;

// size/time predicate signs
pub const PRED_NONE: u8 = 0;
pub const PRED_EQ: u8 = 1;
pub const PRED_LT: u8 = 2;
pub const PRED_GT: u8 = 3;

/// One watched-directory record.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DirEntry {
    pub dir_alias: [u8; MAX_DIR_ALIAS_LEN],
    pub dir_id: u32,
    /// Source URL when this entry describes a remote retrieve directory.
    pub url: [u8; MAX_URL_LEN],
    pub priority: u8,
    pub accept_dot_files: u8,
    pub do_not_get_dir_list: u8,
    pub remove_after_fetch: u8,
    pub force_reread: u8,
    /// Store-retrieve-list mode: 0 off, 1 on, 2 once.
    pub retrieve_list_mode: u8,
    pub important_dir: u8,
    pub max_copied_flag: u8,
    pub keep_connected: u32,
    pub inotify_mask: u32,
    /// Per-class age limits in hours; 0 disables the class.
    pub unknown_file_time: i32,
    pub queued_file_time: i32,
    pub locked_file_time: i32,
    pub end_character: i32,
    pub max_process: i32,
    /// Per-scan ceilings; 0 means unlimited.
    pub max_copied_files: u32,
    pub ignore_size_sign: u8,
    pub ignore_time_sign: u8,
    _pad0: [u8; 2],
    _pad1: u32,
    pub max_copied_file_size: u64,
    pub ignore_size: i64,
    pub ignore_file_time: i64,
    pub accumulate: u32,
    _pad2: u32,
    pub accumulate_size: u64,
    pub warn_time: i64,
    pub dup_check_timeout: i64,
    pub dup_check_flag: u32,
    pub wait_for_filename: [u8; MAX_WAIT_FOR_LEN],

    // live state
    pub dir_status: u8,
    _pad3: [u8; 3],
    pub error_counter: i32,
    pub files_in_dir: i32,
    _pad4: u32,
    pub bytes_in_dir: i64,
    pub files_queued: u32,
    _pad5: u32,
    pub bytes_in_queue: i64,
    pub last_retrieval: i64,
    pub warn_emitted: u8,
    _pad6: [u8; 7],
}

impl DirEntry {
    pub fn alias(&self) -> &str {
        fixed_str(&self.dir_alias)
    }

    pub fn wait_for(&self) -> &str {
        fixed_str(&self.wait_for_filename)
    }
}

/// Builder input for one directory record.
#[derive(Debug, Clone, Default)]
pub struct DirSeed {
    pub alias: String,
    pub url: String,
    pub priority: u8,
    pub accept_dot_files: bool,
    pub unknown_file_time: i32,
    pub queued_file_time: i32,
    pub locked_file_time: i32,
    pub ignore_size_sign: u8,
    pub ignore_size: i64,
    pub ignore_time_sign: u8,
    pub ignore_file_time: i64,
    pub max_copied_files: u32,
    pub max_copied_file_size: u64,
    pub wait_for: String,
    pub warn_time: i64,
    pub accumulate: u32,
    pub accumulate_size: u64,
    pub dup_check_timeout: i64,
    pub dup_check_flag: u32,
    pub inotify_mask: u32,
    pub important_dir: bool,
    pub end_character: i32,
    pub max_process: i32,
    pub force_reread: bool,
}

/// Process-wide handle over the FRA region.
pub struct Fra {
    region: MappedRegion<DirEntry>,
}

impl Fra {
    pub fn create(path: &Path, dirs: &[DirSeed]) -> Result<Fra> {
        let region =
            MappedRegion::<DirEntry>::create(path, dirs.len() as u32, FRA_MAGIC, FRA_VERSION)?;
        for (i, seed) in dirs.iter().enumerate() {
            region.with_mut(i, |d| {
                set_fixed_str(&mut d.dir_alias, &seed.alias);
                d.dir_id = crc32fast::hash(seed.alias.as_bytes());
                set_fixed_str(&mut d.url, &seed.url);
                d.priority = seed.priority;
                d.accept_dot_files = seed.accept_dot_files as u8;
                d.unknown_file_time = seed.unknown_file_time;
                d.queued_file_time = seed.queued_file_time;
                d.locked_file_time = seed.locked_file_time;
                d.ignore_size_sign = seed.ignore_size_sign;
                d.ignore_size = seed.ignore_size;
                d.ignore_time_sign = seed.ignore_time_sign;
                d.ignore_file_time = seed.ignore_file_time;
                d.max_copied_files = seed.max_copied_files;
                d.max_copied_file_size = seed.max_copied_file_size;
                set_fixed_str(&mut d.wait_for_filename, &seed.wait_for);
                d.warn_time = seed.warn_time;
                d.accumulate = seed.accumulate;
                d.accumulate_size = seed.accumulate_size;
                d.dup_check_timeout = seed.dup_check_timeout;
                d.dup_check_flag = seed.dup_check_flag;
                d.inotify_mask = seed.inotify_mask;
                d.important_dir = seed.important_dir as u8;
                d.end_character = seed.end_character;
                d.max_process = seed.max_process;
                d.force_reread = seed.force_reread as u8;
                d.dir_status = DIR_NORMAL;
            })?;
        }
        Ok(Fra { region })
    }

    pub fn attach(path: &Path) -> Result<Fra> {
        Ok(Fra { region: MappedRegion::attach(path, FRA_MAGIC, FRA_VERSION)? })
    }

    pub fn len(&self) -> usize {
        self.region.element_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn check_generation(&self) -> Result<(), StateError> {
        self.region.check_generation()
    }

    pub fn reattach(&mut self) -> Result<()> {
        self.region.reattach()
    }

    pub fn find_dir(&self, alias: &str) -> Option<usize> {
        (0..self.len()).find(|&i| self.region.with(i, |d| d.alias() == alias).unwrap_or(false))
    }

    pub fn find_dir_by_id(&self, dir_id: u32) -> Option<usize> {
        (0..self.len()).find(|&i| self.region.with(i, |d| d.dir_id == dir_id).unwrap_or(false))
    }

    pub fn read_dir(&self, idx: usize) -> Result<DirEntry, StateError> {
        self.region.read(idx)
    }

    pub fn with_dir_mut<R>(
        &self,
        idx: usize,
        f: impl FnOnce(&mut DirEntry) -> R,
    ) -> Result<R, StateError> {
        self.region.with_mut(idx, f)
    }

    /// Record the outcome of one scan pass.
    pub fn note_scan(
        &self,
        idx: usize,
        files_seen: i32,
        bytes_seen: i64,
        hit_ceiling: bool,
        now: i64,
    ) -> Result<(), StateError> {
        self.region.with_mut(idx, |d| {
            d.files_in_dir = files_seen;
            d.bytes_in_dir = bytes_seen;
            d.max_copied_flag = hit_ceiling as u8;
            d.last_retrieval = now;
        })
    }

    pub fn note_dir_error(&self, idx: usize) -> Result<(), StateError> {
        self.region.with_mut(idx, |d| {
            d.error_counter += 1;
            d.dir_status = DIR_ERROR;
        })
    }

    pub fn clear_dir_error(&self, idx: usize) -> Result<(), StateError> {
        self.region.with_mut(idx, |d| {
            d.error_counter = 0;
            if d.dir_status == DIR_ERROR {
                d.dir_status = DIR_NORMAL;
            }
        })
    }
}

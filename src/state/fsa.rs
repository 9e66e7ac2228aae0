//! FSA: per-host records plus per-slot worker status, the authoritative
//! counters the whole pipeline reports into.

use std::mem::offset_of;
use std::path::Path;

use anyhow::Result;

use super::{LockKind, MappedRegion, RecordLock, fixed_str, set_fixed_str};
use crate::StateError;

pub const FSA_MAGIC: u32 = 0x4653_4101; // "FSA" + layout revision
pub const FSA_VERSION: u8 = 3;

/// Fixed slot count per host. `allowed_transfers` may be anything from 0 to
/// this ceiling.
pub const MAX_SLOTS: usize = 8;
pub const ERROR_HISTORY_LEN: usize = 5;
pub const MAX_ALIAS_LEN: usize = 40;
pub const MAX_REAL_HOSTNAME_LEN: usize = 70;
pub const MAX_FILENAME_IN_USE: usize = 128;
pub const MAX_UNIQUE_NAME: usize = 64;

// host_status flag bits
pub const PAUSE_QUEUE_STAT: u32 = 1;
pub const AUTO_PAUSE_QUEUE_STAT: u32 = 1 << 1;
pub const STOP_TRANSFER_STAT: u32 = 1 << 2;
pub const HOST_DISABLED: u32 = 1 << 3;
pub const HOST_IN_DIR_CONFIG: u32 = 1 << 4;
pub const HOST_ERROR_ACKNOWLEDGED: u32 = 1 << 5;
pub const HOST_ERROR_ACKNOWLEDGED_T: u32 = 1 << 6;
pub const HOST_ERROR_OFFLINE: u32 = 1 << 7;
pub const HOST_ERROR_OFFLINE_T: u32 = 1 << 8;
pub const HOST_ERROR_OFFLINE_STATIC: u32 = 1 << 9;
pub const DO_NOT_DELETE_DATA: u32 = 1 << 10;
pub const ERROR_QUEUE_SET: u32 = 1 << 11;

/// Any flag that excuses `error_counter >= max_errors` from the banner
/// invariant.
pub const ERROR_EXCUSED_MASK: u32 = AUTO_PAUSE_QUEUE_STAT
    | PAUSE_QUEUE_STAT
    | HOST_ERROR_ACKNOWLEDGED
    | HOST_ERROR_ACKNOWLEDGED_T
    | HOST_ERROR_OFFLINE
    | HOST_ERROR_OFFLINE_T
    | HOST_ERROR_OFFLINE_STATIC;

// protocol_options bits (per-protocol behaviour toggles)
pub const OPT_PASSIVE_MODE: u32 = 1;
pub const OPT_EXTENDED_PASSIVE: u32 = 1 << 1;
pub const OPT_KEEPALIVE: u32 = 1 << 2;
pub const OPT_COMPRESSION: u32 = 1 << 3;
pub const OPT_SORT_FILE_NAMES: u32 = 1 << 4;

/// Connect state of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Disconnect,
    Connecting,
    Active,
    Retrieve,
    Burst,
    Closing,
    NotWorking,
}

impl ConnectState {
    pub fn as_u8(self) -> u8 {
        match self {
            ConnectState::Disconnect => 0,
            ConnectState::Connecting => 1,
            ConnectState::Active => 2,
            ConnectState::Retrieve => 3,
            ConnectState::Burst => 4,
            ConnectState::Closing => 5,
            ConnectState::NotWorking => 6,
        }
    }

    pub fn from_u8(v: u8) -> ConnectState {
        match v {
            1 => ConnectState::Connecting,
            2 => ConnectState::Active,
            3 => ConnectState::Retrieve,
            4 => ConnectState::Burst,
            5 => ConnectState::Closing,
            6 => ConnectState::NotWorking,
            _ => ConnectState::Disconnect,
        }
    }
}

/// Per-host, per-slot worker status.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostSlot {
    pub pid: i32,
    pub connect_status: u8,
    /// URL scheme tag of the running session (see `ruledb::Scheme`).
    pub scheme: u8,
    _pad: [u8; 2],
    pub job_id: u32,
    pub no_of_files: i32,
    pub no_of_files_done: i32,
    pub file_size: u64,
    pub file_size_done: u64,
    pub file_size_in_use: u64,
    pub file_size_in_use_done: u64,
    pub bytes_send: u64,
    pub file_name_in_use: [u8; MAX_FILENAME_IN_USE],
    /// Burst handshake slot: the dispatcher drops a follow-on message name
    /// here while the worker still holds the connection.
    pub unique_name: [u8; MAX_UNIQUE_NAME],
}

impl HostSlot {
    pub fn connect_state(&self) -> ConnectState {
        ConnectState::from_u8(self.connect_status)
    }
}

/// One host record.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostEntry {
    pub host_alias: [u8; MAX_ALIAS_LEN],
    pub host_id: u32,
    /// Display name: alias plus the active toggle character.
    pub host_dsp_name: [u8; MAX_ALIAS_LEN + 2],
    _pad0: [u8; 2],
    /// Two real hostnames for A/B toggling.
    pub real_hostname: [[u8; MAX_REAL_HOSTNAME_LEN]; 2],
    /// 0 or 1: which real hostname is current.
    pub host_toggle: u8,
    pub auto_toggle: u8,
    /// Characters displayed for position A and B, e.g. `{` / `}`.
    pub toggle_str: [u8; 2],
    pub proxy_name: [u8; 80],
    pub port: i32,
    /// Bitset of enabled schemes (`ruledb::Scheme` bits).
    pub scheme_mask: u32,
    pub protocol_options: u32,
    pub socket_send_buf_size: u32,
    pub socket_recv_buf_size: u32,
    pub tcp_idle_time: u32,
    pub transfer_timeout: i64,
    pub block_size: i32,
    pub ttl: i32,
    pub keep_connected: u32,
    _pad1: u32,
    pub allowed_transfers: i32,
    pub max_parallel: i32,
    pub max_errors: i32,
    pub retry_interval: i32,
    /// Bytes per second across the whole host; 0 disables the limit.
    pub transfer_rate_limit: i64,
    /// Bytes per second per worker process; 0 disables.
    pub trl_per_process: i64,
    pub dup_check_timeout: i64,
    pub dup_check_flag: u32,
    pub debug_level: i32,

    // live state
    pub host_status: u32,
    pub error_counter: i32,
    pub error_history: [u8; ERROR_HISTORY_LEN],
    _pad2: [u8; 3],
    pub total_file_counter: i32,
    _pad3: u32,
    pub total_file_size: i64,
    pub jobs_queued: u32,
    pub file_counter_done: u32,
    pub bytes_send: u64,
    pub connections: u32,
    pub nack_counter: u32,
    pub active_transfers: i32,
    pub successful_retries: i32,
    pub first_error_time: i64,
    pub last_connection: i64,
    pub last_retry_time: i64,
    pub job_status: [HostSlot; MAX_SLOTS],
}

impl HostEntry {
    pub fn alias(&self) -> &str {
        fixed_str(&self.host_alias)
    }

    pub fn current_real_hostname(&self) -> &str {
        let idx = (self.host_toggle as usize).min(1);
        let name = fixed_str(&self.real_hostname[idx]);
        if name.is_empty() { fixed_str(&self.real_hostname[0]) } else { name }
    }

    pub fn is_paused(&self) -> bool {
        self.host_status & (PAUSE_QUEUE_STAT | AUTO_PAUSE_QUEUE_STAT) != 0
    }

    pub fn is_offline(&self) -> bool {
        self.host_status
            & (HOST_ERROR_OFFLINE | HOST_ERROR_OFFLINE_T | HOST_ERROR_OFFLINE_STATIC)
            != 0
    }

    /// `allowed_transfers = 0` disables the host outright.
    pub fn dispatchable(&self) -> bool {
        self.allowed_transfers > 0
            && self.host_status & (HOST_DISABLED | STOP_TRANSFER_STAT) == 0
            && !self.is_paused()
            && !self.is_offline()
    }
}

// Designated lock bytes. One byte each; the position inside the record is
// the contract, not the span.
fn lock_con_off() -> usize {
    offset_of!(HostEntry, job_status)
}
fn lock_tfc_off() -> usize {
    offset_of!(HostEntry, total_file_counter)
}
fn lock_ec_off() -> usize {
    offset_of!(HostEntry, error_counter)
}

/// Process-wide handle over the FSA region. Components hold one of these and
/// borrow short-lived guarded references through it.
pub struct Fsa {
    region: MappedRegion<HostEntry>,
}

/// Builder input for one host record.
#[derive(Debug, Clone)]
pub struct HostSeed {
    pub alias: String,
    pub real_hostname: [String; 2],
    pub port: i32,
    pub scheme_mask: u32,
    pub protocol_options: u32,
    pub allowed_transfers: i32,
    pub max_errors: i32,
    pub retry_interval: i32,
    pub transfer_timeout: i64,
    pub block_size: i32,
    pub transfer_rate_limit: i64,
    pub auto_toggle: bool,
}

impl Default for HostSeed {
    fn default() -> Self {
        HostSeed {
            alias: String::new(),
            real_hostname: [String::new(), String::new()],
            port: 0,
            scheme_mask: 0,
            protocol_options: 0,
            allowed_transfers: 2,
            max_errors: 10,
            retry_interval: 60,
            transfer_timeout: 120,
            block_size: 64 * 1024,
            transfer_rate_limit: 0,
            auto_toggle: false,
        }
    }
}

impl Fsa {
    /// Build a fresh FSA from host seeds. Called by the ingest daemon when
    /// the rule set changes; bumps the generation id.
    pub fn create(path: &Path, hosts: &[HostSeed]) -> Result<Fsa> {
        let region =
            MappedRegion::<HostEntry>::create(path, hosts.len() as u32, FSA_MAGIC, FSA_VERSION)?;
        for (i, seed) in hosts.iter().enumerate() {
            region.with_mut(i, |h| {
                set_fixed_str(&mut h.host_alias, &seed.alias);
                h.host_id = crc32fast::hash(seed.alias.as_bytes());
                set_fixed_str(&mut h.host_dsp_name, &seed.alias);
                set_fixed_str(&mut h.real_hostname[0], &seed.real_hostname[0]);
                set_fixed_str(&mut h.real_hostname[1], &seed.real_hostname[1]);
                h.toggle_str = [b'{', b'}'];
                h.auto_toggle = seed.auto_toggle as u8;
                h.port = seed.port;
                h.scheme_mask = seed.scheme_mask;
                h.protocol_options = seed.protocol_options;
                h.allowed_transfers = seed.allowed_transfers.min(MAX_SLOTS as i32);
                h.max_parallel = MAX_SLOTS as i32;
                h.max_errors = seed.max_errors;
                h.retry_interval = seed.retry_interval;
                h.transfer_timeout = seed.transfer_timeout;
                h.block_size = seed.block_size;
                h.transfer_rate_limit = seed.transfer_rate_limit;
                h.trl_per_process = if seed.transfer_rate_limit > 0 && seed.allowed_transfers > 0 {
                    seed.transfer_rate_limit / seed.allowed_transfers as i64
                } else {
                    0
                };
                h.host_status = HOST_IN_DIR_CONFIG;
            })?;
        }
        Ok(Fsa { region })
    }

    pub fn attach(path: &Path) -> Result<Fsa> {
        Ok(Fsa { region: MappedRegion::attach(path, FSA_MAGIC, FSA_VERSION)? })
    }

    pub fn attach_ro(path: &Path) -> Result<Fsa> {
        Ok(Fsa { region: MappedRegion::attach_ro(path, FSA_MAGIC, FSA_VERSION)? })
    }

    pub fn len(&self) -> usize {
        self.region.element_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn generation(&self) -> u32 {
        self.region.generation()
    }

    pub fn check_generation(&self) -> Result<(), StateError> {
        self.region.check_generation()
    }

    pub fn reattach(&mut self) -> Result<()> {
        self.region.reattach()
    }

    pub fn find_host(&self, alias: &str) -> Option<usize> {
        (0..self.len()).find(|&i| {
            self.region.with(i, |h| h.alias() == alias).unwrap_or(false)
        })
    }

    pub fn find_host_by_id(&self, host_id: u32) -> Option<usize> {
        (0..self.len()).find(|&i| {
            self.region.with(i, |h| h.host_id == host_id).unwrap_or(false)
        })
    }

    pub fn read_host(&self, idx: usize) -> Result<HostEntry, StateError> {
        self.region.read(idx)
    }

    pub fn with_host<R>(&self, idx: usize, f: impl FnOnce(&HostEntry) -> R) -> Result<R, StateError> {
        self.region.with(idx, f)
    }

    // -- lock guards -------------------------------------------------------

    pub fn lock_con(&self, idx: usize) -> Result<RecordLock<'_>> {
        let off = self.region.byte_offset(idx) + lock_con_off() as u64;
        self.region.lock_range(off, 1, LockKind::Write)
    }

    pub fn lock_tfc(&self, idx: usize) -> Result<RecordLock<'_>> {
        let off = self.region.byte_offset(idx) + lock_tfc_off() as u64;
        self.region.lock_range(off, 1, LockKind::Write)
    }

    pub fn lock_tfc_read(&self, idx: usize) -> Result<RecordLock<'_>> {
        let off = self.region.byte_offset(idx) + lock_tfc_off() as u64;
        self.region.lock_range(off, 1, LockKind::Read)
    }

    pub fn lock_ec(&self, idx: usize) -> Result<RecordLock<'_>> {
        let off = self.region.byte_offset(idx) + lock_ec_off() as u64;
        self.region.lock_range(off, 1, LockKind::Write)
    }

    // -- guarded counter operations ---------------------------------------

    /// Account newly staged work for this host.
    pub fn add_queued(&self, idx: usize, files: i32, bytes: i64) -> Result<()> {
        let _g = self.lock_tfc(idx)?;
        self.region.with_mut(idx, |h| {
            h.total_file_counter += files;
            h.total_file_size += bytes;
            h.jobs_queued = h.jobs_queued.saturating_add(1);
        })?;
        Ok(())
    }

    /// Remove delivered (or discarded) work from the queue counters.
    /// Converges to zero unconditionally; a short underflow is corrected and
    /// logged once by the caller.
    pub fn sub_queued(&self, idx: usize, files: i32, bytes: i64) -> Result<bool> {
        let _g = self.lock_tfc(idx)?;
        let mut clamped = false;
        self.region.with_mut(idx, |h| {
            h.total_file_counter -= files;
            h.total_file_size -= bytes;
            if h.total_file_counter < 0 {
                h.total_file_counter = 0;
                clamped = true;
            }
            if h.total_file_size < 0 || h.total_file_counter == 0 {
                if h.total_file_size != 0 {
                    clamped = true;
                }
                h.total_file_size = h.total_file_size.max(0);
                if h.total_file_counter == 0 {
                    h.total_file_size = 0;
                }
            }
            h.jobs_queued = h.jobs_queued.saturating_sub(1);
        })?;
        Ok(clamped)
    }

    /// Record a delivery failure: bump the counter, shift the history ring
    /// (slot 0 is always the most recent code), stamp `first_error_time` on
    /// the healthy-to-warning edge.
    pub fn note_error(&self, idx: usize, code: u8, now: i64) -> Result<i32> {
        let _g = self.lock_ec(idx)?;
        let counter = self.region.with_mut(idx, |h| {
            h.error_counter += 1;
            for i in (1..ERROR_HISTORY_LEN).rev() {
                h.error_history[i] = h.error_history[i - 1];
            }
            h.error_history[0] = code;
            if h.first_error_time == 0 {
                h.first_error_time = now;
            }
            h.error_counter
        })?;
        Ok(counter)
    }

    /// Record a successful session: clear the error state and the transient
    /// offline/acknowledged flags.
    pub fn note_success(&self, idx: usize, now: i64) -> Result<()> {
        let _g = self.lock_ec(idx)?;
        self.region.with_mut(idx, |h| {
            if h.error_counter > 0 {
                h.successful_retries += 1;
            }
            h.error_counter = 0;
            h.first_error_time = 0;
            h.last_connection = now;
            h.host_status &= !(AUTO_PAUSE_QUEUE_STAT
                | HOST_ERROR_ACKNOWLEDGED_T
                | HOST_ERROR_OFFLINE_T
                | ERROR_QUEUE_SET);
        })?;
        Ok(())
    }

    /// Per-host success counters after one delivered file.
    pub fn note_file_done(&self, idx: usize, bytes: u64) -> Result<()> {
        let _g = self.lock_tfc(idx)?;
        self.region.with_mut(idx, |h| {
            h.file_counter_done = h.file_counter_done.saturating_add(1);
            h.bytes_send = h.bytes_send.saturating_add(bytes);
        })?;
        Ok(())
    }

    pub fn bump_connections(&self, idx: usize) -> Result<()> {
        let _g = self.lock_con(idx)?;
        self.region.with_mut(idx, |h| {
            h.connections = h.connections.saturating_add(1);
        })?;
        Ok(())
    }

    pub fn bump_nack(&self, idx: usize) -> Result<()> {
        let _g = self.lock_con(idx)?;
        self.region.with_mut(idx, |h| {
            h.nack_counter = h.nack_counter.saturating_add(1);
        })?;
        Ok(())
    }

    pub fn set_status_flags(&self, idx: usize, set: u32, clear: u32) -> Result<()> {
        let _g = self.lock_ec(idx)?;
        self.region.with_mut(idx, |h| {
            h.host_status = (h.host_status | set) & !clear;
        })?;
        Ok(())
    }

    pub fn set_debug(&self, idx: usize, level: i32) -> Result<()> {
        let _g = self.lock_con(idx)?;
        self.region.with_mut(idx, |h| h.debug_level = level)?;
        Ok(())
    }

    /// Flip the A/B toggle; returns the new position.
    pub fn toggle_host(&self, idx: usize) -> Result<u8> {
        let _g = self.lock_con(idx)?;
        self.region.with_mut(idx, |h| {
            h.host_toggle ^= 1;
            let pos = h.host_toggle;
            let alias = h.alias().to_string();
            let ch = h.toggle_str[(pos as usize).min(1)] as char;
            set_fixed_str(&mut h.host_dsp_name, &format!("{}{}", alias, ch));
            pos
        })
        .map_err(Into::into)
    }

    // -- slot operations ---------------------------------------------------

    /// Claim a free slot for a new worker session. Returns the slot index.
    pub fn claim_slot(&self, idx: usize, job_id: u32, scheme: u8) -> Result<Option<usize>> {
        let _g = self.lock_con(idx)?;
        let slot = self.region.with_mut(idx, |h| {
            let allowed = h.allowed_transfers.clamp(0, MAX_SLOTS as i32) as usize;
            for s in 0..allowed {
                if h.job_status[s].connect_state() == ConnectState::Disconnect {
                    h.job_status[s].connect_status = ConnectState::Connecting.as_u8();
                    h.job_status[s].job_id = job_id;
                    h.job_status[s].scheme = scheme;
                    h.job_status[s].pid = 0;
                    h.job_status[s].unique_name = [0; MAX_UNIQUE_NAME];
                    h.active_transfers += 1;
                    return Some(s);
                }
            }
            None
        })?;
        Ok(slot)
    }

    /// Rewind one slot to Disconnect (worker finished, died, or was killed).
    pub fn reset_slot(&self, idx: usize, slot: usize) -> Result<()> {
        let _g = self.lock_con(idx)?;
        self.region.with_mut(idx, |h| {
            if slot < MAX_SLOTS {
                h.job_status[slot] = unsafe { std::mem::zeroed() };
                if h.active_transfers > 0 {
                    h.active_transfers -= 1;
                }
            }
        })?;
        Ok(())
    }

    pub fn with_slot_mut<R>(
        &self,
        idx: usize,
        slot: usize,
        f: impl FnOnce(&mut HostSlot) -> R,
    ) -> Result<R> {
        let _g = self.lock_con(idx)?;
        let r = self.region.with_mut(idx, |h| f(&mut h.job_status[slot]))?;
        Ok(r)
    }

    pub fn read_slot(&self, idx: usize, slot: usize) -> Result<HostSlot, StateError> {
        self.region.with(idx, |h| h.job_status[slot])
    }

    /// Debug-build invariant check (see the host-entry contract).
    pub fn assert_host_invariants(&self, idx: usize) -> Result<(), String> {
        let h = self.region.read(idx).map_err(|e| e.to_string())?;
        if h.active_transfers < 0 || h.active_transfers > h.allowed_transfers {
            return Err(format!(
                "active_transfers {} outside 0..={}",
                h.active_transfers, h.allowed_transfers
            ));
        }
        if h.allowed_transfers > h.max_parallel {
            return Err("allowed_transfers above max_parallel".to_string());
        }
        if h.total_file_counter < 0 || h.total_file_size < 0 {
            return Err("negative queue counters".to_string());
        }
        if h.total_file_counter == 0 && h.total_file_size != 0 {
            return Err("file size without files".to_string());
        }
        if h.error_counter >= h.max_errors
            && h.max_errors > 0
            && h.host_status & ERROR_EXCUSED_MASK == 0
        {
            return Err("error counter at max without pause/offline/ack flag".to_string());
        }
        Ok(())
    }
}

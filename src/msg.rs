//! Message model: the unit of work between ingest and dispatch.
//!
//! 消息名即暂存目录名 — the canonical textual form of a message is also the
//! name of the staging directory that holds its files:
//! `<jobIdHex>/<dirNoHex>/<createHex>_<uniqueHex>_<splitHex>`, all lowercase
//! base-16 without padding.

use serde::{Deserialize, Serialize};

/// Parsed form of a message name. `parse(print(m)) == m` for every valid `m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgName {
    pub job_id: u32,
    pub dir_no: u32,
    pub creation_time: i64,
    pub unique_number: u32,
    pub split_job_counter: u32,
}

impl MsgName {
    pub fn parse(s: &str) -> Option<MsgName> {
        let mut parts = s.split('/');
        let job_id = u32::from_str_radix(parts.next()?, 16).ok()?;
        let dir_no = u32::from_str_radix(parts.next()?, 16).ok()?;
        let tail = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        let mut sub = tail.split('_');
        let creation_time = i64::from_str_radix(sub.next()?, 16).ok()?;
        let unique_number = u32::from_str_radix(sub.next()?, 16).ok()?;
        let split_job_counter = u32::from_str_radix(sub.next()?, 16).ok()?;
        if sub.next().is_some() {
            return None;
        }
        Some(MsgName { job_id, dir_no, creation_time, unique_number, split_job_counter })
    }
}

impl std::fmt::Display for MsgName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:x}/{:x}/{:x}_{:x}_{:x}",
            self.job_id, self.dir_no, self.creation_time, self.unique_number,
            self.split_job_counter
        )
    }
}

/// One queue element. Owned by the dispatcher once the ingest side has made
/// the staging directory fully visible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Single-character priority, `'0'` (highest) through `'9'`.
    pub priority: u8,
    pub creation_time: i64,
    pub unique_number: u32,
    pub split_job_counter: u32,
    pub job_id: u32,
    pub dir_no: u32,
    pub dir_id: u32,
    pub host_alias: String,
    pub files: u32,
    pub bytes: u64,
    /// Retries so far; carried into the output log.
    #[serde(default)]
    pub retries: u32,
    /// Epoch seconds before which the dispatcher must not pick this message.
    #[serde(default)]
    pub next_start_time: i64,
}

impl Message {
    pub fn name(&self) -> MsgName {
        MsgName {
            job_id: self.job_id,
            dir_no: self.dir_no,
            creation_time: self.creation_time,
            unique_number: self.unique_number,
            split_job_counter: self.split_job_counter,
        }
    }

    /// Relative staging path under `files/outgoing`.
    pub fn staging_rel(&self) -> String {
        self.name().to_string()
    }

    /// Sort key: priority first, then creation order.
    pub fn queue_key(&self) -> (u8, i64, u32) {
        (self.priority, self.creation_time, self.unique_number)
    }
}

//! The dispatch queue: in-memory mirror of every pending message, persisted
//! to `fifodir/msg.queue` (JSON lines, atomic rewrite) across restarts.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};

use crate::msg::{Message, MsgName};
use crate::state::fsa::Fsa;

/// Ordered by `(priority, creation_time, unique_number)`; selection skips
/// paused hosts and messages whose start time lies in the future.
#[derive(Default)]
pub struct MsgQueue {
    msgs: Vec<Message>,
    names: HashSet<MsgName>,
}

impl MsgQueue {
    pub fn new() -> MsgQueue {
        MsgQueue::default()
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn contains(&self, name: &MsgName) -> bool {
        self.names.contains(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.msgs.iter()
    }

    /// Insert keeping queue order. Duplicate names are dropped (the message
    /// is already mirrored).
    pub fn push(&mut self, msg: Message) {
        let name = msg.name();
        if !self.names.insert(name) {
            return;
        }
        let key = msg.queue_key();
        let at = self.msgs.partition_point(|m| m.queue_key() <= key);
        self.msgs.insert(at, msg);
    }

    /// Next message whose start time has come and whose host can accept a
    /// dispatch right now. Does not remove it.
    pub fn peek_ready(&self, fsa: &Fsa, now: i64) -> Option<&Message> {
        self.msgs.iter().find(|m| {
            m.next_start_time <= now
                && fsa
                    .find_host(&m.host_alias)
                    .and_then(|hi| fsa.with_host(hi, |h| h.dispatchable()).ok())
                    .unwrap_or(false)
        })
    }

    pub fn remove(&mut self, name: &MsgName) -> Option<Message> {
        if !self.names.remove(name) {
            return None;
        }
        let at = self.msgs.iter().position(|m| m.name() == *name)?;
        Some(self.msgs.remove(at))
    }

    /// Return a failed message to the queue with its retry bookkeeping.
    pub fn requeue(&mut self, mut msg: Message, retry_after: i64) {
        msg.retries += 1;
        msg.next_start_time = retry_after;
        self.push(msg);
    }

    /// Earliest future start time, for the dispatcher's poll interval.
    pub fn next_deferred(&self, now: i64) -> Option<i64> {
        self.msgs
            .iter()
            .map(|m| m.next_start_time)
            .filter(|&t| t > now)
            .min()
    }

    /// Drop every message whose job id is no longer catalogued. Returns the
    /// dropped messages so the caller can clean their staging directories.
    pub fn retain_jobs(&mut self, live: &HashSet<u32>) -> Vec<Message> {
        let mut dropped = Vec::new();
        let mut kept = Vec::with_capacity(self.msgs.len());
        for m in self.msgs.drain(..) {
            if live.contains(&m.job_id) {
                kept.push(m);
            } else {
                self.names.remove(&m.name());
                dropped.push(m);
            }
        }
        self.msgs = kept;
        dropped
    }

    // -- persistence -------------------------------------------------------

    pub fn load(path: &Path) -> Result<MsgQueue> {
        let mut q = MsgQueue::new();
        if !path.exists() {
            return Ok(q);
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("读取队列文件失败: {}", path.display()))?;
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(m) => q.push(m),
                Err(e) => tracing::warn!("[fd] 队列行损坏，跳过: {} ({})", line, e),
            }
        }
        Ok(q)
    }

    /// Atomic rewrite: temp file then rename.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        for m in &self.msgs {
            out.push_str(&serde_json::to_string(m)?);
            out.push('\n');
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, out)
            .with_context(|| format!("写队列文件失败: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("发布队列文件失败: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(prio: u8, unique: u32, host: &str) -> Message {
        Message {
            priority: prio,
            creation_time: 1000,
            unique_number: unique,
            split_job_counter: 0,
            job_id: 0xaa,
            dir_no: 0,
            dir_id: 0xbb,
            host_alias: host.to_string(),
            files: 1,
            bytes: 10,
            retries: 0,
            next_start_time: 0,
        }
    }

    #[test]
    fn ordering_and_dedup() {
        let mut q = MsgQueue::new();
        q.push(msg(b'5', 2, "a"));
        q.push(msg(b'1', 3, "a"));
        q.push(msg(b'5', 1, "a"));
        q.push(msg(b'5', 1, "a")); // duplicate name
        assert_eq!(q.len(), 3);
        let order: Vec<u32> = q.iter().map(|m| m.unique_number).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn persistence_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("msg.queue");
        let mut q = MsgQueue::new();
        q.push(msg(b'3', 7, "alpha"));
        q.push(msg(b'1', 8, "beta"));
        q.persist(&path).expect("persist");
        let q2 = MsgQueue::load(&path).expect("load");
        assert_eq!(q2.len(), 2);
        let order: Vec<u32> = q2.iter().map(|m| m.unique_number).collect();
        assert_eq!(order, vec![8, 7]);
    }

    #[test]
    fn requeue_bumps_retry_and_defers() {
        let mut q = MsgQueue::new();
        let m = msg(b'5', 1, "a");
        q.push(m.clone());
        let taken = q.remove(&m.name()).expect("take");
        q.requeue(taken, 5000);
        let m2 = q.iter().next().expect("there");
        assert_eq!(m2.retries, 1);
        assert_eq!(m2.next_start_time, 5000);
        assert_eq!(q.next_deferred(1000), Some(5000));
    }

    #[test]
    fn retain_jobs_drops_orphans() {
        let mut q = MsgQueue::new();
        q.push(msg(b'5', 1, "a"));
        let mut other = msg(b'5', 2, "a");
        other.job_id = 0xdead;
        q.push(other);
        let live: HashSet<u32> = [0xaau32].into_iter().collect();
        let dropped = q.retain_jobs(&live);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].job_id, 0xdead);
        assert_eq!(q.len(), 1);
    }
}

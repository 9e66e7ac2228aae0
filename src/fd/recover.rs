//! Crash recovery: sweep the staging tree and reconcile it with the job
//! catalogue and the queue mirror.
//!
//! 三层遍历 `outgoing/<jobId>/<dirNo>/<msgName>`：目录名即消息名；目录不在
//! JID 目录中则整棵删除，不在队列中且非空则按目录名重建消息重新入队。

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::WorkDir;
use crate::control;
use crate::logging::{DR_RECOVERY_ORPHAN, DeleteLog};
use crate::msg::{Message, MsgName};
use crate::state::jid::Jid;

use super::queue::MsgQueue;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub requeued: usize,
    pub removed_orphans: usize,
    pub removed_empty: usize,
}

fn dir_entries(path: &Path) -> Vec<std::fs::DirEntry> {
    std::fs::read_dir(path).map(|rd| rd.flatten().collect()).unwrap_or_default()
}

fn staging_contents(path: &Path) -> (u32, u64) {
    let mut files = 0u32;
    let mut bytes = 0u64;
    for e in dir_entries(path) {
        if let Ok(meta) = e.metadata()
            && meta.is_file()
        {
            files += 1;
            bytes += meta.len();
        }
    }
    (files, bytes)
}

/// Walk the staging tree three levels deep and reconcile every message
/// directory found there.
pub fn check_file_dir(
    work: &WorkDir,
    jid: &Jid,
    queue: &mut MsgQueue,
    delete_log: &DeleteLog,
    now: i64,
) -> Result<RecoveryStats> {
    let mut stats = RecoveryStats::default();
    let outgoing = work.outgoing_dir();
    if !outgoing.is_dir() {
        return Ok(stats);
    }
    for job_ent in dir_entries(&outgoing) {
        if !job_ent.path().is_dir() {
            continue;
        }
        let job_name = job_ent.file_name().to_string_lossy().to_string();
        for dirno_ent in dir_entries(&job_ent.path()) {
            if !dirno_ent.path().is_dir() {
                continue;
            }
            let dirno_name = dirno_ent.file_name().to_string_lossy().to_string();
            for msg_ent in dir_entries(&dirno_ent.path()) {
                if !msg_ent.path().is_dir() {
                    continue;
                }
                let tail = msg_ent.file_name().to_string_lossy().to_string();
                let full = format!("{}/{}/{}", job_name, dirno_name, tail);
                let Some(name) = MsgName::parse(&full) else {
                    tracing::warn!("[fd][recover] 目录名不合法，移除: {}", full);
                    let _ = std::fs::remove_dir_all(msg_ent.path());
                    stats.removed_orphans += 1;
                    continue;
                };
                let Some(job) = jid.lookup(name.job_id) else {
                    // the job vanished from the catalogue: nothing will ever
                    // pick this up
                    tracing::warn!("[fd][recover] job {:x} 已不存在，移除 {}", name.job_id, full);
                    let (_files, bytes) = staging_contents(&msg_ent.path());
                    let _ = delete_log.write(DR_RECOVERY_ORPHAN, &full, bytes, name.job_id, now);
                    let _ = std::fs::remove_dir_all(msg_ent.path());
                    stats.removed_orphans += 1;
                    continue;
                };
                if queue.contains(&name) {
                    continue;
                }
                let (files, bytes) = staging_contents(&msg_ent.path());
                if files == 0 {
                    let _ = std::fs::remove_dir(msg_ent.path());
                    stats.removed_empty += 1;
                    continue;
                }
                // re-enqueue with the original identity reconstructed from
                // the directory name
                queue.push(Message {
                    priority: job.priority,
                    creation_time: name.creation_time,
                    unique_number: name.unique_number,
                    split_job_counter: name.split_job_counter,
                    job_id: name.job_id,
                    dir_no: name.dir_no,
                    dir_id: job.dir_id,
                    host_alias: job.host_alias().to_string(),
                    files,
                    bytes,
                    retries: 0,
                    next_start_time: 0,
                });
                tracing::info!("[fd][recover] 重新入队: {} ({} 文件)", full, files);
                stats.requeued += 1;
            }
            let _ = std::fs::remove_dir(dirno_ent.path()); // only if empty
        }
        let _ = std::fs::remove_dir(job_ent.path()); // only if empty
    }
    Ok(stats)
}

/// Drop queued messages whose job id fell out of the catalogue after a
/// reread, removing their staging directories too.
pub fn drop_orphaned_messages(
    work: &WorkDir,
    jid: &Jid,
    queue: &mut MsgQueue,
    delete_log: &DeleteLog,
    now: i64,
) -> usize {
    let live: HashSet<u32> = (0..jid.len())
        .filter_map(|i| jid.lookup_at(i))
        .map(|j| j.job_id)
        .collect();
    let dropped = queue.retain_jobs(&live);
    for m in &dropped {
        let staging = work.staging_dir(&m.name().to_string());
        let _ = delete_log.write(DR_RECOVERY_ORPHAN, &m.name().to_string(), m.bytes, m.job_id, now);
        let _ = std::fs::remove_dir_all(staging);
    }
    dropped.len()
}

/// The standalone sweep (`dp recover`): ask a live dispatcher to flush and
/// dump its queue first; fall back to the persisted file when it is offline.
pub fn run_standalone(work: &WorkDir, handshake_timeout: Duration) -> Result<RecoveryStats> {
    crate::fifo::mkfifo_if_missing(&work.fd_cmd_fifo())?;
    crate::fifo::mkfifo_if_missing(&work.queue_list_ready_fifo())?;
    crate::fifo::mkfifo_if_missing(&work.queue_list_done_fifo())?;

    let _ = crate::fifo::write_opcode(&work.fd_cmd_fifo(), control::FLUSH_MSG_FIFO_DUMP_QUEUE);
    match crate::fifo::await_opcode(&work.queue_list_ready_fifo(), handshake_timeout)? {
        Some(_) => {}
        None => {
            // the documented behaviour on expiry: warn and continue with the
            // file as it is
            tracing::warn!(
                "[recover] 等待 QUEUE_LIST_READY 超时 ({:?})，继续使用现有队列文件",
                handshake_timeout
            );
        }
    }

    let jid = Jid::attach(&work.jid_file()).with_context(|| "JID attach 失败")?;
    let mut queue = MsgQueue::load(&work.msg_queue_file())?;
    let delete_log = DeleteLog::open(&work.log_dir())?;
    let now = chrono::Utc::now().timestamp();
    let stats = check_file_dir(work, &jid, &mut queue, &delete_log, now)?;
    queue.persist(&work.msg_queue_file())?;
    let _ = crate::fifo::write_opcode(&work.queue_list_done_fifo(), control::QUEUE_LIST_DONE);
    tracing::info!(
        "[recover] 完成: {} 重入队, {} 孤儿移除, {} 空目录",
        stats.requeued,
        stats.removed_orphans,
        stats.removed_empty
    );
    Ok(stats)
}

//! FD: the dispatch daemon. Owns the queue mirror and the worker pool,
//! selects over the command/wake/finish pipes, and folds worker exits back
//! into host health and the queue.

pub mod dispatch;
pub mod health;
pub mod queue;
pub mod recover;

use std::io::{BufRead, BufReader};
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{Sender, tick, unbounded};

use crate::archive::Archiver;
use crate::config::{Config, WorkDir};
use crate::control;
use crate::dupcheck::DupCheck;
use crate::logging::DeleteLog;
use crate::msg::{Message, MsgName};
use crate::options::parse_send_options;
use crate::state::fsa::{Fsa, PAUSE_QUEUE_STAT};
use crate::state::jid::Jid;

use dispatch::Dispatcher;
use health::Disposition;
use queue::MsgQueue;

pub struct Fd {
    pub work: WorkDir,
    pub cfg: Config,
}

enum Cmd {
    Op(u8),
    OpHost(u8, u8),
}

impl Fd {
    pub fn new(work: WorkDir, cfg: Config) -> Fd {
        Fd { work, cfg }
    }

    fn setup_fifos(&self) -> Result<()> {
        for p in [
            self.work.msg_fifo(),
            self.work.fd_cmd_fifo(),
            self.work.fd_wake_up_fifo(),
            self.work.sf_fin_fifo(),
            self.work.queue_list_ready_fifo(),
            self.work.queue_list_done_fifo(),
        ] {
            crate::fifo::mkfifo_if_missing(&p)?;
        }
        Ok(())
    }

    /// Wait for the ingest daemon to publish the shared regions.
    fn attach_state(&self, stop: &Arc<AtomicBool>) -> Result<Option<(Fsa, Jid)>> {
        loop {
            if stop.load(Ordering::SeqCst) {
                return Ok(None);
            }
            match (Fsa::attach(&self.work.fsa_file()), Jid::attach(&self.work.jid_file())) {
                (Ok(fsa), Ok(jid)) => return Ok(Some((fsa, jid))),
                _ => {
                    tracing::info!("[fd] 等待共享区域发布 ...");
                    std::thread::sleep(Duration::from_millis(500));
                }
            }
        }
    }

    /// Daemon main loop. Returns when `stop` is raised or SHUTDOWN arrives.
    pub fn run(&self, stop: Arc<AtomicBool>) -> Result<()> {
        self.work.ensure_layout()?;
        self.setup_fifos()?;
        let Some((mut fsa, mut jid)) = self.attach_state(&stop)? else {
            return Ok(());
        };

        let delete_log = DeleteLog::open(&self.work.log_dir())?;
        let mut queue = MsgQueue::load(&self.work.msg_queue_file())?;
        let now = chrono::Utc::now().timestamp();
        let stats = recover::check_file_dir(&self.work, &jid, &mut queue, &delete_log, now)?;
        if stats != recover::RecoveryStats::default() {
            tracing::info!(
                "[fd] 启动恢复: {} 重入队, {} 孤儿, {} 空目录",
                stats.requeued,
                stats.removed_orphans,
                stats.removed_empty
            );
        }
        queue.persist(&self.work.msg_queue_file())?;

        // pipe readers feed the select loop through channels
        let (msg_tx, msg_rx) = unbounded::<Message>();
        let (cmd_tx, cmd_rx) = unbounded::<Cmd>();
        let (exit_tx, exit_rx) = unbounded::<(u32, ExitStatus)>();
        spawn_msg_reader(self.work.clone(), msg_tx);
        spawn_cmd_reader(self.work.clone(), cmd_tx);
        // wake-up nudges and worker fin pids are advisory; drain them so the
        // pipes never fill (child exits are tracked through waitpid)
        spawn_drain(self.work.fd_wake_up_fifo());
        spawn_drain(self.work.sf_fin_fifo());

        let mut dispatcher = Dispatcher::new(self.work.clone());
        let mut accepting = true;
        let mut dirty = false;
        let pacing = tick(Duration::from_millis(500));
        let mut last_purge = now;
        let mut last_archive_sweep = now;

        while !stop.load(Ordering::SeqCst) {
            crossbeam_channel::select! {
                recv(msg_rx) -> m => {
                    if let Ok(m) = m {
                        tracing::info!("[fd] 收到消息: {} -> {}", m.name(), m.host_alias);
                        queue.push(m);
                        dirty = true;
                    }
                }
                recv(exit_rx) -> e => {
                    if let Ok((pid, status)) = e {
                        self.handle_exit(&fsa, &mut queue, &mut dispatcher, &delete_log, pid, status)?;
                        dirty = true;
                    }
                }
                recv(cmd_rx) -> c => {
                    if let Ok(cmd) = c {
                        let quit = self.handle_cmd(
                            cmd,
                            &mut fsa,
                            &mut jid,
                            &mut queue,
                            &delete_log,
                            &mut accepting,
                        )?;
                        if quit {
                            stop.store(true, Ordering::SeqCst);
                        }
                        dirty = true;
                    }
                }
                recv(pacing) -> _ => {}
            }

            // send-window gating lives in Message::next_start_time (set at
            // materialise time); the dispatch cycle below is the only gate
            let now = chrono::Utc::now().timestamp();
            if accepting {
                self.dispatch_cycle(&fsa, &jid, &mut queue, &mut dispatcher, &exit_tx, now)?;
            }
            if queue.len() > self.cfg.danger_no_of_jobs {
                tracing::warn!(
                    "[fd] 队列长度 {} 超过警戒值 {}",
                    queue.len(),
                    self.cfg.danger_no_of_jobs
                );
            }
            if dirty {
                queue.persist(&self.work.msg_queue_file())?;
                dirty = false;
            }
            if now - last_purge > 60 {
                last_purge = now;
                if let Ok(dup) =
                    DupCheck::open(&self.work.dup_db_file(), &self.work.store_dir())
                    && let Ok(n) = dup.purge_expired(now)
                    && n > 0
                {
                    tracing::info!("[fd] 判重表清理 {} 条过期记录", n);
                }
            }
            if now - last_archive_sweep > 3600 {
                last_archive_sweep = now;
                self.sweep_archive(now);
            }
        }
        queue.persist(&self.work.msg_queue_file())?;
        tracing::info!("[fd] 退出，队列已落盘 ({} 条)", queue.len());
        Ok(())
    }

    /// Hourly archive reaper: buckets past their retention epoch are
    /// removed. Retention units come from each job's `archive` option.
    fn sweep_archive(&self, now: i64) {
        let Ok(rules) = crate::ruledb::load_amg_data(&self.work.amg_data_file()) else {
            return;
        };
        let archiver = Archiver::new(self.work.archive_dir(), self.cfg.archive_unit);
        let archive_time_of = |job_id: u32| {
            rules
                .iter()
                .find(|r| r.job_id() == job_id)
                .map(|r| parse_send_options(&r.std_options).archive_time)
        };
        match archiver.purge_expired(now, archive_time_of) {
            Ok(n) if n > 0 => tracing::info!("[fd] 归档清理 {} 个过期桶", n),
            Ok(_) => {}
            Err(e) => tracing::warn!("[fd] 归档清理失败: {}", e),
        }
    }

    /// Start workers (or grant bursts) for every ready message that can go
    /// out right now.
    fn dispatch_cycle(
        &self,
        fsa: &Fsa,
        jid: &Jid,
        queue: &mut MsgQueue,
        dispatcher: &mut Dispatcher,
        exit_tx: &Sender<(u32, ExitStatus)>,
        now: i64,
    ) -> Result<()> {
        if queue.peek_ready(fsa, now).is_none() {
            return Ok(());
        }
        let candidates: Vec<MsgName> = queue
            .iter()
            .filter(|m| m.next_start_time <= now)
            .map(|m| m.name())
            .collect();
        for name in candidates {
            let Some(info) = queue.iter().find(|m| m.name() == name).cloned() else {
                continue;
            };
            let Some(hi) = fsa.find_host(&info.host_alias) else {
                continue;
            };
            let dispatchable = fsa.with_host(hi, |h| h.dispatchable()).unwrap_or(false);
            if !dispatchable {
                continue;
            }
            let scheme = jid.lookup(info.job_id).map(|j| j.scheme).unwrap_or(0);
            match fsa.claim_slot(hi, info.job_id, scheme)? {
                Some(slot) => {
                    let Some(msg) = queue.remove(&name) else {
                        let _ = fsa.reset_slot(hi, slot);
                        continue;
                    };
                    if let Err(e) =
                        dispatcher.spawn_worker(fsa, hi, slot, msg.clone(), exit_tx.clone())
                    {
                        tracing::error!("[fd] worker 启动失败: {}", e);
                        let _ = fsa.reset_slot(hi, slot);
                        queue.requeue(msg, now + self.cfg.default_retry_interval as i64);
                    }
                }
                None => {
                    // every slot busy: try to piggyback on an open session
                    if dispatcher.grant_burst(fsa, hi, &info) {
                        let _ = queue.remove(&name);
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_exit(
        &self,
        fsa: &Fsa,
        queue: &mut MsgQueue,
        dispatcher: &mut Dispatcher,
        delete_log: &DeleteLog,
        pid: u32,
        status: ExitStatus,
    ) -> Result<()> {
        let Some(outcome) = dispatcher.reap(fsa, pid, status) else {
            return Ok(());
        };
        let now = chrono::Utc::now().timestamp();
        let disposition = health::on_worker_exit(
            fsa,
            outcome.worker.host_idx,
            &outcome.result,
            self.cfg.default_retry_interval as i64,
        )?;
        let msg = outcome.worker.msg.clone();
        match disposition {
            Disposition::Done => {}
            Disposition::Requeue(delay) => {
                if self.work.staging_dir(&msg.name().to_string()).is_dir() {
                    tracing::info!(
                        "[fd] {} 将在 {} 秒后重试 (第 {} 次)",
                        msg.name(),
                        delay,
                        msg.retries + 1
                    );
                    queue.requeue(msg, now + delay);
                } // a vanished staging dir means the session finished the files
            }
            Disposition::Cancel => {
                self.cancel_message(fsa, delete_log, &msg, now)?;
            }
        }
        if let Some(b) = outcome.unclaimed_burst {
            tracing::info!("[fd] 未认领的 burst 重新入队: {}", b.name());
            queue.push(b);
        }
        for b in outcome.accepted_bursts {
            // an accepted burst whose staging dir survived the session was
            // interrupted mid-delivery
            if self.work.staging_dir(&b.name().to_string()).is_dir() {
                queue.requeue(b, now + self.cfg.default_retry_interval as i64);
            }
        }
        Ok(())
    }

    /// Drop a message for good: remove what is left of its staging directory
    /// and release its queue accounting.
    fn cancel_message(
        &self,
        fsa: &Fsa,
        delete_log: &DeleteLog,
        msg: &Message,
        now: i64,
    ) -> Result<()> {
        let staging = self.work.staging_dir(&msg.name().to_string());
        let mut files = 0i32;
        let mut bytes = 0i64;
        if let Ok(rd) = std::fs::read_dir(&staging) {
            for e in rd.flatten() {
                if let Ok(meta) = e.metadata()
                    && meta.is_file()
                {
                    files += 1;
                    bytes += meta.len() as i64;
                }
            }
        }
        let _ = std::fs::remove_dir_all(&staging);
        if files > 0
            && let Some(hi) = fsa.find_host(&msg.host_alias)
        {
            let clamped = fsa.sub_queued(hi, files, bytes)?;
            if clamped {
                tracing::warn!("[fd] 取消 {} 时计数器越界，已校正为 0", msg.name());
            }
        }
        let _ = delete_log.write(
            crate::logging::DR_RECOVERY_ORPHAN,
            &msg.name().to_string(),
            bytes as u64,
            msg.job_id,
            now,
        );
        tracing::warn!("[fd] 消息取消: {} ({} 文件)", msg.name(), files);
        Ok(())
    }

    fn handle_cmd(
        &self,
        cmd: Cmd,
        fsa: &mut Fsa,
        jid: &mut Jid,
        queue: &mut MsgQueue,
        delete_log: &DeleteLog,
        accepting: &mut bool,
    ) -> Result<bool> {
        match cmd {
            Cmd::Op(control::SHUTDOWN) => {
                tracing::info!("[fd] 收到 SHUTDOWN");
                return Ok(true);
            }
            Cmd::Op(control::CHECK_FSA_ENTRIES) => {
                if fsa.check_generation().is_err() {
                    tracing::info!("[fd] FSA 世代变化，重新 attach");
                    fsa.reattach().with_context(|| "FSA 重新 attach 失败")?;
                }
                if jid.check_generation().is_err() {
                    jid.reattach().with_context(|| "JID 重新 attach 失败")?;
                }
            }
            Cmd::Op(control::REREAD_DIR_CONFIG) => {
                // the external parser republished the rule database; the
                // ingest daemon rebuilds the regions, we re-attach and sweep
                if fsa.check_generation().is_err() {
                    fsa.reattach()?;
                }
                if jid.check_generation().is_err() {
                    jid.reattach()?;
                }
                let now = chrono::Utc::now().timestamp();
                let dropped =
                    recover::drop_orphaned_messages(&self.work, jid, queue, delete_log, now);
                if dropped > 0 {
                    tracing::info!("[fd] 配置重读后丢弃 {} 条孤儿消息", dropped);
                }
            }
            Cmd::Op(control::FLUSH_MSG_FIFO_DUMP_QUEUE) => {
                *accepting = false;
                queue.persist(&self.work.msg_queue_file())?;
                let op = if queue.is_empty() {
                    control::QUEUE_LIST_EMPTY
                } else {
                    control::QUEUE_LIST_READY
                };
                let _ = crate::fifo::write_opcode(&self.work.queue_list_ready_fifo(), op);
                let timeout = Duration::from_secs(self.cfg.queue_handshake_timeout_secs);
                match crate::fifo::await_opcode(&self.work.queue_list_done_fifo(), timeout)? {
                    Some(_) => {}
                    None => {
                        tracing::warn!(
                            "[fd] 等待 QUEUE_LIST_DONE 超时 ({:?})，继续运行",
                            timeout
                        );
                    }
                }
                // the sweep may have rewritten the file underneath us
                *queue = MsgQueue::load(&self.work.msg_queue_file())?;
                *accepting = true;
            }
            Cmd::Op(op) => {
                tracing::warn!("[fd] 未知指令: {} ({})", op, control::opcode_name(op));
            }
            Cmd::OpHost(control::PAUSE_HOST, hi) => {
                fsa.set_status_flags(hi as usize, PAUSE_QUEUE_STAT, 0)?;
                tracing::info!("[fd] host#{} 已暂停", hi);
            }
            Cmd::OpHost(control::RESUME_HOST, hi) => {
                fsa.set_status_flags(hi as usize, 0, PAUSE_QUEUE_STAT)?;
                tracing::info!("[fd] host#{} 已恢复", hi);
            }
            Cmd::OpHost(control::DEBUG_ON, hi) => {
                let _ = fsa.set_debug(hi as usize, 1);
            }
            Cmd::OpHost(control::DEBUG_OFF, hi) => {
                let _ = fsa.set_debug(hi as usize, 0);
            }
            Cmd::OpHost(op, _) => {
                tracing::warn!("[fd] 未知主机指令: {}", op);
            }
        }
        Ok(false)
    }
}

fn spawn_msg_reader(work: WorkDir, tx: Sender<Message>) {
    std::thread::spawn(move || {
        let Ok(f) = crate::fifo::open_rw(&work.msg_fifo()) else {
            tracing::error!("[fd] 无法打开消息管道");
            return;
        };
        let reader = BufReader::new(f);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Message>(line) {
                        Ok(m) => {
                            if tx.send(m).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("[fd] 消息行损坏: {} ({})", line, e),
                    }
                }
                Err(e) => {
                    tracing::warn!("[fd] 消息管道读取失败: {}", e);
                    break;
                }
            }
        }
    });
}

fn spawn_drain(path: std::path::PathBuf) {
    std::thread::spawn(move || {
        use std::io::Read;
        let Ok(mut f) = crate::fifo::open_rw(&path) else {
            return;
        };
        let mut buf = [0u8; 256];
        while f.read(&mut buf).is_ok() {}
    });
}

fn spawn_cmd_reader(work: WorkDir, tx: Sender<Cmd>) {
    std::thread::spawn(move || {
        let Ok(mut f) = crate::fifo::open_rw(&work.fd_cmd_fifo()) else {
            tracing::error!("[fd] 无法打开命令管道");
            return;
        };
        loop {
            let Ok(op) = crate::fifo::read_opcode(&mut f) else {
                break;
            };
            let cmd = if control::takes_host_byte(op) {
                match crate::fifo::read_opcode(&mut f) {
                    Ok(hi) => Cmd::OpHost(op, hi),
                    Err(_) => break,
                }
            } else {
                Cmd::Op(op)
            };
            if tx.send(cmd).is_err() {
                break;
            }
        }
    });
}

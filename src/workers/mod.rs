//! Protocol workers: one delivery session per process.
//!
//! 会话状态机：Init → Connect → [Auth] → ChangeDir → 循环{选文件 → [加锁名] →
//! 传输 → [重命名] → [chmod] → [归档|删除] → 确认} → [Burst?] → Close。任何
//! 状态都可能落入带种类的错误；退出码是调度方唯一依赖的契约。

pub mod local;
pub mod ratelimit;
pub mod scp;
pub mod sftp;

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::DeliveryError;
use crate::archive::Archiver;
use crate::config::{Config, WorkDir};
use crate::dupcheck::{DC_ACTION_DELETE, DupCheck, compute_crc};
use crate::logging::{
    DR_AGE_OUTPUT, DR_DUP_OUTPUT, DeleteLog, OT_AGE_LIMIT_DELETE, OT_NORMAL_DELIVERED, OutputLog,
    OutputRecord,
};
use crate::msg::MsgName;
use crate::options::{LockMode, SendOptions, parse_local_options, parse_send_options};
use crate::rename::RenameRules;
use crate::ruledb::{JobRule, Recipient, Scheme};
use crate::state::fsa::{ConnectState, Fsa, HostEntry, MAX_UNIQUE_NAME, OPT_SORT_FILE_NAMES};
use crate::state::{fixed_str, set_fixed_str};
use ratelimit::RateLimiter;

/// The fixed operation set every protocol client exposes. FTP/HTTP/SMTP/WMO
/// clients are external collaborators behind this same seam.
pub trait DeliveryClient {
    fn connect(&mut self) -> Result<(), DeliveryError>;
    fn change_dir(&mut self, dir: &str) -> Result<(), DeliveryError>;
    fn open_remote(&mut self, name: &str) -> Result<(), DeliveryError>;
    fn write_block(&mut self, buf: &[u8]) -> Result<(), DeliveryError>;
    fn close_remote(&mut self) -> Result<(), DeliveryError>;
    fn rename_remote(&mut self, from: &str, to: &str) -> Result<(), DeliveryError>;
    fn chmod_remote(&mut self, name: &str, mode: u32) -> Result<(), DeliveryError>;
    fn delete_remote(&mut self, name: &str) -> Result<(), DeliveryError>;
    fn disconnect(&mut self);
}

/// Launch parameters a worker child receives from the dispatcher.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub work: WorkDir,
    pub cfg: Config,
    pub host_idx: usize,
    pub slot: usize,
    pub msg_name: String,
    pub toggle_hint: Option<u8>,
    pub retries: u32,
}

struct StagedFile {
    path: PathBuf,
    name: String,
    size: u64,
    mtime: i64,
}

fn list_staging(dir: &Path, sort_by_mtime: bool) -> Result<Vec<StagedFile>, DeliveryError> {
    let rd = std::fs::read_dir(dir)
        .map_err(|e| DeliveryError::Stat(format!("{}: {}", dir.display(), e)))?;
    let mut files = Vec::new();
    for ent in rd {
        let ent = ent.map_err(|e| DeliveryError::Stat(format!("{}: {}", dir.display(), e)))?;
        let meta = match ent.metadata() {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        files.push(StagedFile {
            path: ent.path(),
            name: ent.file_name().to_string_lossy().to_string(),
            size: meta.len(),
            mtime,
        });
    }
    if sort_by_mtime {
        // stable for equal mtimes
        files.sort_by(|a, b| a.mtime.cmp(&b.mtime).then_with(|| a.name.cmp(&b.name)));
    } else {
        files.sort_by(|a, b| a.name.cmp(&b.name));
    }
    Ok(files)
}

/// Resets the claimed slot and signals the dispatcher on the way out, even
/// on panic or error return.
struct SlotGuard<'a> {
    fsa: &'a Fsa,
    host_idx: usize,
    slot: usize,
    fin_fifo: PathBuf,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let _ = self.fsa.reset_slot(self.host_idx, self.slot);
        let pid = std::process::id();
        let _ = crate::fifo::write_bytes(&self.fin_fifo, &pid.to_ne_bytes());
    }
}

fn build_client(
    recipient: &Recipient,
    host: &HostEntry,
    timeout_secs: i64,
) -> Result<Box<dyn DeliveryClient>, DeliveryError> {
    match recipient.scheme {
        Scheme::Local => Ok(Box::new(local::LocalClient::new(recipient))),
        Scheme::Sftp => Ok(Box::new(sftp::SftpClient::new(recipient, host, timeout_secs))),
        Scheme::Scp => Ok(Box::new(scp::ScpClient::new(recipient, host, timeout_secs))),
        other => Err(DeliveryError::UnsupportedScheme(format!("{:?}", other))),
    }
}

/// Upload name for a lock mode, plus whether a rename-into-place follows.
fn lock_names(mode: &LockMode, final_name: &str) -> (String, bool) {
    match mode {
        LockMode::Off => (final_name.to_string(), false),
        LockMode::Dot => (format!(".{}", final_name), true),
        LockMode::DotVms => (format!(".{}.", final_name), true),
        LockMode::LockFile(_) => (final_name.to_string(), false),
    }
}

/// Context shared by every file of one session.
struct SessionCtx<'a> {
    fsa: &'a Fsa,
    host_idx: usize,
    slot: usize,
    host: HostEntry,
    send_opts: SendOptions,
    age_limit: u64,
    rename_rules: RenameRules,
    dup: Option<DupCheck>,
    archiver: Archiver,
    output_log: OutputLog,
    delete_log: DeleteLog,
    limiter: RateLimiter,
    block_size: usize,
    retries: u32,
}

impl SessionCtx<'_> {
    fn final_name(&self, name: &str) -> String {
        if let Some(ref set_name) = self.send_opts.trans_rename
            && let Some(set) = self.rename_rules.get(set_name)
            && let Some(renamed) = set.apply(name)
        {
            return renamed;
        }
        name.to_string()
    }
}

/// Deliver one staged file over an open connection. On success the staged
/// source has been archived or unlinked and the output log carries a record.
fn deliver_one(
    ctx: &mut SessionCtx<'_>,
    client: &mut dyn DeliveryClient,
    file: &StagedFile,
    msg: &MsgName,
    host_alias: &str,
    user: &str,
    now: i64,
) -> Result<bool, DeliveryError> {
    // send-side duplicate check, scoped by job id
    let mut dup_crc: Option<u32> = None;
    if let Some(ref dup) = ctx.dup {
        let flags = ctx.send_opts.dup_check_flag;
        let crc = compute_crc(Some(&file.path), &file.name, flags)
            .map_err(|e| DeliveryError::OpenLocal(e.to_string()))?;
        let is_dup = dup
            .check_insert(msg.job_id, crc, ctx.send_opts.dup_check_timeout, now)
            .map_err(|e| DeliveryError::Alloc(e.to_string()))?;
        if is_dup {
            tracing::warn!("[fd][worker] 重复文件: {} (job {:x})", file.name, msg.job_id);
            let _ = ctx.delete_log.write(DR_DUP_OUTPUT, &file.name, file.size, msg.job_id, now);
            if ctx.send_opts.dup_check_flag & DC_ACTION_DELETE != 0 {
                std::fs::remove_file(&file.path)
                    .map_err(|e| DeliveryError::WriteLocal(e.to_string()))?;
                return Ok(false);
            }
        }
        dup_crc = Some(crc);
    }

    let final_name = ctx.final_name(&file.name);
    let (upload_name, needs_rename) = lock_names(&ctx.send_opts.lock_mode, &final_name);
    let started = Instant::now();

    let result: Result<(), DeliveryError> = (|| {
        if let LockMode::LockFile(ref sentinel) = ctx.send_opts.lock_mode {
            client.open_remote(sentinel)?;
            client.close_remote()?;
        }
        client.open_remote(&upload_name)?;
        let _ = ctx.fsa.with_slot_mut(ctx.host_idx, ctx.slot, |s| {
            set_fixed_str(&mut s.file_name_in_use, &file.name);
            s.file_size_in_use = file.size;
            s.file_size_in_use_done = 0;
        });
        let mut src_file = std::fs::File::open(&file.path)
            .map_err(|e| DeliveryError::OpenLocal(format!("{}: {}", file.path.display(), e)))?;
        let mut buf = vec![0u8; ctx.limiter.block_size(ctx.block_size)];
        loop {
            use std::io::Read;
            let n = src_file
                .read(&mut buf)
                .map_err(|e| DeliveryError::OpenLocal(format!("本地读: {}", e)))?;
            if n == 0 {
                break;
            }
            if ctx.limiter.enabled() {
                ctx.limiter.take(n as u64);
            }
            client.write_block(&buf[..n])?;
            let _ = ctx.fsa.with_slot_mut(ctx.host_idx, ctx.slot, |s| {
                s.file_size_in_use_done += n as u64;
                s.bytes_send += n as u64;
            });
        }
        client.close_remote()?;
        if needs_rename {
            client.rename_remote(&upload_name, &final_name)?;
        }
        if let Some(mode) = ctx.send_opts.chmod {
            client.chmod_remote(&final_name, mode)?;
        }
        if let LockMode::LockFile(ref sentinel) = ctx.send_opts.lock_mode {
            client
                .delete_remote(sentinel)
                .map_err(|e| DeliveryError::RemoveLockfile(e.to_string()))?;
        }
        Ok(())
    })();

    if let Err(e) = result {
        // rollback: the digest was recorded before the send was confirmed
        if let (Some(crc), Some(ref dup)) = (dup_crc, ctx.dup.as_ref()) {
            let _ = dup.remove(msg.job_id, crc);
        }
        // best effort: do not leave a half-written lock name behind
        if needs_rename {
            let _ = client.delete_remote(&upload_name);
        }
        return Err(e);
    }

    // archive or unlink the staged source
    let archive_path = if ctx.send_opts.archive_time > 0 {
        let dst = ctx
            .archiver
            .archive(&file.path, host_alias, user, msg.job_id, now)
            .map_err(|e| DeliveryError::WriteLocal(e.to_string()))?;
        Some(dst.to_string_lossy().to_string())
    } else {
        std::fs::remove_file(&file.path)
            .map_err(|e| DeliveryError::WriteLocal(format!("{}: {}", file.path.display(), e)))?;
        None
    };

    let clocks = started.elapsed().as_millis().min(u32::MAX as u128) as u32;
    let rec = OutputRecord {
        file_name: final_name,
        archive_path,
        unique_name: msg.to_string(),
        file_size: file.size.min(u32::MAX as u64) as u32,
        job_id: msg.job_id,
        retries: ctx.retries,
        transfer_clocks: clocks,
        output_type: OT_NORMAL_DELIVERED,
    };
    ctx.output_log
        .write_record(&rec)
        .map_err(|e| DeliveryError::WriteLocal(e.to_string()))?;

    let _ = ctx.fsa.with_slot_mut(ctx.host_idx, ctx.slot, |s| {
        s.no_of_files_done += 1;
        s.file_size_done += file.size;
        set_fixed_str(&mut s.file_name_in_use, "");
    });
    Ok(true)
}

/// Drop staged files that waited past the age limit. Returns the survivors.
fn apply_age_limit(
    ctx: &SessionCtx<'_>,
    files: Vec<StagedFile>,
    msg: &MsgName,
    now: i64,
) -> Result<Vec<StagedFile>, DeliveryError> {
    if ctx.age_limit == 0 {
        return Ok(files);
    }
    let mut keep = Vec::with_capacity(files.len());
    for f in files {
        if now.saturating_sub(f.mtime) > ctx.age_limit as i64 {
            tracing::info!(
                "[fd][worker] age-limit 淘汰: {} (age {}s > {}s)",
                f.name,
                now - f.mtime,
                ctx.age_limit
            );
            // the digest must be recomputed before the file disappears
            let rollback_crc = ctx
                .dup
                .as_ref()
                .and_then(|_| compute_crc(Some(&f.path), &f.name, ctx.send_opts.dup_check_flag).ok());
            std::fs::remove_file(&f.path)
                .map_err(|e| DeliveryError::WriteLocal(format!("{}: {}", f.path.display(), e)))?;
            if let (Some(ref dup), Some(crc)) = (ctx.dup.as_ref(), rollback_crc) {
                let _ = dup.remove(msg.job_id, crc);
            }
            let _ = ctx.delete_log.write(DR_AGE_OUTPUT, &f.name, f.size, msg.job_id, now);
            let rec = OutputRecord {
                file_name: f.name.clone(),
                archive_path: None,
                unique_name: msg.to_string(),
                file_size: f.size.min(u32::MAX as u64) as u32,
                job_id: msg.job_id,
                retries: ctx.retries,
                transfer_clocks: 0,
                output_type: OT_AGE_LIMIT_DELETE,
            };
            let _ = ctx.output_log.write_record(&rec);
            let _ = ctx.fsa.sub_queued(ctx.host_idx, 1, f.size as i64);
        } else {
            keep.push(f);
        }
    }
    Ok(keep)
}

fn set_slot_state(fsa: &Fsa, host_idx: usize, slot: usize, state: ConnectState) {
    let _ = fsa.with_slot_mut(host_idx, slot, |s| {
        s.connect_status = state.as_u8();
        s.pid = std::process::id() as i32;
    });
}

/// One whole delivery session: connect once, send every file of the message,
/// burst follow-on messages while the dispatcher grants them, close.
pub fn run_delivery(task: &WorkerTask) -> Result<(), DeliveryError> {
    let fsa = Fsa::attach(&task.work.fsa_file())
        .map_err(|e| DeliveryError::Alloc(e.to_string()))?;
    let jid = crate::state::jid::Jid::attach(&task.work.jid_file())
        .map_err(|e| DeliveryError::Alloc(e.to_string()))?;

    let msg = MsgName::parse(&task.msg_name)
        .ok_or_else(|| DeliveryError::Syntax(format!("消息名不合法: {}", task.msg_name)))?;
    let job = jid
        .lookup(msg.job_id)
        .ok_or_else(|| DeliveryError::Syntax(format!("job 不在目录中: {:x}", msg.job_id)))?;
    let rules = crate::ruledb::load_amg_data(&task.work.amg_data_file())
        .map_err(|e| DeliveryError::Alloc(e.to_string()))?;
    let rule: Option<&JobRule> = rules.iter().find(|r| r.job_id() == msg.job_id);
    let send_opts = rule.map(|r| parse_send_options(&r.std_options)).unwrap_or_default();
    let local_opts = rule.map(|r| parse_local_options(&r.local_options)).unwrap_or_default();
    let age_limit = send_opts.age_limit.unwrap_or(local_opts.age_limit);

    let recipient = Recipient::parse(job.recipient())
        .map_err(|e| DeliveryError::Syntax(e.to_string()))?;
    let host = fsa
        .read_host(task.host_idx)
        .map_err(|e| DeliveryError::Syntax(e.to_string()))?;
    if let Some(pos) = task.toggle_hint
        && host.host_toggle != pos
    {
        let _ = fsa.toggle_host(task.host_idx);
    }
    let host = fsa.read_host(task.host_idx).map_err(|e| DeliveryError::Syntax(e.to_string()))?;

    let guard = SlotGuard {
        fsa: &fsa,
        host_idx: task.host_idx,
        slot: task.slot,
        fin_fifo: task.work.sf_fin_fifo(),
    };
    set_slot_state(&fsa, task.host_idx, task.slot, ConnectState::Connecting);

    let dup = if send_opts.dup_check_flag != 0 {
        Some(
            DupCheck::open(&task.work.dup_db_file(), &task.work.store_dir())
                .map_err(|e| DeliveryError::Alloc(e.to_string()))?,
        )
    } else {
        None
    };
    let rename_rules = RenameRules::load(&task.work.rename_rule_file())
        .map_err(|e| DeliveryError::Alloc(e.to_string()))?;
    let rate = if host.trl_per_process > 0 {
        host.trl_per_process as u64
    } else {
        host.transfer_rate_limit.max(0) as u64
    };
    let sort_names = host.protocol_options & OPT_SORT_FILE_NAMES != 0 || send_opts.sort_file_names;
    let mut ctx = SessionCtx {
        fsa: &fsa,
        host_idx: task.host_idx,
        slot: task.slot,
        host,
        send_opts,
        age_limit,
        rename_rules,
        dup,
        archiver: Archiver::new(task.work.archive_dir(), task.cfg.archive_unit),
        output_log: OutputLog::open(&task.work.log_dir())
            .map_err(|e| DeliveryError::Alloc(e.to_string()))?,
        delete_log: DeleteLog::open(&task.work.log_dir())
            .map_err(|e| DeliveryError::Alloc(e.to_string()))?,
        limiter: RateLimiter::new(rate),
        block_size: if host.block_size > 0 {
            host.block_size as usize
        } else {
            task.cfg.default_block_size
        },
        retries: task.retries,
    };

    let host_alias = ctx.host.alias().to_string();
    let user = recipient.user.clone();
    let timeout = if ctx.host.transfer_timeout > 0 {
        ctx.host.transfer_timeout
    } else {
        task.cfg.default_transfer_timeout as i64
    };

    let mut current = msg;
    let mut connected = false;
    let mut client = build_client(&recipient, &ctx.host, timeout)?;
    let mut sent_any = false;
    let outcome: Result<(), DeliveryError> = loop {
        let staging = task.work.staging_dir(&current.to_string());
        let now = chrono::Utc::now().timestamp();
        let files = match list_staging(&staging, sort_names) {
            Ok(f) => f,
            Err(e) => break Err(e),
        };
        let files = match apply_age_limit(&ctx, files, &current, now) {
            Ok(f) => f,
            Err(e) => break Err(e),
        };
        if files.is_empty() {
            let _ = std::fs::remove_dir(&staging);
            if !sent_any && !connected {
                break Err(DeliveryError::AllFilesAgedOut);
            }
        } else {
            if !connected {
                if let Err(e) = client.connect() {
                    break Err(e);
                }
                connected = true;
                set_slot_state(&fsa, task.host_idx, task.slot, ConnectState::Active);
                if let Err(e) = client.change_dir(&recipient.path) {
                    break Err(e);
                }
            }
            let mut failed = None;
            for f in &files {
                let _ = ctx.fsa.with_slot_mut(ctx.host_idx, ctx.slot, |s| {
                    s.no_of_files += 1;
                    s.file_size += f.size;
                });
                match deliver_one(&mut ctx, client.as_mut(), f, &current, &host_alias, &user, now) {
                    Ok(sent) => {
                        sent_any = true;
                        let _ = fsa.sub_queued(task.host_idx, 1, f.size as i64);
                        if sent {
                            let _ = fsa.note_file_done(task.host_idx, f.size);
                        }
                    }
                    Err(e) => {
                        failed = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = failed {
                break Err(e);
            }
            let _ = std::fs::remove_dir(&staging);
        }

        // burst: a compatible follow-on message may be waiting in our slot
        let burst = fsa
            .read_slot(task.host_idx, task.slot)
            .ok()
            .map(|s| fixed_str(&s.unique_name).to_string())
            .filter(|s| !s.is_empty());
        match burst {
            Some(next_name) => {
                let _ = fsa.with_slot_mut(task.host_idx, task.slot, |s| {
                    s.unique_name = [0; MAX_UNIQUE_NAME];
                    s.connect_status = ConnectState::Burst.as_u8();
                });
                match MsgName::parse(&next_name) {
                    Some(m) => {
                        tracing::info!("[fd][worker] burst: {}", next_name);
                        current = m;
                        continue;
                    }
                    None => break Err(DeliveryError::Syntax(format!("burst 名不合法: {}", next_name))),
                }
            }
            None => break Ok(()),
        }
    };

    set_slot_state(&fsa, task.host_idx, task.slot, ConnectState::Closing);
    if connected {
        client.disconnect();
    }
    let now = chrono::Utc::now().timestamp();
    match &outcome {
        Ok(()) => {
            let _ = fsa.note_success(task.host_idx, now);
            let _ = fsa.bump_connections(task.host_idx);
            tracing::info!(
                "[fd][worker] {} 会话完成 (msg {})",
                host_alias,
                task.msg_name
            );
        }
        Err(e) => {
            if e.counts_against_host() {
                let _ = fsa.note_error(task.host_idx, e.exit_code() as u8, now);
            }
            tracing::error!("[fd][worker] {} 会话失败: {} ({})", host_alias, e, e.code_name());
        }
    }
    drop(guard);
    outcome
}

//! AMG: the ingest daemon. Builds the shared regions from the rule database,
//! scans watched directories (polling plus inotify), classifies files and
//! stages them per destination, then announces each message to the
//! dispatcher over the message pipe.

pub mod materialise;
pub mod scanner;

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded, tick, unbounded};
use notify::{RecursiveMode, Watcher};

use crate::config::{Config, WorkDir};
use crate::dupcheck::DupCheck;
use crate::logging::{DeleteLog, InputLog};
use crate::options::{
    DirOptions, LocalOptions, is_dir_option, parse_dir_options, parse_local_options,
};
use crate::rename::RenameRules;
use crate::ruledb::{self, JobRule};
use crate::state::fra::{DirSeed, Fra};
use crate::state::fsa::{Fsa, HostSeed};
use crate::state::jid::{Jid, JobSeed};
use crate::timejob::{CronSpec, TimeJobQueue};

use materialise::MatchedGroup;
use scanner::{ScanCtx, scan_directory};

/// One watched directory with the jobs feeding from it.
struct DirState {
    alias: String,
    path: PathBuf,
    dir_id: u32,
    opts: DirOptions,
    /// Indices into the rule list.
    jobs: Vec<usize>,
    /// Union of mask groups, for unknown-file classification.
    all_mask_groups: Vec<Vec<String>>,
}

pub struct AmgShared {
    work: WorkDir,
    cfg: Config,
    fsa: Fsa,
    fra: Fra,
    rules: Vec<JobRule>,
    local_opts: Vec<LocalOptions>,
    host_alias_of_rule: Vec<String>,
    dirs: Vec<DirState>,
    rename_rules: RenameRules,
    input_log: InputLog,
    delete_log: DeleteLog,
}

pub struct Amg {
    pub work: WorkDir,
    pub cfg: Config,
}

impl Amg {
    pub fn new(work: WorkDir, cfg: Config) -> Amg {
        Amg { work, cfg }
    }

    /// Rebuild FSA/FRA/JID from the parsed rule database and the host
    /// overrides. Called at startup and whenever `amg_data` is republished;
    /// every rebuild bumps the region generations so attached readers
    /// re-attach.
    pub fn build_state(&self) -> Result<Arc<AmgShared>> {
        let rules = ruledb::load_amg_data(&self.work.amg_data_file())
            .with_context(|| "规则库加载失败")?;
        let overrides = ruledb::load_host_config(&self.work.host_config_file())?;
        let rename_rules = RenameRules::load(&self.work.rename_rule_file())?;

        // hosts, deduped by alias, in first-seen order
        let mut host_aliases: Vec<String> = Vec::new();
        let mut host_seeds: Vec<HostSeed> = Vec::new();
        let mut host_alias_of_rule: Vec<String> = Vec::with_capacity(rules.len());
        for rule in &rules {
            let recipient = rule.recipient_parsed()?;
            let alias = recipient.default_alias();
            host_alias_of_rule.push(alias.clone());
            if !host_aliases.contains(&alias) {
                let mut seed = HostSeed {
                    alias: alias.clone(),
                    real_hostname: [recipient.host.clone(), String::new()],
                    port: recipient.port as i32,
                    scheme_mask: recipient.scheme.bit(),
                    allowed_transfers: 2,
                    max_errors: 10,
                    retry_interval: self.cfg.default_retry_interval as i32,
                    transfer_timeout: self.cfg.default_transfer_timeout as i64,
                    block_size: self.cfg.default_block_size as i32,
                    ..HostSeed::default()
                };
                if let Some(o) = overrides.iter().find(|o| o.alias == alias) {
                    if let Some(ref second) = o.second_hostname {
                        seed.real_hostname[1] = second.clone();
                    }
                    if let Some(v) = o.auto_toggle {
                        seed.auto_toggle = v;
                    }
                    if let Some(v) = o.allowed_transfers {
                        seed.allowed_transfers = v;
                    }
                    if let Some(v) = o.max_errors {
                        seed.max_errors = v;
                    }
                    if let Some(v) = o.retry_interval {
                        seed.retry_interval = v;
                    }
                    if let Some(v) = o.transfer_timeout {
                        seed.transfer_timeout = v;
                    }
                    if let Some(v) = o.block_size {
                        seed.block_size = v;
                    }
                    if let Some(v) = o.transfer_rate_limit {
                        seed.transfer_rate_limit = v;
                    }
                }
                host_aliases.push(alias);
                host_seeds.push(seed);
            } else if let Some(seed) = host_seeds.iter_mut().find(|s| s.alias == alias) {
                seed.scheme_mask |= recipient.scheme.bit();
            }
        }

        // directories, deduped by alias; dir options merged across the jobs
        let mut dirs: Vec<DirState> = Vec::new();
        let mut local_opts: Vec<LocalOptions> = Vec::with_capacity(rules.len());
        for (ri, rule) in rules.iter().enumerate() {
            let (dir_lines, job_lines): (Vec<String>, Vec<String>) =
                rule.local_options.iter().cloned().partition(|l| is_dir_option(l));
            local_opts.push(parse_local_options(&job_lines));
            match dirs.iter_mut().find(|d| d.alias == rule.dir_alias) {
                Some(d) => {
                    let merged = parse_dir_options(&dir_lines);
                    if merged != DirOptions::default() {
                        d.opts = merged;
                    }
                    d.jobs.push(ri);
                    d.all_mask_groups.push(rule.file_masks.clone());
                }
                None => {
                    dirs.push(DirState {
                        alias: rule.dir_alias.clone(),
                        path: rule.dir.clone(),
                        dir_id: rule.dir_id(),
                        opts: parse_dir_options(&dir_lines),
                        jobs: vec![ri],
                        all_mask_groups: vec![rule.file_masks.clone()],
                    });
                }
            }
        }

        let dir_seeds: Vec<DirSeed> = dirs
            .iter()
            .map(|d| DirSeed {
                alias: d.alias.clone(),
                priority: d.opts.priority,
                accept_dot_files: d.opts.accept_dot_files,
                unknown_file_time: d.opts.unknown_file_time,
                queued_file_time: d.opts.queued_file_time,
                locked_file_time: d.opts.locked_file_time,
                ignore_size_sign: d.opts.ignore_size_sign,
                ignore_size: d.opts.ignore_size,
                ignore_time_sign: d.opts.ignore_time_sign,
                ignore_file_time: d.opts.ignore_file_time,
                max_copied_files: if d.opts.max_files > 0 {
                    d.opts.max_files
                } else {
                    self.cfg.max_copied_files as u32
                },
                max_copied_file_size: if d.opts.max_size > 0 {
                    d.opts.max_size
                } else {
                    self.cfg.max_copied_file_size
                },
                wait_for: d.opts.wait_for.clone().unwrap_or_default(),
                warn_time: d.opts.warn_time,
                accumulate: d.opts.accumulate,
                accumulate_size: d.opts.accumulate_size,
                dup_check_timeout: d.opts.dup_check_timeout,
                dup_check_flag: d.opts.dup_check_flag,
                inotify_mask: d.opts.inotify_mask,
                important_dir: d.opts.important_dir,
                end_character: d.opts.end_character,
                max_process: d.opts.max_process,
                force_reread: d.opts.force_reread,
                ..DirSeed::default()
            })
            .collect();

        let job_seeds: Vec<JobSeed> = rules
            .iter()
            .enumerate()
            .map(|(ri, rule)| {
                let recipient = rule.recipient_parsed().expect("validated above");
                JobSeed {
                    job_id: rule.job_id(),
                    dir_id: rule.dir_id(),
                    dir_no: 0,
                    host_id: crc32fast::hash(host_alias_of_rule[ri].as_bytes()),
                    priority: rule.priority,
                    scheme: recipient.scheme.tag(),
                    no_of_files: rule.file_masks.len() as i32,
                    host_alias: host_alias_of_rule[ri].clone(),
                    recipient: rule.recipient.clone(),
                }
            })
            .collect();

        let fsa = Fsa::create(&self.work.fsa_file(), &host_seeds)?;
        let fra = Fra::create(&self.work.fra_file(), &dir_seeds)?;
        let _jid = Jid::create(&self.work.jid_file(), &job_seeds)?;

        // authoritative job-id list for the dispatcher's post-reread sweep
        let list: String =
            job_seeds.iter().map(|j| format!("{:x}\n", j.job_id)).collect();
        std::fs::write(self.work.current_msg_list_file(), list)
            .with_context(|| "写 current_msg_list 失败")?;

        tracing::info!(
            "[amg] 规则库已加载: {} jobs, {} hosts, {} dirs (fsa gen {})",
            rules.len(),
            host_seeds.len(),
            dirs.len(),
            fsa.generation()
        );

        Ok(Arc::new(AmgShared {
            work: self.work.clone(),
            cfg: self.cfg.clone(),
            fsa,
            fra,
            rules,
            local_opts,
            host_alias_of_rule,
            dirs,
            rename_rules,
            input_log: InputLog::open(&self.work.log_dir())?,
            delete_log: DeleteLog::open(&self.work.log_dir())?,
        }))
    }

    /// One synchronous pass over every watched directory. The daemon loop
    /// drives this through the worker pool; tools and tests call it direct.
    pub fn scan_once(&self, shared: &Arc<AmgShared>) -> Result<()> {
        for di in 0..shared.dirs.len() {
            if let Err(e) = scan_and_stage(shared, di) {
                let _ = shared.fra.note_dir_error(di);
                tracing::warn!("[amg][scan] {} 扫描失败: {}", shared.dirs[di].alias, e);
            }
        }
        Ok(())
    }

    /// Daemon main loop. Returns when `stop` is raised.
    pub fn run(&self, stop: Arc<AtomicBool>) -> Result<()> {
        self.work.ensure_layout()?;
        crate::fifo::mkfifo_if_missing(&self.work.msg_fifo())?;
        crate::fifo::mkfifo_if_missing(&self.work.fd_wake_up_fifo())?;
        while !stop.load(Ordering::SeqCst) {
            let shared = self.build_state()?;
            let amg_data_stamp = mtime_of(&self.work.amg_data_file());
            self.run_generation(shared, &stop, amg_data_stamp)?;
        }
        Ok(())
    }

    /// Scan loop for one rule-set generation; exits when the rule database
    /// is republished (mtime change) or on stop.
    fn run_generation(
        &self,
        shared: Arc<AmgShared>,
        stop: &Arc<AtomicBool>,
        amg_data_stamp: Option<SystemTime>,
    ) -> Result<()> {
        let workers = shared.dirs.len().clamp(1, 4);
        let (scan_tx, scan_rx) = bounded::<usize>(shared.dirs.len().max(4) * 2);
        let pool_stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for _ in 0..workers {
            let shared = shared.clone();
            let rx: Receiver<usize> = scan_rx.clone();
            let tx: Sender<usize> = scan_tx.clone();
            let pool_stop = pool_stop.clone();
            handles.push(std::thread::spawn(move || {
                loop {
                    if pool_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let di = match rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(di) => di,
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                        Err(_) => break,
                    };
                    match scan_and_stage(&shared, di) {
                        Ok(hit_ceiling) => {
                            if hit_ceiling {
                                // capped scan: go straight back for the rest
                                let _ = tx.try_send(di);
                            }
                        }
                        Err(e) => {
                            let _ = shared.fra.note_dir_error(di);
                            tracing::warn!(
                                "[amg][scan] {} 扫描失败: {}",
                                shared.dirs[di].alias,
                                e
                            );
                        }
                    }
                }
            }));
        }

        // inotify supplement: directories with a mask get event-driven scans
        let (evt_tx, evt_rx) = unbounded::<usize>();
        let mut watcher = None;
        let by_path: HashMap<PathBuf, usize> = shared
            .dirs
            .iter()
            .enumerate()
            .map(|(i, d)| (d.path.clone(), i))
            .collect();
        let watched: Vec<usize> = shared
            .dirs
            .iter()
            .enumerate()
            .filter(|(_, d)| d.opts.inotify_mask != 0)
            .map(|(i, _)| i)
            .collect();
        if !watched.is_empty() {
            let evt_tx = evt_tx.clone();
            let by_path = by_path.clone();
            match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    for p in &event.paths {
                        if let Some(parent) = p.parent()
                            && let Some(&di) = by_path.get(parent)
                        {
                            let _ = evt_tx.send(di);
                        }
                    }
                }
            }) {
                Ok(mut w) => {
                    for &di in &watched {
                        if let Err(e) = w.watch(&shared.dirs[di].path, RecursiveMode::NonRecursive)
                        {
                            tracing::warn!(
                                "[amg] inotify 注册失败 {}: {}",
                                shared.dirs[di].path.display(),
                                e
                            );
                        }
                    }
                    watcher = Some(w);
                }
                Err(e) => tracing::warn!("[amg] inotify 不可用，退回轮询: {}", e),
            }
        }

        // time-scheduled directories scan on their cron windows instead of
        // every pacing tick
        let now = chrono::Utc::now().timestamp();
        let mut timed_dirs = TimeJobQueue::new();
        for d in shared.dirs.iter() {
            if let Some(ref spec_str) = d.opts.time_spec
                && let Ok(spec) = CronSpec::parse(spec_str)
            {
                timed_dirs.schedule(d.dir_id, spec, false, now);
            }
        }

        let pacing = tick(Duration::from_millis(self.cfg.scan_interval_ms.max(100)));
        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            if mtime_of(&self.work.amg_data_file()) != amg_data_stamp {
                tracing::info!("[amg] 规则库已更新，重建共享区域");
                break;
            }
            crossbeam_channel::select! {
                recv(pacing) -> _ => {
                    // backpressure: above the danger mark, skip this pacing
                    // round and warn
                    let queued: u32 = (0..shared.fsa.len())
                        .filter_map(|i| shared.fsa.with_host(i, |h| h.jobs_queued).ok())
                        .sum();
                    if queued as usize > shared.cfg.danger_no_of_jobs {
                        tracing::warn!(
                            "[amg] 队列过长 ({} > {})，降速扫描",
                            queued,
                            shared.cfg.danger_no_of_jobs
                        );
                        std::thread::sleep(Duration::from_millis(
                            shared.cfg.scan_interval_ms.max(100),
                        ));
                        continue;
                    }
                    let now = chrono::Utc::now().timestamp();
                    let due: Vec<u32> = timed_dirs.take_due(now);
                    for (di, d) in shared.dirs.iter().enumerate() {
                        let timed = d.opts.time_spec.is_some();
                        if !timed || due.contains(&d.dir_id) {
                            let _ = scan_tx.try_send(di);
                        }
                    }
                }
                recv(evt_rx) -> di => {
                    if let Ok(di) = di {
                        let _ = scan_tx.try_send(di);
                    }
                }
            }
        }

        pool_stop.store(true, Ordering::SeqCst);
        drop(scan_tx);
        drop(watcher);
        for h in handles {
            let _ = h.join();
        }
        Ok(())
    }
}

fn mtime_of(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// One scan of one directory: filter, classify, stage, announce. Returns
/// whether the per-scan ceiling was hit.
fn scan_and_stage(shared: &AmgShared, di: usize) -> Result<bool> {
    let d = &shared.dirs[di];
    let now = chrono::Utc::now().timestamp();
    // connection per scan: rusqlite handles are not Sync
    let dup = if d.opts.dup_check_flag != 0 {
        Some(DupCheck::open(&shared.work.dup_db_file(), &shared.work.store_dir())?)
    } else {
        None
    };
    let ctx = ScanCtx {
        dup: dup.as_ref(),
        input_log: &shared.input_log,
        delete_log: &shared.delete_log,
        all_mask_groups: &d.all_mask_groups,
        now,
    };
    let outcome = scan_directory(&d.path, d.dir_id, &d.opts, &ctx)?;
    shared.fra.note_scan(di, outcome.files_seen, outcome.bytes_seen, outcome.hit_ceiling, now)?;
    if outcome.picked.is_empty() {
        shared.fra.clear_dir_error(di)?;
        return Ok(outcome.hit_ceiling);
    }

    // classify: first matching mask of a group claims the file for that job
    let mut groups: Vec<MatchedGroup<'_>> = Vec::new();
    for &ri in &d.jobs {
        let rule = &shared.rules[ri];
        let files: Vec<usize> = outcome
            .picked
            .iter()
            .enumerate()
            .filter(|(_, f)| scanner::mask_group_matches(&rule.file_masks, &f.name))
            .map(|(i, _)| i)
            .collect();
        if !files.is_empty() {
            groups.push(MatchedGroup {
                rule,
                local_opts: shared.local_opts[ri].clone(),
                host_alias: shared.host_alias_of_rule[ri].clone(),
                files,
            });
        }
    }
    if groups.is_empty() {
        return Ok(outcome.hit_ceiling);
    }

    let staged = materialise::materialise(
        &shared.work,
        &outcome.picked,
        &groups,
        &shared.rename_rules,
        false,
    )?;

    for sm in &staged {
        if let Some(hi) = shared.fsa.find_host(&sm.message.host_alias) {
            shared
                .fsa
                .add_queued(hi, sm.message.files as i32, sm.message.bytes as i64)?;
        }
        announce(&shared.work, &sm.message)?;
        tracing::info!(
            "[amg] 消息入队: {} -> {} ({} 文件, {} 字节)",
            sm.message.name(),
            sm.message.host_alias,
            sm.message.files,
            sm.message.bytes
        );
    }
    shared.fra.clear_dir_error(di)?;
    Ok(outcome.hit_ceiling)
}

/// Announce one staged message to the dispatcher. Lines shorter than
/// PIPE_BUF are written atomically; a blocked pipe is natural backpressure.
fn announce(work: &WorkDir, msg: &crate::msg::Message) -> Result<()> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    let mut f = crate::fifo::open_rw(&work.msg_fifo())?;
    f.write_all(line.as_bytes()).with_context(|| "写消息管道失败")?;
    // nudge the dispatcher out of its select
    let _ = crate::fifo::write_opcode(&work.fd_wake_up_fifo(), 1);
    Ok(())
}

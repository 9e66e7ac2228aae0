//! Job materialisation: turn one scan's matched files into per-destination
//! staging directories and enqueue a message for each.
//!
//! 同文件系统：第一份 rename、其余 hardlink；跨文件系统 copy+unlink；单目的地
//! 且无强制变换时只 rename 一次。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::config::WorkDir;
use crate::msg::{Message, MsgName};
use crate::options::LocalOptions;
use crate::rename::RenameRules;
use crate::ruledb::JobRule;
use crate::state::jid;
use crate::timejob::CronSpec;

use super::scanner::PickedFile;

/// One rule whose mask group matched, with the files that matched it.
pub struct MatchedGroup<'a> {
    pub rule: &'a JobRule,
    pub local_opts: LocalOptions,
    pub host_alias: String,
    pub files: Vec<usize>,
}

/// A message staged and ready to be announced to the dispatcher.
#[derive(Debug)]
pub struct StagedMessage {
    pub message: Message,
    pub staging_dir: PathBuf,
}

fn place_file(src: &Path, dst: &Path, link_ok: bool, last_ref: bool) -> Result<()> {
    if last_ref && link_ok {
        // final destination takes the rename; falls back to copy across
        // filesystems
        match std::fs::rename(src, dst) {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                std::fs::copy(src, dst)
                    .with_context(|| format!("跨文件系统复制失败: {}", dst.display()))?;
                std::fs::remove_file(src)
                    .with_context(|| format!("复制后删除源失败: {}", src.display()))?;
                return Ok(());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("rename 进暂存目录失败: {}", dst.display()));
            }
        }
    }
    if link_ok {
        match std::fs::hard_link(src, dst) {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {}
            Err(e) => {
                return Err(e).with_context(|| format!("hardlink 失败: {}", dst.display()));
            }
        }
    }
    std::fs::copy(src, dst).with_context(|| format!("复制进暂存目录失败: {}", dst.display()))?;
    if last_ref {
        std::fs::remove_file(src)
            .with_context(|| format!("复制后删除源失败: {}", src.display()))?;
    }
    Ok(())
}

/// Stage every matched group of one scan. Returns the staged messages in
/// group order; files referenced by several groups are hardlinked, the last
/// reference consumes the source.
pub fn materialise(
    work: &WorkDir,
    files: &[PickedFile],
    groups: &[MatchedGroup<'_>],
    rename_rules: &RenameRules,
    sort_by_mtime: bool,
) -> Result<Vec<StagedMessage>> {
    // how many groups still want each file
    let mut refs_left = vec![0u32; files.len()];
    for g in groups {
        for &fi in &g.files {
            refs_left[fi] += 1;
        }
    }

    let now = Utc::now().timestamp();
    let mut staged = Vec::new();
    for group in groups {
        if group.files.is_empty() {
            continue;
        }
        // no-collect windows drop out-of-window files at ingest
        if group.local_opts.no_collect
            && let Some(ref spec_str) = group.local_opts.time_spec
        {
            if let Ok(spec) = CronSpec::parse(spec_str)
                && !spec.matches(now)
            {
                for &fi in &group.files {
                    refs_left[fi] -= 1;
                    if refs_left[fi] == 0 {
                        let _ = std::fs::remove_file(&files[fi].path);
                        tracing::info!(
                            "[amg] 窗口外文件丢弃: {} (job {:x})",
                            files[fi].name,
                            group.rule.job_id()
                        );
                    }
                }
                continue;
            }
        }

        let unique = jid::next_unique(&work.jid_number_file())?;
        let name = MsgName {
            job_id: group.rule.job_id(),
            dir_no: 0,
            creation_time: now,
            unique_number: unique,
            split_job_counter: 0,
        };
        let staging = work.staging_dir(&name.to_string());
        std::fs::create_dir_all(&staging)
            .with_context(|| format!("无法创建暂存目录: {}", staging.display()))?;

        let mut order: Vec<usize> = group.files.clone();
        if sort_by_mtime {
            order.sort_by(|&a, &b| {
                files[a].mtime.cmp(&files[b].mtime).then_with(|| files[a].name.cmp(&files[b].name))
            });
        }

        let rename_set = group
            .local_opts
            .rename_rule
            .as_deref()
            .and_then(|set_name| rename_rules.get(set_name));

        let mut count = 0u32;
        let mut bytes = 0u64;
        for &fi in &order {
            let f = &files[fi];
            let staged_name = rename_set
                .and_then(|set| set.apply(&f.name))
                .unwrap_or_else(|| f.name.clone());
            let dst = staging.join(&staged_name);
            let link_ok = !group.local_opts.forces_copy();
            let last_ref = refs_left[fi] == 1;
            place_file(&f.path, &dst, link_ok, last_ref)?;
            refs_left[fi] -= 1;
            count += 1;
            bytes += f.size;
        }

        let priority = group.local_opts.priority.unwrap_or(group.rule.priority);
        let next_start_time = match group.local_opts.time_spec {
            Some(ref spec_str) if !group.local_opts.no_collect => CronSpec::parse(spec_str)
                .ok()
                .and_then(|s| s.next_after(now))
                .unwrap_or(0),
            _ => 0,
        };
        staged.push(StagedMessage {
            message: Message {
                priority,
                creation_time: now,
                unique_number: unique,
                split_job_counter: 0,
                job_id: group.rule.job_id(),
                dir_no: 0,
                dir_id: group.rule.dir_id(),
                host_alias: group.host_alias.clone(),
                files: count,
                bytes,
                retries: 0,
                next_start_time,
            },
            staging_dir: staging,
        });
    }
    Ok(staged)
}

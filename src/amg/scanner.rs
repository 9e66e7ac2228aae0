//! Per-directory input scanning: enumerate, filter, dedup, and hand the
//! survivors to the materialiser.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::Pattern;
use walkdir::WalkDir;

use crate::dupcheck::DupCheck;
use crate::logging::{
    DR_DEL_OLD_LOCKED_FILE, DR_DEL_QUEUED_FILE, DR_DEL_UNKNOWN_FILE, DR_DUP_INPUT, DeleteLog,
    InputLog,
};
use crate::options::DirOptions;
use crate::state::fra::{PRED_EQ, PRED_GT, PRED_LT, PRED_NONE};

/// One file that survived the scan filters.
#[derive(Debug, Clone)]
pub struct PickedFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub mtime: i64,
}

/// Result of one scan pass over one directory.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub picked: Vec<PickedFile>,
    pub files_seen: i32,
    pub bytes_seen: i64,
    /// The per-scan ceiling stopped enumeration early; the caller re-queues
    /// the directory instead of waiting a full pacing interval.
    pub hit_ceiling: bool,
}

fn predicate_blocks(sign: u8, configured: i64, actual: i64) -> bool {
    match sign {
        PRED_EQ => actual == configured,
        PRED_LT => actual < configured,
        PRED_GT => actual > configured,
        _ => false,
    }
}

/// Does any mask of the group accept this name? `!patterns` veto; a group of
/// a single `*` is the all-files case unless a veto follows.
pub fn mask_group_matches(masks: &[String], name: &str) -> bool {
    for mask in masks {
        if let Some(neg) = mask.strip_prefix('!') {
            if Pattern::new(neg).map(|p| p.matches(name)).unwrap_or(false) {
                return false;
            }
        } else if Pattern::new(mask).map(|p| p.matches(name)).unwrap_or(false) {
            return true;
        }
    }
    false
}

/// Shared context the scanner needs besides the directory record.
pub struct ScanCtx<'a> {
    pub dup: Option<&'a DupCheck>,
    pub input_log: &'a InputLog,
    pub delete_log: &'a DeleteLog,
    /// Union of every mask group feeding from this directory, for the
    /// unknown-file classification.
    pub all_mask_groups: &'a [Vec<String>],
    pub now: i64,
}

fn is_unknown(ctx: &ScanCtx<'_>, name: &str) -> bool {
    !ctx.all_mask_groups.iter().any(|g| mask_group_matches(g, name))
}

/// One scan pass. Filters follow the directory options; the ceiling check
/// runs last so a capped scan still reports what it saw.
pub fn scan_directory(
    dir_path: &Path,
    dir_id: u32,
    opts: &DirOptions,
    ctx: &ScanCtx<'_>,
) -> Result<ScanOutcome> {
    let mut out = ScanOutcome::default();
    if !dir_path.is_dir() {
        return Err(anyhow::anyhow!("监视目录不存在: {}", dir_path.display()));
    }

    // wait-for gate: nothing is picked up until the marker file shows up
    if let Some(ref wait_pat) = opts.wait_for {
        let pat = Pattern::new(wait_pat)
            .with_context(|| format!("wait for 模式不合法: {}", wait_pat))?;
        let found = std::fs::read_dir(dir_path)?
            .flatten()
            .any(|e| pat.matches(&e.file_name().to_string_lossy()));
        if !found {
            return Ok(out);
        }
    }

    // accumulate thresholds: a cheap stat pass decides whether enough piled
    // up; gating here keeps held-back files out of the dup-check store
    if opts.accumulate > 0 || opts.accumulate_size > 0 {
        let mut count = 0u32;
        let mut bytes = 0u64;
        for e in std::fs::read_dir(dir_path)?.flatten() {
            if let Ok(meta) = e.metadata()
                && meta.is_file()
            {
                if !opts.accept_dot_files && e.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                count += 1;
                bytes += meta.len();
            }
        }
        let count_met = opts.accumulate > 0 && count >= opts.accumulate;
        let size_met = opts.accumulate_size > 0 && bytes >= opts.accumulate_size;
        if !count_met && !size_met {
            out.files_seen = count as i32;
            out.bytes_seen = bytes as i64;
            return Ok(out);
        }
    }

    let max_files = opts.max_files;
    let max_bytes = opts.max_size;
    let mut picked_bytes: u64 = 0;

    for entry in WalkDir::new(dir_path).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("[amg][scan] 枚举失败 {}: {}", dir_path.display(), e);
                continue;
            }
        };
        let meta = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let name = entry.file_name().to_string_lossy().to_string();
        let size = meta.len();
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        out.files_seen += 1;
        out.bytes_seen += size as i64;

        // stale lock-name leftovers go first, before the dot filter hides them
        let age_hours = (ctx.now - mtime) / 3600;
        if name.starts_with('.') {
            if opts.delete_old_locked_files && age_hours >= opts.locked_file_time as i64 {
                if std::fs::remove_file(entry.path()).is_ok() {
                    let _ =
                        ctx.delete_log.write(DR_DEL_OLD_LOCKED_FILE, &name, size, dir_id, ctx.now);
                }
                continue;
            }
            if !opts.accept_dot_files {
                continue;
            }
        }

        if is_unknown(ctx, &name) {
            if opts.delete_unknown_files && age_hours >= opts.unknown_file_time as i64 {
                if std::fs::remove_file(entry.path()).is_ok() {
                    let _ = ctx.delete_log.write(DR_DEL_UNKNOWN_FILE, &name, size, dir_id, ctx.now);
                }
            }
            continue;
        }
        if opts.delete_queued_files && age_hours >= opts.queued_file_time as i64 {
            if std::fs::remove_file(entry.path()).is_ok() {
                let _ = ctx.delete_log.write(DR_DEL_QUEUED_FILE, &name, size, dir_id, ctx.now);
            }
            continue;
        }

        // size / mtime predicates: a matching predicate IGNORES the file
        if opts.ignore_size_sign != PRED_NONE
            && predicate_blocks(opts.ignore_size_sign, opts.ignore_size, size as i64)
        {
            continue;
        }
        if opts.ignore_time_sign != PRED_NONE
            && predicate_blocks(opts.ignore_time_sign, opts.ignore_file_time, ctx.now - mtime)
        {
            continue;
        }

        // end-character gate: the file is still being written
        if opts.end_character >= 0 && !ends_with_byte(entry.path(), opts.end_character as u8) {
            continue;
        }

        // ingest-side duplicate check, scoped by directory id
        if let Some(dup) = ctx.dup
            && opts.dup_check_flag != 0
        {
            let is_dup = dup
                .isdup(
                    Some(entry.path()),
                    &name,
                    dir_id,
                    opts.dup_check_timeout,
                    opts.dup_check_flag,
                    ctx.now,
                )
                .unwrap_or(false);
            if is_dup {
                tracing::warn!("[amg][scan] 重复文件: {} (dir {:x})", name, dir_id);
                let _ = ctx.delete_log.write(DR_DUP_INPUT, &name, size, dir_id, ctx.now);
                let _ = dup.apply_action(opts.dup_check_flag, entry.path(), dir_id, &name);
                continue;
            }
        }

        let _ = ctx.input_log.write(dir_id, &name, size, ctx.now);
        picked_bytes += size;
        out.picked.push(PickedFile { path: entry.path().to_path_buf(), name, size, mtime });

        if (max_files > 0 && out.picked.len() as u32 >= max_files)
            || (max_bytes > 0 && picked_bytes >= max_bytes)
        {
            out.hit_ceiling = true;
            break;
        }
    }

    Ok(out)
}

fn ends_with_byte(path: &Path, wanted: u8) -> bool {
    use std::io::{Read, Seek, SeekFrom};
    let Ok(mut f) = std::fs::File::open(path) else {
        return false;
    };
    if f.seek(SeekFrom::End(-1)).is_err() {
        return false;
    }
    let mut b = [0u8; 1];
    f.read_exact(&mut b).map(|_| b[0] == wanted).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_matching_with_negation() {
        let group = vec!["!*.tmp".to_string(), "*.bin".to_string()];
        assert!(mask_group_matches(&group, "a.bin"));
        assert!(!mask_group_matches(&group, "a.tmp"));
        assert!(!mask_group_matches(&group, "a.txt"));
        // all-files group, then with a veto
        let all = vec!["*".to_string()];
        assert!(mask_group_matches(&all, "anything"));
        let all_but = vec!["!secret*".to_string(), "*".to_string()];
        assert!(mask_group_matches(&all_but, "public.txt"));
        assert!(!mask_group_matches(&all_but, "secret.txt"));
    }

    #[test]
    fn predicate_signs() {
        assert!(predicate_blocks(PRED_GT, 100, 150));
        assert!(!predicate_blocks(PRED_GT, 100, 50));
        assert!(predicate_blocks(PRED_LT, 100, 50));
        assert!(predicate_blocks(PRED_EQ, 100, 100));
        assert!(!predicate_blocks(PRED_NONE, 100, 100));
    }
}

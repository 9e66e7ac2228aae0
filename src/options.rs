//! Option vocabularies: the directory options recognised from DIR_CONFIG
//! output, plus the per-job ingest ("local") and send ("standard") options.
//! Unknown tokens are logged and ignored, never fatal.

use crate::dupcheck::{DC_ACTION_DELETE, DC_ACTION_STORE, DC_ACTION_WARN, DC_CONTENT, DC_FILENAME,
    DC_NAME_AND_CONTENT, DC_NAME_NO_SUFFIX};
use crate::state::fra::{PRED_EQ, PRED_GT, PRED_LT, PRED_NONE};

/// Default age threshold (hours) for `delete unknown files` / `delete queued
/// files` when the token carries no explicit value.
pub const DEFAULT_OLD_FILE_TIME_HOURS: i32 = 24;

/// Parsed directory-level options.
#[derive(Debug, Clone, PartialEq)]
pub struct DirOptions {
    pub delete_unknown_files: bool,
    pub delete_queued_files: bool,
    pub delete_old_locked_files: bool,
    /// Hours before an unknown/queued/locked file is considered old.
    pub unknown_file_time: i32,
    pub queued_file_time: i32,
    pub locked_file_time: i32,
    pub end_character: i32,
    pub ignore_size_sign: u8,
    pub ignore_size: i64,
    pub ignore_time_sign: u8,
    pub ignore_file_time: i64,
    pub important_dir: bool,
    pub time_spec: Option<String>,
    pub keep_connected: u32,
    pub do_not_get_dir_list: bool,
    pub do_not_remove: bool,
    /// 0 off, 1 on, 2 once
    pub store_retrieve_list: u8,
    pub priority: u8,
    pub force_reread: bool,
    pub max_process: i32,
    pub max_files: u32,
    pub max_size: u64,
    pub wait_for: Option<String>,
    pub warn_time: i64,
    pub accumulate: u32,
    pub accumulate_size: u64,
    pub dup_check_timeout: i64,
    pub dup_check_flag: u32,
    pub accept_dot_files: bool,
    pub inotify_mask: u32,
}

impl Default for DirOptions {
    fn default() -> Self {
        DirOptions {
            delete_unknown_files: false,
            delete_queued_files: false,
            delete_old_locked_files: false,
            unknown_file_time: DEFAULT_OLD_FILE_TIME_HOURS,
            queued_file_time: DEFAULT_OLD_FILE_TIME_HOURS,
            locked_file_time: DEFAULT_OLD_FILE_TIME_HOURS,
            end_character: -1,
            ignore_size_sign: PRED_NONE,
            ignore_size: 0,
            ignore_time_sign: PRED_NONE,
            ignore_file_time: 0,
            important_dir: false,
            time_spec: None,
            keep_connected: 0,
            do_not_get_dir_list: false,
            do_not_remove: false,
            store_retrieve_list: 0,
            priority: b'9',
            force_reread: false,
            max_process: 0,
            max_files: 0,
            max_size: 0,
            wait_for: None,
            warn_time: 0,
            accumulate: 0,
            accumulate_size: 0,
            dup_check_timeout: 0,
            dup_check_flag: 0,
            accept_dot_files: false,
            inotify_mask: 0,
        }
    }
}

fn num_after<'a>(line: &'a str, token: &str) -> Option<&'a str> {
    line.strip_prefix(token).map(|r| r.trim())
}

fn parse_sign_and_num(rest: &str) -> (u8, i64) {
    let rest = rest.trim();
    let (sign, tail) = match rest.as_bytes().first() {
        Some(b'=') => (PRED_EQ, &rest[1..]),
        Some(b'<') => (PRED_LT, &rest[1..]),
        Some(b'>') => (PRED_GT, &rest[1..]),
        _ => (PRED_EQ, rest),
    };
    let n: i64 = tail.trim().parse().unwrap_or(0);
    // a zero value means "no predicate" regardless of the sign
    if n == 0 { (PRED_NONE, 0) } else { (sign, n) }
}

fn parse_dupcheck(rest: &str) -> (i64, u32) {
    // dupcheck [<timeout> [<type> [<action> [<alg>]]]] — alg is accepted and
    // ignored (CRC32 is the only algorithm built in).
    let mut timeout: i64 = 3600;
    let mut flag: u32 = DC_FILENAME | DC_ACTION_WARN;
    let mut it = rest.split_whitespace();
    if let Some(t) = it.next() {
        timeout = t.parse().unwrap_or(3600);
    }
    if let Some(ty) = it.next() {
        let mode = match ty {
            "name" => DC_FILENAME,
            "nosuffix" => DC_NAME_NO_SUFFIX,
            "content" => DC_CONTENT,
            "namecontent" => DC_NAME_AND_CONTENT,
            _ => DC_FILENAME,
        };
        flag = mode | DC_ACTION_WARN;
    }
    if let Some(act) = it.next() {
        let action = match act {
            "delete" => DC_ACTION_DELETE,
            "store" => DC_ACTION_STORE,
            _ => DC_ACTION_WARN,
        };
        flag = (flag & !(DC_ACTION_WARN | DC_ACTION_DELETE | DC_ACTION_STORE)) | action;
    }
    (timeout, flag)
}

/// Directory-level token prefixes. The parsed rule database carries one
/// option text per job; lines matching these belong to the directory record,
/// the rest to the job.
const DIR_TOKENS: &[&str] = &[
    "delete unknown files",
    "delete queued files",
    "delete old locked files",
    "old file time",
    "end character",
    "ignore size",
    "ignore file time",
    "important dir",
    "keep connected",
    "do not get dir list",
    "do not remove",
    "store retrieve list",
    "force rereads",
    "max files",
    "max size",
    "wait for",
    "warn time",
    "accumulate",
    "dupcheck",
    "accept dot files",
    "inotify",
];

pub fn is_dir_option(line: &str) -> bool {
    let line = line.trim();
    DIR_TOKENS.iter().any(|t| line.starts_with(t))
}

/// Parse directory option lines. Token order does not matter; later lines
/// win on conflict. Unknown tokens warn and are skipped.
pub fn parse_dir_options(lines: &[String]) -> DirOptions {
    let mut o = DirOptions::default();
    for raw in lines {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = num_after(line, "delete unknown files") {
            o.delete_unknown_files = true;
            if !rest.is_empty() {
                o.unknown_file_time = rest.parse().unwrap_or(DEFAULT_OLD_FILE_TIME_HOURS);
            }
        } else if let Some(rest) = num_after(line, "delete queued files") {
            o.delete_queued_files = true;
            if !rest.is_empty() {
                o.queued_file_time = rest.parse().unwrap_or(DEFAULT_OLD_FILE_TIME_HOURS);
            }
        } else if let Some(rest) = num_after(line, "delete old locked files") {
            o.delete_old_locked_files = true;
            o.locked_file_time = rest.parse().unwrap_or(DEFAULT_OLD_FILE_TIME_HOURS);
        } else if let Some(rest) = num_after(line, "old file time") {
            let h: i32 = rest.parse().unwrap_or(DEFAULT_OLD_FILE_TIME_HOURS);
            o.unknown_file_time = h;
            o.queued_file_time = h;
            o.locked_file_time = h;
        } else if let Some(rest) = num_after(line, "end character") {
            o.end_character = rest.parse().unwrap_or(-1);
        } else if let Some(rest) = num_after(line, "ignore size") {
            let (sign, n) = parse_sign_and_num(rest);
            o.ignore_size_sign = sign;
            o.ignore_size = n;
        } else if let Some(rest) = num_after(line, "ignore file time") {
            let (sign, n) = parse_sign_and_num(rest);
            o.ignore_time_sign = sign;
            o.ignore_file_time = n;
        } else if line == "important dir" {
            o.important_dir = true;
        } else if let Some(rest) = num_after(line, "time") {
            o.time_spec = Some(rest.to_string());
        } else if let Some(rest) = num_after(line, "keep connected") {
            o.keep_connected = rest.parse().unwrap_or(0);
        } else if line == "do not get dir list" {
            o.do_not_get_dir_list = true;
        } else if line == "do not remove" {
            o.do_not_remove = true;
        } else if let Some(rest) = num_after(line, "store retrieve list") {
            o.store_retrieve_list = if rest == "once" { 2 } else { 1 };
        } else if let Some(rest) = num_after(line, "priority") {
            o.priority = rest.bytes().next().unwrap_or(b'9');
        } else if line == "force rereads" {
            o.force_reread = true;
        } else if let Some(rest) = num_after(line, "max process") {
            o.max_process = rest.parse().unwrap_or(0);
        } else if let Some(rest) = num_after(line, "max files") {
            o.max_files = rest.parse().unwrap_or(0);
        } else if let Some(rest) = num_after(line, "max size") {
            o.max_size = rest.parse().unwrap_or(0);
        } else if let Some(rest) = num_after(line, "wait for") {
            o.wait_for = Some(rest.to_string());
        } else if let Some(rest) = num_after(line, "warn time") {
            o.warn_time = rest.parse().unwrap_or(0);
        } else if let Some(rest) = num_after(line, "accumulate size") {
            o.accumulate_size = rest.parse().unwrap_or(0);
        } else if let Some(rest) = num_after(line, "accumulate") {
            o.accumulate = rest.parse().unwrap_or(0);
        } else if let Some(rest) = num_after(line, "dupcheck") {
            let (t, f) = parse_dupcheck(rest);
            o.dup_check_timeout = t;
            o.dup_check_flag = f;
        } else if line == "accept dot files" {
            o.accept_dot_files = true;
        } else if let Some(rest) = num_after(line, "inotify") {
            o.inotify_mask = rest.parse().unwrap_or(0);
        } else {
            tracing::warn!("[amg] 未知目录选项，忽略: '{}'", line);
        }
    }
    o
}

/// How a worker protects the file while it is being written remotely.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    Off,
    /// Upload under a leading-dot name, rename into place.
    Dot,
    /// Leading and trailing dot, both renamed away.
    DotVms,
    /// Write a sentinel file first, remove it last.
    LockFile(String),
}

/// Ingest-side per-job options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalOptions {
    /// Seconds a staged file may wait before it is discarded at send time.
    /// 0 never ages.
    pub age_limit: u64,
    /// Cron spec collecting files for a send window.
    pub time_spec: Option<String>,
    /// Files arriving outside the window are dropped instead of collected.
    pub no_collect: bool,
    pub rename_rule: Option<String>,
    pub exec_cmd: Option<String>,
    pub extract: Option<String>,
    pub delete_after: bool,
    pub parallel_hint: Option<u32>,
    pub priority: Option<u8>,
}

impl LocalOptions {
    /// Content transforms make hardlinking unsafe; the materialiser copies
    /// instead. A pure rename keeps the content and may still link.
    pub fn forces_copy(&self) -> bool {
        self.exec_cmd.is_some() || self.extract.is_some()
    }
}

pub fn parse_local_options(lines: &[String]) -> LocalOptions {
    let mut o = LocalOptions::default();
    for raw in lines {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = num_after(line, "age-limit") {
            o.age_limit = rest.parse().unwrap_or(0);
        } else if let Some(rest) = num_after(line, "time no collect") {
            o.time_spec = Some(rest.to_string());
            o.no_collect = true;
        } else if let Some(rest) = num_after(line, "time") {
            o.time_spec = Some(rest.to_string());
        } else if let Some(rest) = num_after(line, "rename") {
            o.rename_rule = Some(rest.to_string());
        } else if let Some(rest) = num_after(line, "exec") {
            o.exec_cmd = Some(rest.to_string());
        } else if let Some(rest) = num_after(line, "extract") {
            o.extract = Some(rest.to_string());
        } else if line == "delete" {
            o.delete_after = true;
        } else if let Some(rest) = num_after(line, "max process") {
            o.parallel_hint = rest.parse().ok();
        } else if let Some(rest) = num_after(line, "priority") {
            o.priority = rest.bytes().next();
        } else {
            tracing::warn!("[amg] 未知本地选项，忽略: '{}'", line);
        }
    }
    o
}

/// Send-side per-job options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendOptions {
    pub lock_mode: LockMode,
    /// Archive retention units; 0 deletes instead of archiving.
    pub archive_time: i32,
    pub chmod: Option<u32>,
    pub trans_rename: Option<String>,
    pub dup_check_timeout: i64,
    pub dup_check_flag: u32,
    pub age_limit: Option<u64>,
    pub sort_file_names: bool,
}

pub fn parse_send_options(lines: &[String]) -> SendOptions {
    let mut o = SendOptions::default();
    for raw in lines {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = num_after(line, "lock") {
            o.lock_mode = match rest {
                "DOT" => LockMode::Dot,
                "DOT_VMS" => LockMode::DotVms,
                "OFF" => LockMode::Off,
                other => {
                    if let Some(name) = other.strip_prefix("LOCKFILE") {
                        let name = name.trim();
                        LockMode::LockFile(if name.is_empty() {
                            ".lock".to_string()
                        } else {
                            name.to_string()
                        })
                    } else {
                        tracing::warn!("[fd] 未知 lock 模式，按 OFF 处理: '{}'", other);
                        LockMode::Off
                    }
                }
            };
        } else if let Some(rest) = num_after(line, "archive") {
            o.archive_time = rest.parse().unwrap_or(0);
        } else if let Some(rest) = num_after(line, "chmod") {
            o.chmod = u32::from_str_radix(rest, 8).ok();
        } else if let Some(rest) = num_after(line, "trans_rename") {
            o.trans_rename = Some(rest.to_string());
        } else if let Some(rest) = num_after(line, "dupcheck") {
            let (t, f) = parse_dupcheck(rest);
            o.dup_check_timeout = t;
            o.dup_check_flag = f;
        } else if let Some(rest) = num_after(line, "age-limit") {
            o.age_limit = rest.parse().ok();
        } else if line == "sort file names" {
            o.sort_file_names = true;
        } else {
            tracing::warn!("[fd] 未知标准选项，忽略: '{}'", line);
        }
    }
    o
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dir_options_full_vocabulary() {
        let o = parse_dir_options(&lines(&[
            "delete unknown files 48",
            "delete queued files",
            "ignore size >1024",
            "ignore file time <60",
            "important dir",
            "time * * * * *",
            "keep connected 30",
            "store retrieve list once",
            "priority 2",
            "force rereads",
            "max files 50",
            "max size 1048576",
            "wait for ready.*",
            "warn time 900",
            "accumulate 10",
            "accumulate size 4096",
            "dupcheck 120 content delete",
            "accept dot files",
            "inotify 3",
            "definitely not a token",
        ]));
        assert!(o.delete_unknown_files);
        assert_eq!(o.unknown_file_time, 48);
        assert!(o.delete_queued_files);
        assert_eq!(o.queued_file_time, DEFAULT_OLD_FILE_TIME_HOURS);
        assert_eq!((o.ignore_size_sign, o.ignore_size), (PRED_GT, 1024));
        assert_eq!((o.ignore_time_sign, o.ignore_file_time), (PRED_LT, 60));
        assert!(o.important_dir);
        assert_eq!(o.time_spec.as_deref(), Some("* * * * *"));
        assert_eq!(o.keep_connected, 30);
        assert_eq!(o.store_retrieve_list, 2);
        assert_eq!(o.priority, b'2');
        assert!(o.force_reread);
        assert_eq!(o.max_files, 50);
        assert_eq!(o.max_size, 1_048_576);
        assert_eq!(o.wait_for.as_deref(), Some("ready.*"));
        assert_eq!(o.warn_time, 900);
        assert_eq!(o.accumulate, 10);
        assert_eq!(o.accumulate_size, 4096);
        assert_eq!(o.dup_check_timeout, 120);
        assert_eq!(o.dup_check_flag, DC_CONTENT | DC_ACTION_DELETE);
        assert!(o.accept_dot_files);
        assert_eq!(o.inotify_mask, 3);
    }

    #[test]
    fn ignore_size_zero_is_no_predicate() {
        let o = parse_dir_options(&lines(&["ignore size 0"]));
        assert_eq!(o.ignore_size_sign, PRED_NONE);
    }

    #[test]
    fn local_options_parse() {
        let o = parse_local_options(&lines(&[
            "age-limit 3600",
            "time no collect 0 12 * * 1-5",
            "rename lower",
            "max process 4",
        ]));
        assert_eq!(o.age_limit, 3600);
        assert!(o.no_collect);
        assert_eq!(o.time_spec.as_deref(), Some("0 12 * * 1-5"));
        // a pure rename keeps the content, so hardlinking stays allowed
        assert!(!o.forces_copy());
        assert_eq!(o.parallel_hint, Some(4));
    }

    #[test]
    fn content_transforms_force_copies() {
        let o = parse_local_options(&lines(&["exec gzip"]));
        assert!(o.forces_copy());
        let o = parse_local_options(&lines(&["extract bulletin"]));
        assert!(o.forces_copy());
    }

    #[test]
    fn send_options_parse() {
        let o = parse_send_options(&lines(&[
            "lock DOT_VMS",
            "archive 3",
            "chmod 644",
            "dupcheck 60 name warn",
            "sort file names",
        ]));
        assert_eq!(o.lock_mode, LockMode::DotVms);
        assert_eq!(o.archive_time, 3);
        assert_eq!(o.chmod, Some(0o644));
        assert_eq!(o.dup_check_flag, DC_FILENAME | DC_ACTION_WARN);
        assert!(o.sort_file_names);
    }

    #[test]
    fn lockfile_default_name() {
        let o = parse_send_options(&lines(&["lock LOCKFILE"]));
        assert_eq!(o.lock_mode, LockMode::LockFile(".lock".to_string()));
        let o = parse_send_options(&lines(&["lock LOCKFILE busy.lck"]));
        assert_eq!(o.lock_mode, LockMode::LockFile("busy.lck".to_string()));
    }
}

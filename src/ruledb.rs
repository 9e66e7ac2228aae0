//! Rule database: parsed jobs handed over by the external DIR_CONFIG parser
//! through the `amg_data` buffer, plus recipient URL decomposition and the
//! canonical job hash.
//!
//! `amg_data` 是指针化的二进制布局：偏移量而不是指针 — the on-disk buffer uses
//! explicit offsets from the end of the entry table into a NUL-separated
//! string area; nothing in it is a native pointer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// URL schemes a recipient may use. Only `Local`, `Sftp` and `Scp` have
/// built-in clients; the rest parse and dispatch but are refused at session
/// setup with `UnsupportedScheme`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Local,
    Ftp,
    Sftp,
    Scp,
    Http,
    Smtp,
    Wmo,
}

impl Scheme {
    pub fn parse(s: &str) -> Option<Scheme> {
        let v = match s {
            "file" | "loc" | "local" => Scheme::Local,
            "ftp" | "ftps" => Scheme::Ftp,
            "sftp" => Scheme::Sftp,
            "scp" => Scheme::Scp,
            "http" | "https" => Scheme::Http,
            "mailto" | "smtp" | "smtps" => Scheme::Smtp,
            "wmo" => Scheme::Wmo,
            _ => return None,
        };
        Some(v)
    }

    pub fn tag(self) -> u8 {
        match self {
            Scheme::Local => 0,
            Scheme::Ftp => 1,
            Scheme::Sftp => 2,
            Scheme::Scp => 3,
            Scheme::Http => 4,
            Scheme::Smtp => 5,
            Scheme::Wmo => 6,
        }
    }

    pub fn from_tag(v: u8) -> Scheme {
        match v {
            1 => Scheme::Ftp,
            2 => Scheme::Sftp,
            3 => Scheme::Scp,
            4 => Scheme::Http,
            5 => Scheme::Smtp,
            6 => Scheme::Wmo,
            _ => Scheme::Local,
        }
    }

    pub fn bit(self) -> u32 {
        1u32 << self.tag()
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Local => 0,
            Scheme::Ftp => 21,
            Scheme::Sftp | Scheme::Scp => 22,
            Scheme::Http => 80,
            Scheme::Smtp => 25,
            Scheme::Wmo => 0,
        }
    }
}

/// Decomposed destination URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub scheme: Scheme,
    pub user: String,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Recipient {
    /// Parse `scheme://[user[:pass]@]host[:port][/path]`. The local scheme
    /// takes a bare path after the authority-less form `file:///path`.
    pub fn parse(url: &str) -> Result<Recipient> {
        let (scheme_str, rest) = url
            .split_once("://")
            .ok_or_else(|| anyhow::anyhow!("recipient 缺少 scheme: {}", url))?;
        let scheme = Scheme::parse(scheme_str)
            .ok_or_else(|| anyhow::anyhow!("未知 scheme '{}': {}", scheme_str, url))?;
        if scheme == Scheme::Local {
            // file:///abs/path — 没有 authority，全部是路径
            let path = rest.trim_start_matches('/');
            return Ok(Recipient {
                scheme,
                user: String::new(),
                password: None,
                host: String::new(),
                port: 0,
                path: format!("/{}", path),
            });
        }
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], rest[i + 1..].to_string()),
            None => (rest, String::new()),
        };
        let (userinfo, hostport) = match authority.rfind('@') {
            Some(i) => (&authority[..i], &authority[i + 1..]),
            None => ("", authority),
        };
        let (user, password) = match userinfo.split_once(':') {
            Some((u, p)) => (u.to_string(), Some(p.to_string())),
            None => (userinfo.to_string(), None),
        };
        let (host, port) = match hostport.rsplit_once(':') {
            Some((h, p)) => {
                let port: u16 =
                    p.parse().with_context(|| format!("端口无效 '{}': {}", p, url))?;
                (h.to_string(), port)
            }
            None => (hostport.to_string(), scheme.default_port()),
        };
        if host.is_empty() {
            return Err(anyhow::anyhow!("recipient 缺少主机: {}", url));
        }
        Ok(Recipient { scheme, user, password, host, port, path })
    }

    /// Alias the destination is accounted under: the host name unless the
    /// rule named an explicit alias.
    pub fn default_alias(&self) -> String {
        if self.scheme == Scheme::Local {
            "local".to_string()
        } else {
            self.host.clone()
        }
    }
}

/// One parsed rule: everything the pipeline needs to stage and send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRule {
    pub dir: PathBuf,
    pub dir_alias: String,
    /// `'0'`..`'9'`; lower is more urgent.
    pub priority: u8,
    /// File masks in match order; `!` prefix negates.
    pub file_masks: Vec<String>,
    /// Ingest-side option lines (age-limit, time, rename, exec, ...).
    pub local_options: Vec<String>,
    /// Send-side option lines (lock, archive, chmod, dupcheck, ...).
    pub std_options: Vec<String>,
    pub recipient: String,
}

impl JobRule {
    /// Canonical text form the job id is computed from. Deep-equal rules map
    /// to the same id; any semantic change reshapes it.
    pub fn canonical_form(&self) -> String {
        let mut s = String::new();
        s.push_str(&self.dir.to_string_lossy());
        s.push('\x1f');
        s.push_str(&self.dir_alias);
        s.push('\x1f');
        s.push(self.priority as char);
        s.push('\x1f');
        s.push_str(&self.file_masks.join("\x1e"));
        s.push('\x1f');
        s.push_str(&self.local_options.join("\x1e"));
        s.push('\x1f');
        s.push_str(&self.std_options.join("\x1e"));
        s.push('\x1f');
        s.push_str(&self.recipient);
        s
    }

    pub fn job_id(&self) -> u32 {
        crc32fast::hash(self.canonical_form().as_bytes())
    }

    pub fn dir_id(&self) -> u32 {
        crc32fast::hash(self.dir_alias.as_bytes())
    }

    pub fn recipient_parsed(&self) -> Result<Recipient> {
        Recipient::parse(&self.recipient)
    }
}

// -- amg_data binary layout -----------------------------------------------
//
//   i32 no_of_jobs
//   [ [i32; 10] ; no_of_jobs ]   offsets from END of this table
//   string area
//
// Field order: 0=priority 1=dir 2=alias 3=file-count 4=file-mask-list
// 5=local-options-count 6=local-options-text 7=std-options-count
// 8=std-options-text 9=recipient. Counts are ASCII decimal; the mask list is
// `count` NUL-terminated patterns back to back; options text is one
// NUL-terminated string with newline-separated lines.

const FIELDS: usize = 10;

fn push_str(area: &mut Vec<u8>, s: &str) -> i32 {
    let off = area.len() as i32;
    area.extend_from_slice(s.as_bytes());
    area.push(0);
    off
}

/// Serialise the rule set into the `amg_data` buffer layout.
pub fn encode_amg_data(jobs: &[JobRule]) -> Vec<u8> {
    let mut area: Vec<u8> = Vec::new();
    let mut table: Vec<i32> = Vec::with_capacity(jobs.len() * FIELDS);
    for job in jobs {
        let prio = (job.priority as char).to_string();
        table.push(push_str(&mut area, &prio));
        table.push(push_str(&mut area, &job.dir.to_string_lossy()));
        table.push(push_str(&mut area, &job.dir_alias));
        table.push(push_str(&mut area, &job.file_masks.len().to_string()));
        // mask list: offset of the first pattern; the rest follow NUL by NUL
        let mask_off = area.len() as i32;
        if job.file_masks.is_empty() {
            area.push(0);
        } else {
            for m in &job.file_masks {
                area.extend_from_slice(m.as_bytes());
                area.push(0);
            }
        }
        table.push(mask_off);
        table.push(push_str(&mut area, &job.local_options.len().to_string()));
        table.push(push_str(&mut area, &job.local_options.join("\n")));
        table.push(push_str(&mut area, &job.std_options.len().to_string()));
        table.push(push_str(&mut area, &job.std_options.join("\n")));
        table.push(push_str(&mut area, &job.recipient));
    }
    let mut out = Vec::with_capacity(4 + table.len() * 4 + area.len());
    out.extend_from_slice(&(jobs.len() as i32).to_ne_bytes());
    for v in table {
        out.extend_from_slice(&v.to_ne_bytes());
    }
    out.extend_from_slice(&area);
    out
}

fn read_cstr(area: &[u8], off: i32) -> Result<&str> {
    let off = usize::try_from(off).map_err(|_| anyhow::anyhow!("amg_data 偏移为负"))?;
    let tail = area.get(off..).ok_or_else(|| anyhow::anyhow!("amg_data 偏移越界: {}", off))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| anyhow::anyhow!("amg_data 字符串未以 NUL 结束"))?;
    std::str::from_utf8(&tail[..end]).context("amg_data 字符串不是 UTF-8")
}

/// Walk `count` NUL-terminated strings starting at `off` (the `NEXT` walk).
fn read_cstr_list(area: &[u8], off: i32, count: usize) -> Result<Vec<String>> {
    let mut out = Vec::with_capacity(count);
    let mut pos = off;
    for _ in 0..count {
        let s = read_cstr(area, pos)?;
        pos += s.len() as i32 + 1;
        out.push(s.to_string());
    }
    Ok(out)
}

/// Parse an `amg_data` buffer back into rules.
pub fn decode_amg_data(buf: &[u8]) -> Result<Vec<JobRule>> {
    if buf.len() < 4 {
        return Err(anyhow::anyhow!("amg_data 过小: {} 字节", buf.len()));
    }
    let no_of_jobs = i32::from_ne_bytes(buf[0..4].try_into().unwrap());
    let n = usize::try_from(no_of_jobs).context("amg_data 任务数为负")?;
    let table_len = n * FIELDS * 4;
    let area_start = 4 + table_len;
    if buf.len() < area_start {
        return Err(anyhow::anyhow!("amg_data 表区截断"));
    }
    let area = &buf[area_start..];
    let mut jobs = Vec::with_capacity(n);
    for j in 0..n {
        let mut ptr = [0i32; FIELDS];
        for (i, p) in ptr.iter_mut().enumerate() {
            let at = 4 + (j * FIELDS + i) * 4;
            *p = i32::from_ne_bytes(buf[at..at + 4].try_into().unwrap());
        }
        let priority_str = read_cstr(area, ptr[0])?;
        let priority = priority_str.bytes().next().unwrap_or(b'9');
        let dir = PathBuf::from(read_cstr(area, ptr[1])?);
        let dir_alias = read_cstr(area, ptr[2])?.to_string();
        let mask_count: usize =
            read_cstr(area, ptr[3])?.parse().context("amg_data 掩码计数不合法")?;
        let file_masks = read_cstr_list(area, ptr[4], mask_count)?;
        let lopt_count: usize =
            read_cstr(area, ptr[5])?.parse().context("amg_data 本地选项计数不合法")?;
        let lopt_text = read_cstr(area, ptr[6])?;
        let local_options = split_option_lines(lopt_text, lopt_count);
        let sopt_count: usize =
            read_cstr(area, ptr[7])?.parse().context("amg_data 标准选项计数不合法")?;
        let sopt_text = read_cstr(area, ptr[8])?;
        let std_options = split_option_lines(sopt_text, sopt_count);
        let recipient = read_cstr(area, ptr[9])?.to_string();
        jobs.push(JobRule {
            dir,
            dir_alias,
            priority,
            file_masks,
            local_options,
            std_options,
            recipient,
        });
    }
    Ok(jobs)
}

fn split_option_lines(text: &str, count: usize) -> Vec<String> {
    if count == 0 || text.is_empty() {
        return Vec::new();
    }
    text.lines().take(count).map(|l| l.to_string()).collect()
}

/// Load the rule database from the work dir.
pub fn load_amg_data(path: &Path) -> Result<Vec<JobRule>> {
    let buf =
        std::fs::read(path).with_context(|| format!("读取 amg_data 失败: {}", path.display()))?;
    decode_amg_data(&buf)
}

/// Atomically publish a rule database (temp file + rename).
pub fn store_amg_data(path: &Path, jobs: &[JobRule]) -> Result<()> {
    let buf = encode_amg_data(jobs);
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &buf)
        .with_context(|| format!("写入 amg_data 失败: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("发布 amg_data 失败: {}", path.display()))?;
    Ok(())
}

/// Per-host overrides read from `etc/HOST_CONFIG` (JSON list).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostOverride {
    pub alias: String,
    #[serde(default)]
    pub second_hostname: Option<String>,
    #[serde(default)]
    pub auto_toggle: Option<bool>,
    #[serde(default)]
    pub allowed_transfers: Option<i32>,
    #[serde(default)]
    pub max_errors: Option<i32>,
    #[serde(default)]
    pub retry_interval: Option<i32>,
    #[serde(default)]
    pub transfer_timeout: Option<i64>,
    #[serde(default)]
    pub block_size: Option<i32>,
    #[serde(default)]
    pub transfer_rate_limit: Option<i64>,
}

pub fn load_host_config(path: &Path) -> Result<Vec<HostOverride>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("读取 HOST_CONFIG 失败: {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("HOST_CONFIG 不是合法 JSON: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rule() -> JobRule {
        JobRule {
            dir: PathBuf::from("/data/in"),
            dir_alias: "inbound".to_string(),
            priority: b'3',
            file_masks: vec!["*.bin".to_string(), "!*.tmp".to_string()],
            local_options: vec!["age-limit 3600".to_string()],
            std_options: vec!["lock DOT".to_string(), "archive 2".to_string()],
            recipient: "sftp://feed:pw@edge.example:2222/incoming".to_string(),
        }
    }

    #[test]
    fn amg_data_round_trip() {
        let jobs = vec![
            sample_rule(),
            JobRule {
                dir: PathBuf::from("/data/other"),
                dir_alias: "other".to_string(),
                priority: b'9',
                file_masks: vec!["*".to_string()],
                local_options: Vec::new(),
                std_options: Vec::new(),
                recipient: "file:///var/spool/out".to_string(),
            },
        ];
        let buf = encode_amg_data(&jobs);
        let back = decode_amg_data(&buf).expect("decode");
        assert_eq!(back, jobs);
    }

    #[test]
    fn job_id_is_stable_for_clones() {
        let a = sample_rule();
        let b = a.clone();
        assert_eq!(a.job_id(), b.job_id());
        let mut c = a.clone();
        c.priority = b'4';
        assert_ne!(a.job_id(), c.job_id());
    }

    #[test]
    fn recipient_parse_full_form() {
        let r = Recipient::parse("sftp://feed:pw@edge.example:2222/incoming/data").expect("parse");
        assert_eq!(r.scheme, Scheme::Sftp);
        assert_eq!(r.user, "feed");
        assert_eq!(r.password.as_deref(), Some("pw"));
        assert_eq!(r.host, "edge.example");
        assert_eq!(r.port, 2222);
        assert_eq!(r.path, "incoming/data");
    }

    #[test]
    fn recipient_parse_defaults() {
        let r = Recipient::parse("ftp://anonymous@mirror.example").expect("parse");
        assert_eq!(r.port, 21);
        assert_eq!(r.path, "");
        let l = Recipient::parse("file:///var/spool/out").expect("parse");
        assert_eq!(l.scheme, Scheme::Local);
        assert_eq!(l.path, "/var/spool/out");
        assert!(Recipient::parse("nfs://x/y").is_err());
        assert!(Recipient::parse("plainpath").is_err());
    }
}
